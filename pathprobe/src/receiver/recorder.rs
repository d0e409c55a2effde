//! Per-packet session artifact. One CSV file per session, written sequentially in arrival order:
//!
//! ```ascii
//! packet_number,arrival_time,delta_us,estimated_bw_mbps
//! 1,14:03:07.123456,,
//! 2,14:03:07.124461,1005,11.14
//! ```
//!
//! The first row has no delta and no bandwidth. The artifact is consumed by offline analysis,
//!  which is not part of this crate - [`read_artifact`] is the contract it can rely on.

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Local};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};
use transport::safe_converter::PrecheckedCast;

pub const CSV_HEADER: &str = "packet_number,arrival_time,delta_us,estimated_bw_mbps";

#[derive(Debug, Clone, Copy)]
pub struct PacketArrival {
    pub received_at: Instant,
    pub wall_clock: DateTime<Local>,
    pub len: usize,
}

impl PacketArrival {
    pub fn now(len: usize) -> PacketArrival {
        PacketArrival {
            received_at: Instant::now(),
            wall_clock: Local::now(),
            len,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PacketRecord {
    /// 1-based, session-local
    pub packet_number: u64,
    pub arrival_time: String,
    pub delta_us: Option<u64>,
    pub estimated_bw_mbps: Option<f64>,
}

impl PacketRecord {
    fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        write!(w, "{},{},", self.packet_number, self.arrival_time)?;
        if let Some(delta) = self.delta_us {
            write!(w, "{}", delta)?;
        }
        write!(w, ",")?;
        if let Some(bw) = self.estimated_bw_mbps {
            write!(w, "{:.2}", bw)?;
        }
        writeln!(w)
    }

    fn parse(line: &str) -> anyhow::Result<PacketRecord> {
        let fields = line.split(',').collect::<Vec<_>>();
        if fields.len() != 4 {
            bail!("expected 4 fields, found {}", fields.len());
        }

        Ok(PacketRecord {
            packet_number: fields[0].parse()?,
            arrival_time: fields[1].to_string(),
            delta_us: non_empty(fields[2]).map(|s| s.parse::<u64>()).transpose()?,
            estimated_bw_mbps: non_empty(fields[3]).map(|s| s.parse::<f64>()).transpose()?,
        })
    }
}

fn non_empty(field: &str) -> Option<&str> {
    if field.is_empty() {
        None
    }
    else {
        Some(field)
    }
}

pub struct RecordingSummary {
    pub path: PathBuf,
    pub rows: u64,
}

/// Lifecycle: [`SessionRecorder::create`] when a session starts, [`SessionRecorder::append`] per
///  received datagram, [`SessionRecorder::finalize`] when the session ends. The results
///  directory is expected to exist.
pub struct SessionRecorder {
    path: PathBuf,
    writer: BufWriter<File>,
    rows: u64,
    prev_arrival: Option<Instant>,
}

impl SessionRecorder {
    pub fn artifact_path(results_dir: &Path, prefix: &str, label: &str, created_at: DateTime<Local>) -> PathBuf {
        results_dir.join(format!("{}-{}-{}.csv", prefix, label, created_at.format("%Y%m%d_%H%M%S")))
    }

    pub fn create(results_dir: &Path, prefix: &str, label: &str, created_at: DateTime<Local>) -> anyhow::Result<SessionRecorder> {
        if !results_dir.is_dir() {
            bail!("results directory {:?} does not exist", results_dir);
        }

        let path = Self::artifact_path(results_dir, prefix, label, created_at);
        let file = File::create(&path)
            .with_context(|| format!("creating session artifact {:?}", path))?;

        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", CSV_HEADER)?;
        debug!("recording session to {:?}", path);

        Ok(SessionRecorder {
            path,
            writer,
            rows: 0,
            prev_arrival: None,
        })
    }

    pub fn append(&mut self, arrival: &PacketArrival) -> anyhow::Result<PacketRecord> {
        let (delta_us, estimated_bw_mbps) = match self.prev_arrival {
            None => (None, None),
            Some(prev) => {
                let dt = arrival.received_at.saturating_duration_since(prev);
                let delta_us: u64 = dt.as_micros().prechecked_cast();
                let bw = if dt.is_zero() {
                    None
                }
                else {
                    Some(arrival.len as f64 * 8.0 / dt.as_secs_f64() / 1e6)
                };
                (Some(delta_us), bw)
            }
        };

        self.rows += 1;
        self.prev_arrival = Some(arrival.received_at);

        let record = PacketRecord {
            packet_number: self.rows,
            arrival_time: arrival.wall_clock.format("%H:%M:%S%.6f").to_string(),
            delta_us,
            estimated_bw_mbps,
        };
        record.write_to(&mut self.writer)?;
        Ok(record)
    }

    /// Removes the artifact of a session that never started
    pub fn discard(self) -> anyhow::Result<()> {
        let SessionRecorder { path, writer, .. } = self;
        drop(writer);
        std::fs::remove_file(&path)?;
        debug!("discarded {:?}", path);
        Ok(())
    }

    /// Flushes and closes the artifact - nothing can be appended afterwards
    pub fn finalize(mut self) -> anyhow::Result<RecordingSummary> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        info!("saved {:?} ({} packets)", self.path, self.rows);

        Ok(RecordingSummary {
            path: self.path,
            rows: self.rows,
        })
    }
}

/// Reads an artifact back. An artifact without any valid data row is an error of its own, so
///  that "nothing was received" can be told apart from a damaged file.
pub fn read_artifact(path: &Path) -> anyhow::Result<Vec<PacketRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines();

    let header = lines.next()
        .transpose()?
        .unwrap_or_default();
    if header.trim_end() != CSV_HEADER {
        bail!("{:?} is not a session artifact: missing header", path);
    }

    let mut records = Vec::new();
    for (idx, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = PacketRecord::parse(line.trim_end())
            .map_err(|e| anyhow!("{:?} line {}: {}", path, idx + 2, e))?;
        records.push(record);
    }

    if records.is_empty() {
        bail!("{:?} contains no data rows", path);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn created_at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 17, 14, 3, 7).unwrap()
    }

    #[test]
    fn test_artifact_path() {
        let path = SessionRecorder::artifact_path(Path::new("results"), "session", "test", created_at());
        assert_eq!(path, PathBuf::from("results/session-test-20240517_140307.csv"));
    }

    #[test]
    fn test_fixed_spacing_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::create(dir.path(), "session", "test", created_at()).unwrap();

        let start = Instant::now();
        let wall_start = created_at();
        for i in 0..5u32 {
            recorder.append(&PacketArrival {
                received_at: start + Duration::from_millis(1) * i,
                wall_clock: wall_start + chrono::Duration::milliseconds(i as i64),
                len: 1400,
            }).unwrap();
        }
        let summary = recorder.finalize().unwrap();
        assert_eq!(summary.rows, 5);

        let records = read_artifact(&summary.path).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].packet_number, 1);
        assert_eq!(records[0].arrival_time, "14:03:07.000000");
        assert_eq!(records[0].delta_us, None);
        assert_eq!(records[0].estimated_bw_mbps, None);

        for (i, record) in records.iter().enumerate().skip(1) {
            assert_eq!(record.packet_number, i as u64 + 1);
            assert_eq!(record.delta_us, Some(1000));
            let expected_bw = 1400.0 * 8.0 / 1000.0;
            assert!((record.estimated_bw_mbps.unwrap() - expected_bw).abs() < 0.01);
        }
        assert_eq!(records[4].arrival_time, "14:03:07.004000");
    }

    #[test]
    fn test_raw_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::create(dir.path(), "p", "l", created_at()).unwrap();
        let start = Instant::now();
        recorder.append(&PacketArrival { received_at: start, wall_clock: created_at(), len: 1250 }).unwrap();
        recorder.append(&PacketArrival { received_at: start + Duration::from_micros(100), wall_clock: created_at(), len: 1250 }).unwrap();
        let summary = recorder.finalize().unwrap();

        let content = std::fs::read_to_string(summary.path).unwrap();
        assert_eq!(content, "packet_number,arrival_time,delta_us,estimated_bw_mbps\n\
            1,14:03:07.000000,,\n\
            2,14:03:07.000000,100,100.00\n");
    }

    #[test]
    fn test_missing_results_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SessionRecorder::create(&dir.path().join("missing"), "session", "test", created_at()).is_err());
    }

    #[test]
    fn test_empty_artifact_is_distinguishable() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::create(dir.path(), "session", "empty", created_at()).unwrap();
        let summary = recorder.finalize().unwrap();
        assert_eq!(summary.rows, 0);

        let err = read_artifact(&summary.path).unwrap_err();
        assert!(err.to_string().contains("no data rows"), "{}", err);
    }

    #[test]
    fn test_discard_removes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::create(dir.path(), "session", "gone", created_at()).unwrap();
        recorder.discard().unwrap();
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_unparsable_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.csv");
        std::fs::write(&path, format!("{}\n1,14:03:07.000000,,\n2,x,abc,\n", CSV_HEADER)).unwrap();
        assert!(read_artifact(&path).is_err());

        std::fs::write(&path, "something else\n").unwrap();
        assert!(read_artifact(&path).is_err());
    }
}
