use anyhow::anyhow;
use clap::Parser;
use clap_derive::{Parser, Subcommand};
use pathprobe::config::{ReceiverConfig, SenderConfig, StretchScope, DEFAULT_DATA_PORT, DEFAULT_FEEDBACK_PORT};
use pathprobe::receiver::Receiver;
use pathprobe::sender::Sender;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tokio::net::lookup_host;
use tracing::{error, info, Level};

#[derive(Parser)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, default_value_t = false, global = true)]
    verbose: bool,

    #[clap(long, default_value_t = false, global = true)]
    very_verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Probe the path to a receiver and print the estimated available bandwidth
    Send {
        /// Receiver host name or IP address
        #[clap(long, default_value = "127.0.0.1")]
        target: String,
        #[clap(long, default_value_t = DEFAULT_DATA_PORT)]
        port: u16,
        /// Local port the receiver's feedback connects to
        #[clap(long, default_value_t = DEFAULT_FEEDBACK_PORT)]
        feedback_port: u16,
        /// Probe datagram size in bytes
        #[clap(long, default_value_t = 1400)]
        size: usize,
        /// Packets per train
        #[clap(long, default_value_t = 100)]
        packets: u32,
        #[clap(long, default_value_t = 1.0)]
        min_rate: f64,
        #[clap(long, default_value_t = 1000.0)]
        max_rate: f64,
        /// Search resolution in Mbps
        #[clap(long, default_value_t = 1.0)]
        tolerance: f64,
        #[clap(long, default_value = "test")]
        label: String,
    },
    /// Wait for sessions, record packet arrivals and answer each train with a verdict
    Recv {
        #[clap(long, default_value = "0.0.0.0")]
        bind: IpAddr,
        #[clap(long, default_value_t = DEFAULT_DATA_PORT)]
        port: u16,
        /// Port on the sender's host that feedback goes to
        #[clap(long, default_value_t = DEFAULT_FEEDBACK_PORT)]
        feedback_port: u16,
        /// Fixed feedback address, overriding the sender's host
        #[clap(long)]
        feedback: Option<SocketAddr>,
        /// Maximum difference between adjacent inter-arrival times in µs
        #[clap(long, default_value_t = 200)]
        stretch_threshold: u64,
        /// Judge each train on its own deltas instead of the whole session's
        #[clap(long, default_value_t = false)]
        per_train_stretch: bool,
        #[clap(long, default_value = "session")]
        csv_prefix: String,
        #[clap(long, default_value = "results")]
        results_dir: PathBuf,
        /// SO_RCVBUF for the probe socket in bytes
        #[clap(long)]
        recv_buffer: Option<usize>,
        /// Keep serving sessions until interrupted
        #[clap(long = "loop", default_value_t = false)]
        loop_forever: bool,
    },
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    match args.command {
        Command::Send { target, port, feedback_port, size, packets, min_rate, max_rate, tolerance, label } => {
            let target_addr = lookup_host((target.as_str(), port)).await?
                .next()
                .ok_or_else(|| anyhow!("could not resolve {}", target))?;

            let mut config = SenderConfig::new(target_addr);
            config.feedback_addr = SocketAddr::new(config.feedback_addr.ip(), feedback_port);
            config.packet_size = size;
            config.packets_per_train = packets;
            config.min_rate_mbps = min_rate;
            config.max_rate_mbps = max_rate;
            config.tolerance_mbps = tolerance;
            config.label = label;

            let mut sender = Sender::new(config).await?;
            match sender.run().await {
                Ok(report) => {
                    println!("estimated available bandwidth: {:.2} Mbps", report.estimate_mbps);
                    Ok(())
                }
                Err(e) => {
                    error!("probing aborted: {}", e);
                    Err(e)
                }
            }
        }
        Command::Recv { bind, port, feedback_port, feedback, stretch_threshold, per_train_stretch, csv_prefix, results_dir, recv_buffer, loop_forever } => {
            std::fs::create_dir_all(&results_dir)?;

            let mut config = ReceiverConfig::new(SocketAddr::new(bind, port));
            config.feedback_port = feedback_port;
            config.feedback_addr = feedback;
            config.stretch_threshold_us = stretch_threshold;
            if per_train_stretch {
                config.stretch_scope = StretchScope::Train;
            }
            config.csv_prefix = csv_prefix;
            config.results_dir = results_dir;
            config.transport.recv_buffer_size = recv_buffer;
            config.loop_forever = loop_forever;

            let mut receiver = Receiver::new(config).await?;

            let stop = receiver.stop_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupted - stopping after the current session");
                    stop.store(true, Ordering::Release);
                }
            });

            for summary in receiver.run().await? {
                println!("{}: {}/{} packets, {} trains -> {:?}", summary.label, summary.received_packets, summary.expected_packets, summary.train_verdicts.len(), summary.artifact);
                if summary.is_short() {
                    println!("  incomplete session: {} packets missing", summary.expected_packets - summary.received_packets);
                }
            }
            Ok(())
        }
    }
}
