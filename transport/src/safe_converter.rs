/// Widening casts that cannot lose information on any supported platform
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(any(target_pointer_width = "32", target_pointer_width = "64"))]
impl SafeCast<u64> for usize {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
/// inter-arrival times in microseconds - u64 covers half a million years
impl PrecheckedCast<u64> for u128 {
    fn prechecked_cast(self) -> u64 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
