use std::time::Duration;

/// Delay before a retired entity may be collected.
///
/// Long enough for a client reading at `min_rate_kbps` kilobits per second to finish a body
/// of `entity_size` bytes, and never shorter than one second.
pub fn gc_wait(entity_size: u64, min_rate_kbps: u64) -> Duration {
    let bytes_per_second = min_rate_kbps.max(1).saturating_mul(128);
    Duration::from_secs(entity_size.div_ceil(bytes_per_second).max(1))
}
