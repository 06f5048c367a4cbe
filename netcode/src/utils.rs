#[cfg(all(feature = "std", target_arch = "wasm32"))]
use web_time::SystemTime;

#[cfg(all(feature = "std", not(target_arch = "wasm32")))]
use std::time::SystemTime;

/// Seconds since the Unix epoch, truncated to an integer.
///
/// Without the `std` feature there's no portable wall clock available, so
/// this returns 0; token expiry and replay timestamps become meaningless in
/// that configuration, which is expected of a true no_std build.
#[cfg(feature = "std")]
pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs_f64() as u64
}

#[cfg(not(feature = "std"))]
pub(crate) fn now() -> u64 {
    0
}
