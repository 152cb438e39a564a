use std::time::{SystemTime, UNIX_EPOCH};

#[inline]
pub(crate) fn unix_secs_u32() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as u32
}

#[inline]
pub(crate) fn unix_nanos_u64() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64
}
