use chrono::DateTime;
use chrono::Utc;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use uuid::Uuid;

pub(super) fn unique_temp_dir() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    std::env::temp_dir().join(format!(
        "maple-state-runtime-test-{nanos}-{}",
        Uuid::new_v4()
    ))
}

/// Fixed base instant plus `secs`, so tests can order observations.
pub(super) fn at(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).expect("timestamp")
}
