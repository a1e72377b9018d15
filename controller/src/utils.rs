use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Current wall-clock time in whole seconds
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

// Race time in milliseconds as m:ss.hh
pub fn format_time(ms: i64) -> String {
    if ms <= 0 {
        return "-:--.--".to_string();
    }
    let hundredths = (ms / 10) % 100;
    let seconds = (ms / 1000) % 60;
    let minutes = ms / 60_000;
    format!("{}:{:02}.{:02}", minutes, seconds, hundredths)
}

// Session length as h:mm:ss
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}
