//! Unix-epoch time helpers.

use std::time::SystemTime;

/// Seconds since the Unix epoch.
pub fn unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_monotone_enough() {
        let s = unix_secs();
        let ms = unix_millis();
        assert!(s > 1_600_000_000);
        assert!(ms / 1000 >= s - 1);
    }
}
