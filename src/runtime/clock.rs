//! Wall-clock helpers for summaries.

use std::time::{Duration, Instant, SystemTime};

/// RFC 3339 UTC timestamp, for `startedAt`/`finishedAt` metadata only.
pub fn wall_time_iso_utc() -> String {
    let dt: time::OffsetDateTime = SystemTime::now().into();
    dt.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Optional overall time limit of a session.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub fn new(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn expired(&self) -> bool {
        self.limit.is_some_and(|l| self.started.elapsed() >= l)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_utc() {
        assert!(wall_time_iso_utc().ends_with('Z'));
    }

    #[test]
    fn unlimited_deadline_never_expires() {
        assert!(!Deadline::new(None).expired());
        assert!(Deadline::new(Some(Duration::ZERO)).expired());
    }
}
