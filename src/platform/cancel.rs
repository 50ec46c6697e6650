//! Process-wide cancellation flag checked between trace elements.

use serde::{Deserialize, Serialize};

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Ram,
    Panic,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ram => f.write_str("ram"),
            Self::Panic => f.write_str("panic"),
        }
    }
}

const NOT_CANCELLED: u8 = 0;
const CANCELLED_RAM: u8 = 1;
const CANCELLED_PANIC: u8 = 2;

/// Shared between the analyzer and an external watchdog. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<AtomicU8>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: CancelReason) {
        let value = match reason {
            CancelReason::Ram => CANCELLED_RAM,
            CancelReason::Panic => CANCELLED_PANIC,
        };
        // First reason wins.
        let _ = self
            .state
            .compare_exchange(NOT_CANCELLED, value, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) != NOT_CANCELLED
    }

    pub fn reason(&self) -> Option<CancelReason> {
        match self.state.load(Ordering::SeqCst) {
            CANCELLED_RAM => Some(CancelReason::Ram),
            CANCELLED_PANIC => Some(CancelReason::Panic),
            _ => None,
        }
    }

    pub fn reset(&self) {
        self.state.store(NOT_CANCELLED, Ordering::SeqCst);
    }

    pub fn check(&self) -> crate::HbResult<()> {
        match self.reason() {
            Some(reason) => Err(crate::HbError::Cancelled(reason)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reason_is_kept_and_reset_clears() {
        let token = CancelToken::new();
        let shared = token.clone();
        assert!(!token.is_cancelled());
        shared.cancel(CancelReason::Ram);
        shared.cancel(CancelReason::Panic);
        assert_eq!(token.reason(), Some(CancelReason::Ram));
        assert!(token.check().is_err());
        token.reset();
        assert!(!shared.is_cancelled());
        assert!(token.check().is_ok());
    }
}
