//! Bugs reported by the recorded program's exit code.

use crate::{Analyzer, BugCode, ResultElem, RunInfo};

pub const EXIT_CODE_NONE: i32 = 0;
pub const EXIT_CODE_PANIC: i32 = 3;
pub const EXIT_CODE_TIMEOUT: i32 = 10;
pub const EXIT_CODE_LEAK_UNBUFFERED: i32 = 20;
pub const EXIT_CODE_LEAK_BUFFERED: i32 = 21;
pub const EXIT_CODE_LEAK_MUTEX: i32 = 22;
pub const EXIT_CODE_LEAK_COND: i32 = 23;
pub const EXIT_CODE_LEAK_WAIT_GROUP: i32 = 24;
pub const EXIT_CODE_SEND_CLOSE: i32 = 30;
pub const EXIT_CODE_RECV_CLOSE: i32 = 31;
pub const EXIT_CODE_NEGATIVE_WG: i32 = 32;
pub const EXIT_CODE_UNLOCK_BEFORE_LOCK: i32 = 33;
pub const EXIT_CODE_CLOSE_CLOSE: i32 = 34;
pub const EXIT_CODE_CLOSE_NIL: i32 = 35;
pub const EXIT_CODE_CYCLIC: i32 = 41;

/// Replays exiting with at least this code confirmed the bug they targeted.
pub const MIN_EXIT_CODE_SUCCESS: i32 = 20;

/// Code and object type for an exit code, if it signals a bug.
pub fn exit_code_finding(code: i32) -> Option<(BugCode, &'static str)> {
    match code {
        EXIT_CODE_PANIC => Some((BugCode::R01, "XP")),
        10..=13 => Some((BugCode::R02, "XT")),
        EXIT_CODE_SEND_CLOSE => Some((BugCode::A01, "CS")),
        EXIT_CODE_RECV_CLOSE => Some((BugCode::A02, "CR")),
        EXIT_CODE_NEGATIVE_WG => Some((BugCode::A05, "WD")),
        EXIT_CODE_UNLOCK_BEFORE_LOCK => Some((BugCode::A06, "ML")),
        EXIT_CODE_CLOSE_CLOSE => Some((BugCode::A03, "CC")),
        EXIT_CODE_CLOSE_NIL => Some((BugCode::A04, "CC")),
        _ => None,
    }
}

impl Analyzer {
    /// Findings derived from the run info alone. Unless `all` is set, send and
    /// receive on closed are left to the HB pass, which finds them in the trace.
    pub(crate) fn exit_code_findings(&mut self, info: &RunInfo, all: bool) {
        let Some((code, obj_type)) = exit_code_finding(info.exit_code) else {
            return;
        };
        let in_trace = matches!(code, BugCode::A01 | BugCode::A02);
        if in_trace && !all {
            return;
        }
        tracing::info!("program exited with code {} ({code})", info.exit_code);
        let at = ResultElem::at_position(obj_type, info.exit_position.as_ref());
        self.report(code, vec![at], vec![]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AnalysisOptions, Position, Trace};

    fn info(code: i32) -> RunInfo {
        RunInfo {
            exit_code: code,
            exit_position: Some(Position::new("main.go", 12)),
            ..RunInfo::default()
        }
    }

    #[test]
    fn negative_wait_group_exit_is_reported_with_position() {
        let mut a = Analyzer::new(AnalysisOptions::default());
        a.run(&mut Trace::new(), &info(EXIT_CODE_NEGATIVE_WG)).expect("run");
        let f = &a.results().findings()[0];
        assert_eq!(f.code, BugCode::A05);
        assert_eq!((f.arg1[0].file.as_str(), f.arg1[0].line), ("main.go", 12));
        assert_eq!(f.arg1[0].obj_type, "WD");
    }

    #[test]
    fn close_codes_are_always_reported() {
        let mut full = Analyzer::new(AnalysisOptions::default());
        full.run(&mut Trace::new(), &info(EXIT_CODE_CLOSE_CLOSE)).expect("run");
        assert_eq!(full.results().count(BugCode::A03), 1);

        let mut nil = Analyzer::new(AnalysisOptions::default());
        nil.run(&mut Trace::new(), &info(EXIT_CODE_CLOSE_NIL)).expect("run");
        assert_eq!(nil.results().count(BugCode::A04), 1);
    }

    #[test]
    fn send_close_code_only_in_only_actual_mode() {
        let mut full = Analyzer::new(AnalysisOptions::default());
        full.run(&mut Trace::new(), &info(EXIT_CODE_SEND_CLOSE)).expect("run");
        assert_eq!(full.results().count(BugCode::A01), 0);

        let mut only = Analyzer::new(AnalysisOptions {
            only_actual: true,
            ..AnalysisOptions::default()
        });
        only.run(&mut Trace::new(), &info(EXIT_CODE_SEND_CLOSE)).expect("run");
        assert_eq!(only.results().count(BugCode::A01), 1);
    }

    #[test]
    fn timeouts_and_panics() {
        assert_eq!(exit_code_finding(12).map(|f| f.0), Some(BugCode::R02));
        assert_eq!(exit_code_finding(EXIT_CODE_PANIC).map(|f| f.0), Some(BugCode::R01));
        assert_eq!(exit_code_finding(EXIT_CODE_NONE), None);
        assert_eq!(exit_code_finding(EXIT_CODE_LEAK_MUTEX), None);
    }
}
