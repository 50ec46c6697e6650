//! Rewrite a recorded trace so that replaying it triggers a possible bug.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

use crate::{
    is_concurrent, BugCode, CancelToken, ElemId, Finding, HbError, HbResult, ResultElem, ResultSet, Trace,
    WaitGroupKind, WriteOptions, EXIT_CODE_CYCLIC, EXIT_CODE_LEAK_BUFFERED,
    EXIT_CODE_LEAK_COND, EXIT_CODE_LEAK_MUTEX, EXIT_CODE_LEAK_UNBUFFERED, EXIT_CODE_LEAK_WAIT_GROUP,
    EXIT_CODE_NEGATIVE_WG, EXIT_CODE_RECV_CLOSE, EXIT_CODE_SEND_CLOSE, EXIT_CODE_UNLOCK_BEFORE_LOCK,
};

pub const REWRITTEN_TRACE_PREFIX: &str = "rewritten_trace_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteOutcome {
    Rewritten,
    NotNeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteReport {
    pub code: BugCode,
    pub bug_key: String,
    pub outcome: RewriteOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn fail<T>(msg: impl Into<String>) -> HbResult<T> {
    Err(HbError::Rewrite(msg.into()))
}

fn elem_of(arg: &[ResultElem], trace: &Trace, what: &str) -> HbResult<ElemId> {
    let Some(id) = arg.first().and_then(|r| r.elem) else {
        return fail(format!("finding has no {what} element"));
    };
    if trace.get(id).is_none() {
        return fail(format!("{what} element is not in the trace"));
    }
    Ok(id)
}

/// Make the select cited by `r` choose the cited case.
fn choose_case(trace: &mut Trace, r: &ResultElem) -> HbResult<()> {
    let (Some(id), Some(case)) = (r.elem, r.select_case) else {
        return Ok(());
    };
    let Some(op) = trace
        .elem(id)
        .select()
        .and_then(|s| s.cases.get(case))
        .map(|c| (c.op.id, c.op.dir))
    else {
        return fail("select case out of range");
    };
    trace.elem_mut(id).set_select_case(op.0, op.1)
}

/// Cut everything after `t` and terminate the replay right after it.
fn finish_at(trace: &mut Trace, t: u64, exit_code: i32) {
    trace.remove_later(t);
    trace.sort();
    trace.append_replay_marker(t + 1, exit_code);
    trace.sort();
}

/// Append the marker behind every executed element.
fn finish_after_all(trace: &mut Trace, exit_code: i32) {
    trace.sort();
    let t = trace.max_t_sort_executed() + 1;
    trace.append_replay_marker(t, exit_code);
    trace.sort();
}

/// Rewrite `trace` in place for `finding`; returns the exit code a successful
/// replay must end with.
pub fn rewrite_trace(trace: &mut Trace, finding: &Finding) -> HbResult<i32> {
    if !trace.hb_was_calc() {
        return fail("rewriting needs vector clocks; analyse the trace first");
    }
    match finding.code {
        BugCode::P01 => rewrite_closed_channel(trace, finding, EXIT_CODE_SEND_CLOSE),
        BugCode::P02 => rewrite_closed_channel(trace, finding, EXIT_CODE_RECV_CLOSE),
        BugCode::P03 => rewrite_graph(trace, finding, EXIT_CODE_NEGATIVE_WG),
        BugCode::P04 => rewrite_graph(trace, finding, EXIT_CODE_UNLOCK_BEFORE_LOCK),
        BugCode::P05 => rewrite_cyclic_deadlock(trace, finding),
        BugCode::L02 | BugCode::L06 => rewrite_channel_leak(trace, finding, EXIT_CODE_LEAK_UNBUFFERED),
        BugCode::L04 => rewrite_channel_leak(trace, finding, EXIT_CODE_LEAK_BUFFERED),
        BugCode::L08 => rewrite_mutex_leak(trace, finding),
        BugCode::L09 => rewrite_wait_group_leak(trace, finding),
        BugCode::L10 => rewrite_cond_leak(trace, finding),
        other => fail(format!("no rewrite for {other}")),
    }
}

/// Move the send (or receive) behind the close it could race with.
fn rewrite_closed_channel(trace: &mut Trace, finding: &Finding, exit_code: i32) -> HbResult<i32> {
    let op = elem_of(&finding.arg1, trace, "channel")?;
    let close = elem_of(&finding.arg2, trace, "close")?;
    let t1 = trace.elem(op).t_sort();
    let t2 = trace.elem(close).t_sort();
    if t1 > t2 {
        return fail(format!("operation at {t1} already runs after the close at {t2}"));
    }
    if let Some(r) = finding.arg1.first() {
        choose_case(trace, r)?;
    }

    trace.shorten_trace(t2, true);
    trace.remove_concurrent(close, t1);
    trace.elem_mut(op).set_t(t2 + 1);
    trace.reinsert(op);
    finish_at(trace, t2 + 1, exit_code);
    Ok(exit_code)
}

/// Run every released-too-early operation before the acquisitions concurrent with it.
fn rewrite_graph(trace: &mut Trace, finding: &Finding, exit_code: i32) -> HbResult<i32> {
    let releases: Vec<ElemId> = finding.arg1.iter().filter_map(|r| r.elem).collect();
    if releases.is_empty() {
        return fail("finding has no release elements");
    }
    for id in &releases {
        trace.shift_concurrent_or_after_to_after(*id);
    }
    let t = releases.iter().map(|id| trace.elem(*id).t_pre).max().unwrap_or(0) + 1;
    trace.shift_trace(t, 1);
    trace.sort();
    trace.append_replay_marker(t, exit_code);
    trace.sort();
    Ok(exit_code)
}

/// Every routine of the cycle runs up to its request, then all requests run
/// last so each blocks on a lock another one holds.
fn rewrite_cyclic_deadlock(trace: &mut Trace, finding: &Finding) -> HbResult<i32> {
    let requests: Vec<ElemId> = finding.arg2.iter().filter_map(|r| r.elem).collect();
    if requests.len() < 2 {
        return fail("deadlock cycle needs at least two requests");
    }
    for id in &requests {
        let routine = trace.elem(*id).routine;
        let Some(idx) = trace.index_in_routine(*id) else {
            return fail("deadlock request was removed from its routine");
        };
        trace.shorten_routine_index(routine, idx, true);
    }
    let first_request = requests.iter().map(|id| trace.elem(*id).t_pre).min().unwrap_or(0);
    let others_end = trace
        .ids()
        .filter(|id| !requests.contains(id))
        .map(|id| trace.elem(id))
        .filter(|e| e.is_executed() && requests.iter().any(|r| trace.elem(*r).routine == e.routine))
        .map(|e| e.t_sort())
        .max()
        .unwrap_or(first_request);
    let mut t = others_end.max(first_request);
    for id in &requests {
        t += 1;
        trace.elem_mut(*id).set_t(t);
    }
    finish_at(trace, t, EXIT_CODE_CYCLIC);
    Ok(EXIT_CODE_CYCLIC)
}

/// Let the stuck operation meet its partner: drop what ran concurrently in
/// between and execute both at the same time.
fn rewrite_channel_leak(trace: &mut Trace, finding: &Finding, exit_code: i32) -> HbResult<i32> {
    let stuck = elem_of(&finding.arg1, trace, "stuck")?;
    let partner = elem_of(&finding.arg2, trace, "partner")?;
    for r in finding.arg1.iter().chain(&finding.arg2) {
        choose_case(trace, r)?;
    }

    let t_min = trace.elem(stuck).t_pre.min(trace.elem(partner).t_pre);
    trace.remove_concurrent(stuck, t_min);
    trace.reinsert(partner);
    let partner_routine = trace.elem(partner).routine;
    let t_partner = trace.elem(partner).t_sort();
    trace.shorten_routine(partner_routine, t_partner);
    trace.reinsert(partner);

    let t = trace.elem(stuck).t_pre.max(trace.elem(partner).t_pre) + 1;
    trace.elem_mut(stuck).set_t(t);
    trace.elem_mut(partner).set_t(t);
    trace.sort();
    finish_at(trace, t, exit_code);
    Ok(exit_code)
}

fn rewrite_mutex_leak(trace: &mut Trace, finding: &Finding) -> HbResult<i32> {
    let stuck = elem_of(&finding.arg1, trace, "stuck lock")?;
    let last = elem_of(&finding.arg2, trace, "last acquire")?;
    let (Some(sv), Some(lv)) = (trace.elem(stuck).vc.clone(), trace.elem(last).vc.clone()) else {
        return fail("lock elements carry no vector clock");
    };
    if !is_concurrent(&sv, &lv) {
        return fail("stuck lock is ordered after the last acquire");
    }
    let t_last = trace.elem(last).t_pre;
    let t = trace.elem(stuck).t_pre;
    trace.remove_concurrent(stuck, t_last);
    trace.elem_mut(stuck).set_t(t);
    trace.sort();
    finish_at(trace, t, EXIT_CODE_LEAK_MUTEX);
    Ok(EXIT_CODE_LEAK_MUTEX)
}

fn rewrite_wait_group_leak(trace: &mut Trace, finding: &Finding) -> HbResult<i32> {
    let wait = elem_of(&finding.arg1, trace, "wait")?;
    let Some(wg) = trace
        .elem(wait)
        .wait_group()
        .filter(|op| op.kind == WaitGroupKind::Wait)
        .map(|op| op.id)
    else {
        return fail("stuck element is not a wait group wait");
    };
    trace.shift_concurrent_or_after_to_after_starting_from(wait, 0);
    let t = trace.elem(wait).t_pre;
    let (adds, dones) = trace.nr_add_done_before(wg, t);
    if adds != dones {
        return fail(format!("{adds} adds and {dones} dones before the wait cannot release it"));
    }
    trace.sort();
    finish_at(trace, t, EXIT_CODE_LEAK_WAIT_GROUP);
    Ok(EXIT_CODE_LEAK_WAIT_GROUP)
}

fn rewrite_cond_leak(trace: &mut Trace, finding: &Finding) -> HbResult<i32> {
    let wait = elem_of(&finding.arg1, trace, "wait")?;
    let ops = trace.concurrent_cond_ops(wait);
    if ops.signals.is_empty() && ops.broadcasts.is_empty() {
        return fail("no signal or broadcast concurrent with the wait");
    }
    trace.shift_concurrent_or_after_to_after_starting_from(wait, 0);
    finish_after_all(trace, EXIT_CODE_LEAK_COND);
    Ok(EXIT_CODE_LEAK_COND)
}

/// Rewrite for one finding and, if rewritten, write the replay trace to `out_dir`.
pub fn rewrite_finding(trace: &Trace, finding: &Finding, out_dir: &Path, index: &str) -> HbResult<RewriteReport> {
    let mut report = RewriteReport {
        code: finding.code,
        bug_key: finding.short_key(),
        outcome: RewriteOutcome::NotNeeded,
        expected_exit_code: None,
        dir: None,
        reason: None,
    };
    if !finding.rewritable {
        return Ok(report);
    }
    let mut rewritten = trace.clone();
    match rewrite_trace(&mut rewritten, finding) {
        Ok(exit_code) => {
            crate::write_trace(&rewritten, out_dir, WriteOptions { replay: true })?;
            crate::write_rewritten_info(out_dir, index, &report.bug_key, exit_code)?;
            tracing::info!("rewrote {} into {} (expect exit {exit_code})", finding.code, out_dir.display());
            report.outcome = RewriteOutcome::Rewritten;
            report.expected_exit_code = Some(exit_code);
            report.dir = Some(out_dir.to_path_buf());
        }
        Err(HbError::Rewrite(reason)) => {
            tracing::info!("could not rewrite {}: {reason}", finding.code);
            report.outcome = RewriteOutcome::Failed;
            report.reason = Some(reason);
        }
        Err(err) => return Err(err),
    }
    Ok(report)
}

/// Rewrite every finding into `<base>/rewritten_trace_<n>`, skipping bug keys in `skip`.
pub fn rewrite_all(
    trace: &Trace,
    results: &ResultSet,
    base: &Path,
    skip: &std::collections::BTreeSet<String>,
    cancel: &CancelToken,
) -> HbResult<Vec<RewriteReport>> {
    let mut out = Vec::new();
    let mut n = 0usize;
    for finding in results.findings() {
        cancel.check()?;
        if !finding.rewritable || skip.contains(&finding.short_key()) {
            continue;
        }
        n += 1;
        let dir = base.join(format!("{REWRITTEN_TRACE_PREFIX}{n}"));
        out.push(rewrite_finding(trace, finding, &dir, &n.to_string())?);
    }
    Ok(out)
}

/// Did a replay exit with the code its rewrite expected?
pub fn replay_confirmed(expected: i32, actual: i32) -> bool {
    actual >= crate::MIN_EXIT_CODE_SUCCESS && actual == expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read_routine, AnalysisOptions, Analyzer, ElementKind, ReadOptions, RunInfo};

    fn analysed(routines: &[&str]) -> (Trace, ResultSet) {
        let mut trace = Trace::new();
        for (i, content) in routines.iter().enumerate() {
            read_routine(&mut trace, i as u32 + 1, content, ReadOptions::default());
        }
        trace.sort();
        trace.link_partners();
        let mut a = Analyzer::new(AnalysisOptions::default());
        a.run(&mut trace, &RunInfo::default()).expect("analysis");
        (trace, a.take_results())
    }

    fn marker(trace: &Trace) -> Option<(u64, i32)> {
        trace.routine(1).iter().find_map(|id| match trace.elem(*id).kind {
            ElementKind::ReplayMarker { exit_code } => Some((trace.elem(*id).t_post, exit_code)),
            _ => None,
        })
    }

    #[test]
    fn possible_send_on_closed_moves_send_after_close() {
        let (trace, results) = analyze_send_close();
        let finding = results.findings().iter().find(|f| f.code == BugCode::P01).expect("P01");
        let mut t = trace.clone();
        assert_eq!(rewrite_trace(&mut t, finding).expect("rewrite"), EXIT_CODE_SEND_CLOSE);
        let send = finding.arg1[0].elem.expect("send");
        let close = finding.arg2[0].elem.expect("close");
        assert!(t.elem(send).t_sort() > t.elem(close).t_sort());
        let (mt, code) = marker(&t).expect("marker");
        assert_eq!(code, EXIT_CODE_SEND_CLOSE);
        assert!(mt > t.elem(send).t_sort());
    }

    fn analyze_send_close() -> (Trace, ResultSet) {
        analysed(&[
            "G,1,2,m.go:1\nG,3,3,m.go:2\nC,10,11,5,S,f,1,0,0,m.go:10\nC,12,13,5,R,f,2,0,0,m.go:11\nE,20",
            "C,4,11,5,R,f,1,0,0,w.go:5\nC,14,15,5,C,f,0,0,0,w.go:6\nE,21",
            "C,5,13,5,S,f,2,0,0,x.go:7\nE,22",
        ])
    }

    #[test]
    fn actual_bugs_are_not_rewritten() {
        let (trace, results) = analysed(&["C,1,2,3,C,f,0,0,0,m.go:1\nC,3,4,3,C,f,0,0,0,m.go:2\nE,7"]);
        let finding = results.findings().iter().find(|f| f.code == BugCode::A03).expect("A03");
        let dir = std::env::temp_dir().join(format!("hbtrace-rewrite-none-{}", uuid::Uuid::new_v4()));
        let report = rewrite_finding(&trace, finding, &dir, "1").expect("report");
        assert_eq!(report.outcome, RewriteOutcome::NotNeeded);
        assert!(!dir.exists());
    }

    #[test]
    fn rewriting_requires_clocks() {
        let mut trace = Trace::new();
        read_routine(&mut trace, 1, "C,1,0,4,R,f,0,0,0,m.go:3", ReadOptions::default());
        let finding = Finding::new(BugCode::L02, vec![], vec![]);
        assert!(matches!(rewrite_trace(&mut trace, &finding), Err(HbError::Rewrite(_))));
    }

    #[test]
    fn mutex_leak_ordered_after_acquire_fails() {
        let (trace, results) = analysed(&[
            "G,1,2,m.go:1\nM,2,3,9,-,L,t,m.go:2\nM,4,5,9,-,U,t,m.go:3\nE,20",
            "M,6,7,9,-,L,t,a.go:1\nM,8,0,9,-,L,t,a.go:2",
        ]);
        let finding = results.findings().iter().find(|f| f.code == BugCode::L08).expect("L08");
        let dir = std::env::temp_dir().join(format!("hbtrace-rewrite-mutex-{}", uuid::Uuid::new_v4()));
        let report = rewrite_finding(&trace, finding, &dir, "1").expect("report");
        assert_eq!(report.outcome, RewriteOutcome::Failed);
    }

    #[test]
    fn unbuffered_leak_pairs_stuck_and_partner() {
        let (trace, results) = analysed(&[
            "G,1,2,m.go:1\nG,2,3,m.go:2\nC,10,0,4,S,f,0,0,0,m.go:3\nE,20",
            "C,3,6,4,R,f,1,0,0,a.go:1\nE,21",
            "C,4,6,4,S,f,1,0,0,b.go:1\nE,22",
        ]);
        let finding = results.findings().iter().find(|f| f.code == BugCode::L02).expect("L02");
        let dir = std::env::temp_dir().join(format!("hbtrace-rewrite-leak-{}", uuid::Uuid::new_v4()));
        let report = rewrite_finding(&trace, finding, &dir, "4").expect("report");
        assert_eq!(report.outcome, RewriteOutcome::Rewritten);
        assert_eq!(report.expected_exit_code, Some(EXIT_CODE_LEAK_UNBUFFERED));
        let info = std::fs::read_to_string(dir.join(crate::REWRITTEN_INFO_FILE)).expect("info");
        assert!(info.starts_with("4#L02"));
        assert!(info.ends_with("#20"));
        let main = std::fs::read_to_string(dir.join("trace_1.log")).expect("trace");
        assert!(main.lines().last().expect("last").starts_with("X,"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
