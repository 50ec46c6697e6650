use std::collections::BTreeSet;
use std::path::PathBuf;

use hbtrace::{
    analyze_trace_dir, rewrite_all, AnalysisOptions, AnalysisReport, BugCode, CancelToken, Config, RewriteOutcome,
    EXIT_CODE_NEGATIVE_WG, EXIT_CODE_SEND_CLOSE,
};

fn temp_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("hbtrace-{name}-{}", uuid::Uuid::new_v4()))
}

fn write_routines(name: &str, routines: &[&str]) -> PathBuf {
    let dir = temp_dir(name);
    std::fs::create_dir_all(&dir).expect("mkdir");
    for (i, content) in routines.iter().enumerate() {
        std::fs::write(dir.join(format!("trace_{}.log", i + 1)), content).expect("write trace");
    }
    dir
}

fn analyse(dir: &std::path::Path) -> AnalysisReport {
    analyze_trace_dir(dir, &Config::default(), AnalysisOptions::default(), &CancelToken::new(), false)
        .expect("analysis")
}

fn count(report: &AnalysisReport, code: BugCode) -> usize {
    report.results.count(code)
}

#[test]
fn actual_send_on_closed() {
    let dir = write_routines(
        "s1",
        &["N,1,1,C,1,f.go:1; C,2,3,1,C,f,0,0,0,f.go:2; C,4,5,1,S,t,0,0,0,f.go:3"],
    );
    let report = analyse(&dir);
    let f = report
        .results
        .findings()
        .iter()
        .find(|f| f.code == BugCode::A01)
        .expect("A01");
    assert!(!f.arg1.is_empty());
    assert!(!f.arg2.is_empty());
    assert_eq!(f.arg1[0].line, 3);
    assert_eq!(f.arg2[0].line, 2);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn possible_send_on_closed_is_rewritten_with_marker_30() {
    let dir = write_routines(
        "s2",
        &[
            "G,1,2,m.go:1\nG,3,3,m.go:2\nC,10,11,5,S,f,1,0,0,m.go:10\nC,12,13,5,R,f,2,0,0,m.go:11\nE,20",
            "C,4,11,5,R,f,1,0,0,w.go:5\nC,14,15,5,C,f,0,0,0,w.go:6\nE,21",
            "C,5,13,5,S,f,2,0,0,x.go:7\nE,22",
        ],
    );
    let report = analyse(&dir);
    assert_eq!(count(&report, BugCode::P01), 1);

    let rewrites = rewrite_all(&report.trace, &report.results, &dir, &BTreeSet::new(), &CancelToken::new())
        .expect("rewrite");
    let rw = rewrites.iter().find(|r| r.code == BugCode::P01).expect("P01 rewrite");
    assert_eq!(rw.outcome, RewriteOutcome::Rewritten);
    assert_eq!(rw.expected_exit_code, Some(EXIT_CODE_SEND_CLOSE));
    let out = rw.dir.as_ref().expect("rewrite dir");
    let marker_found = (1..=3).any(|r| {
        std::fs::read_to_string(out.join(format!("trace_{r}.log")))
            .map(|s| s.lines().any(|l| l.starts_with("X,") && l.ends_with(",30")))
            .unwrap_or(false)
    });
    assert!(marker_found, "no replay marker with exit code 30");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn negative_wait_group_pair_is_rewritten_with_marker_32() {
    let dir = write_routines(
        "s3",
        &["W,1,2,7,A,1,1,f.go:1", "W,3,4,7,A,-1,0,f.go:2; W,5,6,7,A,-1,-1,f.go:3"],
    );
    let report = analyse(&dir);
    let f = report
        .results
        .findings()
        .iter()
        .find(|f| f.code == BugCode::P03)
        .expect("P03");
    assert_eq!(f.arg1.len(), 1);
    assert_eq!(f.arg2.len(), 1);

    let rewrites = rewrite_all(&report.trace, &report.results, &dir, &BTreeSet::new(), &CancelToken::new())
        .expect("rewrite");
    let rw = rewrites.iter().find(|r| r.code == BugCode::P03).expect("P03 rewrite");
    assert_eq!(rw.outcome, RewriteOutcome::Rewritten);
    assert_eq!(rw.expected_exit_code, Some(EXIT_CODE_NEGATIVE_WG));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn two_lock_inversion_is_a_cyclic_deadlock() {
    let dir = write_routines(
        "s4",
        &[
            "G,1,2,m.go:1\nG,2,3,m.go:2\nE,30",
            "M,3,4,1,-,L,t,a.go:1\nM,5,6,2,-,L,t,a.go:2\nM,7,8,2,-,U,t,a.go:3\nM,9,10,1,-,U,t,a.go:4\nE,31",
            "M,11,12,2,-,L,t,b.go:1\nM,13,14,1,-,L,t,b.go:2\nM,15,16,1,-,U,t,b.go:3\nM,17,18,2,-,U,t,b.go:4\nE,32",
        ],
    );
    let report = analyse(&dir);
    let f = report
        .results
        .findings()
        .iter()
        .find(|f| f.code == BugCode::P05)
        .expect("P05");
    assert_eq!(f.arg2.len(), 2);
    // The holder is the request with the largest tPre.
    assert_eq!(f.arg1[0].t_pre, 13);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn stuck_unbuffered_pair_is_one_leak_with_partner() {
    let dir = write_routines("s5", &["C,1,0,4,R,f,0,0,0,m.go:3", "C,2,0,4,S,f,0,0,0,w.go:5"]);
    let report = analyse(&dir);
    assert_eq!(count(&report, BugCode::L02), 1);
    assert_eq!(count(&report, BugCode::L01), 0);
    let f = report
        .results
        .findings()
        .iter()
        .find(|f| f.code == BugCode::L02)
        .expect("L02");
    let files: BTreeSet<&str> = f.arg1.iter().chain(&f.arg2).map(|e| e.file.as_str()).collect();
    assert_eq!(files, BTreeSet::from(["m.go", "w.go"]));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn select_case_without_partner_is_a_diagnostic() {
    let dir = write_routines(
        "s6",
        &[
            "G,1,2,m.go:1\nS,3,6,9,C.3.6.4.R.f.1.0.0~C.3.0.5.R.f.0.0.0,0,m.go:5\nE,20",
            "C,4,6,4,S,f,1,0,0,w.go:1\nE,21",
        ],
    );
    let report = analyse(&dir);
    let a08: Vec<_> = report.results.findings().iter().filter(|f| f.code == BugCode::A08).collect();
    assert_eq!(a08.len(), 1);
    assert_eq!(a08[0].arg2[0].select_case, Some(1));
    assert_eq!(report.summary.counts.critical, 0);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn reanalysing_a_trace_gives_the_same_findings() {
    let dir = write_routines(
        "determinism",
        &[
            "G,1,2,m.go:1\nG,2,3,m.go:2\nC,10,0,4,S,f,0,0,0,m.go:3\nE,20",
            "C,3,6,4,R,f,1,0,0,a.go:1\nM,7,8,1,-,L,t,a.go:2\nM,9,10,2,-,L,t,a.go:3\nM,11,12,2,-,U,t,a.go:4\nM,13,14,1,-,U,t,a.go:5\nE,21",
            "C,4,6,4,S,f,1,0,0,b.go:1\nM,15,16,2,-,L,t,b.go:2\nM,17,18,1,-,L,t,b.go:3\nM,19,20,1,-,U,t,b.go:4\nM,21,22,2,-,U,t,b.go:5\nE,22",
        ],
    );
    let first = analyse(&dir);
    let second = analyse(&dir);
    assert!(!first.results.is_empty());
    assert_eq!(first.results.findings(), second.results.findings());
    assert_eq!(first.results.machine_text(), second.results.machine_text());
    let _ = std::fs::remove_dir_all(&dir);
}
