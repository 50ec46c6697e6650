//! Writing traces and analysis results back to disk.

use std::path::{Path, PathBuf};

use crate::{ElementKind, HbResult, ResultSet, RunInfo, Trace, TRACE_INFO_FILE};

pub const RESULTS_MACHINE_FILE: &str = "results_machine.log";
pub const RESULTS_READABLE_FILE: &str = "results_readable.log";
pub const REWRITTEN_INFO_FILE: &str = "rewrittenInfo.txt";

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Omit object-creation and routine-end records.
    pub replay: bool,
}

/// Recreate `dir` with one `trace_<r>.log` per routine, records ordered by `tPre`.
pub fn write_trace(trace: &Trace, dir: &Path, opts: WriteOptions) -> HbResult<()> {
    crate::recreate_dir(dir)?;
    for routine in 1..=trace.num_routines() as u32 {
        let mut ids: Vec<_> = trace.routine(routine).to_vec();
        ids.sort_by_key(|id| trace.elem(*id).t_pre);
        let mut out = String::new();
        for id in ids {
            let e = trace.elem(id);
            if opts.replay && matches!(e.kind, ElementKind::New { .. } | ElementKind::RoutineEnd) {
                continue;
            }
            out.push_str(&e.to_record());
            out.push('\n');
        }
        crate::write_atomic(&dir.join(format!("trace_{routine}.log")), out.as_bytes())?;
    }
    Ok(())
}

pub fn write_run_info(info: &RunInfo, dir: &Path) -> HbResult<()> {
    crate::write_atomic(&dir.join(TRACE_INFO_FILE), info.to_text().as_bytes())
}

/// Write both result files into `dir`; returns their paths.
pub fn write_results(results: &ResultSet, dir: &Path) -> HbResult<(PathBuf, PathBuf)> {
    let machine = dir.join(RESULTS_MACHINE_FILE);
    let readable = dir.join(RESULTS_READABLE_FILE);
    crate::write_atomic(&machine, results.machine_text().as_bytes())?;
    crate::write_atomic(&readable, results.readable_text().as_bytes())?;
    Ok((machine, readable))
}

pub fn write_rewritten_info(dir: &Path, index: &str, bug_key: &str, exit_code: i32) -> HbResult<PathBuf> {
    let path = dir.join(REWRITTEN_INFO_FILE);
    crate::write_atomic(&path, format!("{index}#{bug_key}#{exit_code}").as_bytes())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read_trace_dir, ReadOptions};

    #[test]
    fn written_trace_reads_back_identically() {
        let src = std::env::temp_dir().join(format!("hbtrace-writer-src-{}", uuid::Uuid::new_v4()));
        let dst = std::env::temp_dir().join(format!("hbtrace-writer-dst-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&src).expect("dir");
        std::fs::write(
            src.join("trace_1.log"),
            "N,1,3,C,0,f.go:1\nG,2,2,f.go:2\nC,3,6,3,S,f,1,0,0,f.go:3\nE,7\n",
        )
        .expect("write");
        std::fs::write(src.join("trace_2.log"), "C,4,6,3,R,f,1,0,0,f.go:5\n").expect("write");

        let first = read_trace_dir(&src, ReadOptions::default()).expect("read src");
        write_trace(&first.trace, &dst, WriteOptions::default()).expect("write");
        let second = read_trace_dir(&dst, ReadOptions::default()).expect("read dst");
        for r in 1..=2 {
            let a: Vec<String> = first.trace.routine(r).iter().map(|id| first.trace.elem(*id).to_record()).collect();
            let b: Vec<String> =
                second.trace.routine(r).iter().map(|id| second.trace.elem(*id).to_record()).collect();
            assert_eq!(a, b);
        }

        write_trace(&first.trace, &dst, WriteOptions { replay: true }).expect("replay write");
        let replay = std::fs::read_to_string(dst.join("trace_1.log")).expect("read");
        assert_eq!(replay, "G,2,2,f.go:2\nC,3,6,3,S,f,1,0,0,f.go:3\n");
        let _ = std::fs::remove_dir_all(&src);
        let _ = std::fs::remove_dir_all(&dst);
    }

    #[test]
    fn rewritten_info_line() {
        let dir = std::env::temp_dir().join(format!("hbtrace-writer-info-{}", uuid::Uuid::new_v4()));
        let path = write_rewritten_info(&dir, "3", "P01", 30).expect("write");
        assert_eq!(std::fs::read_to_string(path).expect("read"), "3#P01#30");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
