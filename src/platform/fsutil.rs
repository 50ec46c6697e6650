//! Small filesystem utilities.

use globset::{Glob, GlobMatcher};

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::{HbError, HbResult, RoutineId};

pub const TRACE_FILE_GLOB: &str = "trace_*.log";

/// Per-routine trace files directly inside `dir`, ordered by routine.
pub fn find_trace_files(dir: &Path) -> HbResult<Vec<(RoutineId, PathBuf)>> {
    if !dir.is_dir() {
        return Err(HbError::InvalidArgument(format!(
            "trace directory {} does not exist",
            dir.display()
        )));
    }
    let matcher = compile_glob(TRACE_FILE_GLOB)?;
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            let msg = e.to_string();
            HbError::Io(e.into_io_error().unwrap_or_else(|| std::io::Error::other(msg)))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !matcher.is_match(name.as_ref()) {
            continue;
        }
        let routine = name
            .strip_prefix("trace_")
            .and_then(|s| s.strip_suffix(".log"))
            .and_then(|s| s.parse::<RoutineId>().ok());
        match routine {
            Some(r) if r > 0 => out.push((r, entry.path().to_path_buf())),
            _ => tracing::debug!("skipping {}", entry.path().display()),
        }
    }
    out.sort();
    Ok(out)
}

fn compile_glob(pattern: &str) -> HbResult<GlobMatcher> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| HbError::InvalidArgument(format!("invalid glob {pattern:?}: {e}")))
}

/// Replace `path` through a temp file in the same directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> HbResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("out.log");
    let tmp_path = parent.join(format!(".{file_name}.{}.{}.tmp", std::process::id(), uuid::Uuid::new_v4()));
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Remove `dir` if present and create it empty.
pub fn recreate_dir(dir: &Path) -> HbResult<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_numbered_trace_files_are_found() {
        let dir = std::env::temp_dir().join(format!("hbtrace-fsutil-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("nested")).expect("dir");
        for name in ["trace_2.log", "trace_10.log", "trace_x.log", "trace_info.log", "other.log"] {
            std::fs::write(dir.join(name), "").expect("write");
        }
        std::fs::write(dir.join("nested").join("trace_3.log"), "").expect("write");
        let found: Vec<RoutineId> = find_trace_files(&dir).expect("list").into_iter().map(|(r, _)| r).collect();
        assert_eq!(found, vec![2, 10]);
        assert!(find_trace_files(&dir.join("missing")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = std::env::temp_dir().join(format!("hbtrace-fsutil-{}", uuid::Uuid::new_v4()));
        let path = dir.join("out.log");
        write_atomic(&path, b"one").expect("first");
        write_atomic(&path, b"two").expect("second");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "two");
        let entries = std::fs::read_dir(&dir).expect("dir").count();
        assert_eq!(entries, 1);
        recreate_dir(&dir).expect("recreate");
        assert_eq!(std::fs::read_dir(&dir).expect("dir").count(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
