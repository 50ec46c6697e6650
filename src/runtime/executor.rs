//! Running the external recorder/replayer for one fuzzing or replay run.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::{HbError, HbResult, RecorderConfig};

pub const ENV_RUN_INDEX: &str = "HBTRACE_RUN";
pub const ENV_RUN_KIND: &str = "HBTRACE_RUN_KIND";
pub const ENV_TRACE_OUT: &str = "HBTRACE_TRACE_OUT";
pub const ENV_REPLAY_DIR: &str = "HBTRACE_REPLAY_DIR";
pub const ENV_FUZZING_DATA: &str = "HBTRACE_FUZZING_DATA";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Record a fresh execution, optionally steered by fuzzing data or a chain trace.
    Record,
    /// Replay a rewritten trace and report how it ended.
    Replay,
}

impl RunKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Replay => "replay",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub run: usize,
    pub kind: RunKind,
    /// Where the recorder writes `trace_<r>.log` and `trace_info.log`.
    pub trace_out: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuzzing_data: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecOutcome {
    /// Process exit status; `None` if killed by a signal.
    pub status: Option<i32>,
}

pub trait Executor {
    fn execute(&mut self, req: &ExecRequest) -> HbResult<ExecOutcome>;
}

/// Spawns the configured recorder argv on the host.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandExecutor {
    pub fn new(cfg: &RecorderConfig) -> HbResult<Self> {
        if cfg.command.is_empty() {
            return Err(HbError::Config(
                "fuzzing.recorder.command is empty; nothing to run".to_string(),
            ));
        }
        Ok(Self {
            argv: cfg.command.clone(),
            env: cfg.env.clone(),
        })
    }

    fn env_for(&self, req: &ExecRequest) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = self.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        vars.push((ENV_RUN_INDEX.to_string(), req.run.to_string()));
        vars.push((ENV_RUN_KIND.to_string(), req.kind.as_str().to_string()));
        vars.push((ENV_TRACE_OUT.to_string(), req.trace_out.display().to_string()));
        if let Some(dir) = &req.replay_dir {
            vars.push((ENV_REPLAY_DIR.to_string(), dir.display().to_string()));
        }
        if let Some(path) = &req.fuzzing_data {
            vars.push((ENV_FUZZING_DATA.to_string(), path.display().to_string()));
        }
        vars
    }
}

impl Executor for CommandExecutor {
    fn execute(&mut self, req: &ExecRequest) -> HbResult<ExecOutcome> {
        let (cmd, args) = self
            .argv
            .split_first()
            .ok_or_else(|| HbError::Config("recorder command is empty".to_string()))?;
        std::fs::create_dir_all(&req.trace_out)?;
        tracing::debug!("run {}: spawning {cmd} {:?}", req.run, args);
        let output = std::process::Command::new(cmd)
            .args(args)
            .envs(self.env_for(req))
            .output()
            .map_err(|e| HbError::InvalidArgument(format!("failed to spawn recorder {cmd:?} {args:?}: {e}")))?;
        if !output.stderr.is_empty() {
            tracing::debug!("run {} stderr: {}", req.run, String::from_utf8_lossy(&output.stderr).trim_end());
        }
        Ok(ExecOutcome {
            status: output.status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(run: usize) -> ExecRequest {
        ExecRequest {
            run,
            kind: RunKind::Record,
            trace_out: std::env::temp_dir().join(format!("hbtrace-exec-{}", uuid::Uuid::new_v4())),
            replay_dir: None,
            fuzzing_data: Some(PathBuf::from("fuzzingData.log")),
        }
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandExecutor::new(&RecorderConfig::default()).is_err());
    }

    #[test]
    fn environment_carries_run_details() {
        let exec = CommandExecutor::new(&RecorderConfig {
            command: vec!["true".to_string()],
            env: BTreeMap::from([("GOFLAGS".to_string(), "-count=1".to_string())]),
        })
        .expect("executor");
        let vars = exec.env_for(&request(4));
        let get = |k: &str| vars.iter().find(|(n, _)| n == k).map(|(_, v)| v.clone());
        assert_eq!(get(ENV_RUN_INDEX).as_deref(), Some("4"));
        assert_eq!(get(ENV_RUN_KIND).as_deref(), Some("record"));
        assert_eq!(get(ENV_FUZZING_DATA).as_deref(), Some("fuzzingData.log"));
        assert_eq!(get("GOFLAGS").as_deref(), Some("-count=1"));
        assert!(get(ENV_REPLAY_DIR).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn exit_status_is_reported() {
        let mut exec = CommandExecutor::new(&RecorderConfig {
            command: vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            env: BTreeMap::new(),
        })
        .expect("executor");
        let req = request(0);
        let out = exec.execute(&req).expect("spawn");
        assert_eq!(out.status, Some(3));
        let _ = std::fs::remove_dir_all(&req.trace_out);
    }
}
