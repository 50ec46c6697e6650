//! `hbtrace.toml` config loading.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::{HbError, HbResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Base directory for run artifacts.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub fuzzing: FuzzingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AnalysisConfig {
    /// Order buffered operations of one routine as FIFO.
    #[serde(default)]
    pub fifo: bool,

    /// Atomic reads do not sync with the last write.
    #[serde(default)]
    pub ignore_critical_sections: bool,

    /// Skip atomic records while reading.
    #[serde(default)]
    pub ignore_atomics: bool,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub detectors: DetectorFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DetectorFlags {
    #[serde(default = "default_true")]
    pub send_on_closed: bool,
    #[serde(default = "default_true")]
    pub recv_on_closed: bool,
    #[serde(default = "default_true")]
    pub close_on_closed: bool,
    #[serde(default = "default_true")]
    pub concurrent_recv: bool,
    #[serde(default = "default_true")]
    pub leak: bool,
    #[serde(default = "default_true")]
    pub select_without_partner: bool,
    #[serde(default = "default_true")]
    pub negative_wait_group: bool,
    #[serde(default = "default_true")]
    pub unlock_before_lock: bool,
    #[serde(default = "default_true")]
    pub resource_deadlock: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FuzzingConfig {
    #[serde(default = "default_fuzz_mode")]
    pub mode: crate::FuzzMode,

    /// `-1` runs until the queue drains or time is up.
    #[serde(default = "default_max_runs")]
    pub max_runs: i64,

    #[serde(default)]
    pub max_time_secs: Option<u64>,

    #[serde(default)]
    pub cancel_on_first_bug: bool,

    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(flatten)]
    pub tuning: Tuning,

    #[serde(default)]
    pub recorder: RecorderConfig,
}

/// Weights and bounds of the mutation heuristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Tuning {
    #[serde(default = "default_gfuzz_weight")]
    pub gfuzz_w1: f64,
    #[serde(default = "default_gfuzz_weight")]
    pub gfuzz_w2: f64,
    #[serde(default = "default_gfuzz_weight")]
    pub gfuzz_w3: f64,
    #[serde(default = "default_gfuzz_weight")]
    pub gfuzz_w4: f64,
    #[serde(default = "default_flip_p")]
    pub flip_p: f64,
    #[serde(default = "default_flip_p_min")]
    pub flip_p_min: f64,
    #[serde(default = "default_gopie_weight")]
    pub gopie_w1: f64,
    #[serde(default = "default_gopie_weight")]
    pub gopie_w2: f64,
    #[serde(default = "default_gopie_bound")]
    pub gopie_bound: usize,
    #[serde(default = "default_gopie_mutabound")]
    pub gopie_mutabound: usize,
    #[serde(default = "default_gopie_sc_start")]
    pub gopie_sc_start: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RecorderConfig {
    /// argv of the recorder/replayer; empty disables the command executor.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".hbtrace")
}

fn default_true() -> bool {
    true
}

fn default_fuzz_mode() -> crate::FuzzMode {
    crate::FuzzMode::GFuzz
}

fn default_max_runs() -> i64 {
    100
}

fn default_gfuzz_weight() -> f64 {
    10.0
}

fn default_flip_p() -> f64 {
    0.99
}

fn default_flip_p_min() -> f64 {
    0.1
}

fn default_gopie_weight() -> f64 {
    1.0
}

fn default_gopie_bound() -> usize {
    3
}

fn default_gopie_mutabound() -> usize {
    128
}

fn default_gopie_sc_start() -> usize {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            analysis: AnalysisConfig::default(),
            fuzzing: FuzzingConfig::default(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            fifo: false,
            ignore_critical_sections: false,
            ignore_atomics: false,
            timeout_secs: None,
            detectors: DetectorFlags::default(),
        }
    }
}

impl Default for DetectorFlags {
    fn default() -> Self {
        Self {
            send_on_closed: true,
            recv_on_closed: true,
            close_on_closed: true,
            concurrent_recv: true,
            leak: true,
            select_without_partner: true,
            negative_wait_group: true,
            unlock_before_lock: true,
            resource_deadlock: true,
        }
    }
}

impl Default for FuzzingConfig {
    fn default() -> Self {
        Self {
            mode: default_fuzz_mode(),
            max_runs: default_max_runs(),
            max_time_secs: None,
            cancel_on_first_bug: false,
            seed: None,
            tuning: Tuning::default(),
            recorder: RecorderConfig::default(),
        }
    }
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            gfuzz_w1: default_gfuzz_weight(),
            gfuzz_w2: default_gfuzz_weight(),
            gfuzz_w3: default_gfuzz_weight(),
            gfuzz_w4: default_gfuzz_weight(),
            flip_p: default_flip_p(),
            flip_p_min: default_flip_p_min(),
            gopie_w1: default_gopie_weight(),
            gopie_w2: default_gopie_weight(),
            gopie_bound: default_gopie_bound(),
            gopie_mutabound: default_gopie_mutabound(),
            gopie_sc_start: default_gopie_sc_start(),
        }
    }
}

impl Tuning {
    /// Apply a `Name=value,Name=value` override string. Values are clamped:
    /// weights to `>= 0`, probabilities to `[0, 1]`, bounds to `>= 1`.
    pub fn apply_settings(&mut self, raw: &str) -> HbResult<()> {
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = part
                .split_once('=')
                .ok_or_else(|| HbError::Config(format!("setting {part:?} is not name=value")))?;
            let name = name.trim();
            let value = value.trim();
            let float = || {
                value
                    .parse::<f64>()
                    .map_err(|_| HbError::Config(format!("setting {name} expects a number, got {value:?}")))
            };
            let bound = || {
                value
                    .parse::<i64>()
                    .map(|v| v.max(1) as usize)
                    .map_err(|_| HbError::Config(format!("setting {name} expects an integer, got {value:?}")))
            };
            match name {
                "GFuzzW1" => self.gfuzz_w1 = float()?.max(0.0),
                "GFuzzW2" => self.gfuzz_w2 = float()?.max(0.0),
                "GFuzzW3" => self.gfuzz_w3 = float()?.max(0.0),
                "GFuzzW4" => self.gfuzz_w4 = float()?.max(0.0),
                "GFuzzFlipP" => self.flip_p = float()?.clamp(0.0, 1.0),
                "GFuzzFlipPMin" => self.flip_p_min = float()?.clamp(0.0, 1.0),
                "GoPieW1" => self.gopie_w1 = float()?.max(0.0),
                "GoPieW2" => self.gopie_w2 = float()?.max(0.0),
                "GoPieBound" => self.gopie_bound = bound()?,
                "GoPieMutabound" => self.gopie_mutabound = bound()?,
                "GoPieSCStart" => self.gopie_sc_start = bound()?,
                other => {
                    tracing::warn!("ignoring unknown setting {other}");
                }
            }
        }
        Ok(())
    }
}

impl Config {
    pub fn load_optional(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<Config>(&s) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!("failed to parse config {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("failed to read config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.base_dir.join("runs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join(format!("hbtrace-config-{}.toml", uuid::Uuid::new_v4()));
        let cfg = Config::load_optional(&path);
        assert_eq!(cfg.base_dir, PathBuf::from(".hbtrace"));
        assert_eq!(cfg.fuzzing.max_runs, 100);
        assert!(cfg.analysis.detectors.resource_deadlock);
        assert_eq!(cfg.runs_dir(), PathBuf::from(".hbtrace").join("runs"));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let path = std::env::temp_dir().join(format!("hbtrace-config-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "[analysis]\nfifo = true\n[analysis.detectors]\nleak = false\n[fuzzing]\nmode = \"gopie_hb\"\nmax_runs = -1\n",
        )
        .expect("write config");
        let cfg = Config::load_optional(&path);
        assert!(cfg.analysis.fifo);
        assert!(!cfg.analysis.detectors.leak);
        assert!(cfg.analysis.detectors.send_on_closed);
        assert_eq!(cfg.fuzzing.mode, crate::FuzzMode::GoPieHb);
        assert_eq!(cfg.fuzzing.max_runs, -1);
        assert_eq!(cfg.fuzzing.tuning.gopie_bound, 3);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn malformed_file_falls_back() {
        let path = std::env::temp_dir().join(format!("hbtrace-config-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "base_dir = [").expect("write config");
        let cfg = Config::load_optional(&path);
        assert_eq!(cfg.base_dir, PathBuf::from(".hbtrace"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn settings_are_clamped() {
        let mut t = Tuning::default();
        t.apply_settings("GFuzzW1=4, GFuzzFlipP=1.7,GoPieBound=0,GoPieW2=-3")
            .expect("valid settings");
        assert_eq!(t.gfuzz_w1, 4.0);
        assert_eq!(t.flip_p, 1.0);
        assert_eq!(t.gopie_bound, 1);
        assert_eq!(t.gopie_w2, 0.0);
        assert!(t.apply_settings("GoPieBound").is_err());
        assert!(t.apply_settings("GFuzzW1=abc").is_err());
    }
}
