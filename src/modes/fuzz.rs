//! Fuzzing session: record, analyse, mutate, repeat.
//!
//! Each run pops one mutation from a bounded FIFO, hands it to the external
//! recorder, analyses the recorded trace and feeds new mutations back into
//! the queue. Rewritable findings are replayed to confirm them.

use serde::{Deserialize, Serialize};

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::{
    fuzzing_trace_dir, replay_confirmed, seeded_rng, wall_time_iso_utc, write_fuzzing_data, AnalysisOptions,
    AnalysisReport, BugCode, CancelToken, Config, Deadline, ExecOutcome, ExecRequest, Executor, Finding,
    GFuzzHistory, GoPieState, HbError, HbResult, MutationQueue, ResultSet, RewriteOutcome, RunInfo, RunKind,
    RunStats, SelectChoices, Tuning, FUZZING_DATA_FILE, FUZZING_TRACES_DIR, MIN_EXIT_CODE_SUCCESS,
    TRACE_INFO_FILE,
};

pub const FUZZ_SUMMARY_FILE: &str = "fuzz_summary.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FuzzMode {
    #[serde(rename = "gfuzz")]
    GFuzz,
    #[serde(rename = "gfuzz_hb")]
    GFuzzHb,
    #[serde(rename = "gfuzz_hb_flow")]
    GFuzzHbFlow,
    #[serde(rename = "flow")]
    Flow,
    #[serde(rename = "gopie")]
    GoPie,
    #[serde(rename = "gopie_plus")]
    GoPiePlus,
    #[serde(rename = "gopie_hb")]
    GoPieHb,
}

impl Default for FuzzMode {
    fn default() -> Self {
        Self::GFuzz
    }
}

impl FuzzMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GFuzz => "gfuzz",
            Self::GFuzzHb => "gfuzz_hb",
            Self::GFuzzHbFlow => "gfuzz_hb_flow",
            Self::Flow => "flow",
            Self::GoPie => "gopie",
            Self::GoPiePlus => "gopie_plus",
            Self::GoPieHb => "gopie_hb",
        }
    }

    /// Mutations consult vector clocks (select partners, chain validity).
    pub fn uses_hb(self) -> bool {
        matches!(self, Self::GFuzzHb | Self::GFuzzHbFlow | Self::Flow | Self::GoPieHb)
    }

    pub fn is_gfuzz(self) -> bool {
        matches!(self, Self::GFuzz | Self::GFuzzHb | Self::GFuzzHbFlow)
    }

    pub fn is_flow(self) -> bool {
        matches!(self, Self::Flow | Self::GFuzzHbFlow)
    }

    pub fn is_gopie(self) -> bool {
        matches!(self, Self::GoPie | Self::GoPiePlus | Self::GoPieHb)
    }
}

impl std::fmt::Display for FuzzMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl clap::ValueEnum for FuzzMode {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            Self::GFuzz,
            Self::GFuzzHb,
            Self::GFuzzHbFlow,
            Self::Flow,
            Self::GoPie,
            Self::GoPiePlus,
            Self::GoPieHb,
        ]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

/// One directive for the next recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Mutation {
    Select { selects: SelectChoices },
    Flow { selects: SelectChoices, delay: (String, usize) },
    Chain { index: usize },
}

impl Mutation {
    fn family(&self) -> &'static str {
        match self {
            Self::Select { .. } => "select",
            Self::Flow { .. } => "flow",
            Self::Chain { .. } => "chain",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FuzzOptions {
    pub mode: FuzzMode,
    /// `-1` is unbounded.
    pub max_runs: i64,
    pub max_time: Option<Duration>,
    pub cancel_on_first_bug: bool,
    pub seed: Option<u64>,
    pub tuning: Tuning,
    pub analysis: AnalysisOptions,
    /// Rewrite findings of each run and replay them.
    pub replay_rewrites: bool,
    /// Keep `fuzzingTraces/` after the session.
    pub keep_traces: bool,
}

impl FuzzOptions {
    pub fn from_config(cfg: &Config) -> Self {
        let f = &cfg.fuzzing;
        Self {
            mode: f.mode,
            max_runs: f.max_runs,
            max_time: f.max_time_secs.map(Duration::from_secs),
            cancel_on_first_bug: f.cancel_on_first_bug,
            seed: f.seed,
            tuning: f.tuning.clone(),
            analysis: AnalysisOptions::from_config(&cfg.analysis),
            replay_rewrites: true,
            keep_traces: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationCounts {
    pub select: usize,
    pub flow: usize,
    pub chain: usize,
}

impl MutationCounts {
    fn add(&mut self, other: MutationCounts) {
        self.select += other.select;
        self.flow += other.flow;
        self.chain += other.chain;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    QueueEmpty,
    MaxRuns,
    MaxTime,
    BugFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmedBy {
    /// The recording itself ended with a bug exit code.
    Recording,
    /// A rewritten trace replayed to its expected exit code.
    Replay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedBug {
    pub run: usize,
    pub bug_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<BugCode>,
    pub exit_code: i32,
    pub by: ConfirmedBy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuzzRunRecord {
    pub run: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation: Option<String>,
    pub exit_code: i32,
    pub findings: usize,
    pub new_findings: usize,
    pub mutations_added: MutationCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuzzSummary {
    pub session_id: String,
    pub mode: FuzzMode,
    pub seed: u64,
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: u64,
    pub runs: usize,
    pub stop_reason: StopReason,
    pub mutations: MutationCounts,
    pub dropped_mutations: usize,
    pub confirmed: Vec<ConfirmedBug>,
    pub findings: Vec<Finding>,
    pub per_run: Vec<FuzzRunRecord>,
}

impl FuzzSummary {
    pub fn pretty(&self) -> String {
        let mut out = format!(
            "session={} mode={} seed={} runs={} stop={:?}\n",
            self.session_id, self.mode, self.seed, self.runs, self.stop_reason
        );
        out.push_str(&format!(
            "mutations: select={} flow={} chain={} dropped={}\n",
            self.mutations.select, self.mutations.flow, self.mutations.chain, self.dropped_mutations
        ));
        out.push_str(&format!("unique findings: {}\n", self.findings.len()));
        for bug in &self.confirmed {
            out.push_str(&format!("+ confirmed {} in run {} (exit {})\n", bug.bug_key, bug.run, bug.exit_code));
        }
        out.trim_end().to_string()
    }
}

/// Where the session keeps its runs.
pub fn run_dir(work_dir: &Path, run: usize) -> PathBuf {
    work_dir.join("runs").join(format!("run_{run}"))
}

/// Exit code from `trace_info.log` if the recorder wrote one, else the process status.
fn observed_exit_code(trace_out: &Path, outcome: &ExecOutcome) -> i32 {
    match std::fs::read_to_string(trace_out.join(TRACE_INFO_FILE)) {
        Ok(content) => RunInfo::parse(&content).exit_code,
        Err(_) => outcome.status.unwrap_or(-1),
    }
}

/// Analyse one recorded run. Panics are caught and turned into `None`.
fn analyse_run(
    config: &Config,
    dir: &Path,
    opts: AnalysisOptions,
    cancel: &CancelToken,
) -> Option<HbResult<AnalysisReport>> {
    let out = std::panic::catch_unwind(AssertUnwindSafe(|| crate::analyze_trace_dir(dir, config, opts, cancel, true)));
    match out {
        Ok(res) => Some(res),
        Err(_) => {
            tracing::error!("analysis of {} panicked; skipping its mutations", dir.display());
            None
        }
    }
}

struct Session<'a> {
    config: &'a Config,
    opts: &'a FuzzOptions,
    work_dir: &'a Path,
    cancel: &'a CancelToken,
    queue: MutationQueue<Mutation>,
    gfuzz: GFuzzHistory,
    gopie: GoPieState,
    rng: rand_chacha::ChaCha20Rng,
    results: ResultSet,
    confirmed: Vec<ConfirmedBug>,
    confirmed_keys: BTreeSet<String>,
    mutations: MutationCounts,
    per_run: Vec<FuzzRunRecord>,
}

impl<'a> Session<'a> {
    fn remaining_runs(&self, done: usize) -> Option<usize> {
        if self.opts.max_runs < 0 {
            return None;
        }
        Some((self.opts.max_runs as usize).saturating_sub(done))
    }

    fn prepare(&self, run: usize, mutation: Option<&Mutation>) -> HbResult<ExecRequest> {
        let mut req = ExecRequest {
            run,
            kind: RunKind::Record,
            trace_out: run_dir(self.work_dir, run),
            replay_dir: None,
            fuzzing_data: None,
        };
        match mutation {
            None => {}
            Some(Mutation::Select { selects }) => {
                let path = self.work_dir.join(FUZZING_DATA_FILE);
                write_fuzzing_data(&path, selects, None)?;
                req.fuzzing_data = Some(path);
            }
            Some(Mutation::Flow { selects, delay }) => {
                let path = self.work_dir.join(FUZZING_DATA_FILE);
                write_fuzzing_data(&path, selects, Some(delay))?;
                req.fuzzing_data = Some(path);
            }
            Some(Mutation::Chain { index }) => {
                req.replay_dir = Some(fuzzing_trace_dir(self.work_dir, *index));
            }
        }
        Ok(req)
    }

    fn run_once(&mut self, run: usize, mutation: Option<Mutation>, executor: &mut dyn Executor) -> HbResult<()> {
        let req = self.prepare(run, mutation.as_ref())?;
        std::fs::create_dir_all(&req.trace_out)?;
        let mut record = FuzzRunRecord {
            run,
            mutation: mutation.as_ref().map(|m| m.family().to_string()),
            exit_code: -1,
            findings: 0,
            new_findings: 0,
            mutations_added: MutationCounts::default(),
            error: None,
        };

        let outcome = match executor.execute(&req) {
            Ok(o) => o,
            Err(err) => {
                tracing::error!("fuzzing run {run} failed: {err}");
                record.error = Some(err.to_string());
                self.per_run.push(record);
                return Ok(());
            }
        };
        record.exit_code = observed_exit_code(&req.trace_out, &outcome);
        if record.exit_code >= MIN_EXIT_CODE_SUCCESS {
            self.confirm(ConfirmedBug {
                run,
                bug_key: format!("exit:{}", record.exit_code),
                code: crate::exit_code_finding(record.exit_code).map(|(c, _)| c),
                exit_code: record.exit_code,
                by: ConfirmedBy::Recording,
            });
        }

        let report = match analyse_run(self.config, &req.trace_out, self.opts.analysis, self.cancel) {
            Some(Ok(report)) => report,
            Some(Err(HbError::Cancelled(reason))) => {
                tracing::warn!("analysis of run {run} cancelled ({reason}); no mutations from it");
                self.cancel.reset();
                record.error = Some(format!("cancelled ({reason})"));
                self.per_run.push(record);
                return Ok(());
            }
            Some(Err(err)) => {
                tracing::error!("could not analyse run {run}: {err}");
                record.error = Some(err.to_string());
                self.per_run.push(record);
                return Ok(());
            }
            None => {
                record.error = Some("analysis panicked".to_string());
                self.per_run.push(record);
                return Ok(());
            }
        };

        record.findings = report.results.len();
        for f in report.results.findings() {
            if self.results.push(f.clone()) {
                record.new_findings += 1;
            }
        }

        if self.opts.replay_rewrites {
            self.replay_rewrites(run, &report, executor)?;
        }

        let previous_chain = match mutation {
            Some(Mutation::Chain { index }) => Some(index),
            _ => None,
        };
        record.mutations_added = self.create_mutations(run, &report, previous_chain)?;
        self.mutations.add(record.mutations_added);
        tracing::info!(
            "run {run}: exit {} findings {} (+{} new), queue {}",
            record.exit_code,
            record.findings,
            record.new_findings,
            self.queue.len()
        );
        self.per_run.push(record);
        Ok(())
    }

    fn confirm(&mut self, bug: ConfirmedBug) {
        if self.confirmed_keys.insert(bug.bug_key.clone()) {
            tracing::info!("confirmed {} in run {} (exit {})", bug.bug_key, bug.run, bug.exit_code);
            self.confirmed.push(bug);
        }
    }

    fn replay_rewrites(&mut self, run: usize, report: &AnalysisReport, executor: &mut dyn Executor) -> HbResult<()> {
        let dir = run_dir(self.work_dir, run);
        let rewrites = crate::rewrite_all(&report.trace, &report.results, &dir, &self.confirmed_keys, self.cancel)?;
        for rw in rewrites {
            let (RewriteOutcome::Rewritten, Some(expected), Some(replay_dir)) = (rw.outcome, rw.expected_exit_code, rw.dir)
            else {
                continue;
            };
            let req = ExecRequest {
                run,
                kind: RunKind::Replay,
                trace_out: replay_dir.join("replay"),
                replay_dir: Some(replay_dir),
                fuzzing_data: None,
            };
            let outcome = match executor.execute(&req) {
                Ok(o) => o,
                Err(err) => {
                    tracing::warn!("replay of {} failed: {err}", rw.bug_key);
                    continue;
                }
            };
            let actual = observed_exit_code(&req.trace_out, &outcome);
            if replay_confirmed(expected, actual) {
                self.confirm(ConfirmedBug {
                    run,
                    bug_key: rw.bug_key,
                    code: Some(rw.code),
                    exit_code: actual,
                    by: ConfirmedBy::Replay,
                });
            } else {
                tracing::debug!("replay of {} ended with {actual}, expected {expected}", rw.bug_key);
            }
        }
        Ok(())
    }

    fn push(&mut self, mutation: Mutation) -> bool {
        let label = mutation.family();
        self.queue.push(label, mutation).is_some()
    }

    fn create_mutations(&mut self, run: usize, report: &AnalysisReport, previous_chain: Option<usize>) -> HbResult<MutationCounts> {
        let opts = self.opts;
        let mode = opts.mode;
        let tuning = &opts.tuning;
        self.queue.set_capacity(self.remaining_runs(run + 1));
        let mut added = MutationCounts::default();

        let stats = (mode.is_gfuzz() || mode.is_flow()).then(|| RunStats::collect(&report.trace, report.cases_with_partner));

        if let (true, Some(stats)) = (mode.is_gfuzz(), stats.as_ref()) {
            if self.gfuzz.is_interesting(stats, mode.uses_hb()) {
                let score = self.gfuzz.score(stats, tuning, mode.uses_hb());
                let n = self.gfuzz.number_of_mutations(score);
                let muts = self.gfuzz.select_mutations(stats, tuning, n, &mut self.rng);
                for selects in muts {
                    if self.push(Mutation::Select { selects }) {
                        added.select += 1;
                    }
                }
            } else {
                tracing::debug!("run {run} is not interesting");
            }
        }

        if let (true, Some(stats)) = (mode.is_flow(), stats.as_ref()) {
            let selects = stats.observed_choices();
            for delay in self.gfuzz.flow_mutations(&report.trace, &report.flow) {
                if self.push(Mutation::Flow {
                    selects: selects.clone(),
                    delay,
                }) {
                    added.flow += 1;
                }
            }
        }

        if mode.is_gopie() {
            if run == 0 {
                crate::recreate_dir(&self.work_dir.join(FUZZING_TRACES_DIR))?;
            }
            let room = match self.remaining_runs(run + 1) {
                Some(r) => r.saturating_sub(self.queue.len()),
                None => usize::MAX,
            };
            let written = self.gopie.create_mutations(
                &report.trace,
                mode,
                tuning,
                report.info.any_timeout(),
                previous_chain,
                self.work_dir,
                room,
                &mut self.rng,
                self.cancel,
            )?;
            for index in written {
                if self.push(Mutation::Chain { index }) {
                    added.chain += 1;
                }
            }
        }

        if let Some(stats) = stats {
            self.gfuzz.merge(&stats);
        }
        Ok(added)
    }
}

/// Run a fuzzing session in `work_dir` against `executor`.
pub fn fuzz(
    config: &Config,
    opts: &FuzzOptions,
    work_dir: &Path,
    executor: &mut dyn Executor,
    cancel: &CancelToken,
) -> HbResult<FuzzSummary> {
    if opts.max_runs == 0 || opts.max_runs < -1 {
        return Err(HbError::InvalidArgument(format!(
            "max_runs must be positive or -1, got {}",
            opts.max_runs
        )));
    }
    std::fs::create_dir_all(work_dir)?;
    let started_at = wall_time_iso_utc();
    let started = Instant::now();
    let deadline = Deadline::new(opts.max_time);
    let (rng, seed) = seeded_rng(opts.seed);
    tracing::info!("fuzzing in {} with mode {} (seed {seed})", work_dir.display(), opts.mode);

    let mut session = Session {
        config,
        opts,
        work_dir,
        cancel,
        queue: MutationQueue::new(None),
        gfuzz: GFuzzHistory::new(),
        gopie: GoPieState::new(),
        rng,
        results: ResultSet::new(),
        confirmed: Vec::new(),
        confirmed_keys: BTreeSet::new(),
        mutations: MutationCounts::default(),
        per_run: Vec::new(),
    };

    let mut runs = 0usize;
    let stop = loop {
        if opts.cancel_on_first_bug && !session.confirmed.is_empty() {
            break StopReason::BugFound;
        }
        let mutation = if runs == 0 {
            None
        } else {
            match session.queue.pop() {
                Some(m) => Some(m.payload),
                None => break StopReason::QueueEmpty,
            }
        };
        session.run_once(runs, mutation, executor)?;
        runs += 1;

        if opts.cancel_on_first_bug && !session.confirmed.is_empty() {
            break StopReason::BugFound;
        }
        if opts.max_runs != -1 && runs as i64 >= opts.max_runs {
            break StopReason::MaxRuns;
        }
        if deadline.expired() {
            break StopReason::MaxTime;
        }
    };

    if opts.mode.is_gopie() && !opts.keep_traces {
        let dir = work_dir.join(FUZZING_TRACES_DIR);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
    }
    tracing::info!("finished fuzzing after {runs} runs ({stop:?})");

    let summary = FuzzSummary {
        session_id: uuid::Uuid::new_v4().to_string(),
        mode: opts.mode,
        seed,
        started_at,
        finished_at: wall_time_iso_utc(),
        duration_ms: started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
        runs,
        stop_reason: stop,
        mutations: session.mutations,
        dropped_mutations: session.queue.dropped(),
        confirmed: session.confirmed,
        findings: session.results.into_findings(),
        per_run: session.per_run,
    };
    crate::write_atomic(&work_dir.join(FUZZ_SUMMARY_FILE), &serde_json::to_vec_pretty(&summary)?)?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_families() {
        assert!(FuzzMode::GFuzzHbFlow.is_gfuzz() && FuzzMode::GFuzzHbFlow.is_flow());
        assert!(FuzzMode::Flow.uses_hb() && !FuzzMode::Flow.is_gfuzz());
        assert!(FuzzMode::GoPiePlus.is_gopie() && !FuzzMode::GoPiePlus.uses_hb());
        assert!(!FuzzMode::GFuzz.uses_hb());
        assert_eq!(FuzzMode::default(), FuzzMode::GFuzz);
    }

    #[test]
    fn mode_names_round_trip_through_serde() {
        for mode in <FuzzMode as clap::ValueEnum>::value_variants() {
            let json = serde_json::to_string(mode).expect("serialize");
            assert_eq!(json, format!("\"{}\"", mode.as_str()));
        }
    }

    #[test]
    fn invalid_run_bound_is_rejected() {
        struct Never;
        impl Executor for Never {
            fn execute(&mut self, _: &ExecRequest) -> HbResult<ExecOutcome> {
                unreachable!("no run expected")
            }
        }
        let mut opts = FuzzOptions::from_config(&Config::default());
        opts.max_runs = 0;
        let dir = std::env::temp_dir().join(format!("hbtrace-fuzz-{}", uuid::Uuid::new_v4()));
        let err = fuzz(&Config::default(), &opts, &dir, &mut Never, &CancelToken::new());
        assert!(matches!(err, Err(HbError::InvalidArgument(_))));
    }

    #[test]
    fn exit_code_prefers_trace_info() {
        let dir = std::env::temp_dir().join(format!("hbtrace-fuzz-exit-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("dir");
        let outcome = ExecOutcome { status: Some(1) };
        assert_eq!(observed_exit_code(&dir, &outcome), 1);
        std::fs::write(dir.join(TRACE_INFO_FILE), "ExitCode!30\n").expect("info");
        assert_eq!(observed_exit_code(&dir, &outcome), 30);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
