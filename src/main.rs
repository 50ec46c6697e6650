//! hbtrace CLI entrypoint.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use hbtrace::{AnalysisOptions, CancelToken, CommandExecutor, Config, FuzzMode, FuzzOptions, Severity};

#[derive(Debug, Parser)]
#[command(name = "hbtrace")]
#[command(about = "happens-before analysis, trace rewriting and schedule fuzzing for recorded concurrent runs")]
struct Cli {
    /// Path to config file. Missing configs are treated as "defaults".
    #[arg(long, global = true, default_value = "hbtrace.toml")]
    config: PathBuf,

    /// Working directory for execution.
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    /// Log level.
    #[arg(long, global = true, default_value = "info")]
    log: String,

    /// Machine-readable output to stdout (JSON).
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Args)]
struct AnalysisArgs {
    /// Order buffered channel operations of one routine as FIFO.
    #[arg(long)]
    fifo: bool,

    /// Atomic reads do not sync with the last write.
    #[arg(long)]
    ignore_critical_sections: bool,

    /// Skip atomic records while reading.
    #[arg(long)]
    ignore_atomics: bool,

    /// Report only bugs that actually happened.
    #[arg(long)]
    only_actual: bool,
}

impl AnalysisArgs {
    fn apply(&self, config: &mut Config) -> AnalysisOptions {
        config.analysis.fifo |= self.fifo;
        config.analysis.ignore_critical_sections |= self.ignore_critical_sections;
        config.analysis.ignore_atomics |= self.ignore_atomics;
        let mut opts = AnalysisOptions::from_config(&config.analysis);
        opts.only_actual |= self.only_actual;
        opts
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Analyse a recorded trace directory and write the result files next to it
    Analyze {
        trace_dir: PathBuf,

        #[command(flatten)]
        analysis: AnalysisArgs,

        /// Do not write results_machine.log / results_readable.log.
        #[arg(long)]
        no_write: bool,
    },

    /// Analyse a trace directory and rewrite every rewritable finding
    Rewrite {
        trace_dir: PathBuf,

        /// Directory receiving rewritten_trace_<n>/ (default: the trace directory).
        #[arg(long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        analysis: AnalysisArgs,
    },

    /// Drive the recorder through a fuzzing session
    Fuzz {
        #[arg(long)]
        mode: Option<FuzzMode>,

        /// Maximum number of runs; -1 is unbounded.
        #[arg(long, allow_hyphen_values = true)]
        runs: Option<i64>,

        /// Wall-clock limit in seconds.
        #[arg(long)]
        time: Option<u64>,

        #[arg(long)]
        seed: Option<u64>,

        /// Tuning overrides, e.g. GFuzzW1=4,GoPieBound=5.
        #[arg(long)]
        settings: Option<String>,

        #[arg(long)]
        cancel_on_first_bug: bool,

        /// Do not replay rewritten traces.
        #[arg(long)]
        no_replay: bool,

        /// Keep fuzzingTraces/ after the session.
        #[arg(long)]
        keep_traces: bool,

        /// Session directory (default: <base_dir>/fuzz).
        #[arg(long)]
        work_dir: Option<PathBuf>,

        #[command(flatten)]
        analysis: AnalysisArgs,

        /// Recorder argv, overriding fuzzing.recorder.command.
        #[arg(last = true)]
        recorder: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_tracing(&cli.log) {
        eprintln!("warning: failed to init tracing: {err:#}");
    }

    if let Some(cwd) = &cli.cwd {
        if let Err(err) = std::env::set_current_dir(cwd) {
            return print_error_and_exit(&cli, anyhow::anyhow!(err).context(format!("failed to set cwd to {}", cwd.display())));
        }
    }

    let config = Config::load_optional(&cli.config);

    match run_command(&cli, config) {
        Ok(code) => code,
        Err(err) => print_error_and_exit(&cli, err),
    }
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

fn run_command(cli: &Cli, mut config: Config) -> anyhow::Result<ExitCode> {
    let cancel = CancelToken::new();
    match &cli.command {
        Command::Analyze {
            trace_dir,
            analysis,
            no_write,
        } => {
            let opts = analysis.apply(&mut config);
            let report = hbtrace::analyze_trace_dir(trace_dir, &config, opts, &cancel, !*no_write)
                .with_context(|| format!("failed to analyse {}", trace_dir.display()))?;
            if cli.json {
                print_json(&report.summary)?;
            } else {
                println!("{}", report.summary.pretty());
            }
            Ok(exit_code_for_findings(report.results.findings()))
        }

        Command::Rewrite {
            trace_dir,
            out,
            analysis,
        } => {
            let opts = analysis.apply(&mut config);
            let report = hbtrace::analyze_trace_dir(trace_dir, &config, opts, &cancel, true)
                .with_context(|| format!("failed to analyse {}", trace_dir.display()))?;
            let base = out.clone().unwrap_or_else(|| trace_dir.clone());
            let rewrites = hbtrace::rewrite_all(&report.trace, &report.results, &base, &BTreeSet::new(), &cancel)
                .with_context(|| format!("failed to rewrite into {}", base.display()))?;
            if cli.json {
                print_json(&rewrites)?;
            } else {
                for rw in &rewrites {
                    match (&rw.dir, rw.expected_exit_code) {
                        (Some(dir), Some(code)) => println!("{} -> {} (expect exit {code})", rw.code, dir.display()),
                        _ => println!(
                            "{} {:?}{}",
                            rw.code,
                            rw.outcome,
                            rw.reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
                        ),
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Fuzz {
            mode,
            runs,
            time,
            seed,
            settings,
            cancel_on_first_bug,
            no_replay,
            keep_traces,
            work_dir,
            analysis,
            recorder,
        } => {
            if let Some(raw) = settings {
                config.fuzzing.tuning.apply_settings(raw).context("invalid --settings")?;
            }
            if !recorder.is_empty() {
                config.fuzzing.recorder.command = recorder.clone();
            }
            let analysis_opts = analysis.apply(&mut config);
            let mut opts = FuzzOptions::from_config(&config);
            opts.analysis = analysis_opts;
            if let Some(mode) = mode {
                opts.mode = *mode;
            }
            if let Some(runs) = runs {
                opts.max_runs = *runs;
            }
            if let Some(secs) = time {
                opts.max_time = Some(Duration::from_secs(*secs));
            }
            if seed.is_some() {
                opts.seed = *seed;
            }
            opts.cancel_on_first_bug |= *cancel_on_first_bug;
            opts.replay_rewrites = !*no_replay;
            opts.keep_traces = *keep_traces;

            let work_dir = work_dir.clone().unwrap_or_else(|| config.base_dir.join("fuzz"));
            let mut executor = CommandExecutor::new(&config.fuzzing.recorder)?;
            let summary = hbtrace::fuzz(&config, &opts, &work_dir, &mut executor, &cancel)
                .with_context(|| format!("fuzzing session in {} failed", work_dir.display()))?;
            if cli.json {
                print_json(&summary)?;
            } else {
                println!("{}", summary.pretty());
            }
            Ok(if summary.confirmed.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn print_error_and_exit(cli: &Cli, err: anyhow::Error) -> ExitCode {
    let msg = format!("{err:#}");
    if cli.json {
        let out = serde_json::json!({
            "status": "error",
            "code": "error",
            "message": msg,
        });
        println!("{out}");
    } else {
        eprintln!("{msg}");
    }
    ExitCode::from(2)
}

/// 1 when anything critical was found.
fn exit_code_for_findings(findings: &[hbtrace::Finding]) -> ExitCode {
    if findings.iter().any(|f| f.code.severity() == Severity::Critical) {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}
