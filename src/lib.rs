//! hbtrace core library: trace model, happens-before analysis, rewriting and fuzzing.

#[path = "analysis/analyzer.rs"]
mod analyzer;
#[path = "platform/cancel.rs"]
mod cancel;
#[path = "runtime/clock.rs"]
mod clock;
#[path = "analysis/closed.rs"]
mod closed;
#[path = "platform/config.rs"]
mod config;
#[path = "analysis/deadlock.rs"]
mod deadlock;
#[path = "model/element.rs"]
mod element;
#[path = "platform/error.rs"]
mod error;
#[path = "runtime/executor.rs"]
mod executor;
#[path = "analysis/exitcode.rs"]
mod exitcode;
#[path = "analysis/flow.rs"]
mod flow;
#[path = "platform/fsutil.rs"]
mod fsutil;
#[path = "modes/fuzz.rs"]
mod fuzz;
#[path = "modes/gfuzz.rs"]
mod gfuzz;
#[path = "modes/gopie.rs"]
mod gopie;
#[path = "analysis/leak.rs"]
mod leak;
#[path = "runtime/reader.rs"]
mod reader;
#[path = "model/reporting.rs"]
mod reporting;
#[path = "rewrite/rewriter.rs"]
mod rewriter;
#[path = "runtime/scheduler.rs"]
mod scheduler;
#[path = "analysis/select_partner.rs"]
mod select_partner;
#[path = "model/trace.rs"]
mod trace;
#[path = "model/vclock.rs"]
mod vclock;
#[path = "runtime/writer.rs"]
mod writer;

pub use analyzer::*;
pub use cancel::*;
pub use clock::*;
pub use config::*;
pub use element::*;
pub use error::*;
pub use executor::*;
pub use exitcode::*;
pub use flow::*;
pub use fsutil::*;
pub use fuzz::*;
pub use gfuzz::*;
pub use gopie::*;
pub use reader::*;
pub use reporting::*;
pub use rewriter::*;
pub use scheduler::*;
pub use trace::*;
pub use vclock::*;
pub use writer::*;

use deadlock::*;
use leak::*;
use select_partner::*;
