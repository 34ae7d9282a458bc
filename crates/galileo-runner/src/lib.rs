//! Execution engine and experiment runner for timed process trees.
//!
//! ```no_run
//! use std::time::Duration;
//! use galileo_runner::{delay, perf, run_for, shell, ProcessSpec};
//!
//! # fn main() -> anyhow::Result<()> {
//! let server = ProcessSpec::command("./memcached")?;
//! let load = ProcessSpec::command("./mutilate -s 127.0.0.1 -t 25")?;
//! let report = shell(&[
//!     perf(run_for(Duration::from_secs(30), server)),
//!     delay(Duration::from_secs(3), run_for(Duration::from_secs(25), load)),
//! ])?;
//! for outcome in &report.outcomes {
//!     println!("{}", outcome);
//! }
//! # Ok(())
//! # }
//! ```

pub mod experiment;
pub mod perf;
mod process;
pub mod shell;

pub use experiment::{
    Configuration, Experiment, ExperimentReport, ExperimentRun, PhaseOutcome, PhaseRecord,
    DEFAULT_REPETITIONS,
};
pub use galileo_core::{
    delay, perf, run_for, CounterReport, ExitStatus, Instrumentation, Invocation, Outcome,
    OutcomeNode, ProcessSpec, SpecError,
};
pub use perf::{CounterSampler, CounterSession, PerfConfig, PerfStat};
pub use shell::{shell, Shell, ShellError, ShellOptions, ShellReport};
