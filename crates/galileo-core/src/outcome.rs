use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitStatus {
    Exited { code: i32 },
    Signaled { signal: i32 },
    /// A run_for deadline fired. `forced` is set when the grace period ran out
    /// and the process had to be killed.
    TerminatedByDeadline { forced: bool },
    FailedToStart { reason: String },
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited { code: 0 })
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited { code } => Some(*code),
            _ => None,
        }
    }

    pub fn failed_to_start(&self) -> bool {
        matches!(self, ExitStatus::FailedToStart { .. })
    }

    pub fn terminated_by_deadline(&self) -> bool {
        matches!(self, ExitStatus::TerminatedByDeadline { .. })
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited { code } => write!(f, "exited({})", code),
            ExitStatus::Signaled { signal } => write!(f, "signaled({})", signal),
            ExitStatus::TerminatedByDeadline { forced: false } => f.write_str("deadline"),
            ExitStatus::TerminatedByDeadline { forced: true } => f.write_str("deadline(killed)"),
            ExitStatus::FailedToStart { reason } => write!(f, "failed_to_start({})", reason),
        }
    }
}

/// Counter name to the value(s) the collector reported for it, in report order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CounterReport {
    counters: BTreeMap<String, Vec<f64>>,
}

impl CounterReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, counter: impl Into<String>, value: f64) {
        self.counters.entry(counter.into()).or_default().push(value);
    }

    pub fn get(&self, counter: &str) -> Option<&[f64]> {
        self.counters.get(counter).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.counters.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Instrumentation {
    Sampled { counters: CounterReport },
    Unavailable { reason: String },
}

impl Instrumentation {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Instrumentation::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn counters(&self) -> Option<&CounterReport> {
        match self {
            Instrumentation::Sampled { counters } => Some(counters),
            Instrumentation::Unavailable { .. } => None,
        }
    }
}

/// Terminal result of one executed node.
///
/// Modifier nodes carry their child's status and timestamps; `started_at` is
/// the moment the branch's process was spawned, `None` if it never was.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub status: ExitStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub node: OutcomeNode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutcomeNode {
    Command {
        command: String,
        pid: Option<u32>,
        /// Time from the shell epoch to the spawn.
        #[serde(serialize_with = "opt_secs")]
        launched_after: Option<Duration>,
        #[serde(serialize_with = "secs")]
        runtime: Duration,
        stdout: Option<PathBuf>,
        stderr: Option<PathBuf>,
    },
    Delay {
        #[serde(serialize_with = "secs")]
        offset: Duration,
        child: Box<Outcome>,
    },
    RunFor {
        #[serde(serialize_with = "secs")]
        duration: Duration,
        deadline_fired: bool,
        child: Box<Outcome>,
    },
    Perf {
        instrumentation: Instrumentation,
        child: Box<Outcome>,
    },
}

impl Outcome {
    pub fn child(&self) -> Option<&Outcome> {
        match &self.node {
            OutcomeNode::Command { .. } => None,
            OutcomeNode::Delay { child, .. }
            | OutcomeNode::RunFor { child, .. }
            | OutcomeNode::Perf { child, .. } => Some(child),
        }
    }

    /// The command node at the bottom of this branch.
    pub fn leaf(&self) -> &Outcome {
        let mut node = self;
        while let Some(child) = node.child() {
            node = child;
        }
        node
    }

    pub fn launched_after(&self) -> Option<Duration> {
        match &self.leaf().node {
            OutcomeNode::Command { launched_after, .. } => *launched_after,
            _ => None,
        }
    }

    pub fn runtime(&self) -> Duration {
        match &self.leaf().node {
            OutcomeNode::Command { runtime, .. } => *runtime,
            _ => Duration::ZERO,
        }
    }

    /// Instrumentation of the outermost perf node on this branch.
    pub fn instrumentation(&self) -> Option<&Instrumentation> {
        let mut node = Some(self);
        while let Some(current) = node {
            if let OutcomeNode::Perf {
                instrumentation, ..
            } = &current.node
            {
                return Some(instrumentation);
            }
            node = current.child();
        }
        None
    }

    pub fn counters(&self) -> Option<&CounterReport> {
        self.instrumentation().and_then(Instrumentation::counters)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            OutcomeNode::Command { command, .. } => write!(f, "{} => {}", command, self.status),
            OutcomeNode::Delay { offset, child } => write!(f, "delay({:?}, {})", offset, child),
            OutcomeNode::RunFor {
                duration,
                deadline_fired,
                child,
            } => {
                let marker = if *deadline_fired { "!" } else { "" };
                write!(f, "run_for({:?}{}, {})", duration, marker, child)
            }
            OutcomeNode::Perf {
                instrumentation,
                child,
            } => match instrumentation {
                Instrumentation::Sampled { counters } => {
                    write!(f, "perf[{} counters]({})", counters.len(), child)
                }
                Instrumentation::Unavailable { .. } => write!(f, "perf[unavailable]({})", child),
            },
        }
    }
}

fn secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

fn opt_secs<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_some(&d.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}
