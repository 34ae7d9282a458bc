//! Named phases run in registration order, repeated N times.

use std::panic::{self, AssertUnwindSafe};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

pub const DEFAULT_REPETITIONS: usize = 3;

/// What a phase function sees when it is invoked.
#[derive(Debug)]
pub struct Configuration<'a, C> {
    /// Zero-based repetition index.
    pub repetition: usize,
    pub phase: &'a str,
    pub settings: &'a C,
}

type PhaseFn<C, R> = Box<dyn Fn(&Configuration<'_, C>) -> Result<Option<R>>>;

struct Phase<C, R> {
    name: String,
    run: PhaseFn<C, R>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum PhaseOutcome<R> {
    Completed(R),
    NoResult,
    /// The phase returned an error or panicked.
    Failed(String),
}

impl<R> PhaseOutcome<R> {
    pub fn is_failed(&self) -> bool {
        matches!(self, PhaseOutcome::Failed(_))
    }

    pub fn result(&self) -> Option<&R> {
        match self {
            PhaseOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord<R> {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: PhaseOutcome<R>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentRun<R> {
    pub repetition: usize,
    pub phases: Vec<PhaseRecord<R>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentReport<R> {
    pub runs: Vec<ExperimentRun<R>>,
}

impl<R> ExperimentReport<R> {
    /// `(repetition, phase name, message)` for every failed phase.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &str, &str)> {
        self.runs.iter().flat_map(|run| {
            run.phases.iter().filter_map(move |phase| match &phase.outcome {
                PhaseOutcome::Failed(message) => {
                    Some((run.repetition, phase.name.as_str(), message.as_str()))
                }
                _ => None,
            })
        })
    }
}

/// An ordered registry of phases plus the settings handed to each of them.
pub struct Experiment<C, R> {
    settings: C,
    phases: Vec<Phase<C, R>>,
}

impl<C, R> Experiment<C, R> {
    pub fn new(settings: C) -> Self {
        Self {
            settings,
            phases: Vec::new(),
        }
    }

    /// Appends a phase. Names need not be unique.
    pub fn add_phase<F>(&mut self, name: impl Into<String>, phase: F) -> &mut Self
    where
        F: Fn(&Configuration<'_, C>) -> Result<Option<R>> + 'static,
    {
        self.phases.push(Phase {
            name: name.into(),
            run: Box::new(phase),
        });
        self
    }

    pub fn phase_names(&self) -> impl Iterator<Item = &str> {
        self.phases.iter().map(|p| p.name.as_str())
    }

    pub fn run_default(&self) -> Result<ExperimentReport<R>> {
        self.run(DEFAULT_REPETITIONS)
    }

    /// Runs every phase once per repetition, strictly in order. A failing
    /// phase is recorded and the next one runs.
    pub fn run(&self, repetitions: usize) -> Result<ExperimentReport<R>> {
        if repetitions == 0 {
            return Err(anyhow!("repetitions must be a positive integer"));
        }
        let mut runs = Vec::with_capacity(repetitions);
        for repetition in 0..repetitions {
            info!(repetition, phases = self.phases.len(), "repetition started");
            let phases = self
                .phases
                .iter()
                .map(|phase| self.run_phase(phase, repetition))
                .collect();
            runs.push(ExperimentRun { repetition, phases });
        }
        Ok(ExperimentReport { runs })
    }

    fn run_phase(&self, phase: &Phase<C, R>, repetition: usize) -> PhaseRecord<R> {
        let config = Configuration {
            repetition,
            phase: &phase.name,
            settings: &self.settings,
        };
        info!(repetition, phase = %phase.name, "phase started");
        let started_at = Utc::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| (phase.run)(&config)));
        let outcome = match result {
            Ok(Ok(Some(value))) => PhaseOutcome::Completed(value),
            Ok(Ok(None)) => PhaseOutcome::NoResult,
            Ok(Err(err)) => PhaseOutcome::Failed(format!("{:#}", err)),
            Err(payload) => PhaseOutcome::Failed(panic_message(payload.as_ref())),
        };
        let ended_at = Utc::now();
        match &outcome {
            PhaseOutcome::Failed(message) => {
                warn!(repetition, phase = %phase.name, error = %message, "phase failed")
            }
            _ => info!(repetition, phase = %phase.name, "phase finished"),
        }
        PhaseRecord {
            name: phase.name.clone(),
            started_at,
            ended_at,
            outcome,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
