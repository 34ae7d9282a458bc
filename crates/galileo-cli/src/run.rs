use anyhow::{anyhow, Result};
use chrono::Utc;
use galileo_core::{atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, ensure_dir};
use galileo_runner::{
    Experiment, ExperimentReport, PerfStat, PhaseOutcome, Shell, ShellOptions, ShellReport,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::config::LoadedExperiment;

pub struct RunResult {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub report: ExperimentReport<ShellReport>,
}

/// Shared by every phase closure of one run.
struct RunSettings {
    run_dir: PathBuf,
    capture_output: bool,
    shell: Shell,
}

impl RunSettings {
    fn shell_for(&self, repetition: usize, phase_index: usize, phase: &str) -> Shell {
        if !self.capture_output {
            return self.shell.clone();
        }
        let output_dir = self
            .run_dir
            .join("output")
            .join(format!("rep_{}", repetition))
            .join(format!("{:02}_{}", phase_index, slug(phase)));
        let options = ShellOptions {
            output_dir: Some(output_dir),
            ..self.shell.options().clone()
        };
        self.shell.clone().with_options(options)
    }
}

fn write_run_control(run_dir: &Path, run_id: &str, status: &str) -> Result<()> {
    let payload = json!({
        "schema_version": "run_control_v1",
        "run_id": run_id,
        "status": status,
        "updated_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&run_dir.join("run_control.json"), &payload)
}

/// Marks the run failed unless `complete` is reached.
struct RunControlGuard {
    run_dir: PathBuf,
    run_id: String,
    done: bool,
}

impl RunControlGuard {
    fn new(run_dir: &Path, run_id: &str) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            run_id: run_id.to_string(),
            done: false,
        }
    }

    fn complete(&mut self, status: &str) -> Result<()> {
        write_run_control(&self.run_dir, &self.run_id, status)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunControlGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_run_control(&self.run_dir, &self.run_id, "failed");
        }
    }
}

pub fn run_experiment(
    loaded: &LoadedExperiment,
    repetitions: usize,
    out_root: &Path,
) -> Result<RunResult> {
    if repetitions == 0 {
        return Err(anyhow!("repetitions must be a positive integer"));
    }
    let run_id = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let run_dir = out_root.join(&run_id);
    ensure_dir(&run_dir)?;
    write_run_control(&run_dir, &run_id, "running")?;
    let mut guard = RunControlGuard::new(&run_dir, &run_id);

    atomic_write_json_pretty(&run_dir.join("resolved_experiment.json"), &loaded.resolved)?;
    let digest = canonical_json_digest(&loaded.resolved);
    atomic_write_bytes(
        &run_dir.join("resolved_experiment.digest"),
        digest.as_bytes(),
    )?;
    let manifest = json!({
        "schema_version": "manifest_v1",
        "run_id": run_id,
        "experiment_id": loaded.file.experiment.id,
        "runner_version": format!("rust-{}", env!("CARGO_PKG_VERSION")),
        "repetitions": repetitions,
        "phases": loaded.file.phases.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
        "resolved_digest": digest,
        "created_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&run_dir.join("manifest.json"), &manifest)?;

    let sampler = PerfStat::new(loaded.perf_config());
    let settings = RunSettings {
        run_dir: run_dir.clone(),
        capture_output: loaded.file.engine.capture_output,
        shell: Shell::new(loaded.shell_options()).with_sampler(Arc::new(sampler)),
    };
    let mut experiment: Experiment<RunSettings, ShellReport> = Experiment::new(settings);
    for (index, phase) in loaded.file.phases.iter().enumerate() {
        let specs = loaded.phase_specs(phase)?;
        experiment.add_phase(phase.name.clone(), move |config| {
            if specs.is_empty() {
                return Ok(None);
            }
            let shell = config
                .settings
                .shell_for(config.repetition, index, config.phase);
            Ok(Some(shell.run(&specs)?))
        });
    }

    info!(run_id = %run_id, repetitions, "experiment started");
    let report = experiment.run(repetitions)?;
    atomic_write_json_pretty(&run_dir.join("report.json"), &report_to_json(&report)?)?;
    guard.complete("completed")?;
    info!(run_id = %run_id, failures = report.failures().count(), "experiment finished");

    Ok(RunResult {
        run_id,
        run_dir,
        report,
    })
}

pub fn report_to_json(report: &ExperimentReport<ShellReport>) -> Result<Value> {
    Ok(serde_json::to_value(report)?)
}

pub fn print_report(report: &ExperimentReport<ShellReport>) {
    for run in &report.runs {
        println!("repetition: {}", run.repetition);
        for phase in &run.phases {
            match &phase.outcome {
                PhaseOutcome::Completed(shell) => {
                    println!("  {}: completed in {:?}", phase.name, shell.elapsed);
                    for outcome in &shell.outcomes {
                        println!("    {}", outcome);
                    }
                }
                PhaseOutcome::NoResult => println!("  {}: no result", phase.name),
                PhaseOutcome::Failed(message) => println!("  {}: failed: {}", phase.name, message),
            }
        }
    }
}

fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}
