mod config;
mod run;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use galileo_runner::{
    delay, perf, run_for, Invocation, PerfConfig, PerfStat, ProcessSpec, Shell, ShellOptions,
    ShellReport,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::config::{load_experiment, seconds_to_duration, LoadedExperiment};

#[derive(Parser)]
#[command(name = "galileo", version, about = "Timed process orchestration for performance experiments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every phase of an experiment file.
    Run {
        experiment: PathBuf,
        #[arg(long)]
        repetitions: Option<usize>,
        #[arg(long, default_value = ".galileo/runs")]
        out: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print the phases and process trees of an experiment file.
    Describe {
        experiment: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Run a single command through the engine.
    Shell {
        #[arg(long)]
        delay: Option<f64>,
        #[arg(long)]
        run_for: Option<f64>,
        #[arg(long)]
        perf: bool,
        #[arg(long = "event")]
        events: Vec<String>,
        #[arg(long, default_value_t = 1000)]
        grace_ms: u64,
        #[arg(long)]
        json: bool,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            experiment,
            repetitions,
            out,
            json,
        } => {
            let loaded = load_experiment(&experiment)?;
            let repetitions = repetitions.unwrap_or_else(|| loaded.repetitions());
            if repetitions == 0 {
                return Err(anyhow!("--repetitions must be a positive integer"));
            }
            let result = run::run_experiment(&loaded, repetitions, &out)?;
            let failures: Vec<Value> = result
                .report
                .failures()
                .map(|(repetition, phase, message)| {
                    json!({"repetition": repetition, "phase": phase, "message": message})
                })
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "summary": summary_to_json(&loaded),
                    "run": {
                        "run_id": result.run_id,
                        "run_dir": result.run_dir.display().to_string(),
                        "repetitions": repetitions,
                    },
                    "failures": failures,
                })));
            }
            print_summary(&loaded);
            run::print_report(&result.report);
            println!("run_id: {}", result.run_id);
            println!("run_dir: {}", result.run_dir.display());
            println!("failed_phases: {}", failures.len());
        }
        Commands::Describe { experiment, json } => {
            let loaded = load_experiment(&experiment)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&loaded),
                })));
            }
            print_summary(&loaded);
        }
        Commands::Shell {
            delay: delay_secs,
            run_for: run_for_secs,
            perf: with_perf,
            events,
            grace_ms,
            json,
            command,
        } => {
            let (program, args) = command
                .split_first()
                .ok_or_else(|| anyhow!("missing command"))?;
            let mut spec: ProcessSpec = Invocation::new(program).args(args.iter().cloned()).into();
            if with_perf {
                spec = perf(spec);
            }
            if let Some(secs) = run_for_secs {
                spec = run_for(seconds_to_duration(secs, "--run-for")?, spec);
            }
            if let Some(secs) = delay_secs {
                spec = delay(seconds_to_duration(secs, "--delay")?, spec);
            }
            let sampler = PerfStat::new(PerfConfig {
                events,
                ..PerfConfig::default()
            });
            let shell = Shell::new(ShellOptions {
                grace_period: std::time::Duration::from_millis(grace_ms),
                ..ShellOptions::default()
            })
            .with_sampler(Arc::new(sampler));
            let report = shell.run(&[spec])?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "shell",
                    "report": serde_json::to_value(&report)?,
                })));
            }
            print_shell_report(&report);
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Shell { json, .. } => *json,
    }
}

fn summary_to_json(loaded: &LoadedExperiment) -> Value {
    let phases: Vec<Value> = loaded
        .file
        .phases
        .iter()
        .map(|phase| {
            let specs: Vec<String> = loaded
                .phase_specs(phase)
                .map(|specs| specs.iter().map(ToString::to_string).collect())
                .unwrap_or_default();
            json!({ "name": phase.name, "shell": specs })
        })
        .collect();
    json!({
        "experiment": loaded.file.experiment.id,
        "repetitions": loaded.repetitions(),
        "grace_period_ms": loaded.shell_options().grace_period.as_millis() as u64,
        "perf_binary": loaded.perf_config().binary.display().to_string(),
        "perf_events": loaded.file.perf.events,
        "capture_output": loaded.file.engine.capture_output,
        "phases": phases,
    })
}

fn print_summary(loaded: &LoadedExperiment) {
    println!("experiment: {}", loaded.file.experiment.id);
    println!("repetitions: {}", loaded.repetitions());
    println!(
        "grace_period: {:?}",
        loaded.shell_options().grace_period
    );
    if !loaded.file.perf.events.is_empty() {
        println!("perf_events: {}", loaded.file.perf.events.join(","));
    }
    println!("phases: {}", loaded.file.phases.len());
    for phase in &loaded.file.phases {
        println!("  {}", phase.name);
        match loaded.phase_specs(phase) {
            Ok(specs) if specs.is_empty() => println!("    (no processes)"),
            Ok(specs) => {
                for spec in specs {
                    println!("    {}", spec);
                }
            }
            Err(err) => println!("    invalid: {:#}", err),
        }
    }
}

fn print_shell_report(report: &ShellReport) {
    println!("epoch: {}", report.epoch.to_rfc3339());
    println!("elapsed: {:?}", report.elapsed);
    for outcome in &report.outcomes {
        println!("{}", outcome);
        if let Some(counters) = outcome.counters() {
            for name in counters.names() {
                println!("  {}: {:?}", name, counters.get(name).unwrap_or_default());
            }
        }
    }
}
