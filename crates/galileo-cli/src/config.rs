use anyhow::{anyhow, Context, Result};
use galileo_runner::{
    delay, perf, run_for, Invocation, PerfConfig, ProcessSpec, ShellOptions, DEFAULT_REPETITIONS,
};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentFile {
    pub experiment: ExperimentSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub perf: PerfSection,
    #[serde(default)]
    pub phases: Vec<PhaseSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentSection {
    pub id: String,
    #[serde(default)]
    pub repetitions: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    #[serde(default)]
    pub grace_period_ms: Option<u64>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub capture_output: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerfSection {
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseSection {
    pub name: String,
    #[serde(default)]
    pub shell: Vec<SpecNode>,
}

/// One node of a process tree as written in an experiment file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecNode {
    Command(CommandNode),
    Delay { seconds: f64, spec: Box<SpecNode> },
    RunFor { seconds: f64, spec: Box<SpecNode> },
    Perf(Box<SpecNode>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandNode {
    Line(String),
    Detailed {
        line: String,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
}

pub struct LoadedExperiment {
    pub file: ExperimentFile,
    /// The file as JSON, for persisting alongside results.
    pub resolved: Value,
    /// Directory relative `cwd` entries are resolved against.
    pub base_dir: PathBuf,
}

pub fn load_experiment(path: &Path) -> Result<LoadedExperiment> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading experiment file {}", path.display()))?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw)?;
    let resolved: Value = serde_json::to_value(yaml_value)?;
    let file: ExperimentFile = serde_json::from_value(resolved.clone())
        .with_context(|| format!("invalid experiment file {}", path.display()))?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let loaded = LoadedExperiment {
        file,
        resolved,
        base_dir,
    };
    loaded.validate()?;
    Ok(loaded)
}

impl LoadedExperiment {
    fn validate(&self) -> Result<()> {
        if self.file.experiment.repetitions == Some(0) {
            return Err(anyhow!("/experiment/repetitions must be a positive integer"));
        }
        for phase in &self.file.phases {
            self.phase_specs(phase)
                .with_context(|| format!("phase '{}'", phase.name))?;
        }
        Ok(())
    }

    pub fn repetitions(&self) -> usize {
        self.file
            .experiment
            .repetitions
            .unwrap_or(DEFAULT_REPETITIONS)
    }

    pub fn shell_options(&self) -> ShellOptions {
        let defaults = ShellOptions::default();
        let engine = &self.file.engine;
        ShellOptions {
            grace_period: engine
                .grace_period_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.grace_period),
            poll_interval: engine
                .poll_interval_ms
                .map(|ms| Duration::from_millis(ms.max(1)))
                .unwrap_or(defaults.poll_interval),
            output_dir: None,
        }
    }

    pub fn perf_config(&self) -> PerfConfig {
        let defaults = PerfConfig::default();
        let perf = &self.file.perf;
        PerfConfig {
            binary: perf.binary.clone().unwrap_or(defaults.binary),
            events: perf.events.clone(),
            interval: perf.interval_ms.map(Duration::from_millis),
            ..defaults
        }
    }

    pub fn phase_specs(&self, phase: &PhaseSection) -> Result<Vec<ProcessSpec>> {
        phase
            .shell
            .iter()
            .map(|node| build_spec(node, &self.base_dir))
            .collect()
    }
}

pub fn build_spec(node: &SpecNode, base_dir: &Path) -> Result<ProcessSpec> {
    Ok(match node {
        SpecNode::Command(CommandNode::Line(line)) => ProcessSpec::command(line)?,
        SpecNode::Command(CommandNode::Detailed { line, cwd }) => {
            let mut invocation = Invocation::parse(line)?;
            if let Some(cwd) = cwd {
                invocation = invocation.current_dir(base_dir.join(cwd));
            }
            invocation.into()
        }
        SpecNode::Delay { seconds, spec } => delay(
            seconds_to_duration(*seconds, "delay")?,
            build_spec(spec, base_dir)?,
        ),
        SpecNode::RunFor { seconds, spec } => run_for(
            seconds_to_duration(*seconds, "run_for")?,
            build_spec(spec, base_dir)?,
        ),
        SpecNode::Perf(spec) => perf(build_spec(spec, base_dir)?),
    })
}

pub fn seconds_to_duration(seconds: f64, field: &str) -> Result<Duration> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(anyhow!(
            "{} seconds must be a finite, non-negative number (got {})",
            field,
            seconds
        ));
    }
    Duration::try_from_secs_f64(seconds).map_err(|e| anyhow!("{} seconds: {}", field, e))
}
