//! Hardware counter sampling attached to a running process.
//!
//! [`PerfStat`] drives `perf stat` in attach mode. Any other collector can be
//! plugged into the shell through [`CounterSampler`].

use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use galileo_core::CounterReport;
use tracing::debug;

/// Opens counter sessions against live processes.
pub trait CounterSampler: Send + Sync {
    fn attach(&self, pid: u32) -> Result<Box<dyn CounterSession>>;
}

/// A counter session bound to one process.
pub trait CounterSession: Send {
    fn is_running(&mut self) -> bool;

    /// Ends sampling and returns what was collected.
    fn stop(self: Box<Self>) -> Result<CounterReport>;
}

#[derive(Debug, Clone)]
pub struct PerfConfig {
    pub binary: PathBuf,
    /// Empty means the collector's default event set.
    pub events: Vec<String>,
    /// Report every `interval` instead of once at the end.
    pub interval: Option<Duration>,
    /// Where collector output files go; the system temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
    /// How long to wait for the collector to flush after it is interrupted.
    pub stop_timeout: Duration,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("perf"),
            events: Vec::new(),
            interval: None,
            scratch_dir: None,
            stop_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PerfStat {
    config: PerfConfig,
}

impl PerfStat {
    pub fn new(config: PerfConfig) -> Self {
        Self { config }
    }

    fn command(&self, pid: u32, output: &std::path::Path) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("stat").arg("-x").arg(",").arg("-o").arg(output);
        cmd.arg("-p").arg(pid.to_string());
        if !self.config.events.is_empty() {
            cmd.arg("-e").arg(self.config.events.join(","));
        }
        if let Some(interval) = self.config.interval {
            cmd.arg("-I").arg(interval.as_millis().max(1).to_string());
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

impl CounterSampler for PerfStat {
    fn attach(&self, pid: u32) -> Result<Box<dyn CounterSession>> {
        let dir = self
            .config
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating perf scratch dir {}", dir.display()))?;
        let output = dir.join(format!(
            "galileo-perf-{}-{}.csv",
            pid,
            Utc::now().timestamp_micros()
        ));
        let child = self.command(pid, &output).spawn().with_context(|| {
            format!("launching {} stat", self.config.binary.display())
        })?;
        debug!(pid, collector_pid = child.id(), "perf session attached");
        Ok(Box::new(PerfSession {
            child: Some(child),
            output,
            interval: self.config.interval.is_some(),
            stop_timeout: self.config.stop_timeout,
        }))
    }
}

struct PerfSession {
    child: Option<Child>,
    output: PathBuf,
    interval: bool,
    stop_timeout: Duration,
}

impl PerfSession {
    /// Interrupts the collector (it flushes on SIGINT) and reaps it. Returns
    /// the exit status if the collector had already finished on its own.
    fn finish(&mut self) -> Result<Option<std::process::ExitStatus>> {
        let mut child = match self.child.take() {
            Some(child) => child,
            None => return Ok(None),
        };
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        interrupt(&mut child);
        let deadline = Instant::now() + self.stop_timeout;
        while Instant::now() < deadline {
            if child.try_wait()?.is_some() {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(10));
        }
        let _ = child.kill();
        child.wait()?;
        Ok(None)
    }
}

impl CounterSession for PerfSession {
    fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn stop(mut self: Box<Self>) -> Result<CounterReport> {
        let stderr = self.child.as_mut().and_then(|c| c.stderr.take());
        let exited_on_its_own = self.finish()?;
        let text = fs::read_to_string(&self.output).unwrap_or_default();
        let _ = fs::remove_file(&self.output);
        if let Some(status) = exited_on_its_own {
            if !status.success() {
                let detail = stderr
                    .and_then(|mut pipe| {
                        let mut buf = String::new();
                        std::io::Read::read_to_string(&mut pipe, &mut buf).ok()?;
                        buf.lines()
                            .rev()
                            .find(|l| !l.trim().is_empty())
                            .map(|l| l.trim().to_string())
                    })
                    .unwrap_or_else(|| format!("collector exited with {}", status));
                return Err(anyhow!("perf stat failed: {}", detail));
            }
        }
        let report = parse_perf_csv(&text, self.interval);
        if report.is_empty() {
            return Err(anyhow!("perf stat produced no counter values"));
        }
        Ok(report)
    }
}

impl Drop for PerfSession {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    if crate::process::send_signal(child.id(), libc::SIGINT).is_err() {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    let _ = child.kill();
}

/// Parses `perf stat -x,` output. Plain rows are `value,unit,event,...`;
/// interval rows carry a leading timestamp column. Rows whose value is not a
/// number (`<not counted>`, `<not supported>`) are skipped.
pub fn parse_perf_csv(text: &str, interval: bool) -> CounterReport {
    let mut report = CounterReport::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(',');
        if interval {
            fields.next();
        }
        let value = fields.next().map(str::trim);
        let _unit = fields.next();
        let event = fields.next().map(str::trim);
        match (value.and_then(|v| v.parse::<f64>().ok()), event) {
            (Some(value), Some(event)) if !event.is_empty() => report.push(event, value),
            _ => {}
        }
    }
    report
}
