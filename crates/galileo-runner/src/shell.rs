//! Concurrent execution of process trees.
//!
//! Every top-level spec gets its own supervising thread inside one
//! `std::thread::scope`, so [`Shell::run`] cannot return while any branch is
//! still running. All branches share the epoch taken when the call begins;
//! `delay` offsets are measured from it.

use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use galileo_core::{ExitStatus, Instrumentation, Invocation, Outcome, OutcomeNode, ProcessSpec};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::perf::{CounterSampler, CounterSession, PerfStat};
use crate::process::{self, ChildGuard, Exit};

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("resources exhausted launching `{command}`: {source}")]
    ResourceExhausted {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn supervisor for branch {branch}: {source}")]
    Supervisor {
        branch: usize,
        #[source]
        source: io::Error,
    },
    #[error("lost track of `{command}` while waiting for it: {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("supervisor for branch {0} panicked")]
    BranchPanicked(usize),
}

#[derive(Debug, Clone)]
pub struct ShellOptions {
    /// Time between the termination request and the forced kill.
    pub grace_period: Duration,
    /// How often supervisors check on their process.
    pub poll_interval: Duration,
    /// When set, stdout/stderr of each process go to files in this directory
    /// instead of being inherited.
    pub output_dir: Option<PathBuf>,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShellReport {
    pub epoch: DateTime<Utc>,
    #[serde(serialize_with = "secs")]
    pub elapsed: Duration,
    /// One outcome tree per input spec, in input order.
    pub outcomes: Vec<Outcome>,
}

#[derive(Clone)]
pub struct Shell {
    options: ShellOptions,
    sampler: Arc<dyn CounterSampler>,
}

impl Default for Shell {
    fn default() -> Self {
        Self::new(ShellOptions::default())
    }
}

impl Shell {
    pub fn new(options: ShellOptions) -> Self {
        Self {
            options,
            sampler: Arc::new(PerfStat::default()),
        }
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn CounterSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_options(mut self, options: ShellOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ShellOptions {
        &self.options
    }

    /// Runs all specs concurrently and blocks until every branch is terminal.
    ///
    /// Node-level failures (unstartable commands, unavailable counters) are
    /// reported in the outcomes. An error is returned only when the host
    /// cannot supply processes or threads; the remaining branches still run
    /// to completion first.
    pub fn run(&self, specs: &[ProcessSpec]) -> Result<ShellReport, ShellError> {
        let epoch = Epoch::now();
        info!(branches = specs.len(), "shell started");

        let results: Vec<Result<Outcome, ShellError>> = thread::scope(|scope| {
            let handles: Vec<_> = specs
                .iter()
                .enumerate()
                .map(|(index, spec)| {
                    let epoch = &epoch;
                    thread::Builder::new()
                        .name(format!("galileo-branch-{}", index))
                        .spawn_scoped(scope, move || Branch::new(self, epoch, index).execute(spec))
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(index, handle)| match handle {
                    Ok(handle) => handle
                        .join()
                        .unwrap_or(Err(ShellError::BranchPanicked(index))),
                    Err(source) => Err(ShellError::Supervisor {
                        branch: index,
                        source,
                    }),
                })
                .collect()
        });

        let elapsed = epoch.instant.elapsed();
        let outcomes = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        info!(elapsed_ms = elapsed.as_millis() as u64, "shell finished");
        Ok(ShellReport {
            epoch: epoch.wall,
            elapsed,
            outcomes,
        })
    }
}

/// Runs `specs` with default options and the `perf stat` sampler.
pub fn shell(specs: &[ProcessSpec]) -> Result<ShellReport, ShellError> {
    Shell::default().run(specs)
}

struct Epoch {
    instant: Instant,
    wall: DateTime<Utc>,
}

impl Epoch {
    fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: Utc::now(),
        }
    }

    fn wall_at(&self, at: Instant) -> DateTime<Utc> {
        let offset = chrono::Duration::from_std(at.saturating_duration_since(self.instant))
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + offset
    }
}

/// Modifier state accumulated on the way down to a branch's command.
#[derive(Default)]
struct Frame {
    /// One entry per enclosing run_for, outermost first.
    budgets: Vec<Duration>,
    /// Number of enclosing perf nodes.
    perf_layers: usize,
}

/// A resolved subtree plus what its ancestors still need from the leaf.
struct Resolved {
    outcome: Outcome,
    /// Index into `Frame::budgets` of the deadline that stopped the process.
    fired_budget: Option<usize>,
    /// One entry per enclosing perf node, outermost first.
    instrumentation: Vec<Instrumentation>,
}

impl Resolved {
    fn wrap(self, node: impl FnOnce(Box<Outcome>) -> OutcomeNode) -> Self {
        let Resolved {
            outcome,
            fired_budget,
            instrumentation,
        } = self;
        Resolved {
            outcome: Outcome {
                status: outcome.status.clone(),
                started_at: outcome.started_at,
                ended_at: outcome.ended_at,
                node: node(Box::new(outcome)),
            },
            fired_budget,
            instrumentation,
        }
    }
}

struct Branch<'a> {
    shell: &'a Shell,
    epoch: &'a Epoch,
    index: usize,
}

impl<'a> Branch<'a> {
    fn new(shell: &'a Shell, epoch: &'a Epoch, index: usize) -> Self {
        Self {
            shell,
            epoch,
            index,
        }
    }

    fn execute(&self, spec: &ProcessSpec) -> Result<Outcome, ShellError> {
        self.resolve(spec, &mut Frame::default())
            .map(|resolved| resolved.outcome)
    }

    fn resolve(&self, spec: &ProcessSpec, frame: &mut Frame) -> Result<Resolved, ShellError> {
        match spec {
            ProcessSpec::Command(invocation) => self.launch(invocation, frame),
            ProcessSpec::Delay { offset, child } => {
                self.hold_until(self.epoch.instant.checked_add(*offset));
                let offset = *offset;
                Ok(self
                    .resolve(child, frame)?
                    .wrap(|child| OutcomeNode::Delay { offset, child }))
            }
            ProcessSpec::RunFor { duration, child } => {
                let slot = frame.budgets.len();
                frame.budgets.push(*duration);
                let resolved = self.resolve(child, frame);
                frame.budgets.pop();
                let resolved = resolved?;
                let deadline_fired = resolved.fired_budget == Some(slot);
                let duration = *duration;
                Ok(resolved.wrap(|child| OutcomeNode::RunFor {
                    duration,
                    deadline_fired,
                    child,
                }))
            }
            ProcessSpec::Perf { child } => {
                frame.perf_layers += 1;
                let resolved = self.resolve(child, frame);
                frame.perf_layers -= 1;
                let mut resolved = resolved?;
                let instrumentation = resolved
                    .instrumentation
                    .pop()
                    .unwrap_or_else(|| Instrumentation::unavailable("no session was opened"));
                Ok(resolved.wrap(|child| OutcomeNode::Perf {
                    instrumentation,
                    child,
                }))
            }
        }
    }

    fn launch(&self, invocation: &Invocation, frame: &Frame) -> Result<Resolved, ShellError> {
        let command = invocation.command_line();
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args).stdin(Stdio::null());
        process::isolate(&mut cmd);
        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }
        let (stdout, stderr) = match self.redirect_output(&mut cmd) {
            Ok(paths) => paths,
            Err(err) => {
                warn!(branch = self.index, command = %command, error = %err, "cannot open output files");
                return Ok(self.start_failure(command, err.to_string(), frame));
            }
        };

        let spawned = Instant::now();
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) if process::is_resource_exhaustion(&source) => {
                return Err(ShellError::ResourceExhausted { command, source });
            }
            Err(err) => {
                warn!(branch = self.index, command = %command, error = %err, "process failed to start");
                return Ok(self.start_failure(command, err.to_string(), frame));
            }
        };
        let mut child = ChildGuard::new(child);
        let pid = child.id();
        info!(branch = self.index, pid, command = %command, "process started");

        let sessions: Vec<Result<Box<dyn CounterSession>, String>> = (0..frame.perf_layers)
            .map(|_| {
                self.shell.sampler.attach(pid).map_err(|err| {
                    warn!(branch = self.index, pid, error = %err, "counter sampling unavailable");
                    format!("{:#}", err)
                })
            })
            .collect();

        // The tightest enclosing budget wins; ties go to the outermost.
        let deadline = frame
            .budgets
            .iter()
            .enumerate()
            .min_by_key(|(_, budget)| **budget)
            // A budget past the clock's range never expires.
            .and_then(|(slot, budget)| spawned.checked_add(*budget).map(|at| (slot, at)));

        let options = &self.shell.options;
        let exit = child
            .wait_until(
                deadline.map(|(_, at)| at),
                options.grace_period,
                options.poll_interval,
            )
            .map_err(|source| ShellError::Wait {
                command: command.clone(),
                source,
            })?;
        let ended = Instant::now();

        let instrumentation = sessions
            .into_iter()
            .map(|session| match session {
                Ok(mut session) => {
                    if !session.is_running() {
                        debug!(branch = self.index, pid, "collector exited before its process");
                    }
                    match session.stop() {
                        Ok(counters) => Instrumentation::Sampled { counters },
                        Err(err) => {
                            warn!(branch = self.index, pid, error = %err, "counter sampling unavailable");
                            Instrumentation::unavailable(format!("{:#}", err))
                        }
                    }
                }
                Err(reason) => Instrumentation::unavailable(reason),
            })
            .collect();

        let (status, fired_budget) = match exit {
            Exit::Natural(status) => (process::exit_status(status), None),
            Exit::Deadline { forced } => {
                info!(branch = self.index, pid, forced, "process stopped at deadline");
                (
                    ExitStatus::TerminatedByDeadline { forced },
                    deadline.map(|(slot, _)| slot),
                )
            }
        };
        info!(branch = self.index, pid, status = %status, "process finished");

        Ok(Resolved {
            outcome: Outcome {
                status,
                started_at: Some(self.epoch.wall_at(spawned)),
                ended_at: self.epoch.wall_at(ended),
                node: OutcomeNode::Command {
                    command,
                    pid: Some(pid),
                    launched_after: Some(spawned.saturating_duration_since(self.epoch.instant)),
                    runtime: ended.saturating_duration_since(spawned),
                    stdout,
                    stderr,
                },
            },
            fired_budget,
            instrumentation,
        })
    }

    /// Sleeps until `release`. `None` is an instant past the clock's range,
    /// which never arrives.
    fn hold_until(&self, release: Option<Instant>) {
        let release = match release {
            Some(release) => release,
            None => {
                warn!(branch = self.index, "delay is beyond the clock's range, branch will not start");
                loop {
                    thread::sleep(Duration::from_secs(u64::from(u32::MAX)));
                }
            }
        };
        let now = Instant::now();
        if release > now {
            let wait = release - now;
            debug!(branch = self.index, wait_ms = wait.as_millis() as u64, "delaying branch");
            thread::sleep(wait);
        }
    }

    fn start_failure(&self, command: String, reason: String, frame: &Frame) -> Resolved {
        let now = self.epoch.wall_at(Instant::now());
        Resolved {
            outcome: Outcome {
                status: ExitStatus::FailedToStart { reason },
                started_at: None,
                ended_at: now,
                node: OutcomeNode::Command {
                    command,
                    pid: None,
                    launched_after: None,
                    runtime: Duration::ZERO,
                    stdout: None,
                    stderr: None,
                },
            },
            fired_budget: None,
            instrumentation: (0..frame.perf_layers)
                .map(|_| Instrumentation::unavailable("process failed to start"))
                .collect(),
        }
    }

    /// Branches have exactly one command, so the branch index names the files.
    fn redirect_output(&self, cmd: &mut Command) -> io::Result<(Option<PathBuf>, Option<PathBuf>)> {
        let dir = match &self.shell.options.output_dir {
            Some(dir) => dir,
            None => return Ok((None, None)),
        };
        fs::create_dir_all(dir)?;
        let stdout = dir.join(format!("branch-{}.stdout", self.index));
        let stderr = dir.join(format!("branch-{}.stderr", self.index));
        cmd.stdout(File::create(&stdout)?);
        cmd.stderr(File::create(&stderr)?);
        Ok((Some(stdout), Some(stderr)))
    }
}

fn secs<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use galileo_core::{delay, perf, run_for, CounterReport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sh(script: &str) -> ProcessSpec {
        Invocation::new("/bin/sh").arg("-c").arg(script).into()
    }

    fn fast_shell() -> Shell {
        Shell::new(ShellOptions {
            grace_period: Duration::from_millis(300),
            poll_interval: Duration::from_millis(5),
            output_dir: None,
        })
    }

    struct FakeSampler {
        attached: AtomicUsize,
        fail: bool,
    }

    struct FakeSession;

    impl CounterSampler for FakeSampler {
        fn attach(&self, _pid: u32) -> anyhow::Result<Box<dyn CounterSession>> {
            self.attached.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("perf_event_paranoid forbids attaching"));
            }
            Ok(Box::new(FakeSession))
        }
    }

    impl CounterSession for FakeSession {
        fn is_running(&mut self) -> bool {
            true
        }

        fn stop(self: Box<Self>) -> anyhow::Result<CounterReport> {
            let mut report = CounterReport::new();
            report.push("cycles", 1000.0);
            report.push("instructions", 750.0);
            Ok(report)
        }
    }

    fn fake(fail: bool) -> Arc<FakeSampler> {
        Arc::new(FakeSampler {
            attached: AtomicUsize::new(0),
            fail,
        })
    }

    #[test]
    fn exit_code_is_reported() {
        let report = fast_shell().run(&[sh("exit 3")]).expect("shell");
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].status, ExitStatus::Exited { code: 3 });
        assert!(report.outcomes[0].started_at.is_some());
    }

    #[test]
    fn empty_shell_returns_immediately() {
        let report = fast_shell().run(&[]).expect("shell");
        assert!(report.outcomes.is_empty());
    }

    #[test]
    fn bad_path_is_a_start_failure_not_an_error() {
        let report = fast_shell()
            .run(&[
                run_for(
                    Duration::from_secs(5),
                    Invocation::new("/nonexistent/galileo-binary"),
                ),
                sh("exit 0"),
            ])
            .expect("shell");
        let failed = &report.outcomes[0];
        assert!(failed.status.failed_to_start(), "{:?}", failed.status);
        assert!(failed.started_at.is_none());
        match &failed.node {
            OutcomeNode::RunFor { deadline_fired, .. } => assert!(!deadline_fired),
            other => panic!("expected run_for outcome, got {:?}", other),
        }
        assert!(report.outcomes[1].status.success());
    }

    #[test]
    fn bad_working_directory_is_a_start_failure() {
        let spec: ProcessSpec = Invocation::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .current_dir("/nonexistent/galileo-dir")
            .into();
        let report = fast_shell().run(&[spec]).expect("shell");
        assert!(report.outcomes[0].status.failed_to_start());
    }

    #[test]
    fn zero_duration_run_for_stops_process_immediately() {
        let started = Instant::now();
        let report = fast_shell()
            .run(&[run_for(Duration::ZERO, sh("exec sleep 5"))])
            .expect("shell");
        assert!(started.elapsed() < Duration::from_secs(2));
        let outcome = &report.outcomes[0];
        assert!(outcome.status.terminated_by_deadline(), "{:?}", outcome.status);
        match &outcome.node {
            OutcomeNode::RunFor { deadline_fired, .. } => assert!(deadline_fired),
            other => panic!("expected run_for outcome, got {:?}", other),
        }
    }

    #[test]
    fn process_finishing_early_is_not_marked_as_deadline() {
        let report = fast_shell()
            .run(&[run_for(Duration::from_secs(5), sh("exit 0"))])
            .expect("shell");
        let outcome = &report.outcomes[0];
        assert!(outcome.status.success());
        match &outcome.node {
            OutcomeNode::RunFor { deadline_fired, .. } => assert!(!deadline_fired),
            other => panic!("expected run_for outcome, got {:?}", other),
        }
    }

    #[test]
    fn tightest_nested_budget_fires() {
        let report = fast_shell()
            .run(&[run_for(
                Duration::from_secs(10),
                run_for(Duration::from_millis(100), sh("exec sleep 5")),
            )])
            .expect("shell");
        let outer = &report.outcomes[0];
        assert!(outer.runtime() < Duration::from_secs(2));
        let inner = outer.child().expect("inner run_for");
        match (&outer.node, &inner.node) {
            (
                OutcomeNode::RunFor {
                    deadline_fired: outer_fired,
                    ..
                },
                OutcomeNode::RunFor {
                    deadline_fired: inner_fired,
                    ..
                },
            ) => {
                assert!(!outer_fired);
                assert!(inner_fired);
            }
            other => panic!("unexpected shape {:?}", other),
        }
    }

    #[test]
    fn unbounded_run_for_imposes_no_deadline() {
        let report = fast_shell()
            .run(&[run_for(Duration::MAX, sh("exit 0")), sh("exit 2")])
            .expect("shell");
        assert!(report.outcomes[0].status.success(), "{:?}", report.outcomes[0].status);
        match &report.outcomes[0].node {
            OutcomeNode::RunFor { deadline_fired, .. } => assert!(!deadline_fired),
            other => panic!("expected run_for outcome, got {:?}", other),
        }
        assert_eq!(report.outcomes[1].status, ExitStatus::Exited { code: 2 });
    }

    #[test]
    fn unreachable_delay_holds_branch_instead_of_failing() {
        let shell = fast_shell();
        let runner = thread::spawn(move || {
            shell.run(&[delay(Duration::MAX, sh("exit 0")), sh("exit 0")])
        });
        thread::sleep(Duration::from_millis(300));
        // A panicking branch would have ended the call with BranchPanicked.
        assert!(!runner.is_finished());
    }

    #[test]
    fn deadline_reaches_processes_the_command_forked() {
        use crate::process::tests::{assert_gone, pid_file, wait_for_pid_file};

        let pid_path = pid_file("shell_fork");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_path.display());
        let report = fast_shell()
            .run(&[run_for(Duration::from_millis(200), sh(&script))])
            .expect("shell");
        assert!(report.outcomes[0].status.terminated_by_deadline());
        assert_gone(wait_for_pid_file(&pid_path));
        let _ = fs::remove_file(pid_path);
    }

    #[test]
    fn perf_keeps_exit_status_and_reports_counters() {
        let sampler = fake(false);
        let shell = fast_shell().with_sampler(sampler.clone());
        let report = shell
            .run(&[perf(sh("exit 0")), perf(sh("exit 4")), sh("exit 4")])
            .expect("shell");
        assert!(report.outcomes[0].status.success());
        assert_eq!(report.outcomes[1].status, report.outcomes[2].status);
        let counters = report.outcomes[0].counters().expect("counters");
        assert_eq!(counters.get("cycles"), Some(&[1000.0][..]));
        assert_eq!(sampler.attached.load(Ordering::SeqCst), 2);
        assert!(report.outcomes[2].instrumentation().is_none());
    }

    #[test]
    fn failed_sampler_degrades_outcome_without_stopping_process() {
        let shell = fast_shell().with_sampler(fake(true));
        let report = shell.run(&[perf(sh("exit 0"))]).expect("shell");
        let outcome = &report.outcomes[0];
        assert!(outcome.status.success());
        match outcome.instrumentation() {
            Some(Instrumentation::Unavailable { reason }) => {
                assert!(reason.contains("paranoid"), "{}", reason)
            }
            other => panic!("expected unavailable instrumentation, got {:?}", other),
        }
    }

    #[test]
    fn perf_over_unstartable_command_is_unavailable() {
        let sampler = fake(false);
        let shell = fast_shell().with_sampler(sampler.clone());
        let report = shell
            .run(&[perf(Invocation::new("/nonexistent/galileo-binary"))])
            .expect("shell");
        assert!(report.outcomes[0].status.failed_to_start());
        assert!(matches!(
            report.outcomes[0].instrumentation(),
            Some(Instrumentation::Unavailable { .. })
        ));
        assert_eq!(sampler.attached.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn outcome_tree_mirrors_spec_shape() {
        let shell = fast_shell().with_sampler(fake(false));
        let spec = delay(
            Duration::from_millis(10),
            perf(run_for(Duration::from_secs(5), sh("exit 0"))),
        );
        let report = shell.run(&[spec]).expect("shell");
        let outcome = &report.outcomes[0];
        assert!(matches!(outcome.node, OutcomeNode::Delay { .. }));
        let perf_node = outcome.child().expect("perf");
        assert!(matches!(perf_node.node, OutcomeNode::Perf { .. }));
        let run_for_node = perf_node.child().expect("run_for");
        assert!(matches!(run_for_node.node, OutcomeNode::RunFor { .. }));
        let leaf = run_for_node.child().expect("command");
        assert!(matches!(leaf.node, OutcomeNode::Command { .. }));
        assert!(leaf.child().is_none());
        assert!(outcome.status.success());
    }

    #[test]
    fn output_is_captured_per_branch() {
        let dir = std::env::temp_dir().join(format!(
            "galileo_capture_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let shell = Shell::new(ShellOptions {
            output_dir: Some(dir.clone()),
            ..ShellOptions::default()
        });
        let report = shell
            .run(&[sh("echo first"), sh("echo second >&2")])
            .expect("shell");
        let paths = |outcome: &Outcome| match &outcome.node {
            OutcomeNode::Command { stdout, stderr, .. } => (
                stdout.clone().expect("stdout path"),
                stderr.clone().expect("stderr path"),
            ),
            other => panic!("expected command outcome, got {:?}", other),
        };
        let (out0, _) = paths(&report.outcomes[0]);
        let (_, err1) = paths(&report.outcomes[1]);
        assert_eq!(fs::read_to_string(out0).expect("stdout"), "first\n");
        assert_eq!(fs::read_to_string(err1).expect("stderr"), "second\n");
        let _ = fs::remove_dir_all(dir);
    }
}
