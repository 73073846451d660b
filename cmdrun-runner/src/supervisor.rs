use crate::deadline::{DeadlineSequence, Escalation};
use crate::debug::{default_debug_log, DebugLog};
use crate::process::{self, SupervisedProcess};
use chrono::Utc;
use cmdrun_core::{
    CallbackError, CmdrunError, CommandLine, CommandResult, Environment, Result, RunOptions,
    TimeoutSpec,
};
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MIN_TICK: Duration = Duration::from_millis(1);

/// How the escalation phase of a run ended
enum Supervision {
    Exited(std::process::ExitStatus),
    /// A callback failed; the child is still ours to kill and reap
    CallbackFailed(CallbackError),
}

enum Poll {
    Exited(std::process::ExitStatus),
    DeadlineReached,
}

/// Runs one child process at a time under a deadline sequence.
///
/// The supervisor itself is only configuration; every call to [`run`]
/// spawns and owns its own child, so one supervisor can be shared across
/// concurrent runs.
///
/// [`run`]: ProcessSupervisor::run
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    timeout: Option<TimeoutSpec>,
    environment: Environment,
    options: RunOptions,
    debug_log: Option<DebugLog>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: impl Into<Option<TimeoutSpec>>) -> Self {
        self.timeout = timeout.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Without an explicit log, runs use the installed default (if any).
    pub fn with_debug_log(mut self, debug_log: DebugLog) -> Self {
        self.debug_log = Some(debug_log);
        self
    }

    pub fn timeout(&self) -> Option<&TimeoutSpec> {
        self.timeout.as_ref()
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run `command` to completion.
    ///
    /// Returns once the child has exited (on its own or through an
    /// escalation signal) and has been reaped. If an escalation callback
    /// fails, the child is killed and reaped and the callback's error is
    /// returned as [`CmdrunError::ActionCallback`].
    pub async fn run(&self, command: impl Into<CommandLine>) -> Result<CommandResult> {
        let command = command.into();
        let invocation_id = Uuid::new_v4();
        let debug_log = self.debug_log.clone().unwrap_or_else(default_debug_log);
        let started_at = Utc::now();

        let sequence = DeadlineSequence::build(self.timeout.as_ref(), Instant::now())?;

        let mut process = process::spawn(&command, &self.environment, &self.options)?;
        let pid = process.pid;

        info!(
            invocation_id = %invocation_id,
            pid,
            command = %command,
            deadlines = sequence.len(),
            "Supervising process"
        );
        debug_log.line(format!(
            "cmdrun spawn: args={:?}, timeout={}, options: {:?}, PID: {}",
            command,
            self.timeout
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            self.options,
            pid
        ));

        match self.supervise(&mut process, sequence, &debug_log).await {
            Ok(Supervision::Exited(status)) => {
                self.finish(process, status, started_at, &debug_log).await
            }
            Ok(Supervision::CallbackFailed(err)) => {
                warn!(
                    invocation_id = %invocation_id,
                    pid,
                    error = %err,
                    "Escalation callback failed, killing process"
                );
                process.force_reap().await;
                Err(CmdrunError::ActionCallback(err))
            }
            Err(e) => {
                warn!(
                    invocation_id = %invocation_id,
                    pid,
                    error = %e,
                    "Supervision failed, killing process"
                );
                process.force_reap().await;
                Err(e)
            }
        }
    }

    async fn supervise(
        &self,
        process: &mut SupervisedProcess,
        sequence: DeadlineSequence,
        debug_log: &DebugLog,
    ) -> Result<Supervision> {
        let tick = self.options.tick.max(MIN_TICK);

        for point in sequence {
            if let Poll::Exited(status) = poll_until(process, point.fire_at, tick).await? {
                return Ok(Supervision::Exited(status));
            }

            info!(
                pid = process.pid,
                action = %point.escalation,
                after_ms = point.offset.as_millis() as u64,
                "Deadline reached"
            );
            debug_log.line(format!(
                "cmdrun action: PID: {}, action: {}",
                process.pid, point.escalation
            ));

            match &point.escalation {
                Escalation::Signal(signal) => process.signal(Some(*signal))?,
                Escalation::Probe => process.signal(None)?,
                Escalation::Callback(callback) => {
                    if let Err(err) = callback(process.pid) {
                        return Ok(Supervision::CallbackFailed(err));
                    }
                }
            }
        }

        wait_for_exit(process, tick).await.map(Supervision::Exited)
    }

    async fn finish(
        &self,
        mut process: SupervisedProcess,
        status: std::process::ExitStatus,
        started_at: chrono::DateTime<Utc>,
        debug_log: &DebugLog,
    ) -> Result<CommandResult> {
        process.drainer.flush(self.options.tick.max(MIN_TICK)).await?;

        let status = process::exit_status(status);
        let duration_ms = process.started_at.elapsed().as_millis() as u64;
        debug_log.line(format!("cmdrun exit: PID: {}, {}", process.pid, status));
        info!(pid = process.pid, status = %status, duration_ms, "Process exited");

        let (output, stderr) = process.drainer.into_buffers();

        Ok(CommandResult {
            pid: process.pid,
            output,
            stderr,
            status,
            started_at,
            completed_at: Utc::now(),
            duration_ms,
        })
    }
}

/// Drain output and watch for exit until `fire_at`.
async fn poll_until(
    process: &mut SupervisedProcess,
    fire_at: Instant,
    tick: Duration,
) -> Result<Poll> {
    loop {
        if let Some(status) = process.child.try_wait()? {
            return Ok(Poll::Exited(status));
        }

        let now = Instant::now();
        if now >= fire_at {
            return Ok(Poll::DeadlineReached);
        }
        let wait = tick.min(fire_at - now);

        if process.drainer.is_finished() {
            // All pipes are at EOF, so nothing can fill up while we wait.
            if let Ok(status) = time::timeout(wait, process.child.wait()).await {
                return Ok(Poll::Exited(status?));
            }
        } else {
            process.drainer.drain_for(wait).await?;
        }
    }
}

/// No deadlines left: wait for exit, still draining while any pipe is open.
async fn wait_for_exit(
    process: &mut SupervisedProcess,
    tick: Duration,
) -> Result<std::process::ExitStatus> {
    loop {
        if let Some(status) = process.child.try_wait()? {
            return Ok(status);
        }

        if process.drainer.is_finished() {
            debug!(pid = process.pid, "Output closed, waiting for exit");
            return Ok(process.child.wait().await?);
        }

        process.drainer.drain_for(tick).await?;
    }
}

/// Run `command` once with the given timeout, environment overlay and options.
pub async fn run(
    command: impl Into<CommandLine>,
    timeout: Option<TimeoutSpec>,
    environment: Environment,
    options: RunOptions,
) -> Result<CommandResult> {
    ProcessSupervisor::new()
        .with_timeout(timeout)
        .with_environment(environment)
        .with_options(options)
        .run(command)
        .await
}
