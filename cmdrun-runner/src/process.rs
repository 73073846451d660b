// Spawning and signalling of the supervised child

use crate::drain::OutputDrainer;
use cmdrun_core::{
    CmdrunError, CommandLine, Environment, ExitStatus, Result, RunOptions, StderrMode,
    StdoutMode,
};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

/// A running child together with the pipes it writes to.
///
/// Owned by exactly one run; dropping it closes the pipes and kills the
/// child if it is still running.
pub struct SupervisedProcess {
    pub pid: u32,
    pub child: Child,
    pub drainer: OutputDrainer,
    pub started_at: Instant,
}

/// Spawn `command` with `environment` layered over the ambient environment.
pub fn spawn(
    command: &CommandLine,
    environment: &Environment,
    options: &RunOptions,
) -> Result<SupervisedProcess> {
    let mut cmd = match command {
        CommandLine::Shell(script) => {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(script);
            cmd
        }
        CommandLine::Argv(args) => {
            let (program, rest) = args.split_first().ok_or_else(|| {
                CmdrunError::InvalidConfiguration("Cannot run an empty argv".to_string())
            })?;
            let mut cmd = Command::new(program);
            cmd.args(rest);
            cmd
        }
    };

    cmd.envs(environment)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    if let Some(dir) = &options.working_directory {
        cmd.current_dir(dir);
    }
    if let Some(pgid) = options.process_group {
        cmd.process_group(pgid);
    }

    let mut output_reader = None;
    let mut stderr_reader = None;

    let output_writer = match options.stdout {
        StdoutMode::Capture => {
            let (reader, writer) = os_pipe::pipe()?;
            output_reader = Some(reader);
            Some(writer)
        }
        StdoutMode::Discard => {
            cmd.stdout(Stdio::null());
            None
        }
    };

    match options.stderr {
        StderrMode::Merge => match &output_writer {
            Some(writer) => {
                cmd.stderr(writer.try_clone()?);
            }
            None => {
                cmd.stderr(Stdio::null());
            }
        },
        StderrMode::Split => {
            let (reader, writer) = os_pipe::pipe()?;
            stderr_reader = Some(reader);
            cmd.stderr(writer);
        }
        StderrMode::Discard => {
            cmd.stderr(Stdio::null());
        }
    }

    if let Some(writer) = output_writer {
        cmd.stdout(writer);
    }

    let started_at = Instant::now();
    let child = cmd.spawn().map_err(|source| CmdrunError::Spawn {
        program: command.program().to_string(),
        source,
    })?;
    // The command still holds our copies of the write ends; EOF is only
    // visible once they are gone.
    drop(cmd);

    let pid = match child.id() {
        Some(pid) => pid,
        None => {
            return Err(CmdrunError::InvalidConfiguration(
                "Spawned child has no pid".to_string(),
            ))
        }
    };

    let drainer = OutputDrainer::new(
        output_reader,
        stderr_reader,
        options.stderr == StderrMode::Split,
    )?;

    debug!(pid, program = %command.program(), "Spawned child process");

    Ok(SupervisedProcess {
        pid,
        child,
        drainer,
        started_at,
    })
}

impl SupervisedProcess {
    /// Deliver `signal` (or probe with signal 0 when `None`).
    /// A child that is already gone is not an error.
    pub fn signal(&self, signal: Option<Signal>) -> Result<()> {
        match kill(self.nix_pid(), signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                debug!(pid = self.pid, "Child already gone, signal not delivered");
                Ok(())
            }
            Err(errno) => Err(CmdrunError::IoError(std::io::Error::from(errno))),
        }
    }

    /// Kill the child, wait for it and close its pipes. Used on every
    /// abnormal exit path; failures here are logged, never raised.
    pub async fn force_reap(mut self) {
        if let Err(e) = kill(self.nix_pid(), Signal::SIGKILL) {
            debug!(pid = self.pid, error = %e, "SIGKILL not delivered, process already dead");
        }

        if let Err(e) = self.child.wait().await {
            warn!(pid = self.pid, error = %e, "Failed to reap child process");
        }

        drop(self.drainer);
    }

    fn nix_pid(&self) -> Pid {
        Pid::from_raw(self.pid as i32)
    }
}

/// Translate a std exit status into the result's ExitStatus
pub fn exit_status(status: std::process::ExitStatus) -> ExitStatus {
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitStatus::Exited(code),
        (None, Some(signal)) => ExitStatus::Signaled(signal),
        // wait(2) only reports exits and terminating signals
        (None, None) => ExitStatus::Exited(-1),
    }
}
