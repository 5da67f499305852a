use std::{
    ffi::OsStr,
    io::{BufRead, BufReader},
    marker::PhantomData,
    path::Path,
    process::{Child, ChildStderr, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
};

use crate::event::channel::EventPublisher;
use crate::event::OutputEvent;

use super::CommandError;

pub struct Unstarted;
pub struct Started;

/// A child process through its typestates: configure while `Unstarted`,
/// observe and stream once `Started`.
pub struct ProcessRunner<State = Unstarted> {
    cmd: Option<Command>,
    process: Option<Child>,

    state: PhantomData<State>,
}

impl ProcessRunner {
    pub fn new<I, S>(binary_path: impl AsRef<OsStr>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(binary_path);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        Self {
            cmd: Some(command),
            process: None,
            state: PhantomData,
        }
    }

    pub fn with_envs<'a, I>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = &'a (String, String)>,
    {
        if let Some(cmd) = self.cmd.as_mut() {
            for (name, value) in envs {
                cmd.env(name, value);
            }
        }
        self
    }

    pub fn with_current_dir(mut self, dir: &Path) -> Self {
        if let Some(cmd) = self.cmd.as_mut() {
            cmd.current_dir(dir);
        }
        self
    }

    pub fn start(self) -> Result<ProcessRunner<Started>, CommandError> {
        Ok(ProcessRunner {
            process: Some(self.cmd.ok_or(CommandError::CommandNotFound)?.spawn()?),
            cmd: None,
            state: PhantomData,
        })
    }
}

impl ProcessRunner<Started> {
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(Child::id)
    }

    /// Non-blocking liveness probe.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, CommandError> {
        Ok(self
            .process
            .as_mut()
            .ok_or(CommandError::ProcessNotStarted)?
            .try_wait()?)
    }

    pub fn is_running(&mut self) -> bool {
        self.try_wait().is_ok_and(|status| status.is_none())
    }

    /// Blocks until the child exits, reaping it.
    pub fn wait(&mut self) -> Result<ExitStatus, CommandError> {
        Ok(self
            .process
            .as_mut()
            .ok_or(CommandError::ProcessNotStarted)?
            .wait()?)
    }

    /// Best-effort hard kill; the unix path prefers
    /// [`super::ProcessTerminator`] for a graceful SIGTERM first.
    pub fn kill(&mut self) -> Result<(), CommandError> {
        Ok(self
            .process
            .as_mut()
            .ok_or(CommandError::ProcessNotStarted)?
            .kill()?)
    }

    /// Spawns a reader thread sending stdout lines to the publisher.
    pub fn stream_stdout(
        &mut self,
        snd: EventPublisher<OutputEvent>,
    ) -> Result<JoinHandle<()>, CommandError> {
        let stdout = self
            .process
            .as_mut()
            .ok_or(CommandError::ProcessNotStarted)?
            .stdout
            .take()
            .ok_or(CommandError::StreamPipeError("stdout".to_string()))?;

        Ok(thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(line) => snd.publish(OutputEvent::Stdout(line)),
                    Err(_) => break,
                }
            }
        }))
    }

    /// Hands the raw stderr pipe to the caller; the supervisor routes it
    /// through the panic capturer rather than line-wise logging.
    pub fn take_stderr(&mut self) -> Result<ChildStderr, CommandError> {
        self.process
            .as_mut()
            .ok_or(CommandError::ProcessNotStarted)?
            .stderr
            .take()
            .ok_or(CommandError::StreamPipeError("stderr".to_string()))
    }
}
