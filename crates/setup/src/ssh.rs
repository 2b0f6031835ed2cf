//! Remote execution channel to the Windows guest.
//!
//! The guest runs an OpenSSH server reachable through QEMU's user-mode
//! port forward (`127.0.0.1:2222 -> guest:22`). Authentication is by
//! password, since the vendor image ships with a fixed local account.
//!
//! There is no "connecting" session object: a [`SshSession`] only exists once
//! the handshake and authentication succeeded, and [`connect_with_retry`] owns the
//! retry loop that gets there.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use camino::Utf8Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Endpoints, SshCredentials};
use crate::errors::{ProvisionError, Result};
use crate::poll::{self, CancelToken, Clock, PollError};

/// Covers both the TCP connect and the SSH banner exchange.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Bounds opening the liveness channel and starting `echo`.
const PROBE_START_TIMEOUT: Duration = Duration::from_secs(1);
/// Bounds each read of the `echo` output.
const PROBE_OUTPUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Whether the caller wants the command's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Wait for completion and buffer stdout/stderr.
    Capture,
    /// Start the command and return immediately without reading anything.
    Detach,
}

/// Buffered result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` for detached commands.
    pub exit_status: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status.map_or(true, |c| c == 0)
    }
}

/// A remote command could not be run or its output could not be read.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ExecError(pub String);

impl From<ssh2::Error> for ExecError {
    fn from(e: ssh2::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

/// The operations the pipeline needs from a connected guest shell.
pub trait RemoteShell {
    fn execute(&mut self, command: &str, mode: OutputMode) -> Result<CommandOutput, ExecError>;

    /// Copy the contents of `local` into the existing guest directory `remote`.
    fn upload_dir(&mut self, local: &Utf8Path, remote: &str) -> Result<(), ExecError>;

    /// Run a trivial command; an error means the guest is unreachable.
    fn probe(&mut self) -> Result<(), ExecError> {
        self.execute("echo 1", OutputMode::Capture).map(|_| ())
    }
}

/// A connected, authenticated SSH session.
pub struct SshSession {
    session: ssh2::Session,
    /// Channels of detached commands, kept open so closing them does not
    /// interrupt the remote process.
    detached: Vec<ssh2::Channel>,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("detached", &self.detached.len())
            .finish()
    }
}

impl SshSession {
    /// Make a single connection attempt.
    pub fn open(endpoints: &Endpoints, creds: &SshCredentials) -> Result<Self, ExecError> {
        let addr = (endpoints.host.as_str(), endpoints.ssh_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ExecError(format!("cannot resolve {}", endpoints.host)))?;
        let tcp = TcpStream::connect_timeout(&addr, HANDSHAKE_TIMEOUT)?;

        let mut session = ssh2::Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(HANDSHAKE_TIMEOUT.as_millis() as u32);
        session.handshake()?;
        session.userauth_password(&creds.user, &creds.password)?;
        if !session.authenticated() {
            return Err(ExecError(format!("authentication failed for {}", creds.user)));
        }
        // Installers may run for a long time; commands themselves are unbounded.
        session.set_timeout(0);
        Ok(Self {
            session,
            detached: Vec::new(),
        })
    }

    fn scp_file(&self, local: &Path, remote: &str) -> Result<(), ExecError> {
        let data = fs::read(local)?;
        let mut channel = self
            .session
            .scp_send(Path::new(remote), 0o755, data.len() as u64, None)?;
        channel.write_all(&data)?;
        channel.send_eof()?;
        channel.wait_eof()?;
        channel.close()?;
        channel.wait_close()?;
        Ok(())
    }
}

impl RemoteShell for SshSession {
    fn execute(&mut self, command: &str, mode: OutputMode) -> Result<CommandOutput, ExecError> {
        debug!("Executing: {command}");
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;
        if mode == OutputMode::Detach {
            self.detached.push(channel);
            return Ok(CommandOutput::default());
        }

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;
        channel.wait_close()?;
        let exit_status = channel.exit_status()?;
        debug!("stdout: {stdout:?}");
        debug!("stderr: {stderr:?}");
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_status: Some(exit_status),
        })
    }

    fn upload_dir(&mut self, local: &Utf8Path, remote: &str) -> Result<(), ExecError> {
        for entry in fs::read_dir(local)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name
                .to_str()
                .ok_or_else(|| ExecError(format!("non UTF-8 file name in {local}")))?;
            let remote_path = format!("{}/{name}", remote.trim_end_matches('/'));
            let local_path = local.join(name);
            if entry.file_type()?.is_dir() {
                let out =
                    self.execute(&format!("mkdir -p '{remote_path}'"), OutputMode::Capture)?;
                if !out.success() {
                    return Err(ExecError(format!(
                        "mkdir {remote_path} failed: {}",
                        out.stderr.trim()
                    )));
                }
                self.upload_dir(&local_path, &remote_path)?;
            } else {
                debug!("Uploading {local_path} to {remote_path}");
                self.scp_file(local_path.as_std_path(), &remote_path)?;
            }
        }
        Ok(())
    }

    fn probe(&mut self) -> Result<(), ExecError> {
        self.session.set_timeout(PROBE_START_TIMEOUT.as_millis() as u32);
        let started = self
            .session
            .channel_session()
            .and_then(|mut channel| channel.exec("echo 1").map(|()| channel));
        self.session.set_timeout(PROBE_OUTPUT_TIMEOUT.as_millis() as u32);
        let r = match started {
            Ok(mut channel) => {
                let mut out = String::new();
                echo_read_outcome(channel.read_to_string(&mut out).map(|_| ()))
            }
            Err(e) => Err(e.into()),
        };
        self.session.set_timeout(0);
        r
    }
}

/// Only a dropped connection counts as the guest going down; a read that
/// merely timed out means it is up but slow.
fn echo_read_outcome(r: io::Result<()>) -> Result<(), ExecError> {
    match r {
        Ok(()) => Ok(()),
        Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
            debug!("Echo output still pending: {e}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Retry `connect` under `policy`, mapping exhaustion to
/// [`ProvisionError::Connection`].
pub fn connect_with_retry<S>(
    policy: &poll::PollPolicy,
    clock: &dyn Clock,
    cancel: &CancelToken,
    mut connect: impl FnMut() -> Result<S, ExecError>,
) -> Result<S> {
    info!("Trying to connect to Windows OpenSSH server...");
    let max = policy.max_attempts.unwrap_or(u32::MAX);
    let r = poll::retry(policy, clock, cancel, |attempt| {
        debug!("Try number {attempt}/{max}.");
        connect()
    });
    match r {
        Ok(s) => {
            info!("Successfully connected!");
            Ok(s)
        }
        Err(PollError::Exhausted { attempts, last }) => Err(ProvisionError::Connection {
            attempts,
            last: last.0,
        }),
        Err(PollError::DeadlineExceeded(d)) => Err(ProvisionError::Connection {
            attempts: 0,
            last: format!("deadline of {d:?} exceeded"),
        }),
        Err(PollError::Probe(e)) => Err(ProvisionError::Connection {
            attempts: 0,
            last: e.0,
        }),
        Err(PollError::Cancelled) => Err(ProvisionError::Cancelled),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::VecDeque;

    use super::*;

    /// A scripted guest shell recording every command it receives.
    #[derive(Debug, Default)]
    pub(crate) struct FakeShell {
        pub(crate) commands: Vec<(String, OutputMode)>,
        pub(crate) uploads: Vec<(String, String)>,
        /// Responses consumed in order by `execute`; empty output once drained.
        pub(crate) responses: VecDeque<Result<CommandOutput, ExecError>>,
        pub(crate) fail_uploads: bool,
        /// Number of successful probes before the guest "goes down".
        pub(crate) probes_until_down: Option<u32>,
        pub(crate) probes: u32,
    }

    impl FakeShell {
        pub(crate) fn respond(&mut self, stdout: &str) {
            self.responses.push_back(Ok(CommandOutput {
                stdout: stdout.to_owned(),
                stderr: String::new(),
                exit_status: Some(0),
            }));
        }
    }

    impl RemoteShell for FakeShell {
        fn execute(&mut self, command: &str, mode: OutputMode) -> Result<CommandOutput, ExecError> {
            self.commands.push((command.to_owned(), mode));
            self.responses
                .pop_front()
                .unwrap_or_else(|| Ok(CommandOutput::default()))
        }

        fn upload_dir(&mut self, local: &Utf8Path, remote: &str) -> Result<(), ExecError> {
            self.uploads.push((local.to_string(), remote.to_owned()));
            if self.fail_uploads {
                return Err(ExecError("scp: permission denied".into()));
            }
            Ok(())
        }

        fn probe(&mut self) -> Result<(), ExecError> {
            self.probes += 1;
            match self.probes_until_down {
                Some(n) if self.probes > n => Err(ExecError("connection reset".into())),
                _ => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::poll::testutil::FakeClock;
    use crate::poll::PollPolicy;

    #[test]
    fn test_connect_gives_up_after_ten_attempts() {
        let clock = FakeClock::new();
        let policy = PollPolicy::every(Duration::from_secs(10)).with_max_attempts(10);
        let attempts = Cell::new(0);
        let r: Result<()> = connect_with_retry(&policy, &clock, &CancelToken::new(), || {
            attempts.set(attempts.get() + 1);
            Err(ExecError("Connection refused".into()))
        });
        match r {
            Err(ProvisionError::Connection { attempts: 10, last }) => {
                assert_eq!(last, "Connection refused")
            }
            o => panic!("unexpected result: {o:?}"),
        }
        assert_eq!(attempts.get(), 10);
        // Every attempt is preceded by the full delay.
        assert_eq!(*clock.sleeps.borrow(), vec![Duration::from_secs(10); 10]);
    }

    #[test]
    fn test_connect_succeeds_after_failures() {
        let clock = FakeClock::new();
        let policy = PollPolicy::every(Duration::from_secs(10)).with_max_attempts(10);
        let attempts = Cell::new(0);
        let r = connect_with_retry(&policy, &clock, &CancelToken::new(), || {
            attempts.set(attempts.get() + 1);
            if attempts.get() < 4 {
                Err(ExecError("banner exchange: timeout".into()))
            } else {
                Ok("session")
            }
        });
        assert_eq!(r.unwrap(), "session");
        assert_eq!(clock.sleeps.borrow().len(), 4);
    }

    #[test]
    fn test_connect_cancelled() {
        let clock = FakeClock::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let policy = PollPolicy::every(Duration::from_secs(10)).with_max_attempts(10);
        let r: Result<()> = connect_with_retry(&policy, &clock, &cancel, || unreachable!());
        assert!(matches!(r, Err(ProvisionError::Cancelled)));
    }

    #[test]
    fn test_command_output_success() {
        let mut out = CommandOutput::default();
        assert!(out.success());
        out.exit_status = Some(2);
        assert!(!out.success());
    }

    #[test]
    fn test_slow_echo_output_is_not_a_reboot() {
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "Timed out waiting on socket");
        assert!(echo_read_outcome(Err(timed_out)).is_ok());
        assert!(echo_read_outcome(Ok(())).is_ok());

        for kind in [
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Other,
        ] {
            let r = echo_read_outcome(Err(io::Error::new(kind, "session closed")));
            assert!(r.is_err(), "{kind:?}");
        }
    }
}
