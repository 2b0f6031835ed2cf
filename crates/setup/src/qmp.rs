//! Snapshot client for QEMU's QMP control socket.
//!
//! QMP is line-oriented JSON over TCP. QEMU greets, the client negotiates
//! capabilities, and from then on every command gets one `return` or
//! `error` reply, possibly preceded by asynchronous `event` lines.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::Endpoints;
use crate::errors::{ProvisionError, Result};
use crate::poll::{self, CancelToken, Clock, PollError, PollPolicy};

/// Literal marker QEMU prints in a `query-status` reply once the VM runs.
const RUNNING_MARKER: &str = r#""status": "running""#;

#[derive(Debug, Serialize)]
struct QmpCommand<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<HmpArguments<'a>>,
}

#[derive(Debug, Serialize)]
struct HmpArguments<'a> {
    #[serde(rename = "command-line")]
    command_line: &'a str,
}

impl<'a> QmpCommand<'a> {
    const fn simple(execute: &'a str) -> Self {
        Self {
            execute,
            arguments: None,
        }
    }

    const fn hmp(command_line: &'a str) -> Self {
        Self {
            execute: "human-monitor-command",
            arguments: Some(HmpArguments { command_line }),
        }
    }
}

/// Whether a `query-status` reply says the VM is running again.
///
/// True iff `reply` contains the literal `"status": "running"` (QEMU's own
/// spacing) or any of its lines is a JSON object whose `return.status` is
/// `"running"`. Events, errors and other statuses (`paused`,
/// `save-vm`, ...) are false.
pub fn response_reports_running(reply: &str) -> bool {
    if reply.contains(RUNNING_MARKER) {
        return true;
    }
    reply.lines().any(|line| {
        serde_json::from_str::<serde_json::Value>(line.trim())
            .ok()
            .and_then(|v| {
                v.get("return")?
                    .get("status")?
                    .as_str()
                    .map(|s| s == "running")
            })
            .unwrap_or(false)
    })
}

/// Reject snapshot tags that would let extra text into the HMP command line.
fn validate_hmp_tag(tag: &str) -> io::Result<()> {
    if tag.is_empty()
        || tag.len() > 128
        || !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(io::Error::other(format!("invalid snapshot tag {tag:?}")));
    }
    Ok(())
}

/// A QMP connection in command mode.
#[derive(Debug)]
pub struct QmpClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl QmpClient {
    /// Connect, log the greeting and negotiate capabilities.
    ///
    /// `read_timeout` bounds every individual read; `None` blocks forever.
    pub fn connect(endpoints: &Endpoints, read_timeout: Option<Duration>) -> io::Result<Self> {
        let addr = (endpoints.host.as_str(), endpoints.qmp_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::other(format!("cannot resolve {}", endpoints.host)))?;
        let writer = TcpStream::connect(addr)?;
        writer.set_read_timeout(read_timeout)?;
        let mut client = Self {
            reader: BufReader::new(writer.try_clone()?),
            writer,
        };

        let greeting = client.read_line()?;
        debug!("QMP greeting: {}", greeting.trim());

        client.execute(&QmpCommand::simple("qmp_capabilities"))?;
        Ok(client)
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "QMP connection closed",
            ));
        }
        Ok(line)
    }

    /// Read up to and including the next `return`/`error` line.
    ///
    /// Returns everything read, events included.
    fn read_reply(&mut self) -> io::Result<String> {
        let mut buf = String::new();
        loop {
            let line = self.read_line()?;
            buf.push_str(&line);
            let Ok(v) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
                return Err(io::Error::other(format!("malformed QMP message: {}", line.trim())));
            };
            if let Some(err) = v.get("error") {
                return Err(io::Error::other(format!("QMP error: {err}")));
            }
            if v.get("return").is_some() {
                debug!("QMP reply: {}", buf.trim());
                return Ok(buf);
            }
            debug!("QMP event: {}", line.trim());
        }
    }

    fn send(&mut self, cmd: &QmpCommand<'_>) -> io::Result<()> {
        let msg = serde_json::to_vec(cmd)?;
        self.writer.write_all(&msg)?;
        self.writer.flush()
    }

    fn execute(&mut self, cmd: &QmpCommand<'_>) -> io::Result<String> {
        self.send(cmd)?;
        self.read_reply()
    }

    /// Create (or overwrite) the internal snapshot `tag`.
    pub fn savevm(&mut self, tag: &str) -> io::Result<()> {
        validate_hmp_tag(tag)?;
        let line = format!("savevm {tag}");
        let reply = self.execute(&QmpCommand::hmp(&line))?;
        // HMP reports failures as text inside a successful `return`.
        if reply.to_ascii_lowercase().contains("error") {
            return Err(io::Error::other(format!("savevm failed: {}", reply.trim())));
        }
        Ok(())
    }

    pub fn query_running(&mut self) -> io::Result<bool> {
        let reply = self.execute(&QmpCommand::simple("query-status"))?;
        Ok(response_reports_running(&reply))
    }

    /// Ask QEMU to exit and drop the connection.
    pub fn quit(mut self) -> io::Result<()> {
        self.send(&QmpCommand::simple("quit"))?;
        match self.read_reply() {
            Ok(_) => Ok(()),
            // QEMU may close the socket before its reply reaches us.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Takes the golden snapshot of the provisioning VM.
pub trait Snapshotter {
    fn snapshot(
        &mut self,
        tag: &str,
        policy: &PollPolicy,
        clock: &dyn Clock,
        cancel: &CancelToken,
    ) -> Result<()>;
}

#[derive(Debug)]
enum Failure {
    Io(io::Error),
    Timeout(Duration),
    Cancelled,
}

impl From<io::Error> for Failure {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// [`Snapshotter`] over a real QMP socket.
#[derive(Debug, Clone)]
pub struct QmpSnapshotter {
    endpoints: Endpoints,
}

impl QmpSnapshotter {
    pub fn new(endpoints: Endpoints) -> Self {
        Self { endpoints }
    }

    fn run(
        &self,
        tag: &str,
        policy: &PollPolicy,
        clock: &dyn Clock,
        cancel: &CancelToken,
    ) -> Result<(), Failure> {
        let mut client = QmpClient::connect(&self.endpoints, policy.deadline)?;

        info!("Starting the snapshot...");
        client.savevm(tag)?;

        let r = poll::poll_until(policy, clock, cancel, |attempt| {
            debug!("Querying VM status ({attempt})");
            client.query_running()
        });
        match r {
            Ok(_) => {}
            Err(PollError::Probe(e)) | Err(PollError::Exhausted { last: e, .. }) => {
                return Err(Failure::Io(e))
            }
            Err(PollError::DeadlineExceeded(d)) => return Err(Failure::Timeout(d)),
            Err(PollError::Cancelled) => return Err(Failure::Cancelled),
        }
        info!("Snapshot is done!");

        info!("Quitting...");
        client.quit()?;
        Ok(())
    }
}

impl Snapshotter for QmpSnapshotter {
    fn snapshot(
        &mut self,
        tag: &str,
        policy: &PollPolicy,
        clock: &dyn Clock,
        cancel: &CancelToken,
    ) -> Result<()> {
        info!("Making a qemu snapshot through QMP...");
        match self.run(tag, policy, clock, cancel) {
            Ok(()) => Ok(()),
            Err(Failure::Io(e)) => Err(ProvisionError::Snapshot(e.to_string())),
            Err(Failure::Timeout(d)) => Err(ProvisionError::Snapshot(format!(
                "VM did not resume within {d:?}"
            ))),
            Err(Failure::Cancelled) => Err(ProvisionError::Cancelled),
        }
    }
}
