//! Error taxonomy for a provisioning run.
//!
//! Every variant is fatal for the run. Conditions that are only logged
//! (intermediate cleanup, guest uploads, individual guest commands) never
//! surface as a `ProvisionError`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A fatal provisioning failure.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to download {url}: {message}")]
    Download { url: String, message: String },

    #[error("failed to extract {member} from {archive:?}: {message}")]
    Extraction {
        archive: PathBuf,
        member: String,
        message: String,
    },

    #[error("failed to convert {source_disk:?} to qcow2: {message}")]
    Conversion { source_disk: PathBuf, message: String },

    #[error("could not connect to the guest SSH server after {attempts} attempts: {last}")]
    Connection { attempts: u32, last: String },

    #[error("agent service is not running in the guest (state: {state})")]
    AgentNotRunning { state: String },

    #[error("could not make the snapshot: {0}")]
    Snapshot(String),

    #[error("container runtime failure: {0}")]
    Container(String),

    #[error("failed to replicate worker image {index}: {source}")]
    Replication {
        index: i64,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write environment file {path:?}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to clean {path:?}: {source}")]
    Clean {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("another provisioning run holds {0:?}")]
    Locked(PathBuf),

    #[error("guest did not go down for reboot within {0:?}")]
    RebootTimeout(Duration),

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;
