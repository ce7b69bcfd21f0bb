use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("proxmox api error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("vm {0} not found")]
    VmNotFound(i64),

    #[error("vm with id {0} does not exist")]
    InvalidVmId(i64),

    #[error("task {upid} failed: {exit}")]
    TaskFailed { upid: String, exit: String },

    #[error("task {0} timed out")]
    TaskTimeout(String),

    #[error("no free vm id in range {start}-{end}")]
    VmIdRangeExhausted { start: i64, end: i64 },

    #[error("response decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("no template found matching tags {0:?}")]
    TemplateNotFound(Vec<String>),

    #[error("multiple VM templates found on node {0}")]
    MultipleTemplatesFound(String),
}

impl Error {
    /// Classifies this error for the caller's requeue decision, per
    /// spec.md §7: transient-remote gets a bounded requeue, task
    /// failures get recorded and retried, id exhaustion and template
    /// resolution ambiguity are terminal.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Error::Transport(_) | Error::Api { .. } => Some(Duration::from_secs(15)),
            Error::VmNotFound(_) => Some(Duration::from_secs(10)),
            Error::TaskFailed { .. } => Some(Duration::from_secs(30)),
            Error::TaskTimeout(_) => Some(Duration::from_secs(15)),
            Error::Decode(_) => Some(Duration::from_secs(15)),
            Error::InvalidVmId(_)
            | Error::VmIdRangeExhausted { .. }
            | Error::TemplateNotFound(_)
            | Error::MultipleTemplatesFound(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
