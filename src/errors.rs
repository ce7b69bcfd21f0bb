//! Typed errors for the reconcile loops.
//!
//! Two tiers: `proxmox::Error` classifies failures coming back from the
//! remote API (§4.7), `Error` here classifies what a reconcile phase does
//! with them, per the table in spec.md §7.

use std::time::Duration;

use thiserror::Error;

/// Error produced by a reconcile phase.
///
/// `error_policy` is the single place that turns one of these into a
/// `kube::runtime::controller::Action` — phases never call
/// `Action::requeue` themselves.
#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("finalizer error: {0}")]
    Finalizer(#[from] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("proxmox error: {0}")]
    Proxmox(#[from] crate::proxmox::Error),

    #[error("waiting: {0}")]
    Waiting(String),

    #[error("transient: {0}")]
    Transient(String),

    /// Spec cannot be satisfied by reconciling again; `HasFailed()` becomes
    /// true and no further reconciliation happens until the spec changes.
    #[error("terminal failure [{reason}]: {message}")]
    Terminal { reason: String, message: String },

    #[error("invalid spec: {0}")]
    InvalidSpec(String),
}

impl Error {
    pub fn terminal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Terminal {
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn waiting(message: impl Into<String>) -> Self {
        Error::Waiting(message.into())
    }

    /// How long `error_policy` should wait before requeueing, if this
    /// error kind calls for a bounded requeue rather than a terminal stop.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Error::Waiting(_) => Some(Duration::from_secs(10)),
            Error::Transient(_) => Some(Duration::from_secs(15)),
            Error::Kube(_) => Some(Duration::from_secs(15)),
            Error::Proxmox(e) => e.requeue_after(),
            Error::Finalizer(_) => Some(Duration::from_secs(15)),
            Error::Terminal { .. } | Error::InvalidSpec(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Terminal { .. } | Error::InvalidSpec(_))
    }

    /// `(reason, message)` for recording a terminal failure onto a
    /// resource's status and in a `Warning` event. Non-terminal variants
    /// still produce a pair so callers never need an `Option` here, but
    /// `is_terminal()` should gate whether this is actually called.
    pub fn terminal_parts(&self) -> (String, String) {
        match self {
            Error::Terminal { reason, message } => (reason.clone(), message.clone()),
            Error::InvalidSpec(message) => ("InvalidSpec".to_string(), message.clone()),
            other => ("ReconcileFailed".to_string(), other.to_string()),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
