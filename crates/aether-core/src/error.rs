// Error types for the kernel

use thiserror::Error;

use crate::types::{Pid, ProcessState};

/// Result type alias for kernel operations
pub type Result<T> = std::result::Result<T, KernelError>;

/// Errors that can occur inside the kernel
#[derive(Debug, Error)]
pub enum KernelError {
    /// Spawn admission rejected: a concurrency cap was reached
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The sandbox layer refused to create or operate an environment
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    /// A process state transition that the state machine forbids
    #[error("invalid state transition for pid {pid}: {from:?} -> {to:?}")]
    InvalidState {
        pid: Pid,
        from: ProcessState,
        to: ProcessState,
    },

    /// Referenced process does not exist (or was reaped)
    #[error("no such process: {0}")]
    NoSuchProcess(Pid),

    /// A request or tool argument failed validation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// LLM provider error (after the retry budget is exhausted)
    #[error("llm error: {0}")]
    Llm(String),

    /// Tool execution error
    #[error("tool error: {0}")]
    Tool(String),

    /// Persistence layer error
    #[error("storage error: {0}")]
    Storage(String),

    /// A required subsystem is not available yet
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The operation was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Timed out waiting on an external signal
    #[error("timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl KernelError {
    /// Create a quota error
    pub fn quota(msg: impl Into<String>) -> Self {
        KernelError::QuotaExceeded(msg.into())
    }

    /// Create a sandbox error
    pub fn sandbox(msg: impl Into<String>) -> Self {
        KernelError::SandboxUnavailable(msg.into())
    }

    /// Create an invalid-argument error
    pub fn invalid(msg: impl Into<String>) -> Self {
        KernelError::InvalidArgument(msg.into())
    }

    /// Create an LLM error
    pub fn llm(msg: impl Into<String>) -> Self {
        KernelError::Llm(msg.into())
    }

    /// Create a tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        KernelError::Tool(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        KernelError::Storage(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        KernelError::Unavailable(msg.into())
    }

    /// Create an invalid-transition error
    pub fn invalid_state(pid: Pid, from: ProcessState, to: ProcessState) -> Self {
        KernelError::InvalidState { pid, from, to }
    }

    /// Protocol error code for this error (spec'd wire codes)
    pub fn code(&self) -> &'static str {
        match self {
            KernelError::QuotaExceeded(_) => "quota_exceeded",
            KernelError::SandboxUnavailable(_) => "unavailable",
            KernelError::InvalidState { .. } => "invalid_argument",
            KernelError::NoSuchProcess(_) => "not_found",
            KernelError::InvalidArgument(_) => "invalid_argument",
            KernelError::Llm(_) => "unavailable",
            KernelError::Tool(_) => "internal",
            KernelError::Storage(_) => "internal",
            KernelError::Unavailable(_) => "unavailable",
            KernelError::Cancelled => "unavailable",
            KernelError::Timeout(_) => "unavailable",
            KernelError::Internal(_) => "internal",
        }
    }
}
