// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid flow graph: {0}")]
    InvalidGraph(String),

    #[error("Flow run not found: {0}")]
    FlowRunNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Node index {index} out of range for flow run {flow_run_id}")]
    NodeNotFound { flow_run_id: String, index: usize },

    /// The resource gate refused to create a new unit of work.
    #[error("{reason} (account {account_id})")]
    QuotaExhausted { account_id: String, reason: String },

    #[error("Invalid condition: {0}")]
    InvalidCondition(String),

    #[error("No handler registered for {0}")]
    MissingHandler(String),

    #[error("{task} handler failed: {reason}")]
    HandlerFailed { task: String, reason: String },

    #[error("Job queue closed")]
    QueueClosed,

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, FlowError>;
