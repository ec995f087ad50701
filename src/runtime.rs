//! Contract with the container runtime that hosts the sandboxes.
//!
//! The coordinator never talks to a concrete engine directly. Everything it
//! needs (create, inspect, start, stop, and the exec create/attach/resize
//! trio) goes through [`RuntimeClient`], so the lifecycle and session logic
//! can run against Docker in production and an in-memory fake in tests.

use crate::models::{ExecId, SandboxId, WindowSize};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A sandbox with the requested name already exists.
    #[error("sandbox {0} already exists")]
    AlreadyExists(String),
    /// Start was requested for a sandbox that is already running.
    #[error("sandbox {0} is already running")]
    AlreadyRunning(String),
    /// Stop was requested for a sandbox that is not running.
    #[error("sandbox {0} is not running")]
    NotRunning(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("runtime operation `{operation}` failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn api(operation: &'static str, message: impl fmt::Display) -> Self {
        Self::Api {
            operation,
            message: message.to_string(),
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Container configuration used when a user's sandbox is first created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxSpec {
    pub image: String,
    pub user: String,
}

/// Configuration of one execution context (a shell bound to one session).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecSpec {
    pub user: String,
    pub working_dir: String,
    pub command: Vec<String>,
    pub tty: bool,
}

/// Bidirectional byte stream of an attached execution context.
///
/// `output` yields raw bytes for tty execs and the 8-byte-header frames of
/// [`crate::frame`] otherwise. Shutting `input` down half-closes the exec's
/// stdin without touching `output`.
pub struct ExecStream {
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
}

impl ExecStream {
    pub fn new(
        output: impl AsyncRead + Send + Unpin + 'static,
        input: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            output: Box::new(output),
            input: Box::new(input),
        }
    }
}

impl fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecStream").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait RuntimeClient: Send + Sync + 'static {
    /// Fails with [`RuntimeError::AlreadyExists`] when `name` is taken.
    async fn create_sandbox(&self, name: &str, spec: &SandboxSpec) -> RuntimeResult<SandboxId>;
    async fn inspect_sandbox(&self, name: &str) -> RuntimeResult<SandboxId>;
    /// Fails with [`RuntimeError::AlreadyRunning`] when the sandbox is up.
    async fn start_sandbox(&self, id: &SandboxId) -> RuntimeResult<()>;
    /// Fails with [`RuntimeError::NotRunning`] when the sandbox is already down.
    async fn stop_sandbox(&self, id: &SandboxId, grace: Duration) -> RuntimeResult<()>;
    async fn create_exec(&self, id: &SandboxId, spec: &ExecSpec) -> RuntimeResult<ExecId>;
    async fn attach_exec(&self, exec: &ExecId, tty: bool) -> RuntimeResult<ExecStream>;
    async fn resize_exec(&self, exec: &ExecId, size: WindowSize) -> RuntimeResult<()>;
}
