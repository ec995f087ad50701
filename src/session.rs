//! Attaching one shell session to a user's shared sandbox.
//!
//! A session takes a slot on the user's record, makes sure the sandbox is
//! running, starts a fresh exec inside it and then relays bytes until the
//! exec's output ends. Three tasks are involved per session:
//!
//! - the output copy, run inline; its outcome is the session's outcome
//! - the stdin pump, spawned and never awaited (stdin may never close)
//! - the resize forwarder, spawned for interactive sessions and joined on exit
//!
//! All of them observe a per-session [`CancellationToken`] derived from the
//! caller's token, so ending the caller's token ends the session.

use std::fmt;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, Instrument, Span};
use uuid::Uuid;

use crate::config::WorkspaceSettings;
use crate::errors::{SandboxError, SandboxResult};
use crate::frame;
use crate::lifecycle::LifecycleManager;
use crate::models::{ExecId, UserIdentity, WindowSize};
use crate::registry::{SandboxRecord, SandboxRegistry, SessionLease};
use crate::runtime::{ExecStream, RuntimeClient};

/// One attached shell connection.
pub struct Session {
    pub interactive: bool,
    pub resize_events: Option<BoxStream<'static, WindowSize>>,
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

impl Session {
    pub fn new(
        interactive: bool,
        stdin: impl AsyncRead + Send + Unpin + 'static,
        stdout: impl AsyncWrite + Send + Unpin + 'static,
        stderr: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            interactive,
            resize_events: None,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }

    pub fn with_resize_events(
        mut self,
        events: impl Stream<Item = WindowSize> + Send + 'static,
    ) -> Self {
        self.resize_events = Some(events.boxed());
        self
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("interactive", &self.interactive)
            .field("resize_events", &self.resize_events.is_some())
            .finish_non_exhaustive()
    }
}

pub struct SessionConnector {
    runtime: Arc<dyn RuntimeClient>,
    registry: SandboxRegistry,
    lifecycle: Arc<LifecycleManager>,
    settings: Arc<WorkspaceSettings>,
}

impl SessionConnector {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        registry: SandboxRegistry,
        lifecycle: Arc<LifecycleManager>,
        settings: Arc<WorkspaceSettings>,
    ) -> Self {
        Self {
            runtime,
            registry,
            lifecycle,
            settings,
        }
    }

    /// Runs `session` against the user's sandbox until its output ends.
    ///
    /// Fails fast with [`SandboxError::SandboxLookupFailed`] when the user has
    /// no sandbox and with [`SandboxError::SessionCapacityExceeded`] when all
    /// slots are taken; neither touches sandbox state.
    pub async fn connect(
        &self,
        user: &UserIdentity,
        session: Session,
        cancel: &CancellationToken,
    ) -> SandboxResult<()> {
        let record = self
            .registry
            .lookup(user)
            .await
            .ok_or_else(|| SandboxError::SandboxLookupFailed(user.clone()))?;
        let lease = record
            .try_acquire()
            .ok_or_else(|| SandboxError::SessionCapacityExceeded {
                user: user.clone(),
                capacity: record.capacity(),
            })?;

        let span = info_span!("session", %user, session = %Uuid::new_v4());
        async move {
            debug!(active = record.active_sessions(), "session attached");
            let result = self.relay(&record, session, cancel).await;
            if let Err(error) = &result {
                debug!(%error, "session ended with error");
            }
            self.detach(lease).await;
            result
        }
        .instrument(span)
        .await
    }

    async fn relay(
        &self,
        record: &SandboxRecord,
        session: Session,
        cancel: &CancellationToken,
    ) -> SandboxResult<()> {
        let user = record.user();
        self.lifecycle.ensure_running(record).await?;

        let Session {
            interactive,
            resize_events,
            stdin,
            mut stdout,
            mut stderr,
        } = session;

        let exec = self
            .runtime
            .create_exec(record.sandbox_id(), &self.settings.exec_spec(interactive))
            .await
            .map_err(|source| SandboxError::ExecContextCreateFailed {
                user: user.clone(),
                source,
            })?;
        debug!(%exec, interactive, "exec created");

        let ExecStream { output, input } = self
            .runtime
            .attach_exec(&exec, interactive)
            .await
            .map_err(|source| SandboxError::ExecAttachFailed {
                user: user.clone(),
                source,
            })?;

        let session_token = cancel.child_token();
        let _cancel_on_exit = session_token.clone().drop_guard();

        let resizer = match resize_events {
            Some(events) if interactive => Some(spawn_resize_forwarder(
                Arc::clone(&self.runtime),
                exec.clone(),
                events,
                session_token.clone(),
            )),
            _ => None,
        };

        tokio::spawn(pump_stdin(stdin, input, session_token.clone()).instrument(Span::current()));

        let copy = async {
            let mut output = output;
            if interactive {
                tokio::io::copy(&mut output, &mut stdout).await?;
                stdout.flush().await
            } else {
                frame::demux(output, &mut stdout, &mut stderr)
                    .await
                    .map(|_| ())
            }
        };

        let result = tokio::select! {
            copied = copy => copied.map_err(SandboxError::StreamCopyFailed),
            _ = session_token.cancelled() => Err(SandboxError::SessionCancelled),
        };

        session_token.cancel();
        if let Some(resizer) = resizer {
            let _ = resizer.await;
        }
        result
    }

    async fn detach(&self, lease: SessionLease) {
        let record = Arc::clone(lease.record());
        if !lease.release() {
            return;
        }

        debug!("last session detached");
        if let Err(error) = self.lifecycle.stop_if_drained(&record).await {
            error!(%error, "failed to stop drained sandbox; stop will be retried");
        }
    }
}

fn spawn_resize_forwarder(
    runtime: Arc<dyn RuntimeClient>,
    exec: ExecId,
    mut events: BoxStream<'static, WindowSize>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let task = async move {
        loop {
            let size = tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.next() => match next {
                    Some(size) => size,
                    None => break,
                },
            };
            if let Err(error) = runtime.resize_exec(&exec, size).await {
                debug!(%error, "resize failed; no longer forwarding resizes");
                break;
            }
        }
    };
    tokio::spawn(task.instrument(Span::current()))
}

async fn pump_stdin(
    mut stdin: Box<dyn AsyncRead + Send + Unpin>,
    mut input: Box<dyn AsyncWrite + Send + Unpin>,
    cancel: CancellationToken,
) {
    let copied = tokio::select! {
        _ = cancel.cancelled() => return,
        copied = tokio::io::copy(&mut stdin, &mut input) => copied,
    };
    match copied {
        Ok(bytes) => debug!(bytes, "stdin exhausted"),
        Err(error) => debug!(%error, "stdin copy stopped"),
    }
    if let Err(error) = input.shutdown().await {
        debug!(%error, "failed to half-close exec stdin");
    }
}
