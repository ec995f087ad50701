use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkspaceSettings;
use crate::errors::{SandboxError, SandboxResult};
use crate::models::{SandboxState, UserIdentity};
use crate::registry::{SandboxRecord, SandboxRegistry};
use crate::runtime::{RuntimeClient, RuntimeError};

/// Creates, starts and stops user sandboxes.
pub struct LifecycleManager {
    runtime: Arc<dyn RuntimeClient>,
    registry: SandboxRegistry,
    settings: Arc<WorkspaceSettings>,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        registry: SandboxRegistry,
        settings: Arc<WorkspaceSettings>,
    ) -> Self {
        Self {
            runtime,
            registry,
            settings,
        }
    }

    /// Creates the user's sandbox, or adopts it if the runtime already has one
    /// under the user's name, and registers it.
    pub async fn ensure_created(&self, user: &UserIdentity) -> SandboxResult<Arc<SandboxRecord>> {
        let name = user.sandbox_name();
        let create_failed = |source| SandboxError::SandboxCreateFailed {
            user: user.clone(),
            source,
        };

        let (id, state) = match self
            .runtime
            .create_sandbox(&name, &self.settings.sandbox_spec())
            .await
        {
            Ok(id) => {
                info!(%user, sandbox = %id, "created sandbox {name}");
                (id, SandboxState::Created)
            }
            Err(RuntimeError::AlreadyExists(_)) => {
                let id = self
                    .runtime
                    .inspect_sandbox(&name)
                    .await
                    .map_err(create_failed)?;
                info!(%user, sandbox = %id, "adopted existing sandbox {name}");
                (id, SandboxState::Unknown)
            }
            Err(source) => return Err(create_failed(source)),
        };

        let record = self
            .registry
            .register(SandboxRecord::new(
                user.clone(),
                id.clone(),
                state,
                self.settings.max_sessions,
            ))
            .await;

        if record.sandbox_id() != &id {
            warn!(
                %user,
                registered = %record.sandbox_id(),
                reported = %id,
                "runtime reports a different sandbox than the registered one; keeping registered"
            );
        }

        Ok(record)
    }

    /// Starts the sandbox. The recorded state is not trusted: the sandbox may
    /// have exited on its own, so the runtime is always asked and "already
    /// running" counts as success.
    pub async fn ensure_running(&self, record: &SandboxRecord) -> SandboxResult<()> {
        let mut state = record.lock_state().await;

        match self.runtime.start_sandbox(record.sandbox_id()).await {
            Ok(()) => info!(user = %record.user(), sandbox = %record.sandbox_id(), "started sandbox"),
            Err(RuntimeError::AlreadyRunning(_)) => {
                debug!(user = %record.user(), "sandbox was already running")
            }
            Err(source) => {
                return Err(SandboxError::SandboxStartFailed {
                    user: record.user().clone(),
                    source,
                })
            }
        }

        *state = SandboxState::Running;
        Ok(())
    }

    /// Stops the sandbox if no session is attached. Returns whether a stop was
    /// issued. A failed stop leaves the record marked for the retry loop.
    pub async fn stop_if_drained(&self, record: &SandboxRecord) -> SandboxResult<bool> {
        let mut state = record.lock_state().await;

        if record.active_sessions() > 0 {
            debug!(user = %record.user(), "session attached while draining; keeping sandbox");
            record.set_stop_pending(false);
            return Ok(false);
        }
        // Unknown means no start has succeeded since adoption.
        if matches!(
            *state,
            SandboxState::Unknown | SandboxState::Created | SandboxState::Stopped
        ) {
            record.set_stop_pending(false);
            return Ok(false);
        }

        match self
            .runtime
            .stop_sandbox(record.sandbox_id(), self.settings.stop_grace)
            .await
        {
            Ok(()) => {
                *state = SandboxState::Stopped;
                record.set_stop_pending(false);
                info!(user = %record.user(), sandbox = %record.sandbox_id(), "stopped drained sandbox");
                Ok(true)
            }
            Err(RuntimeError::NotRunning(_)) => {
                *state = SandboxState::Stopped;
                record.set_stop_pending(false);
                warn!(user = %record.user(), sandbox = %record.sandbox_id(), "drained sandbox had already exited");
                Ok(false)
            }
            Err(source) => {
                record.set_stop_pending(true);
                Err(SandboxError::SandboxStopFailed {
                    user: record.user().clone(),
                    source,
                })
            }
        }
    }

    /// Retries every stop still owed. Returns how many sandboxes were stopped.
    pub async fn retry_pending_stops(&self) -> usize {
        let mut stopped = 0;
        for record in self.registry.records().await {
            if !record.is_stop_pending() {
                continue;
            }
            match self.stop_if_drained(&record).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(error) => warn!(%error, "sandbox stop retry failed"),
            }
        }
        stopped
    }

    pub async fn run_stop_retry_loop(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let stopped = self.retry_pending_stops().await;
                    if stopped > 0 {
                        info!(stopped, "stopped sandboxes on retry");
                    }
                }
            }
        }
        debug!("stop retry loop exited");
    }
}
