use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::WorkspaceSettings;
use crate::errors::{SandboxError, SandboxResult};
use crate::lifecycle::LifecycleManager;
use crate::models::{SandboxSummary, UserIdentity};
use crate::registry::SandboxRegistry;
use crate::runtime::RuntimeClient;
use crate::session::{Session, SessionConnector};

/// Owns the registry and wires the lifecycle manager and session connector to
/// one runtime. Construct one per process and share it behind an `Arc`.
pub struct Workspace {
    settings: Arc<WorkspaceSettings>,
    registry: SandboxRegistry,
    lifecycle: Arc<LifecycleManager>,
    connector: SessionConnector,
}

impl Workspace {
    pub fn new(runtime: Arc<dyn RuntimeClient>, settings: WorkspaceSettings) -> Self {
        let settings = Arc::new(settings);
        let registry = SandboxRegistry::new();
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&runtime),
            registry.clone(),
            Arc::clone(&settings),
        ));
        let connector = SessionConnector::new(
            runtime,
            registry.clone(),
            Arc::clone(&lifecycle),
            Arc::clone(&settings),
        );

        Self {
            settings,
            registry,
            lifecycle,
            connector,
        }
    }

    pub fn settings(&self) -> &WorkspaceSettings {
        &self.settings
    }

    pub fn registry(&self) -> &SandboxRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Makes sure `user` has a registered sandbox. Safe to call repeatedly.
    pub async fn ensure_user_sandbox(&self, user: &UserIdentity) -> SandboxResult<()> {
        validate_user(user)?;
        self.lifecycle.ensure_created(user).await.map(|_| ())
    }

    pub async fn connect(
        &self,
        user: &UserIdentity,
        session: Session,
        cancel: &CancellationToken,
    ) -> SandboxResult<()> {
        self.connector.connect(user, session, cancel).await
    }

    /// Sandbox removal is not supported: the sandbox and its record are kept.
    pub async fn remove_user_sandbox(&self, user: &UserIdentity) -> SandboxResult<()> {
        debug!(%user, "sandbox removal requested; sandboxes are kept for the process lifetime");
        Ok(())
    }

    pub async fn summary(&self, user: &UserIdentity) -> SandboxResult<SandboxSummary> {
        let record = self
            .registry
            .lookup(user)
            .await
            .ok_or_else(|| SandboxError::SandboxLookupFailed(user.clone()))?;
        Ok(record.summary().await)
    }

    pub fn spawn_stop_retry_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let every = self.settings.stop_retry_interval;
        tokio::spawn(Arc::clone(&self.lifecycle).run_stop_retry_loop(every, cancel))
    }
}

/// Identities become part of a container name, so they are held to the
/// characters container names allow.
fn validate_user(user: &UserIdentity) -> SandboxResult<()> {
    let raw = user.as_str();
    if raw.is_empty() {
        return Err(SandboxError::InvalidRequest("user identity is empty".into()));
    }
    let valid = raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid {
        return Err(SandboxError::InvalidRequest(format!(
            "user identity {raw:?} contains characters not allowed in sandbox names"
        )));
    }
    Ok(())
}
