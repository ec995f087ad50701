use std::time::Duration;

use crate::runtime::{ExecSpec, SandboxSpec};

pub const DEFAULT_MAX_SESSIONS: usize = 20;
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_STOP_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Process-wide sandbox settings, fixed at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkspaceSettings {
    /// Image every user sandbox runs.
    pub image: String,
    /// Account shells run as inside the sandbox.
    pub user: String,
    /// Command launched for every session.
    pub command: String,
    pub max_sessions: usize,
    pub stop_grace: Duration,
    pub stop_retry_interval: Duration,
}

impl WorkspaceSettings {
    pub fn new(
        image: impl Into<String>,
        user: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            image: image.into(),
            user: user.into(),
            command: command.into(),
            max_sessions: DEFAULT_MAX_SESSIONS,
            stop_grace: DEFAULT_STOP_GRACE,
            stop_retry_interval: DEFAULT_STOP_RETRY_INTERVAL,
        }
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn with_stop_grace(mut self, stop_grace: Duration) -> Self {
        self.stop_grace = stop_grace;
        self
    }

    pub fn with_stop_retry_interval(mut self, interval: Duration) -> Self {
        self.stop_retry_interval = interval;
        self
    }

    pub fn working_dir(&self) -> String {
        format!("/home/{}", self.user)
    }

    pub fn sandbox_spec(&self) -> SandboxSpec {
        SandboxSpec {
            image: self.image.clone(),
            user: self.user.clone(),
        }
    }

    pub fn exec_spec(&self, tty: bool) -> ExecSpec {
        ExecSpec {
            user: self.user.clone(),
            working_dir: self.working_dir(),
            command: vec![self.command.clone()],
            tty,
        }
    }
}
