pub mod api;
pub mod config;
pub mod docker;
pub mod errors;
pub mod frame;
pub mod lifecycle;
pub mod models;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod workspace;

pub use api::build_router;
pub use config::WorkspaceSettings;
pub use docker::DockerRuntime;
pub use errors::{SandboxError, SandboxResult};
pub use runtime::RuntimeClient;
pub use session::Session;
pub use workspace::Workspace;

pub const DEFAULT_HTTP_PORT: u16 = 46841;
