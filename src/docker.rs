//! [`RuntimeClient`] backed by the local Docker Engine.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    StartContainerOptions, StopContainerOptionsBuilder,
};
use bollard::Docker;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::io::AsyncRead;
use tokio_util::codec::Encoder;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::frame::{StdFrame, StdFrameCodec, StdStream};
use crate::models::{ExecId, SandboxId, WindowSize};
use crate::runtime::{ExecSpec, ExecStream, RuntimeClient, RuntimeError, RuntimeResult, SandboxSpec};

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connects through `DOCKER_HOST` or the platform's default socket.
    pub fn connect_local() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|source| RuntimeError::api("connect", source))?;
        Ok(Self::new(docker))
    }

    /// Pulls `image`, logging progress as it streams in.
    pub async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        info!("pulling image {image}");
        let options = CreateImageOptionsBuilder::new().from_image(image).build();
        let mut progress = self.docker.create_image(Some(options), None, None);

        while let Some(update) = progress.next().await {
            let update = update.map_err(|source| classify("create_image", image, source))?;
            if let Some(status) = update.status {
                debug!(image, progress = update.progress.as_deref().unwrap_or(""), "{status}");
            }
        }

        info!("image {image} is ready");
        Ok(())
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn create_sandbox(&self, name: &str, spec: &SandboxSpec) -> RuntimeResult<SandboxId> {
        let options = CreateContainerOptionsBuilder::new().name(name).build();
        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            user: Some(spec.user.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|source| classify("create_container", name, source))?;
        Ok(SandboxId::new(created.id))
    }

    async fn inspect_sandbox(&self, name: &str) -> RuntimeResult<SandboxId> {
        let inspected = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|source| classify("inspect_container", name, source))?;
        inspected
            .id
            .map(SandboxId::new)
            .ok_or_else(|| RuntimeError::NotFound(format!("id of container {name}")))
    }

    async fn start_sandbox(&self, id: &SandboxId) -> RuntimeResult<()> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions>)
            .await
            .map_err(|source| classify("start_container", id.as_str(), source))
    }

    async fn stop_sandbox(&self, id: &SandboxId, grace: Duration) -> RuntimeResult<()> {
        let grace_secs = i32::try_from(grace.as_secs()).unwrap_or(i32::MAX);
        let options = StopContainerOptionsBuilder::new().t(grace_secs).build();
        self.docker
            .stop_container(id.as_str(), Some(options))
            .await
            .map_err(|source| classify("stop_container", id.as_str(), source))
    }

    async fn create_exec(&self, id: &SandboxId, spec: &ExecSpec) -> RuntimeResult<ExecId> {
        let options = CreateExecOptions {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(spec.tty),
            user: Some(spec.user.clone()),
            working_dir: Some(spec.working_dir.clone()),
            cmd: Some(spec.command.clone()),
            ..Default::default()
        };

        let created = self
            .docker
            .create_exec(id.as_str(), options)
            .await
            .map_err(|source| classify("create_exec", id.as_str(), source))?;
        Ok(ExecId::new(created.id))
    }

    async fn attach_exec(&self, exec: &ExecId, tty: bool) -> RuntimeResult<ExecStream> {
        let options = StartExecOptions {
            detach: false,
            tty,
            ..Default::default()
        };

        match self
            .docker
            .start_exec(exec.as_str(), Some(options))
            .await
            .map_err(|source| classify("start_exec", exec.as_str(), source))?
        {
            StartExecResults::Attached { output, input } => {
                Ok(ExecStream::new(output_reader(output, tty), input))
            }
            StartExecResults::Detached => Err(RuntimeError::api(
                "start_exec",
                format!("exec {exec} started detached"),
            )),
        }
    }

    async fn resize_exec(&self, exec: &ExecId, size: WindowSize) -> RuntimeResult<()> {
        let options = ResizeExecOptions {
            height: size.height,
            width: size.width,
        };
        self.docker
            .resize_exec(exec.as_str(), options)
            .await
            .map_err(|source| classify("resize_exec", exec.as_str(), source))
    }
}

/// Turns the decoded exec output back into bytes. Tty output is passed through;
/// otherwise every chunk is re-framed so readers see the multiplexed format.
fn output_reader<S>(output: S, tty: bool) -> impl AsyncRead + Send + Unpin + 'static
where
    S: Stream<Item = Result<LogOutput, BollardError>> + Send + Unpin + 'static,
{
    let chunks = output.map(move |chunk| {
        let chunk = chunk.map_err(io::Error::other)?;
        if tty {
            Ok(chunk.into_bytes())
        } else {
            encode_log_output(chunk)
        }
    });
    StreamReader::new(chunks)
}

fn encode_log_output(chunk: LogOutput) -> io::Result<Bytes> {
    let frame = match chunk {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            StdFrame::new(StdStream::Stdout, message)
        }
        LogOutput::StdErr { message } => StdFrame::new(StdStream::Stderr, message),
        LogOutput::StdIn { message } => StdFrame::new(StdStream::Stdin, message),
    };

    let mut buf = BytesMut::new();
    StdFrameCodec.encode(frame, &mut buf)?;
    Ok(buf.freeze())
}

fn classify(operation: &'static str, target: &str, error: BollardError) -> RuntimeError {
    match &error {
        BollardError::DockerResponseServerError { status_code, .. } => match (operation, *status_code) {
            ("create_container", 409) => RuntimeError::AlreadyExists(target.to_owned()),
            ("start_container", 304 | 409) => RuntimeError::AlreadyRunning(target.to_owned()),
            ("stop_container", 304) => RuntimeError::NotRunning(target.to_owned()),
            (_, 404) => RuntimeError::NotFound(target.to_owned()),
            _ => RuntimeError::api(operation, format!("{target}: {error}")),
        },
        _ => RuntimeError::api(operation, format!("{target}: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{StdFrameCodec, HEADER_LEN};
    use tokio::io::AsyncReadExt;
    use tokio_util::codec::Decoder;

    fn server_error(status_code: u16) -> BollardError {
        BollardError::DockerResponseServerError {
            status_code,
            message: "from daemon".to_string(),
        }
    }

    #[test]
    fn classifies_conflicts_by_operation() {
        assert!(matches!(
            classify("create_container", "user-alice", server_error(409)),
            RuntimeError::AlreadyExists(name) if name == "user-alice"
        ));
        assert!(matches!(
            classify("start_container", "abc", server_error(304)),
            RuntimeError::AlreadyRunning(_)
        ));
        assert!(matches!(
            classify("stop_container", "abc", server_error(304)),
            RuntimeError::NotRunning(id) if id == "abc"
        ));
        assert!(matches!(
            classify("stop_container", "abc", server_error(409)),
            RuntimeError::Api { operation: "stop_container", .. }
        ));
        assert!(matches!(
            classify("inspect_container", "user-bob", server_error(404)),
            RuntimeError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn non_tty_output_is_reframed() {
        let chunks = futures::stream::iter(vec![
            Ok(LogOutput::StdOut {
                message: Bytes::from_static(b"out"),
            }),
            Ok(LogOutput::StdErr {
                message: Bytes::from_static(b"err"),
            }),
        ]);
        let mut reader = output_reader(chunks, false);
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await.unwrap();

        assert_eq!(raw.len(), 2 * HEADER_LEN + 6);
        let mut buf = BytesMut::from(&raw[..]);
        let first = StdFrameCodec.decode(&mut buf).unwrap().unwrap();
        let second = StdFrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, StdFrame::new(StdStream::Stdout, &b"out"[..]));
        assert_eq!(second, StdFrame::new(StdStream::Stderr, &b"err"[..]));
    }

    #[tokio::test]
    async fn tty_output_passes_through() {
        let chunks = futures::stream::iter(vec![Ok(LogOutput::Console {
            message: Bytes::from_static(b"$ ls\r\n"),
        })]);
        let mut reader = output_reader(chunks, true);
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw, b"$ ls\r\n");
    }
}
