#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use shellbox::frame::{StdFrame, StdFrameCodec, StdStream};
use shellbox::models::{ExecId, SandboxId, UserIdentity, WindowSize};
use shellbox::registry::SandboxRecord;
use shellbox::runtime::{
    ExecSpec, ExecStream, RuntimeClient, RuntimeError, RuntimeResult, SandboxSpec,
};
use shellbox::{Session, Workspace, WorkspaceSettings};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::codec::Encoder;

pub const SHELL_STDERR: &[u8] = b"exit 0\n";

#[derive(Default)]
struct FakeState {
    sandboxes: HashMap<String, SandboxId>,
    running: HashSet<SandboxId>,
    next_id: usize,
    next_exec: usize,
    create_calls: usize,
    inspect_calls: usize,
    starts: usize,
    redundant_starts: usize,
    stops: usize,
    redundant_stops: usize,
    execs: Vec<ExecSpec>,
    resizes: Vec<(ExecId, WindowSize)>,
    stderr_chunks: Option<Vec<Vec<u8>>>,
}

/// In-memory runtime. Each exec behaves like a tiny shell: it reads stdin to
/// the end, then echoes it on stdout and writes [`SHELL_STDERR`] on stderr
/// (framed unless the exec has a tty) and exits.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_exec: AtomicBool,
    pub fail_attach: AtomicBool,
    pub fail_resize: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A runtime that already has `name` from an earlier coordinator process.
    pub fn with_existing(name: &str, id: &str, running: bool) -> Arc<Self> {
        let runtime = Self::default();
        {
            let mut state = runtime.state.lock().unwrap();
            state
                .sandboxes
                .insert(name.to_string(), SandboxId::new(id));
            if running {
                state.running.insert(SandboxId::new(id));
            }
        }
        Arc::new(runtime)
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub fn redundant_starts(&self) -> usize {
        self.state.lock().unwrap().redundant_starts
    }

    pub fn stops(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    pub fn redundant_stops(&self) -> usize {
        self.state.lock().unwrap().redundant_stops
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().unwrap().create_calls
    }

    pub fn inspect_calls(&self) -> usize {
        self.state.lock().unwrap().inspect_calls
    }

    pub fn execs(&self) -> Vec<ExecSpec> {
        self.state.lock().unwrap().execs.clone()
    }

    pub fn resizes(&self) -> Vec<(ExecId, WindowSize)> {
        self.state.lock().unwrap().resizes.clone()
    }

    /// Replaces [`SHELL_STDERR`] with `chunks`, each written as its own frame.
    pub fn set_stderr_chunks(&self, chunks: Vec<Vec<u8>>) {
        self.state.lock().unwrap().stderr_chunks = Some(chunks);
    }

    /// The sandbox exits on its own, without the coordinator asking.
    pub fn exit_sandbox(&self, id: &SandboxId) {
        self.state.lock().unwrap().running.remove(id);
    }

    pub fn is_running(&self, id: &SandboxId) -> bool {
        self.state.lock().unwrap().running.contains(id)
    }

    fn failure(flag: &AtomicBool, operation: &'static str) -> RuntimeResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(RuntimeError::api(operation, "injected failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn create_sandbox(&self, name: &str, _spec: &SandboxSpec) -> RuntimeResult<SandboxId> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        Self::failure(&self.fail_create, "create_sandbox")?;
        if state.sandboxes.contains_key(name) {
            return Err(RuntimeError::AlreadyExists(name.to_string()));
        }
        state.next_id += 1;
        let id = SandboxId::new(format!("S{}", state.next_id));
        state.sandboxes.insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn inspect_sandbox(&self, name: &str) -> RuntimeResult<SandboxId> {
        let mut state = self.state.lock().unwrap();
        state.inspect_calls += 1;
        state
            .sandboxes
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
    }

    async fn start_sandbox(&self, id: &SandboxId) -> RuntimeResult<()> {
        Self::failure(&self.fail_start, "start_sandbox")?;
        let mut state = self.state.lock().unwrap();
        if !state.running.insert(id.clone()) {
            state.redundant_starts += 1;
            return Err(RuntimeError::AlreadyRunning(id.to_string()));
        }
        state.starts += 1;
        Ok(())
    }

    async fn stop_sandbox(&self, id: &SandboxId, grace: Duration) -> RuntimeResult<()> {
        assert_eq!(grace, Duration::from_secs(10));
        Self::failure(&self.fail_stop, "stop_sandbox")?;
        let mut state = self.state.lock().unwrap();
        if !state.running.remove(id) {
            state.redundant_stops += 1;
            return Err(RuntimeError::NotRunning(id.to_string()));
        }
        state.stops += 1;
        Ok(())
    }

    async fn create_exec(&self, id: &SandboxId, spec: &ExecSpec) -> RuntimeResult<ExecId> {
        Self::failure(&self.fail_exec, "create_exec")?;
        let mut state = self.state.lock().unwrap();
        assert!(
            state.running.contains(id),
            "exec created in a sandbox that is not running"
        );
        state.next_exec += 1;
        state.execs.push(spec.clone());
        Ok(ExecId::new(format!("E{}", state.next_exec)))
    }

    async fn attach_exec(&self, _exec: &ExecId, tty: bool) -> RuntimeResult<ExecStream> {
        Self::failure(&self.fail_attach, "attach_exec")?;
        let (client_input, shell_input) = tokio::io::duplex(64 * 1024);
        let (shell_output, client_output) = tokio::io::duplex(64 * 1024);
        let stderr = self
            .state
            .lock()
            .unwrap()
            .stderr_chunks
            .clone()
            .unwrap_or_else(|| vec![SHELL_STDERR.to_vec()]);
        tokio::spawn(fake_shell(shell_input, shell_output, tty, stderr));
        Ok(ExecStream::new(client_output, client_input))
    }

    async fn resize_exec(&self, exec: &ExecId, size: WindowSize) -> RuntimeResult<()> {
        Self::failure(&self.fail_resize, "resize_exec")?;
        self.state
            .lock()
            .unwrap()
            .resizes
            .push((exec.clone(), size));
        Ok(())
    }
}

async fn fake_shell(
    mut input: DuplexStream,
    mut output: DuplexStream,
    tty: bool,
    stderr: Vec<Vec<u8>>,
) {
    let mut received = Vec::new();
    if input.read_to_end(&mut received).await.is_err() {
        return;
    }

    let writes = if tty {
        vec![received]
    } else {
        let mut frames = vec![StdFrame::new(StdStream::Stdout, received)];
        frames.extend(
            stderr
                .into_iter()
                .map(|chunk| StdFrame::new(StdStream::Stderr, chunk)),
        );
        frames
            .into_iter()
            .map(|frame| {
                let mut buf = BytesMut::new();
                StdFrameCodec.encode(frame, &mut buf).unwrap();
                buf.to_vec()
            })
            .collect()
    };
    for bytes in writes {
        if output.write_all(&bytes).await.is_err() || output.flush().await.is_err() {
            return;
        }
        tokio::task::yield_now().await;
    }
    let _ = output.shutdown().await;
}

pub fn settings() -> WorkspaceSettings {
    WorkspaceSettings::new("registry.example/shell:latest", "dev", "/bin/bash")
}

pub fn workspace(runtime: &Arc<FakeRuntime>) -> Arc<Workspace> {
    let runtime: Arc<dyn RuntimeClient> = runtime.clone();
    Arc::new(Workspace::new(runtime, settings()))
}

/// Test-side ends of a session's streams.
pub struct SessionIo {
    pub stdin: DuplexStream,
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
}

impl SessionIo {
    pub async fn finish_input(&mut self, data: &[u8]) {
        self.stdin.write_all(data).await.unwrap();
        self.stdin.shutdown().await.unwrap();
    }

    pub async fn read_outputs(mut self) -> (Vec<u8>, Vec<u8>) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let (out, err) = tokio::join!(
            self.stdout.read_to_end(&mut stdout),
            self.stderr.read_to_end(&mut stderr)
        );
        out.unwrap();
        err.unwrap();
        (stdout, stderr)
    }
}

pub fn session(interactive: bool) -> (Session, SessionIo) {
    let (stdin_tx, stdin_rx) = tokio::io::duplex(64 * 1024);
    let (stdout_tx, stdout_rx) = tokio::io::duplex(64 * 1024);
    let (stderr_tx, stderr_rx) = tokio::io::duplex(64 * 1024);
    (
        Session::new(interactive, stdin_rx, stdout_tx, stderr_tx),
        SessionIo {
            stdin: stdin_tx,
            stdout: stdout_rx,
            stderr: stderr_rx,
        },
    )
}

pub async fn record(workspace: &Workspace, user: &str) -> Arc<SandboxRecord> {
    workspace
        .registry()
        .lookup(&UserIdentity::new(user))
        .await
        .expect("user has a registered sandbox")
}

/// Polls until `check` holds, failing the test after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
