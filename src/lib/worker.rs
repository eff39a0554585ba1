//! # Worker Process Handle
//!
//! A `Worker` owns one child process running the `isobench-worker` binary
//! and the two pipes used to talk to it. Requests are written straight to the
//! child's stdin. Responses are decoded from its stdout on a dedicated reader
//! thread and handed over through a channel, so `receive` can wait in bounded
//! slices and check in between whether the child is still alive.
//!
//! ## Lifecycle
//!
//! ```text
//!   Unstarted --initialize()--> Ready --child exits--> Dead
//!       ^                        |  ^                   |
//!       |                        |  +---send() respawns-+
//!       +------terminate()-------+
//! ```

use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{WorkerConfig, ENV_VISIBLE_DEVICES};
use crate::ipc::{read_frame, write_frame, ProtocolError, Request, Response};
use crate::task::BenchmarkTask;

/// Interval between liveness checks while reaping a child.
const REAP_POLL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to spawn worker {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("worker I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("worker protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("worker process died ({status})")]
    Died { status: ExitStatus },
    #[error("worker did not answer the handshake within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("expected {expected} from worker, got {got}")]
    UnexpectedResponse { expected: &'static str, got: String },
    #[error("worker is not running")]
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No child yet, or the last one was terminated cleanly.
    Unstarted,
    /// The child answered the handshake and has not been seen exiting.
    Ready,
    /// The child exited on its own or was killed.
    Dead,
}

struct Process {
    child: Child,
    requests: Option<ChildStdin>,
    responses: Receiver<Result<Response, ProtocolError>>,
    _reader: JoinHandle<()>,
}

/// Handle to one crash-isolated benchmark process.
pub struct Worker {
    config: WorkerConfig,
    device: Option<u32>,
    state: WorkerState,
    process: Option<Process>,
    spawn_count: usize,
}

impl Worker {
    /// A worker pinned to `device`, or inheriting the parent's devices when
    /// `None`. Nothing is spawned until `initialize` or `send`.
    pub fn new(config: WorkerConfig, device: Option<u32>) -> Self {
        Self {
            config,
            device,
            state: WorkerState::Unstarted,
            process: None,
            spawn_count: 0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn device(&self) -> Option<u32> {
        self.device
    }

    /// Number of child processes started so far, including respawns.
    pub fn spawn_count(&self) -> usize {
        self.spawn_count
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.child.id())
    }

    pub fn is_ready(&self) -> bool {
        self.state == WorkerState::Ready
    }

    /// Spawn the child and complete the Ping/Pong handshake. No-op when
    /// already Ready.
    pub fn initialize(&mut self) -> Result<(), WorkerError> {
        if self.state == WorkerState::Ready {
            return Ok(());
        }
        self.kill();
        self.start()?;
        if let Err(e) = self.handshake() {
            warn!("[WORKER:INIT] Handshake failed: {}", e);
            self.kill();
            return Err(e);
        }
        self.state = WorkerState::Ready;
        info!(
            "[WORKER:INIT] Worker ready (PID: {:?}, device: {:?})",
            self.pid(),
            self.device
        );
        Ok(())
    }

    /// Queue a request for the child, respawning it first if it has died.
    pub fn send(&mut self, request: &Request) -> Result<(), WorkerError> {
        self.ensure_ready()?;
        self.write(request)
    }

    /// Wait for the next response, polling in `poll_interval` slices.
    /// Fails with `Died` once the child is seen to have exited.
    pub fn receive(&mut self) -> Result<Response, WorkerError> {
        self.receive_until(None)
    }

    /// Send a task and wait for its latency in milliseconds.
    pub fn benchmark(&mut self, task: &BenchmarkTask) -> Result<f64, WorkerError> {
        self.send(&Request::Benchmark(Box::new(task.clone())))?;
        match self.receive()? {
            Response::Latency(ms) => Ok(ms),
            other => Err(WorkerError::UnexpectedResponse {
                expected: "latency",
                got: other.describe(),
            }),
        }
    }

    /// Ask a Ready child to stop and close its request pipe. Pair with
    /// `join`; splitting the two lets a pool stop every child before waiting
    /// on any of them.
    pub fn request_stop(&mut self) {
        if self.state != WorkerState::Ready {
            return;
        }
        if let Some(process) = self.process.as_mut() {
            if let Some(mut requests) = process.requests.take() {
                if let Err(e) = write_frame(&mut requests, &Request::Stop) {
                    debug!("[WORKER:STOP] Stop not delivered: {}", e);
                }
            }
        }
    }

    /// Wait up to the shutdown grace for the child to exit, then kill it.
    /// The worker is Unstarted afterwards, whatever state it was in.
    pub fn join(&mut self) {
        let Some(mut process) = self.process.take() else {
            self.state = WorkerState::Unstarted;
            return;
        };
        drop(process.requests.take());
        let status = match wait_timeout(&mut process.child, self.config.shutdown_grace) {
            Ok(Some(status)) => Some(status),
            Ok(None) => {
                warn!(
                    "[WORKER:STOP] PID {} ignored stop for {:?}, killing",
                    process.child.id(),
                    self.config.shutdown_grace
                );
                force_reap(&mut process.child)
            }
            Err(e) => {
                warn!("[WORKER:STOP] Failed to wait for PID {}: {}", process.child.id(), e);
                force_reap(&mut process.child)
            }
        };
        debug!("[WORKER:STOP] PID {} exited: {:?}", process.child.id(), status);
        self.state = WorkerState::Unstarted;
    }

    /// Stop the child gracefully and clear the handles.
    pub fn terminate(&mut self) {
        self.request_stop();
        self.join();
    }

    /// Kill the child without asking, reap it and mark the worker Dead.
    pub fn kill(&mut self) {
        if let Some(mut process) = self.process.take() {
            drop(process.requests.take());
            force_reap(&mut process.child);
            self.state = WorkerState::Dead;
        }
    }

    fn start(&mut self) -> Result<(), WorkerError> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .envs(&self.config.envs)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(device) = self.device {
            cmd.env(ENV_VISIBLE_DEVICES, device.to_string());
        }

        let mut child = cmd.spawn().map_err(|source| WorkerError::Spawn {
            program: self.config.program.clone(),
            source,
        })?;
        let pid = child.id();

        let pipes = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => Ok((stdin, stdout)),
            _ => Err(io::Error::new(ErrorKind::BrokenPipe, "child pipes not captured")),
        };
        let reader = pipes.and_then(|(stdin, stdout)| {
            let (tx, rx) = mpsc::channel();
            thread::Builder::new()
                .name(format!("isobench-reader-{}", pid))
                .spawn(move || read_responses(stdout, tx))
                .map(|handle| (stdin, rx, handle))
        });
        let (requests, responses, handle) = match reader {
            Ok(parts) => parts,
            Err(e) => {
                force_reap(&mut child);
                return Err(e.into());
            }
        };

        self.process = Some(Process {
            child,
            requests: Some(requests),
            responses,
            _reader: handle,
        });
        self.spawn_count += 1;
        debug!(
            "[WORKER:SPAWN] Started {:?} (PID: {}, spawn #{})",
            self.config.program, pid, self.spawn_count
        );
        Ok(())
    }

    fn handshake(&mut self) -> Result<(), WorkerError> {
        self.write(&Request::Ping)?;
        let deadline = Instant::now() + self.config.handshake_timeout;
        match self.receive_until(Some(deadline))? {
            Response::Pong => Ok(()),
            other => Err(WorkerError::UnexpectedResponse {
                expected: "pong",
                got: other.describe(),
            }),
        }
    }

    fn ensure_ready(&mut self) -> Result<(), WorkerError> {
        if self.state == WorkerState::Ready {
            if let Some(status) = self.try_wait()? {
                self.mark_dead(status);
            }
        }
        if self.state != WorkerState::Ready {
            if self.spawn_count > 0 {
                info!(
                    "[WORKER:RESPAWN] Restarting worker (device: {:?}, previous spawns: {})",
                    self.device, self.spawn_count
                );
            }
            self.initialize()?;
        }
        Ok(())
    }

    fn write(&mut self, request: &Request) -> Result<(), WorkerError> {
        let process = self.process.as_mut().ok_or(WorkerError::NotRunning)?;
        let requests = process.requests.as_mut().ok_or(WorkerError::NotRunning)?;
        match write_frame(requests, request) {
            Ok(()) => Ok(()),
            Err(e) => {
                // A broken pipe usually means the child is already gone.
                if let Some(status) = self.try_wait()? {
                    return Err(self.mark_dead(status));
                }
                Err(e.into())
            }
        }
    }

    fn receive_until(&mut self, deadline: Option<Instant>) -> Result<Response, WorkerError> {
        loop {
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(WorkerError::HandshakeTimeout(self.config.handshake_timeout));
                    }
                    self.config.poll_interval.min(deadline - now)
                }
                None => self.config.poll_interval,
            };

            let process = self.process.as_mut().ok_or(WorkerError::NotRunning)?;
            match process.responses.recv_timeout(slice) {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => {
                    warn!("[WORKER:PROTOCOL] Bad response frame: {}", e);
                    self.kill();
                    return Err(e.into());
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(status) = process.child.try_wait()? {
                        // Keep a reply the child managed to write before exiting.
                        if let Ok(Ok(response)) = process.responses.try_recv() {
                            return Ok(response);
                        }
                        return Err(self.mark_dead(status));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let grace = self.config.poll_interval;
                    let status = match wait_timeout(&mut process.child, grace)? {
                        Some(status) => Some(status),
                        None => force_reap(&mut process.child),
                    };
                    return match status {
                        Some(status) => Err(self.mark_dead(status)),
                        None => {
                            self.kill();
                            Err(WorkerError::NotRunning)
                        }
                    };
                }
            }
        }
    }

    fn try_wait(&mut self) -> Result<Option<ExitStatus>, WorkerError> {
        match self.process.as_mut() {
            Some(process) => Ok(process.child.try_wait()?),
            None => Ok(None),
        }
    }

    fn mark_dead(&mut self, status: ExitStatus) -> WorkerError {
        warn!(
            "[WORKER:CRASH] PID {:?} exited with {} (device: {:?})",
            self.pid(),
            status,
            self.device
        );
        self.process = None;
        self.state = WorkerState::Dead;
        WorkerError::Died { status }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.kill();
    }
}

fn read_responses(mut stdout: ChildStdout, tx: Sender<Result<Response, ProtocolError>>) {
    loop {
        match read_frame::<_, Response>(&mut stdout) {
            Ok(Some(response)) => {
                if tx.send(Ok(response)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        }
    }
}

fn wait_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(REAP_POLL.min(deadline - now));
    }
}

fn force_reap(child: &mut Child) -> Option<ExitStatus> {
    if let Err(e) = child.kill() {
        // InvalidInput means the child already exited.
        if e.kind() != ErrorKind::InvalidInput {
            warn!("[WORKER:KILL] Failed to kill PID {}: {}", child.id(), e);
        }
    }
    child.wait().ok()
}
