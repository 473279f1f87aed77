//! Stdio transport: one supervised child process per adapter.
//!
//! The supervisor spawns the child lazily on first use, frames UTF-8 JSON
//! one object per line in both directions, and correlates responses by a
//! 64-bit upstream id of its own. Client request ids are rewritten on the
//! way out and restored on the way back, so many sessions can share one
//! pipe without colliding in the child's id space.
//!
//! Writes are serialized through a single writer task draining an mpsc
//! queue; responses may come back in any order. On child exit every
//! outstanding request fails with "upstream exited" and the supervisor
//! respawns with exponential backoff (500 ms doubling to a 30 s cap,
//! attempts reset after 60 s of healthy operation).

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Command;
use tokio::sync::{Mutex as TokioMutex, mpsc, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use muxmcp_protocol::{Frame, JsonRpcRequest, JsonRpcResponse, RequestId};

use crate::config::StdioConfig;
use crate::core::{Exchange, ExchangeContext, Transport};
use crate::error::{TransportError, TransportResult};

/// Environment variable carrying the memory hint to the child.
pub const CHILD_MEMORY_ENV: &str = "MUXMCP_CHILD_MEMORY_MB";

/// Initial respawn backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Respawn backoff cap.
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// A child that survives this long resets the backoff counter.
const HEALTHY_AFTER: Duration = Duration::from_secs(60);
/// Lines of stderr retained for diagnostics.
const STDERR_TAIL_LINES: usize = 100;

/// An outstanding request awaiting its response from the child.
struct PendingRequest {
    client_id: RequestId,
    tx: oneshot::Sender<JsonRpcResponse>,
}

/// Live handles for a running child.
struct ChildHandle {
    stdin_tx: mpsc::Sender<String>,
    generation: u64,
    spawned_at: Instant,
    stop: CancellationToken,
}

#[derive(Default)]
struct RestartState {
    attempts: u32,
    backoff_until: Option<Instant>,
}

impl RestartState {
    fn delay(&self) -> Duration {
        BACKOFF_BASE
            .saturating_mul(2u32.saturating_pow(self.attempts))
            .min(BACKOFF_CAP)
    }
}

struct Inner {
    config: StdioConfig,
    next_upstream_id: AtomicU64,
    pending: DashMap<u64, PendingRequest>,
    child: TokioMutex<Option<ChildHandle>>,
    restart: StdMutex<RestartState>,
    stderr_tail: StdMutex<VecDeque<String>>,
    last_used: StdMutex<Instant>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

/// Supervisor owning one child process and its correlation state.
pub struct StdioSupervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StdioSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioSupervisor")
            .field("command", &self.inner.config.command)
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl StdioSupervisor {
    /// Create a supervisor. The child is not spawned until the first
    /// routed frame needs it.
    pub fn new(config: StdioConfig) -> Self {
        let inner = Arc::new(Inner {
            config,
            next_upstream_id: AtomicU64::new(1),
            pending: DashMap::new(),
            child: TokioMutex::new(None),
            restart: StdMutex::new(RestartState::default()),
            stderr_tail: StdMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)),
            last_used: StdMutex::new(Instant::now()),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        if let Some(idle) = inner.config.idle_close {
            tokio::spawn(idle_reaper(Arc::clone(&inner), idle));
        }

        Self { inner }
    }

    /// Recent stderr output from the child, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.inner
            .stderr_tail
            .lock()
            .expect("stderr mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    async fn send_line(&self, line: String) -> TransportResult<()> {
        let stdin_tx = ensure_child(&self.inner).await?;
        *self.inner.last_used.lock().expect("last_used mutex poisoned") = Instant::now();
        stdin_tx
            .send(line)
            .await
            .map_err(|_| TransportError::ChildExited)
    }
}

#[async_trait]
impl Transport for StdioSupervisor {
    async fn exchange(&self, frame: Frame, ctx: &ExchangeContext) -> TransportResult<Exchange> {
        match frame {
            Frame::Request(request) => {
                let upstream_id = self.inner.next_upstream_id.fetch_add(1, Ordering::SeqCst);
                let (tx, rx) = oneshot::channel();
                self.inner.pending.insert(
                    upstream_id,
                    PendingRequest {
                        client_id: request.id.clone(),
                        tx,
                    },
                );

                let outbound = JsonRpcRequest {
                    id: RequestId::Number(upstream_id as i64),
                    ..request
                };
                let line = serde_json::to_string(&outbound)?;

                if let Err(e) = self.send_line(line).await {
                    self.inner.pending.remove(&upstream_id);
                    return Err(e);
                }

                let deadline = ctx.deadline.min(self.inner.config.request_timeout);
                tokio::select! {
                    result = rx => match result {
                        Ok(response) => Ok(Exchange::Response {
                            response,
                            upstream_session_id: None,
                        }),
                        Err(_) => Err(TransportError::ChildExited),
                    },
                    () = tokio::time::sleep(deadline) => {
                        self.inner.pending.remove(&upstream_id);
                        Err(TransportError::Timeout)
                    }
                    () = ctx.cancel.cancelled() => {
                        self.inner.pending.remove(&upstream_id);
                        Err(TransportError::Closed)
                    }
                }
            }
            // Notifications and client responses carry no bookkeeping.
            Frame::Notification(_) | Frame::Response(_) => {
                let line = serde_json::to_string(&frame.to_value())?;
                self.send_line(line).await?;
                Ok(Exchange::None)
            }
        }
    }

    async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        // Bump the generation so the exit handler treats this as expected
        // and does not respawn.
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let handle = self.inner.child.lock().await.take();
        if let Some(handle) = handle {
            handle.stop.cancel();
        }
        fail_pending(&self.inner);
    }
}

/// Return the stdin sender for the running child, spawning it if needed.
async fn ensure_child(inner: &Arc<Inner>) -> TransportResult<mpsc::Sender<String>> {
    if inner.shutdown.is_cancelled() {
        return Err(TransportError::Closed);
    }

    let mut guard = inner.child.lock().await;
    if let Some(ref handle) = *guard {
        return Ok(handle.stdin_tx.clone());
    }

    {
        let restart = inner.restart.lock().expect("restart mutex poisoned");
        if let Some(until) = restart.backoff_until
            && Instant::now() < until
        {
            return Err(TransportError::Offline);
        }
    }

    spawn_child(inner, &mut guard)
}

/// Spawn the child and wire up its writer / reader / stderr / reap tasks.
/// Caller holds the child mutex.
fn spawn_child(
    inner: &Arc<Inner>,
    guard: &mut Option<ChildHandle>,
) -> TransportResult<mpsc::Sender<String>> {
    let config = &inner.config;
    info!(command = %config.command, "spawning stdio upstream");

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .env(CHILD_MEMORY_ENV, config.memory_limit_mb.to_string());
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    if let Some(ref dir) = config.working_dir {
        cmd.current_dir(dir);
    }
    // Own process group so killing the group reaches descendants.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let mut restart = inner.restart.lock().expect("restart mutex poisoned");
            restart.backoff_until = Some(Instant::now() + restart.delay());
            restart.attempts = restart.attempts.saturating_add(1);
            return Err(TransportError::Spawn {
                detail: e.to_string(),
            });
        }
    };

    let stdin = child.stdin.take().ok_or_else(|| TransportError::Spawn {
        detail: "child stdin not piped".to_string(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| TransportError::Spawn {
        detail: "child stdout not piped".to_string(),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| TransportError::Spawn {
        detail: "child stderr not piped".to_string(),
    })?;

    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let stop = CancellationToken::new();
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(256);

    // Writer: the only task that touches the child's stdin.
    tokio::spawn(async move {
        let mut writer = BufWriter::new(stdin);
        while let Some(line) = stdin_rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err()
            {
                break;
            }
            trace!("wrote frame to child stdin");
        }
        debug!("stdio writer task finished");
    });

    // Reader: correlates responses back to their waiters.
    {
        let inner = Arc::clone(inner);
        let max = config.max_line_length;
        tokio::spawn(async move {
            let mut lines = FramedRead::new(
                BufReader::new(stdout),
                LinesCodec::new_with_max_length(max),
            );
            while let Some(result) = lines.next().await {
                match result {
                    Ok(line) => handle_child_line(&inner, &line),
                    Err(LinesCodecError::MaxLineLengthExceeded) => {
                        // The codec discards up to the next newline; any
                        // request waiting on the dropped frame times out.
                        warn!(max, "dropping oversized frame from child");
                    }
                    Err(LinesCodecError::Io(e)) => {
                        warn!(error = %e, "stdio read failed");
                        break;
                    }
                }
            }
            handle_child_exit(&inner, generation).await;
        });
    }

    // Stderr: keep a diagnostic tail.
    {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(child_stderr = %line);
                let mut tail = inner.stderr_tail.lock().expect("stderr mutex poisoned");
                if tail.len() >= STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });
    }

    // Reaper: waits on the process, or kills it on stop/shutdown.
    {
        let stop = stop.clone();
        let shutdown = inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => info!(%status, "stdio upstream exited"),
                        Err(e) => warn!(error = %e, "failed to reap stdio upstream"),
                    }
                }
                () = stop.cancelled() => { let _ = child.start_kill(); let _ = child.wait().await; }
                () = shutdown.cancelled() => { let _ = child.start_kill(); let _ = child.wait().await; }
            }
        });
    }

    let handle = ChildHandle {
        stdin_tx: stdin_tx.clone(),
        generation,
        spawned_at: Instant::now(),
        stop,
    };
    *guard = Some(handle);
    Ok(stdin_tx)
}

/// Dispatch one stdout line from the child.
fn handle_child_line(inner: &Arc<Inner>, line: &str) {
    let frame = match Frame::from_slice(line.as_bytes()) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "unparseable frame from child");
            return;
        }
    };

    match frame {
        Frame::Response(mut response) => {
            let Some(RequestId::Number(n)) = response.id.clone() else {
                debug!("child response without numeric id, dropping");
                return;
            };
            let Ok(upstream_id) = u64::try_from(n) else {
                debug!(id = n, "child response id out of range, dropping");
                return;
            };
            match inner.pending.remove(&upstream_id) {
                Some((_, entry)) => {
                    response.id = Some(entry.client_id);
                    let _ = entry.tx.send(response);
                }
                None => debug!(upstream_id, "unmatched child response"),
            }
        }
        // Server-initiated traffic has no client stream on this transport.
        Frame::Request(r) => debug!(method = %r.method, "dropping child-initiated request"),
        Frame::Notification(n) => {
            debug!(method = %n.method, "dropping child notification");
        }
    }
}

/// React to child exit: fail waiters, record backoff, respawn per policy.
async fn handle_child_exit(inner: &Arc<Inner>, generation: u64) {
    {
        let mut guard = inner.child.lock().await;
        match guard.take() {
            Some(handle) if handle.generation == generation => {
                let healthy = handle.spawned_at.elapsed() >= HEALTHY_AFTER;
                let mut restart = inner.restart.lock().expect("restart mutex poisoned");
                if healthy {
                    restart.attempts = 0;
                }
                restart.backoff_until = Some(Instant::now() + restart.delay());
                restart.attempts = restart.attempts.saturating_add(1);
            }
            // Stale exit (intentional stop or an even older child).
            other => {
                *guard = other;
                return;
            }
        }
    }

    fail_pending(inner);

    if !inner.config.restart || inner.shutdown.is_cancelled() {
        return;
    }

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        loop {
            let delay = {
                let restart = inner.restart.lock().expect("restart mutex poisoned");
                match restart.backoff_until {
                    Some(until) => until.saturating_duration_since(Instant::now()),
                    None => Duration::ZERO,
                }
            };
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = inner.shutdown.cancelled() => return,
            }

            let mut guard = inner.child.lock().await;
            if guard.is_some() || inner.shutdown.is_cancelled() {
                return;
            }
            match spawn_child(&inner, &mut guard) {
                Ok(_) => {
                    info!("stdio upstream respawned");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "stdio respawn failed, backing off");
                }
            }
        }
    });
}

/// Fail every outstanding request with "upstream exited".
fn fail_pending(inner: &Arc<Inner>) {
    let keys: Vec<u64> = inner.pending.iter().map(|e| *e.key()).collect();
    for key in keys {
        if let Some((_, entry)) = inner.pending.remove(&key) {
            let response = JsonRpcResponse::error(
                entry.client_id,
                TransportError::ChildExited.to_rpc_error(),
            );
            let _ = entry.tx.send(response);
        }
    }
}

/// Tear the child down after the configured idle interval.
async fn idle_reaper(inner: Arc<Inner>, idle: Duration) {
    let tick = idle.min(Duration::from_secs(10)).max(Duration::from_millis(100));
    let mut interval = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            () = inner.shutdown.cancelled() => return,
        }
        let idle_for = inner
            .last_used
            .lock()
            .expect("last_used mutex poisoned")
            .elapsed();
        if idle_for < idle {
            continue;
        }
        let mut guard = inner.child.lock().await;
        if let Some(handle) = guard.take() {
            if inner.pending.is_empty() {
                // Expected stop: bump generation so the exit handler
                // neither respawns nor records a backoff.
                inner.generation.fetch_add(1, Ordering::SeqCst);
                info!("stopping idle stdio upstream");
                handle.stop.cancel();
            } else {
                *guard = Some(handle);
            }
        }
    }
}
