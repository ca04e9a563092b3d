//! Interception engine process supervision
//!
//! Launches the engine, frames its stdout/stderr into lines, writes commands
//! to its stdin and tracks whether it is running. Commands are fire-and-forget:
//! there is no acknowledgement and no retry.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};

use crate::proxy::config::EngineConfig;
use crate::proxy::line_buffer::LineBuffer;
use crate::proxy::protocol::EngineCommand;

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine executable not found at {}", .0.display())]
    ExecutableMissing(PathBuf),
    #[error("failed to spawn engine {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("engine process did not expose its {0} pipe")]
    MissingPipe(&'static str),
    #[error("engine supervisor has been closed")]
    Closed,
}

/// Anything that can deliver commands to the engine
pub trait CommandSink: Send + Sync {
    fn send_command(&self, command: &EngineCommand);
}

/// A complete line read from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineLine {
    Stdout(String),
    Stderr(String),
}

struct RunningEngine {
    generation: u64,
    pid: Option<u32>,
    commands: mpsc::UnboundedSender<String>,
    kill: Option<oneshot::Sender<()>>,
}

struct Shared {
    current: Mutex<Option<RunningEngine>>,
    running: watch::Sender<bool>,
}

impl Shared {
    fn current(&self) -> std::sync::MutexGuard<'_, Option<RunningEngine>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct EngineSupervisor {
    shared: Arc<Shared>,
    /// Taken on close so the line stream ends once the pumps finish
    lines: Mutex<Option<mpsc::UnboundedSender<EngineLine>>>,
    /// Held for the whole of `start` so concurrent calls launch one engine
    starting: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    sequence: AtomicU64,
}

impl EngineSupervisor {
    /// Create a supervisor and the receiving end of its line stream
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineLine>) {
        let (lines, rx) = mpsc::unbounded_channel();
        let (running, _) = watch::channel(false);
        let supervisor = Self {
            shared: Arc::new(Shared {
                current: Mutex::new(None),
                running,
            }),
            lines: Mutex::new(Some(lines)),
            starting: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
        };
        (supervisor, rx)
    }

    pub fn is_running(&self) -> bool {
        *self.shared.running.borrow()
    }

    pub fn subscribe_running(&self) -> watch::Receiver<bool> {
        self.shared.running.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.current().as_ref().and_then(|engine| engine.pid)
    }

    /// Number of commands handed to the writer since creation
    pub fn commands_sent(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Launch the engine. Returns immediately once the process is spawned;
    /// a no-op when an engine is already running.
    pub async fn start(&self, config: &EngineConfig) -> Result<(), EngineError> {
        let _starting = self.starting.lock().await;
        if self.shared.current().is_some() {
            tracing::info!("Engine already running");
            return Ok(());
        }

        let lines = self
            .lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(EngineError::Closed)?;

        if !config.executable.is_file() {
            return Err(EngineError::ExecutableMissing(config.executable.clone()));
        }

        terminate_stale_instances(config).await;

        let args = config.launch_args();
        tracing::info!(
            "Starting engine {} on port {} (restrict_to_hosts={}, hosts={})",
            config.executable.display(),
            config.port,
            config.restrict_to_hosts,
            config.hosts.len()
        );
        tracing::debug!("Engine arguments: {:?}", args);

        let mut child = Command::new(&config.executable)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                path: config.executable.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(EngineError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(EngineError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(EngineError::MissingPipe("stderr"))?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (command_tx, command_rx) = mpsc::unbounded_channel::<String>();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let pid = child.id();

        {
            let mut current = self.shared.current();
            *current = Some(RunningEngine {
                generation,
                pid,
                commands: command_tx,
                kill: Some(kill_tx),
            });
        }
        self.shared.running.send_replace(true);

        let stdout_lines = lines.clone();
        tokio::spawn(async move {
            pump_lines(stdout, &stdout_lines, EngineLine::Stdout).await;
        });

        tokio::spawn(async move {
            pump_lines(stderr, &lines, |line| {
                tracing::warn!(target: "engine", "{}", line);
                EngineLine::Stderr(line)
            })
            .await;
        });

        tokio::spawn(write_commands(stdin, command_rx));
        tokio::spawn(watch_exit(
            child,
            kill_rx,
            generation,
            Arc::clone(&self.shared),
        ));

        tracing::info!("Engine started (pid={:?})", pid);
        Ok(())
    }

    /// Terminate the engine without waiting for it to drain. Safe to call
    /// when nothing is running.
    pub fn stop(&self) {
        let engine = self.shared.current().take();
        match engine {
            Some(mut engine) => {
                tracing::info!("Stopping engine (pid={:?})", engine.pid);
                if let Some(kill) = engine.kill.take() {
                    // The watcher may already be gone if the process exited
                    let _ = kill.send(());
                }
            }
            None => tracing::debug!("Stop requested but no engine is running"),
        }
        self.shared.running.send_replace(false);
    }

    /// Stop the engine and end the line stream. Later starts fail with
    /// [`EngineError::Closed`].
    pub fn close(&self) {
        self.stop();
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl CommandSink for EngineSupervisor {
    fn send_command(&self, command: &EngineCommand) {
        let line = match command.to_line() {
            Ok(line) => line,
            Err(err) => {
                tracing::error!("Failed to encode {} command: {}", command.kind(), err);
                return;
            }
        };

        let current = self.shared.current();
        let delivered = current
            .as_ref()
            .is_some_and(|engine| engine.commands.send(line).is_ok());
        drop(current);

        if delivered {
            let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!("Sent {} command #{}", command.kind(), seq);
        } else {
            tracing::warn!(
                "Dropping {} command: no engine channel available",
                command.kind()
            );
        }
    }
}

impl Drop for EngineSupervisor {
    fn drop(&mut self) {
        if let Some(mut engine) = self.shared.current().take() {
            if let Some(kill) = engine.kill.take() {
                let _ = kill.send(());
            }
        }
    }
}

/// Read `reader` to EOF, forwarding each complete line through `wrap`.
pub(crate) async fn pump_lines<R, F>(
    mut reader: R,
    lines: &mpsc::UnboundedSender<EngineLine>,
    wrap: F,
) where
    R: AsyncRead + Unpin,
    F: Fn(String) -> EngineLine,
{
    let mut buffer = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for line in buffer.push(&chunk[..n]) {
                    if lines.send(wrap(line)).is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                tracing::warn!("Engine stream read failed: {}", err);
                break;
            }
        }
    }

    // An unterminated tail is never dispatched
    if let Some(fragment) = buffer.finish() {
        tracing::debug!("Discarding unterminated engine output: {:?}", fragment);
    }
}

async fn write_commands<W>(mut stdin: W, mut commands: mpsc::UnboundedReceiver<String>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(mut line) = commands.recv().await {
        line.push('\n');
        if let Err(err) = stdin.write_all(line.as_bytes()).await {
            tracing::error!("Error writing to engine stdin: {}", err);
            break;
        }
        if let Err(err) = stdin.flush().await {
            tracing::error!("Error flushing engine stdin: {}", err);
            break;
        }
    }
}

async fn watch_exit(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    generation: u64,
    shared: Arc<Shared>,
) {
    let requested = tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => tracing::warn!("Engine exited unexpectedly ({})", status),
                Err(err) => tracing::warn!("Engine wait failed: {}", err),
            }
            false
        }
        _ = kill => {
            if let Err(err) = child.start_kill() {
                tracing::debug!("Engine kill failed (already exited?): {}", err);
            }
            let _ = child.wait().await;
            tracing::info!("Engine stopped");
            true
        }
    };

    let mut current = shared.current();
    if current
        .as_ref()
        .is_some_and(|engine| engine.generation == generation)
    {
        current.take();
        drop(current);
        shared.running.send_replace(false);
    } else if !requested {
        tracing::debug!("Ignoring exit of superseded engine generation {}", generation);
    }
}

/// Best-effort cleanup of engine processes left over from earlier runs
async fn terminate_stale_instances(config: &EngineConfig) {
    let Some(name) = config.process_name() else {
        return;
    };

    #[cfg(unix)]
    let result = Command::new("pkill")
        .args(["-x", &name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    #[cfg(windows)]
    let result = Command::new("taskkill")
        .args(["/F", "/IM", &name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    #[cfg(not(any(unix, windows)))]
    let result: io::Result<std::process::ExitStatus> =
        Err(io::Error::new(io::ErrorKind::Unsupported, "no process killer"));

    match result {
        Ok(status) if status.success() => {
            tracing::info!("Terminated stale {} instances", name)
        }
        Ok(_) => tracing::debug!("No stale {} instances found", name),
        Err(err) => tracing::debug!("Could not look for stale {} instances: {}", name, err),
    }
}
