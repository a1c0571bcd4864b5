//! Child process execution with timeout, output caps and stop escalation.

use super::output::{CappedBuffer, ProcessOutput};
use super::protocol::{parse_line, StageMessage};
use super::{RunnerConfig, StageArgs};
use crate::cancellation::StopSignals;
use crate::errors::CascadeError;
use crate::registry::StageDefinition;
use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Environment variable carrying the entity id.
pub const ENV_ENTITY_ID: &str = "CASCADE_ENTITY_ID";
/// Environment variable carrying the stage id.
pub const ENV_STAGE_ID: &str = "CASCADE_STAGE_ID";
/// Environment variable carrying the stop marker path.
pub const ENV_STOP_FILE: &str = "CASCADE_STOP_FILE";

enum Exit {
    Exited(ExitStatus),
    TimedOut,
    KilledAfterStop,
}

/// Launches stages as isolated child processes.
#[derive(Clone, Default)]
pub struct ProcessRunner {
    config: RunnerConfig,
    signals: Option<Arc<dyn StopSignals>>,
}

impl std::fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRunner")
            .field("config", &self.config)
            .field("stop_signals", &self.signals.is_some())
            .finish()
    }
}

impl ProcessRunner {
    /// Creates a runner with the given configuration.
    #[must_use]
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            signals: None,
        }
    }

    /// Enables stop observation and escalation.
    #[must_use]
    pub fn with_stop_signals(mut self, signals: Arc<dyn StopSignals>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn command(&self, stage: &StageDefinition, entity_id: &str, args: &StageArgs) -> Command {
        let exe = &stage.executable;
        let mut cmd = Command::new(&exe.program);
        cmd.args(&exe.args)
            .args(args.to_argv(entity_id))
            .env(ENV_ENTITY_ID, entity_id)
            .env(ENV_STAGE_ID, &stage.id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = exe.working_dir {
            cmd.current_dir(dir);
        }
        if let Some(path) = self
            .signals
            .as_ref()
            .and_then(|signals| signals.marker_path(&stage.id))
        {
            cmd.env(ENV_STOP_FILE, path);
        }
        cmd
    }

    /// Runs one stage to completion.
    ///
    /// Progress and log messages are handed to `observer` as they arrive; the
    /// final result line is kept in the returned output. Only a failure to
    /// start the process is an error: timeouts, non-zero exits and stops are
    /// reported through [`ProcessOutput`].
    pub async fn run<F>(
        &self,
        stage: &StageDefinition,
        entity_id: &str,
        args: &StageArgs,
        mut observer: F,
    ) -> Result<ProcessOutput, CascadeError>
    where
        F: FnMut(StageMessage) + Send,
    {
        args.validate()?;
        let start = Instant::now();
        let cap = stage.limits.max_output_bytes;

        let mut child = self
            .command(stage, entity_id, args)
            .spawn()
            .map_err(|e| CascadeError::Spawn {
                stage: stage.id.clone(),
                reason: e.to_string(),
            })?;

        info!(
            entity_id,
            stage_id = %stage.id,
            pid = child.id(),
            timeout_ms = u64::try_from(stage.limits.timeout.as_millis()).unwrap_or(u64::MAX),
            "Stage process started"
        );

        let stdout_buf = Arc::new(Mutex::new(CappedBuffer::new(cap)));
        let stderr_buf = Arc::new(Mutex::new(CappedBuffer::new(cap)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut stdout_task = child
            .stdout
            .take()
            .map(|out| spawn_reader(out, Arc::clone(&stdout_buf), Some(tx)));
        let mut stderr_task = child
            .stderr
            .take()
            .map(|err| spawn_reader(err, Arc::clone(&stderr_buf), None));

        let mut result = None;
        let mut handle = |message: StageMessage| match message {
            StageMessage::Result(r) => result = Some(r),
            other => observer(other),
        };

        let deadline = sleep(stage.limits.timeout);
        tokio::pin!(deadline);
        let mut poll = interval(self.config.stop_poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stop_seen: Option<Instant> = None;
        let mut messages_open = true;

        let exit = loop {
            tokio::select! {
                message = rx.recv(), if messages_open => match message {
                    Some(message) => handle(message),
                    None => messages_open = false,
                },
                status = child.wait() => {
                    break Exit::Exited(status?);
                }
                () = &mut deadline => {
                    warn!(entity_id, stage_id = %stage.id, "Stage timed out, killing process");
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill timed out process");
                    }
                    break Exit::TimedOut;
                }
                _ = poll.tick(), if self.signals.is_some() => {
                    if stop_seen.is_none() && self.stop_pending(&stage.id).await {
                        info!(entity_id, stage_id = %stage.id, "Stop observed, waiting for the stage to wind down");
                        stop_seen = Some(Instant::now());
                    }
                    if stop_seen.is_some_and(|seen| seen.elapsed() >= self.config.stop_grace) {
                        warn!(entity_id, stage_id = %stage.id, "Stop grace period elapsed, killing process");
                        if let Err(e) = child.kill().await {
                            warn!(error = %e, "Failed to kill stopped process");
                        }
                        break Exit::KilledAfterStop;
                    }
                }
            }
        };

        // Pick up output written just before exit.
        let drained = timeout(self.config.drain_timeout, async {
            while let Some(message) = rx.recv().await {
                handle(message);
            }
            if let Some(task) = stderr_task.as_mut() {
                let _ = task.await;
            }
        })
        .await;
        if drained.is_err() {
            debug!(stage_id = %stage.id, "Output streams still open after exit, abandoning them");
        }
        for task in [stdout_task.take(), stderr_task.take()].into_iter().flatten() {
            task.abort();
        }

        let stdout = stdout_buf.lock();
        let stderr = stderr_buf.lock();
        let mut output = ProcessOutput {
            exit_code: None,
            stdout: stdout.to_string_lossy(),
            stderr: stderr.to_string_lossy(),
            stdout_truncated: stdout.truncated(),
            stderr_truncated: stderr.truncated(),
            duration_ms: crate::utils::elapsed_ms(start),
            timed_out: false,
            killed_after_stop: false,
            result,
        };
        match exit {
            Exit::Exited(status) => output.exit_code = status.code(),
            Exit::TimedOut => output.timed_out = true,
            Exit::KilledAfterStop => output.killed_after_stop = true,
        }

        if output.truncated() {
            warn!(
                stage_id = %stage.id,
                stdout_bytes = stdout.total_bytes(),
                stderr_bytes = stderr.total_bytes(),
                cap,
                "Stage output truncated"
            );
        }
        debug!(
            stage_id = %stage.id,
            exit_code = ?output.exit_code,
            duration_ms = output.duration_ms,
            "Stage process finished"
        );

        Ok(output)
    }

    async fn stop_pending(&self, scope: &str) -> bool {
        let Some(ref signals) = self.signals else {
            return false;
        };
        match signals.is_stop_requested(scope).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(scope, error = %e, "Cannot check stop marker");
                false
            }
        }
    }
}

/// Longest stdout line still inspected for a protocol message.
const MAX_PROTOCOL_LINE_BYTES: usize = 64 * 1024;

/// Pending line of a stream, bounded regardless of how long the line runs.
#[derive(Default)]
struct LineBuffer {
    bytes: Vec<u8>,
    overflowed: bool,
}

impl LineBuffer {
    fn push(&mut self, piece: &[u8]) {
        let room = MAX_PROTOCOL_LINE_BYTES.saturating_sub(self.bytes.len());
        if piece.len() > room {
            self.overflowed = true;
        }
        self.bytes.extend_from_slice(&piece[..piece.len().min(room)]);
    }

    /// Parses the completed line; overlong lines are never protocol messages.
    fn take_message(&mut self) -> Option<StageMessage> {
        let message = if self.overflowed || self.bytes.is_empty() {
            None
        } else {
            parse_line(&String::from_utf8_lossy(&self.bytes))
        };
        self.bytes.clear();
        self.overflowed = false;
        message
    }
}

fn spawn_reader<R>(
    stream: R,
    buffer: Arc<Mutex<CappedBuffer>>,
    messages: Option<mpsc::UnboundedSender<StageMessage>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line = LineBuffer::default();
        loop {
            let chunk = match reader.fill_buf().await {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!(error = %e, "Stopped reading process output");
                    break;
                }
            };
            let (piece, line_done) = match chunk.iter().position(|&b| b == b'\n') {
                Some(end) => (&chunk[..=end], true),
                None => (chunk, false),
            };
            buffer.lock().push(piece);
            if messages.is_some() {
                line.push(piece);
            }
            let consumed = piece.len();
            reader.consume(consumed);

            if line_done {
                if let (Some(tx), Some(message)) = (messages.as_ref(), line.take_message()) {
                    let _ = tx.send(message);
                }
            }
        }
        // final line without a newline
        if let (Some(tx), Some(message)) = (messages.as_ref(), line.take_message()) {
            let _ = tx.send(message);
        }
    })
}
