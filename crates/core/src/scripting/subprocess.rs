//! Shared subprocess management.
//!
//! The caller builds the [`Command`] (program, arguments, working
//! directory); [`run_merged`] handles spawn, output capture, and the
//! optional timeout.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{CommandOutput, SubprocessError};

/// Maximum combined output retained per process (10 MiB).
///
/// When exceeded, the oldest output is dropped so the tail, which usually
/// holds the failure reason, is kept.
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Longest single line forwarded; longer runs are split into chunks.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// How long to keep reading the pipes once the process itself is gone.
/// Descendants may hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Spawn `cmd`, merge its stdout and stderr into one buffer, and wait for
/// it to exit.
///
/// Stdin is closed. Each output line is also emitted at `debug` level.
/// With `timeout` set, the process is killed once the limit expires and
/// [`SubprocessError::Timeout`] carries whatever was captured so far.
pub async fn run_merged(
    cmd: &mut Command,
    timeout: Option<Duration>,
) -> Result<CommandOutput, SubprocessError> {
    // `kill_on_drop(true)` ensures the child does not outlive an aborted wait.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(SubprocessError::Spawn)?;

    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let mut stdout_task = tokio::spawn(forward_lines(child.stdout.take(), tx.clone()));
    let mut stderr_task = tokio::spawn(forward_lines(child.stderr.take(), tx));
    let collect_task = tokio::spawn(collect_lines(rx));

    let wait_result = match timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait()).await,
        None => Ok(child.wait().await),
    };

    match wait_result {
        Ok(Ok(status)) => {
            drain_readers(&mut stdout_task, &mut stderr_task).await;
            let output = collect_task.await.unwrap_or_default();
            Ok(CommandOutput {
                output,
                exit_code: status.code().unwrap_or(-1),
                duration_ms: start.elapsed().as_millis() as u64,
            })
        }
        Ok(Err(e)) => Err(SubprocessError::Io(e)),
        Err(_elapsed) => {
            let elapsed_ms = start.elapsed().as_millis() as u64;
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill timed-out process");
            }
            drain_readers(&mut stdout_task, &mut stderr_task).await;
            let output = collect_task.await.unwrap_or_default();
            Err(SubprocessError::Timeout { elapsed_ms, output })
        }
    }
}

/// Wait up to [`DRAIN_GRACE`] for both readers to hit EOF, then abort
/// whichever is still blocked so the captured output can be returned.
async fn drain_readers(stdout_task: &mut JoinHandle<()>, stderr_task: &mut JoinHandle<()>) {
    let drained = tokio::time::timeout(DRAIN_GRACE, async {
        let _ = (&mut *stdout_task).await;
        let _ = (&mut *stderr_task).await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Process output still open after exit, detaching readers");
        stdout_task.abort();
        stderr_task.abort();
    }
}

/// Read `handle` line by line and forward each line to `tx`.
///
/// A line longer than [`MAX_LINE_BYTES`] is forwarded in pieces of at
/// most that size. Lines are decoded lossily so non-UTF-8 output never
/// stalls the pipe.
async fn forward_lines<R: AsyncRead + Unpin>(
    handle: Option<R>,
    tx: mpsc::UnboundedSender<String>,
) {
    let Some(handle) = handle else {
        return;
    };
    let mut reader = BufReader::new(handle);
    let mut line = Vec::new();
    loop {
        let chunk = match reader.fill_buf().await {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "Stopped reading process output");
                break;
            }
        };
        if chunk.is_empty() {
            if !line.is_empty() {
                send_line(&line, &tx);
            }
            break;
        }

        let window = &chunk[..chunk.len().min(MAX_LINE_BYTES - line.len())];
        let (take, complete) = match window.iter().position(|&b| b == b'\n') {
            Some(end) => (end + 1, true),
            None => (window.len(), line.len() + window.len() == MAX_LINE_BYTES),
        };
        line.extend_from_slice(&window[..take]);
        reader.consume(take);

        if complete {
            if !send_line(&line, &tx) {
                break;
            }
            line.clear();
        }
    }
}

/// Returns `false` once the collector is gone.
fn send_line(raw: &[u8], tx: &mpsc::UnboundedSender<String>) -> bool {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
    tracing::debug!(target: "lipid_core::scripting", "{line}");
    tx.send(line.to_string()).is_ok()
}

async fn collect_lines(mut rx: mpsc::UnboundedReceiver<String>) -> String {
    let mut output = String::new();
    while let Some(line) = rx.recv().await {
        push_bounded(&mut output, &line, MAX_OUTPUT_BYTES);
    }
    output
}

/// Append `line` plus a newline, dropping the oldest bytes beyond `max`.
fn push_bounded(buf: &mut String, line: &str, max: usize) {
    buf.push_str(line);
    buf.push('\n');
    if buf.len() > max {
        let mut cut = buf.len() - max;
        while !buf.is_char_boundary(cut) {
            cut += 1;
        }
        buf.drain(..cut);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
