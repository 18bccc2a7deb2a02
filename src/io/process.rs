//! Helpers for running the agent child process with a line-streamed stdout.
//!
//! The caller receives each stdout line through a callback while the child
//! runs; stderr is drained concurrently with a byte bound. A deadline, a
//! cancellation flag, and callback errors all kill the child rather than
//! leaving it orphaned.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use wait_timeout::ChildExt;

/// How often the stream loop checks the deadline and cancellation flag.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Grace period between stdout EOF and process exit before the child is
/// killed anyway.
const EXIT_GRACE: Duration = Duration::from_secs(60);

/// Parameters for a streamed child invocation.
pub struct StreamRequest<'a> {
    /// Bytes written to the child's stdin before reading begins.
    pub stdin: &'a [u8],
    /// Wall-clock limit for the whole invocation. `None` disables it.
    pub timeout: Option<Duration>,
    /// Bound on captured stderr bytes (excess is drained and discarded).
    pub output_limit_bytes: usize,
    /// Cooperative cancellation; when set, the child is killed and the call
    /// fails with "interrupted".
    pub cancel: Option<&'a AtomicBool>,
}

/// Captured result of a streamed child invocation.
#[derive(Debug)]
pub struct StreamOutcome {
    pub status: ExitStatus,
    pub stderr: Vec<u8>,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl StreamOutcome {
    /// Last portion of stderr as lossy UTF-8, for error messages.
    pub fn stderr_tail(&self, max_bytes: usize) -> String {
        let start = self.stderr.len().saturating_sub(max_bytes);
        String::from_utf8_lossy(&self.stderr[start..])
            .trim()
            .to_string()
    }
}

/// Run `cmd`, feeding `request.stdin` and invoking `on_line` for every
/// stdout line as it arrives.
pub fn run_streaming(
    mut cmd: Command,
    request: &StreamRequest<'_>,
    on_line: &mut dyn FnMut(&str) -> Result<()>,
) -> Result<StreamOutcome> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().context("spawn agent command")?;

    {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin
            .write_all(request.stdin)
            .context("write prompt to agent stdin")?;
        // Dropping the handle closes the pipe so the agent sees EOF.
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stderr_limit = request.output_limit_bytes;
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, stderr_limit));

    let (line_tx, line_rx) = mpsc::channel::<std::io::Result<String>>();
    let stdout_handle = thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    let deadline = request.timeout.map(|timeout| Instant::now() + timeout);
    let mut timed_out = false;
    let stream_result: Result<()> = loop {
        if let Some(cancel) = request.cancel {
            if cancel.load(Ordering::SeqCst) {
                break Err(anyhow!("interrupted"));
            }
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                timed_out = true;
                break Ok(());
            }
        }
        match line_rx.recv_timeout(POLL_INTERVAL) {
            Ok(Ok(line)) => {
                if let Err(err) = on_line(&line) {
                    break Err(err);
                }
            }
            Ok(Err(err)) => break Err(anyhow!(err).context("read agent stdout")),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break Ok(()),
        }
    };

    let kill_first = stream_result.is_err() || timed_out;
    let status = reap_child(&mut child, kill_first)?;
    drop(line_rx);
    stdout_handle
        .join()
        .map_err(|_| anyhow!("stdout reader thread panicked"))?;
    let (stderr, stderr_truncated) = stderr_handle
        .join()
        .map_err(|_| anyhow!("stderr reader thread panicked"))?
        .context("read agent stderr")?;

    stream_result?;

    Ok(StreamOutcome {
        status,
        stderr,
        stderr_truncated,
        timed_out,
    })
}

fn reap_child(child: &mut Child, kill_first: bool) -> Result<ExitStatus> {
    if kill_first {
        // The child may already be gone; only the wait result matters.
        let _ = child.kill();
        return child.wait().context("wait for agent after kill");
    }
    match child
        .wait_timeout(EXIT_GRACE)
        .context("wait for agent exit")?
    {
        Some(status) => Ok(status),
        None => {
            let _ = child.kill();
            child.wait().context("wait for agent after grace kill")
        }
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn streams_lines_in_order_and_captures_status() {
        let mut lines = Vec::new();
        let outcome = run_streaming(
            sh("printf 'one\\ntwo\\n'"),
            &StreamRequest {
                stdin: b"",
                timeout: Some(Duration::from_secs(10)),
                output_limit_bytes: 1024,
                cancel: None,
            },
            &mut |line| {
                lines.push(line.to_string());
                Ok(())
            },
        )
        .expect("run");

        assert_eq!(lines, vec!["one", "two"]);
        assert!(outcome.status.success());
        assert!(!outcome.timed_out);
    }

    #[test]
    fn feeds_stdin_to_the_child() {
        let mut lines = Vec::new();
        run_streaming(
            sh("cat"),
            &StreamRequest {
                stdin: b"hello agent\n",
                timeout: Some(Duration::from_secs(10)),
                output_limit_bytes: 1024,
                cancel: None,
            },
            &mut |line| {
                lines.push(line.to_string());
                Ok(())
            },
        )
        .expect("run");
        assert_eq!(lines, vec!["hello agent"]);
    }

    #[test]
    fn captures_bounded_stderr() {
        let outcome = run_streaming(
            sh("printf 'oops' >&2"),
            &StreamRequest {
                stdin: b"",
                timeout: Some(Duration::from_secs(10)),
                output_limit_bytes: 2,
                cancel: None,
            },
            &mut |_| Ok(()),
        )
        .expect("run");
        assert_eq!(outcome.stderr, b"oo");
        assert_eq!(outcome.stderr_truncated, 2);
        assert_eq!(outcome.stderr_tail(16), "oo");
    }

    #[test]
    fn deadline_kills_a_hung_child() {
        let outcome = run_streaming(
            sh("sleep 30"),
            &StreamRequest {
                stdin: b"",
                timeout: Some(Duration::from_millis(300)),
                output_limit_bytes: 1024,
                cancel: None,
            },
            &mut |_| Ok(()),
        )
        .expect("run");
        assert!(outcome.timed_out);
    }

    #[test]
    fn cancellation_flag_interrupts_the_child() {
        let cancel = AtomicBool::new(true);
        let err = run_streaming(
            sh("sleep 30"),
            &StreamRequest {
                stdin: b"",
                timeout: None,
                output_limit_bytes: 1024,
                cancel: Some(&cancel),
            },
            &mut |_| Ok(()),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "interrupted");
    }

    #[test]
    fn callback_errors_stop_the_stream() {
        let err = run_streaming(
            sh("printf 'bad\\n'; sleep 30"),
            &StreamRequest {
                stdin: b"",
                timeout: None,
                output_limit_bytes: 1024,
                cancel: None,
            },
            &mut |_| Err(anyhow!("parse failure")),
        )
        .unwrap_err();
        assert!(err.to_string().contains("parse failure"));
    }
}
