//! Concurrent draining of the task's stdout and stderr.
//!
//! One tokio task per stream reads fixed-size chunks as soon as they are
//! available and appends them to a shared [`CaptureLog`]. Pipes are always
//! drained to EOF so a chatty task never blocks on a full pipe, even after
//! the byte budget is spent.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::core::output::{CaptureLog, CapturedOutput, StreamId};

const CHUNK_SIZE: usize = 8192;

/// Default time allowed for readers to hit EOF after the task stops.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Background readers for one run's console streams.
#[derive(Debug)]
pub struct OutputCapturer {
    log: Arc<Mutex<CaptureLog>>,
    readers: Vec<(StreamId, JoinHandle<io::Result<()>>)>,
}

impl OutputCapturer {
    /// Start draining both streams into a log holding at most `limit_bytes`.
    pub fn start<O, E>(stdout: O, stderr: E, limit_bytes: usize) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let log = Arc::new(Mutex::new(CaptureLog::new(limit_bytes)));
        let readers = vec![
            (
                StreamId::Stdout,
                tokio::spawn(drain(stdout, StreamId::Stdout, Arc::clone(&log))),
            ),
            (
                StreamId::Stderr,
                tokio::spawn(drain(stderr, StreamId::Stderr, Arc::clone(&log))),
            ),
        ];
        Self { log, readers }
    }

    /// Wait for both readers to reach EOF, then hand back what was captured.
    ///
    /// A descendant that inherited a pipe can keep it open after the task is
    /// gone; readers still running when `drain_timeout` elapses are aborted.
    pub async fn finalize(self, drain_timeout: Duration) -> CapturedOutput {
        let deadline = Instant::now() + drain_timeout;
        let mut incomplete = false;
        for (stream, mut reader) in self.readers {
            match timeout_at(deadline, &mut reader).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => {
                    warn!(stream = stream.as_str(), error = %err, "output capture failed");
                }
                Ok(Err(err)) => {
                    warn!(stream = stream.as_str(), error = %err, "output reader panicked");
                }
                Err(_) => {
                    warn!(
                        stream = stream.as_str(),
                        drain_timeout_ms = drain_timeout.as_millis() as u64,
                        "output still open after drain timeout, abandoning"
                    );
                    reader.abort();
                    incomplete = true;
                }
            }
        }
        let output = self
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take_output(incomplete);
        if output.is_truncated() {
            warn!(
                limit_bytes = output.limit_bytes,
                discarded_bytes = output.discarded_bytes,
                "output truncated"
            );
        }
        debug!(
            captured_bytes = output.captured_bytes,
            records = output.records.len(),
            "output captured"
        );
        output
    }
}

async fn drain<R>(mut reader: R, stream: StreamId, log: Arc<Mutex<CaptureLog>>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        log.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .append(stream, &chunk[..n], Utc::now());
    }
}
