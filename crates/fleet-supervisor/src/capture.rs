//! Bounded capture of a supervised child's stdout/stderr streams.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Local;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Ring retention per stream; oldest entries are dropped beyond this.
pub(crate) const BUFFER_LIMIT: usize = 1000;
/// How many trailing entries the API surfaces.
pub(crate) const TAIL_LINES: usize = 50;

/// One captured output line with its local-time ISO-8601 timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub timestamp: String,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn label(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Per-child output buffers, appended to by the drain tasks and read through
/// snapshots. Appends are monotonic in timestamp per stream.
#[derive(Debug, Default)]
pub(crate) struct OutputCapture {
    stdout: Mutex<VecDeque<OutputLine>>,
    stderr: Mutex<VecDeque<OutputLine>>,
    last_renewal: Mutex<Option<String>>,
}

impl OutputCapture {
    fn buffer(&self, kind: StreamKind) -> &Mutex<VecDeque<OutputLine>> {
        match kind {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }

    pub(crate) fn append(&self, kind: StreamKind, line: String) {
        let entry = OutputLine {
            timestamp: local_timestamp(),
            line,
        };
        *lock(&self.last_renewal) = Some(entry.timestamp.clone());
        let mut buffer = lock(self.buffer(kind));
        buffer.push_back(entry);
        while buffer.len() > BUFFER_LIMIT {
            buffer.pop_front();
        }
    }

    /// Last [`TAIL_LINES`] entries of one stream, oldest first.
    pub(crate) fn tail(&self, kind: StreamKind) -> Vec<OutputLine> {
        let buffer = lock(self.buffer(kind));
        let skip = buffer.len().saturating_sub(TAIL_LINES);
        buffer.iter().skip(skip).cloned().collect()
    }

    pub(crate) fn last_renewal(&self) -> Option<String> {
        lock(&self.last_renewal).clone()
    }

    /// Drain one stream line-by-line until EOF. Lines are decoded lossily so
    /// a child emitting invalid UTF-8 cannot wedge the capture.
    pub(crate) fn spawn_drain(
        self: &Arc<Self>,
        child_name: &str,
        kind: StreamKind,
        reader: impl AsyncRead + Unpin + Send + 'static,
    ) -> JoinHandle<()> {
        let capture = Arc::clone(self);
        let name = child_name.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&raw)
                            .trim_end_matches(['\r', '\n'])
                            .to_string();
                        tracing::debug!(child = %name, stream = kind.label(), line = %line, "captured");
                        capture.append(kind, line);
                    }
                    Err(error) => {
                        tracing::debug!(child = %name, stream = kind.label(), error = %error, "output drain failed");
                        break;
                    }
                }
            }
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn local_timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::{BUFFER_LIMIT, OutputCapture, StreamKind, TAIL_LINES};
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn buffers_are_ring_bounded() {
        let capture = OutputCapture::default();
        for i in 0..(BUFFER_LIMIT + 100) {
            capture.append(StreamKind::Stdout, format!("line {i}"));
        }
        let tail = capture.tail(StreamKind::Stdout);
        assert_eq!(tail.len(), TAIL_LINES);
        assert_eq!(tail.last().unwrap().line, format!("line {}", BUFFER_LIMIT + 99));
        assert_eq!(
            super::lock(&capture.stdout).len(),
            BUFFER_LIMIT,
            "oldest entries must be dropped"
        );
    }

    #[test]
    fn tail_returns_everything_when_short() {
        let capture = OutputCapture::default();
        capture.append(StreamKind::Stderr, "only".to_string());
        let tail = capture.tail(StreamKind::Stderr);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].line, "only");
        assert!(capture.last_renewal().is_some());
    }

    #[test]
    fn streams_do_not_share_buffers() {
        let capture = OutputCapture::default();
        capture.append(StreamKind::Stdout, "out".to_string());
        assert!(capture.tail(StreamKind::Stderr).is_empty());
    }

    #[tokio::test]
    async fn drain_captures_lines_until_eof() {
        let capture = Arc::new(OutputCapture::default());
        let (mut writer, reader) = tokio::io::duplex(256);
        let drain = capture.spawn_drain("test", StreamKind::Stderr, reader);

        writer.write_all(b"first\n").await.unwrap();
        // Invalid UTF-8 must be decoded lossily, not dropped.
        writer.write_all(&[0xff, 0xfe, b'\n']).await.unwrap();
        writer.write_all(b"last without newline").await.unwrap();
        drop(writer);
        drain.await.unwrap();

        let tail = capture.tail(StreamKind::Stderr);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].line, "first");
        assert!(tail[1].line.contains('\u{fffd}'));
        assert_eq!(tail[2].line, "last without newline");
    }
}
