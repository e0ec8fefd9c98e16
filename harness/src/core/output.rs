//! Size-bounded, arrival-ordered console capture.
//!
//! [`CaptureLog`] is the pure accumulator behind the output capturer: callers
//! append chunks as they arrive and the log enforces one byte budget across
//! both streams. Once the budget is spent a single [`CaptureRecord::Truncated`]
//! marker is recorded and every later byte is only counted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// Which console stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamId {
    Stdout,
    Stderr,
}

impl StreamId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One entry of the capture log, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureRecord {
    Data {
        stream: StreamId,
        seq: u64,
        at: DateTime<Utc>,
        #[serde(serialize_with = "serialize_lossy")]
        bytes: Vec<u8>,
    },
    /// The budget was exhausted while reading `stream`.
    Truncated {
        stream: StreamId,
        seq: u64,
        at: DateTime<Utc>,
        limit_bytes: usize,
    },
}

impl CaptureRecord {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Data { seq, .. } | Self::Truncated { seq, .. } => *seq,
        }
    }
}

/// Everything captured from one run, consumed into the final result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapturedOutput {
    pub records: Vec<CaptureRecord>,
    pub limit_bytes: usize,
    pub captured_bytes: usize,
    /// Bytes read from the pipes after the budget was spent.
    pub discarded_bytes: u64,
    /// Draining was abandoned because a pipe stayed open past the drain timeout.
    pub drain_incomplete: bool,
}

impl CapturedOutput {
    /// Concatenated bytes kept for one stream, without markers.
    pub fn stream_bytes(&self, stream: StreamId) -> Vec<u8> {
        let mut buf = Vec::new();
        for record in &self.records {
            if let CaptureRecord::Data {
                stream: source,
                bytes,
                ..
            } = record
                && *source == stream
            {
                buf.extend_from_slice(bytes);
            }
        }
        buf
    }

    pub fn is_truncated(&self) -> bool {
        self.truncation_count() > 0
    }

    pub fn truncation_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| matches!(record, CaptureRecord::Truncated { .. }))
            .count()
    }

    /// The stream that was being read when the budget ran out.
    pub fn truncated_stream(&self) -> Option<StreamId> {
        self.records.iter().find_map(|record| match record {
            CaptureRecord::Truncated { stream, .. } => Some(*stream),
            CaptureRecord::Data { .. } => None,
        })
    }

    /// Lossy text for one stream, with a trailing notice if this stream was cut.
    pub fn render_stream(&self, stream: StreamId) -> String {
        let mut text = String::from_utf8_lossy(&self.stream_bytes(stream)).into_owned();
        if self.truncated_stream() == Some(stream) {
            text.push_str(&format!(
                "\n[output truncated at {} bytes, {} bytes discarded]\n",
                self.limit_bytes, self.discarded_bytes
            ));
        }
        text
    }
}

/// Budgeted append-only accumulator for console chunks.
#[derive(Debug)]
pub struct CaptureLog {
    limit: usize,
    records: Vec<CaptureRecord>,
    captured: usize,
    discarded: u64,
    next_seq: u64,
    truncated: bool,
}

impl CaptureLog {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            records: Vec::new(),
            captured: 0,
            discarded: 0,
            next_seq: 0,
            truncated: false,
        }
    }

    /// Append a chunk read from `stream`, keeping only what fits the budget.
    pub fn append(&mut self, stream: StreamId, chunk: &[u8], at: DateTime<Utc>) {
        if chunk.is_empty() {
            return;
        }
        let remaining = self.limit.saturating_sub(self.captured);
        let keep = chunk.len().min(remaining);
        if keep > 0 {
            let seq = self.bump_seq();
            self.records.push(CaptureRecord::Data {
                stream,
                seq,
                at,
                bytes: chunk[..keep].to_vec(),
            });
            self.captured += keep;
        }
        let dropped = chunk.len() - keep;
        if dropped > 0 {
            self.discarded += dropped as u64;
            if !self.truncated {
                self.truncated = true;
                let seq = self.bump_seq();
                self.records.push(CaptureRecord::Truncated {
                    stream,
                    seq,
                    at,
                    limit_bytes: self.limit,
                });
            }
        }
    }

    /// Move the accumulated records out, leaving the log empty.
    pub fn take_output(&mut self, drain_incomplete: bool) -> CapturedOutput {
        CapturedOutput {
            records: std::mem::take(&mut self.records),
            limit_bytes: self.limit,
            captured_bytes: self.captured,
            discarded_bytes: self.discarded,
            drain_incomplete,
        }
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

fn serialize_lossy<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}
