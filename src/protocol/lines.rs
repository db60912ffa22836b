//! Line framing for chunked transport output

use super::{decode, DecodeError, Event};

/// Splits arbitrary text chunks into newline-terminated lines and decodes
/// each complete line. A trailing partial line is held until more input
/// arrives or [`LineDecoder::finish`] is called.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: String,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns results for every line it completed.
    /// Blank lines are skipped.
    pub fn push(&mut self, chunk: &str) -> Vec<Result<Event, DecodeError>> {
        self.pending.push_str(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            match decode(&line) {
                Err(DecodeError::Empty) => {}
                other => out.push(other),
            }
        }
        out
    }

    /// Decode whatever is left once the stream has closed
    pub fn finish(&mut self) -> Option<Result<Event, DecodeError>> {
        let rest = std::mem::take(&mut self.pending);
        match decode(&rest) {
            Err(DecodeError::Empty) => None,
            other => Some(other),
        }
    }

    pub fn has_partial(&self) -> bool {
        !self.pending.trim().is_empty()
    }
}
