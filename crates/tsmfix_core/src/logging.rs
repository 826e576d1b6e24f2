//! Deduplicating log aggregation.
//!
//! Rules tend to repeat the same action line millions of times across a
//! shard (one per key). Instead of flooding the output, every rule records
//! its action lines into a shared [`LogBuffer`]; the pipeline flushes the
//! buffer once at the end of the run, emitting each distinct message a
//! single time together with its repetition count.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

/// Shared message → count aggregator.
///
/// Cloning is cheap; all clones feed the same buffer.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    messages: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl LogBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one occurrence of `message`.
    pub fn record(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!("{message}");
        *self.messages.lock().entry(message).or_insert(0) += 1;
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Writes every distinct message once with its count, then clears.
    pub fn flush(&self, out: &mut impl Write) -> io::Result<()> {
        let messages = std::mem::take(&mut *self.messages.lock());
        for (message, count) in messages {
            if count > 1 {
                writeln!(out, "{message} (x{count})")?;
            } else {
                writeln!(out, "{message}")?;
            }
        }
        Ok(())
    }

    /// Creates a logger that prefixes every message with a rule name.
    pub fn scoped(&self, prefix: &'static str) -> ScopedLogger {
        ScopedLogger {
            buffer: self.clone(),
            prefix,
        }
    }
}

/// A [`LogBuffer`] handle carrying a fixed `[prefix]`.
#[derive(Debug, Clone)]
pub struct ScopedLogger {
    buffer: LogBuffer,
    prefix: &'static str,
}

impl ScopedLogger {
    /// Records one occurrence of `message` under this logger's prefix.
    pub fn record(&self, message: impl AsRef<str>) {
        self.buffer
            .record(format!("[{}] {}", self.prefix, message.as_ref()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_messages_collapse() {
        let buffer = LogBuffer::new();
        buffer.record("dropped key");
        buffer.record("dropped key");
        buffer.record("renamed key");

        let mut out = Vec::new();
        buffer.flush(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(text, "dropped key (x2)\nrenamed key\n");
        assert!(buffer.is_empty());
    }

    #[test]
    fn scoped_logger_prefixes() {
        let buffer = LogBuffer::new();
        buffer.scoped("drop-measurement").record("dropping 'cpu'");

        let mut out = Vec::new();
        buffer.flush(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "[drop-measurement] dropping 'cpu'\n"
        );
    }

    #[test]
    fn clones_share_the_buffer() {
        let buffer = LogBuffer::new();
        let clone = buffer.clone();
        clone.record("message");
        assert!(!buffer.is_empty());
    }
}
