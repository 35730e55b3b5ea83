//! Bounded console ring buffer with monotonic epoch cursors

use parking_lot::RwLock;
use std::collections::VecDeque;

/// Default ring buffer capacity, matching the source daemon's default.
pub const DEFAULT_CAPACITY: usize = 50;

/// A snapshot of the console buffer at a point in time.
#[derive(Debug, Clone, Default)]
pub struct ConsoleSnapshot {
    /// Buffered lines, oldest first.
    pub lines: Vec<String>,

    /// Epoch of the newest line in this snapshot (0 if empty).
    pub epoch: u64,
}

struct Inner {
    capacity: usize,
    lines: VecDeque<(u64, String)>,
    epoch: u64,
}

/// Bounded FIFO of console lines, capacity N (default 50), with a
/// monotonically increasing epoch counter incremented per accepted line.
///
/// Lines are accepted verbatim: no formatting, no timestamping, no parsing.
/// Safe under concurrent writers and readers.
pub struct ConsoleBuffer {
    inner: RwLock<Inner>,
}

impl ConsoleBuffer {
    /// Create a buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                capacity: capacity.max(1),
                lines: VecDeque::with_capacity(capacity.max(1)),
                epoch: 0,
            }),
        }
    }

    /// Append a line, dropping the oldest if at capacity. Returns the
    /// epoch assigned to this line.
    pub fn append(&self, line: impl Into<String>) -> u64 {
        let mut inner = self.inner.write();
        inner.epoch += 1;
        let epoch = inner.epoch;
        if inner.lines.len() >= inner.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back((epoch, line.into()));
        epoch
    }

    /// Return a copy of all buffered lines and the epoch of the newest.
    pub fn snapshot(&self) -> ConsoleSnapshot {
        let inner = self.inner.read();
        ConsoleSnapshot {
            lines: inner.lines.iter().map(|(_, l)| l.clone()).collect(),
            epoch: inner.epoch,
        }
    }

    /// Return all lines strictly newer than `epoch`, plus the new watermark.
    pub fn since(&self, epoch: u64) -> ConsoleSnapshot {
        let inner = self.inner.read();
        let lines = inner
            .lines
            .iter()
            .filter(|(e, _)| *e > epoch)
            .map(|(_, l)| l.clone())
            .collect();
        ConsoleSnapshot {
            lines,
            epoch: inner.epoch,
        }
    }

    /// Current watermark (epoch of the newest appended line, 0 if none).
    pub fn current_epoch(&self) -> u64 {
        self.inner.read().epoch
    }
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_assigns_strictly_monotonic_epochs() {
        let buf = ConsoleBuffer::new(10);
        let e1 = buf.append("a");
        let e2 = buf.append("b");
        assert!(e2 > e1);
        assert_eq!(e1, 1);
        assert_eq!(e2, 2);
    }

    #[test]
    fn capacity_drops_oldest() {
        let buf = ConsoleBuffer::new(3);
        for i in 0..5 {
            buf.append(format!("line{i}"));
        }
        let snap = buf.snapshot();
        assert_eq!(snap.lines, vec!["line2", "line3", "line4"]);
        assert_eq!(snap.epoch, 5);
    }

    #[test]
    fn since_returns_only_newer_lines() {
        let buf = ConsoleBuffer::new(10);
        buf.append("a");
        let mark = buf.current_epoch();
        buf.append("b");
        buf.append("c");
        let since = buf.since(mark);
        assert_eq!(since.lines, vec!["b", "c"]);
        assert_eq!(since.epoch, 3);
    }

    #[test]
    fn boundary_n_plus_k_appends() {
        let buf = ConsoleBuffer::new(50);
        let before = buf.current_epoch();
        for i in 0..60 {
            buf.append(format!("l{i}"));
        }
        let snap = buf.snapshot();
        assert_eq!(snap.lines.len(), 50);
        assert_eq!(snap.lines.first().unwrap(), "l10");
        let since = buf.since(before);
        assert_eq!(since.lines.len(), 50);
    }
}
