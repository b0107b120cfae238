//! Snapshot sinks and the two-outcome persist contract.
//!
//! A sink receives the full-state stream of a snapshot. Exactly one of
//! [`SnapshotSink::close`] (the stream is complete and valid) or
//! [`SnapshotSink::cancel`] (discard what was written) must end its life;
//! both take the sink by value so neither can be skipped or repeated.

use std::io::{self, Write};

use tracing::{debug, warn};

use crate::errors::Result;

pub trait SnapshotSink: Write {
    /// What a successfully closed sink yields (a file descriptor, the bytes, ...).
    type Closed;

    fn id(&self) -> &str;

    /// Seal the snapshot as complete.
    fn close(self) -> Result<Self::Closed>;

    /// Discard the partial snapshot.
    fn cancel(self) -> Result<()>;
}

/// Drive `write` into `sink` and end the sink with the matching signal.
///
/// On success the sink is closed and its `Closed` value returned. On any
/// write error the sink is cancelled and the write error is returned.
pub fn persist_into<S, F>(mut sink: S, write: F) -> Result<S::Closed>
where
    S: SnapshotSink,
    F: FnOnce(&mut S) -> Result<()>,
{
    match write(&mut sink) {
        Ok(()) => {
            debug!(snapshot = sink.id(), "closing snapshot sink");
            sink.close()
        }
        Err(err) => {
            warn!(snapshot = sink.id(), error = %err, "persist failed, cancelling snapshot sink");
            if let Err(cancel_err) = sink.cancel() {
                warn!(error = %cancel_err, "failed to cancel snapshot sink");
            }
            Err(err)
        }
    }
}

/// In-memory sink; closing yields the written bytes.
#[derive(Debug)]
pub struct MemorySink {
    id: String,
    buf: Vec<u8>,
}

impl MemorySink {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            buf: Vec::new(),
        }
    }
}

impl Write for MemorySink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SnapshotSink for MemorySink {
    type Closed = Vec<u8>;

    fn id(&self) -> &str {
        &self.id
    }

    fn close(self) -> Result<Vec<u8>> {
        Ok(self.buf)
    }

    fn cancel(self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ArimaError;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records which terminal signal it received.
    struct RecordingSink {
        signals: Rc<RefCell<Vec<&'static str>>>,
        fail_writes: bool,
    }

    impl Write for RecordingSink {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.fail_writes {
                return Err(io::Error::other("disk full"));
            }
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SnapshotSink for RecordingSink {
        type Closed = ();

        fn id(&self) -> &str {
            "recording"
        }

        fn close(self) -> Result<()> {
            self.signals.borrow_mut().push("close");
            Ok(())
        }

        fn cancel(self) -> Result<()> {
            self.signals.borrow_mut().push("cancel");
            Ok(())
        }
    }

    #[test]
    fn successful_write_closes_the_sink() {
        let signals = Rc::new(RefCell::new(Vec::new()));
        let sink = RecordingSink {
            signals: signals.clone(),
            fail_writes: false,
        };

        persist_into(sink, |s| Ok(s.write_all(b"state")?)).unwrap();
        assert_eq!(*signals.borrow(), vec!["close"]);
    }

    #[test]
    fn failed_write_cancels_the_sink_and_propagates() {
        let signals = Rc::new(RefCell::new(Vec::new()));
        let sink = RecordingSink {
            signals: signals.clone(),
            fail_writes: true,
        };

        let err = persist_into(sink, |s| Ok(s.write_all(b"state")?)).unwrap_err();
        assert!(matches!(err, ArimaError::Io(_)));
        assert_eq!(*signals.borrow(), vec!["cancel"]);
    }

    #[test]
    fn memory_sink_yields_written_bytes() {
        let bytes = persist_into(MemorySink::new("mem"), |s| Ok(s.write_all(b"abc")?)).unwrap();
        assert_eq!(bytes, b"abc");
    }
}
