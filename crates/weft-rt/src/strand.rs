// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Execution contexts of a scheduler thread.
//!
//! A scheduler thread is made of several strands: the root, the processor,
//! the reader and one strand per running fiber. Each strand is an OS thread
//! parked on its own inbox. Switching to another strand means sending to its
//! inbox and then blocking on our own, so exactly one strand of a scheduler
//! thread runs at any instant.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender};

use crate::command::Command;

static NEXT_STRAND: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct StrandId(u64);

impl StrandId {
    pub fn next() -> Self {
        StrandId(NEXT_STRAND.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StrandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inbox message of a fiber strand.
pub(crate) enum Wake {
    Resume,
}

/// Inbox message of the processor.
pub(crate) enum ToProcessor {
    /// Next command, handed over by the reader.
    Command(Command),
    /// A fiber gave the baton back.
    Resume,
    Stop,
}

/// Inbox message of the root.
pub(crate) enum ToRoot {
    /// One command was processed; run the reader again.
    Continue,
    Stop,
}

/// Inbox message of the reader.
pub(crate) enum ToReader {
    Resume,
    Stop,
}

/// Create an inbox. Sends never block; the receive side is the rendezvous.
pub(crate) fn inbox<M>() -> (Sender<M>, Receiver<M>) {
    crossbeam_channel::unbounded()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strand_ids_are_unique() {
        let a = StrandId::next();
        let b = StrandId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn inbox_hands_over_in_order() {
        let (tx, rx) = inbox::<ToReader>();
        tx.send(ToReader::Resume).unwrap();
        tx.send(ToReader::Stop).unwrap();
        assert!(matches!(rx.recv(), Ok(ToReader::Resume)));
        assert!(matches!(rx.recv(), Ok(ToReader::Stop)));
        drop(tx);
        assert!(rx.recv().is_err());
    }
}
