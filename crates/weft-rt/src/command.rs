// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Commands and the command queue of a scheduler thread.
//!
//! The queue is the only structure shared across OS threads. Any thread may
//! push; only the reader strand of the owning scheduler pops.

use std::fmt;

use crossbeam_channel::{Receiver, SendError, Sender};

use crate::fiber::FiberId;
use crate::scheduler::SchedulerId;
use crate::strand::StrandId;
use crate::task::Task;

/// One unit of scheduler work. Processed exactly once, in dequeue order.
pub(crate) enum Command {
    /// Start a fiber running the task.
    SpawnTask(Task),
    /// The fiber has an outcome and already left the active set; resume
    /// the strands that were parked on it.
    ResultReady {
        fiber: FiberId,
        waiters: Vec<StrandId>,
    },
    /// Stop the run loop immediately.
    Kill { thread: SchedulerId },
    /// Stop once no fiber is outstanding.
    StartShutdown { thread: SchedulerId },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::SpawnTask(_) => "spawn-task",
            Command::ResultReady { .. } => "result-ready",
            Command::Kill { .. } => "kill",
            Command::StartShutdown { .. } => "start-shutdown",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SpawnTask(_) => f.write_str("SpawnTask"),
            Command::ResultReady { fiber, waiters } => f
                .debug_struct("ResultReady")
                .field("fiber", fiber)
                .field("waiters", waiters)
                .finish(),
            Command::Kill { thread } => f.debug_struct("Kill").field("thread", thread).finish(),
            Command::StartShutdown { thread } => {
                f.debug_struct("StartShutdown").field("thread", thread).finish()
            }
        }
    }
}

/// Producer side of a scheduler's command queue.
#[derive(Clone)]
pub(crate) struct CommandSender {
    thread: SchedulerId,
    tx: Sender<Command>,
}

impl CommandSender {
    pub fn thread(&self) -> SchedulerId {
        self.thread
    }

    /// Enqueue a command. Fails once the scheduler has terminated.
    pub fn send(&self, cmd: Command) -> Result<(), SendError<Command>> {
        self.tx.send(cmd)
    }
}

/// Create the queue of scheduler `thread`.
pub(crate) fn queue(thread: SchedulerId) -> (CommandSender, Receiver<Command>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (CommandSender { thread, tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_producer_order_is_kept() {
        let id = SchedulerId::next();
        let (tx, rx) = queue(id);
        tx.send(Command::StartShutdown { thread: id }).unwrap();
        tx.send(Command::Kill { thread: id }).unwrap();
        let names: Vec<_> = rx.try_iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["start-shutdown", "kill"]);
    }

    #[test]
    fn send_fails_after_consumer_is_gone() {
        let id = SchedulerId::next();
        let (tx, rx) = queue(id);
        drop(rx);
        let err = tx.send(Command::Kill { thread: id }).unwrap_err();
        assert!(matches!(err.0, Command::Kill { .. }));
        assert_eq!(tx.thread(), id);
    }

    #[test]
    fn debug_names_variant() {
        let id = SchedulerId::next();
        let s = format!("{:?}", Command::StartShutdown { thread: id });
        assert!(s.starts_with("StartShutdown"));
    }
}
