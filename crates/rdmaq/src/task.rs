//! Task table: one record per outstanding token.
//!
//! Dropping a push whose send has not completed leaves a tombstone behind. The
//! tombstone keeps the frame and its pins alive until the hardware reports the
//! send, so a late completion never touches released memory, and it keeps the
//! token reserved so the late completion cannot be mistaken for a newer push.

use std::collections::HashMap;

use crate::error::{QueueError, Result};
use crate::memory::PinSet;
use crate::queue::RdmaQueue;
use crate::types::{OperationResult, PollResult, QToken};
use crate::verbs::RdmaDevice;
use crate::wire::OutgoingFrame;

/// A posted send and everything the hardware may still read.
#[derive(Debug)]
pub(crate) struct PushInFlight {
    // Declared first so it drops before the buffers it covers.
    pins: Option<PinSet>,
    frame: OutgoingFrame,
}

impl PushInFlight {
    pub(crate) fn new(pins: PinSet, frame: OutgoingFrame) -> Self {
        Self {
            pins: Some(pins),
            frame,
        }
    }

    /// Releases the pins, keeping the framing buffer until the task is dropped.
    fn unpin(&mut self) {
        self.pins = None;
    }

    pub(crate) fn frame(&self) -> &OutgoingFrame {
        &self.frame
    }
}

/// Operation-specific task state.
pub(crate) enum TaskKind<D: RdmaDevice> {
    Push(PushInFlight),
    Pop,
    Accept { new_queue: RdmaQueue<D> },
}

/// Operation kind without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Push,
    Pop,
    Accept,
}

pub(crate) struct Task<D: RdmaDevice> {
    kind: TaskKind<D>,
    outcome: Option<Result<OperationResult>>,
}

impl<D: RdmaDevice> Task<D> {
    pub(crate) fn new(kind: TaskKind<D>) -> Self {
        Self {
            kind,
            outcome: None,
        }
    }

    pub(crate) fn op(&self) -> OpKind {
        match self.kind {
            TaskKind::Push(_) => OpKind::Push,
            TaskKind::Pop => OpKind::Pop,
            TaskKind::Accept { .. } => OpKind::Accept,
        }
    }

    pub(crate) fn kind(&self) -> &TaskKind<D> {
        &self.kind
    }

    pub(crate) fn is_done(&self) -> bool {
        self.outcome.is_some()
    }

    pub(crate) fn complete(&mut self, result: OperationResult) {
        debug_assert!(self.outcome.is_none(), "task completed twice");
        self.outcome = Some(Ok(result));
    }

    pub(crate) fn fail(&mut self, err: QueueError) {
        debug_assert!(self.outcome.is_none(), "task completed twice");
        self.outcome = Some(Err(err));
    }

    /// What a poll of this task reports right now.
    pub(crate) fn poll_result(&self) -> Result<PollResult> {
        match &self.outcome {
            None => Ok(PollResult::NotReady),
            Some(Ok(result)) => Ok(PollResult::Done(result.clone())),
            Some(Err(e)) => Err(e.clone()),
        }
    }
}

/// Tokens that were dropped while hardware work was still outstanding.
#[derive(Debug)]
struct Tombstone {
    awaiting: usize,
    retained: Option<PushInFlight>,
}

enum Slot<D: RdmaDevice> {
    Live(Task<D>),
    Tombstone(Tombstone),
}

/// How a send completion was matched against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendSettlement {
    /// A live push task was completed.
    Completed,
    /// A tombstone received its last completion and was removed.
    Reaped,
    /// A tombstone is still waiting for more completions.
    Pending,
    /// No push is waiting on this token.
    Unmatched,
}

pub(crate) struct TaskTable<D: RdmaDevice> {
    slots: HashMap<QToken, Slot<D>>,
}

impl<D: RdmaDevice> TaskTable<D> {
    pub(crate) fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// Fails unless `token` is free for a new task.
    pub(crate) fn ensure_vacant(&self, token: QToken) -> Result<()> {
        match self.slots.get(&token) {
            None => Ok(()),
            Some(Slot::Live(_)) => Err(QueueError::invalid_argument(format!(
                "{} already identifies a live task",
                token
            ))),
            Some(Slot::Tombstone(_)) => Err(QueueError::invalid_argument(format!(
                "{} is still awaiting completions of a dropped task",
                token
            ))),
        }
    }

    pub(crate) fn insert(&mut self, token: QToken, task: Task<D>) -> Result<()> {
        self.ensure_vacant(token)?;
        self.slots.insert(token, Slot::Live(task));
        Ok(())
    }

    pub(crate) fn get(&self, token: QToken) -> Result<&Task<D>> {
        match self.slots.get(&token) {
            Some(Slot::Live(task)) => Ok(task),
            _ => Err(unknown(token)),
        }
    }

    pub(crate) fn get_mut(&mut self, token: QToken) -> Result<&mut Task<D>> {
        match self.slots.get_mut(&token) {
            Some(Slot::Live(task)) => Ok(task),
            _ => Err(unknown(token)),
        }
    }

    /// Removes a live task. An incomplete push is left behind as a tombstone.
    /// Returns true if a tombstone was created.
    pub(crate) fn remove(&mut self, token: QToken) -> Result<bool> {
        let task = match self.slots.remove(&token) {
            Some(Slot::Live(task)) => task,
            Some(slot @ Slot::Tombstone(_)) => {
                self.slots.insert(token, slot);
                return Err(unknown(token));
            }
            None => return Err(unknown(token)),
        };

        let done = task.is_done();
        match task.kind {
            TaskKind::Push(push) if !done => {
                self.slots.insert(
                    token,
                    Slot::Tombstone(Tombstone {
                        awaiting: 1,
                        retained: Some(push),
                    }),
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Applies a send completion for `token`. A failed send still releases the pins:
    /// once the hardware reports the request, it no longer reads the buffers.
    pub(crate) fn settle_send(&mut self, token: QToken, outcome: Result<usize>) -> SendSettlement {
        match self.slots.get_mut(&token) {
            Some(Slot::Live(task)) => match &mut task.kind {
                TaskKind::Push(push) if task.outcome.is_none() => {
                    push.unpin();
                    task.outcome = Some(outcome.map(|bytes| OperationResult::Push { bytes }));
                    SendSettlement::Completed
                }
                _ => SendSettlement::Unmatched,
            },
            Some(Slot::Tombstone(tomb)) => {
                tomb.awaiting = tomb.awaiting.saturating_sub(1);
                if tomb.awaiting > 0 {
                    return SendSettlement::Pending;
                }
                // Dropping the slot unpins, then frees, the retained frame.
                self.slots.remove(&token);
                SendSettlement::Reaped
            }
            None => SendSettlement::Unmatched,
        }
    }

    /// Number of live tasks.
    pub(crate) fn live(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s, Slot::Live(_)))
            .count()
    }

    /// Number of tombstones awaiting completions.
    pub(crate) fn tombstones(&self) -> usize {
        self.slots.len() - self.live()
    }

    /// Retained framing bytes held by tombstones.
    pub(crate) fn retained_bytes(&self) -> usize {
        self.slots
            .values()
            .filter_map(|s| match s {
                Slot::Tombstone(t) => t.retained.as_ref().map(|p| p.frame().framing().len()),
                Slot::Live(_) => None,
            })
            .sum()
    }

    /// Forgets every task and tombstone. Only valid once the queue pair is gone.
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }
}

fn unknown(token: QToken) -> QueueError {
    QueueError::invalid_argument(format!("unknown token {}", token))
}
