//! Queue engine: the operation surface callers drive.
//!
//! Every operation returns immediately. Work that needs the hardware is tracked as
//! a task keyed by a caller-chosen [`QToken`] and resolved only by [`RdmaQueue::poll`].

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::connection::{CmHandle, ConnState};
use crate::context::RdmaContext;
use crate::error::{QueueError, Result};
use crate::memory::{buffer_addr, PinSet};
use crate::task::{OpKind, PushInFlight, Task, TaskKind, TaskTable};
use crate::types::{OperationResult, PollResult, QDesc, QToken, SgArray, SockType};
use crate::verbs::{CqKind, RdmaDevice, SendWorkRequest, Sge, WrOpcode};
use crate::wire::OutgoingFrame;

/// Per-queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Send work requests posted.
    pub pushes_posted: u64,
    /// Push tasks completed by a send completion.
    pub pushes_completed: u64,
    /// Pop tasks completed with a decoded message.
    pub pops_completed: u64,
    /// Accept tasks completed.
    pub accepts_completed: u64,
    /// Receive buffers posted, initial and replacement.
    pub recv_buffers_posted: u64,
    /// Receive completions drained.
    pub recv_completions: u64,
    /// Messages that failed to decode.
    pub protocol_violations: u64,
    /// Connection-management events handled.
    pub events_handled: u64,
    /// Incomplete pushes dropped while their send was outstanding.
    pub tombstones_created: u64,
    /// Tombstones released by their late send completion.
    pub tombstones_reaped: u64,
}

/// A receive buffer the hardware may write into.
pub(crate) struct PostedRecv {
    pub(crate) pins: PinSet,
    pub(crate) buf: BytesMut,
}

pub(crate) struct QueueInner<D: RdmaDevice> {
    pub(crate) qd: QDesc,
    pub(crate) handle: Option<CmHandle>,
    pub(crate) state: ConnState,
    pub(crate) accept_backlog: VecDeque<crate::verbs::CmId>,
    /// Delivered receive buffers, truncated to the received length.
    pub(crate) recv_backlog: VecDeque<Bytes>,
    /// Posted receive buffers keyed by work request id (the buffer address).
    pub(crate) posted_recv: HashMap<u64, PostedRecv>,
    pub(crate) tasks: TaskTable<D>,
    pub(crate) stats: QueueStats,
    pub(crate) ctx: Arc<RdmaContext<D>>,
}

impl<D: RdmaDevice> QueueInner<D> {
    /// Returns the connection handle, or why there is none.
    pub(crate) fn require_handle(&self) -> Result<CmHandle> {
        if self.state == ConnState::Closed {
            return Err(QueueError::invalid_state(format!("{} is closed", self.qd)));
        }
        self.handle.ok_or_else(|| {
            QueueError::invalid_argument(format!("{} has no connection handle", self.qd))
        })
    }

    /// Rejects data-path operations on queues that cannot carry data.
    fn require_data_path(&self, op: &str) -> Result<CmHandle> {
        let handle = self.require_handle()?;
        match self.state {
            ConnState::Established => Ok(handle),
            ConnState::Listening => Err(QueueError::not_supported(format!(
                "{} on listening queue {}",
                op, self.qd
            ))),
            state => Err(QueueError::invalid_state(format!(
                "{} on {} while {:?}",
                op, self.qd, state
            ))),
        }
    }

    fn post_push(&mut self, token: QToken, sga: &SgArray) -> Result<()> {
        let handle = self.require_data_path("push")?;
        let max_segments = self.ctx.config().max_segments();
        if sga.num_segments() > max_segments {
            return Err(QueueError::not_supported(format!(
                "{} segments exceed the limit of {}",
                sga.num_segments(),
                max_segments
            )));
        }
        self.tasks.ensure_vacant(token)?;

        let frame = OutgoingFrame::encode(sga)?;
        let mut sg_list = Vec::with_capacity(frame.gather().len());
        let mut addrs = Vec::with_capacity(frame.gather().len());
        for region in frame.gather() {
            let addr = buffer_addr(region);
            if region.is_empty() {
                sg_list.push(Sge {
                    addr,
                    length: 0,
                    lkey: 0,
                });
                continue;
            }
            let mr = self.ctx.register(handle.id, region)?;
            sg_list.push(Sge {
                addr,
                length: region.len() as u32,
                lkey: mr.lkey,
            });
            addrs.push(addr);
        }
        let pins = PinSet::pin(self.ctx.registry().clone(), addrs);

        let wr = SendWorkRequest {
            wr_id: token.0,
            opcode: WrOpcode::Send,
            signaled: true,
            sg_list,
        };
        self.ctx.device().post_send(handle.id, &wr)?;
        trace!(qd = %self.qd, token = %token, bytes = frame.wire_len(), "posted send");

        self.tasks
            .insert(token, Task::new(TaskKind::Push(PushInFlight::new(pins, frame))))?;
        self.stats.pushes_posted += 1;
        Ok(())
    }

    fn post_pop(&mut self, token: QToken) -> Result<()> {
        self.require_data_path("pop")?;
        self.tasks.insert(token, Task::new(TaskKind::Pop))
    }

    fn poll_task(&mut self, token: QToken) -> Result<PollResult> {
        let handle = self.require_handle()?;
        let op = {
            let task = self.tasks.get(token)?;
            if task.is_done() {
                return task.poll_result();
            }
            task.op()
        };

        match self.service_event_queue() {
            Ok(()) | Err(QueueError::WouldBlock) => {}
            Err(e) => return Err(e),
        }

        let batch = self.ctx.config().completion_batch;
        match op {
            OpKind::Push => self.service_completion_queue(handle.id, CqKind::Send, batch)?,
            OpKind::Pop => {
                self.service_completion_queue(handle.id, CqKind::Recv, batch)?;
                if let Some(buf) = self.recv_backlog.pop_front() {
                    self.complete_recv(token, buf)?;
                }
            }
            OpKind::Accept => self.service_accept_queue(token)?,
        }

        self.tasks.get(token)?.poll_result()
    }
}

impl<D: RdmaDevice> Drop for QueueInner<D> {
    fn drop(&mut self) {
        if self.state == ConnState::Closed || self.handle.is_none() {
            return;
        }
        if let Err(e) = self.close_connection() {
            warn!(qd = %self.qd, error = %e, "failed to release queue on drop");
        }
    }
}

/// Handle to one network queue.
///
/// Cloning yields another handle to the same queue. The queue releases its hardware
/// resources when closed, or when the last handle is dropped.
pub struct RdmaQueue<D: RdmaDevice> {
    inner: Arc<Mutex<QueueInner<D>>>,
}

impl<D: RdmaDevice> Clone for RdmaQueue<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: RdmaDevice> RdmaQueue<D> {
    /// Creates an unattached queue bound to `ctx`.
    pub fn new(ctx: Arc<RdmaContext<D>>, qd: QDesc) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                qd,
                handle: None,
                state: ConnState::Unattached,
                accept_backlog: VecDeque::new(),
                recv_backlog: VecDeque::new(),
                posted_recv: HashMap::new(),
                tasks: TaskTable::new(),
                stats: QueueStats::default(),
                ctx,
            })),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueInner<D>> {
        self.inner.lock()
    }

    /// Descriptor assigned at creation.
    pub fn qd(&self) -> QDesc {
        self.lock().qd
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        self.lock().state
    }

    /// Returns true if the queue is listening for connections.
    pub fn is_listening(&self) -> bool {
        self.state() == ConnState::Listening
    }

    /// Allocates the event channel and connection id.
    pub fn socket(&self, kind: SockType) -> Result<()> {
        self.lock().open_socket(kind)
    }

    /// Binds to a local address.
    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        self.lock().bind_local(addr)
    }

    /// Starts accepting connect requests.
    pub fn listen(&self, backlog: u32) -> Result<()> {
        self.lock().start_listening(backlog)
    }

    /// Connects to `addr`, waiting for the handshake to finish.
    ///
    /// A refusing peer yields [`QueueError::ConnectionRefused`]; the queue stays open and
    /// can still be closed.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.lock().connect_active(addr)
    }

    /// Starts accepting one connection onto a new queue with descriptor `new_qd`.
    ///
    /// The new queue is returned right away but carries no connection until `token`
    /// completes.
    pub fn accept(&self, token: QToken, new_qd: QDesc) -> Result<RdmaQueue<D>> {
        let mut inner = self.lock();
        inner.require_handle()?;
        if inner.state != ConnState::Listening {
            return Err(QueueError::invalid_state(format!(
                "accept on {} while {:?}",
                inner.qd, inner.state
            )));
        }
        inner.tasks.ensure_vacant(token)?;

        let new_queue = RdmaQueue::new(Arc::clone(&inner.ctx), new_qd);
        inner.tasks.insert(
            token,
            Task::new(TaskKind::Accept {
                new_queue: new_queue.clone(),
            }),
        )?;
        debug!(qd = %inner.qd, token = %token, new_qd = %new_qd, "accept pending");
        Ok(new_queue)
    }

    /// Sends `sga` as one framed message. Segments are not copied.
    pub fn push(&self, token: QToken, sga: &SgArray) -> Result<()> {
        self.lock().post_push(token, sga)
    }

    /// Requests the next received message.
    pub fn pop(&self, token: QToken) -> Result<()> {
        self.lock().post_pop(token)
    }

    /// Makes progress on the queue and reports the state of `token`.
    pub fn poll(&self, token: QToken) -> Result<PollResult> {
        self.lock().poll_task(token)
    }

    /// Polls `token` until it completes or `timeout` passes.
    pub fn wait(&self, token: QToken, timeout: Duration) -> Result<OperationResult> {
        let start = Instant::now();
        loop {
            if let PollResult::Done(result) = self.poll(token)? {
                return Ok(result);
            }
            if start.elapsed() >= timeout {
                return Err(QueueError::TimedOut {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            std::hint::spin_loop();
        }
    }

    /// Forgets `token`. An outstanding push keeps its buffers until the hardware
    /// reports it, and the token stays reserved until then.
    pub fn drop_token(&self, token: QToken) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == ConnState::Closed {
            return Err(QueueError::invalid_state(format!("{} is closed", inner.qd)));
        }
        if inner.tasks.remove(token)? {
            inner.stats.tombstones_created += 1;
            debug!(qd = %inner.qd, token = %token, "dropped in-flight push");
        }
        Ok(())
    }

    /// Releases the queue pair, connection id and event channel.
    pub fn close(&self) -> Result<()> {
        self.lock().close_connection()
    }

    /// Local address, once bound or connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let inner = self.lock();
        let id = inner.handle?.id;
        let addr = inner.ctx.device().local_addr(id);
        addr
    }

    /// Remote address of a connected queue.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        let inner = self.lock();
        let id = inner.handle?.id;
        let addr = inner.ctx.device().peer_addr(id);
        addr
    }

    /// Snapshot of the queue's counters.
    pub fn stats(&self) -> QueueStats {
        self.lock().stats.clone()
    }

    /// Number of live tasks.
    pub fn pending_tasks(&self) -> usize {
        self.lock().tasks.live()
    }

    /// Number of dropped pushes still waiting for their send completion.
    pub fn tombstones(&self) -> usize {
        self.lock().tasks.tombstones()
    }

    /// Framing bytes retained by tombstones.
    pub fn retained_bytes(&self) -> usize {
        self.lock().tasks.retained_bytes()
    }
}

impl<D: RdmaDevice> std::fmt::Debug for RdmaQueue<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("RdmaQueue")
            .field("qd", &inner.qd)
            .field("state", &inner.state)
            .field("tasks", &inner.tasks.live())
            .finish()
    }
}
