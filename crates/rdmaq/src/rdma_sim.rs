//! RDMA simulation for testing without hardware.
//!
//! A [`SimFabric`] links any number of [`SimDevice`]s, one per simulated host, and
//! implements the connection manager, protection domains, queue pairs and completion
//! queues in software. Posted sends are executed lazily, the next time any completion
//! queue on the fabric is polled, so buffers really are read after `post_send`
//! returns. Every gathered or scattered region is checked against [`SimMemory`]: it
//! must be pinned and carry the lkey of the queue pair's domain. Requests that fail
//! the check complete with `LocalProtectionError` and are counted as DMA violations.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{QueueError, Result};
use crate::memory::{MemoryRegistration, MemoryRegistry};
use crate::verbs::{
    ChannelId, CmEvent, CmEventKind, CmId, CompletionStatus, ConnParams, CqKind, DomainHandle,
    PortSpace, QpInitAttr, RdmaDevice, RecvWorkRequest, SendWorkRequest, Sge, WcOpcode,
    WorkCompletion, WrOpcode,
};

static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(1);
static QP_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_handle() -> u64 {
    HANDLE_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Local key the simulation issues for registrations in `domain`.
pub fn lkey_for(domain: DomainHandle) -> u32 {
    domain.0 as u32 | 0x4000_0000
}

/// Pin bookkeeping shared by every device of a fabric.
#[derive(Default)]
pub struct SimMemory {
    pins: Mutex<HashMap<u64, usize>>,
    refuse: AtomicBool,
    registrations: AtomicU64,
    unbalanced_unpins: AtomicU64,
}

impl SimMemory {
    /// Returns true if `addr` holds at least one pin.
    pub fn is_pinned(&self, addr: u64) -> bool {
        self.pins.lock().contains_key(&addr)
    }

    /// Number of distinct pinned addresses.
    pub fn pinned_addrs(&self) -> usize {
        self.pins.lock().len()
    }

    /// Sum of pin counts over all addresses.
    pub fn total_pins(&self) -> usize {
        self.pins.lock().values().sum()
    }

    /// Registration lookups served.
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::Relaxed)
    }

    /// Unpins of addresses that were not pinned.
    pub fn unbalanced_unpins(&self) -> u64 {
        self.unbalanced_unpins.load(Ordering::Relaxed)
    }

    /// Makes every registration lookup fail while `refuse` is set.
    pub fn refuse_registrations(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Relaxed);
    }
}

impl MemoryRegistry for SimMemory {
    fn register(&self, _addr: u64, _len: usize, domain: DomainHandle) -> Option<MemoryRegistration> {
        if self.refuse.load(Ordering::Relaxed) {
            return None;
        }
        self.registrations.fetch_add(1, Ordering::Relaxed);
        Some(MemoryRegistration {
            lkey: lkey_for(domain),
            domain,
        })
    }

    fn pin(&self, addr: u64) {
        *self.pins.lock().entry(addr).or_insert(0) += 1;
    }

    fn unpin(&self, addr: u64) {
        let mut pins = self.pins.lock();
        let remaining = match pins.get_mut(&addr) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => {
                self.unbalanced_unpins.fetch_add(1, Ordering::Relaxed);
                warn!(addr, "unpin of unpinned address");
                return;
            }
        };
        if remaining == 0 {
            pins.remove(&addr);
        }
    }
}

/// Queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QpState {
    /// Freshly created.
    Reset,
    /// Initialized; receives may be posted.
    Init,
    /// Ready to receive.
    ReadyToReceive,
    /// Ready to send.
    ReadyToSend,
    /// Failed; nothing may be posted.
    Error,
}

impl Default for QpState {
    fn default() -> Self {
        Self::Reset
    }
}

/// Bounded completion queue.
pub struct CompletionQueue {
    entries: VecDeque<WorkCompletion>,
    /// Maximum number of queued entries.
    pub capacity: usize,
}

impl CompletionQueue {
    /// Creates an empty queue holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    /// Returns false if the queue is full and the entry was lost.
    pub fn push(&mut self, entry: WorkCompletion) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.push_back(entry);
        true
    }

    /// Removes up to `max_entries` entries, oldest first.
    pub fn poll(&mut self, max_entries: usize) -> Vec<WorkCompletion> {
        let n = max_entries.min(self.entries.len());
        self.entries.drain(..n).collect()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct SimQueuePair {
    qp_num: u32,
    pd: DomainHandle,
    attr: QpInitAttr,
    state: QpState,
    send_queue: VecDeque<SendWorkRequest>,
    recv_queue: VecDeque<RecvWorkRequest>,
    send_cq: CompletionQueue,
    recv_cq: CompletionQueue,
}

impl SimQueuePair {
    fn new(pd: DomainHandle, attr: QpInitAttr, cq_depth: usize) -> Self {
        Self {
            qp_num: QP_COUNTER.fetch_add(1, Ordering::Relaxed) as u32,
            pd,
            attr,
            state: QpState::Reset,
            send_queue: VecDeque::new(),
            recv_queue: VecDeque::new(),
            send_cq: CompletionQueue::new(cq_depth),
            recv_cq: CompletionQueue::new(cq_depth),
        }
    }

    fn modify_to_init(&mut self) -> bool {
        if self.state != QpState::Reset {
            return false;
        }
        self.state = QpState::Init;
        true
    }

    fn modify_to_rtr(&mut self) -> bool {
        if self.state != QpState::Init {
            return false;
        }
        self.state = QpState::ReadyToReceive;
        true
    }

    fn modify_to_rts(&mut self) -> bool {
        if self.state != QpState::ReadyToReceive {
            return false;
        }
        self.state = QpState::ReadyToSend;
        true
    }

    fn bring_up(&mut self) -> Result<()> {
        if self.modify_to_rtr() && self.modify_to_rts() {
            Ok(())
        } else {
            Err(QueueError::invalid_state(format!(
                "queue pair {} cannot reach RTS from {:?}",
                self.qp_num, self.state
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdPhase {
    Idle,
    Bound,
    Listening,
    AddrResolved,
    RouteResolved,
    /// Incoming connection waiting to be accepted.
    Requested,
    Connected,
    Disconnected,
}

struct SimCmId {
    node: IpAddr,
    channel: ChannelId,
    port_space: PortSpace,
    phase: IdPhase,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    peer: Option<CmId>,
    listener: Option<CmId>,
    backlog: u32,
    qp: Option<SimQueuePair>,
    /// Messages that arrived before a receive buffer was posted.
    inbox: VecDeque<Vec<u8>>,
}

impl SimCmId {
    fn new(node: IpAddr, channel: ChannelId, port_space: PortSpace) -> Self {
        Self {
            node,
            channel,
            port_space,
            phase: IdPhase::Idle,
            local: None,
            remote: None,
            peer: None,
            listener: None,
            backlog: 0,
            qp: None,
            inbox: VecDeque::new(),
        }
    }
}

#[derive(Default)]
struct SimChannel {
    events: VecDeque<CmEvent>,
    nonblocking: bool,
}

/// Fabric-wide limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFabricConfig {
    /// Capacity of every completion queue.
    pub cq_depth: usize,
    /// First port handed out to unbound connection ids.
    pub ephemeral_port_base: u16,
}

impl Default for SimFabricConfig {
    fn default() -> Self {
        Self {
            cq_depth: 1024,
            ephemeral_port_base: 49152,
        }
    }
}

/// Counters kept by the fabric.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct FabricStats {
    /// Connect requests that reached a listener.
    pub connections_established: u64,
    /// Connect requests nobody listened for.
    pub connections_rejected: u64,
    /// Sends executed successfully.
    pub messages_sent: u64,
    /// Bytes gathered by successful sends.
    pub bytes_sent: u64,
    /// Messages scattered into receive buffers.
    pub messages_delivered: u64,
    /// Gathers or scatters that touched unpinned or foreign memory.
    pub dma_violations: u64,
    /// Messages larger than the receive buffer they landed in.
    pub length_errors: u64,
    /// Sends completed with an injected status.
    pub injected_faults: u64,
    /// Completions lost to a full completion queue.
    pub cq_overflows: u64,
    /// Protection domains allocated.
    pub domains_allocated: u64,
    /// Protection domains released.
    pub domains_released: u64,
}

struct FabricState {
    config: SimFabricConfig,
    nodes: HashSet<IpAddr>,
    unreachable: HashSet<IpAddr>,
    unroutable: HashSet<IpAddr>,
    channels: HashMap<ChannelId, SimChannel>,
    ids: HashMap<CmId, SimCmId>,
    domains: HashMap<DomainHandle, IpAddr>,
    faults: VecDeque<CompletionStatus>,
    next_port: u16,
    stats: FabricStats,
}

impl FabricState {
    fn new(config: SimFabricConfig) -> Self {
        Self {
            next_port: config.ephemeral_port_base,
            config,
            nodes: HashSet::new(),
            unreachable: HashSet::new(),
            unroutable: HashSet::new(),
            channels: HashMap::new(),
            ids: HashMap::new(),
            domains: HashMap::new(),
            faults: VecDeque::new(),
            stats: FabricStats::default(),
        }
    }

    fn id(&self, id: CmId) -> Result<&SimCmId> {
        self.ids
            .get(&id)
            .ok_or_else(|| QueueError::invalid_argument(format!("unknown connection id {}", id)))
    }

    fn id_mut(&mut self, id: CmId) -> Result<&mut SimCmId> {
        self.ids
            .get_mut(&id)
            .ok_or_else(|| QueueError::invalid_argument(format!("unknown connection id {}", id)))
    }

    fn post_event(&mut self, id: CmId, kind: CmEventKind) {
        let Some(channel) = self.ids.get(&id).map(|c| c.channel) else {
            return;
        };
        match self.channels.get_mut(&channel) {
            Some(ch) => {
                trace!(id = %id, event = ?kind, "queued connection event");
                ch.events.push_back(CmEvent { id, kind });
            }
            None => warn!(id = %id, event = ?kind, "event for id without channel"),
        }
    }

    fn ephemeral_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = self
            .next_port
            .checked_add(1)
            .unwrap_or(self.config.ephemeral_port_base);
        port
    }

    fn find_listener(&self, dst: SocketAddr) -> Option<CmId> {
        self.ids
            .iter()
            .find(|(_, c)| {
                c.phase == IdPhase::Listening
                    && c.node == dst.ip()
                    && c.local.map_or(false, |l| l.port() == dst.port())
            })
            .map(|(id, _)| *id)
    }

    fn has_backlog_room(&self, listener: CmId) -> bool {
        let Some(l) = self.ids.get(&listener) else {
            return false;
        };
        let queued = self
            .ids
            .values()
            .filter(|c| c.listener == Some(listener) && c.phase == IdPhase::Requested)
            .count();
        queued < l.backlog as usize
    }

    fn teardown_id(&mut self, id: CmId) -> Result<()> {
        let removed = self
            .ids
            .remove(&id)
            .ok_or_else(|| QueueError::invalid_argument(format!("unknown connection id {}", id)))?;

        if let Some(peer) = removed.peer {
            let notify = match self.ids.get_mut(&peer) {
                Some(p) => {
                    p.peer = None;
                    if p.phase == IdPhase::Connected {
                        p.phase = IdPhase::Disconnected;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };
            if notify {
                self.post_event(peer, CmEventKind::Disconnected);
            }
        }

        // Requests nobody picked up from the listener's channel die with it.
        if removed.phase == IdPhase::Listening {
            let orphans: Vec<CmId> = self
                .ids
                .iter()
                .filter(|(_, c)| {
                    c.listener == Some(id)
                        && c.phase == IdPhase::Requested
                        && c.channel == removed.channel
                })
                .map(|(orphan, _)| *orphan)
                .collect();
            for orphan in orphans {
                self.teardown_id(orphan)?;
            }
        }
        Ok(())
    }

    /// Executes posted sends, then fills posted receive buffers.
    fn progress(&mut self, memory: &SimMemory) {
        let mut senders: Vec<CmId> = self
            .ids
            .iter()
            .filter(|(_, c)| c.qp.as_ref().map_or(false, |qp| !qp.send_queue.is_empty()))
            .map(|(id, _)| *id)
            .collect();
        senders.sort_by_key(|id| id.0);
        for id in senders {
            self.drain_sends(id, memory);
        }

        let mut receivers: Vec<CmId> = self
            .ids
            .iter()
            .filter(|(_, c)| !c.inbox.is_empty())
            .map(|(id, _)| *id)
            .collect();
        receivers.sort_by_key(|id| id.0);
        for id in receivers {
            self.deliver(id, memory);
        }
    }

    fn drain_sends(&mut self, id: CmId, memory: &SimMemory) {
        let peer = self
            .ids
            .get(&id)
            .and_then(|c| c.peer)
            .filter(|p| self.ids.contains_key(p));
        let Some(qp) = self.ids.get_mut(&id).and_then(|c| c.qp.as_mut()) else {
            return;
        };

        let mut outgoing = Vec::new();
        while let Some(wr) = qp.send_queue.pop_front() {
            let outcome = match self.faults.pop_front() {
                Some(status) => {
                    self.stats.injected_faults += 1;
                    Err(status)
                }
                None if peer.is_none() => Err(CompletionStatus::RetryExceeded),
                None => gather(memory, qp.pd, &wr.sg_list),
            };

            let (status, byte_len) = match outcome {
                Ok(payload) => {
                    let len = payload.len();
                    self.stats.messages_sent += 1;
                    self.stats.bytes_sent += len as u64;
                    outgoing.push(payload);
                    (CompletionStatus::Success, len as u32)
                }
                Err(status) => {
                    if status == CompletionStatus::LocalProtectionError {
                        self.stats.dma_violations += 1;
                    }
                    (status, 0)
                }
            };

            if wr.signaled || qp.attr.sq_sig_all {
                let wc = WorkCompletion {
                    wr_id: wr.wr_id,
                    status,
                    opcode: WcOpcode::Send,
                    byte_len,
                    qp_num: qp.qp_num,
                };
                if !qp.send_cq.push(wc) {
                    self.stats.cq_overflows += 1;
                    warn!(qp = qp.qp_num, "send completion queue overflow");
                }
            }
        }

        if let Some(p) = peer.and_then(|peer| self.ids.get_mut(&peer)) {
            p.inbox.extend(outgoing);
        }
    }

    fn deliver(&mut self, id: CmId, memory: &SimMemory) {
        let Some(conn) = self.ids.get_mut(&id) else {
            return;
        };
        // Without a ready queue pair the sender is simply not-ready-retried.
        let Some(qp) = conn.qp.as_mut() else {
            return;
        };
        if !matches!(qp.state, QpState::ReadyToReceive | QpState::ReadyToSend) {
            return;
        }

        while !conn.inbox.is_empty() && !qp.recv_queue.is_empty() {
            let (Some(msg), Some(wr)) = (conn.inbox.pop_front(), qp.recv_queue.pop_front()) else {
                break;
            };
            let status = scatter(memory, qp.pd, &wr.sg_list, &msg);
            let byte_len = match status {
                CompletionStatus::Success => {
                    self.stats.messages_delivered += 1;
                    msg.len() as u32
                }
                CompletionStatus::LocalLengthError => {
                    self.stats.length_errors += 1;
                    0
                }
                CompletionStatus::LocalProtectionError => {
                    self.stats.dma_violations += 1;
                    0
                }
                _ => 0,
            };
            let wc = WorkCompletion {
                wr_id: wr.wr_id,
                status,
                opcode: WcOpcode::Recv,
                byte_len,
                qp_num: qp.qp_num,
            };
            if !qp.recv_cq.push(wc) {
                self.stats.cq_overflows += 1;
                warn!(qp = qp.qp_num, "receive completion queue overflow");
            }
        }
    }
}

fn dma_allowed(memory: &SimMemory, pd: DomainHandle, sge: &Sge) -> bool {
    sge.lkey == lkey_for(pd) && memory.is_pinned(sge.addr)
}

fn gather(memory: &SimMemory, pd: DomainHandle, sg_list: &[Sge]) -> std::result::Result<Vec<u8>, CompletionStatus> {
    let total = sg_list.iter().map(|s| s.length as usize).sum();
    let mut payload = Vec::with_capacity(total);
    for sge in sg_list.iter().filter(|s| s.length > 0) {
        if !dma_allowed(memory, pd, sge) {
            return Err(CompletionStatus::LocalProtectionError);
        }
        // SAFETY: the region is pinned, and whoever pinned it keeps it allocated until
        // the matching unpin.
        let region = unsafe { std::slice::from_raw_parts(sge.addr as *const u8, sge.length as usize) };
        payload.extend_from_slice(region);
    }
    Ok(payload)
}

fn scatter(memory: &SimMemory, pd: DomainHandle, sg_list: &[Sge], msg: &[u8]) -> CompletionStatus {
    let capacity: usize = sg_list.iter().map(|s| s.length as usize).sum();
    if msg.len() > capacity {
        return CompletionStatus::LocalLengthError;
    }
    if sg_list
        .iter()
        .filter(|s| s.length > 0)
        .any(|sge| !dma_allowed(memory, pd, sge))
    {
        return CompletionStatus::LocalProtectionError;
    }

    let mut offset = 0;
    for sge in sg_list {
        let n = (sge.length as usize).min(msg.len() - offset);
        if n == 0 {
            continue;
        }
        // SAFETY: the receive buffer is pinned and at least `sge.length` bytes long;
        // its owner does not touch it until the receive completion is polled.
        unsafe {
            std::ptr::copy_nonoverlapping(msg.as_ptr().add(offset), sge.addr as *mut u8, n);
        }
        offset += n;
    }
    CompletionStatus::Success
}

/// A software RDMA fabric.
#[derive(Clone)]
pub struct SimFabric {
    state: Arc<Mutex<FabricState>>,
    memory: Arc<SimMemory>,
}

impl SimFabric {
    /// Creates an empty fabric.
    pub fn new(config: SimFabricConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(FabricState::new(config))),
            memory: Arc::new(SimMemory::default()),
        }
    }

    /// Attaches a host with address `node` and returns its device.
    pub fn device(&self, node: IpAddr) -> SimDevice {
        self.state.lock().nodes.insert(node);
        SimDevice {
            node,
            state: Arc::clone(&self.state),
            memory: Arc::clone(&self.memory),
        }
    }

    /// Pin bookkeeping shared by every device.
    pub fn memory(&self) -> Arc<SimMemory> {
        Arc::clone(&self.memory)
    }

    /// Address resolution towards `ip` fails from now on.
    pub fn mark_unreachable(&self, ip: IpAddr) {
        self.state.lock().unreachable.insert(ip);
    }

    /// Route resolution towards `ip` fails from now on.
    pub fn mark_unroutable(&self, ip: IpAddr) {
        self.state.lock().unroutable.insert(ip);
    }

    /// The next executed send completes with `status` instead of transferring.
    pub fn inject_completion_error(&self, status: CompletionStatus) {
        self.state.lock().faults.push_back(status);
    }

    /// Delivers `payload` verbatim to the connected id whose local address is `to`.
    pub fn send_raw(&self, to: SocketAddr, payload: &[u8]) -> Result<()> {
        let mut st = self.state.lock();
        let targets: Vec<CmId> = st
            .ids
            .iter()
            .filter(|(_, c)| c.phase == IdPhase::Connected && c.local == Some(to))
            .map(|(id, _)| *id)
            .collect();
        match targets.as_slice() {
            [id] => {
                st.id_mut(*id)?.inbox.push_back(payload.to_vec());
                Ok(())
            }
            [] => Err(QueueError::invalid_argument(format!(
                "no connection at {}",
                to
            ))),
            _ => Err(QueueError::invalid_argument(format!(
                "several connections at {}",
                to
            ))),
        }
    }

    /// Queues a connection event for `id` on whatever channel it is attached to.
    pub fn inject_cm_event(&self, id: CmId, kind: CmEventKind) -> Result<()> {
        let mut st = self.state.lock();
        st.id(id)?;
        st.post_event(id, kind);
        Ok(())
    }

    /// Snapshot of the fabric counters.
    pub fn stats(&self) -> FabricStats {
        self.state.lock().stats.clone()
    }

    /// Connection ids not yet destroyed.
    pub fn live_ids(&self) -> usize {
        self.state.lock().ids.len()
    }

    /// Event channels not yet destroyed.
    pub fn live_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Protection domains not yet released.
    pub fn live_domains(&self) -> usize {
        self.state.lock().domains.len()
    }
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new(SimFabricConfig::default())
    }
}

/// One simulated host's view of the fabric.
pub struct SimDevice {
    node: IpAddr,
    state: Arc<Mutex<FabricState>>,
    memory: Arc<SimMemory>,
}

impl SimDevice {
    /// Address of the host this device belongs to.
    pub fn node(&self) -> IpAddr {
        self.node
    }

    /// Pin bookkeeping of the fabric.
    pub fn memory(&self) -> Arc<SimMemory> {
        Arc::clone(&self.memory)
    }
}

fn check_params(params: &ConnParams) -> Result<()> {
    if params.rnr_retry_count > 7 {
        return Err(QueueError::invalid_argument(format!(
            "rnr_retry_count {} exceeds 7",
            params.rnr_retry_count
        )));
    }
    Ok(())
}

impl RdmaDevice for SimDevice {
    fn create_event_channel(&mut self) -> Result<ChannelId> {
        let channel = ChannelId(next_handle());
        self.state.lock().channels.insert(channel, SimChannel::default());
        Ok(channel)
    }

    fn destroy_event_channel(&mut self, channel: ChannelId) -> Result<()> {
        self.state
            .lock()
            .channels
            .remove(&channel)
            .map(|_| ())
            .ok_or_else(|| QueueError::invalid_argument(format!("unknown event channel {}", channel.0)))
    }

    fn set_nonblocking(&mut self, channel: ChannelId) -> Result<()> {
        let mut st = self.state.lock();
        let ch = st
            .channels
            .get_mut(&channel)
            .ok_or_else(|| QueueError::invalid_argument(format!("unknown event channel {}", channel.0)))?;
        ch.nonblocking = true;
        Ok(())
    }

    fn is_nonblocking(&self, channel: ChannelId) -> bool {
        self.state
            .lock()
            .channels
            .get(&channel)
            .map_or(false, |ch| ch.nonblocking)
    }

    fn create_id(&mut self, channel: ChannelId, port_space: PortSpace) -> Result<CmId> {
        let mut st = self.state.lock();
        if !st.channels.contains_key(&channel) {
            return Err(QueueError::invalid_argument(format!(
                "unknown event channel {}",
                channel.0
            )));
        }
        let id = CmId(next_handle());
        st.ids.insert(id, SimCmId::new(self.node, channel, port_space));
        Ok(id)
    }

    fn destroy_id(&mut self, id: CmId) -> Result<()> {
        self.state.lock().teardown_id(id)
    }

    fn migrate_id(&mut self, id: CmId, channel: ChannelId) -> Result<()> {
        let mut st = self.state.lock();
        if !st.channels.contains_key(&channel) {
            return Err(QueueError::invalid_argument(format!(
                "unknown event channel {}",
                channel.0
            )));
        }
        st.id_mut(id)?.channel = channel;
        Ok(())
    }

    fn bind_addr(&mut self, id: CmId, addr: SocketAddr) -> Result<()> {
        let mut st = self.state.lock();
        let (phase, node) = {
            let c = st.id(id)?;
            (c.phase, c.node)
        };
        if phase != IdPhase::Idle {
            return Err(QueueError::invalid_state(format!("{} is already bound", id)));
        }
        if !addr.ip().is_unspecified() && addr.ip() != node {
            return Err(QueueError::AddressNotAvailable {
                addr: addr.to_string(),
            });
        }

        let port = if addr.port() == 0 {
            st.ephemeral_port()
        } else {
            addr.port()
        };
        let in_use = st.ids.iter().any(|(other, c)| {
            *other != id
                && c.node == node
                && matches!(c.phase, IdPhase::Bound | IdPhase::Listening)
                && c.local.map_or(false, |l| l.port() == port)
        });
        if in_use {
            return Err(QueueError::AddressInUse {
                addr: SocketAddr::new(addr.ip(), port).to_string(),
            });
        }

        let conn = st.id_mut(id)?;
        conn.local = Some(SocketAddr::new(addr.ip(), port));
        conn.phase = IdPhase::Bound;
        Ok(())
    }

    fn listen(&mut self, id: CmId, backlog: u32) -> Result<()> {
        let mut st = self.state.lock();
        let conn = st.id_mut(id)?;
        if conn.port_space != PortSpace::Tcp {
            return Err(QueueError::not_supported("listening outside the TCP port space"));
        }
        if conn.phase != IdPhase::Bound {
            return Err(QueueError::invalid_state(format!("listen on unbound {}", id)));
        }
        conn.backlog = backlog.max(1);
        conn.phase = IdPhase::Listening;
        debug!(id = %id, local = ?conn.local, "simulated listener");
        Ok(())
    }

    fn resolve_addr(&mut self, id: CmId, dst: SocketAddr, _timeout_ms: u32) -> Result<()> {
        let mut st = self.state.lock();
        let (phase, node, bound) = {
            let c = st.id(id)?;
            (c.phase, c.node, c.local)
        };
        if !matches!(phase, IdPhase::Idle | IdPhase::Bound) {
            return Err(QueueError::invalid_state(format!(
                "resolve on {} while {:?}",
                id, phase
            )));
        }
        if st.unreachable.contains(&dst.ip()) || !st.nodes.contains(&dst.ip()) {
            st.post_event(id, CmEventKind::AddrError);
            return Ok(());
        }

        let local = match bound {
            Some(local) => local,
            None => SocketAddr::new(node, st.ephemeral_port()),
        };
        let conn = st.id_mut(id)?;
        conn.local = Some(local);
        conn.remote = Some(dst);
        conn.phase = IdPhase::AddrResolved;
        st.post_event(id, CmEventKind::AddrResolved);
        Ok(())
    }

    fn resolve_route(&mut self, id: CmId, _timeout_ms: u32) -> Result<()> {
        let mut st = self.state.lock();
        let (phase, remote) = {
            let c = st.id(id)?;
            (c.phase, c.remote)
        };
        let Some(remote) = remote.filter(|_| phase == IdPhase::AddrResolved) else {
            return Err(QueueError::invalid_state(format!(
                "route resolution on {} before address resolution",
                id
            )));
        };
        if st.unroutable.contains(&remote.ip()) {
            st.post_event(id, CmEventKind::RouteError);
            return Ok(());
        }
        st.id_mut(id)?.phase = IdPhase::RouteResolved;
        st.post_event(id, CmEventKind::RouteResolved);
        Ok(())
    }

    fn connect(&mut self, id: CmId, params: &ConnParams) -> Result<()> {
        check_params(params)?;
        let mut st = self.state.lock();
        let (dst, src) = {
            let c = st.id(id)?;
            if c.phase != IdPhase::RouteResolved {
                return Err(QueueError::invalid_state(format!(
                    "connect on {} before route resolution",
                    id
                )));
            }
            if c.qp.is_none() {
                return Err(QueueError::invalid_state(format!(
                    "connect on {} without a queue pair",
                    id
                )));
            }
            match c.remote {
                Some(dst) => (dst, c.local),
                None => {
                    return Err(QueueError::invalid_state(format!("{} has no destination", id)))
                }
            }
        };

        let Some(listener) = st
            .find_listener(dst)
            .filter(|l| st.has_backlog_room(*l))
        else {
            st.stats.connections_rejected += 1;
            debug!(id = %id, %dst, "simulated connect rejected");
            st.post_event(id, CmEventKind::Rejected);
            return Ok(());
        };

        let listener_channel = st.id(listener)?.channel;
        let server = CmId(next_handle());
        let mut incoming = SimCmId::new(dst.ip(), listener_channel, PortSpace::Tcp);
        incoming.phase = IdPhase::Requested;
        incoming.local = Some(dst);
        incoming.remote = src;
        incoming.peer = Some(id);
        incoming.listener = Some(listener);
        st.ids.insert(server, incoming);

        let client = st.id_mut(id)?;
        client.peer = Some(server);
        client.phase = IdPhase::Connected;
        if let Some(qp) = client.qp.as_mut() {
            qp.bring_up()?;
        }

        st.post_event(server, CmEventKind::ConnectRequest);
        st.post_event(id, CmEventKind::Established);
        st.stats.connections_established += 1;
        debug!(client = %id, server = %server, %dst, "simulated connect");
        Ok(())
    }

    fn accept(&mut self, id: CmId, params: &ConnParams) -> Result<()> {
        check_params(params)?;
        let mut st = self.state.lock();
        let conn = st.id_mut(id)?;
        if conn.phase != IdPhase::Requested {
            return Err(QueueError::invalid_state(format!(
                "accept on {} while {:?}",
                id, conn.phase
            )));
        }
        if conn.peer.is_none() {
            return Err(QueueError::ConnectionAborted);
        }
        let qp = conn
            .qp
            .as_mut()
            .ok_or_else(|| QueueError::invalid_state(format!("accept on {} without a queue pair", id)))?;
        qp.bring_up()?;
        conn.phase = IdPhase::Connected;
        st.post_event(id, CmEventKind::Established);
        Ok(())
    }

    fn get_cm_event(&mut self, channel: ChannelId) -> Result<CmEvent> {
        let mut st = self.state.lock();
        let ch = st
            .channels
            .get_mut(&channel)
            .ok_or_else(|| QueueError::invalid_argument(format!("unknown event channel {}", channel.0)))?;
        match ch.events.pop_front() {
            Some(event) => Ok(event),
            None if ch.nonblocking => Err(QueueError::WouldBlock),
            // A blocking read would never return.
            None => Err(QueueError::TimedOut { timeout_ms: 0 }),
        }
    }

    fn ack_cm_event(&mut self, _event: &CmEvent) -> Result<()> {
        Ok(())
    }

    fn local_addr(&self, id: CmId) -> Option<SocketAddr> {
        self.state.lock().ids.get(&id).and_then(|c| c.local)
    }

    fn peer_addr(&self, id: CmId) -> Option<SocketAddr> {
        self.state.lock().ids.get(&id).and_then(|c| c.remote)
    }

    fn alloc_pd(&mut self, id: CmId) -> Result<DomainHandle> {
        let mut st = self.state.lock();
        let node = st.id(id)?.node;
        let pd = DomainHandle(next_handle());
        st.domains.insert(pd, node);
        st.stats.domains_allocated += 1;
        Ok(pd)
    }

    fn dealloc_pd(&mut self, pd: DomainHandle) -> Result<()> {
        let mut st = self.state.lock();
        if st.domains.remove(&pd).is_none() {
            return Err(QueueError::invalid_argument(format!("unknown domain {}", pd.0)));
        }
        st.stats.domains_released += 1;
        Ok(())
    }

    fn create_qp(&mut self, id: CmId, pd: DomainHandle, attr: &QpInitAttr) -> Result<()> {
        let mut st = self.state.lock();
        let depth = st.config.cq_depth;
        let pd_node = *st
            .domains
            .get(&pd)
            .ok_or_else(|| QueueError::invalid_argument(format!("unknown domain {}", pd.0)))?;
        let conn = st.id_mut(id)?;
        if pd_node != conn.node {
            return Err(QueueError::invalid_argument(format!(
                "domain {} lives on {}, not {}",
                pd.0, pd_node, conn.node
            )));
        }
        if conn.qp.is_some() {
            return Err(QueueError::invalid_state(format!("{} already has a queue pair", id)));
        }
        let mut qp = SimQueuePair::new(pd, *attr, depth);
        qp.modify_to_init();
        conn.qp = Some(qp);
        Ok(())
    }

    fn destroy_qp(&mut self, id: CmId) -> Result<()> {
        self.state.lock().id_mut(id)?.qp = None;
        Ok(())
    }

    fn post_send(&mut self, id: CmId, wr: &SendWorkRequest) -> Result<()> {
        let mut st = self.state.lock();
        let qp = st
            .id_mut(id)?
            .qp
            .as_mut()
            .ok_or_else(|| QueueError::invalid_state(format!("{} has no queue pair", id)))?;
        if qp.state != QpState::ReadyToSend {
            return Err(QueueError::invalid_state(format!(
                "post_send on queue pair {} in {:?}",
                qp.qp_num, qp.state
            )));
        }
        if wr.opcode != WrOpcode::Send {
            return Err(QueueError::not_supported(format!("{:?} work requests", wr.opcode)));
        }
        if wr.sg_list.len() > qp.attr.max_send_sge as usize {
            return Err(QueueError::invalid_argument(format!(
                "{} gather entries exceed max_send_sge {}",
                wr.sg_list.len(),
                qp.attr.max_send_sge
            )));
        }
        if qp.send_queue.len() >= qp.attr.max_send_wr as usize {
            return Err(QueueError::exhausted("send queue full"));
        }
        qp.send_queue.push_back(wr.clone());
        Ok(())
    }

    fn post_recv(&mut self, id: CmId, wr: &RecvWorkRequest) -> Result<()> {
        let mut st = self.state.lock();
        let qp = st
            .id_mut(id)?
            .qp
            .as_mut()
            .ok_or_else(|| QueueError::invalid_state(format!("{} has no queue pair", id)))?;
        if matches!(qp.state, QpState::Reset | QpState::Error) {
            return Err(QueueError::invalid_state(format!(
                "post_recv on queue pair {} in {:?}",
                qp.qp_num, qp.state
            )));
        }
        if wr.sg_list.len() > qp.attr.max_recv_sge as usize {
            return Err(QueueError::invalid_argument("too many scatter entries"));
        }
        if qp.recv_queue.len() >= qp.attr.max_recv_wr as usize {
            return Err(QueueError::exhausted("receive queue full"));
        }
        qp.recv_queue.push_back(wr.clone());
        Ok(())
    }

    fn poll_cq(&mut self, id: CmId, cq: CqKind, max_entries: usize) -> Result<Vec<WorkCompletion>> {
        let mut st = self.state.lock();
        st.progress(&self.memory);
        let qp = st
            .id_mut(id)?
            .qp
            .as_mut()
            .ok_or_else(|| QueueError::invalid_state(format!("{} has no queue pair", id)))?;
        Ok(match cq {
            CqKind::Send => qp.send_cq.poll(max_entries),
            CqKind::Recv => qp.recv_cq.poll(max_entries),
        })
    }
}
