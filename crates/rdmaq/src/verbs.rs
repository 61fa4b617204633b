//! Capability set consumed from the RDMA verbs and connection-manager libraries.
//!
//! The queue engine never talks to hardware directly. Everything it needs from the
//! transport (event channels, connection ids, protection domains, queue pairs, work
//! request posting and completion polling) goes through [`RdmaDevice`]. Implementations
//! translate their native failures into [`QueueError`](crate::error::QueueError);
//! an empty non-blocking event channel must be reported as `QueueError::WouldBlock`.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Handle to a connection-management event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

/// Handle to a connection-manager id (one endpoint of a connection, or a listener).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CmId(pub u64);

/// Handle to a protection domain (the registration domain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainHandle(pub u64);

impl fmt::Display for CmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cm#{}", self.0)
    }
}

/// Port space a connection id is created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortSpace {
    /// Reliable connected (stream) port space.
    Tcp,
    /// Unreliable datagram port space.
    Udp,
}

/// Connection-management event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmEventKind {
    /// Destination address resolved.
    AddrResolved,
    /// Destination address could not be resolved.
    AddrError,
    /// Route to the destination resolved.
    RouteResolved,
    /// Route to the destination could not be resolved.
    RouteError,
    /// A remote peer wants to connect to a listener.
    ConnectRequest,
    /// Connection establishment failed.
    ConnectError,
    /// Remote peer is unreachable.
    Unreachable,
    /// Remote peer rejected the connection.
    Rejected,
    /// Connection established.
    Established,
    /// Remote peer disconnected.
    Disconnected,
    /// The underlying device was removed.
    DeviceRemoval,
}

/// A connection-management event. For `ConnectRequest` the id is the new incoming one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmEvent {
    /// Connection id the event refers to.
    pub id: CmId,
    /// Event type.
    pub kind: CmEventKind,
}

/// Parameters for the connect and accept handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParams {
    /// Outstanding RDMA reads this side may initiate.
    pub initiator_depth: u8,
    /// Outstanding RDMA reads this side will serve.
    pub responder_resources: u8,
    /// Receiver-not-ready retry count (7 means infinite).
    pub rnr_retry_count: u8,
}

/// Queue pair transport type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpType {
    /// Reliable connected.
    ReliableConnected,
}

/// Queue pair creation attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInitAttr {
    /// Transport type.
    pub qp_type: QpType,
    /// Maximum outstanding send work requests.
    pub max_send_wr: u32,
    /// Maximum outstanding receive work requests.
    pub max_recv_wr: u32,
    /// Maximum scatter-gather entries per send work request.
    pub max_send_sge: u32,
    /// Maximum scatter-gather entries per receive work request.
    pub max_recv_sge: u32,
    /// Maximum inline data in bytes.
    pub max_inline_data: u32,
    /// Generate a completion for every send.
    pub sq_sig_all: bool,
}

/// Which completion queue of a queue pair to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqKind {
    /// Send completion queue.
    Send,
    /// Receive completion queue.
    Recv,
}

/// One scatter-gather element of a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    /// Start address of the region.
    pub addr: u64,
    /// Length in bytes.
    pub length: u32,
    /// Local key of the registration covering the region.
    pub lkey: u32,
}

/// Send-side work request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrOpcode {
    /// Two-sided send.
    Send,
    /// One-sided write.
    RdmaWrite,
    /// One-sided read.
    RdmaRead,
}

/// A send work request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendWorkRequest {
    /// Correlation id reported back in the completion.
    pub wr_id: u64,
    /// Operation.
    pub opcode: WrOpcode,
    /// Request a completion entry for this work request.
    pub signaled: bool,
    /// Gather list, read in order.
    pub sg_list: Vec<Sge>,
}

/// A receive work request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvWorkRequest {
    /// Correlation id reported back in the completion.
    pub wr_id: u64,
    /// Scatter list.
    pub sg_list: Vec<Sge>,
}

/// Completion opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcOpcode {
    /// A send finished.
    Send,
    /// A receive buffer was filled.
    Recv,
    /// A one-sided write finished.
    RdmaWrite,
    /// A one-sided read finished.
    RdmaRead,
    /// An atomic compare-and-swap finished.
    CompareSwap,
    /// An atomic fetch-and-add finished.
    FetchAdd,
}

/// Completion status reported by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    /// The work request finished successfully.
    Success,
    /// Received message larger than the posted buffer.
    LocalLengthError,
    /// Region not registered with the right key, or not resident.
    LocalProtectionError,
    /// Remote side failed the request.
    RemoteError,
    /// Transport retries exhausted.
    RetryExceeded,
    /// The queue pair was torn down with the request outstanding.
    Flushed,
}

/// One entry drained from a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCompletion {
    /// Correlation id from the work request.
    pub wr_id: u64,
    /// Hardware status.
    pub status: CompletionStatus,
    /// Completed operation.
    pub opcode: WcOpcode,
    /// Bytes transferred.
    pub byte_len: u32,
    /// Queue pair number.
    pub qp_num: u32,
}

/// Raw transport primitives the queue engine is built on.
pub trait RdmaDevice: Send + 'static {
    /// Creates a connection-management event channel (blocking until told otherwise).
    fn create_event_channel(&mut self) -> Result<ChannelId>;

    /// Destroys an event channel.
    fn destroy_event_channel(&mut self, channel: ChannelId) -> Result<()>;

    /// Switches an event channel to non-blocking reads.
    fn set_nonblocking(&mut self, channel: ChannelId) -> Result<()>;

    /// Returns whether reads on the channel are non-blocking.
    fn is_nonblocking(&self, channel: ChannelId) -> bool;

    /// Creates a connection id whose events are reported on `channel`.
    fn create_id(&mut self, channel: ChannelId, port_space: PortSpace) -> Result<CmId>;

    /// Destroys a connection id. A connected peer observes a disconnect.
    fn destroy_id(&mut self, id: CmId) -> Result<()>;

    /// Moves a connection id so its future events are reported on `channel`.
    fn migrate_id(&mut self, id: CmId, channel: ChannelId) -> Result<()>;

    /// Binds a connection id to a local address.
    fn bind_addr(&mut self, id: CmId, addr: SocketAddr) -> Result<()>;

    /// Starts listening for connect requests on a bound id.
    fn listen(&mut self, id: CmId, backlog: u32) -> Result<()>;

    /// Starts resolving a destination address. Completion is reported as an event.
    fn resolve_addr(&mut self, id: CmId, dst: SocketAddr, timeout_ms: u32) -> Result<()>;

    /// Starts resolving the route to the resolved address. Completion is reported as an event.
    fn resolve_route(&mut self, id: CmId, timeout_ms: u32) -> Result<()>;

    /// Initiates the connect handshake.
    fn connect(&mut self, id: CmId, params: &ConnParams) -> Result<()>;

    /// Accepts an incoming connect request.
    fn accept(&mut self, id: CmId, params: &ConnParams) -> Result<()>;

    /// Retrieves the next event from a channel.
    fn get_cm_event(&mut self, channel: ChannelId) -> Result<CmEvent>;

    /// Acknowledges a retrieved event.
    fn ack_cm_event(&mut self, event: &CmEvent) -> Result<()>;

    /// Local address of a connection id, once bound or resolved.
    fn local_addr(&self, id: CmId) -> Option<SocketAddr>;

    /// Remote address of a connected id.
    fn peer_addr(&self, id: CmId) -> Option<SocketAddr>;

    /// Allocates a protection domain on the device behind `id`.
    fn alloc_pd(&mut self, id: CmId) -> Result<DomainHandle>;

    /// Releases a protection domain.
    fn dealloc_pd(&mut self, pd: DomainHandle) -> Result<()>;

    /// Creates the queue pair (and its completion queues) for a connection id.
    fn create_qp(&mut self, id: CmId, pd: DomainHandle, attr: &QpInitAttr) -> Result<()>;

    /// Destroys the queue pair of a connection id. No-op if none exists.
    fn destroy_qp(&mut self, id: CmId) -> Result<()>;

    /// Posts a send work request.
    fn post_send(&mut self, id: CmId, wr: &SendWorkRequest) -> Result<()>;

    /// Posts a receive work request.
    fn post_recv(&mut self, id: CmId, wr: &RecvWorkRequest) -> Result<()>;

    /// Drains up to `max_entries` completions without blocking.
    fn poll_cq(&mut self, id: CmId, cq: CqKind, max_entries: usize) -> Result<Vec<WorkCompletion>>;
}
