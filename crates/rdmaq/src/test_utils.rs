//! Fixtures for unit tests that need live queues on the simulated fabric.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::config::QueueConfig;
use crate::context::RdmaContext;
use crate::queue::RdmaQueue;
use crate::rdma_sim::{SimDevice, SimFabric};
use crate::types::{OperationResult, QDesc, QToken, SockType};
use crate::verbs::CmId;

pub(crate) type SimQueue = RdmaQueue<SimDevice>;

/// A listener, a connected client and the accepted server side.
pub(crate) struct SimPair {
    pub(crate) fabric: SimFabric,
    // keeps the listening side open
    #[allow(dead_code)]
    pub(crate) listener: SimQueue,
    pub(crate) client: SimQueue,
    pub(crate) server: SimQueue,
}

pub(crate) fn context(fabric: &SimFabric, last: u8) -> Arc<RdmaContext<SimDevice>> {
    let device = fabric.device(IpAddr::V4(Ipv4Addr::new(10, 2, 0, last)));
    RdmaContext::new(device, fabric.memory(), QueueConfig::default()).unwrap()
}

pub(crate) fn connected_pair() -> SimPair {
    let fabric = SimFabric::default();
    let server_ctx = context(&fabric, 1);
    let client_ctx = context(&fabric, 2);
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 2, 0, 1)), 7100);

    let listener = RdmaQueue::new(server_ctx, QDesc(1));
    listener.socket(SockType::Stream).unwrap();
    listener.bind(addr).unwrap();
    listener.listen(4).unwrap();

    let client = RdmaQueue::new(client_ctx, QDesc(2));
    client.socket(SockType::Stream).unwrap();
    client.connect(addr).unwrap();

    let server = listener.accept(QToken(1), QDesc(3)).unwrap();
    match listener.wait(QToken(1), Duration::from_secs(2)).unwrap() {
        OperationResult::Accept { qd } => assert_eq!(qd, QDesc(3)),
        other => panic!("expected accept, got {:?}", other),
    }

    SimPair {
        fabric,
        listener,
        client,
        server,
    }
}

/// Connection id currently held by `queue`.
pub(crate) fn cm_id(queue: &SimQueue) -> CmId {
    queue.lock().handle.map(|h| h.id).unwrap()
}
