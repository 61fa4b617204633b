//! Common test utilities and fixtures for integration tests.
#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rdmaq::{
    OperationResult, QDesc, QToken, QueueConfig, RdmaContext, RdmaQueue, SimDevice, SimFabric,
    SockType,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Upper bound for any wait in the tests. The fabric is in-process, so this is never reached
/// unless something is stuck.
pub const TIMEOUT: Duration = Duration::from_secs(2);

/// Server-side listen port used by the fixtures.
pub const PORT: u16 = 7000;

pub type Queue = RdmaQueue<SimDevice>;

/// Installs a subscriber once; `RUST_LOG=rdmaq=trace` shows the queue logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

pub fn host(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
}

/// Two simulated hosts on one fabric, each with its own context.
pub struct TestNet {
    pub fabric: SimFabric,
    pub server_ctx: Arc<RdmaContext<SimDevice>>,
    pub client_ctx: Arc<RdmaContext<SimDevice>>,
}

impl TestNet {
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        init_tracing();
        let fabric = SimFabric::default();
        let server_ctx =
            RdmaContext::new(fabric.device(host(1)), fabric.memory(), config.clone()).unwrap();
        let client_ctx = RdmaContext::new(fabric.device(host(2)), fabric.memory(), config).unwrap();
        Self {
            fabric,
            server_ctx,
            client_ctx,
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(host(1), PORT)
    }

    /// A queue listening on the server host.
    pub fn listener(&self, qd: u32) -> Queue {
        let queue = RdmaQueue::new(Arc::clone(&self.server_ctx), QDesc(qd));
        queue.socket(SockType::Stream).unwrap();
        queue.bind(self.server_addr()).unwrap();
        queue.listen(8).unwrap();
        queue
    }

    /// A queue on the client host connected to the listener.
    pub fn client(&self, qd: u32) -> Queue {
        let queue = RdmaQueue::new(Arc::clone(&self.client_ctx), QDesc(qd));
        queue.socket(SockType::Stream).unwrap();
        queue.connect(self.server_addr()).unwrap();
        queue
    }

    /// Connects a client and accepts it. Returns `(listener, client, server)`.
    pub fn connected_pair(&self) -> (Queue, Queue, Queue) {
        let listener = self.listener(1);
        let client = self.client(2);
        let server = accept(&listener, QToken(1000), 3);
        (listener, client, server)
    }
}

/// Accepts one connection onto a new queue with descriptor `qd`.
pub fn accept(listener: &Queue, token: QToken, qd: u32) -> Queue {
    let server = listener.accept(token, QDesc(qd)).unwrap();
    match listener.wait(token, TIMEOUT).unwrap() {
        OperationResult::Accept { qd: accepted } => assert_eq!(accepted, QDesc(qd)),
        other => panic!("expected accept, got {:?}", other),
    }
    server
}

/// Waits for a push and returns its byte count.
pub fn wait_push(queue: &Queue, token: QToken) -> usize {
    match queue.wait(token, TIMEOUT).unwrap() {
        OperationResult::Push { bytes } => bytes,
        other => panic!("expected push, got {:?}", other),
    }
}

/// Pops one message and returns its segments.
pub fn pop_segments(queue: &Queue, token: QToken) -> Vec<Vec<u8>> {
    queue.pop(token).unwrap();
    match queue.wait(token, TIMEOUT).unwrap() {
        OperationResult::Pop { sga, .. } => sga.segments.iter().map(|s| s.to_vec()).collect(),
        other => panic!("expected pop, got {:?}", other),
    }
}
