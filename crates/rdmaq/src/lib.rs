#![warn(missing_docs)]

//! rdmaq: token-based, non-blocking network queues over reliable connected RDMA queue pairs
//!
//! A caller creates queues on a shared [`RdmaContext`], issues push, pop and accept
//! operations tagged with its own [`QToken`]s, and drives everything forward by polling
//! those tokens. Payloads travel as framed scatter-gather arrays without being copied;
//! every buffer the hardware may touch stays registered and pinned until its completion
//! is observed.

pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod memory;
pub mod queue;
pub mod rdma_sim;
pub mod types;
pub mod verbs;
pub mod wire;

mod completion;
mod task;
#[cfg(test)]
mod test_utils;

pub use config::QueueConfig;
pub use connection::ConnState;
pub use context::RdmaContext;
pub use error::{QueueError, Result};
pub use memory::{MemoryRegistration, MemoryRegistry, PinSet};
pub use queue::{QueueStats, RdmaQueue};
pub use rdma_sim::{FabricStats, SimDevice, SimFabric, SimFabricConfig, SimMemory};
pub use types::{OperationResult, PollResult, QDesc, QToken, SgArray, SockType};
pub use verbs::{CmEvent, CmEventKind, CompletionStatus, RdmaDevice, WorkCompletion};
pub use wire::{decode_frame, OutgoingFrame, WireHeader, HEADER_MAGIC, HEADER_SIZE, SEGMENT_LEN_SIZE};
