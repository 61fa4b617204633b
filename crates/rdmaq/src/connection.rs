//! Connection state machine: socket creation, active and passive open, teardown.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{QueueError, Result};
use crate::queue::QueueInner;
use crate::task::TaskKind;
use crate::types::{OperationResult, QToken, SockType};
use crate::verbs::{ChannelId, CmEventKind, CmId, PortSpace, RdmaDevice};

/// Lifecycle of a queue's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnState {
    /// No connection id yet.
    Unattached,
    /// Connection id and event channel allocated.
    Created,
    /// Bound to a local address.
    Bound,
    /// Accepting connect requests.
    Listening,
    /// Waiting for address resolution.
    ResolvingAddress,
    /// Waiting for route resolution.
    ResolvingRoute,
    /// Connect handshake in flight.
    Connecting,
    /// Connected; push and pop are allowed.
    Established,
    /// Torn down. Every further operation fails.
    Closed,
}

/// Connection id plus the event channel its events arrive on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CmHandle {
    pub(crate) id: CmId,
    pub(crate) channel: ChannelId,
}

impl<D: RdmaDevice> QueueInner<D> {
    pub(crate) fn open_socket(&mut self, kind: SockType) -> Result<()> {
        if self.state != ConnState::Unattached {
            return Err(QueueError::invalid_state(format!(
                "{} already has a connection handle",
                self.qd
            )));
        }
        let port_space = match kind {
            SockType::Stream => PortSpace::Tcp,
            SockType::Datagram => {
                return Err(QueueError::not_supported("datagram queues"));
            }
        };

        let mut dev = self.ctx.device();
        let channel = dev.create_event_channel()?;
        let id = match dev.create_id(channel, port_space) {
            Ok(id) => id,
            Err(e) => {
                if let Err(ce) = dev.destroy_event_channel(channel) {
                    warn!(error = %ce, "failed to release event channel");
                }
                return Err(e);
            }
        };
        drop(dev);

        self.handle = Some(CmHandle { id, channel });
        self.state = ConnState::Created;
        debug!(qd = %self.qd, id = %id, "created connection id");
        Ok(())
    }

    pub(crate) fn bind_local(&mut self, addr: SocketAddr) -> Result<()> {
        let handle = self.require_handle()?;
        if self.state != ConnState::Created {
            return Err(QueueError::invalid_state(format!(
                "bind on {} while {:?}",
                self.qd, self.state
            )));
        }
        self.ctx.device().bind_addr(handle.id, addr)?;
        self.state = ConnState::Bound;
        debug!(qd = %self.qd, %addr, "bound");
        Ok(())
    }

    pub(crate) fn start_listening(&mut self, backlog: u32) -> Result<()> {
        let handle = self.require_handle()?;
        match self.state {
            ConnState::Created | ConnState::Bound => {}
            ConnState::Listening => {
                return Err(QueueError::invalid_state(format!(
                    "{} is already listening",
                    self.qd
                )))
            }
            state => {
                return Err(QueueError::invalid_state(format!(
                    "listen on {} while {:?}",
                    self.qd, state
                )))
            }
        }

        let mut dev = self.ctx.device();
        dev.set_nonblocking(handle.channel)?;
        dev.listen(handle.id, backlog)?;
        drop(dev);

        self.state = ConnState::Listening;
        info!(qd = %self.qd, backlog, "listening");
        Ok(())
    }

    pub(crate) fn connect_active(&mut self, addr: SocketAddr) -> Result<()> {
        let handle = self.require_handle()?;
        let prev = self.state;
        if !matches!(prev, ConnState::Created | ConnState::Bound) {
            return Err(QueueError::invalid_state(format!(
                "connect on {} while {:?}",
                self.qd, prev
            )));
        }

        match self.handshake(handle, addr) {
            Ok(()) => {
                self.state = ConnState::Established;
                info!(qd = %self.qd, %addr, "connected");
                Ok(())
            }
            Err(e) => {
                debug!(qd = %self.qd, %addr, error = %e, "connect failed");
                if let Err(qe) = self.ctx.device().destroy_qp(handle.id) {
                    warn!(qd = %self.qd, error = %qe, "failed to destroy queue pair");
                }
                self.posted_recv.clear();
                self.recv_backlog.clear();
                self.state = prev;
                Err(e)
            }
        }
    }

    fn handshake(&mut self, handle: CmHandle, addr: SocketAddr) -> Result<()> {
        let timeout_ms = self.ctx.config().resolve_timeout_ms;
        let target = addr.to_string();

        self.state = ConnState::ResolvingAddress;
        self.ctx.device().resolve_addr(handle.id, addr, timeout_ms)?;
        self.await_event(handle, CmEventKind::AddrResolved, |_| {
            QueueError::AddressNotAvailable {
                addr: target.clone(),
            }
        })?;

        self.state = ConnState::ResolvingRoute;
        self.ctx.device().resolve_route(handle.id, timeout_ms)?;
        self.await_event(handle, CmEventKind::RouteResolved, |_| {
            QueueError::PermissionDenied {
                reason: format!("no route to {}", target),
            }
        })?;

        self.setup_qp(handle.id)?;
        self.setup_recv_queue(handle.id)?;

        self.state = ConnState::Connecting;
        let params = self.ctx.config().connect_params();
        self.ctx.device().connect(handle.id, &params)?;
        self.await_event(handle, CmEventKind::Established, |kind| match kind {
            None
            | Some(CmEventKind::Rejected)
            | Some(CmEventKind::Unreachable)
            | Some(CmEventKind::ConnectError) => QueueError::ConnectionRefused {
                addr: target.clone(),
            },
            Some(other) => {
                QueueError::invalid_state(format!("unexpected {:?} while connecting", other))
            }
        })?;

        self.ctx.device().set_nonblocking(handle.channel)?;
        Ok(())
    }

    /// Reads one event from a blocking channel and checks it is `expected`.
    ///
    /// `mismatch` receives the event that arrived instead, or `None` if the wait expired.
    fn await_event<F>(&mut self, handle: CmHandle, expected: CmEventKind, mismatch: F) -> Result<()>
    where
        F: FnOnce(Option<CmEventKind>) -> QueueError,
    {
        let event = {
            let mut dev = self.ctx.device();
            let event = match dev.get_cm_event(handle.channel) {
                Ok(event) => event,
                Err(QueueError::TimedOut { .. }) => return Err(mismatch(None)),
                Err(e) => return Err(e),
            };
            dev.ack_cm_event(&event)?;
            event
        };
        self.stats.events_handled += 1;

        if event.kind == expected && event.id == handle.id {
            debug!(qd = %self.qd, event = ?event.kind, "connection event");
            Ok(())
        } else {
            debug!(qd = %self.qd, expected = ?expected, got = ?event.kind, "unexpected connection event");
            Err(mismatch(Some(event.kind)))
        }
    }

    fn setup_qp(&mut self, id: CmId) -> Result<()> {
        let pd = self.ctx.domain(id)?;
        let attr = self.ctx.config().qp_init_attr();
        self.ctx.device().create_qp(id, pd, &attr)
    }

    /// Handles at most one pending connection-management event.
    ///
    /// Returns `WouldBlock` if nothing is pending. A disconnect closes the queue and is
    /// reported as `ConnectionAborted`.
    pub(crate) fn service_event_queue(&mut self) -> Result<()> {
        let handle = self.require_handle()?;
        let event = {
            let mut dev = self.ctx.device();
            if !dev.is_nonblocking(handle.channel) {
                return Err(QueueError::invalid_state(format!(
                    "event channel of {} is blocking",
                    self.qd
                )));
            }
            let event = dev.get_cm_event(handle.channel)?;
            dev.ack_cm_event(&event)?;
            event
        };
        self.stats.events_handled += 1;

        match event.kind {
            CmEventKind::ConnectRequest => {
                if self.state != ConnState::Listening {
                    if let Err(e) = self.ctx.device().destroy_id(event.id) {
                        warn!(id = %event.id, error = %e, "failed to reject connect request");
                    }
                    return Err(QueueError::invalid_state(format!(
                        "connect request on non-listening {}",
                        self.qd
                    )));
                }
                debug!(qd = %self.qd, id = %event.id, "connect request queued");
                self.accept_backlog.push_back(event.id);
                Ok(())
            }
            CmEventKind::Established => {
                debug!(qd = %self.qd, "connection established");
                Ok(())
            }
            CmEventKind::Disconnected => {
                info!(qd = %self.qd, "peer disconnected");
                if let Err(e) = self.close_connection() {
                    warn!(qd = %self.qd, error = %e, "teardown after disconnect was incomplete");
                }
                Err(QueueError::ConnectionAborted)
            }
            other => {
                warn!(qd = %self.qd, event = ?other, "unhandled connection event");
                Err(QueueError::not_supported(format!(
                    "connection event {:?}",
                    other
                )))
            }
        }
    }

    /// Hands the oldest queued connect request to the queue waiting on `token`.
    pub(crate) fn service_accept_queue(&mut self, token: QToken) -> Result<()> {
        let new_queue = match self.tasks.get(token)?.kind() {
            TaskKind::Accept { new_queue } => new_queue.clone(),
            _ => {
                return Err(QueueError::invalid_argument(format!(
                    "{} is not an accept",
                    token
                )))
            }
        };
        let Some(id) = self.accept_backlog.pop_front() else {
            return Ok(());
        };

        let attached = {
            let mut inner = new_queue.lock();
            inner.attach_accepted(id).map(|()| inner.qd)
        };
        let task = self.tasks.get_mut(token)?;
        match attached {
            Ok(qd) => {
                task.complete(OperationResult::Accept { qd });
                self.stats.accepts_completed += 1;
                info!(qd = %self.qd, new_qd = %qd, "accepted connection");
            }
            Err(e) => {
                warn!(qd = %self.qd, id = %id, error = %e, "accept failed");
                task.fail(e);
            }
        }
        Ok(())
    }

    /// Takes over an incoming connection id and completes the passive handshake.
    pub(crate) fn attach_accepted(&mut self, id: CmId) -> Result<()> {
        if self.state != ConnState::Unattached {
            return Err(QueueError::invalid_state(format!(
                "accept onto {} while {:?}",
                self.qd, self.state
            )));
        }

        let migrated = {
            let mut dev = self.ctx.device();
            let channel = match dev.create_event_channel() {
                Ok(channel) => channel,
                Err(e) => {
                    if let Err(de) = dev.destroy_id(id) {
                        warn!(id = %id, error = %de, "failed to release connection id");
                    }
                    return Err(e);
                }
            };
            self.handle = Some(CmHandle { id, channel });
            self.state = ConnState::Created;
            dev.migrate_id(id, channel)
                .and_then(|()| dev.set_nonblocking(channel))
        };

        let result = migrated.and_then(|()| {
            self.setup_qp(id)?;
            self.setup_recv_queue(id)?;
            let params = self.ctx.config().accept_params();
            self.ctx.device().accept(id, &params)
        });
        if let Err(e) = result {
            if let Err(ce) = self.close_connection() {
                warn!(qd = %self.qd, error = %ce, "failed to release half-accepted queue");
            }
            return Err(e);
        }

        self.state = ConnState::Established;
        Ok(())
    }

    /// Releases the queue pair, any unaccepted connection ids, the connection id and
    /// the event channel. The registration domain belongs to the context and survives.
    pub(crate) fn close_connection(&mut self) -> Result<()> {
        if self.state == ConnState::Closed {
            return Err(QueueError::invalid_state(format!(
                "{} is already closed",
                self.qd
            )));
        }

        let mut first_err = None;
        if let Some(handle) = self.handle.take() {
            let mut dev = self.ctx.device();
            let mut note = |r: Result<()>| {
                if let Err(e) = r {
                    first_err.get_or_insert(e);
                }
            };
            note(dev.destroy_qp(handle.id));
            for id in self.accept_backlog.drain(..) {
                note(dev.destroy_id(id));
            }
            note(dev.destroy_id(handle.id));
            note(dev.destroy_event_channel(handle.channel));
        }

        // The queue pair is gone, so nothing can still read or write these buffers.
        self.posted_recv.clear();
        self.recv_backlog.clear();
        self.tasks.clear();
        self.state = ConnState::Closed;
        debug!(qd = %self.qd, "closed");

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RdmaQueue;
    use crate::rdma_sim::SimFabric;
    use crate::test_utils::{cm_id, connected_pair, context};
    use crate::types::{PollResult, QDesc};

    #[test]
    fn test_unhandled_event_not_supported() {
        let pair = connected_pair();
        pair.fabric
            .inject_cm_event(cm_id(&pair.client), CmEventKind::DeviceRemoval)
            .unwrap();

        pair.client.pop(QToken(1)).unwrap();
        let err = pair.client.poll(QToken(1)).unwrap_err();
        assert!(matches!(err, QueueError::NotSupported { .. }));
        // the queue keeps working afterwards
        assert_eq!(pair.client.poll(QToken(1)).unwrap(), PollResult::NotReady);
    }

    #[test]
    fn test_event_read_on_blocking_channel() {
        let fabric = SimFabric::default();
        let queue = RdmaQueue::new(context(&fabric, 9), QDesc(1));
        queue.socket(SockType::Stream).unwrap();

        let err = queue.lock().service_event_queue().unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { .. }));
        assert_eq!(queue.state(), ConnState::Created);
    }

    #[test]
    fn test_event_read_without_handle() {
        let fabric = SimFabric::default();
        let queue = RdmaQueue::new(context(&fabric, 9), QDesc(1));
        let err = queue.lock().service_event_queue().unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument { .. }));
    }

    #[test]
    fn test_disconnect_reported_despite_teardown_error() {
        let pair = connected_pair();
        pair.client.close().unwrap();

        // the device already lost the server's id, so teardown cannot finish cleanly
        let id = cm_id(&pair.server);
        pair.server.lock().ctx.device().destroy_id(id).unwrap();

        let mut inner = pair.server.lock();
        assert_eq!(inner.service_event_queue(), Ok(()));
        assert_eq!(inner.service_event_queue(), Err(QueueError::ConnectionAborted));
        assert_eq!(inner.state, ConnState::Closed);
        assert!(inner.handle.is_none());
    }
}
