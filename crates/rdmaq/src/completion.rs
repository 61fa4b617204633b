//! Completion dispatch: drains completion queues, recycles receive buffers and
//! resolves push and pop tasks.

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, trace, warn};

use crate::error::{QueueError, Result};
use crate::memory::PinSet;
use crate::queue::{PostedRecv, QueueInner};
use crate::task::SendSettlement;
use crate::types::{OperationResult, QToken};
use crate::verbs::{CmId, CompletionStatus, CqKind, RdmaDevice, RecvWorkRequest, Sge, WcOpcode, WorkCompletion};
use crate::wire::decode_frame;

impl<D: RdmaDevice> QueueInner<D> {
    /// Drains up to `quantity` completions from one completion queue.
    ///
    /// Every drained completion is dispatched, since the hardware will not report it
    /// again. The first failure is returned after the whole batch is handled.
    pub(crate) fn service_completion_queue(&mut self, id: CmId, cq: CqKind, quantity: usize) -> Result<()> {
        if quantity == 0 {
            return Err(QueueError::invalid_argument("completion batch must be at least 1"));
        }
        let completions = self.ctx.device().poll_cq(id, cq, quantity)?;
        let mut first_err = None;
        for wc in &completions {
            if let Err(e) = self.on_work_completed(id, wc) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn on_work_completed(&mut self, id: CmId, wc: &WorkCompletion) -> Result<()> {
        if wc.status != CompletionStatus::Success {
            error!(
                qd = %self.qd,
                wr_id = wc.wr_id,
                status = ?wc.status,
                opcode = ?wc.opcode,
                "work request failed"
            );
            let fault = QueueError::TransportFault {
                wr_id: wc.wr_id,
                status: wc.status,
            };
            match wc.opcode {
                WcOpcode::Send => {
                    self.tasks.settle_send(QToken(wc.wr_id), Err(fault.clone()));
                }
                // the hardware is done with the buffer either way
                WcOpcode::Recv => {
                    self.posted_recv.remove(&wc.wr_id);
                }
                _ => {}
            }
            return Err(fault);
        }

        match wc.opcode {
            WcOpcode::Recv => {
                let Some(posted) = self.posted_recv.remove(&wc.wr_id) else {
                    warn!(qd = %self.qd, wr_id = wc.wr_id, "receive completion for unknown buffer");
                    return Err(QueueError::invalid_state(format!(
                        "no receive buffer posted as 0x{:x}",
                        wc.wr_id
                    )));
                };
                let PostedRecv { pins, mut buf } = posted;
                drop(pins);
                buf.truncate(wc.byte_len as usize);
                trace!(qd = %self.qd, bytes = wc.byte_len, "received");
                self.recv_backlog.push_back(buf.freeze());
                self.stats.recv_completions += 1;
                self.new_recv_buf(id)
            }
            WcOpcode::Send => {
                let token = QToken(wc.wr_id);
                match self.tasks.settle_send(token, Ok(wc.byte_len as usize)) {
                    SendSettlement::Completed => self.stats.pushes_completed += 1,
                    SendSettlement::Reaped => {
                        self.stats.tombstones_reaped += 1;
                        debug!(qd = %self.qd, token = %token, "released dropped push");
                    }
                    SendSettlement::Pending => {}
                    SendSettlement::Unmatched => {
                        warn!(qd = %self.qd, token = %token, "send completion for unknown token");
                    }
                }
                Ok(())
            }
            other => {
                warn!(qd = %self.qd, opcode = ?other, "unexpected completion opcode");
                Err(QueueError::not_supported(format!("completion opcode {:?}", other)))
            }
        }
    }

    /// Posts the initial receive buffers of a new connection.
    pub(crate) fn setup_recv_queue(&mut self, id: CmId) -> Result<()> {
        for _ in 0..self.ctx.config().recv_buf_count {
            self.new_recv_buf(id)?;
        }
        Ok(())
    }

    /// Registers, pins and posts one fresh receive buffer.
    fn new_recv_buf(&mut self, id: CmId) -> Result<()> {
        let size = self.ctx.config().recv_buf_size;
        let mut buf = BytesMut::zeroed(size);
        let mr = self.ctx.register(id, &buf)?;
        let addr = buf.as_mut_ptr() as u64;
        let pins = PinSet::pin(self.ctx.registry().clone(), vec![addr]);

        let wr = RecvWorkRequest {
            wr_id: addr,
            sg_list: vec![Sge {
                addr,
                length: size as u32,
                lkey: mr.lkey,
            }],
        };
        self.ctx.device().post_recv(id, &wr)?;
        self.posted_recv.insert(addr, PostedRecv { pins, buf });
        self.stats.recv_buffers_posted += 1;
        Ok(())
    }

    /// Decodes a delivered buffer into the result of pop `token`.
    pub(crate) fn complete_recv(&mut self, token: QToken, buf: Bytes) -> Result<()> {
        let bytes = buf.len();
        let task = self.tasks.get_mut(token)?;
        match decode_frame(buf) {
            Ok(sga) => {
                task.complete(OperationResult::Pop { bytes, sga });
                self.stats.pops_completed += 1;
            }
            Err(e) => {
                warn!(qd = %self.qd, token = %token, error = %e, "dropping malformed message");
                task.fail(e);
                self.stats.protocol_violations += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{cm_id, connected_pair};

    fn completion(wr_id: u64, status: CompletionStatus, opcode: WcOpcode) -> WorkCompletion {
        WorkCompletion {
            wr_id,
            status,
            opcode,
            byte_len: 0,
            qp_num: 0,
        }
    }

    #[test]
    fn test_unknown_opcode_not_supported() {
        let pair = connected_pair();
        let id = cm_id(&pair.client);
        for opcode in [WcOpcode::RdmaWrite, WcOpcode::RdmaRead, WcOpcode::FetchAdd] {
            let wc = completion(77, CompletionStatus::Success, opcode);
            let err = pair.client.lock().on_work_completed(id, &wc).unwrap_err();
            assert!(matches!(err, QueueError::NotSupported { .. }));
        }
    }

    #[test]
    fn test_failed_receive_releases_buffer() {
        let pair = connected_pair();
        let memory = pair.fabric.memory();
        let id = cm_id(&pair.server);
        let mut inner = pair.server.lock();
        let wr_id = *inner.posted_recv.keys().next().unwrap();
        let pins = memory.total_pins();

        let wc = completion(wr_id, CompletionStatus::LocalLengthError, WcOpcode::Recv);
        let err = inner.on_work_completed(id, &wc).unwrap_err();
        assert!(err.is_fatal());
        assert!(inner.posted_recv.is_empty());
        assert_eq!(memory.total_pins(), pins - 1);
    }

    #[test]
    fn test_zero_batch_rejected() {
        let pair = connected_pair();
        let id = cm_id(&pair.client);
        let err = pair
            .client
            .lock()
            .service_completion_queue(id, CqKind::Send, 0)
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument { .. }));
    }
}
