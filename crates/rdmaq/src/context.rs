//! Shared device context.
//!
//! One context exists per device per process. It owns the device handle, the
//! memory registry, and the protection domain every queue registers its buffers
//! in. The domain is allocated on first use and released when the context is shut
//! down or dropped, never by an individual queue.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::memory::{buffer_addr, MemoryRegistration, MemoryRegistry};
use crate::verbs::{CmId, DomainHandle, RdmaDevice};

/// Device, registry and registration domain shared by all queues of a process.
pub struct RdmaContext<D: RdmaDevice> {
    device: Mutex<D>,
    registry: Arc<dyn MemoryRegistry>,
    domain: Mutex<Option<DomainHandle>>,
    config: QueueConfig,
}

impl<D: RdmaDevice> RdmaContext<D> {
    /// Creates a context after validating `config`.
    pub fn new(device: D, registry: Arc<dyn MemoryRegistry>, config: QueueConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            device: Mutex::new(device),
            registry,
            domain: Mutex::new(None),
            config,
        }))
    }

    /// Configuration applied to every queue of this context.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The memory registry buffers are registered and pinned through.
    pub fn registry(&self) -> &Arc<dyn MemoryRegistry> {
        &self.registry
    }

    /// The registration domain, if one has been allocated.
    pub fn domain_handle(&self) -> Option<DomainHandle> {
        *self.domain.lock()
    }

    /// Locks the device. Never held across a call back into the context.
    pub(crate) fn device(&self) -> MutexGuard<'_, D> {
        self.device.lock()
    }

    /// Returns the registration domain, allocating it on the device behind `id` the first time.
    pub(crate) fn domain(&self, id: CmId) -> Result<DomainHandle> {
        let mut domain = self.domain.lock();
        if let Some(pd) = *domain {
            return Ok(pd);
        }
        let pd = self.device.lock().alloc_pd(id)?;
        info!(pd = pd.0, "allocated registration domain");
        *domain = Some(pd);
        Ok(pd)
    }

    /// Looks up the registration covering `buf` in the context's domain.
    pub(crate) fn register(&self, id: CmId, buf: &[u8]) -> Result<MemoryRegistration> {
        let pd = self.domain(id)?;
        let addr = buffer_addr(buf);
        let mr = self
            .registry
            .register(addr, buf.len(), pd)
            .ok_or_else(|| QueueError::not_supported(format!("no registration for 0x{:x}", addr)))?;
        if mr.domain != pd {
            return Err(QueueError::invalid_state(format!(
                "registration for 0x{:x} belongs to domain {}, expected {}",
                addr, mr.domain.0, pd.0
            )));
        }
        Ok(mr)
    }

    /// Releases the registration domain. Queues still using it must be closed first.
    pub fn shutdown(&self) -> Result<()> {
        let mut domain = self.domain.lock();
        if let Some(pd) = domain.take() {
            self.device.lock().dealloc_pd(pd)?;
            debug!(pd = pd.0, "released registration domain");
        }
        Ok(())
    }
}

impl<D: RdmaDevice> Drop for RdmaContext<D> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "failed to release registration domain");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma_sim::{lkey_for, SimFabric};
    use crate::verbs::PortSpace;
    use std::net::{IpAddr, Ipv4Addr};

    fn context(fabric: &SimFabric) -> Arc<RdmaContext<crate::rdma_sim::SimDevice>> {
        let device = fabric.device(IpAddr::V4(Ipv4Addr::new(10, 1, 0, 1)));
        RdmaContext::new(device, fabric.memory(), QueueConfig::default()).unwrap()
    }

    fn new_id(ctx: &RdmaContext<crate::rdma_sim::SimDevice>) -> CmId {
        let mut dev = ctx.device();
        let ch = dev.create_event_channel().unwrap();
        dev.create_id(ch, PortSpace::Tcp).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let fabric = SimFabric::default();
        let device = fabric.device(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let config = QueueConfig {
            recv_buf_count: 0,
            ..QueueConfig::default()
        };
        assert!(matches!(
            RdmaContext::new(device, fabric.memory(), config),
            Err(QueueError::Config { .. })
        ));
    }

    #[test]
    fn test_domain_allocated_once() {
        let fabric = SimFabric::default();
        let ctx = context(&fabric);
        assert!(ctx.domain_handle().is_none());

        let a = new_id(&ctx);
        let b = new_id(&ctx);
        let pd = ctx.domain(a).unwrap();
        assert_eq!(ctx.domain(b).unwrap(), pd);
        assert_eq!(ctx.domain_handle(), Some(pd));
        assert_eq!(fabric.stats().domains_allocated, 1);
    }

    #[test]
    fn test_register_uses_context_domain() {
        let fabric = SimFabric::default();
        let ctx = context(&fabric);
        let id = new_id(&ctx);
        let buf = vec![0u8; 64];
        let mr = ctx.register(id, &buf).unwrap();
        let pd = ctx.domain_handle().unwrap();
        assert_eq!(mr.domain, pd);
        assert_eq!(mr.lkey, lkey_for(pd));
    }

    #[test]
    fn test_register_without_registration() {
        let fabric = SimFabric::default();
        let ctx = context(&fabric);
        let id = new_id(&ctx);
        fabric.memory().refuse_registrations(true);
        assert!(matches!(
            ctx.register(id, &[1, 2, 3]),
            Err(QueueError::NotSupported { .. })
        ));
    }

    #[test]
    fn test_shutdown_releases_domain() {
        let fabric = SimFabric::default();
        let ctx = context(&fabric);
        let id = new_id(&ctx);
        ctx.domain(id).unwrap();
        assert_eq!(fabric.live_domains(), 1);

        ctx.shutdown().unwrap();
        assert!(ctx.domain_handle().is_none());
        assert_eq!(fabric.live_domains(), 0);
        // a second shutdown has nothing left to release
        ctx.shutdown().unwrap();
        assert_eq!(fabric.stats().domains_released, 1);
    }

    #[test]
    fn test_drop_releases_domain() {
        let fabric = SimFabric::default();
        let ctx = context(&fabric);
        let id = new_id(&ctx);
        ctx.domain(id).unwrap();
        drop(ctx);
        assert_eq!(fabric.live_domains(), 0);
    }
}
