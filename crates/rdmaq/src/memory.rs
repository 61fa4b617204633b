//! Memory registration and pinning.
//!
//! The allocator that backs queue buffers is an external collaborator. It can look up
//! the registration that covers an address in a given protection domain, and it can
//! pin an allocation so it stays resident while the hardware owns it.

use std::sync::Arc;

use tracing::trace;

use crate::verbs::DomainHandle;

/// Registration of a memory range with a protection domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegistration {
    /// Local key to place in scatter-gather entries.
    pub lkey: u32,
    /// Domain the registration belongs to.
    pub domain: DomainHandle,
}

/// Pin/unpin and registration lookup, provided by the buffer allocator.
pub trait MemoryRegistry: Send + Sync {
    /// Returns the registration covering `[addr, addr + len)` in `domain`, if any.
    fn register(&self, addr: u64, len: usize, domain: DomainHandle) -> Option<MemoryRegistration>;

    /// Keeps the allocation containing `addr` resident until a matching `unpin`.
    fn pin(&self, addr: u64);

    /// Releases one pin on the allocation containing `addr`.
    fn unpin(&self, addr: u64);
}

/// Address of the first byte of a buffer, as the hardware sees it.
pub fn buffer_addr(buf: &[u8]) -> u64 {
    buf.as_ptr() as u64
}

/// A set of pinned addresses, unpinned when dropped.
///
/// Whoever owns the buffers must also own the `PinSet` and drop it first, so a
/// buffer is never freed while still pinned.
pub struct PinSet {
    registry: Arc<dyn MemoryRegistry>,
    addrs: Vec<u64>,
}

impl PinSet {
    /// Pins every address in `addrs`.
    pub fn pin(registry: Arc<dyn MemoryRegistry>, addrs: Vec<u64>) -> Self {
        for &addr in &addrs {
            registry.pin(addr);
        }
        trace!(count = addrs.len(), "pinned buffers");
        Self { registry, addrs }
    }

    /// Number of pinned addresses.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Returns true if nothing is pinned.
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

impl Drop for PinSet {
    fn drop(&mut self) {
        for &addr in &self.addrs {
            self.registry.unpin(addr);
        }
        trace!(count = self.addrs.len(), "unpinned buffers");
    }
}

impl std::fmt::Debug for PinSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinSet").field("addrs", &self.addrs).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct CountingRegistry {
        pins: Mutex<HashMap<u64, i64>>,
    }

    impl MemoryRegistry for CountingRegistry {
        fn register(&self, _addr: u64, _len: usize, domain: DomainHandle) -> Option<MemoryRegistration> {
            Some(MemoryRegistration { lkey: 1, domain })
        }

        fn pin(&self, addr: u64) {
            *self.pins.lock().entry(addr).or_insert(0) += 1;
        }

        fn unpin(&self, addr: u64) {
            *self.pins.lock().entry(addr).or_insert(0) -= 1;
        }
    }

    #[test]
    fn test_pinset_unpins_on_drop() {
        let registry = Arc::new(CountingRegistry::default());
        let pins = PinSet::pin(registry.clone(), vec![0x1000, 0x2000]);
        assert_eq!(pins.len(), 2);
        assert_eq!(registry.pins.lock()[&0x1000], 1);

        drop(pins);
        assert_eq!(registry.pins.lock()[&0x1000], 0);
        assert_eq!(registry.pins.lock()[&0x2000], 0);
    }

    #[test]
    fn test_buffer_addr() {
        let buf = vec![0u8; 8];
        assert_eq!(buffer_addr(&buf), buf.as_ptr() as u64);
        assert_eq!(buffer_addr(&buf[4..]), buf.as_ptr() as u64 + 4);
    }

    #[test]
    fn test_empty_pinset() {
        let registry = Arc::new(CountingRegistry::default());
        let pins = PinSet::pin(registry.clone(), Vec::new());
        assert!(pins.is_empty());
        drop(pins);
        assert!(registry.pins.lock().is_empty());
    }
}
