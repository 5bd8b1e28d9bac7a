use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use eager_rs::backend::spec::{Allocator, BackendError, BackendResult, DeviceHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocEvent {
    Alloc { id: u64, size: usize },
    Free { id: u64 },
    /// Free of a handle that is not live.
    InvalidFree { id: u64 },
}

#[derive(Default)]
struct Pool {
    blocks: HashMap<u64, Vec<u8>>,
    events: Vec<AllocEvent>,
}

/// Device memory simulated on the host.
#[derive(Default)]
pub struct RefAllocator {
    next_id: AtomicU64,
    fail_next: AtomicBool,
    pool: Mutex<Pool>,
}

impl RefAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `alloc` call fail.
    pub fn fail_next_alloc(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn write(&self, handle: DeviceHandle, bytes: &[u8]) -> BackendResult<()> {
        let mut pool = self.pool.lock().expect("ref pool poisoned");
        let block = pool.blocks.get_mut(&handle.id).ok_or_else(|| {
            BackendError::execution(format!("write to released buffer {}", handle.id))
        })?;
        if bytes.len() > block.len() {
            return Err(BackendError::execution(format!(
                "write of {} bytes into buffer {} of {} bytes",
                bytes.len(),
                handle.id,
                block.len()
            )));
        }
        block[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn is_live(&self, handle: DeviceHandle) -> bool {
        let pool = self.pool.lock().expect("ref pool poisoned");
        pool.blocks.contains_key(&handle.id)
    }

    pub fn live_count(&self) -> usize {
        self.pool.lock().expect("ref pool poisoned").blocks.len()
    }

    pub fn events(&self) -> Vec<AllocEvent> {
        self.pool.lock().expect("ref pool poisoned").events.clone()
    }

    pub fn alloc_count(&self) -> usize {
        self.count(|event| matches!(event, AllocEvent::Alloc { .. }))
    }

    pub fn free_count(&self) -> usize {
        self.count(|event| matches!(event, AllocEvent::Free { .. }))
    }

    pub fn invalid_free_count(&self) -> usize {
        self.count(|event| matches!(event, AllocEvent::InvalidFree { .. }))
    }

    /// Ids freed so far, in order.
    pub fn freed_ids(&self) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                AllocEvent::Free { id } => Some(id),
                _ => None,
            })
            .collect()
    }

    fn count(&self, predicate: impl Fn(&AllocEvent) -> bool) -> usize {
        let pool = self.pool.lock().expect("ref pool poisoned");
        pool.events.iter().filter(|event| predicate(event)).count()
    }
}

impl Allocator for RefAllocator {
    fn alloc(&self, size: usize) -> BackendResult<DeviceHandle> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(BackendError::allocation(size, "injected failure"));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut pool = self.pool.lock().expect("ref pool poisoned");
        pool.blocks.insert(id, vec![0; size]);
        pool.events.push(AllocEvent::Alloc { id, size });
        Ok(DeviceHandle { id, size })
    }

    fn free(&self, handle: DeviceHandle) {
        let mut pool = self.pool.lock().expect("ref pool poisoned");
        if pool.blocks.remove(&handle.id).is_some() {
            pool.events.push(AllocEvent::Free { id: handle.id });
        } else {
            tracing::warn!(id = handle.id, "free of unknown buffer");
            pool.events.push(AllocEvent::InvalidFree { id: handle.id });
        }
    }

    fn read(&self, handle: DeviceHandle) -> BackendResult<Vec<u8>> {
        let pool = self.pool.lock().expect("ref pool poisoned");
        pool.blocks
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| BackendError::execution(format!("read of released buffer {}", handle.id)))
    }
}
