//! Buffer allocation backends
//!
//! The `Allocator` trait is the GEM-style interface the buffer-object layer
//! consumes. `MemAllocator` backs buffers with anonymous shared mappings so
//! the scanout logic can run without a GPU.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ptr::{self, NonNull};

use tracing::{debug, error, warn};

use crate::{Error, Result};

/// Direction of a CPU access to a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl Access {
    pub fn is_write(self) -> bool {
        self == Access::Write
    }
}

/// Result of a successful allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub handle: u32,
    /// Bytes per row, already aligned
    pub pitch: u32,
    pub size: usize,
}

/// Allocation flags
pub mod alloc_flags {
    pub const SCANOUT: u32 = 1 << 0;
    pub const CURSOR: u32 = 1 << 1;
}

/// Backing-storage allocator for buffer objects.
///
/// Methods take `&self`; implementations keep their bookkeeping behind
/// interior mutability so buffers can be released from `Drop`.
pub trait Allocator {
    fn allocate(&self, width: u32, height: u32, bpp: u8, flags: u32) -> Result<Allocation>;

    fn destroy(&self, handle: u32);

    /// CPU address of the whole allocation, stable until `destroy`
    fn map(&self, handle: u32) -> Result<NonNull<u8>>;

    /// Synchronize caches before CPU access
    fn cpu_prepare(&self, handle: u32, access: Access) -> Result<()>;

    /// Synchronize caches after CPU access
    fn cpu_finish(&self, handle: u32, access: Access) -> Result<()>;

    /// Global (flink) name used to share the buffer with clients
    fn global_name(&self, handle: u32) -> Result<u32>;
}

/// Round `value` up to a power-of-two `align`
pub fn align_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Row pitch for `width` pixels of `bpp` bits, aligned to `align` bytes
pub fn aligned_pitch(width: u32, bpp: u8, align: u32) -> u32 {
    align_up((width * bpp as u32 + 7) / 8, align)
}

struct Mapping {
    ptr: NonNull<u8>,
    size: usize,
    name: Option<u32>,
}

/// Counters exposed for diagnostics and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub live: usize,
    pub allocated: usize,
    pub destroyed: usize,
    pub cpu_prepares: usize,
    pub cpu_finishes: usize,
}

/// Allocator backed by anonymous memory mappings
pub struct MemAllocator {
    pitch_alignment: u32,
    next_handle: Cell<u32>,
    next_name: Cell<u32>,
    buffers: RefCell<HashMap<u32, Mapping>>,
    stats: Cell<AllocatorStats>,
    fail_allocations: Cell<usize>,
}

impl MemAllocator {
    pub fn new(pitch_alignment: u32) -> Self {
        Self {
            pitch_alignment,
            next_handle: Cell::new(1),
            next_name: Cell::new(1),
            buffers: RefCell::new(HashMap::new()),
            stats: Cell::new(AllocatorStats::default()),
            fail_allocations: Cell::new(0),
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        self.stats.get()
    }

    /// Make the next `count` allocations fail
    pub fn fail_next_allocations(&self, count: usize) {
        self.fail_allocations.set(count);
    }

    fn update_stats(&self, f: impl FnOnce(&mut AllocatorStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }
}

impl Allocator for MemAllocator {
    fn allocate(&self, width: u32, height: u32, bpp: u8, flags: u32) -> Result<Allocation> {
        let pending_failures = self.fail_allocations.get();
        if pending_failures > 0 {
            self.fail_allocations.set(pending_failures - 1);
            return Err(Error::Allocation(format!(
                "{}x{} flags: 0x{:x}: out of memory",
                width, height, flags
            )));
        }

        let pitch = aligned_pitch(width, bpp, self.pitch_alignment);
        let size = pitch as usize * height as usize;
        if size == 0 {
            return Err(Error::Allocation(format!("empty {}x{} buffer", width, height)));
        }

        // SAFETY: anonymous private mapping, no file descriptor involved.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            error!("mmap of {} bytes failed: {}", size, err);
            return Err(Error::Allocation(err.to_string()));
        }
        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| Error::Allocation("mmap returned null".into()))?;

        let handle = self.next_handle.get();
        self.next_handle.set(handle + 1);
        self.buffers
            .borrow_mut()
            .insert(handle, Mapping { ptr, size, name: None });
        self.update_stats(|s| {
            s.live += 1;
            s.allocated += 1;
        });

        debug!(
            "[BO:{}] allocated {}x{} bpp: {} pitch: {} flags: 0x{:x}",
            handle, width, height, bpp, pitch, flags
        );
        Ok(Allocation { handle, pitch, size })
    }

    fn destroy(&self, handle: u32) {
        let Some(mapping) = self.buffers.borrow_mut().remove(&handle) else {
            warn!("[BO:{}] destroy of unknown buffer", handle);
            return;
        };
        // SAFETY: the mapping was created by mmap with exactly this size.
        let ret = unsafe { libc::munmap(mapping.ptr.as_ptr() as *mut libc::c_void, mapping.size) };
        if ret != 0 {
            error!(
                "[BO:{}] munmap failed: {}",
                handle,
                std::io::Error::last_os_error()
            );
        }
        self.update_stats(|s| {
            s.live -= 1;
            s.destroyed += 1;
        });
        debug!("[BO:{}] destroyed", handle);
    }

    fn map(&self, handle: u32) -> Result<NonNull<u8>> {
        self.buffers
            .borrow()
            .get(&handle)
            .map(|m| m.ptr)
            .ok_or_else(|| Error::Map(format!("[BO:{}] unknown buffer", handle)))
    }

    fn cpu_prepare(&self, handle: u32, access: Access) -> Result<()> {
        if !self.buffers.borrow().contains_key(&handle) {
            return Err(Error::Map(format!("[BO:{}] cpu prepare of unknown buffer", handle)));
        }
        debug!("[BO:{}] cpu prepare {:?}", handle, access);
        self.update_stats(|s| s.cpu_prepares += 1);
        Ok(())
    }

    fn cpu_finish(&self, handle: u32, access: Access) -> Result<()> {
        if !self.buffers.borrow().contains_key(&handle) {
            return Err(Error::Map(format!("[BO:{}] cpu finish of unknown buffer", handle)));
        }
        debug!("[BO:{}] cpu finish {:?}", handle, access);
        self.update_stats(|s| s.cpu_finishes += 1);
        Ok(())
    }

    fn global_name(&self, handle: u32) -> Result<u32> {
        let mut buffers = self.buffers.borrow_mut();
        let mapping = buffers
            .get_mut(&handle)
            .ok_or_else(|| Error::Map(format!("[BO:{}] flink of unknown buffer", handle)))?;
        if let Some(name) = mapping.name {
            return Ok(name);
        }
        let name = self.next_name.get();
        self.next_name.set(name + 1);
        mapping.name = Some(name);
        Ok(name)
    }
}

impl Drop for MemAllocator {
    fn drop(&mut self) {
        let buffers = std::mem::take(self.buffers.get_mut());
        if !buffers.is_empty() {
            warn!("Releasing {} leaked buffers", buffers.len());
        }
        for (_, mapping) in buffers {
            // SAFETY: every entry is a live mapping of `size` bytes.
            unsafe { libc::munmap(mapping.ptr.as_ptr() as *mut libc::c_void, mapping.size) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pitch_alignment() {
        assert_eq!(aligned_pitch(1920, 32, 64), 7680);
        assert_eq!(aligned_pitch(1366, 32, 64), 5504);
        assert_eq!(aligned_pitch(10, 16, 64), 64);
        assert_eq!(aligned_pitch(3, 24, 1), 9);
    }

    #[test]
    fn test_allocate_map_destroy() {
        let alloc = MemAllocator::new(64);
        let a = alloc.allocate(100, 10, 32, alloc_flags::SCANOUT).unwrap();
        assert_eq!(a.pitch, 448);
        assert_eq!(a.size, 4480);

        let ptr = alloc.map(a.handle).unwrap();
        // SAFETY: mapping is a.size bytes long.
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), a.size) };
        assert!(bytes.iter().all(|b| *b == 0));
        bytes[a.size - 1] = 0xab;

        assert_eq!(alloc.stats().live, 1);
        alloc.destroy(a.handle);
        assert_eq!(alloc.stats().live, 0);
        assert!(alloc.map(a.handle).is_err());
    }

    #[test]
    fn test_global_name_is_stable() {
        let alloc = MemAllocator::new(64);
        let a = alloc.allocate(8, 8, 32, 0).unwrap();
        let b = alloc.allocate(8, 8, 32, 0).unwrap();
        let name = alloc.global_name(a.handle).unwrap();
        assert_eq!(alloc.global_name(a.handle).unwrap(), name);
        assert_ne!(alloc.global_name(b.handle).unwrap(), name);
    }

    #[test]
    fn test_injected_failure() {
        let alloc = MemAllocator::new(64);
        alloc.fail_next_allocations(1);
        assert!(matches!(alloc.allocate(8, 8, 32, 0), Err(Error::Allocation(_))));
        assert!(alloc.allocate(8, 8, 32, 0).is_ok());
        assert!(alloc.allocate(0, 8, 32, 0).is_err());
    }
}
