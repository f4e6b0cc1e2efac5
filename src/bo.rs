//! Buffer objects
//!
//! A [`Bo`] is a shared handle to a GPU allocation bound to a KMS
//! framebuffer. Cloning the handle takes a reference; dropping the last one
//! removes the framebuffer and then frees the allocation.
//!
//! CPU access is guarded by an upgradeable lock: any number of readers may
//! nest, a writer must be the first (exclusive) holder.

use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use tracing::{debug, error};

use crate::alloc::{alloc_flags, Access, Allocator};
use crate::kms::Kms;
use crate::{Error, Result};

/// The allocator and mode-setting device buffers are created from
pub struct Device {
    allocator: Rc<dyn Allocator>,
    kms: Rc<dyn Kms>,
}

impl Device {
    pub fn new(allocator: Rc<dyn Allocator>, kms: Rc<dyn Kms>) -> Rc<Self> {
        Rc::new(Self { allocator, kms })
    }

    pub fn kms(&self) -> &dyn Kms {
        self.kms.as_ref()
    }

    pub fn allocator(&self) -> &dyn Allocator {
        self.allocator.as_ref()
    }

    /// Allocate a scanout-capable buffer and bind it to a framebuffer
    pub fn create_bo(self: &Rc<Self>, width: u32, height: u32, depth: u8, bpp: u8) -> Result<Bo> {
        self.new_bo(width, height, depth, bpp, 0)
    }

    /// Like [`create_bo`](Self::create_bo) but the framebuffer is described by
    /// a fourcc `format` instead of a depth
    pub fn create_bo_with_format(
        self: &Rc<Self>,
        width: u32,
        height: u32,
        format: u32,
        bpp: u8,
    ) -> Result<Bo> {
        self.new_bo(width, height, 0, bpp, format)
    }

    fn new_bo(
        self: &Rc<Self>,
        width: u32,
        height: u32,
        depth: u8,
        bpp: u8,
        format: u32,
    ) -> Result<Bo> {
        let flags = if format != 0 {
            alloc_flags::CURSOR
        } else {
            alloc_flags::SCANOUT
        };
        let allocation = self.allocator.allocate(width, height, bpp, flags)?;

        let fb = if depth != 0 {
            self.kms
                .add_framebuffer(width, height, depth, bpp, allocation.pitch, allocation.handle)
        } else {
            self.kms
                .add_framebuffer2(width, height, format, allocation.pitch, allocation.handle)
        };
        let fb_id = match fb {
            Ok(fb_id) => fb_id,
            Err(e) => {
                error!("[BO:{}] could not add framebuffer: {}", allocation.handle, e);
                self.allocator.destroy(allocation.handle);
                return Err(Error::Allocation(format!(
                    "{}x{} framebuffer: {}",
                    width, height, e
                )));
            }
        };

        debug!(
            "[BO:{}] [FB:{}] created {}x{} depth: {} bpp: {} pitch: {}",
            allocation.handle, fb_id, width, height, depth, bpp, allocation.pitch
        );

        Ok(Bo(Rc::new(BoInner {
            device: Rc::clone(self),
            handle: allocation.handle,
            fb_id,
            width,
            height,
            pitch: allocation.pitch,
            depth,
            bpp,
            format,
            size: allocation.size,
            acquired_exclusive: Cell::new(false),
            acquire_count: Cell::new(0),
            dirty: Cell::new(false),
        })))
    }
}

struct BoInner {
    device: Rc<Device>,
    handle: u32,
    fb_id: u32,
    width: u32,
    height: u32,
    pitch: u32,
    depth: u8,
    bpp: u8,
    format: u32,
    size: usize,
    acquired_exclusive: Cell<bool>,
    acquire_count: Cell<u32>,
    dirty: Cell<bool>,
}

impl Drop for BoInner {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.acquire_count.get(),
            0,
            "[BO:{}] destroyed while acquired for CPU access",
            self.handle
        );
        if self.fb_id != 0 {
            if let Err(e) = self.device.kms.remove_framebuffer(self.fb_id) {
                error!("[BO:{}] [FB:{}] remove framebuffer: {}", self.handle, self.fb_id, e);
            }
        }
        self.device.allocator.destroy(self.handle);
        debug!("[BO:{}] [FB:{}] released", self.handle, self.fb_id);
    }
}

/// Reference-counted buffer object handle
#[derive(Clone)]
pub struct Bo(Rc<BoInner>);

impl Bo {
    /// Take another reference
    pub fn reference(&self) -> Bo {
        self.clone()
    }

    /// Drop this reference
    pub fn unreference(self) {}

    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// True if both handles refer to the same buffer
    pub fn ptr_eq(a: &Bo, b: &Bo) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    pub fn handle(&self) -> u32 {
        self.0.handle
    }

    pub fn fb_id(&self) -> u32 {
        self.0.fb_id
    }

    pub fn width(&self) -> u32 {
        self.0.width
    }

    pub fn height(&self) -> u32 {
        self.0.height
    }

    pub fn pitch(&self) -> u32 {
        self.0.pitch
    }

    pub fn depth(&self) -> u8 {
        self.0.depth
    }

    pub fn bpp(&self) -> u8 {
        self.0.bpp
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        (self.0.bpp as u32 + 7) / 8
    }

    /// Fourcc format, 0 for buffers described by depth
    pub fn format(&self) -> u32 {
        self.0.format
    }

    pub fn size(&self) -> usize {
        self.0.size
    }

    pub fn device(&self) -> &Rc<Device> {
        &self.0.device
    }

    /// CPU address of the buffer. Accessing it requires
    /// [`acquire_for_cpu`](Self::acquire_for_cpu) first.
    pub fn map(&self) -> Result<NonNull<u8>> {
        self.0.device.allocator.map(self.0.handle)
    }

    pub fn global_name(&self) -> Result<u32> {
        self.0.device.allocator.global_name(self.0.handle)
    }

    /// Written by the CPU since the last [`clear_dirty`](Self::clear_dirty)
    pub fn dirty(&self) -> bool {
        self.0.dirty.get()
    }

    pub fn clear_dirty(&self) {
        self.0.dirty.set(false);
    }

    pub fn is_acquired(&self) -> bool {
        self.0.acquire_count.get() > 0
    }

    /// Lock the buffer for CPU access and return its mapping
    pub fn acquire_for_cpu(&self, access: Access) -> Result<NonNull<u8>> {
        let inner = &self.0;
        let count = inner.acquire_count.get();
        let ptr = self.map()?;

        if count > 0 {
            // Readers nest; a writer must already hold it exclusively
            if access.is_write() && !inner.acquired_exclusive.get() {
                debug!("[BO:{}] write acquire refused, held for read", inner.handle);
                return Err(Error::LockContention);
            }
        } else {
            inner.device.allocator.cpu_prepare(inner.handle, access)?;
            inner.acquired_exclusive.set(access.is_write());
        }

        inner.acquire_count.set(count + 1);
        if access.is_write() {
            inner.dirty.set(true);
        }
        Ok(ptr)
    }

    /// Drop one CPU acquisition. Panics if the buffer is not acquired.
    pub fn release_from_cpu(&self, access: Access) -> Result<()> {
        let inner = &self.0;
        let count = inner.acquire_count.get();
        assert!(count > 0, "[BO:{}] released without being acquired", inner.handle);

        inner.acquire_count.set(count - 1);
        if count == 1 {
            inner.acquired_exclusive.set(false);
            inner.device.allocator.cpu_finish(inner.handle, access)?;
        }
        Ok(())
    }

    /// Acquire the buffer and release it when the guard drops
    pub fn cpu_access(&self, access: Access) -> Result<CpuAccess<'_>> {
        let ptr = self.acquire_for_cpu(access)?;
        Ok(CpuAccess {
            bo: self,
            access,
            ptr,
        })
    }
}

impl fmt::Debug for Bo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bo")
            .field("handle", &self.0.handle)
            .field("fb_id", &self.0.fb_id)
            .field("width", &self.0.width)
            .field("height", &self.0.height)
            .field("pitch", &self.0.pitch)
            .field("bpp", &self.0.bpp)
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// Scoped CPU access to a [`Bo`]
pub struct CpuAccess<'a> {
    bo: &'a Bo,
    access: Access,
    ptr: NonNull<u8>,
}

impl CpuAccess<'_> {
    pub fn bo(&self) -> &Bo {
        self.bo
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping is `size` bytes and stays valid while the bo
        // lives; the lock keeps writers away while readers hold it.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.bo.size()) }
    }

    /// Mutable view of the buffer. Panics on a read acquisition.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        assert!(
            self.access.is_write(),
            "[BO:{}] mutable access under a read lock",
            self.bo.handle()
        );
        // SAFETY: as in `bytes`; the exclusive write lock excludes other
        // guards on this buffer from a different acquisition.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.bo.size()) }
    }
}

impl Drop for CpuAccess<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.bo.release_from_cpu(self.access) {
            error!("[BO:{}] cpu finish failed: {}", self.bo.handle(), e);
        }
    }
}
