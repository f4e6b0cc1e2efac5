//! Pixmap lifecycle
//!
//! The host allocates pixmaps and calls back into the driver to give them
//! backing storage and to bracket CPU access. The root pixmap is special:
//! in flip mode it may be backed by a per-CRTC scanout instead of the root
//! buffer, and CPU access has to see the whole screen.

use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use tracing::{debug, error};

use crate::alloc::Access;
use crate::bo::Bo;
use crate::screen::Screen;
use crate::{Error, Result};

struct PixmapPriv {
    bo: Option<Bo>,
    width: u32,
    height: u32,
    depth: u8,
    bpp: u8,
    /// Row stride in bytes
    dev_kind: u32,
    /// Set between prepare and finish access
    cpu_ptr: Option<NonNull<u8>>,
}

/// Shared handle to a driver pixmap
#[derive(Clone)]
pub struct Pixmap(Rc<RefCell<PixmapPriv>>);

impl Pixmap {
    /// A pixmap header without storage
    pub fn unbacked(width: u32, height: u32, depth: u8, bpp: u8) -> Self {
        Self(Rc::new(RefCell::new(PixmapPriv {
            bo: None,
            width,
            height,
            depth,
            bpp,
            dev_kind: 0,
            cpu_ptr: None,
        })))
    }

    pub fn bo(&self) -> Option<Bo> {
        self.0.borrow().bo.clone()
    }

    /// Replace the backing buffer, returning the previous one
    pub fn set_bo(&self, bo: Option<Bo>) -> Option<Bo> {
        std::mem::replace(&mut self.0.borrow_mut().bo, bo)
    }

    pub fn width(&self) -> u32 {
        self.0.borrow().width
    }

    pub fn height(&self) -> u32 {
        self.0.borrow().height
    }

    pub fn depth(&self) -> u8 {
        self.0.borrow().depth
    }

    pub fn bpp(&self) -> u8 {
        self.0.borrow().bpp
    }

    pub fn dev_kind(&self) -> u32 {
        self.0.borrow().dev_kind
    }

    pub fn cpu_ptr(&self) -> Option<NonNull<u8>> {
        self.0.borrow().cpu_ptr
    }

    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    pub fn ptr_eq(a: &Pixmap, b: &Pixmap) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    /// Swap the buffers backing two pixmaps
    pub fn exchange_bos(a: &Pixmap, b: &Pixmap) {
        if Pixmap::ptr_eq(a, b) {
            return;
        }
        std::mem::swap(&mut a.0.borrow_mut().bo, &mut b.0.borrow_mut().bo);
    }

    /// The backing buffer has the pixmap's size, bpp and stride
    /// `bo` covers the whole pixmap with the pixmap's stride
    pub(crate) fn has_fullsize_bo(&self, bo: &Bo) -> bool {
        let p = self.0.borrow();
        bo.width() == p.width && bo.height() == p.height && bo.bpp() == p.bpp && bo.pitch() == p.dev_kind
    }
}

impl fmt::Debug for Pixmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.0.borrow();
        f.debug_struct("Pixmap")
            .field("width", &p.width)
            .field("height", &p.height)
            .field("bpp", &p.bpp)
            .field("dev_kind", &p.dev_kind)
            .field("bo", &p.bo.as_ref().map(|bo| bo.handle()))
            .finish()
    }
}

/// Storage handed to [`Screen::modify_pixmap_header`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixmapData {
    /// The root buffer's mapping
    Root,
    /// Memory the driver does not manage
    Foreign,
}

/// Role of a pixmap in an accelerated operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessIndex {
    Dest,
    Src,
    Mask,
    AuxDest,
    AuxSrc,
    AuxMask,
}

impl AccessIndex {
    pub fn access(self) -> Access {
        match self {
            AccessIndex::Src | AccessIndex::Mask | AccessIndex::AuxSrc | AccessIndex::AuxMask => {
                Access::Read
            }
            AccessIndex::Dest | AccessIndex::AuxDest => Access::Write,
        }
    }
}

impl Screen {
    /// Allocate a pixmap with a buffer of its size
    pub fn create_pixmap(&self, width: u32, height: u32, depth: u8, bpp: u8) -> Result<Pixmap> {
        let pixmap = Pixmap::unbacked(0, 0, depth, bpp);
        if !self.modify_pixmap_header(&pixmap, width, height, depth, bpp, 0, None)? {
            return Err(Error::Allocation(format!("{}x{} pixmap", width, height)));
        }
        Ok(pixmap)
    }

    /// Release the driver's reference to a pixmap
    pub fn destroy_pixmap(&self, pixmap: Pixmap) {
        drop(pixmap);
    }

    /// Update a pixmap's header and (re)allocate its buffer to match.
    ///
    /// Zero arguments keep the current value. Returns `Ok(false)` when the
    /// pixmap points at foreign memory and the host must handle it.
    #[allow(clippy::too_many_arguments)]
    pub fn modify_pixmap_header(
        &self,
        pixmap: &Pixmap,
        width: u32,
        height: u32,
        depth: u8,
        bpp: u8,
        dev_kind: u32,
        data: Option<PixmapData>,
    ) -> Result<bool> {
        {
            let mut p = pixmap.0.borrow_mut();
            if dev_kind > 0 {
                p.dev_kind = dev_kind;
            }
            match data {
                // Scratch pixmaps get recycled and may still hold a bo
                Some(PixmapData::Foreign) => {
                    p.bo = None;
                    return Ok(false);
                }
                Some(PixmapData::Root) => p.bo = Some(self.root.clone()),
                None => {}
            }

            if depth > 0 {
                p.depth = depth;
            }
            if bpp > 0 {
                p.bpp = bpp;
            }
            if width > 0 {
                p.width = width;
            }
            if height > 0 {
                p.height = height;
            }

            // Empty headers get their storage later
            if p.width == 0 || p.height == 0 {
                return Ok(true);
            }

            let matches = p
                .bo
                .as_ref()
                .is_some_and(|bo| bo.width() == p.width && bo.height() == p.height && bo.bpp() == p.bpp);
            if matches {
                return Ok(true);
            }
            p.bo = None;
        }

        let (width, height, depth, bpp) = (pixmap.width(), pixmap.height(), pixmap.depth(), pixmap.bpp());
        let bo = self.device.create_bo(width, height, depth, bpp).map_err(|e| {
            error!("failed to allocate {}x{} bo: {}", width, height, e);
            e
        })?;
        debug!("pixmap {}x{} backed by [BO:{}]", width, height, bo.handle());

        let mut p = pixmap.0.borrow_mut();
        p.dev_kind = bo.pitch();
        p.bo = Some(bo);
        Ok(true)
    }

    /// Lock a pixmap's storage for CPU access and return its address
    pub fn prepare_access(&mut self, pixmap: &Pixmap, index: AccessIndex) -> Result<NonNull<u8>> {
        let access = index.access();
        let Some(bo) = pixmap.bo() else {
            error!("Unable to prepare access for pixmap {:?}: no bo", index);
            return Err(Error::Map("pixmap has no buffer".into()));
        };

        let is_root = Pixmap::ptr_eq(pixmap, &self.root_pixmap);
        let ptr = if !is_root || Bo::ptr_eq(&bo, &self.root) {
            bo.map()?
        } else if access.is_write() {
            // Every root write happens in blit mode, on the root buffer
            self.enter_blit_mode()?;
            pixmap.set_bo(Some(self.root.clone()));
            self.root.map()?
        } else if pixmap.has_fullsize_bo(&bo) {
            // A single CRTC's scanout covers the whole root
            bo.map()?
        } else {
            self.update_root_from_crtcs()?;
            self.root.map()?
        };

        // Lock the bo the pixmap held on entry; for root reads this holds
        // off updates to the per-CRTC scanout while the root is read
        let locked = if access.is_write() && is_root { self.root.clone() } else { bo };
        locked.acquire_for_cpu(access).map_err(|e| {
            error!("Unable to prepare access for pixmap {:?}: {}", index, e);
            e
        })?;

        pixmap.0.borrow_mut().cpu_ptr = Some(ptr);
        Ok(ptr)
    }

    /// Drop the lock taken by [`prepare_access`](Self::prepare_access)
    pub fn finish_access(&mut self, pixmap: &Pixmap, index: AccessIndex) -> Result<()> {
        pixmap.0.borrow_mut().cpu_ptr = None;
        match pixmap.bo() {
            Some(bo) => bo.release_from_cpu(index.access()),
            None => Ok(()),
        }
    }

    /// Pixmaps with a buffer live in GPU memory
    pub fn pixmap_is_offscreen(&self, pixmap: &Pixmap) -> bool {
        pixmap.bo().is_some()
    }
}
