//! Client buffer swaps
//!
//! A swap presents a client's back buffer. When the drawable exactly covers
//! a CRTC the back buffer is flipped onto that CRTC and the front and back
//! pixmaps exchange buffers once the flip lands; otherwise the back buffer
//! is copied into the root buffer immediately.
//!
//! Flips are tracked as pending commands keyed by the cookie handed to
//! [`Kms::page_flip`](crate::kms::Kms::page_flip). A command completes when
//! the last of its flips is reported.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, error, info, warn};

use crate::blit::copy_bo;
use crate::drawable::{Drawable, DrawableId};
use crate::pixmap::Pixmap;
use crate::screen::Screen;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    FrontLeft,
    BackLeft,
}

/// A buffer shared with a rendering client
#[derive(Debug, Clone)]
pub struct SwapBuffer {
    pub attachment: Attachment,
    pub pixmap: Pixmap,
    /// Global name the client imports the buffer by
    pub name: u32,
    pub pitch: u32,
    pub cpp: u32,
    /// Whether the previous swap through this buffer could flip
    previous_canflip: Option<bool>,
}

impl SwapBuffer {
    /// Re-read the name after the pixmap's buffer was exchanged
    pub fn reuse(&mut self) -> Result<()> {
        let bo = self
            .pixmap
            .bo()
            .ok_or_else(|| Error::Map("swap buffer lost its bo".into()))?;
        self.name = bo.global_name()?;
        self.pitch = bo.pitch();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapKind {
    Flip,
    Blit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapStatus {
    Complete,
    Failed,
}

/// Delivered to the client once a swap has finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapCompletion {
    pub drawable: DrawableId,
    pub kind: SwapKind,
    pub status: SwapStatus,
    /// Front and back pixmaps swapped buffers
    pub exchanged: bool,
}

pub type SwapCallback = Box<dyn FnOnce(SwapCompletion)>;

pub type SwapId = u64;

struct PendingSwap {
    id: SwapId,
    drawable: DrawableId,
    kind: SwapKind,
    x: i32,
    y: i32,
    // Held until completion so neither pixmap goes away mid-flip
    src: Pixmap,
    dst: Pixmap,
    callback: Option<SwapCallback>,
    outstanding: u32,
    failed: bool,
    fake_flip: bool,
    drawable_gone: bool,
}

impl fmt::Debug for PendingSwap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSwap")
            .field("id", &self.id)
            .field("drawable", &self.drawable)
            .field("kind", &self.kind)
            .field("outstanding", &self.outstanding)
            .field("failed", &self.failed)
            .field("fake_flip", &self.fake_flip)
            .finish()
    }
}

/// Swaps waiting for page-flip events
#[derive(Debug, Default)]
pub struct SwapTracker {
    next_id: SwapId,
    pending: HashMap<SwapId, PendingSwap>,
}

impl SwapTracker {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn next_id(&mut self) -> SwapId {
        self.next_id += 1;
        self.next_id
    }
}

impl Screen {
    /// Create the buffer a client renders `attachment` of `draw` into.
    /// The front buffer is the drawable's own pixmap.
    pub fn create_swap_buffer(&self, draw: &Drawable, attachment: Attachment) -> Result<SwapBuffer> {
        let pixmap = match attachment {
            Attachment::FrontLeft => draw.pixmap.clone(),
            Attachment::BackLeft => {
                self.create_pixmap(draw.width, draw.height, draw.depth, draw.pixmap.bpp())?
            }
        };
        let bo = pixmap.bo().ok_or_else(|| {
            Error::Allocation(format!("[DRAW:{}] {:?} has no bo", draw.id, attachment))
        })?;

        let buffer = SwapBuffer {
            attachment,
            name: bo.global_name()?,
            pitch: bo.pitch(),
            cpp: bo.bytes_per_pixel(),
            pixmap,
            previous_canflip: None,
        };
        debug!(
            "[DRAW:{}] {:?} buffer name: {} pitch: {}",
            draw.id, attachment, buffer.name, buffer.pitch
        );
        Ok(buffer)
    }

    /// The drawable is a window whose back buffer matches it exactly, which
    /// covers a scanout and is not obscured
    pub fn can_flip(&self, draw: &Drawable, src: &SwapBuffer) -> bool {
        if !draw.is_window() {
            return false;
        }
        let Some(bo) = src.pixmap.bo() else {
            return false;
        };
        if bo.width() != draw.width || bo.height() != draw.height {
            return false;
        }
        if self.scanouts.find_by_drawable(draw).is_none() {
            return false;
        }
        draw.is_unobscured()
    }

    /// Present `src` as the new contents of `dst`.
    ///
    /// `callback` runs exactly once when the swap has finished, also when
    /// it failed after the command was created.
    pub fn schedule_swap(
        &mut self,
        draw: &mut Drawable,
        dst: &mut SwapBuffer,
        src: &mut SwapBuffer,
        callback: SwapCallback,
    ) -> Result<SwapKind> {
        let src_bo = src
            .pixmap
            .bo()
            .ok_or_else(|| Error::Map(format!("[DRAW:{}] back buffer has no bo", draw.id)))?;

        // Just rendered by the GPU
        src_bo.clear_dirty();

        // Eligibility as clients see it; a pending resize only forces one blit
        let mut can_flip = self.can_flip(draw, src);
        let mut flip = can_flip && !self.has_resized;
        if flip {
            match self.enter_flip_mode() {
                Ok(()) => {
                    let scanout = self.scanouts.find_by_drawable(draw).and_then(|s| s.bo().cloned());
                    dst.pixmap.set_bo(scanout);
                }
                Err(e) => {
                    error!("Could not set flip mode: {}", e);
                    flip = false;
                    can_flip = false;
                }
            }
        }
        if !flip {
            if let Err(e) = self.enter_blit_mode() {
                error!("Could not set blit mode: {}", e);
                return Err(e);
            }
            dst.pixmap.set_bo(Some(self.root.clone()));
        }

        let changed = |buf: &SwapBuffer| buf.previous_canflip.is_some_and(|prev| prev != can_flip);
        if changed(&*src) || changed(&*dst) || self.has_resized {
            // Clients reallocate so their buffers suit the new path
            draw.bump_serial();
            debug!("[DRAW:{}] serial bumped, can flip: {}", draw.id, can_flip);
        }
        src.previous_canflip = Some(can_flip);
        dst.previous_canflip = Some(can_flip);

        let kind = if flip { SwapKind::Flip } else { SwapKind::Blit };
        let id = self.swaps.next_id();
        let mut cmd = PendingSwap {
            id,
            drawable: draw.id,
            kind,
            x: draw.x,
            y: draw.y,
            src: src.pixmap.clone(),
            dst: dst.pixmap.clone(),
            callback: Some(callback),
            outstanding: 0,
            failed: false,
            fake_flip: false,
            drawable_gone: false,
        };

        if !flip {
            let result = copy_bo(&src_bo, draw.x, draw.y, &self.root, 0, 0);
            if let Err(e) = &result {
                error!("[DRAW:{}] swap blit failed: {}", draw.id, e);
                cmd.failed = true;
            }
            self.complete_swap(cmd);
            self.has_resized = false;
            return result.map(|()| SwapKind::Blit);
        }

        self.pending_flips += 1;
        let (flipped, result) = self.page_flip(draw, src_bo.fb_id(), id);
        debug!("[DRAW:{}] [FB:{}] flipped {} CRTCs", draw.id, src_bo.fb_id(), flipped);

        match &result {
            Ok(()) if flipped == 0 => cmd.fake_flip = true,
            Ok(()) => {}
            Err(_) => cmd.failed = true,
        }
        // Without events every flip completes as soon as it is queued
        cmd.outstanding = if self.options.page_flip_events { flipped } else { 0 };

        if cmd.outstanding == 0 {
            self.complete_swap(cmd);
        } else {
            self.swaps.pending.insert(id, cmd);
        }
        result.map(|()| SwapKind::Flip)
    }

    /// Flip every connected CRTC showing exactly `draw` to `fb_id`.
    /// Stops at the first failure and returns how many flips were queued.
    fn page_flip(&self, draw: &Drawable, fb_id: u32, cookie: SwapId) -> (u32, Result<()>) {
        let event = self.options.page_flip_events.then_some(cookie);
        let mut flipped = 0;

        for (i, crtc) in self.config.crtcs.iter().enumerate() {
            if !crtc.enabled {
                continue;
            }
            // Flipping a CRTC without a connected output fails with EBUSY
            if !self.config.is_connected(i) {
                continue;
            }
            if !crtc.matches(draw.x, draw.y, draw.width, draw.height) {
                continue;
            }

            debug!("[CRTC:{}] [FB:{}]", crtc.id, fb_id);
            if let Err(e) = self.device.kms().page_flip(crtc.id, fb_id, event) {
                error!("[CRTC:{}] [FB:{}] page flip failed: {}", crtc.id, fb_id, e);
                return (flipped, Err(e));
            }
            flipped += 1;
        }
        (flipped, Ok(()))
    }

    /// A flip of swap `id` has landed
    pub fn on_hardware_event(&mut self, id: SwapId) {
        let Some(cmd) = self.swaps.pending.get_mut(&id) else {
            warn!("Page flip event for unknown swap {}", id);
            return;
        };
        cmd.outstanding = cmd.outstanding.saturating_sub(1);
        if cmd.outstanding > 0 {
            return;
        }
        if let Some(cmd) = self.swaps.pending.remove(&id) {
            self.complete_swap(cmd);
        }
    }

    fn complete_swap(&mut self, mut cmd: PendingSwap) {
        let deliver = !cmd.failed && !cmd.drawable_gone;
        let exchanged = deliver && cmd.kind == SwapKind::Flip && !cmd.fake_flip;

        if exchanged {
            Pixmap::exchange_bos(&cmd.src, &cmd.dst);
        }

        if deliver {
            match cmd.kind {
                SwapKind::Blit => self.scanouts.invalidate_all(),
                SwapKind::Flip => {
                    if let Some(front) = cmd.dst.bo() {
                        if !cmd.fake_flip {
                            self.scanouts.set(cmd.x, cmd.y, &front);
                        }
                        self.scanouts.validate(&front);
                    }
                }
            }
        }

        if !cmd.drawable_gone {
            if let Some(callback) = cmd.callback.take() {
                callback(SwapCompletion {
                    drawable: cmd.drawable,
                    kind: cmd.kind,
                    status: if cmd.failed {
                        SwapStatus::Failed
                    } else {
                        SwapStatus::Complete
                    },
                    exchanged,
                });
            }
        }

        if cmd.kind == SwapKind::Flip {
            self.pending_flips = self.pending_flips.saturating_sub(1);
        }
        debug!("Swap {} done: {:?}", cmd.id, cmd);
    }

    /// Wait for page-flip events and complete the swaps they belong to
    pub fn wait_for_event(&mut self) -> Result<()> {
        let events = self.device.kms().wait_for_event()?;
        for event in events {
            debug!(
                "[CRTC:{}] flip event seq: {} swap: {}",
                event.crtc_id, event.sequence, event.cookie
            );
            self.on_hardware_event(event.cookie);
        }
        Ok(())
    }

    /// Complete swaps for events that are already queued, without blocking
    /// when nothing is pending
    pub fn dispatch_events(&mut self) -> Result<()> {
        if self.swaps.is_empty() {
            return Ok(());
        }
        self.wait_for_event()
    }

    /// The drawable was destroyed; its in-flight swaps finish silently
    pub fn forget_drawable(&mut self, id: DrawableId) {
        for cmd in self.swaps.pending.values_mut().filter(|c| c.drawable == id) {
            info!("[DRAW:{}] destroyed with swap {} in flight", id, cmd.id);
            cmd.drawable_gone = true;
        }
    }

    pub fn pending_swaps(&self) -> usize {
        self.swaps.len()
    }

    pub fn pending_flips(&self) -> u32 {
        self.pending_flips
    }
}
