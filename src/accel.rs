//! 2D acceleration dispatch
//!
//! Solid fills and copies go to an [`AccelBackend`] (a blitter such as RGA)
//! when the target is big enough to be worth it. Rectangles smaller than
//! [`ACCEL_MIN_SIZE`] in either direction are done on the CPU.
//!
//! Every prepare call returns a context for that one operation; dropping it
//! without calling `done` still waits for the backend.

use std::fmt;

use tracing::{debug, error, trace};

use crate::alloc::Access;
use crate::bo::Bo;
use crate::drawable::Rect;
use crate::pixmap::Pixmap;
use crate::{Error, Result};

/// Smallest width and height the blitter is used for
pub const ACCEL_MIN_SIZE: u32 = 34;

/// Raster op: dst = src
pub const GX_COPY: u8 = 0x3;

/// Planemask with every plane enabled
pub const FULL_PLANEMASK: u32 = u32::MAX;

/// A pixmap's buffer as seen by a backend
#[derive(Debug, Clone)]
pub struct Surface {
    pub bo: Bo,
    pub width: u32,
    pub height: u32,
    pub depth: u8,
    pub bpp: u8,
    pub pitch: u32,
}

impl Surface {
    pub fn from_pixmap(pixmap: &Pixmap) -> Option<Self> {
        let bo = pixmap.bo()?;
        Some(Self {
            width: pixmap.width(),
            height: pixmap.height(),
            depth: pixmap.depth(),
            bpp: pixmap.bpp(),
            pitch: bo.pitch(),
            bo,
        })
    }

    fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    fn cpp(&self) -> usize {
        (self.bpp as usize + 7) / 8
    }
}

#[derive(Debug, Clone)]
pub enum AccelOp {
    Solid {
        dst: Surface,
        rect: Rect,
        color: u32,
    },
    Copy {
        src: Surface,
        dst: Surface,
        src_x: i32,
        src_y: i32,
        dst_x: i32,
        dst_y: i32,
        width: u32,
        height: u32,
    },
}

/// A 2D engine that executes operations asynchronously
pub trait AccelBackend {
    fn name(&self) -> &'static str;

    fn check_solid(&self, dst: &Surface, alu: u8, planemask: u32) -> Result<()>;

    fn check_copy(&self, src: &Surface, dst: &Surface, alu: u8, planemask: u32) -> Result<()>;

    fn check_composite(
        &self,
        _op: u8,
        _src: &Surface,
        _mask: Option<&Surface>,
        _dst: &Surface,
    ) -> Result<()> {
        Err(Error::CapabilityMismatch("composite"))
    }

    /// Queue an operation
    fn submit(&mut self, op: AccelOp) -> Result<()>;

    /// Block until every queued operation has finished
    fn wait(&mut self) -> Result<()>;
}

/// CPU implementation of the plain copy raster op
#[derive(Debug, Default)]
pub struct SoftwareAccel;

impl SoftwareAccel {
    fn check_rop(alu: u8, planemask: u32) -> Result<()> {
        if alu != GX_COPY {
            return Err(Error::CapabilityMismatch("raster op other than copy"));
        }
        if planemask != FULL_PLANEMASK {
            return Err(Error::CapabilityMismatch("partial planemask"));
        }
        Ok(())
    }

    fn fill(dst: &Surface, rect: Rect, color: u32) -> Result<()> {
        let rect = rect.intersect(&dst.bounds());
        if rect.is_empty() {
            return Ok(());
        }
        let cpp = dst.cpp();
        let pixel = color.to_le_bytes();
        let mut access = dst.bo.cpu_access(Access::Write)?;
        let bytes = access.bytes_mut();

        for y in rect.y1..rect.y2 {
            let row = y as usize * dst.pitch as usize;
            for x in rect.x1..rect.x2 {
                let off = row + x as usize * cpp;
                bytes[off..off + cpp].copy_from_slice(&pixel[..cpp]);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn copy(
        src: &Surface,
        dst: &Surface,
        src_x: i32,
        src_y: i32,
        dst_x: i32,
        dst_y: i32,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if src.cpp() != dst.cpp() {
            return Err(Error::CapabilityMismatch("copy between different pixel sizes"));
        }
        // Clip both ends to their surfaces
        let src_rect = Rect::new(src_x, src_y, width, height).intersect(&src.bounds());
        let dst_rect = Rect::new(dst_x, dst_y, width, height).intersect(&dst.bounds());
        let x_off = (src_rect.x1 - src_x).max(dst_rect.x1 - dst_x);
        let y_off = (src_rect.y1 - src_y).max(dst_rect.y1 - dst_y);
        let w = (src_rect.x2 - src_x).min(dst_rect.x2 - dst_x) - x_off;
        let h = (src_rect.y2 - src_y).min(dst_rect.y2 - dst_y) - y_off;
        if src_rect.is_empty() || dst_rect.is_empty() || w <= 0 || h <= 0 {
            return Ok(());
        }

        let cpp = dst.cpp();
        let row_bytes = w as usize * cpp;
        let src_at = |row: i32| {
            (src_y + y_off + row) as usize * src.pitch as usize + (src_x + x_off) as usize * cpp
        };
        let dst_at = |row: i32| {
            (dst_y + y_off + row) as usize * dst.pitch as usize + (dst_x + x_off) as usize * cpp
        };

        let mut dst_access = dst.bo.cpu_access(Access::Write)?;
        if Bo::ptr_eq(&src.bo, &dst.bo) {
            let bytes = dst_access.bytes_mut();
            // Walk rows away from the overlap
            let rows: Box<dyn Iterator<Item = i32>> = if dst_y > src_y {
                Box::new((0..h).rev())
            } else {
                Box::new(0..h)
            };
            for row in rows {
                let from = src_at(row);
                bytes.copy_within(from..from + row_bytes, dst_at(row));
            }
        } else {
            let src_access = src.bo.cpu_access(Access::Read)?;
            let from_bytes = src_access.bytes();
            let to_bytes = dst_access.bytes_mut();
            for row in 0..h {
                let (from, to) = (src_at(row), dst_at(row));
                to_bytes[to..to + row_bytes].copy_from_slice(&from_bytes[from..from + row_bytes]);
            }
        }
        Ok(())
    }
}

impl AccelBackend for SoftwareAccel {
    fn name(&self) -> &'static str {
        "software"
    }

    fn check_solid(&self, _dst: &Surface, alu: u8, planemask: u32) -> Result<()> {
        Self::check_rop(alu, planemask)
    }

    fn check_copy(&self, _src: &Surface, _dst: &Surface, alu: u8, planemask: u32) -> Result<()> {
        Self::check_rop(alu, planemask)
    }

    fn submit(&mut self, op: AccelOp) -> Result<()> {
        match op {
            AccelOp::Solid { dst, rect, color } => Self::fill(&dst, rect, color),
            AccelOp::Copy {
                src,
                dst,
                src_x,
                src_y,
                dst_x,
                dst_y,
                width,
                height,
            } => Self::copy(&src, &dst, src_x, src_y, dst_x, dst_y, width, height),
        }
    }

    fn wait(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Dispatches operations between the blitter and the CPU
pub struct Exa {
    backend: Box<dyn AccelBackend>,
    software: SoftwareAccel,
}

impl fmt::Debug for Exa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exa").field("backend", &self.backend.name()).finish()
    }
}

impl Default for Exa {
    fn default() -> Self {
        Self::new(Box::new(SoftwareAccel))
    }
}

impl Exa {
    pub fn new(backend: Box<dyn AccelBackend>) -> Self {
        debug!("2D acceleration backend: {}", backend.name());
        Self {
            backend,
            software: SoftwareAccel,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Preconditions shared by every accelerated operation
    fn surface(pixmap: &Pixmap, planemask: u32) -> Result<Surface> {
        if planemask != FULL_PLANEMASK {
            return Err(Error::CapabilityMismatch("partial planemask"));
        }
        if pixmap.width() < ACCEL_MIN_SIZE || pixmap.height() < ACCEL_MIN_SIZE {
            return Err(Error::CapabilityMismatch("pixmap too small"));
        }
        if !matches!(pixmap.depth(), 24 | 32) {
            return Err(Error::CapabilityMismatch("depth other than 24 or 32"));
        }
        let surface =
            Surface::from_pixmap(pixmap).ok_or(Error::CapabilityMismatch("pixmap without bo"))?;
        // The root pixmap points at a single CRTC's scanout while flipping
        if !pixmap.has_fullsize_bo(&surface.bo) {
            return Err(Error::CapabilityMismatch("bo smaller than pixmap"));
        }
        Ok(surface)
    }

    fn is_small(width: u32, height: u32) -> bool {
        width < ACCEL_MIN_SIZE || height < ACCEL_MIN_SIZE
    }

    /// Start a solid fill of `pixmap` with `color`
    pub fn prepare_solid(
        &mut self,
        pixmap: &Pixmap,
        alu: u8,
        planemask: u32,
        color: u32,
    ) -> Result<SolidContext<'_>> {
        let dst = Self::surface(pixmap, planemask)?;
        // Small rectangles fall back to the CPU, which must cope as well
        self.software.check_solid(&dst, alu, planemask)?;
        self.backend.check_solid(&dst, alu, planemask)?;
        trace!("prepare solid [BO:{}] color: 0x{:08x}", dst.bo.handle(), color);
        Ok(SolidContext {
            exa: self,
            dst,
            color,
            finished: false,
        })
    }

    /// Start copies from `src` to `dst`
    pub fn prepare_copy(
        &mut self,
        src: &Pixmap,
        dst: &Pixmap,
        alu: u8,
        planemask: u32,
    ) -> Result<CopyContext<'_>> {
        let src = Self::surface(src, planemask)?;
        let dst = Self::surface(dst, planemask)?;
        self.software.check_copy(&src, &dst, alu, planemask)?;
        self.backend.check_copy(&src, &dst, alu, planemask)?;
        trace!("prepare copy [BO:{}] -> [BO:{}]", src.bo.handle(), dst.bo.handle());
        Ok(CopyContext {
            exa: self,
            src,
            dst,
            finished: false,
        })
    }

    /// Composite is only accelerated if the backend says so
    pub fn check_composite(
        &self,
        op: u8,
        src: &Pixmap,
        mask: Option<&Pixmap>,
        dst: &Pixmap,
    ) -> Result<()> {
        if mask.is_some() {
            return Err(Error::CapabilityMismatch("composite with mask"));
        }
        let src = Self::surface(src, FULL_PLANEMASK)?;
        let dst = Self::surface(dst, FULL_PLANEMASK)?;
        self.backend.check_composite(op, &src, None, &dst)
    }

    fn submit(&mut self, op: AccelOp, small: bool) -> Result<()> {
        if small {
            self.software.submit(op)
        } else {
            self.backend.submit(op)
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.backend.wait()
    }
}

pub struct SolidContext<'a> {
    exa: &'a mut Exa,
    dst: Surface,
    color: u32,
    finished: bool,
}

impl SolidContext<'_> {
    pub fn solid(&mut self, x1: i32, y1: i32, x2: i32, y2: i32) -> Result<()> {
        let rect = Rect { x1, y1, x2, y2 };
        if rect.is_empty() {
            return Ok(());
        }
        let small = Exa::is_small(rect.width(), rect.height());
        let op = AccelOp::Solid {
            dst: self.dst.clone(),
            rect,
            color: self.color,
        };
        self.exa.submit(op, small)
    }

    pub fn done(mut self) -> Result<()> {
        self.finished = true;
        self.exa.finish()
    }
}

impl Drop for SolidContext<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.exa.finish() {
                error!("solid fill did not complete: {}", e);
            }
        }
    }
}

pub struct CopyContext<'a> {
    exa: &'a mut Exa,
    src: Surface,
    dst: Surface,
    finished: bool,
}

impl CopyContext<'_> {
    #[allow(clippy::too_many_arguments)]
    pub fn copy(
        &mut self,
        src_x: i32,
        src_y: i32,
        dst_x: i32,
        dst_y: i32,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        let op = AccelOp::Copy {
            src: self.src.clone(),
            dst: self.dst.clone(),
            src_x,
            src_y,
            dst_x,
            dst_y,
            width,
            height,
        };
        self.exa.submit(op, Exa::is_small(width, height))
    }

    pub fn done(mut self) -> Result<()> {
        self.finished = true;
        self.exa.finish()
    }
}

impl Drop for CopyContext<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.exa.finish() {
                error!("copy did not complete: {}", e);
            }
        }
    }
}
