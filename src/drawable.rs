//! Drawables as seen by the swap path
//!
//! The host owns windows and their clip lists; this is the slice of that
//! state the driver needs to decide whether a swap can flip.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::pixmap::Pixmap;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

fn next_serial() -> u64 {
    NEXT_SERIAL.fetch_add(1, Ordering::Relaxed)
}

/// A box with exclusive lower-right corner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x1: x,
            y1: y,
            x2: x + width as i32,
            y2: y + height as i32,
        }
    }

    pub fn width(&self) -> u32 {
        (self.x2 - self.x1).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y2 - self.y1).max(0) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Intersection, empty if the boxes do not overlap
    pub fn intersect(&self, other: &Rect) -> Rect {
        let r = Rect {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        };
        if r.is_empty() {
            Rect::default()
        } else {
            r
        }
    }
}

pub type DrawableId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawableKind {
    Window,
    Pixmap,
}

#[derive(Debug, Clone)]
pub struct Drawable {
    pub id: DrawableId,
    pub kind: DrawableKind,
    /// Position on the root window
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub depth: u8,
    /// Visible area in screen coordinates
    pub clip: Vec<Rect>,
    /// Changes whenever clients must re-fetch their buffers
    pub serial: u64,
    /// Pixmap the drawable renders into
    pub pixmap: Pixmap,
}

impl Drawable {
    /// An unobscured window backed by `pixmap`
    pub fn window(id: DrawableId, x: i32, y: i32, width: u32, height: u32, pixmap: Pixmap) -> Self {
        Self {
            id,
            kind: DrawableKind::Window,
            x,
            y,
            width,
            height,
            depth: pixmap.depth(),
            clip: vec![Rect::new(x, y, width, height)],
            serial: next_serial(),
            pixmap,
        }
    }

    pub fn pixmap(id: DrawableId, pixmap: Pixmap) -> Self {
        let (width, height) = (pixmap.width(), pixmap.height());
        Self {
            id,
            kind: DrawableKind::Pixmap,
            x: 0,
            y: 0,
            width,
            height,
            depth: pixmap.depth(),
            clip: vec![Rect::new(0, 0, width, height)],
            serial: next_serial(),
            pixmap,
        }
    }

    pub fn is_window(&self) -> bool {
        self.kind == DrawableKind::Window
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }

    /// Visible as a single box covering the whole drawable
    pub fn is_unobscured(&self) -> bool {
        match self.clip.as_slice() {
            [only] => only.width() == self.width && only.height() == self.height,
            _ => false,
        }
    }

    /// Force clients to re-fetch their buffers
    pub fn bump_serial(&mut self) {
        self.serial = next_serial();
    }
}
