//! CPU pixel copies between placed buffers
//!
//! Both buffers are positioned in a shared coordinate space (root window
//! coordinates) and only their overlap is copied.

use tracing::trace;

use crate::alloc::Access;
use crate::bo::Bo;
use crate::{Error, Result};

/// Where a buffer sits and how its rows are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    /// Bytes per pixel
    pub cpp: u32,
}

impl Placement {
    pub fn of(bo: &Bo, x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            width: bo.width(),
            height: bo.height(),
            pitch: bo.pitch(),
            cpp: bo.bytes_per_pixel(),
        }
    }
}

/// Intersection of two placements, as offsets into each buffer
struct Overlap {
    src_x0: u32,
    src_y0: u32,
    dst_x0: u32,
    dst_y0: u32,
    width: u32,
    height: u32,
}

impl Overlap {
    fn of(src_at: &Placement, dst_at: &Placement) -> Option<Self> {
        let (sx, sy) = (src_at.x as i64, src_at.y as i64);
        let (dx, dy) = (dst_at.x as i64, dst_at.y as i64);

        let src_x0 = (dx - sx).max(0);
        let src_y0 = (dy - sy).max(0);
        let dst_x0 = (sx - dx).max(0);
        let dst_y0 = (sy - dy).max(0);

        let width = (src_at.width as i64 - src_x0).min(dst_at.width as i64 - dst_x0);
        let height = (src_at.height as i64 - src_y0).min(dst_at.height as i64 - dst_y0);
        if width <= 0 || height <= 0 {
            return None;
        }
        Some(Self {
            src_x0: src_x0 as u32,
            src_y0: src_y0 as u32,
            dst_x0: dst_x0 as u32,
            dst_y0: dst_y0 as u32,
            width: width as u32,
            height: height as u32,
        })
    }
}

/// Copy the overlap of `src` and `dst` row by row.
///
/// Returns the size of the copied area, `None` when the buffers do not
/// overlap. Panics if the two placements use a different pixel size.
pub fn copy_region(
    src: &[u8],
    src_at: &Placement,
    dst: &mut [u8],
    dst_at: &Placement,
) -> Option<(u32, u32)> {
    assert_eq!(src_at.cpp, dst_at.cpp, "copy between different pixel sizes");

    let Overlap {
        src_x0,
        src_y0,
        dst_x0,
        dst_y0,
        width,
        height,
    } = Overlap::of(src_at, dst_at)?;

    let cpp = src_at.cpp as usize;
    let row_bytes = width as usize * cpp;
    let mut src_off = src_y0 as usize * src_at.pitch as usize + src_x0 as usize * cpp;
    let mut dst_off = dst_y0 as usize * dst_at.pitch as usize + dst_x0 as usize * cpp;

    for _ in 0..height {
        dst[dst_off..dst_off + row_bytes].copy_from_slice(&src[src_off..src_off + row_bytes]);
        src_off += src_at.pitch as usize;
        dst_off += dst_at.pitch as usize;
    }

    trace!(
        "copied {}x{} from +{},{} to +{},{}",
        width,
        height,
        src_x0,
        src_y0,
        dst_x0,
        dst_y0
    );
    Some((width, height))
}

/// Copy `src`, placed at (`src_x`, `src_y`), into `dst`, placed at
/// (`dst_x`, `dst_y`). The destination is locked for writing before the
/// source is locked for reading.
pub fn copy_bo(src: &Bo, src_x: i32, src_y: i32, dst: &Bo, dst_x: i32, dst_y: i32) -> Result<()> {
    if src.bpp() != dst.bpp() {
        return Err(Error::CapabilityMismatch("copy between buffers of different bpp"));
    }

    let src_at = Placement::of(src, src_x, src_y);
    let dst_at = Placement::of(dst, dst_x, dst_y);
    if Overlap::of(&src_at, &dst_at).is_none() {
        trace!("[BO:{}] -> [BO:{}] do not overlap", src.handle(), dst.handle());
        return Ok(());
    }
    let mut dst_access = dst.cpu_access(Access::Write)?;

    if Bo::ptr_eq(src, dst) {
        let snapshot = dst_access.bytes().to_vec();
        copy_region(&snapshot, &src_at, dst_access.bytes_mut(), &dst_at);
    } else {
        let src_access = src.cpu_access(Access::Read)?;
        copy_region(src_access.bytes(), &src_at, dst_access.bytes_mut(), &dst_at);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bo::tests::test_device;

    fn placement(x: i32, y: i32, width: u32, height: u32, pitch: u32) -> Placement {
        Placement { x, y, width, height, pitch, cpp: 4 }
    }

    fn fill(bo: &Bo, f: impl Fn(u32, u32) -> u32) {
        let mut access = bo.cpu_access(Access::Write).unwrap();
        let pitch = bo.pitch() as usize;
        let bytes = access.bytes_mut();
        for y in 0..bo.height() {
            for x in 0..bo.width() {
                let off = y as usize * pitch + x as usize * 4;
                bytes[off..off + 4].copy_from_slice(&f(x, y).to_le_bytes());
            }
        }
    }

    fn pixel(bo: &Bo, x: u32, y: u32) -> u32 {
        let access = bo.cpu_access(Access::Read).unwrap();
        let off = y as usize * bo.pitch() as usize + x as usize * 4;
        u32::from_le_bytes(access.bytes()[off..off + 4].try_into().unwrap())
    }

    #[test]
    fn test_disjoint_is_noop() {
        let src = vec![0xffu8; 16 * 4];
        let mut dst = vec![0u8; 16 * 4];
        let copied = copy_region(
            &src,
            &placement(0, 0, 4, 4, 16),
            &mut dst,
            &placement(4, 0, 4, 4, 16),
        );
        assert_eq!(copied, None);
        assert!(dst.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_partial_overlap_with_different_pitches() {
        // 4x4 source at (2, 1), 4x4 destination at (0, 0)
        let src: Vec<u8> = (0..(32 * 4) as u32).map(|i| i as u8).collect();
        let mut dst = vec![0u8; 16 * 4];
        let copied = copy_region(
            &src,
            &placement(2, 1, 4, 4, 32),
            &mut dst,
            &placement(0, 0, 4, 4, 16),
        );
        assert_eq!(copied, Some((2, 3)));

        // dst (2, 1) receives src (0, 0)
        assert_eq!(&dst[16 + 8..16 + 16], &src[0..8]);
        // dst (2, 3) receives src (0, 2)
        assert_eq!(&dst[48 + 8..48 + 16], &src[64..72]);
        // Row 0 untouched
        assert!(dst[0..16].iter().all(|b| *b == 0));
    }

    #[test]
    #[should_panic(expected = "different pixel sizes")]
    fn test_pixel_size_mismatch_panics() {
        let src = vec![0u8; 64];
        let mut dst = vec![0u8; 64];
        let mut dst_at = placement(0, 0, 4, 4, 16);
        dst_at.cpp = 2;
        copy_region(&src, &placement(0, 0, 4, 4, 16), &mut dst, &dst_at);
    }

    #[test]
    fn test_root_round_trip() {
        let (device, _allocator, _kms) = test_device();
        let root = device.create_bo(200, 100, 24, 32).unwrap();
        let scanout = device.create_bo(100, 100, 24, 32).unwrap();
        fill(&root, |x, y| (y << 16) | x);

        // Root -> scanout at (100, 0), scanout cleared on root, then back
        copy_bo(&root, 0, 0, &scanout, 100, 0).unwrap();
        assert_eq!(pixel(&scanout, 0, 0), 100);
        assert_eq!(pixel(&scanout, 99, 99), (99 << 16) | 199);

        fill(&root, |_, _| 0);
        copy_bo(&scanout, 100, 0, &root, 0, 0).unwrap();
        assert_eq!(pixel(&root, 150, 50), (50 << 16) | 150);
        assert_eq!(pixel(&root, 50, 50), 0);

        assert!(!root.is_acquired());
        assert!(!scanout.is_acquired());
        assert!(root.dirty());
    }

    #[test]
    fn test_copy_within_same_bo() {
        let (device, _allocator, _kms) = test_device();
        let bo = device.create_bo(8, 8, 24, 32).unwrap();
        fill(&bo, |x, y| y * 8 + x);
        copy_bo(&bo, 2, 0, &bo, 0, 0).unwrap();
        assert_eq!(pixel(&bo, 2, 0), 0);
        assert_eq!(pixel(&bo, 7, 7), 7 * 8 + 5);
        assert_eq!(pixel(&bo, 1, 0), 1);
    }

    #[test]
    fn test_bpp_mismatch_rejected() {
        let (device, _allocator, _kms) = test_device();
        let a = device.create_bo(8, 8, 24, 32).unwrap();
        let b = device.create_bo(8, 8, 16, 16).unwrap();
        assert!(copy_bo(&a, 0, 0, &b, 0, 0).unwrap_err().is_capability_mismatch());
    }

    #[test]
    fn test_disjoint_bos_are_not_touched() {
        let (device, allocator, _kms) = test_device();
        let a = device.create_bo(16, 16, 24, 32).unwrap();
        let b = device.create_bo(16, 16, 24, 32).unwrap();
        let before = allocator.stats();

        copy_bo(&a, 0, 0, &b, 100, 0).unwrap();
        assert!(!b.dirty());
        assert!(!b.is_acquired());
        assert_eq!(allocator.stats().cpu_prepares, before.cpu_prepares);
        assert_eq!(allocator.stats().cpu_finishes, before.cpu_finishes);

        copy_bo(&a, 0, 0, &b, 8, 8).unwrap();
        assert!(b.dirty());
    }
}
