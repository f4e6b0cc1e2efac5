//! Per-CRTC scanout buffers
//!
//! In flip mode each enabled CRTC scans out of its own buffer, sized to the
//! CRTC's mode, which full-screen clients can swap with directly. A slot is
//! *valid* while its buffer holds the current contents of that part of the
//! screen; otherwise the root buffer does.

use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::bo::{Bo, Device};
use crate::crtc::CrtcState;
use crate::drawable::Drawable;
use crate::{Error, Result};

pub const MAX_SCANOUTS: usize = 3;

#[derive(Debug, Default)]
pub struct ScanoutSlot {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub valid: bool,
    bo: Option<Bo>,
}

impl ScanoutSlot {
    pub fn bo(&self) -> Option<&Bo> {
        self.bo.as_ref()
    }

    pub fn is_free(&self) -> bool {
        self.bo.is_none()
    }

    pub fn matches(&self, x: i32, y: i32, width: u32, height: u32) -> bool {
        !self.is_free()
            && self.x == x
            && self.y == y
            && self.width == width
            && self.height == height
    }
}

#[derive(Debug, Default)]
pub struct ScanoutRegistry {
    slots: [ScanoutSlot; MAX_SCANOUTS],
}

impl ScanoutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Occupied slots
    pub fn iter(&self) -> impl Iterator<Item = &ScanoutSlot> {
        self.slots.iter().filter(|s| !s.is_free())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ScanoutSlot> {
        self.slots.iter_mut().filter(|s| !s.is_free())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a reference to `bo` for `crtc` in the first free slot.
    /// The slot starts out invalid.
    pub fn add(&mut self, crtc: &CrtcState, bo: &Bo) -> Option<&mut ScanoutSlot> {
        debug_assert!(
            self.find_by_crtc(crtc).is_none(),
            "[CRTC:{}] scanout added twice",
            crtc.id
        );
        let slot = self.slots.iter_mut().find(|s| s.is_free())?;
        *slot = ScanoutSlot {
            x: crtc.x,
            y: crtc.y,
            width: crtc.width(),
            height: crtc.height(),
            valid: false,
            bo: Some(bo.reference()),
        };
        Some(slot)
    }

    pub fn find_by_geometry(&self, x: i32, y: i32, width: u32, height: u32) -> Option<&ScanoutSlot> {
        self.slots.iter().find(|s| s.matches(x, y, width, height))
    }

    pub fn find_by_geometry_mut(
        &mut self,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> Option<&mut ScanoutSlot> {
        self.slots.iter_mut().find(|s| s.matches(x, y, width, height))
    }

    pub fn find_by_crtc(&self, crtc: &CrtcState) -> Option<&ScanoutSlot> {
        self.find_by_geometry(crtc.x, crtc.y, crtc.width(), crtc.height())
    }

    pub fn find_by_drawable(&self, draw: &Drawable) -> Option<&ScanoutSlot> {
        self.find_by_geometry(draw.x, draw.y, draw.width, draw.height)
    }

    /// Re-point the slot at (`x`, `y`) with `bo`'s size to `bo`.
    /// Nothing happens if no such slot exists.
    pub fn set(&mut self, x: i32, y: i32, bo: &Bo) {
        if let Some(slot) = self.find_by_geometry_mut(x, y, bo.width(), bo.height()) {
            slot.bo = Some(bo.reference());
        }
    }

    pub fn invalidate_all(&mut self) {
        for slot in self.iter_mut() {
            slot.valid = false;
        }
    }

    /// Mark the slot holding `bo` valid. Returns false if no slot holds it.
    pub fn validate(&mut self, bo: &Bo) -> bool {
        match self
            .iter_mut()
            .find(|s| s.bo.as_ref().is_some_and(|b| Bo::ptr_eq(b, bo)))
        {
            Some(slot) => {
                slot.valid = true;
                true
            }
            None => false,
        }
    }

    pub(crate) fn validity(&self) -> [bool; MAX_SCANOUTS] {
        std::array::from_fn(|i| self.slots[i].valid)
    }

    pub(crate) fn restore_validity(&mut self, saved: [bool; MAX_SCANOUTS]) {
        for (slot, valid) in self.slots.iter_mut().zip(saved) {
            slot.valid = valid;
        }
    }

    /// Release every slot
    pub fn clear(&mut self) {
        self.slots = Default::default();
    }

    /// Rebuild the slots from the enabled CRTCs.
    ///
    /// Buffers of CRTCs whose geometry did not change are kept along with
    /// their validity; other CRTCs get a new, invalid buffer. Returns true
    /// if a previously allocated buffer was dropped.
    pub fn refresh(
        &mut self,
        crtcs: &[CrtcState],
        device: &Rc<Device>,
        depth: u8,
        bpp: u8,
    ) -> Result<bool> {
        let mut old = std::mem::take(&mut self.slots);

        for crtc in crtcs.iter().filter(|c| c.is_active()) {
            // Mirrored CRTCs share one buffer
            if self.find_by_crtc(crtc).is_some() {
                continue;
            }

            let kept = old
                .iter_mut()
                .find(|s| s.matches(crtc.x, crtc.y, crtc.width(), crtc.height()))
                .and_then(|s| {
                    let valid = s.valid;
                    s.bo.take().map(|bo| (bo, valid))
                });

            let (bo, valid) = match kept {
                Some(kept) => kept,
                None => {
                    let bo = device.create_bo(crtc.width(), crtc.height(), depth, bpp)?;
                    debug!(
                        "[CRTC:{}] new scanout [FB:{}] {}x{}",
                        crtc.id,
                        bo.fb_id(),
                        bo.width(),
                        bo.height()
                    );
                    (bo, false)
                }
            };

            let slot = self.add(crtc, &bo).ok_or(Error::ScanoutsExhausted)?;
            slot.valid = valid;
        }

        let mut resized = false;
        for slot in old.iter().filter(|s| !s.is_free()) {
            info!(
                "Dropping scanout {}x{} at {},{}",
                slot.width, slot.height, slot.x, slot.y
            );
            resized = true;
        }
        if self.is_empty() {
            warn!("No active CRTCs, no scanouts");
        }
        Ok(resized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bo::tests::test_device;
    use crate::kms::ModeInfo;

    fn crtc(id: u32, x: i32, width: u16, height: u16) -> CrtcState {
        let mut crtc = CrtcState::new(id);
        crtc.enabled = true;
        crtc.x = x;
        crtc.mode = ModeInfo::new(width, height, 60);
        crtc
    }

    #[test]
    fn test_add_until_full() {
        let (device, _allocator, _kms) = test_device();
        let mut scanouts = ScanoutRegistry::new();
        let bo = device.create_bo(32, 32, 24, 32).unwrap();

        for i in 0..MAX_SCANOUTS {
            let slot = scanouts.add(&crtc(10 + i as u32, 32 * i as i32, 32, 32), &bo).unwrap();
            assert!(!slot.valid);
        }
        assert!(scanouts.add(&crtc(20, 200, 32, 32), &bo).is_none());
        assert_eq!(bo.refcount(), 1 + MAX_SCANOUTS);

        scanouts.clear();
        assert_eq!(bo.refcount(), 1);
    }

    #[test]
    fn test_lookups() {
        let (device, _allocator, _kms) = test_device();
        let mut scanouts = ScanoutRegistry::new();
        let left = crtc(10, 0, 64, 48);
        let right = crtc(11, 64, 32, 48);
        let bo = device.create_bo(64, 48, 24, 32).unwrap();
        scanouts.add(&left, &bo).unwrap();

        assert!(scanouts.find_by_crtc(&left).is_some());
        assert!(scanouts.find_by_crtc(&right).is_none());
        assert!(scanouts.find_by_geometry(0, 0, 64, 48).is_some());
        // Free slots never match, even a zero-sized query
        assert!(scanouts.find_by_geometry(0, 0, 0, 0).is_none());
    }

    #[test]
    fn test_set_replaces_matching_slot_only() {
        let (device, _allocator, _kms) = test_device();
        let mut scanouts = ScanoutRegistry::new();
        let first = device.create_bo(64, 48, 24, 32).unwrap();
        let second = device.create_bo(64, 48, 24, 32).unwrap();
        let other_size = device.create_bo(32, 48, 24, 32).unwrap();
        scanouts.add(&crtc(10, 0, 64, 48), &first).unwrap();

        scanouts.set(0, 0, &other_size);
        assert!(Bo::ptr_eq(scanouts.find_by_geometry(0, 0, 64, 48).unwrap().bo().unwrap(), &first));

        scanouts.set(0, 0, &second);
        assert!(Bo::ptr_eq(scanouts.find_by_geometry(0, 0, 64, 48).unwrap().bo().unwrap(), &second));
        assert_eq!(first.refcount(), 1);
        assert_eq!(second.refcount(), 2);
    }

    #[test]
    fn test_validate_and_invalidate() {
        let (device, _allocator, _kms) = test_device();
        let mut scanouts = ScanoutRegistry::new();
        let bo = device.create_bo(64, 48, 24, 32).unwrap();
        let stranger = device.create_bo(64, 48, 24, 32).unwrap();
        scanouts.add(&crtc(10, 0, 64, 48), &bo).unwrap();

        assert!(!scanouts.validate(&stranger));
        assert!(scanouts.validate(&bo));
        assert!(scanouts.iter().all(|s| s.valid));
        scanouts.invalidate_all();
        assert!(scanouts.iter().all(|s| !s.valid));
    }

    #[test]
    fn test_refresh_keeps_unchanged_crtcs() {
        let (device, allocator, _kms) = test_device();
        let mut scanouts = ScanoutRegistry::new();
        let crtcs = vec![crtc(10, 0, 640, 480), crtc(11, 640, 320, 240)];

        assert!(!scanouts.refresh(&crtcs, &device, 24, 32).unwrap());
        assert_eq!(scanouts.len(), 2);
        assert_eq!(allocator.stats().live, 2);

        let kept = scanouts.find_by_crtc(&crtcs[0]).unwrap().bo().unwrap().clone();
        scanouts.validate(&kept);

        assert!(!scanouts.refresh(&crtcs, &device, 24, 32).unwrap());
        let slot = scanouts.find_by_crtc(&crtcs[0]).unwrap();
        assert!(Bo::ptr_eq(slot.bo().unwrap(), &kept));
        assert!(slot.valid);
        assert_eq!(allocator.stats().allocated, 2);
    }

    #[test]
    fn test_refresh_after_shrink() {
        let (device, allocator, _kms) = test_device();
        let mut scanouts = ScanoutRegistry::new();
        let mut crtcs = vec![crtc(10, 0, 640, 480), crtc(11, 640, 320, 240)];
        scanouts.refresh(&crtcs, &device, 24, 32).unwrap();

        crtcs[1].enabled = false;
        assert!(scanouts.refresh(&crtcs, &device, 24, 32).unwrap());
        assert_eq!(scanouts.len(), 1);
        assert_eq!(allocator.stats().live, 1);
    }

    #[test]
    fn test_refresh_mode_change_allocates() {
        let (device, allocator, _kms) = test_device();
        let mut scanouts = ScanoutRegistry::new();
        let mut crtcs = vec![crtc(10, 0, 640, 480)];
        scanouts.refresh(&crtcs, &device, 24, 32).unwrap();

        crtcs[0].mode = ModeInfo::new(320, 240, 60);
        assert!(scanouts.refresh(&crtcs, &device, 24, 32).unwrap());
        let slot = scanouts.find_by_crtc(&crtcs[0]).unwrap();
        assert!(!slot.valid);
        assert_eq!(slot.bo().unwrap().width(), 320);
        assert_eq!(allocator.stats().allocated, 2);
        assert_eq!(allocator.stats().live, 1);
    }

    #[test]
    fn test_refresh_shares_mirrored_crtcs() {
        let (device, _allocator, _kms) = test_device();
        let mut scanouts = ScanoutRegistry::new();
        let crtcs = vec![crtc(10, 0, 640, 480), crtc(11, 0, 640, 480)];
        scanouts.refresh(&crtcs, &device, 24, 32).unwrap();
        assert_eq!(scanouts.len(), 1);
    }

    #[test]
    fn test_refresh_allocation_failure() {
        let (device, allocator, _kms) = test_device();
        let mut scanouts = ScanoutRegistry::new();
        allocator.fail_next_allocations(1);
        assert!(scanouts.refresh(&[crtc(10, 0, 64, 64)], &device, 24, 32).is_err());
        assert!(scanouts.is_empty());
    }
}
