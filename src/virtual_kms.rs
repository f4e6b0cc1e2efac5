//! Virtual KMS device
//!
//! An in-process mode-setting device that implements [`Kms`] without a
//! kernel driver. It keeps a framebuffer table, per-CRTC scanout state and a
//! queue of page-flip events, and lets callers inject failures.
//!
//! # DRM Object IDs
//! We use the following object ID scheme:
//! - Connectors: 1+
//! - Encoders: 5+
//! - CRTCs: 10+
//! - Framebuffers: 100+
//!
//! Head `n` is connector `1 + n` wired to CRTC `10 + n`.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, info, warn};

use crate::kms::{ConnectorInfo, Connection, DrmResources, Kms, ModeInfo, PageFlipEvent};
use crate::{Error, Result};

const CONNECTOR_ID_BASE: u32 = 1;
const ENCODER_ID_BASE: u32 = 5;
const CRTC_ID_BASE: u32 = 10;
const FB_ID_BASE: u32 = 100;
const DPMS_PROPERTY_ID: u32 = 2;

/// DRM framebuffer info
#[derive(Debug, Clone)]
pub struct FramebufferInfo {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u8,
    pub depth: u8,
    pub format: u32,
    pub handle: u32,
}

/// One display head: a connector and the CRTC that drives it
#[derive(Debug, Clone)]
pub struct VirtualHead {
    pub connection: Connection,
    pub modes: Vec<ModeInfo>,
    pub width_mm: u32,
    pub height_mm: u32,
}

impl VirtualHead {
    /// A connected head with a single preferred mode
    pub fn connected(width: u16, height: u16, refresh: u32) -> Self {
        Self {
            connection: Connection::Connected,
            modes: vec![ModeInfo::new(width, height, refresh).preferred()],
            // Approximate for a ~96 DPI monitor
            width_mm: (width as f32 * 25.4 / 96.0) as u32,
            height_mm: (height as f32 * 25.4 / 96.0) as u32,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connection: Connection::Disconnected,
            modes: Vec::new(),
            width_mm: 0,
            height_mm: 0,
        }
    }
}

/// Scanout state of a virtual CRTC
#[derive(Debug, Clone, Default)]
pub struct CrtcInfo {
    pub id: u32,
    pub fb_id: u32,
    pub x: i32,
    pub y: i32,
    pub mode: Option<ModeInfo>,
    pub connectors: Vec<u32>,
    pub cursor_handle: u32,
    pub cursor_x: i32,
    pub cursor_y: i32,
    /// Flip queued but not yet delivered
    pub flip_pending: bool,
}

impl CrtcInfo {
    pub fn is_active(&self) -> bool {
        self.fb_id != 0 && self.mode.is_some()
    }
}

/// Call counters exposed for tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KmsStats {
    pub set_crtc: usize,
    pub page_flips: usize,
    pub events_delivered: usize,
}

#[derive(Default)]
struct FailureInjection {
    set_crtc: HashSet<u32>,
    page_flip: HashSet<u32>,
    framebuffers: usize,
}

/// A virtual DRM device
pub struct VirtualKms {
    heads: RefCell<Vec<VirtualHead>>,
    crtcs: RefCell<Vec<CrtcInfo>>,
    dpms: RefCell<HashMap<u32, u64>>,
    // Framebuffer tracking
    fb_counter: Cell<u32>,
    framebuffers: RefCell<HashMap<u32, FramebufferInfo>>,
    // Flip completion
    events: RefCell<VecDeque<PageFlipEvent>>,
    sequence: Cell<u32>,
    master: Cell<bool>,
    failures: RefCell<FailureInjection>,
    stats: Cell<KmsStats>,
}

impl VirtualKms {
    pub fn new(heads: Vec<VirtualHead>) -> Self {
        info!("Creating VirtualKms with {} heads", heads.len());

        let crtcs = (0..heads.len() as u32)
            .map(|i| CrtcInfo {
                id: CRTC_ID_BASE + i,
                ..Default::default()
            })
            .collect();

        Self {
            heads: RefCell::new(heads),
            crtcs: RefCell::new(crtcs),
            dpms: RefCell::new(HashMap::new()),
            fb_counter: Cell::new(FB_ID_BASE),
            framebuffers: RefCell::new(HashMap::new()),
            events: RefCell::new(VecDeque::new()),
            sequence: Cell::new(0),
            master: Cell::new(false),
            failures: RefCell::new(FailureInjection::default()),
            stats: Cell::new(KmsStats::default()),
        }
    }

    /// Get framebuffer info
    pub fn framebuffer(&self, fb_id: u32) -> Option<FramebufferInfo> {
        self.framebuffers.borrow().get(&fb_id).cloned()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.borrow().len()
    }

    pub fn crtc(&self, crtc_id: u32) -> Option<CrtcInfo> {
        self.crtcs.borrow().iter().find(|c| c.id == crtc_id).cloned()
    }

    /// Framebuffer currently scanned out by a CRTC (0 when off)
    pub fn scanout_fb(&self, crtc_id: u32) -> u32 {
        self.crtc(crtc_id).map(|c| c.fb_id).unwrap_or(0)
    }

    pub fn pending_events(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn dpms_state(&self, connector_id: u32) -> Option<u64> {
        self.dpms.borrow().get(&connector_id).copied()
    }

    pub fn is_master(&self) -> bool {
        self.master.get()
    }

    pub fn stats(&self) -> KmsStats {
        self.stats.get()
    }

    /// Make `set_crtc` on `crtc_id` fail until cleared
    pub fn fail_set_crtc(&self, crtc_id: u32, fail: bool) {
        let mut failures = self.failures.borrow_mut();
        if fail {
            failures.set_crtc.insert(crtc_id);
        } else {
            failures.set_crtc.remove(&crtc_id);
        }
    }

    /// Make `page_flip` on `crtc_id` fail until cleared
    pub fn fail_page_flip(&self, crtc_id: u32, fail: bool) {
        let mut failures = self.failures.borrow_mut();
        if fail {
            failures.page_flip.insert(crtc_id);
        } else {
            failures.page_flip.remove(&crtc_id);
        }
    }

    /// Make the next `count` framebuffer creations fail
    pub fn fail_next_framebuffers(&self, count: usize) {
        self.failures.borrow_mut().framebuffers = count;
    }

    /// Simulate a hot-plug on head `index`
    pub fn replug(&self, index: usize, head: VirtualHead) {
        if let Some(slot) = self.heads.borrow_mut().get_mut(index) {
            info!(
                "[CONNECTOR:{}] hotplug: {:?}",
                CONNECTOR_ID_BASE + index as u32,
                head.connection
            );
            *slot = head;
        }
    }

    fn head_index(&self, connector_id: u32) -> Option<usize> {
        let index = connector_id.checked_sub(CONNECTOR_ID_BASE)? as usize;
        (index < self.heads.borrow().len()).then_some(index)
    }

    fn update_stats(&self, f: impl FnOnce(&mut KmsStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    fn insert_framebuffer(&self, mut info: FramebufferInfo) -> Result<u32> {
        {
            let mut failures = self.failures.borrow_mut();
            if failures.framebuffers > 0 {
                failures.framebuffers -= 1;
                return Err(Error::Ioctl(format!(
                    "AddFB for handle {} failed: ENOMEM",
                    info.handle
                )));
            }
        }
        if info.width == 0 || info.height == 0 || info.pitch == 0 {
            return Err(Error::Ioctl(format!(
                "AddFB {}x{} pitch {}: EINVAL",
                info.width, info.height, info.pitch
            )));
        }

        let fb_id = self.fb_counter.get();
        self.fb_counter.set(fb_id + 1);
        info.id = fb_id;

        debug!(
            "[FB:{}] created {}x{} pitch: {} handle: {}",
            fb_id, info.width, info.height, info.pitch, info.handle
        );
        self.framebuffers.borrow_mut().insert(fb_id, info);
        Ok(fb_id)
    }

    fn with_crtc<T>(&self, crtc_id: u32, f: impl FnOnce(&mut CrtcInfo) -> Result<T>) -> Result<T> {
        let mut crtcs = self.crtcs.borrow_mut();
        let crtc = crtcs
            .iter_mut()
            .find(|c| c.id == crtc_id)
            .ok_or_else(|| Error::Ioctl(format!("[CRTC:{}] no such CRTC", crtc_id)))?;
        f(crtc)
    }
}

impl Kms for VirtualKms {
    fn resources(&self) -> Result<DrmResources> {
        let count = self.heads.borrow().len() as u32;
        Ok(DrmResources {
            min_width: 1,
            max_width: 8192,
            min_height: 1,
            max_height: 8192,
            connectors: (0..count).map(|i| CONNECTOR_ID_BASE + i).collect(),
            crtcs: (0..count).map(|i| CRTC_ID_BASE + i).collect(),
            encoders: (0..count).map(|i| ENCODER_ID_BASE + i).collect(),
            fbs: self.framebuffers.borrow().keys().cloned().collect(),
        })
    }

    fn connector(&self, connector_id: u32) -> Result<ConnectorInfo> {
        let index = self
            .head_index(connector_id)
            .ok_or_else(|| Error::Ioctl(format!("[CONNECTOR:{}] no such connector", connector_id)))?;
        let heads = self.heads.borrow();
        let head = &heads[index];
        Ok(ConnectorInfo {
            id: connector_id,
            connection: head.connection,
            modes: head.modes.clone(),
            possible_crtcs: vec![CRTC_ID_BASE + index as u32],
            dpms_property: Some(DPMS_PROPERTY_ID),
            width_mm: head.width_mm,
            height_mm: head.height_mm,
        })
    }

    fn add_framebuffer(
        &self,
        width: u32,
        height: u32,
        depth: u8,
        bpp: u8,
        pitch: u32,
        handle: u32,
    ) -> Result<u32> {
        self.insert_framebuffer(FramebufferInfo {
            id: 0,
            width,
            height,
            pitch,
            bpp,
            depth,
            format: 0,
            handle,
        })
    }

    fn add_framebuffer2(
        &self,
        width: u32,
        height: u32,
        format: u32,
        pitch: u32,
        handle: u32,
    ) -> Result<u32> {
        self.insert_framebuffer(FramebufferInfo {
            id: 0,
            width,
            height,
            pitch,
            bpp: 32,
            depth: 0,
            format,
            handle,
        })
    }

    fn remove_framebuffer(&self, fb_id: u32) -> Result<()> {
        if self.framebuffers.borrow_mut().remove(&fb_id).is_none() {
            return Err(Error::Ioctl(format!("[FB:{}] not found", fb_id)));
        }
        // The kernel turns off any CRTC still scanning out a removed fb
        for crtc in self.crtcs.borrow_mut().iter_mut() {
            if crtc.fb_id == fb_id {
                warn!("[CRTC:{}] [FB:{}] removed while scanned out", crtc.id, fb_id);
                crtc.fb_id = 0;
                crtc.mode = None;
            }
        }
        debug!("[FB:{}] removed", fb_id);
        Ok(())
    }

    fn set_crtc(
        &self,
        crtc_id: u32,
        fb_id: u32,
        x: i32,
        y: i32,
        connectors: &[u32],
        mode: &ModeInfo,
    ) -> Result<()> {
        self.update_stats(|s| s.set_crtc += 1);
        if self.failures.borrow().set_crtc.contains(&crtc_id) {
            return Err(Error::Ioctl(format!("[CRTC:{}] SetCrtc failed: EINVAL", crtc_id)));
        }
        let fb = self
            .framebuffer(fb_id)
            .ok_or_else(|| Error::Ioctl(format!("[CRTC:{}] [FB:{}] not found", crtc_id, fb_id)))?;
        if connectors.is_empty() {
            return Err(Error::Ioctl(format!("[CRTC:{}] no connectors", crtc_id)));
        }
        if x < 0
            || y < 0
            || x as u32 + mode.width() > fb.width
            || y as u32 + mode.height() > fb.height
        {
            return Err(Error::Ioctl(format!(
                "[CRTC:{}] {} at {},{} exceeds [FB:{}] {}x{}",
                crtc_id, mode.name, x, y, fb_id, fb.width, fb.height
            )));
        }

        self.with_crtc(crtc_id, |crtc| {
            crtc.fb_id = fb_id;
            crtc.x = x;
            crtc.y = y;
            crtc.mode = Some(mode.clone());
            crtc.connectors = connectors.to_vec();
            Ok(())
        })?;
        debug!("[CRTC:{}] [FB:{}] {} at {},{}", crtc_id, fb_id, mode.name, x, y);
        Ok(())
    }

    fn disable_crtc(&self, crtc_id: u32) -> Result<()> {
        self.with_crtc(crtc_id, |crtc| {
            crtc.fb_id = 0;
            crtc.mode = None;
            crtc.connectors.clear();
            Ok(())
        })?;
        debug!("[CRTC:{}] disabled", crtc_id);
        Ok(())
    }

    fn page_flip(&self, crtc_id: u32, fb_id: u32, event: Option<u64>) -> Result<()> {
        self.update_stats(|s| s.page_flips += 1);
        if self.failures.borrow().page_flip.contains(&crtc_id) {
            return Err(Error::Ioctl(format!("[CRTC:{}] page flip failed: EINVAL", crtc_id)));
        }
        let fb = self
            .framebuffer(fb_id)
            .ok_or_else(|| Error::Ioctl(format!("[FB:{}] not found", fb_id)))?;

        self.with_crtc(crtc_id, |crtc| {
            if !crtc.is_active() {
                return Err(Error::Ioctl(format!("[CRTC:{}] page flip on inactive CRTC", crtc_id)));
            }
            if crtc.flip_pending {
                return Err(Error::Ioctl(format!("[CRTC:{}] page flip: EBUSY", crtc_id)));
            }
            crtc.fb_id = fb_id;
            crtc.flip_pending = event.is_some();
            Ok(())
        })?;

        debug!("[CRTC:{}] page flip to [FB:{}] ({}x{})", crtc_id, fb_id, fb.width, fb.height);

        if let Some(cookie) = event {
            let sequence = self.sequence.get() + 1;
            self.sequence.set(sequence);
            self.events.borrow_mut().push_back(PageFlipEvent {
                crtc_id,
                sequence,
                tv_sec: sequence / 60,
                tv_usec: (sequence % 60) * 16_666,
                cookie,
            });
        }
        Ok(())
    }

    fn wait_for_event(&self) -> Result<Vec<PageFlipEvent>> {
        let events: Vec<PageFlipEvent> = self.events.borrow_mut().drain(..).collect();
        if events.is_empty() {
            // A real device would block here forever
            return Err(Error::Ioctl("wait for event: no page flip pending".into()));
        }
        for crtc in self.crtcs.borrow_mut().iter_mut() {
            if events.iter().any(|e| e.crtc_id == crtc.id) {
                crtc.flip_pending = false;
            }
        }
        self.update_stats(|s| s.events_delivered += events.len());
        Ok(events)
    }

    fn set_cursor(&self, crtc_id: u32, handle: u32, width: u32, height: u32) -> Result<()> {
        self.with_crtc(crtc_id, |crtc| {
            crtc.cursor_handle = handle;
            Ok(())
        })?;
        debug!("[CRTC:{}] cursor handle {} ({}x{})", crtc_id, handle, width, height);
        Ok(())
    }

    fn move_cursor(&self, crtc_id: u32, x: i32, y: i32) -> Result<()> {
        self.with_crtc(crtc_id, |crtc| {
            crtc.cursor_x = x;
            crtc.cursor_y = y;
            Ok(())
        })
    }

    fn set_connector_property(
        &self,
        connector_id: u32,
        property_id: u32,
        value: u64,
    ) -> Result<()> {
        if self.head_index(connector_id).is_none() {
            return Err(Error::Ioctl(format!("[CONNECTOR:{}] no such connector", connector_id)));
        }
        if property_id != DPMS_PROPERTY_ID {
            return Err(Error::Ioctl(format!(
                "[CONNECTOR:{}] unknown property {}",
                connector_id, property_id
            )));
        }
        self.dpms.borrow_mut().insert(connector_id, value);
        debug!("[CONNECTOR:{}] DPMS {}", connector_id, value);
        Ok(())
    }

    fn set_master(&self) -> Result<()> {
        self.master.set(true);
        Ok(())
    }

    fn drop_master(&self) -> Result<()> {
        if !self.master.replace(false) {
            return Err(Error::Ioctl("drop master: not master".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_head() -> VirtualKms {
        VirtualKms::new(vec![VirtualHead::connected(640, 480, 60)])
    }

    #[test]
    fn test_object_ids() {
        let kms = VirtualKms::new(vec![
            VirtualHead::connected(640, 480, 60),
            VirtualHead::disconnected(),
        ]);
        let res = kms.resources().unwrap();
        assert_eq!(res.connectors, vec![1, 2]);
        assert_eq!(res.crtcs, vec![10, 11]);

        let conn = kms.connector(2).unwrap();
        assert_eq!(conn.connection, Connection::Disconnected);
        assert_eq!(conn.possible_crtcs, vec![11]);
        assert!(kms.connector(3).is_err());
    }

    #[test]
    fn test_framebuffer_ids_start_at_base() {
        let kms = single_head();
        let a = kms.add_framebuffer(640, 480, 24, 32, 2560, 1).unwrap();
        let b = kms.add_framebuffer(640, 480, 24, 32, 2560, 2).unwrap();
        assert_eq!(a, 100);
        assert_eq!(b, 101);
        kms.remove_framebuffer(a).unwrap();
        assert!(kms.remove_framebuffer(a).is_err());
        assert_eq!(kms.framebuffer_count(), 1);
    }

    #[test]
    fn test_set_crtc_checks_bounds() {
        let kms = single_head();
        let mode = ModeInfo::new(640, 480, 60);
        let fb = kms.add_framebuffer(640, 480, 24, 32, 2560, 1).unwrap();
        assert!(kms.set_crtc(10, fb, 0, 0, &[1], &mode).is_ok());
        assert!(kms.set_crtc(10, fb, 1, 0, &[1], &mode).is_err());
        assert!(kms.set_crtc(10, fb, 0, 0, &[], &mode).is_err());
        assert_eq!(kms.scanout_fb(10), fb);
    }

    #[test]
    fn test_page_flip_event_queue() {
        let kms = single_head();
        let mode = ModeInfo::new(640, 480, 60);
        let a = kms.add_framebuffer(640, 480, 24, 32, 2560, 1).unwrap();
        let b = kms.add_framebuffer(640, 480, 24, 32, 2560, 2).unwrap();

        // Flip on an idle CRTC is rejected
        assert!(kms.page_flip(10, b, Some(7)).is_err());

        kms.set_crtc(10, a, 0, 0, &[1], &mode).unwrap();
        kms.page_flip(10, b, Some(7)).unwrap();
        assert_eq!(kms.scanout_fb(10), b);
        // A second flip before the first completes is busy
        assert!(kms.page_flip(10, a, Some(8)).is_err());

        let events = kms.wait_for_event().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].cookie, 7);
        assert_eq!(events[0].crtc_id, 10);
        assert!(kms.wait_for_event().is_err());

        // No event requested
        kms.page_flip(10, a, None).unwrap();
        assert_eq!(kms.pending_events(), 0);
    }

    #[test]
    fn test_removing_scanned_out_fb_disables_crtc() {
        let kms = single_head();
        let mode = ModeInfo::new(640, 480, 60);
        let fb = kms.add_framebuffer(640, 480, 24, 32, 2560, 1).unwrap();
        kms.set_crtc(10, fb, 0, 0, &[1], &mode).unwrap();
        kms.remove_framebuffer(fb).unwrap();
        assert!(!kms.crtc(10).unwrap().is_active());
    }

    #[test]
    fn test_failure_injection() {
        let kms = single_head();
        let mode = ModeInfo::new(640, 480, 60);
        kms.fail_next_framebuffers(1);
        assert!(kms.add_framebuffer(640, 480, 24, 32, 2560, 1).is_err());
        let fb = kms.add_framebuffer(640, 480, 24, 32, 2560, 1).unwrap();

        kms.fail_set_crtc(10, true);
        assert!(kms.set_crtc(10, fb, 0, 0, &[1], &mode).is_err());
        kms.fail_set_crtc(10, false);
        kms.set_crtc(10, fb, 0, 0, &[1], &mode).unwrap();

        kms.fail_page_flip(10, true);
        assert!(kms.page_flip(10, fb, Some(1)).is_err());
        assert_eq!(kms.stats().set_crtc, 2);
    }

    #[test]
    fn test_master_and_dpms() {
        let kms = single_head();
        assert!(kms.drop_master().is_err());
        kms.set_master().unwrap();
        assert!(kms.is_master());
        kms.drop_master().unwrap();

        kms.set_connector_property(1, DPMS_PROPERTY_ID, crate::kms::dpms::OFF)
            .unwrap();
        assert_eq!(kms.dpms_state(1), Some(crate::kms::dpms::OFF));
        assert!(kms.set_connector_property(1, 99, 0).is_err());
    }
}
