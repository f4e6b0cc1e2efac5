//! Screen state and host entry points
//!
//! A [`Screen`] owns everything the driver keeps per screen: the CRTC and
//! output configuration, the root buffer and its pixmap, the per-CRTC
//! scanouts, the flip mode and the swaps in flight. The host calls into it
//! in roughly this order:
//!
//! ```text
//! probe -> pre_init -> screen_init -> (enter_vt / leave_vt)* -> close_screen
//!                          |
//!            set_mode_major, resize, adjust_frame, handle_hotplug,
//!            cursor and pixmap callbacks, swaps
//! ```

use std::rc::Rc;

use tracing::{debug, error, info, warn};

use crate::accel::Exa;
use crate::alloc::Access;
use crate::blit::{copy_region, Placement};
use crate::bo::{Bo, Device};
use crate::config::DriverOptions;
use crate::crtc::{CrtcConfig, CrtcState, OutputState, CURSOR_HEIGHT, CURSOR_WIDTH};
use crate::flip::FlipMode;
use crate::kms::{dpms, drm_fourcc, Kms, ModeInfo};
use crate::pixmap::{Pixmap, PixmapData};
use crate::scanout::ScanoutRegistry;
use crate::swap::SwapTracker;
use crate::{Error, Result};

pub struct Screen {
    pub(crate) options: DriverOptions,
    pub(crate) device: Rc<Device>,
    pub(crate) config: CrtcConfig,
    /// Buffer covering the whole root window, scanned out in blit mode
    pub(crate) root: Bo,
    pub(crate) root_pixmap: Pixmap,
    pub(crate) scanouts: ScanoutRegistry,
    pub(crate) flip_mode: FlipMode,
    /// Flips queued and not yet completed
    pub(crate) pending_flips: u32,
    /// Set when the root or a scanout was reallocated; the next swap blits
    pub(crate) has_resized: bool,
    pub(crate) swaps: SwapTracker,
    accel: Exa,
    vt_active: bool,
    /// Root pitch in pixels
    display_width: u32,
}

impl Screen {
    /// Whether `kms` looks like a device this driver can run
    pub fn probe(kms: &dyn Kms) -> Result<bool> {
        let res = kms.resources()?;
        let usable = !res.crtcs.is_empty() && !res.connectors.is_empty();
        info!(
            "Probed KMS device: {} CRTCs, {} connectors",
            res.crtcs.len(),
            res.connectors.len()
        );
        Ok(usable)
    }

    /// Read the display configuration and allocate the root buffer
    pub fn pre_init(options: DriverOptions, device: Rc<Device>) -> Result<Self> {
        let mut config = Self::enumerate(device.kms())?;
        let enabled = config.initial_configuration();
        if enabled == 0 {
            error!("No connected output with a usable mode");
            return Err(Error::ModeTransition("no usable outputs".into()));
        }
        info!("Enabled {} of {} CRTCs", enabled, config.crtcs.len());

        if options.hw_cursor {
            for crtc in config.crtcs.iter_mut() {
                match device.create_bo_with_format(
                    CURSOR_WIDTH,
                    CURSOR_HEIGHT,
                    drm_fourcc::DRM_FORMAT_ARGB8888,
                    32,
                ) {
                    Ok(bo) => crtc.cursor = Some(bo),
                    Err(e) => warn!("[CRTC:{}] no hardware cursor: {}", crtc.id, e),
                }
            }
        }

        let (width, height) = config.bounding_size();
        let root = device
            .create_bo(width, height, options.depth, options.bits_per_pixel)
            .map_err(|e| {
                error!("Failed to allocate {}x{} root buffer: {}", width, height, e);
                e
            })?;
        let display_width = root.pitch() / root.bytes_per_pixel();
        info!(
            "Root buffer [FB:{}] {}x{} pitch: {}",
            root.fb_id(),
            width,
            height,
            root.pitch()
        );

        let (depth, bpp, pitch) = (options.depth, options.bits_per_pixel, root.pitch());
        let screen = Self {
            options,
            device,
            config,
            root,
            root_pixmap: Pixmap::unbacked(0, 0, depth, bpp),
            scanouts: ScanoutRegistry::new(),
            flip_mode: FlipMode::Uninitialized,
            pending_flips: 0,
            has_resized: false,
            swaps: SwapTracker::default(),
            accel: Exa::default(),
            vt_active: false,
            display_width,
        };
        screen.modify_pixmap_header(
            &screen.root_pixmap,
            width,
            height,
            depth,
            bpp,
            pitch,
            Some(PixmapData::Root),
        )?;
        Ok(screen)
    }

    fn enumerate(kms: &dyn Kms) -> Result<CrtcConfig> {
        let res = kms.resources()?;
        let crtcs = res.crtcs.iter().map(|&id| CrtcState::new(id)).collect();
        let outputs = res
            .connectors
            .iter()
            .map(|&id| kms.connector(id).map(OutputState::from_connector))
            .collect::<Result<Vec<_>>>()?;
        Ok(CrtcConfig { crtcs, outputs })
    }

    /// Map the root buffer and light up the configured modes
    pub fn screen_init(&mut self) -> Result<()> {
        self.root.map()?;
        self.flip_mode = FlipMode::Blit;
        self.enter_vt()?;
        info!("Screen initialized, {}", self.accel.backend_name());
        Ok(())
    }

    /// Take over the display: become master and set every enabled mode
    pub fn enter_vt(&mut self) -> Result<()> {
        self.device.kms().set_master().map_err(|e| {
            error!("Cannot get DRM master: {}", e);
            e
        })?;

        let desired: Vec<(usize, ModeInfo, i32, i32)> = self
            .config
            .crtcs
            .iter()
            .enumerate()
            .filter(|(_, c)| c.enabled)
            .map(|(i, c)| (i, c.mode.clone(), c.x, c.y))
            .collect();
        for (index, mode, x, y) in desired {
            self.set_mode_major(index, mode, x, y)?;
        }

        self.vt_active = true;
        Ok(())
    }

    /// Give the display back
    pub fn leave_vt(&mut self) {
        if let Err(e) = self.device.kms().drop_master() {
            warn!("drop master failed: {}", e);
        }
        self.vt_active = false;
    }

    /// Tear down: wait for outstanding flips and release the scanouts
    pub fn close_screen(&mut self) -> Result<()> {
        self.wait_for_flips()?;
        if self.vt_active {
            self.leave_vt();
        }
        self.scanouts.clear();
        for crtc in self.config.crtcs.iter_mut() {
            crtc.cursor = None;
        }
        info!("Screen closed");
        Ok(())
    }

    /// Program `mode` on a CRTC at (`x`, `y`) of the root window.
    ///
    /// A mode set always lands in blit mode; the next full-screen swap
    /// switches back to flipping. On failure the CRTC keeps its old state.
    pub fn set_mode_major(&mut self, crtc_index: usize, mode: ModeInfo, x: i32, y: i32) -> Result<()> {
        let saved = {
            let crtc = &mut self.config.crtcs[crtc_index];
            let saved = (crtc.enabled, crtc.mode.clone(), crtc.x, crtc.y);
            crtc.enabled = true;
            crtc.mode = mode;
            crtc.x = x;
            crtc.y = y;
            saved
        };

        let result = match self.flip_mode {
            FlipMode::Flip => self.enter_blit_mode(),
            _ => self.set_crtc(crtc_index, &self.root, x, y),
        };
        if let Err(e) = result {
            let crtc = &mut self.config.crtcs[crtc_index];
            (crtc.enabled, crtc.mode, crtc.x, crtc.y) = saved;
            return Err(e);
        }

        let resized = self.scanouts.refresh(
            &self.config.crtcs,
            &self.device,
            self.options.depth,
            self.options.bits_per_pixel,
        )?;
        if resized {
            self.has_resized = true;
        }

        // Outputs on this CRTC may have been switched off
        let outputs: Vec<usize> = self
            .config
            .outputs
            .iter()
            .enumerate()
            .filter(|(_, o)| o.crtc == Some(crtc_index))
            .map(|(i, _)| i)
            .collect();
        for output in outputs {
            if let Err(e) = self.set_output_dpms(output, dpms::ON) {
                warn!("[CONNECTOR:{}] DPMS on failed: {}", self.config.outputs[output].id, e);
            }
        }

        self.reload_cursor(crtc_index);

        let crtc = &self.config.crtcs[crtc_index];
        info!("[CRTC:{}] {} at {},{}", crtc.id, crtc.mode.name, crtc.x, crtc.y);
        Ok(())
    }

    /// Pan the compat output's viewport to (`x`, `y`)
    pub fn adjust_frame(&mut self, x: i32, y: i32) -> Result<()> {
        let Some(index) = self.compat_crtc() else {
            return Ok(());
        };
        if !self.config.crtcs[index].enabled {
            return Ok(());
        }
        let mode = self.config.crtcs[index].mode.clone();
        self.set_mode_major(index, mode, x, y)
    }

    /// CRTC of the first connected output
    fn compat_crtc(&self) -> Option<usize> {
        self.config
            .outputs
            .iter()
            .find(|o| o.is_connected() && o.crtc.is_some())
            .and_then(|o| o.crtc)
    }

    /// Resize the root window, reallocating the root buffer if its size
    /// or bpp no longer matches
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        let (depth, bpp) = (self.options.depth, self.options.bits_per_pixel);
        debug!("Resize {}x{}", width, height);

        let mut old_root = None;
        if width != self.root.width() || height != self.root.height() || bpp != self.root.bpp() {
            let root = self.device.create_bo(width, height, depth, bpp).map_err(|e| {
                error!("Error reallocating root buffer: {}", e);
                e
            })?;
            debug!("New root buffer [FB:{}] {}x{}", root.fb_id(), width, height);
            self.has_resized = true;
            old_root = Some(std::mem::replace(&mut self.root, root));

            // Move CRTCs off the old root before it goes away
            if self.flip_mode == FlipMode::Blit && self.vt_active {
                for (i, crtc) in self.config.crtcs.iter().enumerate() {
                    let fits = crtc.x >= 0
                        && crtc.y >= 0
                        && crtc.x as u32 + crtc.width() <= width
                        && crtc.y as u32 + crtc.height() <= height;
                    if !crtc.is_active() || !fits {
                        continue;
                    }
                    if let Err(e) = self.set_crtc(i, &self.root, crtc.x, crtc.y) {
                        warn!("[CRTC:{}] could not follow resized root: {}", crtc.id, e);
                    }
                }
            }
        }

        let pitch = self.root.pitch();
        self.display_width = pitch / self.root.bytes_per_pixel();
        let root_pixmap = self.root_pixmap.clone();
        self.modify_pixmap_header(&root_pixmap, width, height, depth, bpp, pitch, Some(PixmapData::Root))?;
        drop(old_root);
        Ok(())
    }

    /// Re-probe every connector after a hot-plug event. Outputs that went
    /// away release their CRTC, new ones are placed to the right of the
    /// existing heads. Returns whether anything changed.
    pub fn handle_hotplug(&mut self) -> Result<bool> {
        let mut changed = false;
        for output in self.config.outputs.iter_mut() {
            let info = self.device.kms().connector(output.id)?;
            if info.connection == output.status && info.modes == output.modes {
                continue;
            }
            info!("[CONNECTOR:{}] hotplug: {:?} -> {:?}", output.id, output.status, info.connection);
            output.status = info.connection;
            output.modes = info.modes;
            changed = true;
        }
        if !changed {
            return Ok(false);
        }

        for o in 0..self.config.outputs.len() {
            let output = &self.config.outputs[o];
            let Some(index) = output.crtc.filter(|_| !output.is_connected()) else {
                continue;
            };
            self.set_crtc_off(index);
            let crtc = &mut self.config.crtcs[index];
            crtc.enabled = false;
            crtc.mode = ModeInfo::default();
            let output = &mut self.config.outputs[o];
            output.crtc = None;
            output.dpms = dpms::OFF;
        }

        let (mut right, mut bottom) = self.config.bounding_size();
        let mut added = Vec::new();
        for o in 0..self.config.outputs.len() {
            let output = &self.config.outputs[o];
            if !output.is_connected() || output.crtc.is_some() {
                continue;
            }
            let Some(mode) = output.preferred_mode().cloned() else {
                continue;
            };
            let free = self.config.crtcs.iter().enumerate().position(|(i, c)| {
                !c.enabled
                    && output.possible_crtcs.contains(&c.id)
                    && !added.iter().any(|(a, _, _)| *a == i)
            });
            let Some(index) = free else {
                warn!("[CONNECTOR:{}] no free CRTC", output.id);
                continue;
            };
            self.config.outputs[o].crtc = Some(index);
            let x = right as i32;
            right += mode.width();
            bottom = bottom.max(mode.height());
            added.push((index, mode, x));
        }

        if right > 0 && bottom > 0 {
            self.resize(right, bottom)?;
        }
        for (index, mode, x) in added {
            self.set_mode_major(index, mode, x, 0)?;
        }
        if self.scanouts.refresh(
            &self.config.crtcs,
            &self.device,
            self.options.depth,
            self.options.bits_per_pixel,
        )? {
            self.has_resized = true;
        }
        Ok(true)
    }

    pub fn set_output_dpms(&mut self, output_index: usize, mode: u64) -> Result<()> {
        let output = &mut self.config.outputs[output_index];
        if let Some(property) = output.dpms_property {
            self.device.kms().set_connector_property(output.id, property, mode)?;
        }
        output.dpms = mode;
        Ok(())
    }

    pub fn show_cursor(&mut self, crtc_index: usize) -> Result<()> {
        let crtc = &mut self.config.crtcs[crtc_index];
        let handle = crtc.cursor.as_ref().map_or(0, |bo| bo.handle());
        self.device
            .kms()
            .set_cursor(crtc.id, handle, CURSOR_WIDTH, CURSOR_HEIGHT)?;
        crtc.cursor_visible = true;
        Ok(())
    }

    pub fn hide_cursor(&mut self, crtc_index: usize) -> Result<()> {
        let crtc = &mut self.config.crtcs[crtc_index];
        self.device
            .kms()
            .set_cursor(crtc.id, 0, CURSOR_WIDTH, CURSOR_HEIGHT)?;
        crtc.cursor_visible = false;
        Ok(())
    }

    pub fn set_cursor_position(&mut self, crtc_index: usize, x: i32, y: i32) -> Result<()> {
        let crtc = &mut self.config.crtcs[crtc_index];
        self.device.kms().move_cursor(crtc.id, x, y)?;
        crtc.cursor_x = x;
        crtc.cursor_y = y;
        Ok(())
    }

    /// Upload a 64x64 ARGB image into a CRTC's cursor buffer
    pub fn load_cursor_argb(&self, crtc_index: usize, image: &[u32]) -> Result<()> {
        let Some(bo) = self.config.crtcs[crtc_index].cursor.as_ref() else {
            return Ok(());
        };
        let row_pixels = CURSOR_WIDTH as usize;
        if image.len() < row_pixels * CURSOR_HEIGHT as usize {
            return Err(Error::Map(format!(
                "cursor image has {} pixels, need {}",
                image.len(),
                row_pixels * CURSOR_HEIGHT as usize
            )));
        }

        let pitch = bo.pitch() as usize;
        let mut access = bo.cpu_access(Access::Write)?;
        let bytes = access.bytes_mut();
        for (row, pixels) in image.chunks_exact(row_pixels).take(CURSOR_HEIGHT as usize).enumerate() {
            let dst = &mut bytes[row * pitch..row * pitch + row_pixels * 4];
            for (out, pixel) in dst.chunks_exact_mut(4).zip(pixels) {
                out.copy_from_slice(&pixel.to_le_bytes());
            }
        }
        Ok(())
    }

    fn reload_cursor(&mut self, crtc_index: usize) {
        let crtc = &self.config.crtcs[crtc_index];
        if !crtc.cursor_visible {
            return;
        }
        let (x, y) = (crtc.cursor_x, crtc.cursor_y);
        if let Err(e) = self
            .show_cursor(crtc_index)
            .and_then(|()| self.set_cursor_position(crtc_index, x, y))
        {
            warn!("[CRTC:{}] cursor reload failed: {}", self.config.crtcs[crtc_index].id, e);
        }
    }

    /// Copy what the console left on screen into the root buffer so the
    /// switch from console to the display server shows no garbage
    pub fn copy_from_console(
        &self,
        pixels: &[u8],
        width: u32,
        height: u32,
        pitch: u32,
        bpp: u8,
    ) -> Result<()> {
        if bpp != 32 || self.root.bpp() != 32 {
            return Err(Error::CapabilityMismatch("console not 32 bpp"));
        }
        if width as u64 * 4 > pitch as u64 {
            return Err(Error::Map(format!(
                "console pitch {} too small for width {}",
                pitch, width
            )));
        }
        if (pixels.len() as u64) < pitch as u64 * height as u64 {
            return Err(Error::Map(format!(
                "console buffer of {} bytes is smaller than {}x{}",
                pixels.len(),
                pitch,
                height
            )));
        }

        let src_at = Placement {
            x: 0,
            y: 0,
            width,
            height,
            pitch,
            cpp: 4,
        };
        let dst_at = Placement::of(&self.root, 0, 0);
        let mut access = self.root.cpu_access(Access::Write)?;
        if let Some((w, h)) = copy_region(pixels, &src_at, access.bytes_mut(), &dst_at) {
            info!("Copied {}x{} of console contents", w, h);
        }
        Ok(())
    }

    pub fn root(&self) -> &Bo {
        &self.root
    }

    pub fn root_pixmap(&self) -> &Pixmap {
        &self.root_pixmap
    }

    pub fn scanouts(&self) -> &ScanoutRegistry {
        &self.scanouts
    }

    pub fn config(&self) -> &CrtcConfig {
        &self.config
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub fn device(&self) -> &Rc<Device> {
        &self.device
    }

    pub fn accel(&mut self) -> &mut Exa {
        &mut self.accel
    }

    pub fn set_accel(&mut self, accel: Exa) {
        self.accel = accel;
    }

    pub fn has_resized(&self) -> bool {
        self.has_resized
    }

    pub fn vt_active(&self) -> bool {
        self.vt_active
    }

    pub fn display_width(&self) -> u32 {
        self.display_width
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::alloc::MemAllocator;
    use crate::drawable::Drawable;
    use crate::swap::{Attachment, SwapCompletion, SwapKind};
    use crate::virtual_kms::{VirtualHead, VirtualKms};
    use std::cell::RefCell;

    pub(crate) fn screen_with_options(
        options: DriverOptions,
        heads: Vec<VirtualHead>,
    ) -> (Screen, Rc<MemAllocator>, Rc<VirtualKms>) {
        let allocator = Rc::new(MemAllocator::new(options.pitch_alignment));
        let kms = Rc::new(VirtualKms::new(heads));
        let device = Device::new(allocator.clone(), kms.clone());
        let mut screen = Screen::pre_init(options, device).unwrap();
        screen.screen_init().unwrap();
        (screen, allocator, kms)
    }

    pub(crate) fn screen_with(heads: Vec<VirtualHead>) -> (Screen, Rc<MemAllocator>, Rc<VirtualKms>) {
        screen_with_options(DriverOptions::default(), heads)
    }

    pub(crate) fn single_head_screen() -> (Screen, Rc<MemAllocator>, Rc<VirtualKms>) {
        screen_with(vec![VirtualHead::connected(640, 480, 60)])
    }

    /// 640x480 on the left, 320x240 on the right
    pub(crate) fn dual_head_screen() -> (Screen, Rc<MemAllocator>, Rc<VirtualKms>) {
        screen_with(vec![
            VirtualHead::connected(640, 480, 60),
            VirtualHead::connected(320, 240, 60),
        ])
    }

    #[test]
    fn test_probe() {
        let kms = VirtualKms::new(vec![VirtualHead::connected(640, 480, 60)]);
        assert!(Screen::probe(&kms).unwrap());
        let empty = VirtualKms::new(Vec::new());
        assert!(!Screen::probe(&empty).unwrap());
    }

    #[test]
    fn test_pre_init_without_outputs() {
        let kms = Rc::new(VirtualKms::new(vec![VirtualHead::disconnected()]));
        let device = Device::new(Rc::new(MemAllocator::new(64)), kms);
        assert!(matches!(
            Screen::pre_init(DriverOptions::default(), device),
            Err(Error::ModeTransition(_))
        ));
    }

    #[test]
    fn test_screen_init() {
        let (screen, _allocator, kms) = dual_head_screen();
        assert_eq!((screen.root().width(), screen.root().height()), (960, 480));
        assert_eq!(screen.display_width(), screen.root().pitch() / 4);
        assert!(Bo::ptr_eq(&screen.root_pixmap().bo().unwrap(), screen.root()));
        assert_eq!(screen.root_pixmap().dev_kind(), screen.root().pitch());
        assert!(screen.vt_active());
        assert!(kms.is_master());

        assert_eq!(kms.scanout_fb(10), screen.root().fb_id());
        assert_eq!(kms.crtc(11).unwrap().x, 640);
        assert_eq!(kms.dpms_state(1), Some(dpms::ON));
        assert_eq!(kms.dpms_state(2), Some(dpms::ON));

        // One invalid scanout per head, sized to its mode
        assert_eq!(screen.scanouts().len(), 2);
        assert!(screen.scanouts().iter().all(|s| !s.valid));
        assert!(!screen.has_resized());
        assert!(screen.config().crtcs.iter().all(|c| c.cursor.is_some()));
    }

    #[test]
    fn test_no_cursor_buffers_when_disabled() {
        let mut options = DriverOptions::default();
        options.hw_cursor = false;
        let (screen, _allocator, _kms) =
            screen_with_options(options, vec![VirtualHead::connected(640, 480, 60)]);
        assert!(screen.config().crtcs[0].cursor.is_none());
        screen.load_cursor_argb(0, &[0; 16]).unwrap();
    }

    #[test]
    fn test_leave_and_enter_vt() {
        let (mut screen, _allocator, kms) = single_head_screen();
        screen.leave_vt();
        assert!(!kms.is_master());
        assert!(!screen.vt_active());

        kms.disable_crtc(10).unwrap();
        screen.enter_vt().unwrap();
        assert!(kms.is_master());
        assert_eq!(kms.scanout_fb(10), screen.root().fb_id());
    }

    #[test]
    fn test_mode_shrink_reallocates_scanout() {
        let (mut screen, allocator, kms) = screen_with(vec![VirtualHead::connected(1920, 1080, 60)]);
        let old = screen.scanouts().iter().next().unwrap().bo().unwrap().clone();
        let destroyed = allocator.stats().destroyed;

        screen.set_mode_major(0, ModeInfo::new(1280, 720, 60), 0, 0).unwrap();
        assert!(screen.has_resized());
        assert_eq!(old.refcount(), 1);
        drop(old);
        assert_eq!(allocator.stats().destroyed, destroyed + 1);

        let slot = screen.scanouts().iter().next().unwrap();
        assert_eq!((slot.width, slot.height), (1280, 720));
        assert_eq!(slot.bo().unwrap().width(), 1280);
        assert!(!slot.valid);
        assert_eq!(kms.crtc(10).unwrap().mode.unwrap().hdisplay, 1280);
    }

    #[test]
    fn test_same_mode_keeps_scanout() {
        let (mut screen, _allocator, _kms) = single_head_screen();
        let old = screen.scanouts().iter().next().unwrap().bo().unwrap().clone();
        let mode = screen.config().crtcs[0].mode.clone();
        screen.set_mode_major(0, mode, 0, 0).unwrap();
        assert!(!screen.has_resized());
        assert!(Bo::ptr_eq(screen.scanouts().iter().next().unwrap().bo().unwrap(), &old));
    }

    #[test]
    fn test_failed_mode_set_keeps_crtc_state() {
        let (mut screen, _allocator, kms) = single_head_screen();
        // Larger than the root buffer
        assert!(screen.set_mode_major(0, ModeInfo::new(800, 600, 60), 0, 0).is_err());
        assert_eq!(screen.config().crtcs[0].width(), 640);
        assert_eq!(kms.crtc(10).unwrap().mode.unwrap().hdisplay, 640);
    }

    #[test]
    fn test_mode_set_in_flip_mode_returns_to_blit() {
        let (mut screen, _allocator, kms) = dual_head_screen();
        screen.enter_flip_mode().unwrap();
        let mode = screen.config().crtcs[1].mode.clone();
        screen.set_mode_major(1, mode, 640, 0).unwrap();
        assert_eq!(screen.flip_mode(), FlipMode::Blit);
        assert_eq!(kms.scanout_fb(10), screen.root().fb_id());
        assert_eq!(kms.scanout_fb(11), screen.root().fb_id());
    }

    #[test]
    fn test_resize_and_adjust_frame() {
        let (mut screen, _allocator, kms) = single_head_screen();
        let old_fb = screen.root().fb_id();

        screen.resize(1000, 800).unwrap();
        assert!(screen.has_resized());
        assert_eq!(screen.root().width(), 1000);
        assert_eq!(screen.root_pixmap().width(), 1000);
        assert!(Bo::ptr_eq(&screen.root_pixmap().bo().unwrap(), screen.root()));
        assert!(kms.framebuffer(old_fb).is_none());
        assert_eq!(kms.scanout_fb(10), screen.root().fb_id());

        screen.adjust_frame(100, 50).unwrap();
        let crtc = kms.crtc(10).unwrap();
        assert_eq!((crtc.x, crtc.y), (100, 50));

        // Would run past the root
        assert!(screen.adjust_frame(500, 0).is_err());
        assert_eq!(screen.config().crtcs[0].x, 100);
        assert_eq!(kms.crtc(10).unwrap().x, 100);
    }

    #[test]
    fn test_resize_to_same_size_keeps_root() {
        let (mut screen, _allocator, _kms) = single_head_screen();
        let root = screen.root().clone();
        screen.resize(640, 480).unwrap();
        assert!(Bo::ptr_eq(screen.root(), &root));
        assert!(!screen.has_resized());
    }

    #[test]
    fn test_hotplug_remove_and_add() {
        let (mut screen, _allocator, kms) = dual_head_screen();
        assert!(!screen.handle_hotplug().unwrap());

        kms.replug(1, VirtualHead::disconnected());
        assert!(screen.handle_hotplug().unwrap());
        assert!(!screen.config().crtcs[1].enabled);
        assert_eq!(kms.scanout_fb(11), 0);
        assert_eq!((screen.root().width(), screen.root().height()), (640, 480));
        assert_eq!(screen.scanouts().len(), 1);
        assert_eq!(kms.scanout_fb(10), screen.root().fb_id());

        kms.replug(1, VirtualHead::connected(800, 600, 60));
        assert!(screen.handle_hotplug().unwrap());
        assert!(screen.config().crtcs[1].matches(640, 0, 800, 600));
        assert_eq!((screen.root().width(), screen.root().height()), (1440, 600));
        assert_eq!(kms.scanout_fb(11), screen.root().fb_id());
        assert_eq!(kms.crtc(11).unwrap().x, 640);
        assert_eq!(screen.scanouts().len(), 2);
    }

    #[test]
    fn test_cursor() {
        let (mut screen, _allocator, kms) = single_head_screen();
        let image = vec![0xff00_ff00u32; (CURSOR_WIDTH * CURSOR_HEIGHT) as usize];
        screen.load_cursor_argb(0, &image).unwrap();
        assert!(screen.load_cursor_argb(0, &image[..10]).is_err());

        let bo = screen.config().crtcs[0].cursor.clone().unwrap();
        {
            let access = bo.cpu_access(Access::Read).unwrap();
            assert_eq!(&access.bytes()[..4], &0xff00_ff00u32.to_le_bytes());
        }

        screen.show_cursor(0).unwrap();
        screen.set_cursor_position(0, 12, 34).unwrap();
        let crtc = kms.crtc(10).unwrap();
        assert_eq!(crtc.cursor_handle, bo.handle());
        assert_eq!((crtc.cursor_x, crtc.cursor_y), (12, 34));

        screen.hide_cursor(0).unwrap();
        assert_eq!(kms.crtc(10).unwrap().cursor_handle, 0);
    }

    #[test]
    fn test_cursor_survives_mode_set() {
        let (mut screen, _allocator, kms) = single_head_screen();
        screen.show_cursor(0).unwrap();
        kms.set_cursor(10, 0, CURSOR_WIDTH, CURSOR_HEIGHT).unwrap();

        let mode = screen.config().crtcs[0].mode.clone();
        screen.set_mode_major(0, mode, 0, 0).unwrap();
        assert_ne!(kms.crtc(10).unwrap().cursor_handle, 0);
    }

    #[test]
    fn test_copy_from_console() {
        let (screen, _allocator, _kms) = single_head_screen();
        let (width, height, pitch) = (320u32, 200u32, 1280u32);
        let console = vec![0x42u8; (pitch * height) as usize];

        screen.copy_from_console(&console, width, height, pitch, 32).unwrap();
        let root = screen.root();
        let access = root.cpu_access(Access::Read).unwrap();
        let root_pitch = root.pitch() as usize;
        assert_eq!(access.bytes()[199 * root_pitch + 319 * 4], 0x42);
        assert_eq!(access.bytes()[200 * root_pitch], 0);
        assert_eq!(access.bytes()[320 * 4], 0);
        drop(access);

        assert!(screen.copy_from_console(&console, width, height, pitch, 16).is_err());
        assert!(screen.copy_from_console(&console[..100], width, height, pitch, 32).is_err());
        assert!(matches!(
            screen.copy_from_console(&vec![0; 1000], 640, 10, 100, 32),
            Err(Error::Map(_))
        ));
    }

    #[test]
    fn test_fullscreen_flip_1080p() {
        let (mut screen, _allocator, kms) = screen_with(vec![VirtualHead::connected(1920, 1080, 60)]);
        let mut draw = Drawable::window(1, 0, 0, 1920, 1080, screen.root_pixmap().clone());
        let mut front = screen.create_swap_buffer(&draw, Attachment::FrontLeft).unwrap();
        let mut back = screen.create_swap_buffer(&draw, Attachment::BackLeft).unwrap();
        assert_eq!(back.pixmap.bo().unwrap().bpp(), 32);

        let log: Rc<RefCell<Vec<SwapCompletion>>> = Rc::default();
        let sink = log.clone();
        let kind = screen
            .schedule_swap(
                &mut draw,
                &mut front,
                &mut back,
                Box::new(move |c: SwapCompletion| sink.borrow_mut().push(c)),
            )
            .unwrap();

        assert_eq!(kind, SwapKind::Flip);
        assert_eq!(screen.flip_mode(), FlipMode::Flip);
        assert_eq!(kms.stats().page_flips, 1);
        assert!(log.borrow().is_empty());

        screen.dispatch_events().unwrap();
        assert_eq!(kms.stats().events_delivered, 1);
        assert_eq!(log.borrow().len(), 1);
        assert!(log.borrow()[0].exchanged);
    }

    #[test]
    fn test_close_screen_waits_for_flips() {
        let (mut screen, allocator, kms) = single_head_screen();
        let mut draw = Drawable::window(1, 0, 0, 640, 480, screen.root_pixmap().clone());
        let mut front = screen.create_swap_buffer(&draw, Attachment::FrontLeft).unwrap();
        let mut back = screen.create_swap_buffer(&draw, Attachment::BackLeft).unwrap();
        screen
            .schedule_swap(&mut draw, &mut front, &mut back, Box::new(|_: SwapCompletion| {}))
            .unwrap();
        assert_eq!(screen.pending_flips(), 1);

        let live = allocator.stats().live;
        screen.close_screen().unwrap();
        assert_eq!(screen.pending_flips(), 0);
        assert_eq!(kms.pending_events(), 0);
        assert!(screen.scanouts().is_empty());
        assert!(!kms.is_master());
        // Scanout and cursor buffers released
        assert!(allocator.stats().live < live);
    }

    #[test]
    fn test_dpms() {
        let (mut screen, _allocator, kms) = single_head_screen();
        screen.set_output_dpms(0, dpms::OFF).unwrap();
        assert_eq!(kms.dpms_state(1), Some(dpms::OFF));
        assert_eq!(screen.config().outputs[0].dpms, dpms::OFF);
    }
}
