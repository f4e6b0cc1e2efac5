//! Kernel mode-setting interface
//!
//! The subset of libdrm's mode-setting API the scanout core needs, expressed
//! as a trait so the core can be driven by a real device or by
//! [`VirtualKms`](crate::virtual_kms::VirtualKms).

use crate::Result;

/// DRM fourcc format codes
pub mod drm_fourcc {
    pub const DRM_FORMAT_XRGB8888: u32 = 0x34325258; // 'XR24'
    pub const DRM_FORMAT_ARGB8888: u32 = 0x34325241; // 'AR24'
    pub const DRM_FORMAT_RGB565: u32 = 0x36314752; // 'RG16'
    pub const DRM_FORMAT_XBGR8888: u32 = 0x34324258; // 'XB24'
    pub const DRM_FORMAT_ABGR8888: u32 = 0x34324241; // 'AB24'

    /// Four character code as printable text
    pub fn name(format: u32) -> String {
        format
            .to_le_bytes()
            .iter()
            .map(|b| if b.is_ascii_graphic() { *b as char } else { '?' })
            .collect()
    }
}

/// DPMS property values
pub mod dpms {
    pub const ON: u64 = 0;
    pub const STANDBY: u64 = 1;
    pub const SUSPEND: u64 = 2;
    pub const OFF: u64 = 3;
}

/// DRM mode info (matching kernel's drm_mode_modeinfo)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModeInfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub preferred: bool,
    pub name: String,
}

impl ModeInfo {
    /// Build a mode with simplified blanking timings
    pub fn new(hdisplay: u16, vdisplay: u16, vrefresh: u32) -> Self {
        let htotal = hdisplay + 200;
        let vtotal = vdisplay + 50;
        let clock = (htotal as u32 * vtotal as u32 * vrefresh) / 1000;

        Self {
            clock,
            hdisplay,
            hsync_start: hdisplay + 50,
            hsync_end: hdisplay + 100,
            htotal,
            vdisplay,
            vsync_start: vdisplay + 10,
            vsync_end: vdisplay + 20,
            vtotal,
            vrefresh,
            flags: 0,
            preferred: false,
            name: format!("{}x{}", hdisplay, vdisplay),
        }
    }

    pub fn preferred(mut self) -> Self {
        self.preferred = true;
        self
    }

    pub fn width(&self) -> u32 {
        self.hdisplay as u32
    }

    pub fn height(&self) -> u32 {
        self.vdisplay as u32
    }

    pub fn is_empty(&self) -> bool {
        self.hdisplay == 0 || self.vdisplay == 0
    }
}

/// Connector connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    Connected,
    Disconnected,
    Unknown,
}

/// DRM connector info
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    pub id: u32,
    pub connection: Connection,
    pub modes: Vec<ModeInfo>,
    /// CRTC ids this connector can be driven by
    pub possible_crtcs: Vec<u32>,
    /// Id of the "DPMS" property, if the connector exposes one
    pub dpms_property: Option<u32>,
    pub width_mm: u32,
    pub height_mm: u32,
}

/// DRM resources enumeration
#[derive(Debug, Clone)]
pub struct DrmResources {
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
    pub connectors: Vec<u32>,
    pub crtcs: Vec<u32>,
    pub encoders: Vec<u32>,
    pub fbs: Vec<u32>,
}

/// A completed page flip, as read from the DRM event file descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlipEvent {
    pub crtc_id: u32,
    pub sequence: u32,
    pub tv_sec: u32,
    pub tv_usec: u32,
    /// User data passed to `page_flip`
    pub cookie: u64,
}

/// Mode-setting device.
///
/// Like the allocator, all methods take `&self`: a framebuffer may be
/// removed from a buffer's `Drop` while other mode-setting state is in use.
pub trait Kms {
    fn resources(&self) -> Result<DrmResources>;

    /// Re-probe a connector
    fn connector(&self, connector_id: u32) -> Result<ConnectorInfo>;

    /// Bind a buffer handle to a framebuffer described by depth and bpp
    fn add_framebuffer(
        &self,
        width: u32,
        height: u32,
        depth: u8,
        bpp: u8,
        pitch: u32,
        handle: u32,
    ) -> Result<u32>;

    /// Bind a buffer handle to a framebuffer described by a fourcc format
    fn add_framebuffer2(
        &self,
        width: u32,
        height: u32,
        format: u32,
        pitch: u32,
        handle: u32,
    ) -> Result<u32>;

    fn remove_framebuffer(&self, fb_id: u32) -> Result<()>;

    /// Program a CRTC to scan out `fb_id` from (`x`, `y`) on `connectors`
    fn set_crtc(
        &self,
        crtc_id: u32,
        fb_id: u32,
        x: i32,
        y: i32,
        connectors: &[u32],
        mode: &ModeInfo,
    ) -> Result<()>;

    fn disable_crtc(&self, crtc_id: u32) -> Result<()>;

    /// Queue an asynchronous flip. With `event` set, a [`PageFlipEvent`]
    /// carrying it is delivered once the flip has completed.
    fn page_flip(&self, crtc_id: u32, fb_id: u32, event: Option<u64>) -> Result<()>;

    /// Block until at least one event is available and return all of them
    fn wait_for_event(&self) -> Result<Vec<PageFlipEvent>>;

    /// Show the cursor buffer `handle` on a CRTC; handle 0 hides it
    fn set_cursor(&self, crtc_id: u32, handle: u32, width: u32, height: u32) -> Result<()>;

    fn move_cursor(&self, crtc_id: u32, x: i32, y: i32) -> Result<()>;

    fn set_connector_property(&self, connector_id: u32, property_id: u32, value: u64)
        -> Result<()>;

    fn set_master(&self) -> Result<()>;

    fn drop_master(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_name() {
        assert_eq!(drm_fourcc::name(drm_fourcc::DRM_FORMAT_XRGB8888), "XR24");
        assert_eq!(drm_fourcc::name(drm_fourcc::DRM_FORMAT_ARGB8888), "AR24");
    }

    #[test]
    fn test_mode_timings() {
        let mode = ModeInfo::new(1920, 1080, 60);
        assert_eq!(mode.width(), 1920);
        assert_eq!(mode.height(), 1080);
        assert_eq!(mode.htotal, 2120);
        assert_eq!(mode.vtotal, 1130);
        assert_eq!(mode.name, "1920x1080");
        assert!(!mode.is_empty());
        assert!(ModeInfo::default().is_empty());
    }
}
