//! CRTC and output configuration
//!
//! Driver-side view of the display pipeline: which CRTCs are enabled, where
//! they sit on the root window, and which outputs they drive.

use crate::bo::Bo;
use crate::kms::{Connection, ConnectorInfo, ModeInfo};

/// Hardware cursor size
pub const CURSOR_WIDTH: u32 = 64;
pub const CURSOR_HEIGHT: u32 = 64;

#[derive(Debug, Clone)]
pub struct CrtcState {
    pub id: u32,
    pub enabled: bool,
    /// Position of the CRTC's viewport on the root window
    pub x: i32,
    pub y: i32,
    pub mode: ModeInfo,
    pub cursor: Option<Bo>,
    pub cursor_visible: bool,
    pub cursor_x: i32,
    pub cursor_y: i32,
}

impl CrtcState {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            enabled: false,
            x: 0,
            y: 0,
            mode: ModeInfo::default(),
            cursor: None,
            cursor_visible: false,
            cursor_x: 0,
            cursor_y: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.mode.width()
    }

    pub fn height(&self) -> u32 {
        self.mode.height()
    }

    /// Enabled with a usable mode
    pub fn is_active(&self) -> bool {
        self.enabled && !self.mode.is_empty()
    }

    pub fn matches(&self, x: i32, y: i32, width: u32, height: u32) -> bool {
        self.x == x && self.y == y && self.width() == width && self.height() == height
    }
}

#[derive(Debug, Clone)]
pub struct OutputState {
    pub id: u32,
    /// Index into [`CrtcConfig::crtcs`]
    pub crtc: Option<usize>,
    pub status: Connection,
    pub modes: Vec<ModeInfo>,
    pub possible_crtcs: Vec<u32>,
    pub dpms_property: Option<u32>,
    pub dpms: u64,
}

impl OutputState {
    pub fn from_connector(info: ConnectorInfo) -> Self {
        Self {
            id: info.id,
            crtc: None,
            status: info.connection,
            modes: info.modes,
            possible_crtcs: info.possible_crtcs,
            dpms_property: info.dpms_property,
            dpms: crate::kms::dpms::OFF,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == Connection::Connected
    }

    /// Preferred mode, or the first one listed
    pub fn preferred_mode(&self) -> Option<&ModeInfo> {
        self.modes
            .iter()
            .find(|m| m.preferred)
            .or_else(|| self.modes.first())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CrtcConfig {
    pub crtcs: Vec<CrtcState>,
    pub outputs: Vec<OutputState>,
}

impl CrtcConfig {
    pub fn crtc_index(&self, crtc_id: u32) -> Option<usize> {
        self.crtcs.iter().position(|c| c.id == crtc_id)
    }

    /// Outputs attached to a CRTC
    pub fn output_ids(&self, crtc_index: usize) -> Vec<u32> {
        self.outputs
            .iter()
            .filter(|o| o.crtc == Some(crtc_index))
            .map(|o| o.id)
            .collect()
    }

    /// Any output on this CRTC is connected
    pub fn is_connected(&self, crtc_index: usize) -> bool {
        self.outputs
            .iter()
            .any(|o| o.crtc == Some(crtc_index) && o.is_connected())
    }

    /// Smallest root size covering every active CRTC
    pub fn bounding_size(&self) -> (u32, u32) {
        self.crtcs
            .iter()
            .filter(|c| c.is_active())
            .fold((0, 0), |(w, h), c| {
                (
                    w.max((c.x.max(0) as u32) + c.width()),
                    h.max((c.y.max(0) as u32) + c.height()),
                )
            })
    }

    /// Assign every connected output its preferred mode, placing heads
    /// left to right. Returns the number of CRTCs enabled.
    pub fn initial_configuration(&mut self) -> usize {
        let mut x = 0;
        let mut enabled = 0;

        for output in self.outputs.iter_mut() {
            output.crtc = None;
            if !output.is_connected() {
                continue;
            }
            let Some(mode) = output.preferred_mode().cloned() else {
                continue;
            };
            let Some(index) = self
                .crtcs
                .iter()
                .position(|c| !c.enabled && output.possible_crtcs.contains(&c.id))
            else {
                continue;
            };

            let crtc = &mut self.crtcs[index];
            crtc.enabled = true;
            crtc.x = x;
            crtc.y = 0;
            x += mode.width() as i32;
            crtc.mode = mode;
            output.crtc = Some(index);
            enabled += 1;
        }
        enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(id: u32, crtc: u32, connection: Connection, modes: Vec<ModeInfo>) -> OutputState {
        OutputState::from_connector(ConnectorInfo {
            id,
            connection,
            modes,
            possible_crtcs: vec![crtc],
            dpms_property: Some(2),
            width_mm: 0,
            height_mm: 0,
        })
    }

    fn dual_head() -> CrtcConfig {
        CrtcConfig {
            crtcs: vec![CrtcState::new(10), CrtcState::new(11)],
            outputs: vec![
                output(1, 10, Connection::Connected, vec![ModeInfo::new(1920, 1080, 60)]),
                output(
                    2,
                    11,
                    Connection::Connected,
                    vec![ModeInfo::new(1024, 768, 60), ModeInfo::new(1280, 1024, 60).preferred()],
                ),
            ],
        }
    }

    #[test]
    fn test_initial_configuration() {
        let mut config = dual_head();
        assert_eq!(config.initial_configuration(), 2);

        assert!(config.crtcs[0].matches(0, 0, 1920, 1080));
        assert!(config.crtcs[1].matches(1920, 0, 1280, 1024));
        assert_eq!(config.bounding_size(), (3200, 1080));
        assert_eq!(config.output_ids(1), vec![2]);
    }

    #[test]
    fn test_disconnected_output_stays_off() {
        let mut config = dual_head();
        config.outputs[0].status = Connection::Disconnected;
        assert_eq!(config.initial_configuration(), 1);
        assert!(!config.crtcs[0].enabled);
        assert!(config.crtcs[1].matches(0, 0, 1280, 1024));
        assert!(!config.is_connected(0));
        assert!(config.is_connected(1));
    }

    #[test]
    fn test_crtc_index() {
        let mut config = dual_head();
        config.initial_configuration();
        assert!(config.crtcs[1].matches(1920, 0, 1280, 1024));
        assert_eq!(config.crtc_index(11), Some(1));
        assert_eq!(config.crtc_index(99), None);
    }
}
