//! Driver options
//!
//! Options are read from a TOML file, mirroring the `Option` lines of a
//! display server's device section:
//!
//! ```toml
//! debug = true
//! page_flip_events = true
//! depth = 24
//! bits_per_pixel = 32
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverOptions {
    /// Verbose logging of buffer, flip and swap traffic
    pub debug: bool,
    /// Request page-flip completion events from the kernel. When off, every
    /// flip completes as soon as it has been queued.
    pub page_flip_events: bool,
    /// Colour depth of the root window
    pub depth: u8,
    /// Bits per pixel of every scanout buffer
    pub bits_per_pixel: u8,
    /// Row pitch alignment in bytes used by the allocator
    pub pitch_alignment: u32,
    /// Allocate per-CRTC hardware cursor buffers
    pub hw_cursor: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            debug: false,
            page_flip_events: cfg!(feature = "page-flip-events"),
            depth: 24,
            bits_per_pixel: 32,
            // Mali requires 64 byte aligned rows
            pitch_alignment: 64,
            hw_cursor: true,
        }
    }
}

impl DriverOptions {
    /// Parse options from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let options: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let options = Self::from_toml(&contents)?;
                info!("Loaded driver options from {:?}", path);
                Ok(options)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No driver options at {:?}, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn validate(&self) -> Result<()> {
        if !matches!(self.bits_per_pixel, 16 | 24 | 32) {
            return Err(Error::Config(format!(
                "unsupported bits_per_pixel {}",
                self.bits_per_pixel
            )));
        }
        if self.depth == 0 || self.depth > self.bits_per_pixel {
            return Err(Error::Config(format!(
                "depth {} does not fit in {} bits per pixel",
                self.depth, self.bits_per_pixel
            )));
        }
        if self.pitch_alignment == 0 || !self.pitch_alignment.is_power_of_two() {
            return Err(Error::Config(format!(
                "pitch_alignment {} is not a power of two",
                self.pitch_alignment
            )));
        }
        Ok(())
    }

    /// Default tracing filter for these options
    pub fn log_filter(&self) -> &'static str {
        if self.debug {
            "debug,armsoc_scanout=debug"
        } else {
            "warn,armsoc_scanout=info"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let options = DriverOptions::from_toml("").unwrap();
        assert_eq!(options, DriverOptions::default());
        assert_eq!(options.bits_per_pixel, 32);
        assert_eq!(options.pitch_alignment, 64);
    }

    #[test]
    fn test_partial_options() {
        let options = DriverOptions::from_toml("debug = true\npage_flip_events = false\n").unwrap();
        assert!(options.debug);
        assert!(!options.page_flip_events);
        assert_eq!(options.depth, 24);
        assert_eq!(options.log_filter(), "debug,armsoc_scanout=debug");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(DriverOptions::from_toml("bits_per_pixel = 12").is_err());
        assert!(DriverOptions::from_toml("depth = 32\nbits_per_pixel = 16").is_err());
        assert!(DriverOptions::from_toml("pitch_alignment = 48").is_err());
        assert!(DriverOptions::from_toml("unknown = 1").is_err());
    }

    #[test]
    fn test_missing_file_is_default() {
        let options = DriverOptions::load(Path::new("/nonexistent/armsoc.toml")).unwrap();
        assert_eq!(options, DriverOptions::default());
    }
}
