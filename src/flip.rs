//! Flip / blit mode controller
//!
//! In blit mode every CRTC scans out of the root buffer and client swaps
//! are copied into it. In flip mode each CRTC scans out of its own scanout
//! buffer and full-screen clients swap buffers with it directly.
//! Switching modes moves the screen contents between the two sets of
//! buffers so the picture does not change.

use tracing::{debug, error, info, warn};

use crate::blit::copy_bo;
use crate::bo::Bo;
use crate::screen::Screen;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlipMode {
    #[default]
    Uninitialized,
    Flip,
    Blit,
}

impl Screen {
    pub fn flip_mode(&self) -> FlipMode {
        self.flip_mode
    }

    /// Program a CRTC to scan out `bo` from (`x`, `y`)
    pub(crate) fn set_crtc(&self, crtc_index: usize, bo: &Bo, x: i32, y: i32) -> Result<()> {
        let crtc = &self.config.crtcs[crtc_index];
        let outputs = self.config.output_ids(crtc_index);
        if outputs.is_empty() {
            error!("[CRTC:{}] no outputs found", crtc.id);
            return Err(Error::NoOutputs(crtc.id));
        }

        self.device
            .kms()
            .set_crtc(crtc.id, bo.fb_id(), x, y, &outputs, &crtc.mode)
            .map_err(|e| {
                error!("[CRTC:{}] [FB:{}] set mode failed: {}", crtc.id, bo.fb_id(), e);
                e
            })
    }

    pub(crate) fn set_crtc_off(&self, crtc_index: usize) {
        let crtc_id = self.config.crtcs[crtc_index].id;
        if let Err(e) = self.device.kms().disable_crtc(crtc_id) {
            error!("[CRTC:{}] disable failed: {}", crtc_id, e);
        }
    }

    fn set_blit_crtc(&self, crtc_index: usize) -> Result<()> {
        let crtc = &self.config.crtcs[crtc_index];
        self.set_crtc(crtc_index, &self.root, crtc.x, crtc.y)
    }

    fn set_flip_crtc(&self, crtc_index: usize) -> Result<()> {
        let crtc = &self.config.crtcs[crtc_index];
        match self.scanouts.find_by_crtc(crtc).and_then(|s| s.bo()) {
            Some(bo) => self.set_crtc(crtc_index, bo, 0, 0),
            // Nothing to flip to on this CRTC
            None => Ok(()),
        }
    }

    fn program_crtc(&self, crtc_index: usize, mode: FlipMode) -> Result<()> {
        match mode {
            FlipMode::Flip => self.set_flip_crtc(crtc_index),
            _ => self.set_blit_crtc(crtc_index),
        }
    }

    /// Point every enabled CRTC at the buffers of `target`. Failing CRTCs
    /// are switched off; if any failed the others are put back.
    fn program_crtcs(&self, target: FlipMode, previous: FlipMode) -> Result<()> {
        let mut switched = Vec::new();
        let mut failed = Vec::new();

        for (i, crtc) in self.config.crtcs.iter().enumerate() {
            if !crtc.enabled {
                continue;
            }
            match self.program_crtc(i, target) {
                Ok(()) => switched.push(i),
                Err(e) => {
                    warn!("[CRTC:{}] could not enter {:?} mode: {}", crtc.id, target, e);
                    self.set_crtc_off(i);
                    failed.push(crtc.id);
                }
            }
        }

        if failed.is_empty() {
            return Ok(());
        }

        for i in switched {
            if let Err(e) = self.program_crtc(i, previous) {
                error!(
                    "[CRTC:{}] rollback to {:?} mode failed: {}",
                    self.config.crtcs[i].id, previous, e
                );
            }
        }
        Err(Error::ModeTransition(format!(
            "{:?} mode failed on CRTCs {:?}",
            target, failed
        )))
    }

    /// Block until every queued page flip has completed
    pub fn wait_for_flips(&mut self) -> Result<()> {
        while self.pending_flips > 0 {
            debug!("waiting for {} pending flips", self.pending_flips);
            self.wait_for_event()?;
        }
        Ok(())
    }

    /// Make the root buffer the source of every enabled CRTC, first copying
    /// in whatever the per-CRTC scanouts currently show.
    pub fn enter_blit_mode(&mut self) -> Result<()> {
        if self.flip_mode == FlipMode::Blit {
            return Ok(());
        }

        // Per-CRTC buffers may still change until their flips land
        self.wait_for_flips()?;

        let saved = self.scanouts.validity();
        for slot in self.scanouts.iter_mut().filter(|s| s.valid) {
            if let Some(bo) = slot.bo() {
                copy_bo(bo, slot.x, slot.y, &self.root, 0, 0)?;
            }
            slot.valid = false;
        }

        if let Err(e) = self.program_crtcs(FlipMode::Blit, self.flip_mode) {
            self.scanouts.restore_validity(saved);
            return Err(e);
        }

        info!("Entered blit mode");
        self.flip_mode = FlipMode::Blit;
        Ok(())
    }

    /// Scan out of the per-CRTC buffers, first copying the root contents
    /// into any that are stale.
    pub fn enter_flip_mode(&mut self) -> Result<()> {
        if self.flip_mode == FlipMode::Flip {
            return Ok(());
        }

        let saved = self.scanouts.validity();
        for slot in self.scanouts.iter_mut().filter(|s| !s.valid) {
            if let Some(bo) = slot.bo() {
                copy_bo(&self.root, 0, 0, bo, slot.x, slot.y)?;
            }
            slot.valid = true;
        }

        if let Err(e) = self.program_crtcs(FlipMode::Flip, self.flip_mode) {
            self.scanouts.restore_validity(saved);
            return Err(e);
        }

        info!("Entered flip mode");
        self.flip_mode = FlipMode::Flip;
        Ok(())
    }

    /// Bring the root buffer up to date with the per-CRTC scanouts without
    /// leaving flip mode
    pub fn update_root_from_crtcs(&mut self) -> Result<()> {
        if self.flip_mode == FlipMode::Blit {
            return Ok(());
        }
        for slot in self.scanouts.iter().filter(|s| s.valid) {
            if let Some(bo) = slot.bo() {
                copy_bo(bo, slot.x, slot.y, &self.root, 0, 0)?;
            }
        }
        Ok(())
    }
}
