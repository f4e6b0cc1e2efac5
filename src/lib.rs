//! Scanout core for ARM SoC KMS display drivers
//!
//! This library implements the buffer and scanout management of a 2D display
//! driver for ARM SoCs whose display controller is driven through KMS while
//! rendering memory comes from a separate GPU allocator. It keeps one root
//! buffer covering the whole screen and, per CRTC, an optional buffer that
//! clients can flip to directly.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Display server (host)                          │
//! │     pixmap callbacks, swap requests, mode changes           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │              armsoc-scanout                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐ │
//! │  │ Screen      │  │ Flip / Blit │  │ Swap tracker        │ │
//! │  │ (CRTCs)     │  │ controller  │  │ (page-flip events)  │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘ │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐ │
//! │  │ Scanouts    │  │ Buffer      │  │ Acceleration        │ │
//! │  │ (3 slots)   │  │ objects     │  │ dispatch            │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!               │                               │
//!          Kms trait                      Allocator trait
//!               │                               │
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │ KMS device / VirtualKms  │   │ GEM allocator / MemAllocator │
//! └──────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::rc::Rc;
//! use armsoc_scanout::{Device, DriverOptions, MemAllocator, Screen, VirtualHead, VirtualKms};
//!
//! let kms = Rc::new(VirtualKms::new(vec![VirtualHead::connected(1920, 1080, 60)]));
//! let device = Device::new(Rc::new(MemAllocator::new(64)), kms);
//! let mut screen = Screen::pre_init(DriverOptions::default(), device)?;
//! screen.screen_init()?;
//! ```

pub mod accel;
pub mod alloc;
pub mod blit;
pub mod bo;
pub mod config;
pub mod crtc;
pub mod drawable;
pub mod error;
pub mod flip;
pub mod kms;
pub mod pixmap;
pub mod scanout;
pub mod screen;
pub mod swap;
pub mod virtual_kms;

pub use accel::{AccelBackend, Exa, SoftwareAccel};
pub use alloc::{Access, Allocator, MemAllocator};
pub use bo::{Bo, Device};
pub use config::DriverOptions;
pub use drawable::{Drawable, Rect};
pub use error::Error;
pub use flip::FlipMode;
pub use kms::Kms;
pub use pixmap::Pixmap;
pub use screen::Screen;
pub use swap::{SwapBuffer, SwapCompletion, SwapKind};
pub use virtual_kms::{VirtualHead, VirtualKms};

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;
