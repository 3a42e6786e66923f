//! # cyflash
//!
//! A library for flashing Cypress PSoC devices through the Cypress
//! bootloader.
//!
//! This crate provides the core functionality for programming a PSoC's
//! application flash over the bootloader's packet protocol, including:
//!
//! - `.cyacd` firmware image parsing
//! - Bootloader command encoding/decoding with both checksum dialects
//! - Serial and CAN bus transports
//! - The full flashing session: identity check, metadata policy, erase,
//!   program, verify, reboot
//!
//! ## Supported Channels
//!
//! - **Serial** on all platforms via the `serialport` crate
//! - **CAN** on Linux via SocketCAN, fragmenting packets across 8-byte
//!   frames
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use cyflash::{DenyAll, FlashSession, Image, SerialTransport, SessionOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Parse the firmware image
//!     let image = Image::from_file("firmware.cyacd")?;
//!
//!     // Open the transport and run the session
//!     let transport = SerialTransport::open(
//!         "/dev/ttyUSB0",
//!         115200,
//!         serialport::Parity::None,
//!         serialport::StopBits::One,
//!         Duration::from_secs(5),
//!     )?;
//!     let mut session = FlashSession::new(transport, image.checksum_kind, SessionOptions::default());
//!     session.run(&image, &mut DenyAll, |event| {
//!         println!("{event:?}");
//!     })?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod image;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
#[cfg(target_os = "linux")]
pub use transport::canbus::SocketCanBus;
pub use {
    client::{BootloaderClient, ChunkSize, InitRetry},
    error::{Error, MetadataConflict, Result},
    image::{AppMetadata, Image, Row},
    protocol::{
        checksum::ChecksumKind,
        packet::{BootloaderIdentity, FlashArrayInfo, Status},
    },
    session::{CancelToken, Confirmation, DenyAll, Event, FlashSession, SessionOptions},
    transport::{
        canbus::{CanBus, CanFrame, CanOptions, CanTransport},
        serial::SerialTransport,
        Transport,
    },
};
