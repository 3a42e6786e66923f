//! Flashing session orchestration.
//!
//! Turns a parsed image and a set of options into the ordered command
//! sequence the bootloader expects:
//!
//! ```text
//! enter -> verify silicon -> check metadata -> verify row ranges
//!       -> erase (optional) -> program + verify rows -> verify checksum
//!       -> exit
//! ```
//!
//! Any failing step aborts the session; per-row failures are retried and
//! counted as packet errors, bounded by the session options.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::client::{BootloaderClient, ChunkSize, InitRetry};
use crate::error::{Error, MetadataConflict, Result};
use crate::image::Image;
use crate::protocol::checksum::{row_checksum, ChecksumKind};
use crate::protocol::packet::{BootloaderIdentity, Status};
use crate::transport::Transport;

/// Structured progress notifications emitted while a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The bootloader answered and identified itself.
    EnteredBootloader {
        /// Identity reported by the device.
        identity: BootloaderIdentity,
    },
    /// The device reported the row range of a flash array.
    ArrayRange {
        /// Flash array id.
        array_id: u8,
        /// First programmable row.
        first_row: u16,
        /// Last programmable row.
        last_row: u16,
    },
    /// One row was erased.
    Erasing {
        /// 1-based index of the erased row.
        row: usize,
        /// Total number of rows in the image.
        total: usize,
        /// Packet errors accumulated so far.
        errors: u32,
    },
    /// One row was programmed and verified.
    Programming {
        /// 1-based index of the programmed row.
        row: usize,
        /// Total number of rows in the image.
        total: usize,
        /// Packet errors accumulated so far.
        errors: u32,
    },
    /// The final application checksum was checked.
    Verified {
        /// Whether the device reported a valid checksum.
        ok: bool,
    },
    /// The exit command was sent; the device is rebooting.
    Rebooting,
}

/// Answers the questions a session cannot decide on its own.
///
/// The CLI implements this with interactive prompts; non-interactive
/// embedders can use [`DenyAll`] or preset the policy in
/// [`SessionOptions`].
pub trait Confirmation {
    /// Whether to flash an image older than the application on the device.
    fn allow_downgrade(&mut self, device_version: u16, image_version: u16) -> bool;

    /// Whether to flash an image whose application id differs from the
    /// device's.
    fn allow_different_app(&mut self, device_app: u16, image_app: u16) -> bool;
}

/// A [`Confirmation`] that declines every conflicting flash.
pub struct DenyAll;

impl Confirmation for DenyAll {
    fn allow_downgrade(&mut self, _device_version: u16, _image_version: u16) -> bool {
        false
    }

    fn allow_different_app(&mut self, _device_app: u16, _image_app: u16) -> bool {
        false
    }
}

/// Cooperative cancellation flag shared with the embedding application.
///
/// The session checks the token between rows and before each phase; a
/// canceled session fails with [`Error::Canceled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token in the not-canceled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the session holding this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Tunable behavior of a flashing session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Erase every image row before programming.
    pub erase: bool,
    /// Data bytes per `SendData`/`ProgramRow` request.
    pub chunk_size: ChunkSize,
    /// Downgrade policy: allow, refuse, or (when unset) ask.
    pub allow_downgrade: Option<bool>,
    /// Different-application policy: allow, refuse, or (when unset) ask.
    pub allow_different_app: Option<bool>,
    /// Repetitive-init window for `EnterBootloader`.
    pub init_retry: InitRetry,
    /// Abort once this many per-row failures have accumulated; zero means
    /// retry without bound.
    pub max_packet_errors: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            erase: false,
            chunk_size: ChunkSize::default(),
            allow_downgrade: None,
            allow_different_app: None,
            init_retry: InitRetry::For(Duration::from_secs(2)),
            max_packet_errors: 10,
        }
    }
}

/// A single flashing session over one transport.
pub struct FlashSession<T: Transport> {
    client: BootloaderClient<T>,
    options: SessionOptions,
    cancel: CancelToken,
    packet_errors: u32,
}

impl<T: Transport> FlashSession<T> {
    /// Create a session speaking the image's checksum dialect.
    pub fn new(transport: T, checksum: ChecksumKind, options: SessionOptions) -> Self {
        Self {
            client: BootloaderClient::new(transport, checksum),
            options,
            cancel: CancelToken::default(),
            packet_errors: 0,
        }
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Packet errors accumulated so far.
    pub fn packet_errors(&self) -> u32 {
        self.packet_errors
    }

    /// Run the whole bootload sequence for `image`.
    pub fn run<F>(
        &mut self,
        image: &Image,
        confirm: &mut dyn Confirmation,
        mut progress: F,
    ) -> Result<()>
    where
        F: FnMut(Event),
    {
        info!("initialising bootloader");
        let identity = self.enter()?;
        progress(Event::EnteredBootloader { identity });

        self.verify_silicon(image, &identity)?;
        self.check_metadata(image, confirm)?;
        self.verify_row_ranges(image, &mut progress)?;

        if self.options.erase {
            self.erase_rows(image, &mut progress)?;
        }
        self.program_rows(image, &mut progress)?;

        info!("verifying application checksum");
        let ok = self.client.verify_checksum()?;
        progress(Event::Verified { ok });
        if !ok {
            return Err(Error::AppChecksum);
        }

        info!("rebooting device");
        self.client.exit_bootloader()?;
        progress(Event::Rebooting);
        Ok(())
    }

    /// Release the underlying transport.
    pub fn close(&mut self) -> Result<()> {
        self.client.close()
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }

    fn enter(&mut self) -> Result<BootloaderIdentity> {
        self.check_cancel()?;
        match self.client.enter_bootloader(self.options.init_retry) {
            Ok(identity) => Ok(identity),
            // A key-protected bootloader drops unkeyed packets, so a key
            // mismatch and a dead device are indistinguishable here.
            Err(Error::Bootloader(Status::BadKey)) => Err(Error::SessionRefused),
            Err(e) => Err(e),
        }
    }

    fn verify_silicon(&self, image: &Image, identity: &BootloaderIdentity) -> Result<()> {
        if identity.silicon_id != image.silicon_id || identity.silicon_rev != image.silicon_rev {
            return Err(Error::InvalidSilicon {
                expected_id: image.silicon_id,
                expected_rev: image.silicon_rev,
                actual_id: identity.silicon_id,
                actual_rev: identity.silicon_rev,
            });
        }
        debug!(
            "silicon {:#010x} rev {} matches the image",
            identity.silicon_id, identity.silicon_rev
        );
        Ok(())
    }

    fn check_metadata(&mut self, image: &Image, confirm: &mut dyn Confirmation) -> Result<()> {
        self.check_cancel()?;
        let device = match self.client.get_metadata(0) {
            Ok(metadata) => metadata,
            Err(Error::Bootloader(Status::BadCommand)) => {
                info!("metadata not supported by this bootloader");
                return Ok(());
            },
            Err(Error::Bootloader(Status::BadApp | Status::InvalidApp)) => {
                info!("no valid application on the device");
                return Ok(());
            },
            Err(Error::Bootloader(status)) => {
                warn!("cannot read device metadata: {status}");
                return Ok(());
            },
            Err(e) => return Err(e),
        };
        info!(
            "device application id {}, version {}.{}",
            device.app_id,
            device.version_major(),
            device.version_minor()
        );

        let local = image.metadata()?;

        if device.app_version > local.app_version {
            let allowed = match self.options.allow_downgrade {
                Some(allowed) => allowed,
                None => confirm.allow_downgrade(device.app_version, local.app_version),
            };
            if !allowed {
                return Err(Error::MetadataConflict(MetadataConflict::Downgrade {
                    device: device.app_version,
                    image: local.app_version,
                }));
            }
            warn!(
                "downgrading device application from v{}.{} to v{}.{}",
                device.version_major(),
                device.version_minor(),
                local.version_major(),
                local.version_minor()
            );
        }

        if device.app_id != local.app_id {
            let allowed = match self.options.allow_different_app {
                Some(allowed) => allowed,
                None => confirm.allow_different_app(device.app_id, local.app_id),
            };
            if !allowed {
                return Err(Error::MetadataConflict(MetadataConflict::DifferentApp {
                    device: device.app_id,
                    image: local.app_id,
                }));
            }
            warn!(
                "replacing application id {} with application id {}",
                device.app_id, local.app_id
            );
        }

        Ok(())
    }

    fn verify_row_ranges<F>(&mut self, image: &Image, progress: &mut F) -> Result<()>
    where
        F: FnMut(Event),
    {
        for array_id in image.arrays() {
            self.check_cancel()?;
            let info = self.client.get_flash_size(array_id)?;
            info!(
                "array {}: first row {}, last row {}",
                array_id, info.first_row, info.last_row
            );
            progress(Event::ArrayRange {
                array_id,
                first_row: info.first_row,
                last_row: info.last_row,
            });
            for row in image.rows().iter().filter(|row| row.array_id == array_id) {
                if !info.contains(row.row_number) {
                    return Err(Error::RowRange {
                        array_id,
                        row_number: row.row_number,
                        first_row: info.first_row,
                        last_row: info.last_row,
                    });
                }
            }
        }
        Ok(())
    }

    fn erase_rows<F>(&mut self, image: &Image, progress: &mut F) -> Result<()>
    where
        F: FnMut(Event),
    {
        let total = image.rows().len();
        info!("erasing {total} rows");
        for (index, row) in image.rows().iter().enumerate() {
            self.check_cancel()?;
            let (array_id, row_number) = (row.array_id, row.row_number);
            self.retry_row(|client| client.erase_row(array_id, row_number))?;
            progress(Event::Erasing {
                row: index + 1,
                total,
                errors: self.packet_errors,
            });
        }
        Ok(())
    }

    fn program_rows<F>(&mut self, image: &Image, progress: &mut F) -> Result<()>
    where
        F: FnMut(Event),
    {
        let total = image.rows().len();
        let chunk_size = self.options.chunk_size;
        info!("programming {total} rows");
        for (index, row) in image.rows().iter().enumerate() {
            self.check_cancel()?;
            let expected = row_checksum(row.array_id, row.row_number, &row.data);
            self.retry_row(|client| {
                client.program_row(row.array_id, row.row_number, &row.data, chunk_size)?;
                let actual = client.verify_row(row.array_id, row.row_number)?;
                if actual != expected {
                    return Err(Error::RowChecksum {
                        array_id: row.array_id,
                        row_number: row.row_number,
                        expected,
                        actual,
                    });
                }
                Ok(())
            })?;
            progress(Event::Programming {
                row: index + 1,
                total,
                errors: self.packet_errors,
            });
        }
        Ok(())
    }

    /// Run one per-row operation, retrying it on packet errors.
    fn retry_row<R>(
        &mut self,
        mut op: impl FnMut(&mut BootloaderClient<T>) -> Result<R>,
    ) -> Result<R> {
        loop {
            match op(&mut self.client) {
                Ok(value) => return Ok(value),
                Err(e) if is_packet_error(&e) => {
                    self.packet_errors += 1;
                    warn!("row operation failed, retrying: {e}");
                    let limit = self.options.max_packet_errors;
                    if limit != 0 && self.packet_errors >= limit {
                        warn!("giving up after {limit} packet errors");
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }
}

/// Per-row failures that warrant retrying the row.
fn is_packet_error(error: &Error) -> bool {
    matches!(
        error,
        Error::Timeout(_)
            | Error::Framing(_)
            | Error::FrameChecksum { .. }
            | Error::RowChecksum { .. }
            | Error::Bootloader(_)
    )
}
