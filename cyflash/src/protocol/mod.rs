//! Bootloader protocol implementation.

pub mod checksum;
pub mod packet;

// Re-export common types
pub use checksum::ChecksumKind;
pub use packet::{BootloaderIdentity, Command, FlashArrayInfo, Status, EOP, SOP};
