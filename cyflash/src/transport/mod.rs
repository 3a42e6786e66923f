//! Packet transport abstraction.
//!
//! The bootloader protocol runs over any bidirectional channel that can
//! carry whole logical packets. Two implementations exist:
//!
//! - [`serial::SerialTransport`] delimits packets on a byte stream using
//!   the protocol's own framing.
//! - [`canbus::CanTransport`] fragments packets across 8-byte CAN frames
//!   and reassembles them on the way back.
//!
//! A transport is single-owner: the session holds it for its whole
//! duration and never issues more than one outstanding request.

pub mod canbus;
pub mod serial;

// Re-export for convenience
pub use canbus::{CanBus, CanFrame, CanTransport};
pub use serial::SerialTransport;

use std::time::Duration;

use crate::error::Result;

/// A bidirectional, packet-framed channel with timeouts.
pub trait Transport: Send {
    /// Transmit one complete logical packet, caller-framed.
    fn send(&mut self, packet: &[u8]) -> Result<()>;

    /// Return the next complete logical packet, or fail with
    /// [`Error::Timeout`](crate::error::Error::Timeout) when none arrives
    /// within the configured deadline.
    fn receive(&mut self) -> Result<Vec<u8>>;

    /// Set the receive deadline for subsequent calls.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// The current receive deadline.
    fn timeout(&self) -> Duration;

    /// Release the underlying channel.
    ///
    /// After calling this method the transport cannot be used for further
    /// I/O.
    fn close(&mut self) -> Result<()>;
}
