//! CAN bus transport.
//!
//! A logical bootloader packet is fragmented across standard 11-bit-ID CAN
//! frames of up to 8 bytes and reassembled on the way back. The target's
//! CAN component stores frame payloads as 32-bit registers, so each 4-byte
//! word travels byte-reversed relative to logical order (the permutation
//! `[3,2,1,0,7,6,5,4]` over an 8-byte frame). The host applies the same
//! swap in both directions so the two ends agree.
//!
//! Reassembly relies only on the packet's own framing: bytes accumulate
//! until the buffer starts with SOP and carries EOP at the position the
//! declared length names; anything past that (word-alignment padding) is
//! trimmed.

use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::packet::{EOP, FRAME_OVERHEAD, MAX_PAYLOAD, SOP};
use crate::transport::Transport;

/// Largest data payload of a classic CAN frame.
pub const FRAME_DATA_MAX: usize = 8;

/// Highest standard (11-bit) CAN identifier; the bootloader's broadcast id.
pub const BROADCAST_ID: u32 = 0x7FF;

/// One received CAN frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// Arbitration id the frame arrived with.
    pub id: u32,
    /// Frame data, at most 8 bytes.
    pub data: Vec<u8>,
}

/// Frame-level access to a CAN bus.
///
/// This seam keeps the fragmentation and byte-order logic independent of
/// the OS driver so it can run against an in-memory bus in tests.
pub trait CanBus: Send {
    /// Transmit one standard-ID frame.
    fn send_frame(&mut self, id: u32, data: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for the next frame; `None` when none arrived.
    fn recv_frame(&mut self, timeout: Duration) -> Result<Option<CanFrame>>;
}

/// Addressing and behavior options for a [`CanTransport`].
#[derive(Debug, Clone)]
pub struct CanOptions {
    /// Arbitration id of the target device; also used for host transmissions.
    pub device_id: u32,
    /// Broadcast id the device additionally listens on.
    pub broadcast_id: u32,
    /// Extra id to accept on receive, if any.
    pub wildcard_id: Option<u32>,
    /// Whether the bus echoes transmitted frames back to the host; when
    /// set, each echo is consumed before the next frame goes out.
    pub echo: bool,
}

impl Default for CanOptions {
    fn default() -> Self {
        Self {
            device_id: 0,
            broadcast_id: BROADCAST_ID,
            wildcard_id: None,
            echo: false,
        }
    }
}

/// Packet transport over a CAN bus.
pub struct CanTransport<B: CanBus> {
    bus: B,
    options: CanOptions,
    timeout: Duration,
}

impl<B: CanBus> CanTransport<B> {
    /// Create a transport over an open bus.
    pub fn new(bus: B, options: CanOptions, timeout: Duration) -> Result<Self> {
        for id in [Some(options.device_id), Some(options.broadcast_id), options.wildcard_id]
            .into_iter()
            .flatten()
        {
            if id > BROADCAST_ID {
                return Err(Error::Config(format!(
                    "CAN id {id:#x} does not fit a standard 11-bit identifier"
                )));
            }
        }
        Ok(Self {
            bus,
            options,
            timeout,
        })
    }

    /// Get a reference to the underlying bus.
    pub fn bus(&self) -> &B {
        &self.bus
    }

    fn accepts(&self, id: u32) -> bool {
        id == self.options.device_id
            || id == self.options.broadcast_id
            || self.options.wildcard_id == Some(id)
    }

    fn wait_for_echo(&mut self, sent: &[u8]) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(Error::Timeout("no echo frame within the timeout".into()))?;
            match self.bus.recv_frame(remaining)? {
                Some(frame) if frame.data == sent => return Ok(()),
                // The id may serve other traffic; match on payload only.
                Some(frame) => trace!("ignoring non-echo frame from {:#x}", frame.id),
                None => {
                    return Err(Error::Timeout("no echo frame within the timeout".into()));
                },
            }
        }
    }
}

impl<B: CanBus> Transport for CanTransport<B> {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        trace!(
            "tx {} bytes as {} CAN frames",
            packet.len(),
            packet.len().div_ceil(FRAME_DATA_MAX)
        );
        for chunk in packet.chunks(FRAME_DATA_MAX) {
            let wire = word_swap(chunk);
            self.bus.send_frame(self.options.device_id, &wire)?;
            if self.options.echo {
                self.wait_for_echo(&wire)?;
            }
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let mut assembled: Vec<u8> = Vec::new();

        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| timeout_error(&assembled))?;
            let frame = self
                .bus
                .recv_frame(remaining)?
                .ok_or_else(|| timeout_error(&assembled))?;

            if !self.accepts(frame.id) {
                debug!("discarding frame from unrelated id {:#x}", frame.id);
                continue;
            }

            assembled.extend_from_slice(&word_swap(&frame.data));

            if assembled[0] != SOP {
                return Err(Error::Framing(format!(
                    "reassembled packet starts with {:#04x}, expected {SOP:#04x}",
                    assembled[0]
                )));
            }
            if let Some(total) = packet_end(&assembled)? {
                assembled.truncate(total);
                trace!("rx {} byte packet over CAN", total);
                return Ok(assembled);
            }
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn timeout_error(assembled: &[u8]) -> Error {
    if assembled.is_empty() {
        Error::Timeout("no response frame within the timeout".into())
    } else {
        Error::Timeout(format!(
            "packet reassembly stalled after {} bytes",
            assembled.len()
        ))
    }
}

/// Reverse each 4-byte word, zero-padding a short tail to the word boundary.
///
/// This is the permutation `[3,2,1,0,7,6,5,4]` over a full frame; applying
/// it twice yields the original bytes, so send and receive share it.
fn word_swap(chunk: &[u8]) -> Vec<u8> {
    let mut out = chunk.to_vec();
    let pad = (4 - out.len() % 4) % 4;
    out.resize(out.len() + pad, 0);
    for word in out.chunks_mut(4) {
        word.reverse();
    }
    out
}

/// Total length of the assembled packet once SOP, the declared length, and
/// EOP line up; `None` while more frames are needed.
fn packet_end(assembled: &[u8]) -> Result<Option<usize>> {
    if assembled.len() < 4 {
        return Ok(None);
    }
    let length = usize::from(LittleEndian::read_u16(&assembled[2..4]));
    if length > MAX_PAYLOAD {
        return Err(Error::Framing(format!(
            "length field declares {length} payload bytes, limit is {MAX_PAYLOAD}"
        )));
    }
    let total = length + FRAME_OVERHEAD;
    if assembled.len() < total {
        return Ok(None);
    }
    if assembled[total - 1] != EOP {
        return Err(Error::Framing(format!(
            "expected end of packet {EOP:#04x} at offset {}, found {:#04x}",
            total - 1,
            assembled[total - 1]
        )));
    }
    Ok(Some(total))
}

#[cfg(target_os = "linux")]
pub use self::socket::SocketCanBus;

#[cfg(target_os = "linux")]
mod socket {
    //! SocketCAN binding.

    use std::io;
    use std::time::Duration;

    use log::debug;
    use socketcan::{CanSocket, EmbeddedFrame, Frame, Socket, StandardId};

    use super::{CanBus, CanFrame};
    use crate::error::{Error, Result};

    /// [`CanBus`] backed by a Linux SocketCAN interface.
    ///
    /// The interface's bitrate is part of its link configuration
    /// (`ip link set canX type can bitrate N`), not of the socket.
    pub struct SocketCanBus {
        socket: CanSocket,
        name: String,
    }

    impl SocketCanBus {
        /// Open a SocketCAN interface such as `can0`.
        pub fn open(interface: &str) -> Result<Self> {
            let socket = CanSocket::open(interface).map_err(|e| Error::Io(e.into()))?;
            debug!("opened CAN interface {interface}");
            Ok(Self {
                socket,
                name: interface.to_string(),
            })
        }

        /// The interface name this bus was opened on.
        pub fn name(&self) -> &str {
            &self.name
        }
    }

    impl CanBus for SocketCanBus {
        fn send_frame(&mut self, id: u32, data: &[u8]) -> Result<()> {
            #[allow(clippy::cast_possible_truncation)]
            let id = StandardId::new(id as u16).ok_or(Error::Config(format!(
                "CAN id {id:#x} does not fit a standard 11-bit identifier"
            )))?;
            let frame = socketcan::CanFrame::new(id, data).ok_or(Error::Config(format!(
                "CAN frame data of {} bytes exceeds the 8 byte limit",
                data.len()
            )))?;
            self.socket.write_frame(&frame)?;
            Ok(())
        }

        fn recv_frame(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
            self.socket.set_read_timeout(timeout)?;
            match self.socket.read_frame() {
                Ok(frame) => Ok(Some(CanFrame {
                    id: frame.raw_id(),
                    data: frame.data().to_vec(),
                })),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    Ok(None)
                },
                Err(e) => Err(Error::Io(e)),
            }
        }
    }
}
