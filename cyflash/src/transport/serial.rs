//! Serial port transport.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use serialport::{DataBits, FlowControl, Parity, StopBits};

use crate::error::{Error, Result};
use crate::protocol::packet::{EOP, FRAME_OVERHEAD, MAX_PAYLOAD, SOP};
use crate::transport::Transport;

/// Packet transport over a serial port.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    timeout: Duration,
}

impl SerialTransport {
    /// Default timeout for serial operations.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Open a serial port with the given parameters.
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        parity: Parity,
        stop_bits: StopBits,
        timeout: Duration,
    ) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(timeout)
            .data_bits(DataBits::Eight)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(FlowControl::None)
            .open()?;

        // Clear any garbage pending on the line before the first command.
        port.clear(serialport::ClearBuffer::All)?;

        Ok(Self {
            port,
            name: port_name.to_string(),
            timeout,
        })
    }

    /// The port name this transport was opened on.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        trace!("tx {} bytes on {}", packet.len(), self.name);
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let packet = read_packet(&mut self.port, self.timeout)?;
        trace!("rx {} bytes on {}", packet.len(), self.name);
        Ok(packet)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.port.set_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn close(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }
}

/// Read one protocol frame from a byte stream.
///
/// Scans past any junk preceding the start-of-packet byte, reads the
/// header, then exactly `length + 3` further bytes (payload tail, checksum,
/// EOP). Consumes nothing beyond the frame.
pub(crate) fn read_packet<R: Read>(reader: &mut R, timeout: Duration) -> Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;

    let mut byte = [0u8; 1];
    loop {
        read_full(reader, &mut byte, deadline)?;
        if byte[0] == SOP {
            break;
        }
        trace!("discarding junk byte {:#04x}", byte[0]);
    }

    // Status byte plus the two length bytes.
    let mut header = [0u8; 3];
    read_full(reader, &mut header, deadline)?;
    let length = usize::from(LittleEndian::read_u16(&header[1..3]));
    if length > MAX_PAYLOAD {
        return Err(Error::Framing(format!(
            "length field declares {length} payload bytes, limit is {MAX_PAYLOAD}"
        )));
    }

    let mut frame = Vec::with_capacity(length + FRAME_OVERHEAD);
    frame.push(SOP);
    frame.extend_from_slice(&header);
    let body_start = frame.len();
    frame.resize(body_start + length + 3, 0);
    read_full(reader, &mut frame[body_start..], deadline)?;

    if frame[frame.len() - 1] != EOP {
        return Err(Error::Framing(format!(
            "expected end of packet {EOP:#04x}, found {:#04x}",
            frame[frame.len() - 1]
        )));
    }

    Ok(frame)
}

/// Fill `buf` completely, honoring the deadline.
///
/// The underlying reader's own timeout provides the blocking; this loop
/// only stitches partial reads together and converts timed-out or
/// exhausted streams into [`Error::Timeout`].
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8], deadline: Instant) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(Error::Timeout(
                    "stream ended before a complete packet arrived".into(),
                ))
            },
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout(
                        "no complete packet within the timeout".into(),
                    ));
                }
            },
            Err(e) => return Err(Error::Io(e)),
        }
        if filled < buf.len() && Instant::now() >= deadline {
            return Err(Error::Timeout("packet incomplete at deadline".into()));
        }
    }
    Ok(())
}
