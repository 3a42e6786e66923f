//! Thin command layer over a transport.
//!
//! One method per bootloader command: each encodes a request, sends it,
//! waits for the response, and decodes it. Errors surface to the caller
//! unchanged; the only built-in retry is the repetitive `EnterBootloader`
//! procedure, which gives the operator time to reset the device.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::image::metadata::AppMetadata;
use crate::protocol::checksum::ChecksumKind;
use crate::protocol::packet::{self, BootloaderIdentity, Command, FlashArrayInfo};
use crate::transport::Transport;

/// Pacing target between `EnterBootloader` attempts.
const INIT_RETRY_SPACING: Duration = Duration::from_millis(100);

/// How long to keep reissuing `EnterBootloader` while the device boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitRetry {
    /// Send a single request and honor the transport timeout.
    Once,
    /// Keep retrying for the given duration.
    For(Duration),
    /// Retry until a well-formed response arrives.
    Forever,
}

impl InitRetry {
    /// Map a CLI-style seconds value: negative means forever, zero means a
    /// single attempt.
    pub fn from_secs(secs: f64) -> Self {
        if secs < 0.0 {
            Self::Forever
        } else if secs == 0.0 {
            Self::Once
        } else {
            Self::For(Duration::from_secs_f64(secs))
        }
    }
}

/// How many data bytes each `SendData`/`ProgramRow` request may carry.
///
/// The upper bound comes from the bootloader's command buffer size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChunkSize {
    /// 16-byte chunks.
    Bytes16,
    /// 32-byte chunks.
    #[default]
    Bytes32,
    /// 64-byte chunks.
    Bytes64,
    /// 128-byte chunks.
    Bytes128,
}

impl ChunkSize {
    /// The chunk size in bytes.
    pub fn get(self) -> usize {
        match self {
            Self::Bytes16 => 16,
            Self::Bytes32 => 32,
            Self::Bytes64 => 64,
            Self::Bytes128 => 128,
        }
    }

    /// Map a byte count to a chunk size, if it is one of the valid sizes.
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            16 => Some(Self::Bytes16),
            32 => Some(Self::Bytes32),
            64 => Some(Self::Bytes64),
            128 => Some(Self::Bytes128),
            _ => None,
        }
    }
}

/// Client for the bootloader's request/response protocol.
pub struct BootloaderClient<T: Transport> {
    transport: T,
    checksum: ChecksumKind,
}

impl<T: Transport> BootloaderClient<T> {
    /// Create a client speaking the given checksum dialect.
    pub fn new(transport: T, checksum: ChecksumKind) -> Self {
        Self { transport, checksum }
    }

    /// Consume the client and return the underlying transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Send one request and decode its response payload.
    fn exchange(&mut self, command: &Command<'_>) -> Result<Vec<u8>> {
        self.transport.send(&command.encode(self.checksum))?;
        let frame = self.transport.receive()?;
        let payload = packet::decode_response(&frame, self.checksum)?;
        Ok(payload.to_vec())
    }

    /// Start a session and read the device identity.
    ///
    /// With a retry window, the request is reissued roughly every 100 ms so
    /// the operator can power-cycle or reset the device; only timeouts and
    /// malformed responses are retried, bootloader status errors surface
    /// immediately.
    pub fn enter_bootloader(&mut self, retry: InitRetry) -> Result<BootloaderIdentity> {
        let payload = match retry {
            InitRetry::Once => self.exchange(&Command::EnterBootloader)?,
            InitRetry::For(window) => self.enter_repeatedly(Some(window))?,
            InitRetry::Forever => self.enter_repeatedly(None)?,
        };
        let identity = BootloaderIdentity::from_payload(&payload)?;
        debug!("entered bootloader: {identity}");
        Ok(identity)
    }

    fn enter_repeatedly(&mut self, window: Option<Duration>) -> Result<Vec<u8>> {
        let deadline = window.map(|w| Instant::now() + w);
        let previous_timeout = self.transport.timeout();
        self.transport.set_timeout(INIT_RETRY_SPACING)?;
        let result = self.enter_loop(deadline);
        // Restore the session timeout even when init failed.
        self.transport.set_timeout(previous_timeout)?;
        result
    }

    fn enter_loop(&mut self, deadline: Option<Instant>) -> Result<Vec<u8>> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let attempt_started = Instant::now();
            match self.exchange(&Command::EnterBootloader) {
                Ok(payload) => {
                    debug!("bootloader answered after {attempts} attempt(s)");
                    return Ok(payload);
                },
                Err(e)
                    if matches!(
                        e,
                        Error::Timeout(_) | Error::Framing(_) | Error::FrameChecksum { .. }
                    ) =>
                {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            warn!("bootloader did not answer within the retry window");
                            return Err(e);
                        }
                    }
                    trace!("enter attempt {attempts} failed: {e}");
                    if let Some(rest) = INIT_RETRY_SPACING.checked_sub(attempt_started.elapsed()) {
                        thread::sleep(rest);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// End the session; the device reboots into the application.
    ///
    /// No response is read: the device may already be resetting.
    pub fn exit_bootloader(&mut self) -> Result<()> {
        self.transport.send(&Command::ExitBootloader.encode(self.checksum))
    }

    /// Program one row, streaming oversized data through `SendData` first.
    pub fn program_row(
        &mut self,
        array_id: u8,
        row_number: u16,
        data: &[u8],
        chunk_size: ChunkSize,
    ) -> Result<()> {
        let limit = chunk_size.get();
        let mut rest = data;
        while rest.len() > limit {
            let (head, tail) = rest.split_at(limit);
            self.exchange(&Command::SendData { data: head })?;
            rest = tail;
        }
        self.exchange(&Command::ProgramRow {
            array_id,
            row_number,
            data: rest,
        })?;
        Ok(())
    }

    /// Erase one flash row.
    pub fn erase_row(&mut self, array_id: u8, row_number: u16) -> Result<()> {
        self.exchange(&Command::EraseRow { array_id, row_number })?;
        Ok(())
    }

    /// Read back the device's checksum of one flash row.
    pub fn verify_row(&mut self, array_id: u8, row_number: u16) -> Result<u8> {
        let payload = self.exchange(&Command::VerifyRow { array_id, row_number })?;
        payload.first().copied().ok_or(Error::Framing(
            "empty VerifyRow response payload".into(),
        ))
    }

    /// Check the application checksum over all programmed flash.
    pub fn verify_checksum(&mut self) -> Result<bool> {
        let payload = self.exchange(&Command::VerifyChecksum)?;
        let byte = payload.first().copied().ok_or(Error::Framing(
            "empty VerifyChecksum response payload".into(),
        ))?;
        Ok(byte != 0)
    }

    /// Query the programmable row range of a flash array.
    pub fn get_flash_size(&mut self, array_id: u8) -> Result<FlashArrayInfo> {
        let payload = self.exchange(&Command::GetFlashSize { array_id })?;
        FlashArrayInfo::from_payload(array_id, &payload)
    }

    /// Read the application metadata block.
    pub fn get_metadata(&mut self, app_index: u8) -> Result<AppMetadata> {
        let payload = self.exchange(&Command::GetMetadata { app_index })?;
        AppMetadata::from_bytes(&payload)
    }

    /// Resynchronize a bootloader stuck mid-command.
    pub fn sync_bootloader(&mut self) -> Result<()> {
        self.exchange(&Command::SyncBootloader)?;
        Ok(())
    }

    /// Release the underlying transport.
    pub fn close(&mut self) -> Result<()> {
        self.transport.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{encode_response, Status};
    use std::collections::VecDeque;

    const SUM: ChecksumKind = ChecksumKind::Sum2Complement;

    /// Transport replaying canned responses and recording sent frames.
    struct MockTransport {
        sent: Vec<Vec<u8>>,
        responses: VecDeque<Result<Vec<u8>>>,
        timeout: Duration,
    }

    impl MockTransport {
        fn new(responses: Vec<Result<Vec<u8>>>) -> Self {
            Self {
                sent: Vec::new(),
                responses: responses.into(),
                timeout: Duration::from_secs(5),
            }
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, packet: &[u8]) -> Result<()> {
            self.sent.push(packet.to_vec());
            Ok(())
        }

        fn receive(&mut self) -> Result<Vec<u8>> {
            self.responses
                .pop_front()
                .unwrap_or(Err(Error::Timeout("mock exhausted".into())))
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

    fn identity_payload() -> Vec<u8> {
        vec![0x93, 0x11, 0xA6, 0x04, 17, 0x00, 0x10, 0x02]
    }

    #[test]
    fn test_enter_bootloader_once() {
        let transport = MockTransport::new(vec![Ok(encode_response(
            Status::Success,
            &identity_payload(),
            SUM,
        ))]);
        let mut client = BootloaderClient::new(transport, SUM);
        let identity = client.enter_bootloader(InitRetry::Once).unwrap();
        assert_eq!(identity.silicon_id, 0x04A6_1193);
        assert_eq!(identity.silicon_rev, 17);

        let transport = client.into_transport();
        assert_eq!(transport.sent.len(), 1);
        assert_eq!(transport.sent[0][1], 0x38);
    }

    #[test]
    fn test_enter_bootloader_retries_through_timeouts() {
        // Five timeouts, then a valid identity: the repetitive-init loop
        // must keep the pace and succeed after roughly half a second.
        let mut responses: Vec<Result<Vec<u8>>> = (0..5)
            .map(|_| Err(Error::Timeout("no response".into())))
            .collect();
        responses.push(Ok(encode_response(Status::Success, &identity_payload(), SUM)));

        let mut client = BootloaderClient::new(MockTransport::new(responses), SUM);
        let started = Instant::now();
        let identity = client
            .enter_bootloader(InitRetry::For(Duration::from_secs(1)))
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(identity.silicon_rev, 17);
        assert!(elapsed >= Duration::from_millis(500), "elapsed {elapsed:?}");

        let transport = client.into_transport();
        assert_eq!(transport.sent.len(), 6);
        // The session timeout is restored after init.
        assert_eq!(transport.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_enter_bootloader_gives_up_after_window() {
        let responses: Vec<Result<Vec<u8>>> = (0..100)
            .map(|_| Err(Error::Timeout("no response".into())))
            .collect();
        let mut client = BootloaderClient::new(MockTransport::new(responses), SUM);
        let result = client.enter_bootloader(InitRetry::For(Duration::from_millis(250)));
        assert!(matches!(result, Err(Error::Timeout(_))));

        let attempts = client.into_transport().sent.len();
        assert!((2..=10).contains(&attempts), "attempts {attempts}");
    }

    #[test]
    fn test_enter_bootloader_status_error_not_retried() {
        let transport =
            MockTransport::new(vec![Ok(encode_response(Status::BadKey, &[], SUM))]);
        let mut client = BootloaderClient::new(transport, SUM);
        let result = client.enter_bootloader(InitRetry::For(Duration::from_secs(1)));
        assert!(matches!(result, Err(Error::Bootloader(Status::BadKey))));
        assert_eq!(client.into_transport().sent.len(), 1);
    }

    #[test]
    fn test_program_row_streams_chunks() {
        let empty = encode_response(Status::Success, &[], SUM);
        let transport = MockTransport::new(vec![
            Ok(empty.clone()),
            Ok(empty.clone()),
            Ok(empty.clone()),
        ]);
        let mut client = BootloaderClient::new(transport, SUM);
        let data: Vec<u8> = (0..70).map(|i| i as u8).collect();
        client.program_row(0, 22, &data, ChunkSize::Bytes32).unwrap();

        let sent = client.into_transport().sent;
        assert_eq!(sent.len(), 3);
        // Two SendData chunks of 32 bytes each, then ProgramRow with 6.
        assert_eq!(sent[0][1], 0x37);
        assert_eq!(sent[0].len(), 32 + 7);
        assert_eq!(sent[1][1], 0x37);
        assert_eq!(sent[2][1], 0x39);
        assert_eq!(sent[2].len(), 3 + 6 + 7);
    }

    #[test]
    fn test_program_row_small_row_uses_single_command() {
        let transport =
            MockTransport::new(vec![Ok(encode_response(Status::Success, &[], SUM))]);
        let mut client = BootloaderClient::new(transport, SUM);
        client
            .program_row(0, 5, &[0xAB; 32], ChunkSize::Bytes32)
            .unwrap();
        let sent = client.into_transport().sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][1], 0x39);
    }

    #[test]
    fn test_program_row_empty_data() {
        let transport =
            MockTransport::new(vec![Ok(encode_response(Status::Success, &[], SUM))]);
        let mut client = BootloaderClient::new(transport, SUM);
        client.program_row(1, 9, &[], ChunkSize::Bytes16).unwrap();
        let sent = client.into_transport().sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][1], 0x39);
        assert_eq!(sent[0].len(), 3 + 7);
    }

    #[test]
    fn test_verify_row_returns_checksum_byte() {
        let transport =
            MockTransport::new(vec![Ok(encode_response(Status::Success, &[0x5C], SUM))]);
        let mut client = BootloaderClient::new(transport, SUM);
        assert_eq!(client.verify_row(0, 22).unwrap(), 0x5C);
    }

    #[test]
    fn test_verify_checksum_zero_is_false() {
        let transport =
            MockTransport::new(vec![Ok(encode_response(Status::Success, &[0x00], SUM))]);
        let mut client = BootloaderClient::new(transport, SUM);
        assert!(!client.verify_checksum().unwrap());
    }

    #[test]
    fn test_get_flash_size() {
        let transport = MockTransport::new(vec![Ok(encode_response(
            Status::Success,
            &[0x16, 0x00, 0xFF, 0x00],
            SUM,
        ))]);
        let mut client = BootloaderClient::new(transport, SUM);
        let info = client.get_flash_size(0).unwrap();
        assert_eq!((info.first_row, info.last_row), (22, 255));
    }

    #[test]
    fn test_get_metadata_decodes_block() {
        let mut block = vec![0u8; 56];
        block[12..14].copy_from_slice(&0x0205u16.to_le_bytes());
        block[14..16].copy_from_slice(&3u16.to_le_bytes());
        let transport =
            MockTransport::new(vec![Ok(encode_response(Status::Success, &block, SUM))]);
        let mut client = BootloaderClient::new(transport, SUM);
        let meta = client.get_metadata(0).unwrap();
        assert_eq!(meta.app_version, 0x0205);
        assert_eq!(meta.app_id, 3);
    }

    #[test]
    fn test_exit_bootloader_does_not_read() {
        // No responses queued: exit must not attempt a receive.
        let transport = MockTransport::new(vec![]);
        let mut client = BootloaderClient::new(transport, SUM);
        client.exit_bootloader().unwrap();
        let sent = client.into_transport().sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][1], 0x3B);
    }

    #[test]
    fn test_bootloader_status_surfaces_as_error() {
        let transport =
            MockTransport::new(vec![Ok(encode_response(Status::BadRow, &[], SUM))]);
        let mut client = BootloaderClient::new(transport, SUM);
        assert!(matches!(
            client.erase_row(0, 1000),
            Err(Error::Bootloader(Status::BadRow))
        ));
    }

    #[test]
    fn test_init_retry_from_secs() {
        assert_eq!(InitRetry::from_secs(-1.0), InitRetry::Forever);
        assert_eq!(InitRetry::from_secs(0.0), InitRetry::Once);
        assert_eq!(
            InitRetry::from_secs(2.0),
            InitRetry::For(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_chunk_size_mapping() {
        assert_eq!(ChunkSize::from_bytes(16), Some(ChunkSize::Bytes16));
        assert_eq!(ChunkSize::from_bytes(32), Some(ChunkSize::Bytes32));
        assert_eq!(ChunkSize::from_bytes(64), Some(ChunkSize::Bytes64));
        assert_eq!(ChunkSize::from_bytes(128), Some(ChunkSize::Bytes128));
        assert_eq!(ChunkSize::from_bytes(48), None);
        assert_eq!(ChunkSize::default().get(), 32);
    }
}
