// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::marker::PhantomData;
use std::time::Duration;
use crate::serial::SerialPort;
use crate::sink::{Overflow, Sink, TransferStatus};
use crate::protocol::*;

/// Transport read timeout for a single poll
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Timed-out polls while waiting for the first frame before a keepalive NAK
/// is sent to prod a sender that started before we were armed
const KEEPALIVE_POLLS: u32 = 4;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum ReceiverError {
    Io(std::io::Error),
    SessionComplete { total: usize, status: TransferStatus },
    RetryLimitExceeded,
}

impl std::fmt::Display for ReceiverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiverError::Io(e) => write!(f, "I/O error: {}", e),
            ReceiverError::SessionComplete { total, .. } => {
                write!(f, "Session complete ({} bytes)", total)
            }
            ReceiverError::RetryLimitExceeded => write!(f, "Too many consecutive rejected frames"),
        }
    }
}

impl std::error::Error for ReceiverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReceiverError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ReceiverError {
    fn from(err: std::io::Error) -> Self {
        ReceiverError::Io(err)
    }
}

// ============================================================================
// States
// ============================================================================

pub struct AwaitFrame;
pub struct ReceiveHeader;
pub struct ReceivePayload;
pub struct VerifyChecksum;

// ============================================================================
// Block Disposition
// ============================================================================

/// Classification of the frame currently on the wire, decided from its
/// block number before the payload is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockDisposition {
    /// The next expected block: commit and ACK
    Accept,
    /// The last accepted block resent because our ACK was lost: ACK again
    /// without re-committing
    Duplicate,
    /// Any other block number: drain the frame to stay in sync, then NAK
    Stale,
}

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    sink: Box<dyn Sink>,
    expected_block: u8,
    frame_block: u8,
    disposition: BlockDisposition,
    payload: [u8; PAYLOAD_SIZE],
    bytes_received: usize,
    checksum: u8,
    committed: usize,
    blocks_accepted: u32,
    idle_polls: u32,
    rejects: u32,
    max_retries: u32,
    debug: bool,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError>;
}

// ============================================================================
// Helpers
// ============================================================================

impl<S> ReceiverFsm<S> {
    fn transition<T>(self) -> Box<ReceiverFsm<T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            serial: self.serial,
            sink: self.sink,
            expected_block: self.expected_block,
            frame_block: self.frame_block,
            disposition: self.disposition,
            payload: self.payload,
            bytes_received: self.bytes_received,
            checksum: self.checksum,
            committed: self.committed,
            blocks_accepted: self.blocks_accepted,
            idle_polls: self.idle_polls,
            rejects: self.rejects,
            max_retries: self.max_retries,
            debug: self.debug,
        })
    }

    fn io_error(&self, e: std::io::Error) -> ReceiverError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        ReceiverError::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name)
        ))
    }

    /// NAK the frame in progress. Never advances `expected_block` or the
    /// commit cursor; the sender retransmits and we try again.
    fn reject(&mut self, reason: &str) -> Result<(), ReceiverError> {
        if self.debug { println!("Rejected frame ({}), sending NAK", reason); }
        self.serial.write_byte(NAK)?;
        self.rejects += 1;
        if self.max_retries != 0 && self.rejects >= self.max_retries {
            return Err(ReceiverError::RetryLimitExceeded);
        }
        Ok(())
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl ReceiverState for ReceiverFsm<AwaitFrame> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        match fsm.serial.read_byte(POLL_TIMEOUT) {
            Ok(b) if b == SOH => {
                if fsm.debug { println!("Received: SOH"); }
                fsm.idle_polls = 0;
                let next = fsm.transition::<ReceiveHeader>();
                Ok(next as Box<dyn ReceiverState>)
            }
            Ok(b) if b == EOT => {
                if fsm.debug { println!("Received: EOT"); }

                // ACK goes out before the sink hears about completion, so an
                // execute-in-place sink can only take over after the sender
                // has its final confirmation
                fsm.serial.write_byte(ACK)?;
                if fsm.debug { println!("Sent: ACK"); }

                let total = fsm.committed;
                fsm.sink.complete(total, TransferStatus::Complete);
                Err(ReceiverError::SessionComplete { total, status: TransferStatus::Complete })
            }
            Ok(b) => {
                if fsm.debug { println!("Unexpected byte 0x{:02X} while waiting for SOH", b); }
                fsm.idle_polls = 0;
                fsm.reject("bad sync byte")?;
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // Keepalive: the sender may have started before we were
                // armed, so prod it with a NAK every few quiet polls until
                // the first block lands
                if fsm.blocks_accepted == 0 {
                    fsm.idle_polls += 1;
                    if fsm.idle_polls >= KEEPALIVE_POLLS {
                        fsm.idle_polls = 0;
                        fsm.serial.write_byte(NAK)?;
                        if fsm.debug { println!("Idle, sent keepalive NAK"); }
                    }
                }
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }
}

impl ReceiverState for ReceiverFsm<ReceiveHeader> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        let block = match fsm.serial.read_byte(POLL_TIMEOUT) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                fsm.reject("timeout reading block number")?;
                let next = fsm.transition::<AwaitFrame>();
                return Ok(next as Box<dyn ReceiverState>);
            }
            Err(e) => return Err(fsm.io_error(e)),
        };

        let complement = match fsm.serial.read_byte(POLL_TIMEOUT) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                fsm.reject("timeout reading block complement")?;
                let next = fsm.transition::<AwaitFrame>();
                return Ok(next as Box<dyn ReceiverState>);
            }
            Err(e) => return Err(fsm.io_error(e)),
        };

        if complement != 0xFF - block {
            fsm.reject("bad block complement")?;
            let next = fsm.transition::<AwaitFrame>();
            return Ok(next as Box<dyn ReceiverState>);
        }

        fsm.frame_block = block;
        fsm.disposition = if block == fsm.expected_block {
            BlockDisposition::Accept
        } else if fsm.blocks_accepted > 0 && block == fsm.expected_block.wrapping_sub(1) {
            BlockDisposition::Duplicate
        } else {
            BlockDisposition::Stale
        };

        if fsm.debug {
            println!("Header: block {} (expecting {}), {:?}",
                     block, fsm.expected_block, fsm.disposition);
        }

        fsm.bytes_received = 0;
        fsm.checksum = 0;
        let next = fsm.transition::<ReceivePayload>();
        Ok(next as Box<dyn ReceiverState>)
    }
}

impl ReceiverState for ReceiverFsm<ReceivePayload> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        while fsm.bytes_received < PAYLOAD_SIZE {
            match fsm.serial.read_byte(POLL_TIMEOUT) {
                Ok(byte) => {
                    fsm.payload[fsm.bytes_received] = byte;
                    fsm.checksum = fsm.checksum.wrapping_add(byte);
                    fsm.bytes_received += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    fsm.reject("timeout reading payload")?;
                    let next = fsm.transition::<AwaitFrame>();
                    return Ok(next as Box<dyn ReceiverState>);
                }
                Err(e) => return Err(fsm.io_error(e)),
            }
        }

        if fsm.debug { println!("Received: 128 byte payload"); }

        let next = fsm.transition::<VerifyChecksum>();
        Ok(next as Box<dyn ReceiverState>)
    }
}

impl ReceiverState for ReceiverFsm<VerifyChecksum> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        let received_checksum = match fsm.serial.read_byte(POLL_TIMEOUT) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                fsm.reject("timeout reading checksum")?;
                let next = fsm.transition::<AwaitFrame>();
                return Ok(next as Box<dyn ReceiverState>);
            }
            Err(e) => return Err(fsm.io_error(e)),
        };

        if fsm.debug {
            println!("Received: Checksum 0x{:02X}, Expected: 0x{:02X}",
                     received_checksum, fsm.checksum);
        }

        if received_checksum != fsm.checksum {
            fsm.reject("checksum mismatch")?;
            let next = fsm.transition::<AwaitFrame>();
            return Ok(next as Box<dyn ReceiverState>);
        }

        match fsm.disposition {
            BlockDisposition::Accept => {
                match fsm.sink.commit(fsm.committed, &fsm.payload) {
                    Ok(()) => {
                        fsm.serial.write_byte(ACK)?;
                        if fsm.debug { println!("Sent: ACK for block {}", fsm.frame_block); }

                        fsm.committed += PAYLOAD_SIZE;
                        fsm.expected_block = fsm.expected_block.wrapping_add(1);
                        fsm.blocks_accepted += 1;
                        fsm.rejects = 0;

                        let next = fsm.transition::<AwaitFrame>();
                        Ok(next as Box<dyn ReceiverState>)
                    }
                    Err(Overflow) => {
                        if fsm.debug { println!("Destination full, block {} dropped", fsm.frame_block); }

                        // The block was never committed, so NAK it rather
                        // than silently truncating, then surface the
                        // overflow once through the sink
                        fsm.serial.write_byte(NAK)?;
                        let total = fsm.committed;
                        fsm.sink.complete(total, TransferStatus::Overflow);
                        Err(ReceiverError::SessionComplete { total, status: TransferStatus::Overflow })
                    }
                }
            }
            BlockDisposition::Duplicate => {
                // Our ACK for this block was lost; ACK again so the sender
                // moves on, but never write the payload twice
                fsm.serial.write_byte(ACK)?;
                if fsm.debug { println!("Sent: ACK for duplicate block {}", fsm.frame_block); }

                let next = fsm.transition::<AwaitFrame>();
                Ok(next as Box<dyn ReceiverState>)
            }
            BlockDisposition::Stale => {
                fsm.reject("unexpected block number")?;
                let next = fsm.transition::<AwaitFrame>();
                Ok(next as Box<dyn ReceiverState>)
            }
        }
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl ReceiverFsm<AwaitFrame> {
    /// Arm the engine with a destination sink and start a fresh session.
    ///
    /// The engine takes ownership of the port and the sink, so only one
    /// transfer can be in flight against a destination; accepting another
    /// requires arming a new engine with a fresh sink.
    pub fn arm(
        serial: Box<dyn SerialPort>,
        sink: Box<dyn Sink>,
        max_retries: u32,
        debug: bool,
    ) -> Box<dyn ReceiverState> {
        Box::new(ReceiverFsm {
            state: PhantomData::<AwaitFrame>,
            serial,
            sink,
            expected_block: 1,
            frame_block: 0,
            disposition: BlockDisposition::Stale,
            payload: [0; PAYLOAD_SIZE],
            bytes_received: 0,
            checksum: 0,
            committed: 0,
            blocks_accepted: 0,
            idle_polls: 0,
            rejects: 0,
            max_retries,
            debug,
        })
    }
}

/// Drive an armed engine until its session ends, returning the committed
/// byte count and final status.
pub fn run(mut state: Box<dyn ReceiverState>) -> Result<(usize, TransferStatus), ReceiverError> {
    loop {
        match state.step() {
            Ok(next) => state = next,
            Err(ReceiverError::SessionComplete { total, status }) => return Ok((total, status)),
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockSerialPort;
    use crate::sink::{BufferSink, ExecSink};
    use std::sync::{Arc, Mutex};

    type Captured = Arc<Mutex<Option<(Vec<u8>, TransferStatus)>>>;

    fn capture() -> (Captured, Box<BufferSink>) {
        capture_with_capacity(1024)
    }

    fn capture_with_capacity(capacity: usize) -> (Captured, Box<BufferSink>) {
        let captured: Captured = Arc::new(Mutex::new(None));
        let captured_clone = Arc::clone(&captured);
        let sink = Box::new(BufferSink::new(capacity, Box::new(move |data, status| {
            *captured_clone.lock().unwrap() = Some((data.to_vec(), status));
        })));
        (captured, sink)
    }

    fn checksum(payload: &[u8]) -> u8 {
        payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
    }

    fn push_frame(responses: &mut Vec<Option<u8>>, block: u8, payload: &[u8; PAYLOAD_SIZE]) {
        responses.push(Some(SOH));
        responses.push(Some(block));
        responses.push(Some(0xFF - block));
        for &byte in payload.iter() {
            responses.push(Some(byte));
        }
        responses.push(Some(checksum(payload)));
    }

    #[test]
    fn test_receive_two_blocks() {
        let mut responses = Vec::new();
        push_frame(&mut responses, 1, &[0xAA; PAYLOAD_SIZE]);
        push_frame(&mut responses, 2, &[0xBB; PAYLOAD_SIZE]);
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, ACK, ACK];

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let (captured, sink) = capture_with_capacity(256);
        let fsm = ReceiverFsm::arm(mock_serial, sink, 0, true);

        let (total, status) = run(fsm).expect("transfer should complete");
        assert_eq!(total, 256);
        assert_eq!(status, TransferStatus::Complete);

        let (data, status) = captured.lock().unwrap().take().expect("notifier should run");
        assert_eq!(status, TransferStatus::Complete);
        assert_eq!(data.len(), 256);
        assert_eq!(&data[..128], &[0xAA; 128]);
        assert_eq!(&data[128..], &[0xBB; 128]);
    }

    #[test]
    fn test_corrupt_checksum_then_retransmit() {
        let payload = [0x42; PAYLOAD_SIZE];

        let mut responses = Vec::new();

        // First attempt arrives with a corrupted checksum byte
        responses.push(Some(SOH));
        responses.push(Some(1));
        responses.push(Some(0xFF - 1));
        for &byte in payload.iter() {
            responses.push(Some(byte));
        }
        responses.push(Some(checksum(&payload) ^ 0xFF));

        // Retransmission is clean
        push_frame(&mut responses, 1, &payload);
        push_frame(&mut responses, 2, &[0x43; PAYLOAD_SIZE]);
        responses.push(Some(EOT));

        let expected_writes = vec![NAK, ACK, ACK, ACK];

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let (captured, sink) = capture();
        let fsm = ReceiverFsm::arm(mock_serial, sink, 0, true);

        let (total, _) = run(fsm).expect("transfer should complete");
        assert_eq!(total, 256);

        let (data, _) = captured.lock().unwrap().take().expect("notifier should run");
        assert_eq!(&data[..128], &[0x42; 128]);
        assert_eq!(&data[128..], &[0x43; 128]);
    }

    #[test]
    fn test_duplicate_block_acked_without_recommit() {
        let mut responses = Vec::new();
        push_frame(&mut responses, 1, &[0x11; PAYLOAD_SIZE]);
        // Sender never saw our ACK and resends block 1
        push_frame(&mut responses, 1, &[0x11; PAYLOAD_SIZE]);
        push_frame(&mut responses, 2, &[0x22; PAYLOAD_SIZE]);
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, ACK, ACK, ACK];

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let (captured, sink) = capture();
        let fsm = ReceiverFsm::arm(mock_serial, sink, 0, false);

        let (total, status) = run(fsm).expect("transfer should complete");
        assert_eq!(total, 256, "duplicate must not advance the cursor");
        assert_eq!(status, TransferStatus::Complete);

        let (data, _) = captured.lock().unwrap().take().expect("notifier should run");
        assert_eq!(data.len(), 256);
        assert_eq!(&data[..128], &[0x11; 128]);
        assert_eq!(&data[128..], &[0x22; 128]);
    }

    #[test]
    fn test_stale_block_number_rejected() {
        let mut responses = Vec::new();
        push_frame(&mut responses, 1, &[0x11; PAYLOAD_SIZE]);
        // Block 7 is neither the expected block 2 nor a duplicate of 1
        push_frame(&mut responses, 7, &[0x77; PAYLOAD_SIZE]);
        push_frame(&mut responses, 2, &[0x22; PAYLOAD_SIZE]);
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, NAK, ACK, ACK];

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let (captured, sink) = capture();
        let fsm = ReceiverFsm::arm(mock_serial, sink, 0, false);

        let (total, _) = run(fsm).expect("transfer should complete");
        assert_eq!(total, 256);

        let (data, _) = captured.lock().unwrap().take().expect("notifier should run");
        assert_eq!(&data[..128], &[0x11; 128]);
        assert_eq!(&data[128..], &[0x22; 128]);
    }

    #[test]
    fn test_eot_before_any_data() {
        let responses = vec![Some(EOT)];
        let expected_writes = vec![ACK];

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let (captured, sink) = capture();
        let fsm = ReceiverFsm::arm(mock_serial, sink, 0, false);

        let (total, status) = run(fsm).expect("transfer should complete");
        assert_eq!(total, 0);
        assert_eq!(status, TransferStatus::Complete);

        let (data, status) = captured.lock().unwrap().take().expect("notifier should run");
        assert!(data.is_empty());
        assert_eq!(status, TransferStatus::Complete);
    }

    #[test]
    fn test_overflow_reported_once() {
        let mut responses = Vec::new();
        push_frame(&mut responses, 1, &[0x41; PAYLOAD_SIZE]);
        push_frame(&mut responses, 2, &[0x42; PAYLOAD_SIZE]);

        let expected_writes = vec![ACK, NAK];

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let (captured, sink) = capture_with_capacity(128);
        let fsm = ReceiverFsm::arm(mock_serial, sink, 0, true);

        let (total, status) = run(fsm).expect("session should end with a report");
        assert_eq!(total, 128);
        assert_eq!(status, TransferStatus::Overflow);

        let (data, status) = captured.lock().unwrap().take().expect("notifier should run");
        assert_eq!(status, TransferStatus::Overflow);
        assert_eq!(data, vec![0x41; 128], "the overflowing block must leave no trace");
    }

    #[test]
    fn test_garbage_sync_byte_recovered() {
        let mut responses = vec![Some(0x2A)];
        push_frame(&mut responses, 1, &[0x55; PAYLOAD_SIZE]);
        responses.push(Some(EOT));

        let expected_writes = vec![NAK, ACK, ACK];

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let (_, sink) = capture();
        let fsm = ReceiverFsm::arm(mock_serial, sink, 0, false);

        let (total, _) = run(fsm).expect("transfer should complete");
        assert_eq!(total, 128);
    }

    #[test]
    fn test_bad_block_complement_rejected() {
        let mut responses = vec![Some(SOH), Some(1), Some(0x00)];
        push_frame(&mut responses, 1, &[0x66; PAYLOAD_SIZE]);
        responses.push(Some(EOT));

        let expected_writes = vec![NAK, ACK, ACK];

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let (_, sink) = capture();
        let fsm = ReceiverFsm::arm(mock_serial, sink, 0, false);

        let (total, _) = run(fsm).expect("transfer should complete");
        assert_eq!(total, 128);
    }

    #[test]
    fn test_timeout_mid_payload_naks_and_resyncs() {
        let mut responses = vec![Some(SOH), Some(1), Some(0xFF - 1)];
        for _ in 0..50 {
            responses.push(Some(0x33));
        }
        // Line goes quiet mid-block; the partial frame ages out
        responses.push(None);
        push_frame(&mut responses, 1, &[0x33; PAYLOAD_SIZE]);
        responses.push(Some(EOT));

        let expected_writes = vec![NAK, ACK, ACK];

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let (captured, sink) = capture();
        let fsm = ReceiverFsm::arm(mock_serial, sink, 0, false);

        let (total, _) = run(fsm).expect("transfer should complete");
        assert_eq!(total, 128);

        let (data, _) = captured.lock().unwrap().take().expect("notifier should run");
        assert_eq!(data, vec![0x33; 128]);
    }

    #[test]
    fn test_keepalive_nak_while_awaiting_first_frame() {
        let mut responses = vec![None, None, None, None];
        push_frame(&mut responses, 1, &[0x99; PAYLOAD_SIZE]);
        responses.push(Some(EOT));

        // One keepalive NAK after four quiet polls, then the normal path
        let expected_writes = vec![NAK, ACK, ACK];

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let (_, sink) = capture();
        let fsm = ReceiverFsm::arm(mock_serial, sink, 0, true);

        let (total, _) = run(fsm).expect("transfer should complete");
        assert_eq!(total, 128, "keepalive must not disturb block sequencing");
    }

    #[test]
    fn test_no_keepalive_after_first_block() {
        let mut responses = Vec::new();
        push_frame(&mut responses, 1, &[0x77; PAYLOAD_SIZE]);
        for _ in 0..6 {
            responses.push(None);
        }
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, ACK];

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let (_, sink) = capture();
        let fsm = ReceiverFsm::arm(mock_serial, sink, 0, false);

        let (total, _) = run(fsm).expect("transfer should complete");
        assert_eq!(total, 128);
    }

    #[test]
    fn test_block_number_wraps_to_zero() {
        let blocks = 256usize;
        let mut responses = Vec::new();
        for i in 0..blocks {
            // Sender numbering: 1, 2, ... 255, 0
            let block = (i as u8).wrapping_add(1);
            push_frame(&mut responses, block, &[i as u8; PAYLOAD_SIZE]);
        }
        responses.push(Some(EOT));

        let expected_writes = vec![ACK; blocks + 1];

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let (captured, sink) = capture_with_capacity(blocks * PAYLOAD_SIZE);
        let fsm = ReceiverFsm::arm(mock_serial, sink, 0, false);

        let (total, status) = run(fsm).expect("transfer should complete");
        assert_eq!(total, blocks * PAYLOAD_SIZE);
        assert_eq!(status, TransferStatus::Complete);

        let (data, _) = captured.lock().unwrap().take().expect("notifier should run");
        assert_eq!(data[255 * PAYLOAD_SIZE], 255, "block numbered 0 lands after block 255");
    }

    #[test]
    fn test_retry_limit_aborts_session() {
        let responses = vec![Some(0x2A), Some(0x2A), Some(0x2A)];
        let expected_writes = vec![NAK, NAK, NAK];

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let (captured, sink) = capture();
        let fsm = ReceiverFsm::arm(mock_serial, sink, 3, false);

        match run(fsm) {
            Err(ReceiverError::RetryLimitExceeded) => {}
            other => panic!("Expected retry limit abort, got {:?}", other),
        }

        assert!(captured.lock().unwrap().is_none(), "an aborted session never notifies");
    }

    #[test]
    fn test_accepted_block_resets_retry_counter() {
        let mut responses = vec![Some(0x2A)];
        push_frame(&mut responses, 1, &[0x10; PAYLOAD_SIZE]);
        responses.push(Some(0x2A));
        push_frame(&mut responses, 2, &[0x20; PAYLOAD_SIZE]);
        responses.push(Some(EOT));

        let expected_writes = vec![NAK, ACK, NAK, ACK, ACK];

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let (_, sink) = capture();
        let fsm = ReceiverFsm::arm(mock_serial, sink, 2, false);

        let (total, _) = run(fsm).expect("isolated rejects must not trip the limit");
        assert_eq!(total, 256);
    }

    #[test]
    fn test_exec_sink_entry_after_final_ack() {
        let mut responses = Vec::new();
        push_frame(&mut responses, 1, &[0xAA; PAYLOAD_SIZE]);
        push_frame(&mut responses, 2, &[0xBB; PAYLOAD_SIZE]);
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, ACK, ACK];

        let region: &'static mut [u8] = Box::leak(vec![0u8; 256].into_boxed_slice());
        let image: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
        let image_clone = Arc::clone(&image);
        let sink = Box::new(ExecSink::new(region, Box::new(move |data| {
            *image_clone.lock().unwrap() = Some(data.to_vec());
        })));

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = ReceiverFsm::arm(mock_serial, sink, 0, false);

        let (total, status) = run(fsm).expect("transfer should complete");
        assert_eq!(total, 256);
        assert_eq!(status, TransferStatus::Complete);

        let data = image.lock().unwrap().take().expect("entry should run after the EOT ACK");
        assert_eq!(&data[..128], &[0xAA; 128]);
        assert_eq!(&data[128..], &[0xBB; 128]);
    }
}
