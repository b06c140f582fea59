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

use std::time::Duration;
use serialport::{SerialPort as SerialPortTrait, DataBits, Parity, StopBits};

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Trait for the byte-level serial operations needed by the XMODEM receiver.
///
/// The protocol engine never interprets the transport beyond these two
/// primitives; all control bytes are recognized by the engine itself.
pub trait SerialPort: Send {
    /// Read a single byte, waiting at most `timeout`. A quiet line is
    /// reported as `ErrorKind::TimedOut`.
    fn read_byte(&mut self, timeout: Duration) -> std::io::Result<u8>;

    fn write_byte(&mut self, byte: u8) -> std::io::Result<()>;
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(RealSerialPort { port })
    }
}

impl SerialPort for RealSerialPort {
    fn read_byte(&mut self, timeout: Duration) -> std::io::Result<u8> {
        self.port.set_timeout(timeout)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let mut buf = [0u8; 1];
        self.port.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn write_byte(&mut self, byte: u8) -> std::io::Result<()> {
        self.port.write_all(&[byte])?;
        self.port.flush()?;
        Ok(())
    }
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
pub struct MockSerialPort {
    // Bytes to return on reads (None = timed-out poll)
    responses: Vec<Option<u8>>,
    read_pos: usize,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes,
        }
    }
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn read_byte(&mut self, _timeout: Duration) -> std::io::Result<u8> {
        // Out of responses = timeout
        if self.read_pos >= self.responses.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout"
            ));
        }

        let response = self.responses[self.read_pos];
        self.read_pos += 1;

        match response {
            Some(byte) => Ok(byte),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout"
            )),
        }
    }

    fn write_byte(&mut self, byte: u8) -> std::io::Result<()> {
        self.write_log.push(byte);
        Ok(())
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        assert_eq!(
            self.read_pos,
            self.responses.len(),
            "MockSerialPort dropped with {} unconsumed responses (read {} of {} bytes)",
            self.responses.len() - self.read_pos,
            self.read_pos,
            self.responses.len()
        );

        assert_eq!(
            &self.write_log,
            &self.expected_writes,
            "MockSerialPort write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            self.expected_writes,
            self.write_log.len(),
            self.write_log
        );
    }
}
