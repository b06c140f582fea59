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

//! Destination sinks that accepted payload is committed into.
//!
//! The receiver is agnostic to where accepted blocks go. A sink is armed
//! into the engine together with the serial port; because the engine takes
//! ownership of both, at most one transfer can ever be in flight against a
//! given destination. Re-arming means constructing a new engine with a
//! fresh sink.

// ============================================================================
// Types
// ============================================================================

/// How a session ended, as reported to the sink's completion notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// The sender transmitted EOT and every accepted block was committed.
    Complete,
    /// A further block arrived that the destination could not hold.
    Overflow,
}

/// A block did not fit in the destination's remaining capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow;

/// Invoked exactly once per armed session with the committed data and the
/// final status.
pub type CompletionNotifier = Box<dyn FnOnce(&[u8], TransferStatus) + Send>;

// ============================================================================
// Sink Trait
// ============================================================================

pub trait Sink: Send {
    fn capacity_remaining(&self) -> usize;

    /// Commit one accepted block at `offset` bytes into the transfer.
    /// Offsets only ever advance; a rejected or duplicate frame is never
    /// committed, so a given range is written at most once.
    fn commit(&mut self, offset: usize, block: &[u8]) -> Result<(), Overflow>;

    /// Deliver the final notification for this session. Called exactly once,
    /// after the closing EOT (or the overflowing block's NAK) has already
    /// been written to the wire.
    fn complete(&mut self, total: usize, status: TransferStatus);
}

// ============================================================================
// Rearmable Buffer Sink
// ============================================================================

/// Fills a fixed-capacity buffer and hands the filled prefix to a notifier
/// when the transfer ends.
pub struct BufferSink {
    buffer: Vec<u8>,
    filled: usize,
    notify: Option<CompletionNotifier>,
}

impl BufferSink {
    pub fn new(capacity: usize, notify: CompletionNotifier) -> Self {
        BufferSink {
            buffer: vec![0; capacity],
            filled: 0,
            notify: Some(notify),
        }
    }
}

impl Sink for BufferSink {
    fn capacity_remaining(&self) -> usize {
        self.buffer.len() - self.filled
    }

    fn commit(&mut self, offset: usize, block: &[u8]) -> Result<(), Overflow> {
        let end = offset + block.len();
        if end > self.buffer.len() {
            return Err(Overflow);
        }
        self.buffer[offset..end].copy_from_slice(block);
        if end > self.filled {
            self.filled = end;
        }
        Ok(())
    }

    fn complete(&mut self, total: usize, status: TransferStatus) {
        if let Some(notify) = self.notify.take() {
            notify(&self.buffer[..total], status);
        }
    }
}

// ============================================================================
// Execute-In-Place Sink
// ============================================================================

/// Writes each accepted block straight into a fixed memory region, then
/// hands control to the region when the transfer completes.
///
/// In a boot-loader deployment the entry closure transfers execution to the
/// received image and does not return; the engine guarantees it only fires
/// after the sender's EOT has itself been ACKed, so the sender already has
/// final confirmation before control transfer can reset the receiving side.
/// An overflowed session never jumps into a truncated image.
pub struct ExecSink {
    region: &'static mut [u8],
    filled: usize,
    entry: Option<Box<dyn FnOnce(&[u8]) + Send>>,
}

impl ExecSink {
    pub fn new(region: &'static mut [u8], entry: Box<dyn FnOnce(&[u8]) + Send>) -> Self {
        ExecSink {
            region,
            filled: 0,
            entry: Some(entry),
        }
    }
}

impl Sink for ExecSink {
    fn capacity_remaining(&self) -> usize {
        self.region.len() - self.filled
    }

    fn commit(&mut self, offset: usize, block: &[u8]) -> Result<(), Overflow> {
        let end = offset + block.len();
        if end > self.region.len() {
            return Err(Overflow);
        }
        self.region[offset..end].copy_from_slice(block);
        if end > self.filled {
            self.filled = end;
        }
        Ok(())
    }

    fn complete(&mut self, total: usize, status: TransferStatus) {
        if status != TransferStatus::Complete {
            return;
        }
        if let Some(entry) = self.entry.take() {
            entry(&self.region[..total]);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
