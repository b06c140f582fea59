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

// XMODEM receive engine (checksum variant)
mod protocol;
mod receiver;
mod serial;
mod sink;

use clap::Parser;
use serialport::{DataBits, Parity, StopBits};
use std::path::PathBuf;
use serial::RealSerialPort;
use sink::{BufferSink, TransferStatus};

#[derive(Parser)]
#[command(name = "rxmodem")]
#[command(about = "XMODEM (checksum) receiver for serial lines", long_about = None)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "9600")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name="BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name="BITS")]
    stop_bits: u8,

    /// Destination capacity in bytes; a transfer that outgrows it is truncated
    #[arg(long, default_value = "1048576", value_name = "BYTES")]
    max_size: usize,

    /// Abort after this many consecutive rejected frames (0 = retry forever)
    #[arg(long, default_value = "0", value_name = "COUNT")]
    max_retries: u32,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    /// File to write the received data to
    output: PathBuf,
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn main() {
    let cli = Cli::parse();

    let data_bits = match parse_data_bits(cli.data_bits) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let parity = match parse_parity(&cli.parity) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let stop_bits = match parse_stop_bits(cli.stop_bits) {
        Ok(sb) => sb,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    println!("Opening serial port: {}", cli.port);
    println!("Settings: {} baud, {:?}, {:?}, {:?}", cli.baud, data_bits, parity, stop_bits);

    let serial_port = match RealSerialPort::open(&cli.port, cli.baud, data_bits, parity, stop_bits) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Failed to open serial port: {}", e);
            std::process::exit(1);
        }
    };

    println!("\nWaiting for sender...");

    match receive_to_file(serial_port, &cli.output, cli.max_size, cli.max_retries, cli.debug) {
        Ok((total, TransferStatus::Complete)) => {
            println!("\nReceived {} bytes to {}", total, cli.output.display());
        }
        Ok((total, TransferStatus::Overflow)) => {
            eprintln!(
                "\nDestination full after {} bytes; transfer truncated. \
                 Partial data written to {}",
                total,
                cli.output.display()
            );
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Receive failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn receive_to_file(
    serial_port: RealSerialPort,
    output: &PathBuf,
    max_size: usize,
    max_retries: u32,
    debug: bool,
) -> Result<(usize, TransferStatus), receiver::ReceiverError> {
    use receiver::ReceiverFsm;

    let dest = output.clone();
    let sink = BufferSink::new(max_size, Box::new(move |data, _status| {
        // Overflow still writes what was committed; main reports the truncation
        if let Err(e) = std::fs::write(&dest, data) {
            eprintln!("Failed to write {}: {}", dest.display(), e);
        }
    }));

    let fsm = ReceiverFsm::arm(Box::new(serial_port), Box::new(sink), max_retries, debug);
    receiver::run(fsm)
}
