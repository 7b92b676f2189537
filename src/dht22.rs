use std::time::Duration;

use thiserror::Error;

use crate::hardware::BitReader;

pub const START_OF_FRAME: u8 = 1;
pub const FRAME_BITS: usize = 40;

/// One electrical read attempt as returned by the bit capture routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    /// Response marker. `None` when the sensor did not answer at all.
    pub first_bit: Option<u8>,
    pub bits: Vec<u8>,
}

impl Capture {
    pub fn no_response() -> Capture {
        Capture {
            first_bit: None,
            bits: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub humidity: f64,
    pub temperature_celsius: f64,
}

impl Reading {
    pub fn temperature_fahrenheit(&self) -> f64 {
        c2f(self.temperature_celsius)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("sensor did not respond")]
    NoResponse,
    #[error("malformed start of frame: expected {START_OF_FRAME}, got {0}")]
    MalformedStart(u8),
    #[error("expected {FRAME_BITS} bits, got {0}")]
    WrongLength(usize),
    #[error("invalid checksum: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

pub fn decode(capture: &Capture) -> Result<Reading, DecodeError> {
    let first_bit = capture.first_bit.ok_or(DecodeError::NoResponse)?;
    if first_bit != START_OF_FRAME {
        return Err(DecodeError::MalformedStart(first_bit));
    }

    if capture.bits.len() != FRAME_BITS {
        return Err(DecodeError::WrongLength(capture.bits.len()));
    }

    let mut bytes = [0u8; 5];
    for (byte, chunk) in bytes.iter_mut().zip(capture.bits.chunks(8)) {
        *byte = chunk.iter().fold(0u8, |acc, bit| (acc << 1) | (bit & 1));
    }

    let checksum = calculate_checksum(&bytes);
    if bytes[4] != checksum {
        return Err(DecodeError::ChecksumMismatch {
            expected: checksum,
            actual: bytes[4],
        });
    }

    let humidity = (((bytes[0] as u16) << 8) | bytes[1] as u16) as f64 / 10.0;
    let temperature_celsius = (((bytes[2] as u16) << 8) | bytes[3] as u16) as f64 / 10.0;

    Ok(Reading {
        humidity,
        temperature_celsius,
    })
}

/// Low 8 bits of the sum of the four data bytes.
pub fn calculate_checksum(data: &[u8; 5]) -> u8 {
    let sum: u32 = data.iter().take(4).map(|&b| b as u32).sum();
    (sum & 0xff) as u8
}

pub fn c2f(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Whether anything answers on `pin`. Consumes one read from the sensor.
pub fn is_connected(reader: &dyn BitReader, pin: u8, delay: Duration) -> bool {
    reader.read_bits(pin, delay).first_bit.is_some()
}
