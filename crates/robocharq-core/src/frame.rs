//! Status byte decoding.
//!
//! The sensor board pulls a line low while its sensor is active, so the last
//! byte of every read burst is complemented before the two bits are sampled.

use crate::error::{Error, Result};

/// Bit positions of the start and finish sensors in the status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorBits {
    start: u8,
    finish: u8,
}

impl SensorBits {
    pub fn new(start: u8, finish: u8) -> Result<Self> {
        if start > 7 || finish > 7 {
            return Err(Error::Configuration(format!(
                "sensor bits must be in 0..=7 (start={start}, finish={finish})"
            )));
        }
        if start == finish {
            return Err(Error::Configuration(format!(
                "start and finish sensors share bit {start}"
            )));
        }
        Ok(Self { start, finish })
    }

    pub fn start(&self) -> u8 {
        self.start
    }

    pub fn finish(&self) -> u8 {
        self.finish
    }
}

impl Default for SensorBits {
    fn default() -> Self {
        Self { start: 0, finish: 1 }
    }
}

/// Signals decoded from one read burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorFrame {
    pub status: u8,
    pub start_asserted: bool,
    pub finish_asserted: bool,
}

impl SensorFrame {
    /// Decodes the last byte of `burst`. Returns `None` for an empty read.
    pub fn decode(burst: &[u8], bits: SensorBits) -> Option<Self> {
        burst.last().map(|&raw| Self::from_raw(raw, bits))
    }

    pub fn from_raw(raw: u8, bits: SensorBits) -> Self {
        let status = !raw;
        Self {
            status,
            start_asserted: bit(status, bits.start),
            finish_asserted: bit(status, bits.finish),
        }
    }
}

fn bit(byte: u8, index: u8) -> bool {
    (byte >> index) & 1 == 1
}
