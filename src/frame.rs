//! Radio frame validation and decoding
//!
//! A soil-moisture sensor frame is a 9-byte payload followed by two check
//! bytes: a CRC-8 (polynomial 0x31) over the payload and a checksum over the
//! payload plus the CRC byte.
//!
//! Validation order is fixed and observable through the error reported for
//! a frame that is invalid in more than one way:
//! length -> checksum -> CRC -> family code -> device lookup.

use chrono::{DateTime, Utc};
use crc::{Algorithm, Crc};
use std::sync::Arc;
use thiserror::Error;

use crate::registry::DeviceRegistry;

/// Family code of the soil-moisture sensor
pub const SOIL_MOISTURE_FAMILY: u8 = 0x51;

/// CRC-8 polynomial protecting the payload
pub const FRAME_CRC_POLY: u8 = 0x31;

/// Payload bytes needed to extract every field
pub const PAYLOAD_LEN: usize = 9;

const CRC_8_FRAME: Algorithm<u8> = Algorithm {
    width: 8,
    poly: FRAME_CRC_POLY,
    init: 0x00,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xa2,
    residue: 0x00,
};

const FRAME_CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_FRAME);

/// One radio reception as handed over by the radio layer
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub bytes: Vec<u8>,
    /// Received signal strength in dBm
    pub rssi: f64,
    pub received_at: DateTime<Utc>,
}

impl RawFrame {
    pub fn new(bytes: Vec<u8>, rssi: f64, received_at: DateTime<Utc>) -> Self {
        Self {
            bytes,
            rssi,
            received_at,
        }
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

/// Fields extracted from a validated frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedReading {
    pub device_id: u32,
    pub fast_update_periods: u8,
    /// Volts, one decimal of precision
    pub battery_voltage: f32,
    /// Percent, passed through unclamped
    pub moisture: u8,
    pub raw: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("checksum mismatch: computed {expected:#04x}, frame carries {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("crc8 mismatch: computed {expected:#04x}, frame carries {actual:#04x}")]
    CrcMismatch { expected: u8, actual: u8 },

    #[error("unknown family code {0:#04x}")]
    UnknownFamily(u8),

    #[error("unknown device id {0:#08x}")]
    UnknownDevice(u32),
}

/// Check-byte primitives used by the decoder
#[cfg_attr(test, mockall::automock)]
pub trait FrameIntegrity: Send + Sync {
    /// Checksum over `bytes`, compared against the frame's last byte
    fn checksum(&self, bytes: &[u8]) -> u8;

    /// CRC-8 with the given polynomial over `bytes`
    fn crc8(&self, bytes: &[u8], polynomial: u8) -> u8;
}

/// Additive 8-bit checksum and MSB-first CRC-8 with zero init
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardIntegrity;

impl FrameIntegrity for StandardIntegrity {
    fn checksum(&self, bytes: &[u8]) -> u8 {
        bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
    }

    fn crc8(&self, bytes: &[u8], polynomial: u8) -> u8 {
        if polynomial == FRAME_CRC_POLY {
            return FRAME_CRC.checksum(bytes);
        }

        bytes.iter().fold(0u8, |mut crc, b| {
            crc ^= b;
            for _ in 0..8 {
                crc = if crc & 0x80 != 0 {
                    (crc << 1) ^ polynomial
                } else {
                    crc << 1
                };
            }
            crc
        })
    }
}

/// Frame decoder with injectable check primitives
#[derive(Clone)]
pub struct Decoder {
    integrity: Arc<dyn FrameIntegrity>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(Arc::new(StandardIntegrity))
    }
}

impl Decoder {
    pub fn new(integrity: Arc<dyn FrameIntegrity>) -> Self {
        Self { integrity }
    }

    /// Validate `frame` and extract its reading
    ///
    /// The registry is only consulted, never modified: an id that is not
    /// provisioned fails with [`DecodeError::UnknownDevice`].
    pub fn decode(
        &self,
        frame: &RawFrame,
        registry: &DeviceRegistry,
    ) -> Result<DecodedReading, DecodeError> {
        let bytes = frame.bytes.as_slice();

        let Some((&checksum, body)) = bytes.split_last() else {
            return Err(DecodeError::TooShort(bytes.len()));
        };
        if body.is_empty() {
            return Err(DecodeError::TooShort(bytes.len()));
        }

        let expected = self.integrity.checksum(body);
        if expected != checksum {
            return Err(DecodeError::ChecksumMismatch {
                expected,
                actual: checksum,
            });
        }

        // body is non-empty, so the CRC byte exists
        let (&crc, payload) = body
            .split_last()
            .ok_or(DecodeError::TooShort(bytes.len()))?;
        let expected = self.integrity.crc8(payload, FRAME_CRC_POLY);
        if expected != crc {
            return Err(DecodeError::CrcMismatch {
                expected,
                actual: crc,
            });
        }

        match payload.first() {
            Some(&SOIL_MOISTURE_FAMILY) => {}
            Some(&family) => return Err(DecodeError::UnknownFamily(family)),
            None => return Err(DecodeError::TooShort(bytes.len())),
        }

        if payload.len() < PAYLOAD_LEN {
            return Err(DecodeError::TooShort(bytes.len()));
        }

        let device_id =
            u32::from(payload[1]) << 16 | u32::from(payload[2]) << 8 | u32::from(payload[3]);
        if registry.lookup(device_id).is_none() {
            return Err(DecodeError::UnknownDevice(device_id));
        }

        Ok(DecodedReading {
            device_id,
            fast_update_periods: payload[4] >> 4,
            battery_voltage: f32::from(payload[4] & 0x0F) / 10.0,
            moisture: payload[6],
            raw: u16::from(payload[7] & 0x01) << 8 | u16::from(payload[8]),
        })
    }
}
