use core::fmt;

use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

/// Velbus carries at most 8 data bytes, the first being the command.
pub const MAX_DATA_LEN: usize = 8;
pub const MAX_PAYLOAD_LEN: usize = MAX_DATA_LEN - 1;

const_assert!(MAX_PAYLOAD_LEN < MAX_DATA_LEN);

pub type Payload = Vec<u8, MAX_PAYLOAD_LEN>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the 7 byte maximum")]
    PayloadTooLong(usize),
}

/// A validated inbound frame as handed over by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub address: u8,
    pub command: u8,
    /// Data bytes following the command byte
    pub payload: Payload,
}

impl Frame {
    pub fn new(address: u8, command: u8, payload: &[u8]) -> Result<Self, FrameError> {
        let payload = Payload::from_slice(payload)
            .map_err(|()| FrameError::PayloadTooLong(payload.len()))?;
        Ok(Self {
            address,
            command,
            payload,
        })
    }

    /// Length as counted on the wire: command byte plus payload.
    pub fn data_len(&self) -> usize {
        1 + self.payload.len()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x} cmd=0x{:02x} [", self.address, self.command)?;
        write_hex(f, &self.payload)?;
        write!(f, "]")
    }
}

/// An encoded message waiting for the external sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub address: u8,
    pub priority: u8,
    pub command: u8,
    pub payload: Payload,
}

impl OutboundFrame {
    pub fn data_len(&self) -> usize {
        1 + self.payload.len()
    }
}

impl fmt::Display for OutboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:02x} prio={} cmd=0x{:02x} [",
            self.address, self.priority, self.command
        )?;
        write_hex(f, &self.payload)?;
        write!(f, "]")
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for (index, byte) in bytes.iter().enumerate() {
        if index > 0 {
            write!(f, " ")?;
        }
        write!(f, "{:02x}", byte)?;
    }
    Ok(())
}

/// Parse a hex string such as `"ff 01 a0"` or `"ff01a0"`.
pub fn parse_hex(text: &str) -> Option<std::vec::Vec<u8>> {
    let digits: std::vec::Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let hi = pair[0].to_digit(16)?;
            let lo = pair[1].to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}
