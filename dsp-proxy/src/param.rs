//! Control payload layouts carried in AUX buffers.
//!
//! | Opcode | Payload |
//! |--------|---------|
//! | `SET_PARAM` / `GET_PARAM` | `(id: u32, value: u32)` pairs, little endian |
//! | `ROUTE` | destination address `u32`, buffer count `u32`, buffer length `u32` |
//! | `REGISTER` | component name, UTF-8 |
//!
//! Library loads travel as a `SET_PARAM` whose first pair is
//! [`id::LIB_LOAD`] or [`id::LIB_UNLOAD`].

use crate::error::{Error, Result};
use crate::message::Address;

/// Parameter identifiers understood by the remote components.
pub mod id {
    pub const SAMPLE_RATE: u32 = 0x01;
    pub const CHANNELS: u32 = 0x02;
    pub const PCM_WIDTH: u32 = 0x03;
    pub const BITRATE: u32 = 0x04;
    pub const FRAME_SIZE: u32 = 0x05;

    pub const LIB_LOAD: u32 = 0x1000;
    pub const LIB_UNLOAD: u32 = 0x1001;
    pub const LIB_CODE_ADDR: u32 = 0x1002;
    pub const LIB_CODE_SIZE: u32 = 0x1003;
    pub const LIB_DATA_ADDR: u32 = 0x1004;
    pub const LIB_DATA_SIZE: u32 = 0x1005;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub id: u32,
    pub value: u32,
}

impl Param {
    pub const fn new(id: u32, value: u32) -> Self {
        Param { id, value }
    }
}

pub const PARAM_SIZE: usize = 8;

pub fn encode_params(params: &[Param]) -> Vec<u8> {
    let mut out = Vec::with_capacity(params.len() * PARAM_SIZE);
    for p in params {
        out.extend_from_slice(&p.id.to_le_bytes());
        out.extend_from_slice(&p.value.to_le_bytes());
    }
    out
}

pub fn decode_params(bytes: &[u8]) -> Result<Vec<Param>> {
    if bytes.len() % PARAM_SIZE != 0 {
        return Err(Error::InvalidArgument("parameter payload not a whole number of pairs"));
    }
    Ok(bytes
        .chunks_exact(PARAM_SIZE)
        .map(|c| Param {
            id: u32::from_le_bytes([c[0], c[1], c[2], c[3]]),
            value: u32::from_le_bytes([c[4], c[5], c[6], c[7]]),
        })
        .collect())
}

/// Body of a `ROUTE` command, sent to the source component's output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteRequest {
    /// Destination component and input port.
    pub dst: Address,
    pub count: u32,
    pub length: u32,
}

impl RouteRequest {
    pub const SIZE: usize = 12;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&(self.dst.raw() as u32).to_le_bytes());
        out[4..8].copy_from_slice(&self.count.to_le_bytes());
        out[8..12].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(Error::InvalidArgument("route payload size"));
        }
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let dst = word(0);
        if dst > u16::MAX as u32 {
            return Err(Error::InvalidArgument("route destination"));
        }
        Ok(RouteRequest {
            dst: Address::from_raw(dst as u16),
            count: word(4),
            length: word(8),
        })
    }
}
