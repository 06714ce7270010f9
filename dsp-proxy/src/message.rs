//! Message records exchanged between the proxy and the remote core.
//!
//! ## Wire layout
//!
//! One record is 16 little-endian bytes, sent as a single transport write:
//!
//! | Offset | Field | Contents |
//! |--------|-------|----------|
//! | 0 | `id` | `src` address in bits 31..16, `dst` address in bits 15..0 |
//! | 4 | `opcode` | opcode in bits 15..0, signed result code in bits 31..16 |
//! | 8 | `length` | payload length in bytes |
//! | 12 | `address` | shared-memory offset of the buffer, or [`SHMEM_NULL`] |
//!
//! ## Addresses
//!
//! A 16-bit [`Address`] is `core:4 | client:8 | port:4`. Core
//! [`PROXY_CORE`] names the host proxy; a message whose destination is on
//! that core leaves the remote side and goes back across the transport.

use crate::constants::{MAX_PORTS, PROXY_CORE, SHMEM_NULL, WIRE_MESSAGE_SIZE};
use crate::error::{Error, Result};
use crate::opcode::Opcode;
use crate::shmem::AddressMap;

/// Endpoint address: core, client (component) and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(u16);

impl Address {
    pub const fn new(core: u8, client: u8, port: u8) -> Self {
        Address(((core as u16 & 0xF) << 12) | ((client as u16) << 4) | (port as u16 & 0xF))
    }

    /// Address of the host-side proxy endpoint for `client`.
    pub const fn proxy(client: u8) -> Self {
        Address::new(PROXY_CORE, client, 0)
    }

    pub const fn from_raw(raw: u16) -> Self {
        Address(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn core(self) -> u8 {
        (self.0 >> 12) as u8
    }

    pub const fn client(self) -> u8 {
        (self.0 >> 4) as u8
    }

    pub const fn port(self) -> u8 {
        (self.0 & 0xF) as u8
    }

    pub const fn is_proxy(self) -> bool {
        self.core() == PROXY_CORE
    }

    /// Same core and client, different port.
    pub fn with_port(self, port: u8) -> Self {
        debug_assert!(port < MAX_PORTS);
        Address::new(self.core(), self.client(), port)
    }
}

/// A component port as seen by the user. On the wire, inputs use port
/// numbers `0..8` and outputs `8..16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    Input(u8),
    Output(u8),
}

impl Port {
    /// Ports per direction.
    pub const PER_DIRECTION: u8 = MAX_PORTS / 2;
    const OUTPUT_BASE: u8 = Self::PER_DIRECTION;

    pub fn index(self) -> u8 {
        match self {
            Port::Input(i) | Port::Output(i) => i,
        }
    }

    /// Wire port number, or `InvalidArgument` if the index does not name a
    /// port.
    pub fn checked_wire(self) -> Result<u8> {
        if self.index() >= Self::PER_DIRECTION {
            return Err(Error::InvalidArgument("port index out of range"));
        }
        Ok(self.wire())
    }

    pub fn wire(self) -> u8 {
        debug_assert!(self.index() < Self::PER_DIRECTION);
        match self {
            Port::Input(i) => i,
            Port::Output(o) => Self::OUTPUT_BASE + o,
        }
    }

    pub fn from_wire(port: u8) -> Self {
        let port = port % MAX_PORTS;
        if port < Self::OUTPUT_BASE {
            Port::Input(port)
        } else {
            Port::Output(port - Self::OUTPUT_BASE)
        }
    }
}

/// Packed source/destination pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgId {
    pub src: Address,
    pub dst: Address,
}

impl MsgId {
    pub const fn new(src: Address, dst: Address) -> Self {
        MsgId { src, dst }
    }

    pub const fn pack(self) -> u32 {
        ((self.src.raw() as u32) << 16) | self.dst.raw() as u32
    }

    pub const fn unpack(raw: u32) -> Self {
        MsgId {
            src: Address::from_raw((raw >> 16) as u16),
            dst: Address::from_raw(raw as u16),
        }
    }

    pub const fn swapped(self) -> Self {
        MsgId {
            src: self.dst,
            dst: self.src,
        }
    }
}

/// Where a completed message goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Back across the transport to the host.
    Proxy,
    /// Resubmitted to the remote core's local dispatch queue.
    Local,
}

/// A decoded message.
///
/// `buffer` is an address in the local address space of whoever holds the
/// message: a process address on the host, a shared-memory offset on the
/// remote core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub id: MsgId,
    pub opcode: Opcode,
    pub buffer: Option<usize>,
    pub length: u32,
    pub ret: i32,
}

impl Message {
    pub fn new(id: MsgId, opcode: Opcode, buffer: Option<usize>, length: u32) -> Self {
        Message {
            id,
            opcode,
            buffer,
            length,
            ret: 0,
        }
    }

    /// Turn a request into its completion in place.
    ///
    /// Swaps source and destination. A buffer that was emptied becomes
    /// available for filling and vice versa; other opcodes are unchanged.
    /// Applying this twice restores the original message.
    pub fn complete(&mut self) {
        self.id = self.id.swapped();
        if let Some(op) = self.opcode.buffer_op() {
            self.opcode = op.flip().opcode();
        }
    }

    /// Routing decision for a message that has just been completed.
    pub fn delivery(&self) -> Delivery {
        if self.id.dst.is_proxy() {
            Delivery::Proxy
        } else {
            Delivery::Local
        }
    }
}

/// Raw fixed-size wire record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireMessage {
    pub id: u32,
    pub opcode: u32,
    pub length: u32,
    pub address: u32,
}

impl WireMessage {
    /// Marshal `msg`, translating its buffer into a shared-memory offset.
    pub fn encode(msg: &Message, map: &AddressMap) -> Result<Self> {
        let address = match msg.buffer {
            Some(local) => map.local_to_shared(local)?,
            None => SHMEM_NULL,
        };
        Ok(WireMessage {
            id: msg.id.pack(),
            opcode: ((msg.ret as i16 as u16 as u32) << 16) | msg.opcode.raw(),
            length: msg.length,
            address,
        })
    }

    /// Unmarshal, resolving the shared-memory offset into a local address.
    ///
    /// Fails closed with `BadAddress` if the offset is outside the region.
    pub fn decode(&self, map: &AddressMap) -> Result<Message> {
        let opcode = Opcode::from_raw(self.opcode & 0xFFFF)?;
        let buffer = match self.address {
            SHMEM_NULL => None,
            shared => Some(map.shared_to_local(shared)?),
        };
        Ok(Message {
            id: MsgId::unpack(self.id),
            opcode,
            buffer,
            length: self.length,
            ret: (self.opcode >> 16) as u16 as i16 as i32,
        })
    }

    pub fn to_bytes(&self) -> [u8; WIRE_MESSAGE_SIZE] {
        let mut out = [0u8; WIRE_MESSAGE_SIZE];
        out[0..4].copy_from_slice(&self.id.to_le_bytes());
        out[4..8].copy_from_slice(&self.opcode.to_le_bytes());
        out[8..12].copy_from_slice(&self.length.to_le_bytes());
        out[12..16].copy_from_slice(&self.address.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; WIRE_MESSAGE_SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        WireMessage {
            id: word(0),
            opcode: word(4),
            length: word(8),
            address: word(12),
        }
    }
}
