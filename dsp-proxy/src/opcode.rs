//! Command opcodes and response-lane classification.
//!
//! Codec API opcodes occupy `0x00..=0x13` in their fixed order; protocol
//! opcodes start at `0x20`.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    GetApiSize = 0x00,
    PreInit = 0x01,
    Init = 0x02,
    PostInit = 0x03,
    SetParam = 0x04,
    GetParam = 0x05,
    Execute = 0x06,
    SetInputPtr = 0x07,
    SetOutputPtr = 0x08,
    SetInputBytes = 0x09,
    GetOutputBytes = 0x0A,
    GetConsumedBytes = 0x0B,
    InputOver = 0x0C,
    RuntimeInit = 0x0D,
    Cleanup = 0x0E,
    SetLibEntry = 0x0F,
    Suspend = 0x10,
    Resume = 0x11,
    Pause = 0x12,
    PauseRelease = 0x13,

    Register = 0x20,
    Unregister = 0x21,
    Route = 0x22,
    Unroute = 0x23,
    EmptyThisBuffer = 0x24,
    FillThisBuffer = 0x25,
    OutputEos = 0x26,
    Flush = 0x27,
}

impl Opcode {
    const ALL: [Opcode; 28] = [
        Opcode::GetApiSize,
        Opcode::PreInit,
        Opcode::Init,
        Opcode::PostInit,
        Opcode::SetParam,
        Opcode::GetParam,
        Opcode::Execute,
        Opcode::SetInputPtr,
        Opcode::SetOutputPtr,
        Opcode::SetInputBytes,
        Opcode::GetOutputBytes,
        Opcode::GetConsumedBytes,
        Opcode::InputOver,
        Opcode::RuntimeInit,
        Opcode::Cleanup,
        Opcode::SetLibEntry,
        Opcode::Suspend,
        Opcode::Resume,
        Opcode::Pause,
        Opcode::PauseRelease,
        Opcode::Register,
        Opcode::Unregister,
        Opcode::Route,
        Opcode::Unroute,
        Opcode::EmptyThisBuffer,
        Opcode::FillThisBuffer,
        Opcode::OutputEos,
        Opcode::Flush,
    ];

    /// Decode a wire opcode.
    pub fn from_raw(raw: u32) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|op| *op as u32 == raw)
            .ok_or_else(|| Error::unexpected("known opcode", raw))
    }

    pub fn raw(self) -> u32 {
        self as u32
    }

    /// The buffer-flow view of this opcode, if it moves a data buffer.
    pub fn buffer_op(self) -> Option<BufferOp> {
        match self {
            Opcode::EmptyThisBuffer => Some(BufferOp::EmptyThisBuffer),
            Opcode::FillThisBuffer => Some(BufferOp::FillThisBuffer),
            _ => None,
        }
    }

    /// Codec lifecycle opcodes that carry no payload and only need an acknowledgement.
    pub fn is_lifecycle(self) -> bool {
        matches!(
            self,
            Opcode::PreInit
                | Opcode::Init
                | Opcode::PostInit
                | Opcode::RuntimeInit
                | Opcode::Execute
                | Opcode::InputOver
                | Opcode::Cleanup
                | Opcode::Suspend
                | Opcode::Resume
                | Opcode::Pause
                | Opcode::PauseRelease
        )
    }
}

/// The two data-plane opcodes. A completed buffer flips between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOp {
    /// An input port is handed a full buffer to consume.
    EmptyThisBuffer,
    /// An output port is handed an empty buffer to produce into.
    FillThisBuffer,
}

impl BufferOp {
    /// The opcode a buffer carries once its current operation completes.
    pub fn flip(self) -> Self {
        match self {
            BufferOp::EmptyThisBuffer => BufferOp::FillThisBuffer,
            BufferOp::FillThisBuffer => BufferOp::EmptyThisBuffer,
        }
    }

    pub fn opcode(self) -> Opcode {
        match self {
            BufferOp::EmptyThisBuffer => Opcode::EmptyThisBuffer,
            BufferOp::FillThisBuffer => Opcode::FillThisBuffer,
        }
    }
}

/// Response lane a message is delivered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Buffer lifecycle events; never queued behind control traffic.
    Ack,
    /// Control-plane responses.
    Async,
}

impl Lane {
    /// Classify a received message purely by its opcode.
    pub fn classify(opcode: Opcode) -> Lane {
        match opcode {
            Opcode::FillThisBuffer
            | Opcode::EmptyThisBuffer
            | Opcode::Unregister
            | Opcode::OutputEos => Lane::Ack,
            _ => Lane::Async,
        }
    }
}
