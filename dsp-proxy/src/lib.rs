//! # dsp-proxy
//!
//! Host side of an audio offload framework: a process talks to audio
//! components (decoders, encoders, renderers) running on a remote DSP core
//! through a small message protocol over a transport, with data buffers
//! exchanged through shared memory. An in-process emulation of the DSP
//! core is started behind every transport, so the whole protocol runs
//! without hardware.
//!
//! ## Architecture
//!
//! | Layer | Module | Purpose |
//! |-------|--------|---------|
//! | Memory | [`shmem`] / [`buffer`] | Shared region, fixed-size buffer pools with RAII handles |
//! | Messages | [`message`] / [`opcode`] / [`param`] | Wire records, addressing, opcodes, payload layouts |
//! | Queues | [`queue`] / [`msg_pool`] | FIFO queues, interrupt-masked local queue, message slot pool |
//! | Transport | [`transport`] | Pipe and vring carriers with readiness waits |
//! | Proxy | [`proxy`] / [`lane`] | Per-core session, response lanes and dispatch |
//! | Components | [`component`] / [`loader`] | Remote component handles, library loading |
//! | Pipeline | [`pipeline`] | Port links and end-of-stream broadcast |
//!
//! ## Quick start
//!
//! ```ignore
//! use dsp_proxy::{Component, ComponentConfig, ComponentType, Proxy, ProxyConfig};
//! use dsp_proxy::pipeline::{self, Pipeline};
//! use dsp_proxy::message::Port;
//!
//! let proxy = Proxy::open(ProxyConfig::default())?;
//! let dec = Component::create(&proxy, &ComponentConfig::new(ComponentType::Decoder))?;
//! let ren = Component::create(&proxy, &ComponentConfig::new(ComponentType::Renderer))?;
//!
//! let mut p = Pipeline::create(&proxy);
//! p.add(&dec)?;
//! p.add(&ren)?;
//! pipeline::connect(&dec, Port::Output(0), &ren, Port::Input(0), 4, 4096)?;
//!
//! // feed `dec` with `process`, drive it with `get_status` until
//! // `ren` reports OUTPUT_EOS
//! ```
//!
//! ## Features
//!
//! | Feature | Default | Enables |
//! |---------|---------|---------|
//! | `pipe` | yes | [`TransportKind::Pipe`](config::TransportKind), OS pipes polled with `poll(2)` (requires `libc`) |
//! | `rproc` | yes | [`TransportKind::RemoteProc`](config::TransportKind), vrings with a doorbell |
//!
//! ## Protocol parameters
//!
//! - **Wire record:** 16 bytes ([`constants::WIRE_MESSAGE_SIZE`])
//! - **Cores:** [`constants::MAX_CORES`], clients per core: [`constants::MAX_CLIENTS`]
//! - **Message slots per core:** [`constants::MSG_POOL_SIZE`]
//! - **AUX pool:** [`constants::AUX_POOL_BUFFERS`] x [`constants::AUX_BUFFER_SIZE`] bytes

#[cfg(not(any(feature = "pipe", feature = "rproc")))]
compile_error!("enable at least one transport feature: `pipe` or `rproc`");

pub mod constants;
pub mod error;
pub mod opcode;
pub mod message;
pub mod shmem;
pub mod buffer;
pub mod queue;
pub mod msg_pool;
pub mod param;
pub mod config;
pub mod loader;
pub mod lane;
pub mod transport;
pub mod proxy;
pub mod component;
pub mod pipeline;

pub(crate) mod remote;

#[cfg(test)]
mod integration_tests;

pub use buffer::{Buffer, BufferPool, PoolRole};
pub use component::{Component, Info};
pub use config::{ComponentConfig, ComponentType, PoolSpec, ProxyConfig, TransportKind};
pub use error::{Error, Result};
pub use message::{Address, Message, Port};
pub use opcode::{BufferOp, Opcode};
pub use param::Param;
pub use pipeline::Pipeline;
pub use proxy::Proxy;
