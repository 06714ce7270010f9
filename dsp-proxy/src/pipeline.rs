//! Pipelines of linked components.
//!
//! A [`Pipeline`] groups components that share a proxy so end of stream can
//! be broadcast to all of them at once. Links between component ports are
//! set up with [`connect`] and torn down with [`disconnect`]; the link
//! buffers live in the remote core's heap and never cross the transport.
//!
//! The pipeline does not own its members. It holds weak references, and a
//! member that has been closed simply drops out of the chain.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Weak;

use crate::component::{Component, Inner};
use crate::error::{Error, Result};
use crate::message::Port;
use crate::proxy::Proxy;

static NEXT_PIPELINE_ID: AtomicU32 = AtomicU32::new(1);

pub struct Pipeline {
    id: u32,
    proxy: Proxy,
    /// Most recently added first.
    chain: Vec<Weak<Inner>>,
    input_eos: bool,
    output_eos: bool,
}

impl Pipeline {
    pub fn create(proxy: &Proxy) -> Self {
        let id = NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!("pipeline {id} on core {}", proxy.core_id());
        Pipeline {
            id,
            proxy: proxy.clone(),
            chain: Vec::new(),
            input_eos: false,
            output_eos: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Prepend `comp` to the chain.
    ///
    /// A component belongs to at most one pipeline; adding it again, here
    /// or elsewhere, fails with `InvalidState`.
    pub fn add(&mut self, comp: &Component) -> Result<()> {
        let weak = comp.downgrade();
        let inner = weak
            .upgrade()
            .ok_or(Error::InvalidState("component is gone"))?;
        if inner.core() as u32 != self.proxy.core_id() {
            return Err(Error::InvalidArgument("component belongs to another core"));
        }
        if let Some(other) = inner.pipeline() {
            log::warn!("{} is already in pipeline {other}", inner.name());
            return Err(Error::InvalidState("component already in a pipeline"));
        }
        inner.set_pipeline(Some(self.id));
        self.chain.insert(0, weak);
        log::debug!("pipeline {}: added {}", self.id, inner.name());
        Ok(())
    }

    /// Live members, most recently added first.
    pub fn members(&self) -> Vec<String> {
        self.chain
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| inner.name().to_owned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chain.iter().filter(|w| w.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue an `OUTPUT_EOS` on the ack lane of every live member.
    ///
    /// Purely local; nothing is sent to the remote core. Returns how many
    /// members were notified.
    pub fn send_eos(&mut self) -> usize {
        let mut notified = 0;
        for inner in self.chain.iter().filter_map(Weak::upgrade) {
            inner.post_eos();
            notified += 1;
        }
        self.output_eos = true;
        log::debug!("pipeline {}: end of stream to {notified} components", self.id);
        notified
    }

    /// Record that the pipeline's source has run dry.
    pub fn set_input_eos(&mut self, eos: bool) {
        self.input_eos = eos;
    }

    pub fn input_eos(&self) -> bool {
        self.input_eos
    }

    /// Whether [`send_eos`](Self::send_eos) has been called.
    pub fn output_eos(&self) -> bool {
        self.output_eos
    }

    /// Dissolve the pipeline. Members stay open and may join another one.
    pub fn delete(mut self) {
        self.release();
    }

    fn release(&mut self) {
        for inner in self.chain.drain(..).filter_map(|w| w.upgrade()) {
            inner.set_pipeline(None);
        }
        self.input_eos = false;
        self.output_eos = false;
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.release();
    }
}

impl core::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("core", &self.proxy.core_id())
            .field("members", &self.members())
            .field("input_eos", &self.input_eos)
            .field("output_eos", &self.output_eos)
            .finish()
    }
}

/// Link `src_port` of `src` to `dst_port` of `dst` through `count` buffers
/// of `length` bytes allocated on the remote core.
pub fn connect(
    src: &Component,
    src_port: Port,
    dst: &Component,
    dst_port: Port,
    count: u32,
    length: u32,
) -> Result<()> {
    src.route(src_port, dst, dst_port, count, length)
}

/// Undo [`connect`] on an output port. Fails with `NotFound` if the port
/// is not linked.
pub fn disconnect(comp: &Component, port: Port) -> Result<()> {
    comp.unroute(port)
}
