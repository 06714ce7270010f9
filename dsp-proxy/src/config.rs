//! Proxy and component configuration.
//!
//! Everything has a working default; [`ProxyConfig::validate`] rejects
//! geometries that cannot work before any resource is touched.

use core::time::Duration;
use std::sync::Arc;

use crate::constants::{
    AUX_BUFFER_SIZE, AUX_POOL_BUFFERS, DEFAULT_RESPONSE_TIMEOUT, DEFAULT_SHMEM_SIZE,
    DSP_LOCAL_MEMORY, MAX_CORES, MSG_POOL_SIZE, OPEN_RETRIES, OPEN_RETRY_INTERVAL, POLL_SLICE,
    SHMEM_ALIGN,
};
use crate::error::{Error, Result};
use crate::lane::ResponseSink;
use crate::loader::LibInfo;

/// How the proxy reaches the remote core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// A pair of OS pipes carrying 16-byte records.
    #[cfg(feature = "pipe")]
    Pipe,
    /// Two lock-free vrings with doorbell notification.
    #[cfg(feature = "rproc")]
    RemoteProc,
}

impl Default for TransportKind {
    #[cfg(feature = "rproc")]
    fn default() -> Self {
        TransportKind::RemoteProc
    }

    #[cfg(all(feature = "pipe", not(feature = "rproc")))]
    fn default() -> Self {
        TransportKind::Pipe
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Remote core to open, `0..MAX_CORES`.
    pub core_id: u32,
    pub transport: TransportKind,
    /// Bytes of shared memory, split between the host and DSP heaps.
    pub shmem_size: usize,
    /// Buffers in the proxy's control-payload pool.
    pub aux_buffers: usize,
    pub aux_buffer_size: usize,
    /// Message slots on the remote core.
    pub msg_pool_size: usize,
    /// Scratch memory the remote core carves its message pool from.
    pub dsp_local_memory: usize,
    pub open_retries: u32,
    pub open_retry_interval: Duration,
    /// Longest single transport wait while pumping responses.
    pub poll_slice: Duration,
    /// Deadline for synchronous control round trips.
    pub response_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            core_id: 0,
            transport: TransportKind::default(),
            shmem_size: DEFAULT_SHMEM_SIZE,
            aux_buffers: AUX_POOL_BUFFERS,
            aux_buffer_size: AUX_BUFFER_SIZE,
            msg_pool_size: MSG_POOL_SIZE,
            dsp_local_memory: DSP_LOCAL_MEMORY,
            open_retries: OPEN_RETRIES,
            open_retry_interval: OPEN_RETRY_INTERVAL,
            poll_slice: POLL_SLICE,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl ProxyConfig {
    pub fn with_core(mut self, core_id: u32) -> Self {
        self.core_id = core_id;
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_shmem_size(mut self, size: usize) -> Self {
        self.shmem_size = size;
        self
    }

    pub fn with_msg_pool_size(mut self, slots: usize) -> Self {
        self.msg_pool_size = slots;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Check the configuration without touching any resource.
    ///
    /// An out-of-range `core_id` is not an argument error: it is reported
    /// as `NotFound` by the transport, the same as a missing device.
    pub fn validate(&self) -> Result<()> {
        if self.shmem_size < 4 * SHMEM_ALIGN {
            return Err(Error::InvalidArgument("shmem_size too small"));
        }
        if self.aux_buffers == 0 || self.aux_buffer_size < 8 {
            return Err(Error::InvalidArgument("aux pool geometry"));
        }
        if self.msg_pool_size == 0 {
            return Err(Error::InvalidArgument("msg_pool_size must be non-zero"));
        }
        if self.poll_slice.is_zero() {
            return Err(Error::InvalidArgument("poll_slice must be non-zero"));
        }
        Ok(())
    }

    pub(crate) fn core_in_range(&self) -> bool {
        self.core_id < MAX_CORES
    }
}

/// Component families with their own default buffer geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentType {
    Decoder,
    Encoder,
    Renderer,
}

impl ComponentType {
    /// Name of the remote implementation registered for this type.
    pub fn remote_name(self) -> &'static str {
        match self {
            ComponentType::Decoder => "decoder",
            ComponentType::Encoder => "encoder",
            ComponentType::Renderer => "renderer",
        }
    }
}

/// Geometry of one buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSpec {
    pub count: usize,
    pub size: usize,
}

impl PoolSpec {
    pub const fn new(count: usize, size: usize) -> Self {
        PoolSpec { count, size }
    }
}

/// Everything needed to bring up one component with
/// [`Component::create`](crate::component::Component::create).
#[derive(Clone)]
pub struct ComponentConfig {
    /// Remote implementation to instantiate.
    pub name: String,
    pub comp_type: ComponentType,
    pub input: Option<PoolSpec>,
    pub output: Option<PoolSpec>,
    /// Libraries loaded, in order, right after the component is opened.
    pub libraries: Vec<LibInfo>,
    /// Replaces the default lane router when set.
    pub sink: Option<Arc<dyn ResponseSink>>,
}

impl ComponentConfig {
    pub fn new(comp_type: ComponentType) -> Self {
        let (input, output) = match comp_type {
            ComponentType::Decoder => (Some(PoolSpec::new(2, 4096)), Some(PoolSpec::new(2, 4096))),
            ComponentType::Encoder => (Some(PoolSpec::new(2, 4096)), Some(PoolSpec::new(2, 1024))),
            ComponentType::Renderer => (Some(PoolSpec::new(2, 4096)), None),
        };
        ComponentConfig {
            name: comp_type.remote_name().to_owned(),
            comp_type,
            input,
            output,
            libraries: Vec::new(),
            sink: None,
        }
    }

    pub fn with_input(mut self, spec: Option<PoolSpec>) -> Self {
        self.input = spec;
        self
    }

    pub fn with_output(mut self, spec: Option<PoolSpec>) -> Self {
        self.output = spec;
        self
    }

    pub fn with_library(mut self, lib: LibInfo) -> Self {
        self.libraries.push(lib);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResponseSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

impl core::fmt::Debug for ComponentConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ComponentConfig")
            .field("name", &self.name)
            .field("comp_type", &self.comp_type)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("libraries", &self.libraries)
            .field("custom_sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        ProxyConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_degenerate_geometry() {
        let cfg = ProxyConfig::default().with_shmem_size(64);
        assert!(matches!(cfg.validate(), Err(Error::InvalidArgument(_))));
        let cfg = ProxyConfig::default().with_msg_pool_size(0);
        assert!(matches!(cfg.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn core_range_is_not_validated_here() {
        let cfg = ProxyConfig::default().with_core(MAX_CORES);
        cfg.validate().unwrap();
        assert!(!cfg.core_in_range());
    }

    #[test]
    fn renderer_has_no_output_pool() {
        let cfg = ComponentConfig::new(ComponentType::Renderer);
        assert!(cfg.input.is_some());
        assert!(cfg.output.is_none());
        assert_eq!(cfg.name, "renderer");
    }
}
