use crate::param::{id, Param};

/// Processing core of a component running on the remote core.
///
/// A node has at most one input and one output port. The dispatcher feeds
/// it input bytes and an output window; the node reports how much it
/// consumed and produced.
pub(crate) trait DspNode: Send {
    fn has_output(&self) -> bool;

    /// Process one step.
    ///
    /// `output` is empty for nodes without an output port. Returns
    /// `(consumed, produced)`; `(0, 0)` means the node cannot make progress.
    fn process(&mut self, input: &[u8], output: &mut [u8]) -> (usize, usize);

    /// Parameters the node starts with.
    fn defaults(&self) -> &'static [Param];

    /// Bytes of state the node would need as a standalone codec instance.
    fn api_size(&self) -> u32;
}

/// Instantiate the node registered under `name`.
pub(crate) fn create(name: &str) -> Option<Box<dyn DspNode>> {
    match name {
        "decoder" | "encoder" => Some(Box::new(Passthrough::default())),
        "renderer" => Some(Box::new(Renderer::default())),
        _ => None,
    }
}

const PCM_DEFAULTS: &[Param] = &[
    Param::new(id::SAMPLE_RATE, 48_000),
    Param::new(id::CHANNELS, 2),
    Param::new(id::PCM_WIDTH, 16),
];

/// Copies input to output unchanged.
#[derive(Default)]
pub(crate) struct Passthrough {
    bytes: u64,
}

impl DspNode for Passthrough {
    fn has_output(&self) -> bool {
        true
    }

    fn process(&mut self, input: &[u8], output: &mut [u8]) -> (usize, usize) {
        let n = input.len().min(output.len());
        output[..n].copy_from_slice(&input[..n]);
        self.bytes += n as u64;
        (n, n)
    }

    fn defaults(&self) -> &'static [Param] {
        PCM_DEFAULTS
    }

    fn api_size(&self) -> u32 {
        core::mem::size_of::<Self>() as u32
    }
}

/// Sink standing in for an audio output device.
#[derive(Default)]
pub(crate) struct Renderer {
    rendered: u64,
}

impl DspNode for Renderer {
    fn has_output(&self) -> bool {
        false
    }

    fn process(&mut self, input: &[u8], _output: &mut [u8]) -> (usize, usize) {
        self.rendered += input.len() as u64;
        (input.len(), 0)
    }

    fn defaults(&self) -> &'static [Param] {
        PCM_DEFAULTS
    }

    fn api_size(&self) -> u32 {
        core::mem::size_of::<Self>() as u32
    }
}
