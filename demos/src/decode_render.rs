//! Decode a synthetic stream into a renderer on the emulated DSP core.
//!
//! The decoder's output port is linked to the renderer's input on the core,
//! so decoded data never comes back to the host. The host only feeds input
//! buffers and waits for the renderer to report end of stream.
//!
//! Pipeline:
//! ```text
//!   host ──EMPTY_THIS_BUFFER──► decoder ══link buffers══► renderer
//!   host ◄──FILL_THIS_BUFFER─── decoder                    renderer ──OUTPUT_EOS──► host
//! ```
//!
//! Run with `RUST_LOG=debug` to follow the protocol.

use std::time::Duration;

use dsp_proxy::pipeline::{self, Pipeline};
use dsp_proxy::{
    BufferOp, Component, ComponentConfig, ComponentType, Opcode, Port, Proxy, ProxyConfig,
};

const STREAM_BYTES: usize = 64 * 1024;
const LINK_BUFFERS: u32 = 4;
const LINK_BUFFER_SIZE: u32 = 2048;

fn main() -> dsp_proxy::Result<()> {
    env_logger::init();

    let proxy = Proxy::open(ProxyConfig::default())?;
    let dec = Component::create(&proxy, &ComponentConfig::new(ComponentType::Decoder))?;
    let ren = Component::create(&proxy, &ComponentConfig::new(ComponentType::Renderer))?;

    let mut p = Pipeline::create(&proxy);
    p.add(&dec)?;
    p.add(&ren)?;
    pipeline::connect(
        &dec,
        Port::Output(0),
        &ren,
        Port::Input(0),
        LINK_BUFFERS,
        LINK_BUFFER_SIZE,
    )?;

    // a ramp stands in for an encoded file
    let stream: Vec<u8> = (0..STREAM_BYTES).map(|i| (i % 251) as u8).collect();
    let chunk = dec.input_pool().map_or(1024, |pool| pool.item_size());
    let mut chunks = stream.chunks(chunk);
    let mut in_flight = 0usize;
    let mut fed = 0usize;
    let mut eos_queued = false;

    while !eos_queued || in_flight > 0 {
        while !eos_queued {
            let Ok(buffer) = dec.input_buffer() else {
                break;
            };
            match chunks.next() {
                Some(data) => {
                    buffer.write(0, data)?;
                    dec.process(Port::Input(0), buffer, data.len(), BufferOp::EmptyThisBuffer)?;
                    fed += data.len();
                }
                None => {
                    // zero-length buffer marks the end of the stream
                    dec.process(Port::Input(0), buffer, 0, BufferOp::EmptyThisBuffer)?;
                    eos_queued = true;
                }
            }
            in_flight += 1;
        }
        let info = dec.get_status(Duration::from_secs(1))?;
        if info.ret != 0 {
            log::warn!("decoder returned {:?} with code {}", info.opcode, info.ret);
        }
        in_flight -= 1;
    }
    log::info!("fed {fed} bytes to the decoder");

    loop {
        let info = ren.get_status(Duration::from_secs(1))?;
        if info.opcode == Opcode::OutputEos {
            log::info!("renderer reached end of stream");
            break;
        }
    }

    pipeline::disconnect(&dec, Port::Output(0))?;
    p.delete();
    dec.close()?;
    ren.close()?;
    proxy.close()
}
