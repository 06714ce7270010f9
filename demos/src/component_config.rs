//! Configure a component and load a codec library into it.
//!
//! Writes a throwaway library image to a temporary file, creates a decoder
//! that loads it, then walks through the control plane: parameters,
//! lifecycle opcodes and the API size query.
//!
//! Run with `RUST_LOG=debug` to follow the protocol.

use dsp_proxy::loader::{LibInfo, LibType};
use dsp_proxy::param::id;
use dsp_proxy::{Component, ComponentConfig, ComponentType, Opcode, Param, Proxy, ProxyConfig};

fn main() -> dsp_proxy::Result<()> {
    env_logger::init();

    let image = std::env::temp_dir().join(format!("dsp-proxy-demo-{}.bin", std::process::id()));
    std::fs::write(&image, [0x7Fu8; 1024])?;

    let proxy = Proxy::open(ProxyConfig::default())?;
    let config = ComponentConfig::new(ComponentType::Decoder)
        .with_library(LibInfo::new(&image, LibType::Codec).with_data_size(512));
    let dec = Component::create(&proxy, &config)?;
    for lib in dec.libraries() {
        log::info!("{:?} library at {:?}", lib.lib_type, lib.code);
    }

    let api_size = dec.control(Opcode::GetApiSize)?;
    log::info!("decoder needs {api_size} bytes of codec state");
    dec.control(Opcode::Init)?;

    dec.set_config(&[
        Param::new(id::SAMPLE_RATE, 44_100),
        Param::new(id::CHANNELS, 1),
    ])?;
    let mut params = [
        Param::new(id::SAMPLE_RATE, 0),
        Param::new(id::CHANNELS, 0),
        Param::new(id::PCM_WIDTH, 0),
    ];
    dec.get_config(&mut params)?;
    for p in &params {
        log::info!("param {:#x} = {}", p.id, p.value);
    }

    dec.control(Opcode::Pause)?;
    dec.control(Opcode::PauseRelease)?;

    let result = dec.close().and_then(|()| proxy.close());
    if let Err(e) = std::fs::remove_file(&image) {
        log::warn!("removing {}: {e}", image.display());
    }
    result
}
