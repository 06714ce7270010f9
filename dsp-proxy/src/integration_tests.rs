//! End-to-end scenarios against the emulated remote core.
//!
//! Each test opens a real proxy, so messages cross the transport, are
//! dispatched by the core thread and come back through the response lanes:
//!
//! ```text
//! Component.process() → Proxy.send() → [transport] → core dispatch
//!     → component node → [transport] → Proxy.pump() → lane → get_status()
//! ```

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use core::time::Duration;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Instant;

    use crate::component::Component;
    use crate::config::{ComponentConfig, ComponentType, ProxyConfig, TransportKind};
    use crate::error::Error;
    use crate::lane::{Lanes, ResponseSink};
    use crate::loader::{LibInfo, LibType, LibraryLoader, PilInfo};
    use crate::message::{Message, Port};
    use crate::opcode::{BufferOp, Lane, Opcode};
    use crate::param::{id, Param};
    use crate::pipeline::{self, Pipeline};
    use crate::proxy::Proxy;
    use crate::shmem::{Heap, SharedMemory};

    const STEP: Duration = Duration::from_secs(2);

    fn kinds() -> Vec<TransportKind> {
        vec![
            #[cfg(feature = "pipe")]
            TransportKind::Pipe,
            #[cfg(feature = "rproc")]
            TransportKind::RemoteProc,
        ]
    }

    fn open(kind: TransportKind) -> Proxy {
        Proxy::open(ProxyConfig::default().with_transport(kind)).unwrap()
    }

    /// Collect ack-lane events until `done` says stop.
    fn drain_until(comp: &Component, mut done: impl FnMut(&crate::component::Info) -> bool) -> Vec<Opcode> {
        let mut seen = Vec::new();
        loop {
            let info = comp.get_status(STEP).unwrap();
            assert_eq!(info.ret, 0, "{:?} failed", info.opcode);
            seen.push(info.opcode);
            if done(&info) {
                return seen;
            }
        }
    }

    // ---------------------------------------------------------------
    // Links between components
    // ---------------------------------------------------------------
    #[test]
    fn connect_then_disconnect_twice() {
        for kind in kinds() {
            let proxy = open(kind);
            let a = Component::open(&proxy, "decoder", None).unwrap();
            let b = Component::open(&proxy, "decoder", None).unwrap();

            pipeline::connect(&a, Port::Output(0), &b, Port::Input(0), 4, 4096).unwrap();
            let dsp_free = proxy.shared_memory().unwrap().available(Heap::Dsp);
            pipeline::disconnect(&a, Port::Output(0)).unwrap();
            assert!(proxy.shared_memory().unwrap().available(Heap::Dsp) > dsp_free);
            assert!(matches!(
                pipeline::disconnect(&a, Port::Output(0)),
                Err(Error::NotFound)
            ));

            a.close().unwrap();
            b.close().unwrap();
            proxy.close().unwrap();
        }
    }

    #[test]
    fn second_route_on_a_port_is_rejected() {
        let proxy = open(TransportKind::default());
        let a = Component::open(&proxy, "decoder", None).unwrap();
        let b = Component::open(&proxy, "renderer", None).unwrap();
        let c = Component::open(&proxy, "renderer", None).unwrap();
        pipeline::connect(&a, Port::Output(0), &b, Port::Input(0), 2, 256).unwrap();
        assert!(matches!(
            pipeline::connect(&a, Port::Output(0), &c, Port::Input(0), 2, 256),
            Err(Error::Rejected { opcode: Opcode::Route, .. })
        ));
        assert!(matches!(
            pipeline::connect(&b, Port::Input(0), &c, Port::Input(0), 2, 256),
            Err(Error::InvalidArgument(_))
        ));
        // closing the sink tears down the link feeding it
        b.close().unwrap();
        assert!(matches!(
            pipeline::disconnect(&a, Port::Output(0)),
            Err(Error::NotFound)
        ));
        a.close().unwrap();
        c.close().unwrap();
        proxy.close().unwrap();
    }

    #[test]
    fn oversized_link_is_out_of_memory() {
        let proxy = open(TransportKind::default());
        let a = Component::open(&proxy, "decoder", None).unwrap();
        let b = Component::open(&proxy, "renderer", None).unwrap();
        assert!(matches!(
            pipeline::connect(&a, Port::Output(0), &b, Port::Input(0), 64, 1 << 20),
            Err(Error::OutOfMemory)
        ));
        a.close().unwrap();
        b.close().unwrap();
        proxy.close().unwrap();
    }

    // ---------------------------------------------------------------
    // Deadlines
    // ---------------------------------------------------------------
    #[test]
    fn idle_response_get_times_out_promptly() {
        for kind in kinds() {
            let proxy = open(kind);
            let comp = Component::open(&proxy, "renderer", None).unwrap();
            for lane in [Lane::Async, Lane::Ack] {
                let start = Instant::now();
                let r = match lane {
                    Lane::Async => comp.response_get(Duration::from_millis(10)),
                    Lane::Ack => comp.response_get_ack(Duration::from_millis(10)),
                };
                let took = start.elapsed();
                assert!(matches!(r, Err(Error::Timeout)));
                assert!(took >= Duration::from_millis(10));
                assert!(took < Duration::from_millis(500), "took {took:?}");
            }
            comp.close().unwrap();
            proxy.close().unwrap();
        }
    }

    // ---------------------------------------------------------------
    // End of stream
    // ---------------------------------------------------------------
    #[test]
    fn send_eos_reaches_every_member_once() {
        let proxy = open(TransportKind::default());
        let comps: Vec<Component> = ["decoder", "encoder", "renderer"]
            .iter()
            .map(|name| Component::open(&proxy, name, None).unwrap())
            .collect();
        let mut p = Pipeline::create(&proxy);
        for c in &comps {
            p.add(c).unwrap();
        }
        assert_eq!(p.send_eos(), 3);

        let mut total = 0;
        for c in &comps {
            while let Ok(info) = c.get_status(Duration::from_millis(20)) {
                assert_eq!(info.opcode, Opcode::OutputEos);
                assert!(info.buffer.is_none());
                total += 1;
            }
        }
        assert_eq!(total, 3);

        p.delete();
        for c in comps {
            c.close().unwrap();
        }
        proxy.close().unwrap();
    }

    #[test]
    fn decode_into_renderer_until_end_of_stream() {
        for kind in kinds() {
            let proxy = open(kind);
            let dec = Component::create(&proxy, &ComponentConfig::new(ComponentType::Decoder)).unwrap();
            let ren = Component::create(&proxy, &ComponentConfig::new(ComponentType::Renderer)).unwrap();
            let mut p = Pipeline::create(&proxy);
            p.add(&dec).unwrap();
            p.add(&ren).unwrap();
            pipeline::connect(&dec, Port::Output(0), &ren, Port::Input(0), 4, 1024).unwrap();

            let stream: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
            let mut chunks = stream.chunks(3000);
            let mut in_flight = 0;
            let mut eos_queued = false;
            while !eos_queued || in_flight > 0 {
                while let Ok(buffer) = dec.input_buffer() {
                    match chunks.next() {
                        Some(chunk) => {
                            buffer.write(0, chunk).unwrap();
                            dec.process(Port::Input(0), buffer, chunk.len(), BufferOp::EmptyThisBuffer)
                                .unwrap();
                        }
                        None if !eos_queued => {
                            dec.process(Port::Input(0), buffer, 0, BufferOp::EmptyThisBuffer)
                                .unwrap();
                            eos_queued = true;
                        }
                        None => break,
                    }
                    in_flight += 1;
                }
                let info = dec.get_status(STEP).unwrap();
                assert_eq!(info.opcode, Opcode::FillThisBuffer);
                assert_eq!(info.ret, 0);
                in_flight -= 1;
            }

            let seen = drain_until(&ren, |info| info.is_eos());
            assert_eq!(seen, [Opcode::OutputEos]);
            assert_eq!(dec.in_flight(), 0);

            pipeline::disconnect(&dec, Port::Output(0)).unwrap();
            p.delete();
            dec.close().unwrap();
            ren.close().unwrap();
            proxy.close().unwrap();
        }
    }

    #[test]
    fn unrouted_decoder_reports_its_own_eos() {
        let proxy = open(TransportKind::default());
        let dec = Component::create(&proxy, &ComponentConfig::new(ComponentType::Decoder)).unwrap();
        let input = dec.input_buffer().unwrap();
        dec.process(Port::Input(0), input, 0, BufferOp::EmptyThisBuffer).unwrap();
        let seen = drain_until(&dec, |info| info.is_eos());
        assert_eq!(seen, [Opcode::FillThisBuffer, Opcode::OutputEos]);
        dec.close().unwrap();
        proxy.close().unwrap();
    }

    #[test]
    fn flush_hands_back_queued_output() {
        let proxy = open(TransportKind::default());
        let dec = Component::create(&proxy, &ComponentConfig::new(ComponentType::Decoder)).unwrap();
        for _ in 0..2 {
            let out = dec.output_buffer().unwrap();
            let room = out.length();
            dec.process(Port::Output(0), out, room, BufferOp::FillThisBuffer).unwrap();
        }
        dec.flush(Port::Output(0)).unwrap();
        for _ in 0..2 {
            let info = dec.get_status(STEP).unwrap();
            assert_eq!(info.opcode, Opcode::EmptyThisBuffer);
            assert_eq!(info.length, 0);
        }
        assert_eq!(dec.output_pool().unwrap().available(), 2);
        dec.close().unwrap();
        proxy.close().unwrap();
    }

    // ---------------------------------------------------------------
    // Proxy lifecycle
    // ---------------------------------------------------------------
    #[test]
    fn double_close_is_clean() {
        for kind in kinds() {
            let proxy = open(kind);
            proxy.close().unwrap();
            assert!(matches!(proxy.close(), Err(Error::InvalidState(_))));
            assert!(matches!(
                Component::open(&proxy, "decoder", None),
                Err(Error::InvalidState(_))
            ));
        }
    }

    #[test]
    fn components_on_separate_threads_share_a_proxy() {
        let proxy = open(TransportKind::default());
        std::thread::scope(|s| {
            for rate in [8_000u32, 16_000, 44_100, 48_000] {
                let proxy = proxy.clone();
                s.spawn(move || {
                    let comp = Component::open(&proxy, "decoder", None).unwrap();
                    for _ in 0..20 {
                        comp.set_config(&[Param::new(id::SAMPLE_RATE, rate)]).unwrap();
                        let mut p = [Param::new(id::SAMPLE_RATE, 0)];
                        comp.get_config(&mut p).unwrap();
                        assert_eq!(p[0].value, rate);
                    }
                    comp.close().unwrap();
                });
            }
        });
        proxy.close().unwrap();
    }

    struct Counting {
        seen: AtomicUsize,
    }

    impl ResponseSink for Counting {
        fn deliver(&self, lanes: &Lanes, msg: Message) {
            self.seen.fetch_add(1, Ordering::Relaxed);
            lanes.push(Lane::classify(msg.opcode), msg);
        }
    }

    #[test]
    fn custom_sink_observes_responses() {
        let proxy = open(TransportKind::default());
        let sink = Arc::new(Counting {
            seen: AtomicUsize::new(0),
        });
        let comp = Component::open(&proxy, "encoder", Some(sink.clone())).unwrap();
        comp.control(Opcode::Init).unwrap();
        comp.control(Opcode::Execute).unwrap();
        // register reply, two acks
        assert_eq!(sink.seen.load(Ordering::Relaxed), 3);
        comp.close().unwrap();
        proxy.close().unwrap();
    }

    #[test]
    fn paused_component_holds_buffers() {
        let proxy = open(TransportKind::default());
        let dec = Component::create(&proxy, &ComponentConfig::new(ComponentType::Decoder)).unwrap();
        dec.control(Opcode::Pause).unwrap();
        let out = dec.output_buffer().unwrap();
        let room = out.length();
        dec.process(Port::Output(0), out, room, BufferOp::FillThisBuffer).unwrap();
        let input = dec.input_buffer().unwrap();
        input.write(0, b"held").unwrap();
        dec.process(Port::Input(0), input, 4, BufferOp::EmptyThisBuffer).unwrap();
        assert!(matches!(
            dec.get_status(Duration::from_millis(30)),
            Err(Error::Timeout)
        ));
        dec.control(Opcode::PauseRelease).unwrap();
        let seen = drain_until(&dec, |_| dec.in_flight() == 0);
        assert!(seen.contains(&Opcode::EmptyThisBuffer));
        assert!(seen.contains(&Opcode::FillThisBuffer));
        dec.close().unwrap();
        proxy.close().unwrap();
    }

    // ---------------------------------------------------------------
    // Libraries
    // ---------------------------------------------------------------
    fn image(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f
    }

    #[test]
    fn create_loads_and_close_unloads_libraries() {
        let proxy = open(TransportKind::default());
        let shm = proxy.shared_memory().unwrap();
        let before = shm.available(Heap::Host);
        let codec = image(&[0xAA; 512]);
        let wrapper = image(&[0x55; 128]);
        let config = ComponentConfig::new(ComponentType::Decoder)
            .with_library(LibInfo::new(codec.path(), LibType::Codec).with_data_size(256))
            .with_library(LibInfo::new(wrapper.path(), LibType::Wrapper));
        let dec = Component::create(&proxy, &config).unwrap();
        assert_eq!(dec.libraries().len(), 2);
        assert!(dec.libraries().iter().all(LibInfo::is_loaded));

        let again = image(&[1; 16]);
        assert!(matches!(
            dec.load_library(LibInfo::new(again.path(), LibType::Codec)),
            Err(Error::InvalidState(_))
        ));
        dec.unload_library(LibType::Wrapper).unwrap();
        assert!(matches!(
            dec.unload_library(LibType::Wrapper),
            Err(Error::NotFound)
        ));
        dec.close().unwrap();
        assert_eq!(shm.available(Heap::Host), before);
        proxy.close().unwrap();
    }

    #[test]
    fn missing_library_fails_create() {
        let proxy = open(TransportKind::default());
        let config = ComponentConfig::new(ComponentType::Renderer)
            .with_library(LibInfo::new("/nonexistent/codec.bin", LibType::Codec));
        assert!(matches!(
            Component::create(&proxy, &config),
            Err(Error::NotFound)
        ));
        assert_eq!(proxy.attached(), 0);
        proxy.close().unwrap();
    }

    /// Hands out a descriptor pointing past the shared region.
    struct OutOfRange {
        unloaded: AtomicBool,
    }

    impl LibraryLoader for OutOfRange {
        fn load(&self, shm: &SharedMemory, lib: &mut LibInfo) -> crate::error::Result<PilInfo> {
            Ok(PilInfo {
                lib_type: lib.lib_type,
                code_addr: shm.size() as u32,
                code_size: 64,
                data_addr: 0,
                data_size: 0,
            })
        }

        fn unload(&self, _shm: &SharedMemory, _lib: &mut LibInfo) -> crate::error::Result<()> {
            self.unloaded.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn rejected_library_is_rolled_back() {
        let proxy = open(TransportKind::default());
        let loader = Arc::new(OutOfRange {
            unloaded: AtomicBool::new(false),
        });
        let config = ComponentConfig::new(ComponentType::Encoder)
            .with_library(LibInfo::new("codec.bin", LibType::Codec));
        let r = Component::create_with_loader(&proxy, &config, loader.clone());
        assert!(matches!(
            r,
            Err(Error::Rejected { opcode: Opcode::SetParam, .. })
        ));
        assert!(loader.unloaded.load(Ordering::Relaxed));
        proxy.close().unwrap();
    }
}
