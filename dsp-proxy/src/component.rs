//! Host handle on one remote component.
//!
//! A [`Component`] is registered with the remote core by name, then driven
//! through two kinds of traffic:
//!
//! - Control requests (`SET_PARAM`, `GET_PARAM`, lifecycle opcodes) are
//!   synchronous. Each carries an AUX buffer; the reply is matched by
//!   buffer identity and opcode on the async lane.
//! - Data buffers are submitted with [`Component::process`] and come back
//!   later on the ack lane, collected with [`Component::get_status`].
//!
//! Every buffer handed to the remote core sits in the component's in-flight
//! table until its response arrives. A control request that times out is
//! retired rather than removed, so its late reply is recognised, logged and
//! discarded instead of being mistaken for the reply to a newer request.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::buffer::{Buffer, BufferPool, PoolRole};
use crate::config::{ComponentConfig, ComponentType};
use crate::error::{first_error, Error, Result};
use crate::lane::{Endpoint, ResponseSink};
use crate::loader::{FlatLoader, LibInfo, LibType, LibraryLoader, PilInfo};
use crate::message::{Address, Message, MsgId, Port};
use crate::opcode::{BufferOp, Lane, Opcode};
use crate::param::{decode_params, encode_params, id, Param, RouteRequest};
use crate::proxy::Proxy;
use crate::remote::{ENOENT, ENOMEM};

/// A completed request as reported to the caller.
#[derive(Debug)]
pub struct Info {
    pub opcode: Opcode,
    /// The buffer that was submitted, handed back to the caller.
    pub buffer: Option<Buffer>,
    /// Valid bytes in `buffer`, or the reply value for opcodes without one.
    pub length: u32,
    /// Result code from the remote core; zero on success.
    pub ret: i32,
    pub src: Address,
}

impl Info {
    fn new(msg: Message, buffer: Option<Buffer>) -> Self {
        Info {
            opcode: msg.opcode,
            buffer,
            length: msg.length,
            ret: msg.ret,
            src: msg.id.src,
        }
    }

    pub fn is_eos(&self) -> bool {
        self.opcode == Opcode::OutputEos
    }

    /// Bytes the remote core left in the returned buffer.
    pub fn data(&self) -> Result<Vec<u8>> {
        match &self.buffer {
            Some(buffer) => buffer.to_vec(self.length as usize),
            None => Ok(Vec::new()),
        }
    }
}

struct InFlight {
    buffer: Buffer,
    opcode: Opcode,
    /// The requester gave up waiting; the reply is discarded on arrival.
    retired: bool,
}

pub(crate) struct Inner {
    proxy: Proxy,
    client: u8,
    remote: Address,
    name: String,
    comp_type: Option<ComponentType>,
    endpoint: Arc<Endpoint>,
    loader: Arc<dyn LibraryLoader>,
    inflight: Mutex<HashMap<usize, InFlight>>,
    input_pool: OnceLock<BufferPool>,
    output_pool: OnceLock<BufferPool>,
    libs: Mutex<Vec<LibInfo>>,
    pipeline: Mutex<Option<u32>>,
    closed: AtomicBool,
}

impl Inner {
    /// Queue a locally generated end-of-stream notice on the ack lane.
    pub(crate) fn post_eos(&self) {
        let notice = Message::new(
            MsgId::new(self.remote, Address::proxy(self.client)),
            Opcode::OutputEos,
            None,
            0,
        );
        self.endpoint.lanes.push(Lane::Ack, notice);
    }

    pub(crate) fn pipeline(&self) -> Option<u32> {
        *self.pipeline.lock()
    }

    pub(crate) fn set_pipeline(&self, pipeline: Option<u32>) {
        *self.pipeline.lock() = pipeline;
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn core(&self) -> u8 {
        self.remote.core()
    }
}

pub struct Component {
    inner: Arc<Inner>,
}

impl Component {
    /// Register a remote component by `name`.
    ///
    /// `sink` replaces the default lane router for this component's
    /// responses. Fails with `NotFound` if the core knows no such name.
    pub fn open(proxy: &Proxy, name: &str, sink: Option<Arc<dyn ResponseSink>>) -> Result<Self> {
        Self::open_as(proxy, name, None, sink, Arc::new(FlatLoader))
    }

    /// Open, load the configured libraries, then allocate the buffer pools.
    /// On any failure the component is closed again.
    pub fn create(proxy: &Proxy, config: &ComponentConfig) -> Result<Self> {
        Self::create_with_loader(proxy, config, Arc::new(FlatLoader))
    }

    pub fn create_with_loader(
        proxy: &Proxy,
        config: &ComponentConfig,
        loader: Arc<dyn LibraryLoader>,
    ) -> Result<Self> {
        let comp = Self::open_as(
            proxy,
            &config.name,
            Some(config.comp_type),
            config.sink.clone(),
            loader,
        )?;
        if let Err(e) = comp.provision(config) {
            log::warn!("{}: setup failed: {e}", config.name);
            if let Err(close) = comp.shutdown(comp.timeout()) {
                log::warn!("{}: close after failed setup: {close}", config.name);
            }
            return Err(e);
        }
        Ok(comp)
    }

    fn open_as(
        proxy: &Proxy,
        name: &str,
        comp_type: Option<ComponentType>,
        sink: Option<Arc<dyn ResponseSink>>,
        loader: Arc<dyn LibraryLoader>,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("component name"));
        }
        let endpoint = Arc::new(Endpoint::new(name, sink));
        let client = proxy.attach(&endpoint)?;
        let remote = match register(proxy, &endpoint, client, name, proxy.config().response_timeout) {
            Ok(remote) => remote,
            Err(e) => {
                proxy.detach(client);
                return Err(e);
            }
        };
        log::debug!("{name}: client {client} bound to {:#06x}", remote.raw());
        Ok(Component {
            inner: Arc::new(Inner {
                proxy: proxy.clone(),
                client,
                remote,
                name: name.to_owned(),
                comp_type,
                endpoint,
                loader,
                inflight: Mutex::new(HashMap::new()),
                input_pool: OnceLock::new(),
                output_pool: OnceLock::new(),
                libs: Mutex::new(Vec::new()),
                pipeline: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn provision(&self, config: &ComponentConfig) -> Result<()> {
        for lib in &config.libraries {
            self.load_library(lib.clone())?;
        }
        let proxy = &self.inner.proxy;
        if let Some(spec) = config.input {
            let pool = proxy.pool_alloc(spec.count, spec.size, PoolRole::Input)?;
            let _ = self.inner.input_pool.set(pool);
        }
        if let Some(spec) = config.output {
            let pool = proxy.pool_alloc(spec.count, spec.size, PoolRole::Output)?;
            let _ = self.inner.output_pool.set(pool);
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn comp_type(&self) -> Option<ComponentType> {
        self.inner.comp_type
    }

    /// Address of the component on its remote core.
    pub fn address(&self) -> Address {
        self.inner.remote
    }

    pub fn proxy(&self) -> &Proxy {
        &self.inner.proxy
    }

    pub fn input_pool(&self) -> Option<&BufferPool> {
        self.inner.input_pool.get()
    }

    pub fn output_pool(&self) -> Option<&BufferPool> {
        self.inner.output_pool.get()
    }

    pub fn input_buffer(&self) -> Result<Buffer> {
        self.input_pool()
            .ok_or(Error::InvalidState("component has no input pool"))?
            .get()
    }

    pub fn output_buffer(&self) -> Result<Buffer> {
        self.output_pool()
            .ok_or(Error::InvalidState("component has no output pool"))?
            .get()
    }

    /// Id of the pipeline this component was added to.
    pub fn pipeline(&self) -> Option<u32> {
        self.inner.pipeline()
    }

    /// Buffers submitted and not yet handed back.
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.lock().len()
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidState("component is closed"));
        }
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.inner.proxy.config().response_timeout
    }

    /// Send a command without waiting for its reply.
    ///
    /// The payload travels in an AUX buffer; the reply is collected with
    /// [`response_get`](Self::response_get) and carries that buffer back.
    pub fn command(&self, port: Port, opcode: Opcode, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.submit_payload(port, opcode, payload).map(|_| ())
    }

    fn submit_payload(&self, port: Port, opcode: Opcode, payload: &[u8]) -> Result<usize> {
        let buffer = self.inner.proxy.aux_buffer()?;
        buffer.write(0, payload)?;
        self.submit(port, opcode, buffer, payload.len())
    }

    /// Hand `buffer` to the remote core. Returns the in-flight key.
    fn submit(&self, port: Port, opcode: Opcode, buffer: Buffer, length: usize) -> Result<usize> {
        let dst = self.inner.remote.with_port(port.checked_wire()?);
        let key = buffer.data();
        let msg = Message::new(
            MsgId::new(Address::proxy(self.inner.client), dst),
            opcode,
            Some(key),
            length as u32,
        );
        self.inner.inflight.lock().insert(
            key,
            InFlight {
                buffer,
                opcode,
                retired: false,
            },
        );
        if let Err(e) = self.inner.proxy.send(&msg) {
            self.inner.inflight.lock().remove(&key);
            return Err(e);
        }
        Ok(key)
    }

    /// Issue a control request and wait for its matching reply.
    fn request(&self, port: Port, opcode: Opcode, payload: &[u8]) -> Result<Info> {
        self.drain_stale();
        let key = self.submit_payload(port, opcode, payload)?;
        self.await_reply(key, opcode, Lane::Async, self.timeout())
    }

    fn await_reply(&self, key: usize, opcode: Opcode, lane: Lane, timeout: Duration) -> Result<Info> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let left = deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));
            let msg = match self.inner.proxy.receive(&self.inner.endpoint, lane, left) {
                Ok(msg) => msg,
                Err(e) => {
                    self.retire(key);
                    return Err(e);
                }
            };
            if msg.buffer == Some(key) {
                let buffer = self.inner.inflight.lock().remove(&key).map(|e| e.buffer);
                if msg.opcode != opcode {
                    return Err(Error::unexpected(opcode, msg.opcode));
                }
                if msg.ret != 0 {
                    return Err(remote_error(opcode, msg.ret));
                }
                return Ok(Info::new(msg, buffer));
            }
            if lane == Lane::Ack {
                // buffers handed back while waiting on a close
                drop(self.resolve(msg));
                continue;
            }
            if self.is_stale(&msg) {
                drop(self.resolve(msg));
                continue;
            }
            self.retire(key);
            log::warn!(
                "{}: {:?} reply on {:?} while waiting for {opcode:?}",
                self.inner.name,
                msg.opcode,
                msg.buffer
            );
            let got = (msg.opcode, msg.buffer);
            self.inner.endpoint.lanes.push(Lane::Async, msg);
            return Err(Error::unexpected((opcode, key), got));
        }
    }

    fn retire(&self, key: usize) {
        if let Some(entry) = self.inner.inflight.lock().get_mut(&key) {
            log::debug!("{}: retiring {:?} request", self.inner.name, entry.opcode);
            entry.retired = true;
        }
    }

    /// A reply nobody is waiting for any more.
    fn is_stale(&self, msg: &Message) -> bool {
        match msg.buffer {
            Some(key) => self.inner.inflight.lock().get(&key).map_or(true, |e| e.retired),
            None => false,
        }
    }

    fn drain_stale(&self) {
        let stale = self
            .inner
            .endpoint
            .lanes
            .take_where(Lane::Async, |m| self.is_stale(m));
        for msg in stale {
            drop(self.resolve(msg));
        }
    }

    /// Pair a reply with its in-flight buffer. `None` for stale replies,
    /// whose buffers go back to their pools here.
    fn resolve(&self, msg: Message) -> Option<Info> {
        let Some(key) = msg.buffer else {
            return Some(Info::new(msg, None));
        };
        match self.inner.inflight.lock().remove(&key) {
            Some(entry) if !entry.retired => Some(Info::new(msg, Some(entry.buffer))),
            Some(entry) => {
                log::warn!(
                    "{}: discarding late {:?} reply to a retired {:?}",
                    self.inner.name,
                    msg.opcode,
                    entry.opcode
                );
                None
            }
            None => {
                log::warn!(
                    "{}: discarding {:?} reply for unknown buffer {key:#x}",
                    self.inner.name,
                    msg.opcode
                );
                None
            }
        }
    }

    /// Issue a codec lifecycle opcode and wait for the acknowledgement.
    /// Returns the reply's length field (the API size for `GET_API_SIZE`).
    pub fn control(&self, opcode: Opcode) -> Result<u32> {
        self.ensure_open()?;
        if !opcode.is_lifecycle() && opcode != Opcode::GetApiSize {
            return Err(Error::InvalidArgument("not a lifecycle opcode"));
        }
        Ok(self.request(Port::Input(0), opcode, &[])?.length)
    }

    /// Ask the remote core to hand back every host buffer queued on the
    /// component. The buffers arrive on the ack lane.
    pub fn flush(&self, port: Port) -> Result<()> {
        self.ensure_open()?;
        self.request(port, Opcode::Flush, &[]).map(|_| ())
    }

    pub fn set_config(&self, params: &[Param]) -> Result<()> {
        self.ensure_open()?;
        if params.is_empty() {
            return Err(Error::InvalidArgument("no parameters"));
        }
        if params.iter().any(|p| p.id >= id::LIB_LOAD) {
            return Err(Error::InvalidArgument("library parameters go through load_library"));
        }
        self.request(Port::Input(0), Opcode::SetParam, &encode_params(params))
            .map(|_| ())
    }

    /// Fill in the `value` of every entry of `params`.
    pub fn get_config(&self, params: &mut [Param]) -> Result<()> {
        self.ensure_open()?;
        if params.is_empty() {
            return Err(Error::InvalidArgument("no parameters"));
        }
        let info = self.request(Port::Input(0), Opcode::GetParam, &encode_params(params))?;
        let values = decode_params(&info.data()?)?;
        if values.len() != params.len() || values.iter().zip(params.iter()).any(|(v, p)| v.id != p.id) {
            return Err(Error::unexpected(
                params.iter().map(|p| p.id).collect::<Vec<_>>(),
                values.iter().map(|p| p.id).collect::<Vec<_>>(),
            ));
        }
        for (p, v) in params.iter_mut().zip(values) {
            p.value = v.value;
        }
        Ok(())
    }

    /// Load `lib` with this component's loader and tell the remote core
    /// where it went. The loader's memory is released if the core refuses.
    pub fn load_library(&self, mut lib: LibInfo) -> Result<()> {
        self.ensure_open()?;
        if self.inner.libs.lock().iter().any(|l| l.lib_type == lib.lib_type) {
            return Err(Error::InvalidState("library type already loaded"));
        }
        let shm = self.inner.proxy.shared_memory()?;
        let pil = self.inner.loader.load(&shm, &mut lib)?;
        let body = encode_params(&pil.load_params());
        if let Err(e) = self.request(Port::Input(0), Opcode::SetParam, &body) {
            if let Err(undo) = self.inner.loader.unload(&shm, &mut lib) {
                log::warn!("{}: rolling back {}: {undo}", self.inner.name, lib.path.display());
            }
            return Err(e);
        }
        log::debug!("{}: loaded {:?} library {}", self.inner.name, lib.lib_type, lib.path.display());
        self.inner.libs.lock().push(lib);
        Ok(())
    }

    pub fn unload_library(&self, lib_type: LibType) -> Result<()> {
        self.ensure_open()?;
        self.unload(lib_type)
    }

    fn unload(&self, lib_type: LibType) -> Result<()> {
        let mut lib = {
            let mut libs = self.inner.libs.lock();
            let pos = libs
                .iter()
                .position(|l| l.lib_type == lib_type)
                .ok_or(Error::NotFound)?;
            libs.remove(pos)
        };
        let body = encode_params(&PilInfo::unload_params(lib_type));
        let told = self.request(Port::Input(0), Opcode::SetParam, &body).map(|_| ());
        let freed = self
            .inner
            .proxy
            .shared_memory()
            .and_then(|shm| self.inner.loader.unload(&shm, &mut lib));
        first_error(told, freed)
    }

    /// Loaded libraries, in load order.
    pub fn libraries(&self) -> Vec<LibInfo> {
        self.inner.libs.lock().clone()
    }

    /// Submit a data buffer: `EMPTY_THIS_BUFFER` to an input port with
    /// `length` valid bytes, or `FILL_THIS_BUFFER` to an output port with
    /// `length` bytes of room. Completion arrives on the ack lane.
    pub fn process(&self, port: Port, buffer: Buffer, length: usize, op: BufferOp) -> Result<()> {
        self.ensure_open()?;
        match (op, port) {
            (BufferOp::EmptyThisBuffer, Port::Input(_)) | (BufferOp::FillThisBuffer, Port::Output(_)) => {}
            _ => return Err(Error::InvalidArgument("buffer operation does not match port direction")),
        }
        if length > buffer.length() {
            return Err(Error::InvalidArgument("length exceeds buffer"));
        }
        self.submit(port, op.opcode(), buffer, length).map(|_| ())
    }

    /// Wait for the next buffer event on the ack lane.
    ///
    /// Returned buffers come back inside the [`Info`]; end of stream is an
    /// `OUTPUT_EOS` without a buffer.
    pub fn get_status(&self, timeout: Duration) -> Result<Info> {
        self.response_get_ack(timeout)
    }

    /// Next message on the async lane.
    pub fn response_get(&self, timeout: Duration) -> Result<Info> {
        self.next_on(Lane::Async, timeout)
    }

    /// Next message on the ack lane.
    pub fn response_get_ack(&self, timeout: Duration) -> Result<Info> {
        self.next_on(Lane::Ack, timeout)
    }

    fn next_on(&self, lane: Lane, timeout: Duration) -> Result<Info> {
        self.ensure_open()?;
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let left = deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));
            let msg = self.inner.proxy.receive(&self.inner.endpoint, lane, left)?;
            if let Some(info) = self.resolve(msg) {
                return Ok(info);
            }
        }
    }

    /// Queue `msg` on the async lane as if it had arrived from the core.
    pub fn response_put(&self, msg: Message) {
        self.inner.endpoint.lanes.push(Lane::Async, msg);
    }

    /// Queue `msg` on the ack lane as if it had arrived from the core.
    pub fn response_put_ack(&self, msg: Message) {
        self.inner.endpoint.lanes.push(Lane::Ack, msg);
    }

    pub(crate) fn route(
        &self,
        port: Port,
        dst: &Component,
        dst_port: Port,
        count: u32,
        length: u32,
    ) -> Result<()> {
        self.ensure_open()?;
        dst.ensure_open()?;
        if !matches!(port, Port::Output(_)) || !matches!(dst_port, Port::Input(_)) {
            return Err(Error::InvalidArgument("links run from an output to an input"));
        }
        if dst.address().core() != self.address().core() {
            return Err(Error::InvalidArgument("components live on different cores"));
        }
        if count == 0 || length == 0 {
            return Err(Error::InvalidArgument("link geometry"));
        }
        let req = RouteRequest {
            dst: dst.address().with_port(dst_port.checked_wire()?),
            count,
            length,
        };
        self.request(port, Opcode::Route, &req.encode())?;
        log::debug!(
            "{} {port:?} -> {} {dst_port:?}: {count} x {length} bytes",
            self.inner.name,
            dst.inner.name
        );
        Ok(())
    }

    pub(crate) fn unroute(&self, port: Port) -> Result<()> {
        self.ensure_open()?;
        if !matches!(port, Port::Output(_)) {
            return Err(Error::InvalidArgument("only output ports are routed"));
        }
        self.request(port, Opcode::Unroute, &[])?;
        log::debug!("{} {port:?} unrouted", self.inner.name);
        Ok(())
    }

    /// Unload libraries, unregister from the core, then free the pools.
    ///
    /// Every step runs; the first failure is returned.
    pub fn close(self) -> Result<()> {
        self.shutdown(self.timeout())
    }

    fn shutdown(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState("component already closed"));
        }
        let mut result = Ok(());
        let loaded: Vec<LibType> = inner.libs.lock().iter().map(|l| l.lib_type).collect();
        for lib_type in loaded {
            result = first_error(result, self.unload(lib_type));
        }

        inner.endpoint.set_closing();
        result = first_error(result, self.unregister(timeout));
        inner.proxy.detach(inner.client);

        let abandoned = inner.inflight.lock().drain().count();
        if abandoned > 0 {
            log::debug!("{}: dropped {abandoned} unanswered buffers", inner.name);
        }
        if let Some(pool) = inner.input_pool.get() {
            result = first_error(result, pool.free());
        }
        if let Some(pool) = inner.output_pool.get() {
            result = first_error(result, pool.free());
        }
        log::debug!("{}: closed", inner.name);
        result
    }

    fn unregister(&self, timeout: Duration) -> Result<()> {
        self.drain_stale();
        let key = self.submit_payload(Port::Input(0), Opcode::Unregister, &[])?;
        match self.await_reply(key, Opcode::Unregister, Lane::Ack, timeout) {
            Ok(_) => Ok(()),
            Err(e @ (Error::Timeout | Error::Interrupted)) => {
                // the core still owes the acknowledgement
                let buffer = self.inner.inflight.lock().remove(&key).map(|e| e.buffer);
                let inner = &self.inner;
                inner.proxy.retire(inner.client, &inner.endpoint, Opcode::Unregister, buffer);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for Component {
    fn drop(&mut self) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.shutdown(self.timeout()) {
            log::warn!("{}: close on drop: {e}", self.inner.name);
        }
    }
}

impl core::fmt::Debug for Component {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.inner.name)
            .field("client", &self.inner.client)
            .field("remote", &format_args!("{:#06x}", self.inner.remote.raw()))
            .field("pipeline", &self.pipeline())
            .finish()
    }
}

/// Send `REGISTER` for `name` and return the address the core assigned.
///
/// If the reply does not come in time, `client` is retired until it does.
fn register(
    proxy: &Proxy,
    endpoint: &Endpoint,
    client: u8,
    name: &str,
    timeout: Duration,
) -> Result<Address> {
    let buffer = proxy.aux_buffer()?;
    buffer.write(0, name.as_bytes())?;
    let key = buffer.data();
    let core = proxy.core_id() as u8;
    let msg = Message::new(
        MsgId::new(Address::proxy(client), Address::new(core, 0, 0)),
        Opcode::Register,
        Some(key),
        name.len() as u32,
    );
    proxy.send(&msg).map_err(|e| match e {
        Error::Transport(io) => {
            log::warn!("core {core}: register {name}: {io}");
            Error::DeviceUnavailable
        }
        e => e,
    })?;
    let reply = match proxy.receive(endpoint, Lane::Async, timeout) {
        Ok(reply) => reply,
        Err(e @ (Error::Timeout | Error::Interrupted)) => {
            proxy.retire(client, endpoint, Opcode::Register, Some(buffer));
            return Err(e);
        }
        Err(e) => return Err(e),
    };
    if reply.buffer != Some(key) || reply.opcode != Opcode::Register {
        return Err(Error::unexpected((Opcode::Register, key), (reply.opcode, reply.buffer)));
    }
    if reply.ret != 0 {
        return Err(remote_error(Opcode::Register, reply.ret));
    }
    Ok(reply.id.src)
}

fn remote_error(opcode: Opcode, ret: i32) -> Error {
    match -ret {
        ENOENT => Error::NotFound,
        ENOMEM => Error::OutOfMemory,
        _ => Error::Rejected { opcode, code: ret },
    }
}
