//! Dispatch loop of the emulated core.
//!
//! The loop first drains the local dispatch queue, then takes at most one
//! record from the transport, and only sleeps when both are empty. Every
//! message handled here sits in a message-pool slot; a slot leaves the core
//! either across the transport (and is freed) or through the local queue to
//! another component on the same core.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::constants::MAX_CLIENTS;
use crate::error::{Error, Result};
use crate::loader::{LibType, PilInfo};
use crate::message::{Address, Delivery, Message, MsgId, Port, WireMessage};
use crate::msg_pool::{LocalHeap, MessagePool, MsgHandle};
use crate::opcode::Opcode;
use crate::param::{decode_params, encode_params, id, Param, RouteRequest};
use crate::queue::{IrqGuard, LocalQueue, Queue};
use crate::shmem::{AddressMap, Heap, Region, SharedMemory};
use crate::transport::RemoteLink;

use super::node::{self, DspNode};
use super::{EBUSY, EINVAL, ENOENT, ENOMEM};

/// Longest sleep between checks of an idle link.
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Client number of the core itself; it only accepts `REGISTER`.
const MANAGER: u8 = 0;

pub(super) struct CoreSettings {
    pub core_id: u8,
    pub msg_pool_size: usize,
    pub local_memory: usize,
}

type PoolCell = critical_section::Mutex<RefCell<MessagePool>>;

fn pooled<R>(pool: &PoolCell, f: impl FnOnce(&mut MessagePool) -> R) -> R {
    let irq = IrqGuard::new();
    let mut guard = pool.borrow_ref_mut(irq.token());
    f(&mut guard)
}

/// Thread entry point.
pub(super) fn run(
    settings: CoreSettings,
    link: Box<dyn RemoteLink>,
    shm: Arc<SharedMemory>,
    ready: Arc<AtomicBool>,
) {
    let core_id = settings.core_id;
    let mut core = match Core::new(settings, link, shm) {
        Ok(core) => core,
        Err(e) => {
            log::error!("core {core_id}: cannot start: {e}");
            return;
        }
    };
    ready.store(true, Ordering::Release);
    core.serve();
    core.shutdown();
}

/// Everything a component needs to move messages around.
struct Ctx {
    id: u8,
    link: Box<dyn RemoteLink>,
    shm: Arc<SharedMemory>,
    map: AddressMap,
    pool: PoolCell,
    local: LocalQueue<MsgHandle>,
}

impl Ctx {
    fn msg(&self, h: &MsgHandle) -> Message {
        pooled(&self.pool, |p| *p.msg(h))
    }

    fn update(&self, h: &MsgHandle, f: impl FnOnce(&mut Message)) {
        pooled(&self.pool, |p| f(p.msg_mut(h)))
    }

    fn release(&self, h: MsgHandle) {
        // a bad handle is logged by the pool
        let _ = pooled(&self.pool, |p| p.put(h));
    }

    /// Complete `h` with result `ret` and pass it on.
    fn complete(&self, h: MsgHandle, ret: i32) {
        self.update(&h, |m| {
            m.ret = ret;
            m.complete();
        });
        self.forward(h);
    }

    fn forward(&self, h: MsgHandle) {
        let msg = self.msg(&h);
        match msg.delivery() {
            Delivery::Proxy => {
                self.send_to_host(&msg);
                self.release(h);
            }
            Delivery::Local => {
                let irq = IrqGuard::new();
                self.local.enqueue(&irq, h);
            }
        }
    }

    /// Originate a message from a fresh slot.
    fn post(&self, msg: Message) {
        match pooled(&self.pool, |p| p.alloc(msg)) {
            Ok(h) => self.forward(h),
            Err(e) => log::error!("core {}: cannot post {:?}: {e}", self.id, msg.opcode),
        }
    }

    fn send_to_host(&self, msg: &Message) {
        let sent = WireMessage::encode(msg, &self.map).and_then(|record| self.link.send(record));
        if let Err(e) = sent {
            log::warn!("core {}: lost {:?} for {:?}: {e}", self.id, msg.opcode, msg.id.dst);
        }
    }

    fn payload(&self, msg: &Message) -> Option<(usize, Vec<u8>)> {
        let offset = msg.buffer?;
        let mut bytes = vec![0u8; msg.length as usize];
        self.shm.read(offset, &mut bytes).ok()?;
        Some((offset, bytes))
    }
}

/// Link buffers between an output port and a downstream input.
struct Route {
    dst: Address,
    region: Region,
    count: u32,
    length: u32,
}

impl Route {
    fn owns(&self, msg: &Message) -> bool {
        msg.buffer
            .is_some_and(|b| b >= self.region.offset && b < self.region.end())
    }
}

struct OutputPort {
    queue: Queue<MsgHandle>,
    route: Option<Route>,
}

struct Client {
    addr: Address,
    /// Host endpoint that registered this client.
    owner: Address,
    name: String,
    node: Box<dyn DspNode>,
    params: BTreeMap<u32, u32>,
    libs: Vec<PilInfo>,
    paused: bool,
    input: Queue<MsgHandle>,
    /// Bytes of the head input buffer already consumed.
    consumed: usize,
    input_over: bool,
    output: Option<OutputPort>,
}

impl Client {
    fn new(addr: Address, owner: Address, name: String, node: Box<dyn DspNode>) -> Self {
        let params = node.defaults().iter().map(|p| (p.id, p.value)).collect();
        let output = node.has_output().then(|| OutputPort {
            queue: Queue::new(),
            route: None,
        });
        Client {
            addr,
            owner,
            name,
            node,
            params,
            libs: Vec::new(),
            paused: false,
            input: Queue::new(),
            consumed: 0,
            input_over: false,
            output,
        }
    }

    fn route(&self) -> Option<&Route> {
        self.output.as_ref().and_then(|o| o.route.as_ref())
    }

    fn handle(&mut self, ctx: &Ctx, h: MsgHandle, msg: Message) {
        let port = Port::from_wire(msg.id.dst.port());
        match msg.opcode {
            Opcode::EmptyThisBuffer => {
                if port != Port::Input(0) {
                    return ctx.complete(h, -EINVAL);
                }
                self.input.enqueue(h);
                self.process(ctx);
            }
            Opcode::FillThisBuffer => self.fill_this_buffer(ctx, h, msg, port),
            Opcode::Flush => self.flush(ctx, h),
            Opcode::SetParam => {
                let ret = self.set_params(ctx, &msg);
                ctx.complete(h, ret);
            }
            Opcode::GetParam => {
                let ret = self.get_params(ctx, &msg);
                ctx.complete(h, ret);
            }
            Opcode::GetApiSize => {
                let size = self.node.api_size();
                ctx.update(&h, |m| m.length = size);
                ctx.complete(h, 0);
            }
            Opcode::Pause | Opcode::Suspend => {
                self.paused = true;
                ctx.complete(h, 0);
            }
            Opcode::PauseRelease | Opcode::Resume => {
                self.paused = false;
                ctx.complete(h, 0);
                self.process(ctx);
            }
            Opcode::InputOver => {
                self.input_over = true;
                ctx.complete(h, 0);
                self.process(ctx);
            }
            Opcode::Execute => {
                ctx.complete(h, 0);
                self.process(ctx);
            }
            op if op.is_lifecycle() => ctx.complete(h, 0),
            op => {
                log::warn!("core {}: {} does not handle {op:?}", ctx.id, self.name);
                ctx.complete(h, -EINVAL);
            }
        }
    }

    fn fill_this_buffer(&mut self, ctx: &Ctx, h: MsgHandle, msg: Message, port: Port) {
        let Some(out) = self.output.as_mut().filter(|_| port == Port::Output(0)) else {
            return ctx.complete(h, -EINVAL);
        };
        match &out.route {
            // a returning link buffer is refilled to its full size
            Some(route) if route.owns(&msg) => {
                let length = route.length;
                ctx.update(&h, |m| m.length = length);
            }
            // the port is fed by the route, not by the host
            Some(_) => return ctx.complete(h, -EBUSY),
            None if msg.length == 0 => return ctx.complete(h, -EINVAL),
            None => {}
        }
        out.queue.enqueue(h);
        self.process(ctx);
    }

    /// Move data from queued inputs to queued outputs until one side runs dry.
    fn process(&mut self, ctx: &Ctx) {
        if self.paused {
            return;
        }
        while let Some(head) = self.input.head() {
            let input = ctx.msg(head);
            if input.length == 0 {
                // zero-length buffer marks the end of the input stream
                if let Some(h) = self.input.dequeue() {
                    ctx.complete(h, 0);
                }
                self.consumed = 0;
                self.input_over = true;
                continue;
            }
            let Some(in_offset) = input.buffer else {
                if let Some(h) = self.input.dequeue() {
                    ctx.complete(h, -EINVAL);
                }
                continue;
            };
            let mut data = vec![0u8; (input.length as usize).saturating_sub(self.consumed)];
            if ctx.shm.read(in_offset + self.consumed, &mut data).is_err() {
                self.consumed = 0;
                if let Some(h) = self.input.dequeue() {
                    ctx.complete(h, -EINVAL);
                }
                continue;
            }

            let used = match self.output.as_mut() {
                None => self.node.process(&data, &mut []).0,
                Some(out) => {
                    let Some(out_head) = out.queue.head() else {
                        break;
                    };
                    let target = ctx.msg(out_head);
                    let Some(out_offset) = target.buffer else {
                        if let Some(h) = out.queue.dequeue() {
                            ctx.complete(h, -EINVAL);
                        }
                        continue;
                    };
                    let mut window = vec![0u8; target.length as usize];
                    let (used, produced) = self.node.process(&data, &mut window);
                    if produced > 0 {
                        if let Some(h) = out.queue.dequeue() {
                            let ret = match ctx.shm.write(out_offset, &window[..produced]) {
                                Ok(()) => 0,
                                Err(_) => -EINVAL,
                            };
                            ctx.update(&h, |m| m.length = produced as u32);
                            ctx.complete(h, ret);
                        }
                    } else if used == 0 {
                        break;
                    }
                    used
                }
            };

            self.consumed += used;
            if self.consumed >= input.length as usize {
                self.consumed = 0;
                if let Some(h) = self.input.dequeue() {
                    ctx.complete(h, 0);
                }
            }
        }
        self.finish_stream(ctx);
    }

    /// Signal end of stream once the input is over and fully consumed.
    fn finish_stream(&mut self, ctx: &Ctx) {
        if !self.input_over || !self.input.is_empty() || self.paused {
            return;
        }
        match self.output.as_mut() {
            Some(out) if out.route.is_some() => {
                // forwarded downstream as a zero-length link buffer
                let Some(h) = out.queue.dequeue() else {
                    return;
                };
                ctx.update(&h, |m| m.length = 0);
                ctx.complete(h, 0);
            }
            _ => ctx.post(Message::new(
                MsgId::new(self.addr, self.owner),
                Opcode::OutputEos,
                None,
                0,
            )),
        }
        log::debug!("core {}: {} reached end of stream", ctx.id, self.name);
        self.input_over = false;
    }

    /// Hand every host buffer back; link buffers stay in place.
    fn flush(&mut self, ctx: &Ctx, h: MsgHandle) {
        let from_host = |m: &MsgHandle| ctx.msg(m).id.src.is_proxy();
        let head_before = self.input.head().map(MsgHandle::index);
        let inputs = self.input.take_where(from_host);
        if self.input.head().map(MsgHandle::index) != head_before {
            self.consumed = 0;
        }
        for m in inputs {
            ctx.complete(m, 0);
        }
        if let Some(out) = self.output.as_mut() {
            for m in out.queue.take_where(from_host) {
                ctx.update(&m, |msg| msg.length = 0);
                ctx.complete(m, 0);
            }
        }
        self.input_over = false;
        ctx.complete(h, 0);
    }

    fn set_params(&mut self, ctx: &Ctx, msg: &Message) -> i32 {
        let Some(params) = ctx.payload(msg).and_then(|(_, b)| decode_params(&b).ok()) else {
            return -EINVAL;
        };
        match params.first().map(|p| p.id) {
            Some(id::LIB_LOAD) => self.load_library(ctx, &params),
            Some(id::LIB_UNLOAD) => self.unload_library(ctx, params[0].value),
            _ => {
                if params.iter().any(|p| p.id >= id::LIB_LOAD) {
                    return -EINVAL;
                }
                for p in params {
                    self.params.insert(p.id, p.value);
                }
                0
            }
        }
    }

    fn get_params(&self, ctx: &Ctx, msg: &Message) -> i32 {
        let Some((offset, bytes)) = ctx.payload(msg) else {
            return -EINVAL;
        };
        let Ok(wanted) = decode_params(&bytes) else {
            return -EINVAL;
        };
        let mut values = Vec::with_capacity(wanted.len());
        for p in wanted {
            match self.params.get(&p.id) {
                Some(v) => values.push(Param::new(p.id, *v)),
                None => return -EINVAL,
            }
        }
        match ctx.shm.write(offset, &encode_params(&values)) {
            Ok(()) => 0,
            Err(_) => -EINVAL,
        }
    }

    fn load_library(&mut self, ctx: &Ctx, params: &[Param]) -> i32 {
        let Ok(pil) = PilInfo::from_params(params) else {
            return -EINVAL;
        };
        let in_shm = |addr: u32, size: u32| {
            (addr as usize)
                .checked_add(size as usize)
                .is_some_and(|end| end <= ctx.shm.size())
        };
        if pil.code_size == 0
            || !in_shm(pil.code_addr, pil.code_size)
            || (pil.data_size > 0 && !in_shm(pil.data_addr, pil.data_size))
        {
            return -EINVAL;
        }
        if self.libs.iter().any(|l| l.lib_type == pil.lib_type) {
            return -EBUSY;
        }
        log::info!(
            "core {}: {} loaded {:?} library, {} bytes at {:#x}",
            ctx.id,
            self.name,
            pil.lib_type,
            pil.code_size,
            pil.code_addr
        );
        self.libs.push(pil);
        0
    }

    fn unload_library(&mut self, ctx: &Ctx, raw_type: u32) -> i32 {
        let Ok(lib_type) = LibType::from_raw(raw_type) else {
            return -EINVAL;
        };
        match self.libs.iter().position(|l| l.lib_type == lib_type) {
            Some(i) => {
                self.libs.remove(i);
                log::info!("core {}: {} unloaded {lib_type:?} library", ctx.id, self.name);
                0
            }
            None => -ENOENT,
        }
    }

    /// Complete every queued host buffer back to the host; free the rest.
    fn return_buffers(&mut self, ctx: &Ctx) {
        let mut queued: Vec<MsgHandle> = self.input.drain().collect();
        if let Some(out) = self.output.as_mut() {
            queued.extend(out.queue.drain());
        }
        for h in queued {
            let msg = ctx.msg(&h);
            if msg.id.src.is_proxy() {
                if msg.opcode == Opcode::FillThisBuffer {
                    ctx.update(&h, |m| m.length = 0);
                }
                ctx.complete(h, 0);
            } else {
                ctx.release(h);
            }
        }
        self.consumed = 0;
    }

    fn discard_buffers(&mut self, ctx: &Ctx) {
        for h in self.input.drain() {
            ctx.release(h);
        }
        if let Some(out) = self.output.as_mut() {
            for h in out.queue.drain() {
                ctx.release(h);
            }
        }
    }
}

struct Core {
    ctx: Ctx,
    clients: BTreeMap<u8, Client>,
}

impl Core {
    fn new(settings: CoreSettings, link: Box<dyn RemoteLink>, shm: Arc<SharedMemory>) -> Result<Self> {
        let mut scratch = LocalHeap::new(settings.local_memory);
        let pool = MessagePool::init(settings.msg_pool_size, &mut scratch)?;
        log::debug!(
            "core {}: {} message slots, {} bytes of scratch left",
            settings.core_id,
            pool.capacity(),
            scratch.available()
        );
        Ok(Core {
            ctx: Ctx {
                id: settings.core_id,
                link,
                map: AddressMap::identity(shm.size()),
                shm,
                pool: critical_section::Mutex::new(RefCell::new(pool)),
                local: LocalQueue::new(),
            },
            clients: BTreeMap::new(),
        })
    }

    fn serve(&mut self) {
        loop {
            self.drain_local();
            match self.ctx.link.recv() {
                Ok(Some(record)) => {
                    self.receive(record);
                    continue;
                }
                Ok(None) => {}
                Err(Error::DeviceUnavailable) => break,
                Err(e) => {
                    log::warn!("core {}: receive failed: {e}", self.ctx.id);
                    break;
                }
            }
            match self.ctx.link.wait(IDLE_WAIT) {
                Ok(_) | Err(Error::Interrupted) => {}
                Err(Error::DeviceUnavailable) => break,
                Err(e) => {
                    log::warn!("core {}: wait failed: {e}", self.ctx.id);
                    break;
                }
            }
        }
        log::debug!("core {}: host link closed", self.ctx.id);
    }

    fn drain_local(&mut self) {
        loop {
            let next = {
                let irq = IrqGuard::new();
                self.ctx.local.dequeue(&irq)
            };
            match next {
                Some(h) => self.deliver(h),
                None => break,
            }
        }
    }

    fn receive(&mut self, record: WireMessage) {
        let msg = match record.decode(&self.ctx.map) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("core {}: dropping record {record:?}: {e}", self.ctx.id);
                return;
            }
        };
        match pooled(&self.ctx.pool, |p| p.alloc(msg)) {
            Ok(h) => self.deliver(h),
            Err(e) => {
                log::error!("core {}: {e} while receiving {:?}", self.ctx.id, msg.opcode);
                let mut reply = msg;
                reply.ret = -ENOMEM;
                reply.complete();
                self.ctx.send_to_host(&reply);
            }
        }
    }

    fn deliver(&mut self, h: MsgHandle) {
        let msg = self.ctx.msg(&h);
        let client = msg.id.dst.client();
        if client == MANAGER {
            return self.register(h, msg);
        }
        match msg.opcode {
            Opcode::Unregister => self.unregister(h, client),
            Opcode::Route => self.route(h, client, msg),
            Opcode::Unroute => {
                let ret = if Port::from_wire(msg.id.dst.port()) != Port::Output(0) {
                    -EINVAL
                } else {
                    self.teardown_route(client).err().unwrap_or(0)
                };
                self.ctx.complete(h, ret);
            }
            _ => match self.clients.get_mut(&client) {
                Some(c) => c.handle(&self.ctx, h, msg),
                None => {
                    log::warn!("core {}: {:?} for unknown client {client}", self.ctx.id, msg.opcode);
                    self.ctx.complete(h, -ENOENT);
                }
            },
        }
    }

    fn register(&mut self, h: MsgHandle, msg: Message) {
        if msg.opcode != Opcode::Register {
            return self.ctx.complete(h, -EINVAL);
        }
        let Some(name) = self
            .ctx
            .payload(&msg)
            .and_then(|(_, bytes)| String::from_utf8(bytes).ok())
        else {
            return self.ctx.complete(h, -EINVAL);
        };
        let Some(node) = node::create(&name) else {
            log::warn!("core {}: no component named {name:?}", self.ctx.id);
            return self.ctx.complete(h, -ENOENT);
        };
        let Some(client) = (1..=MAX_CLIENTS as u8).find(|c| !self.clients.contains_key(c)) else {
            return self.ctx.complete(h, -EBUSY);
        };
        let addr = Address::new(self.ctx.id, client, 0);
        log::info!(
            "core {}: {name} registered as client {client} for {:?}",
            self.ctx.id,
            msg.id.src
        );
        self.clients
            .insert(client, Client::new(addr, msg.id.src, name, node));
        // the completion comes from the new component
        self.ctx.update(&h, |m| {
            m.ret = 0;
            m.complete();
            m.id.src = addr;
        });
        self.ctx.forward(h);
    }

    fn unregister(&mut self, h: MsgHandle, client: u8) {
        if !self.clients.contains_key(&client) {
            return self.ctx.complete(h, -ENOENT);
        }
        let feeders: Vec<u8> = self
            .clients
            .iter()
            .filter(|(_, c)| c.route().is_some_and(|r| r.dst.client() == client))
            .map(|(k, _)| *k)
            .collect();
        for feeder in feeders {
            let _ = self.teardown_route(feeder);
        }
        if self.clients.get(&client).is_some_and(|c| c.route().is_some()) {
            let _ = self.teardown_route(client);
        }
        if let Some(mut c) = self.clients.remove(&client) {
            c.return_buffers(&self.ctx);
            log::info!("core {}: {} (client {client}) unregistered", self.ctx.id, c.name);
        }
        self.ctx.complete(h, 0);
    }

    fn route(&mut self, h: MsgHandle, client: u8, msg: Message) {
        let ret = self.try_route(client, &msg).err().unwrap_or(0);
        self.ctx.complete(h, ret);
        if ret == 0 {
            if let Some(c) = self.clients.get_mut(&client) {
                c.process(&self.ctx);
            }
        }
    }

    fn try_route(&mut self, client: u8, msg: &Message) -> core::result::Result<(), i32> {
        if Port::from_wire(msg.id.dst.port()) != Port::Output(0) {
            return Err(-EINVAL);
        }
        let req = self
            .ctx
            .payload(msg)
            .and_then(|(_, bytes)| RouteRequest::decode(&bytes).ok())
            .ok_or(-EINVAL)?;
        let peer = req.dst.client();
        if peer == client
            || req.count == 0
            || req.length == 0
            || Port::from_wire(req.dst.port()) != Port::Input(0)
        {
            return Err(-EINVAL);
        }
        if !self.clients.contains_key(&peer) {
            return Err(-ENOENT);
        }
        let ctx = &self.ctx;
        let c = self.clients.get_mut(&client).ok_or(-ENOENT)?;
        let src = c.addr.with_port(Port::Output(0).wire());
        let out = c.output.as_mut().ok_or(-EINVAL)?;
        if out.route.is_some() {
            return Err(-EBUSY);
        }
        let size = (req.count as usize)
            .checked_mul(req.length as usize)
            .ok_or(-ENOMEM)?;
        let region = ctx.shm.alloc(Heap::Dsp, size).map_err(|_| -ENOMEM)?;
        let dst = Address::new(ctx.id, peer, Port::Input(0).wire());

        let mut links = Vec::with_capacity(req.count as usize);
        for i in 0..req.count as usize {
            let fill = Message::new(
                MsgId::new(dst, src),
                Opcode::FillThisBuffer,
                Some(region.offset + i * req.length as usize),
                req.length,
            );
            match pooled(&ctx.pool, |p| p.alloc(fill)) {
                Ok(h) => links.push(h),
                Err(_) => {
                    for h in links {
                        ctx.release(h);
                    }
                    let _ = ctx.shm.free(Heap::Dsp, region);
                    return Err(-ENOMEM);
                }
            }
        }
        for h in links {
            out.queue.enqueue(h);
        }
        log::debug!(
            "core {}: routed client {client} to client {peer} via {} x {} bytes at {:#x}",
            ctx.id,
            req.count,
            req.length,
            region.offset
        );
        out.route = Some(Route {
            dst,
            region,
            count: req.count,
            length: req.length,
        });
        Ok(())
    }

    /// Recover every link buffer of `client`'s route and release its memory.
    fn teardown_route(&mut self, client: u8) -> core::result::Result<(), i32> {
        let ctx = &self.ctx;
        let c = self.clients.get_mut(&client).ok_or(-ENOENT)?;
        let out = c.output.as_mut().ok_or(-ENOENT)?;
        let route = out.route.take().ok_or(-ENOENT)?;
        let owned = |h: &MsgHandle| route.owns(&ctx.msg(h));

        let mut links = out.queue.take_where(owned);
        if let Some(peer) = self.clients.get_mut(&route.dst.client()) {
            let head_owned = peer.input.head().is_some_and(owned);
            links.extend(peer.input.take_where(owned));
            if head_owned {
                peer.consumed = 0;
            }
        }
        {
            let irq = IrqGuard::new();
            links.extend(ctx.local.take_where(&irq, owned));
        }

        if links.len() != route.count as usize {
            log::warn!(
                "core {}: recovered {} of {} link buffers of client {client}",
                ctx.id,
                links.len(),
                route.count
            );
        }
        for h in links {
            ctx.release(h);
        }
        if let Err(e) = ctx.shm.free(Heap::Dsp, route.region) {
            log::warn!("core {}: link memory of client {client}: {e}", ctx.id);
        }
        log::debug!("core {}: unrouted client {client}", ctx.id);
        Ok(())
    }

    fn shutdown(&mut self) {
        let routed: Vec<u8> = self
            .clients
            .iter()
            .filter(|(_, c)| c.route().is_some())
            .map(|(k, _)| *k)
            .collect();
        for client in routed {
            let _ = self.teardown_route(client);
        }
        for (_, mut c) in core::mem::take(&mut self.clients) {
            c.discard_buffers(&self.ctx);
        }
        loop {
            let next = {
                let irq = IrqGuard::new();
                self.ctx.local.dequeue(&irq)
            };
            match next {
                Some(h) => self.ctx.release(h),
                None => break,
            }
        }
        let (free, total) = pooled(&self.ctx.pool, |p| (p.available(), p.capacity()));
        if free != total {
            log::warn!("core {}: {} message slots leaked", self.ctx.id, total - free);
        }
        log::debug!("core {}: stopped", self.ctx.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    const SHM: usize = 64 * 1024;

    struct TestLink {
        sent: Arc<Mutex<Vec<Message>>>,
    }

    impl RemoteLink for TestLink {
        fn send(&self, record: WireMessage) -> Result<()> {
            let msg = record.decode(&AddressMap::identity(SHM))?;
            self.sent.lock().push(msg);
            Ok(())
        }

        fn wait(&self, _timeout: Duration) -> Result<bool> {
            Ok(false)
        }

        fn recv(&self) -> Result<Option<WireMessage>> {
            Ok(None)
        }
    }

    struct Harness {
        core: Core,
        sent: Arc<Mutex<Vec<Message>>>,
        shm: Arc<SharedMemory>,
        /// Next free scratch offset in the host heap.
        scratch: usize,
    }

    impl Harness {
        fn new() -> Self {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let shm = Arc::new(SharedMemory::new(SHM).unwrap());
            let settings = CoreSettings {
                core_id: 0,
                msg_pool_size: 32,
                local_memory: 4096,
            };
            let link = TestLink { sent: sent.clone() };
            Harness {
                core: Core::new(settings, Box::new(link), shm.clone()).unwrap(),
                sent,
                shm,
                scratch: 0,
            }
        }

        fn buffer(&mut self, bytes: &[u8], capacity: usize) -> usize {
            let at = self.scratch;
            self.shm.write(at, bytes).unwrap();
            self.scratch += capacity.max(bytes.len()).next_multiple_of(64);
            at
        }

        fn send(&mut self, src: Address, dst: Address, op: Opcode, buffer: Option<usize>, len: usize) {
            let msg = Message::new(MsgId::new(src, dst), op, buffer, len as u32);
            let record = WireMessage::encode(&msg, &AddressMap::identity(SHM)).unwrap();
            self.core.receive(record);
            self.core.drain_local();
        }

        fn take(&self) -> Vec<Message> {
            core::mem::take(&mut *self.sent.lock())
        }

        fn register(&mut self, host: u8, name: &str) -> Address {
            let buf = self.buffer(name.as_bytes(), 64);
            self.send(Address::proxy(host), Address::new(0, MANAGER, 0), Opcode::Register, Some(buf), name.len());
            let reply = self.take().pop().unwrap();
            assert_eq!(reply.ret, 0);
            reply.id.src
        }
    }

    #[test]
    fn register_assigns_client_addresses() {
        let mut h = Harness::new();
        let a = h.register(1, "decoder");
        let b = h.register(2, "renderer");
        assert_eq!(a, Address::new(0, 1, 0));
        assert_eq!(b, Address::new(0, 2, 0));
    }

    #[test]
    fn unknown_name_is_enoent() {
        let mut h = Harness::new();
        let buf = h.buffer(b"aac-decoder", 64);
        h.send(Address::proxy(1), Address::new(0, 0, 0), Opcode::Register, Some(buf), 11);
        let reply = h.take().pop().unwrap();
        assert_eq!(reply.opcode, Opcode::Register);
        assert_eq!(reply.ret, -ENOENT);
        assert_eq!(reply.buffer, Some(buf));
    }

    #[test]
    fn decoder_copies_input_into_host_output() {
        let mut h = Harness::new();
        let host = Address::proxy(1);
        let dec = h.register(1, "decoder");
        let input = h.buffer(b"hello", 64);
        let output = h.buffer(&[], 64);

        h.send(host, dec.with_port(Port::Output(0).wire()), Opcode::FillThisBuffer, Some(output), 64);
        assert!(h.take().is_empty());
        h.send(host, dec, Opcode::EmptyThisBuffer, Some(input), 5);

        let replies = h.take();
        assert_eq!(replies.len(), 2);
        let produced = replies.iter().find(|m| m.opcode == Opcode::EmptyThisBuffer).unwrap();
        assert_eq!(produced.buffer, Some(output));
        assert_eq!(produced.length, 5);
        let consumed = replies.iter().find(|m| m.opcode == Opcode::FillThisBuffer).unwrap();
        assert_eq!(consumed.buffer, Some(input));
        let mut out = [0u8; 5];
        h.shm.read(output, &mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn routed_stream_ends_with_eos_from_renderer() {
        let mut h = Harness::new();
        let dec = h.register(1, "decoder");
        let ren = h.register(2, "renderer");

        let req = RouteRequest {
            dst: ren,
            count: 2,
            length: 128,
        };
        let body = h.buffer(&req.encode(), 64);
        h.send(Address::proxy(1), dec.with_port(8), Opcode::Route, Some(body), RouteRequest::SIZE);
        assert_eq!(h.take().pop().unwrap().ret, 0);

        let data = h.buffer(&[7; 300], 320);
        h.send(Address::proxy(1), dec, Opcode::EmptyThisBuffer, Some(data), 300);
        let replies = h.take();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].opcode, Opcode::FillThisBuffer);

        let eos = h.buffer(&[], 64);
        h.send(Address::proxy(1), dec, Opcode::EmptyThisBuffer, Some(eos), 0);
        let replies = h.take();
        assert!(replies.iter().any(|m| m.opcode == Opcode::FillThisBuffer && m.buffer == Some(eos)));
        let notice = replies.iter().find(|m| m.opcode == Opcode::OutputEos).unwrap();
        assert_eq!(notice.id.src, ren);
        assert_eq!(notice.id.dst, Address::proxy(2));
    }

    #[test]
    fn unroute_without_route_is_enoent() {
        let mut h = Harness::new();
        let dec = h.register(1, "decoder");
        let ren = h.register(2, "renderer");
        let body = h.buffer(&RouteRequest { dst: ren, count: 1, length: 64 }.encode(), 64);
        h.send(Address::proxy(1), dec.with_port(8), Opcode::Route, Some(body), RouteRequest::SIZE);
        assert_eq!(h.take().pop().unwrap().ret, 0);
        let dsp_free = h.shm.available(Heap::Dsp);

        h.send(Address::proxy(1), dec.with_port(8), Opcode::Unroute, None, 0);
        assert_eq!(h.take().pop().unwrap().ret, 0);
        assert!(h.shm.available(Heap::Dsp) > dsp_free);
        h.send(Address::proxy(1), dec.with_port(8), Opcode::Unroute, None, 0);
        assert_eq!(h.take().pop().unwrap().ret, -ENOENT);
    }

    #[test]
    fn params_round_trip_and_unknown_get_fails() {
        let mut h = Harness::new();
        let dec = h.register(1, "decoder");
        let set = h.buffer(&encode_params(&[Param::new(id::BITRATE, 128_000)]), 64);
        h.send(Address::proxy(1), dec, Opcode::SetParam, Some(set), 8);
        assert_eq!(h.take().pop().unwrap().ret, 0);

        let query = encode_params(&[Param::new(id::BITRATE, 0), Param::new(id::SAMPLE_RATE, 0)]);
        let get = h.buffer(&query, 64);
        h.send(Address::proxy(1), dec, Opcode::GetParam, Some(get), 16);
        assert_eq!(h.take().pop().unwrap().ret, 0);
        let mut back = [0u8; 16];
        h.shm.read(get, &mut back).unwrap();
        assert_eq!(
            decode_params(&back).unwrap(),
            vec![Param::new(id::BITRATE, 128_000), Param::new(id::SAMPLE_RATE, 48_000)]
        );

        let bad = h.buffer(&encode_params(&[Param::new(0x77, 0)]), 64);
        h.send(Address::proxy(1), dec, Opcode::GetParam, Some(bad), 8);
        assert_eq!(h.take().pop().unwrap().ret, -EINVAL);
    }

    #[test]
    fn unregister_returns_queued_host_buffers_first() {
        let mut h = Harness::new();
        let dec = h.register(1, "decoder");
        let out = h.buffer(&[], 64);
        h.send(Address::proxy(1), dec.with_port(8), Opcode::FillThisBuffer, Some(out), 64);
        h.send(Address::proxy(1), dec, Opcode::Unregister, None, 0);
        let replies = h.take();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].opcode, Opcode::EmptyThisBuffer);
        assert_eq!(replies[0].length, 0);
        assert_eq!(replies[1].opcode, Opcode::Unregister);
        // the client is gone
        h.send(Address::proxy(1), dec, Opcode::Pause, None, 0);
        assert_eq!(h.take().pop().unwrap().ret, -ENOENT);
    }

    #[test]
    fn pause_holds_data_until_release() {
        let mut h = Harness::new();
        let dec = h.register(1, "decoder");
        h.send(Address::proxy(1), dec, Opcode::Pause, None, 0);
        h.take();
        let out = h.buffer(&[], 64);
        let input = h.buffer(b"abc", 64);
        h.send(Address::proxy(1), dec.with_port(8), Opcode::FillThisBuffer, Some(out), 64);
        h.send(Address::proxy(1), dec, Opcode::EmptyThisBuffer, Some(input), 3);
        assert!(h.take().is_empty());
        h.send(Address::proxy(1), dec, Opcode::PauseRelease, None, 0);
        let ops: Vec<Opcode> = h.take().iter().map(|m| m.opcode).collect();
        assert!(ops.contains(&Opcode::PauseRelease));
        assert!(ops.contains(&Opcode::EmptyThisBuffer));
        assert!(ops.contains(&Opcode::FillThisBuffer));
    }

    #[test]
    fn shutdown_returns_every_slot() {
        let mut h = Harness::new();
        let dec = h.register(1, "decoder");
        let ren = h.register(2, "renderer");
        let body = h.buffer(&RouteRequest { dst: ren, count: 4, length: 64 }.encode(), 64);
        h.send(Address::proxy(1), dec.with_port(8), Opcode::Route, Some(body), RouteRequest::SIZE);
        h.core.shutdown();
        let (free, total) = pooled(&h.core.ctx.pool, |p| (p.available(), p.capacity()));
        assert_eq!(free, total);
    }
}
