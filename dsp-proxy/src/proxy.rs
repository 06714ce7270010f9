//! Host-side proxy for one remote core.
//!
//! A [`Proxy`] owns the transport to its core and the AUX pool that carries
//! control payloads. Its state machine is `Closed → Open → Closed`: a proxy
//! that fails to open leaves nothing behind, and a closed proxy stays
//! closed.
//!
//! Every component opened through the proxy registers an endpoint in the
//! proxy's client table. Any thread waiting for a response drains the
//! transport on behalf of all endpoints and routes each message to its
//! endpoint's sink, so components sharing a proxy never block each other
//! for longer than one poll slice.
//!
//! A client number whose teardown the core has not confirmed yet (a
//! `REGISTER` or `UNREGISTER` that timed out) is retired, not freed. It is
//! handed out again only once the core's late answer has arrived, so that
//! answer can never reach a newer component.

use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::buffer::{Buffer, BufferPool, PoolRole};
use crate::config::ProxyConfig;
use crate::constants::MAX_CLIENTS;
use crate::error::{first_error, Error, Result};
use crate::lane::Endpoint;
use crate::message::{Address, Message, MsgId};
use crate::opcode::{Lane, Opcode};
use crate::shmem::SharedMemory;
use crate::transport::{self, Transport};

/// Cloneable handle on an opened remote core.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    config: ProxyConfig,
    state: Mutex<ProxyState>,
    clients: Mutex<BTreeMap<u8, Slot>>,
}

enum Slot {
    Live(Weak<Endpoint>),
    /// The component is gone but the core still owes an answer to
    /// `awaiting`. Keeps the request buffer until that answer arrives.
    Retired {
        awaiting: Opcode,
        buffer: Option<Buffer>,
    },
}

impl Slot {
    fn in_use(&self) -> bool {
        match self {
            Slot::Live(ep) => ep.strong_count() > 0,
            Slot::Retired { .. } => true,
        }
    }
}

enum ProxyState {
    Open(Arc<ProxyLink>),
    Closed,
}

/// Resources that only exist while the proxy is open.
pub(crate) struct ProxyLink {
    transport: Box<dyn Transport>,
    aux: BufferPool,
    /// Held by the one thread currently draining the transport.
    rx_lock: Mutex<()>,
}

impl Proxy {
    /// Open the transport to `config.core_id` and allocate the AUX pool.
    pub fn open(config: ProxyConfig) -> Result<Self> {
        let transport = transport::open(&config)?;
        let aux = match BufferPool::alloc(
            transport.shared_memory(),
            config.aux_buffers,
            config.aux_buffer_size,
            PoolRole::Aux,
        ) {
            Ok(pool) => pool,
            Err(e) => {
                if let Err(close) = transport.close() {
                    log::warn!("core {}: closing transport after failed open: {close}", config.core_id);
                }
                return Err(e);
            }
        };
        log::debug!(
            "proxy for core {} open, {} aux buffers of {} bytes",
            config.core_id,
            config.aux_buffers,
            config.aux_buffer_size
        );
        let link = ProxyLink {
            transport,
            aux,
            rx_lock: Mutex::new(()),
        };
        Ok(Proxy {
            inner: Arc::new(ProxyInner {
                config,
                state: Mutex::new(ProxyState::Open(Arc::new(link))),
                clients: Mutex::new(BTreeMap::new()),
            }),
        })
    }

    /// Free the AUX pool, then close the transport.
    ///
    /// Both steps always run; the first failure is returned. Closing a
    /// closed proxy fails with `InvalidState` and touches nothing.
    pub fn close(&self) -> Result<()> {
        let previous = core::mem::replace(&mut *self.inner.state.lock(), ProxyState::Closed);
        let ProxyState::Open(link) = previous else {
            return Err(Error::InvalidState("proxy already closed"));
        };
        let attached = self.attached();
        // retired slots may still hold AUX buffers
        self.inner
            .clients
            .lock()
            .retain(|_, slot| matches!(slot, Slot::Live(_)));
        if attached > 0 {
            log::warn!(
                "closing proxy for core {} with {attached} components still open",
                self.core_id()
            );
        }
        let result = first_error(link.aux.free(), link.transport.close());
        log::debug!("proxy for core {} closed", self.core_id());
        result
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.inner.state.lock(), ProxyState::Open(_))
    }

    pub fn core_id(&self) -> u32 {
        self.inner.config.core_id
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    pub fn shared_memory(&self) -> Result<Arc<SharedMemory>> {
        Ok(self.link()?.transport.shared_memory().clone())
    }

    /// Allocate a buffer pool in the host heap of this proxy's shared memory.
    pub fn pool_alloc(&self, count: usize, item_size: usize, role: PoolRole) -> Result<BufferPool> {
        BufferPool::alloc(self.link()?.transport.shared_memory(), count, item_size, role)
    }

    /// Check out one control-payload buffer.
    pub fn aux_buffer(&self) -> Result<Buffer> {
        self.link()?.aux.get()
    }

    /// Number of components currently registered.
    pub fn attached(&self) -> usize {
        self.inner
            .clients
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Live(ep) if ep.strong_count() > 0))
            .count()
    }

    /// Client numbers waiting for a late answer from the core.
    pub fn retired(&self) -> usize {
        self.inner
            .clients
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Retired { .. }))
            .count()
    }

    pub(crate) fn link(&self) -> Result<Arc<ProxyLink>> {
        match &*self.inner.state.lock() {
            ProxyState::Open(link) => Ok(link.clone()),
            ProxyState::Closed => Err(Error::InvalidState("proxy is closed")),
        }
    }

    /// Register `endpoint` and return its client number.
    pub(crate) fn attach(&self, endpoint: &Arc<Endpoint>) -> Result<u8> {
        let mut clients = self.inner.clients.lock();
        clients.retain(|_, slot| slot.in_use());
        let slot = (1..=MAX_CLIENTS as u8)
            .find(|c| !clients.contains_key(c))
            .ok_or(Error::ExhaustedPool)?;
        clients.insert(slot, Slot::Live(Arc::downgrade(endpoint)));
        Ok(slot)
    }

    /// Release a live client number. A retired one stays taken.
    pub(crate) fn detach(&self, client: u8) {
        let mut clients = self.inner.clients.lock();
        if matches!(clients.get(&client), Some(Slot::Live(_))) {
            clients.remove(&client);
        }
    }

    /// Stop routing to `endpoint` and hold `client` until the core answers
    /// `awaiting`. An answer that already reached the endpoint's lanes is
    /// settled right away.
    pub(crate) fn retire(&self, client: u8, endpoint: &Endpoint, awaiting: Opcode, buffer: Option<Buffer>) {
        self.inner
            .clients
            .lock()
            .insert(client, Slot::Retired { awaiting, buffer });
        log::debug!("client {client} retired until the core answers {awaiting:?}");
        let lane = Lane::classify(awaiting);
        for msg in endpoint.lanes.take_where(lane, |m| m.opcode == awaiting) {
            self.settle(client, msg);
        }
    }

    pub(crate) fn send(&self, msg: &Message) -> Result<()> {
        log::trace!(
            "-> {:?} {:?} len {} to {:#06x}",
            msg.opcode,
            msg.buffer,
            msg.length,
            msg.id.dst.raw()
        );
        self.link()?.transport.send(msg)
    }

    /// Block until `endpoint` has a message on `lane`.
    pub(crate) fn receive(&self, endpoint: &Endpoint, lane: Lane, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now().checked_add(timeout);
        let slice = self.inner.config.poll_slice;
        loop {
            if let Some(msg) = endpoint.lanes.pop(lane) {
                return Ok(msg);
            }
            let wait = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(Error::Timeout);
                    }
                    left.min(slice)
                }
                None => slice,
            };
            let link = self.link()?;
            self.pump(&link, wait, || !endpoint.lanes.is_empty(lane))?;
        }
    }

    /// Drain whatever the transport has, waiting at most `slice` for the
    /// first record. Returns quietly if another thread is draining, or if
    /// that thread already delivered what the caller is after.
    fn pump(&self, link: &ProxyLink, slice: Duration, satisfied: impl Fn() -> bool) -> Result<()> {
        let Some(_rx) = link.rx_lock.try_lock_for(slice) else {
            return Ok(());
        };
        if satisfied() {
            return Ok(());
        }
        match link.transport.wait(slice) {
            Ok(()) => {}
            Err(Error::Timeout) => return Ok(()),
            Err(e) => return Err(e),
        }
        loop {
            match link.transport.recv() {
                Ok(Some(msg)) => self.dispatch(msg),
                Ok(None) => return Ok(()),
                Err(e @ (Error::BadAddress(_) | Error::UnexpectedResponse { .. })) => {
                    log::warn!("core {}: dropping undecodable record: {e}", self.core_id());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn dispatch(&self, msg: Message) {
        log::trace!(
            "<- {:?} {:?} len {} ret {} from {:#06x}",
            msg.opcode,
            msg.buffer,
            msg.length,
            msg.ret,
            msg.id.src.raw()
        );
        if !msg.id.dst.is_proxy() {
            log::warn!("dropping {:?} addressed to {:#06x}", msg.opcode, msg.id.dst.raw());
            return;
        }
        let client = msg.id.dst.client();
        let (retired, endpoint) = match self.inner.clients.lock().get(&client) {
            Some(Slot::Live(ep)) => (false, ep.upgrade()),
            Some(Slot::Retired { .. }) => (true, None),
            None => (false, None),
        };
        if retired {
            return self.settle(client, msg);
        }
        let Some(endpoint) = endpoint else {
            log::warn!("dropping {:?} for detached client {client}", msg.opcode);
            return;
        };
        if msg.opcode == Opcode::Unregister && !endpoint.is_closing() {
            fatal_remote_termination(client, &endpoint.name);
        }
        endpoint.deliver(msg);
    }

    /// Handle a message for a retired client. Anything but the awaited
    /// answer is dropped; the answer frees the slot. A registration the
    /// core completed after its requester gave up is undone.
    fn settle(&self, client: u8, msg: Message) {
        let mut clients = self.inner.clients.lock();
        let Some(Slot::Retired { awaiting, .. }) = clients.get(&client) else {
            return;
        };
        if msg.opcode != *awaiting {
            log::debug!("dropping {:?} for retired client {client}", msg.opcode);
            return;
        }
        if msg.opcode == Opcode::Register && msg.ret == 0 {
            log::warn!(
                "core {}: late registration of client {client} as {:#06x}, unregistering",
                self.core_id(),
                msg.id.src.raw()
            );
            clients.insert(
                client,
                Slot::Retired {
                    awaiting: Opcode::Unregister,
                    buffer: None,
                },
            );
            drop(clients);
            let undo = Message::new(
                MsgId::new(Address::proxy(client), msg.id.src),
                Opcode::Unregister,
                None,
                0,
            );
            if let Err(e) = self.send(&undo) {
                log::warn!("client {client}: undoing late registration: {e}");
                self.inner.clients.lock().remove(&client);
            }
            return;
        }
        clients.remove(&client);
        log::debug!("client {client} released after late {:?}", msg.opcode);
    }
}

impl core::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Proxy")
            .field("core_id", &self.core_id())
            .field("transport", &self.inner.config.transport)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        self.clients.get_mut().clear();
        if let ProxyState::Open(link) = core::mem::replace(self.state.get_mut(), ProxyState::Closed) {
            if let Err(e) = first_error(link.aux.free(), link.transport.close()) {
                log::warn!("core {}: closing dropped proxy: {e}", self.config.core_id);
            }
        }
    }
}

/// A remote component went away on its own. Its core's state can no longer
/// be trusted, so the process stops here.
fn fatal_remote_termination(client: u8, name: &str) -> ! {
    log::error!("remote {name} (client {client}) terminated abnormally, aborting");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;

    fn kinds() -> Vec<TransportKind> {
        vec![
            #[cfg(feature = "pipe")]
            TransportKind::Pipe,
            #[cfg(feature = "rproc")]
            TransportKind::RemoteProc,
        ]
    }

    #[test]
    fn open_then_close() {
        for kind in kinds() {
            let proxy = Proxy::open(ProxyConfig::default().with_transport(kind)).unwrap();
            assert!(proxy.is_open());
            let buf = proxy.aux_buffer().unwrap();
            assert_eq!(buf.length(), proxy.config().aux_buffer_size);
            drop(buf);
            proxy.close().unwrap();
            assert!(!proxy.is_open());
        }
    }

    #[test]
    fn second_close_is_invalid_state() {
        for kind in kinds() {
            let proxy = Proxy::open(ProxyConfig::default().with_transport(kind)).unwrap();
            proxy.close().unwrap();
            assert!(matches!(proxy.close(), Err(Error::InvalidState(_))));
            assert!(matches!(proxy.aux_buffer(), Err(Error::InvalidState(_))));
            assert!(matches!(
                proxy.pool_alloc(1, 64, PoolRole::Input),
                Err(Error::InvalidState(_))
            ));
        }
    }

    #[test]
    fn aux_pool_that_does_not_fit_fails_open() {
        let mut cfg = ProxyConfig::default().with_shmem_size(64 * 1024);
        cfg.aux_buffers = 1024;
        assert!(matches!(Proxy::open(cfg), Err(Error::OutOfMemory)));
    }

    #[test]
    fn close_reports_outstanding_aux_buffer() {
        let proxy = Proxy::open(ProxyConfig::default()).unwrap();
        let held = proxy.aux_buffer().unwrap();
        assert!(matches!(proxy.close(), Err(Error::InvalidState(_))));
        // the transport went down regardless
        assert!(!proxy.is_open());
        drop(held);
    }

    #[test]
    fn pool_alloc_single_item_exhausts() {
        let proxy = Proxy::open(ProxyConfig::default()).unwrap();
        let pool = proxy.pool_alloc(1, 128, PoolRole::Input).unwrap();
        let first = pool.get().unwrap();
        assert!(matches!(pool.get(), Err(Error::ExhaustedPool)));
        drop(first);
        pool.free().unwrap();
        proxy.close().unwrap();
    }

    #[test]
    fn client_slots_are_recycled() {
        let proxy = Proxy::open(ProxyConfig::default()).unwrap();
        let a = Arc::new(Endpoint::new("a", None));
        let b = Arc::new(Endpoint::new("b", None));
        assert_eq!(proxy.attach(&a).unwrap(), 1);
        assert_eq!(proxy.attach(&b).unwrap(), 2);
        drop(a);
        let c = Arc::new(Endpoint::new("c", None));
        assert_eq!(proxy.attach(&c).unwrap(), 1);
        proxy.detach(2);
        assert_eq!(proxy.attached(), 1);
        proxy.close().unwrap();
    }

    fn from_core(client: u8, opcode: Opcode) -> Message {
        Message::new(MsgId::new(Address::new(0, 1, 0), Address::proxy(client)), opcode, None, 0)
    }

    #[test]
    fn retired_slot_waits_for_the_late_answer() {
        let proxy = Proxy::open(ProxyConfig::default()).unwrap();
        let old = Arc::new(Endpoint::new("old", None));
        let client = proxy.attach(&old).unwrap();
        old.set_closing();
        proxy.retire(client, &old, Opcode::Unregister, None);
        proxy.detach(client);
        drop(old);
        assert_eq!(proxy.retired(), 1);

        let new = Arc::new(Endpoint::new("new", None));
        let other = proxy.attach(&new).unwrap();
        assert_ne!(other, client);

        // stray traffic for the retired client goes nowhere
        proxy.dispatch(from_core(client, Opcode::FillThisBuffer));
        assert_eq!(proxy.retired(), 1);
        proxy.dispatch(from_core(client, Opcode::Unregister));
        assert_eq!(proxy.retired(), 0);
        assert!(new.lanes.is_empty(Lane::Ack));

        let again = Arc::new(Endpoint::new("again", None));
        assert_eq!(proxy.attach(&again).unwrap(), client);
        proxy.close().unwrap();
    }

    #[test]
    fn answer_already_queued_settles_on_retire() {
        let proxy = Proxy::open(ProxyConfig::default()).unwrap();
        let ep = Arc::new(Endpoint::new("decoder", None));
        let client = proxy.attach(&ep).unwrap();
        ep.set_closing();
        proxy.dispatch(from_core(client, Opcode::Unregister));
        proxy.retire(client, &ep, Opcode::Unregister, None);
        assert_eq!(proxy.retired(), 0);
        assert!(ep.lanes.is_empty(Lane::Ack));
        proxy.close().unwrap();
    }

    #[test]
    fn close_releases_buffers_held_by_retired_slots() {
        let proxy = Proxy::open(ProxyConfig::default()).unwrap();
        let ep = Arc::new(Endpoint::new("decoder", None));
        let client = proxy.attach(&ep).unwrap();
        let held = proxy.aux_buffer().unwrap();
        proxy.retire(client, &ep, Opcode::Register, Some(held));
        proxy.close().unwrap();
    }

    const ABORT_CHILD: &str = "DSP_PROXY_ABORT_CHILD";

    #[test]
    fn unsolicited_unregister_aborts_the_process() {
        if std::env::var_os(ABORT_CHILD).is_some() {
            let proxy = Proxy::open(ProxyConfig::default()).unwrap();
            let ep = Arc::new(Endpoint::new("decoder", None));
            let client = proxy.attach(&ep).unwrap();
            proxy.dispatch(from_core(client, Opcode::Unregister));
            // only reached if the abort did not happen
            return;
        }
        let status = std::process::Command::new(std::env::current_exe().unwrap())
            .args([
                "--exact",
                "proxy::tests::unsolicited_unregister_aborts_the_process",
                "--test-threads=1",
            ])
            .env(ABORT_CHILD, "1")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap();
        assert!(!status.success());
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(status.signal(), Some(6), "expected SIGABRT, got {status:?}");
        }
    }

    #[test]
    fn idle_receive_times_out() {
        for kind in kinds() {
            let proxy = Proxy::open(ProxyConfig::default().with_transport(kind)).unwrap();
            let ep = Arc::new(Endpoint::new("idle", None));
            proxy.attach(&ep).unwrap();
            let start = Instant::now();
            let r = proxy.receive(&ep, Lane::Ack, Duration::from_millis(10));
            assert!(matches!(r, Err(Error::Timeout)));
            assert!(start.elapsed() < Duration::from_millis(500));
            proxy.close().unwrap();
        }
    }
}
