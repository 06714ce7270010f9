//! Remote-processor style transport: a vring per direction plus a doorbell.
//!
//! Records are pushed into a lock-free [`Vring`] and the other side is
//! notified by ringing its doorbell. A full ring is reported as
//! `WouldBlock` to the host; the remote side backs off and retries.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::config::ProxyConfig;
use crate::constants::VRING_SLOTS;
use crate::error::{Error, Result};
use crate::message::{Message, WireMessage};
use crate::remote::{self, RemoteHandle};
use crate::shmem::{AddressMap, SharedMemory};

use super::vring::Vring;
use super::{RemoteLink, Transport};

/// Interrupt line into one side.
struct Doorbell {
    lock: Mutex<()>,
    cv: Condvar,
}

impl Doorbell {
    fn new() -> Self {
        Doorbell {
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    fn ring(&self) {
        let _g = self.lock.lock();
        self.cv.notify_all();
    }

    /// Sleep until `ready()` holds or `timeout` passes. Returns `ready()`.
    fn wait_until(&self, timeout: Duration, ready: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut g = self.lock.lock();
        while !ready() {
            if self.cv.wait_until(&mut g, deadline).timed_out() {
                return ready();
            }
        }
        true
    }
}

struct Channel {
    to_remote: Vring<VRING_SLOTS>,
    to_host: Vring<VRING_SLOTS>,
    remote_bell: Doorbell,
    host_bell: Doorbell,
    closed: AtomicBool,
}

pub struct RprocTransport {
    core_id: u32,
    shm: Arc<SharedMemory>,
    map: AddressMap,
    channel: Arc<Channel>,
    /// The vrings are single-producer/single-consumer on each end.
    tx_lock: Mutex<()>,
    rx_lock: Mutex<()>,
    remote: Mutex<Option<RemoteHandle>>,
}

impl RprocTransport {
    pub fn open(config: &ProxyConfig) -> Result<Self> {
        let shm = Arc::new(SharedMemory::new(config.shmem_size)?);
        let channel = Arc::new(Channel {
            to_remote: Vring::new(),
            to_host: Vring::new(),
            remote_bell: Doorbell::new(),
            host_bell: Doorbell::new(),
            closed: AtomicBool::new(false),
        });
        let link = RprocLink {
            channel: channel.clone(),
        };
        let remote = remote::spawn(config, Box::new(link), shm.clone())?;
        let ready = super::await_ready(&remote, config);

        let transport = RprocTransport {
            core_id: config.core_id,
            map: shm.host_map(),
            shm,
            channel,
            tx_lock: Mutex::new(()),
            rx_lock: Mutex::new(()),
            remote: Mutex::new(Some(remote)),
        };
        if let Err(e) = ready {
            let _ = transport.close();
            return Err(e);
        }
        Ok(transport)
    }

    fn check_open(&self) -> Result<()> {
        if self.channel.closed.load(Ordering::Acquire) {
            Err(Error::InvalidState("transport closed"))
        } else {
            Ok(())
        }
    }
}

impl Transport for RprocTransport {
    fn core_id(&self) -> u32 {
        self.core_id
    }

    fn shared_memory(&self) -> &Arc<SharedMemory> {
        &self.shm
    }

    fn send(&self, msg: &Message) -> Result<()> {
        self.check_open()?;
        let record = WireMessage::encode(msg, &self.map)?;
        {
            let _tx = self.tx_lock.lock();
            if self.channel.to_remote.push(record).is_err() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "vring full").into());
            }
        }
        self.channel.remote_bell.ring();
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> Result<()> {
        self.check_open()?;
        let ch = &self.channel;
        let pending = ch.host_bell.wait_until(timeout, || {
            !ch.to_host.is_empty() || ch.closed.load(Ordering::Acquire)
        });
        if !ch.to_host.is_empty() {
            Ok(())
        } else if pending {
            Err(Error::InvalidState("transport closed"))
        } else {
            Err(Error::Timeout)
        }
    }

    fn recv(&self) -> Result<Option<Message>> {
        self.check_open()?;
        let record = {
            let _rx = self.rx_lock.lock();
            self.channel.to_host.pop()
        };
        match record {
            Some(record) => record.decode(&self.map).map(Some),
            None => Ok(None),
        }
    }

    fn close(&self) -> Result<()> {
        if self.channel.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.channel.remote_bell.ring();
        self.channel.host_bell.ring();
        if let Some(remote) = self.remote.lock().take() {
            remote.join();
        }
        log::debug!("rproc transport to core {} closed", self.core_id);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.channel.closed.load(Ordering::Acquire)
    }
}

impl Drop for RprocTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct RprocLink {
    channel: Arc<Channel>,
}

/// Remote-side backoff while the host ring is full.
const FULL_RING_BACKOFF: Duration = Duration::from_micros(200);

impl RemoteLink for RprocLink {
    fn send(&self, record: WireMessage) -> Result<()> {
        let ch = &self.channel;
        while ch.to_host.push(record).is_err() {
            if ch.closed.load(Ordering::Acquire) {
                return Err(Error::DeviceUnavailable);
            }
            std::thread::sleep(FULL_RING_BACKOFF);
        }
        ch.host_bell.ring();
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> Result<bool> {
        let ch = &self.channel;
        ch.remote_bell.wait_until(timeout, || {
            !ch.to_remote.is_empty() || ch.closed.load(Ordering::Acquire)
        });
        if ch.closed.load(Ordering::Acquire) {
            Err(Error::DeviceUnavailable)
        } else {
            Ok(!ch.to_remote.is_empty())
        }
    }

    fn recv(&self) -> Result<Option<WireMessage>> {
        Ok(self.channel.to_remote.pop())
    }
}
