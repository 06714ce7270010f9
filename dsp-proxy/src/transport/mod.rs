//! Message transports between the proxy and a remote core.
//!
//! A transport moves 16-byte [`WireMessage`] records in both directions and
//! translates buffer addresses on the way through. The host end implements
//! [`Transport`]; the remote end handed to the emulated core implements
//! [`RemoteLink`].
//!
//! | Kind | Feature | Carrier | Notification |
//! |------|---------|---------|--------------|
//! | [`TransportKind::Pipe`] | `pipe` | two OS pipes | `poll(2)` |
//! | [`TransportKind::RemoteProc`] | `rproc` | two [`vring::Vring`]s | doorbell condvar |

use core::time::Duration;
use std::sync::Arc;

use crate::config::{ProxyConfig, TransportKind};
use crate::error::{Error, Result};
use crate::message::{Message, WireMessage};
use crate::remote::RemoteHandle;
use crate::shmem::SharedMemory;

#[cfg(feature = "pipe")]
pub mod pipe;
#[cfg(feature = "rproc")]
pub mod rproc;
pub mod vring;

/// Host end of a transport.
///
/// All methods take `&self`; implementations are shared by every thread
/// that talks to the core.
pub trait Transport: Send + Sync {
    fn core_id(&self) -> u32;

    fn shared_memory(&self) -> &Arc<SharedMemory>;

    /// Encode and send one message. Its buffer must lie in shared memory.
    fn send(&self, msg: &Message) -> Result<()>;

    /// Block until a record can be received.
    ///
    /// `Timeout` when nothing arrived in time, `Interrupted` if a signal cut
    /// the wait short.
    fn wait(&self, timeout: Duration) -> Result<()>;

    /// Receive one message without blocking.
    fn recv(&self) -> Result<Option<Message>>;

    /// Stop the remote core and release the carrier. Idempotent.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Remote end of a transport, driven by the core's dispatch loop.
pub(crate) trait RemoteLink: Send {
    fn send(&self, record: WireMessage) -> Result<()>;

    /// `Ok(true)` when a record is pending, `Ok(false)` on timeout and
    /// `DeviceUnavailable` once the host end has gone away.
    fn wait(&self, timeout: Duration) -> Result<bool>;

    fn recv(&self) -> Result<Option<WireMessage>>;
}

/// Open the transport selected by `config` and start its remote core.
pub fn open(config: &ProxyConfig) -> Result<Box<dyn Transport>> {
    config.validate()?;
    if !config.core_in_range() {
        log::warn!("no remote core {}", config.core_id);
        return Err(Error::NotFound);
    }
    let transport: Box<dyn Transport> = match config.transport {
        #[cfg(feature = "pipe")]
        TransportKind::Pipe => Box::new(pipe::PipeTransport::open(config)?),
        #[cfg(feature = "rproc")]
        TransportKind::RemoteProc => Box::new(rproc::RprocTransport::open(config)?),
    };
    log::info!(
        "core {} up over {:?} ({} bytes shared)",
        config.core_id,
        config.transport,
        transport.shared_memory().size()
    );
    Ok(transport)
}

/// Poll the freshly started core until it reports ready.
pub(crate) fn await_ready(remote: &RemoteHandle, config: &ProxyConfig) -> Result<()> {
    for attempt in 0..=config.open_retries {
        if remote.is_ready() {
            log::debug!("core {} ready after {attempt} polls", config.core_id);
            return Ok(());
        }
        if remote.has_exited() {
            break;
        }
        std::thread::sleep(config.open_retry_interval);
    }
    log::warn!("core {} did not come up", config.core_id);
    Err(Error::DeviceUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_CORES;
    use crate::message::{Address, MsgId};
    use crate::opcode::Opcode;

    fn kinds() -> Vec<TransportKind> {
        vec![
            #[cfg(feature = "pipe")]
            TransportKind::Pipe,
            #[cfg(feature = "rproc")]
            TransportKind::RemoteProc,
        ]
    }

    #[test]
    fn unknown_core_is_not_found() {
        for kind in kinds() {
            let cfg = ProxyConfig::default().with_transport(kind).with_core(MAX_CORES);
            assert!(matches!(open(&cfg), Err(Error::NotFound)));
        }
    }

    #[test]
    fn core_that_cannot_start_is_unavailable() {
        for kind in kinds() {
            // message pool does not fit the core's scratch memory
            let mut cfg = ProxyConfig::default().with_transport(kind);
            cfg.dsp_local_memory = 16;
            cfg.open_retries = 3;
            assert!(matches!(open(&cfg), Err(Error::DeviceUnavailable)));
        }
    }

    #[test]
    fn wait_times_out_when_idle() {
        for kind in kinds() {
            let t = open(&ProxyConfig::default().with_transport(kind)).unwrap();
            assert!(matches!(t.wait(Duration::from_millis(10)), Err(Error::Timeout)));
            assert!(t.recv().unwrap().is_none());
            t.close().unwrap();
        }
    }

    #[test]
    fn unknown_component_register_is_answered() {
        for kind in kinds() {
            let t = open(&ProxyConfig::default().with_transport(kind)).unwrap();
            let id = MsgId::new(Address::proxy(1), Address::new(0, 0, 0));
            t.send(&Message::new(id, Opcode::Register, None, 0)).unwrap();
            t.wait(Duration::from_secs(1)).unwrap();
            let reply = t.recv().unwrap().unwrap();
            assert_eq!(reply.opcode, Opcode::Register);
            assert_eq!(reply.id.dst, Address::proxy(1));
            assert!(reply.ret < 0);
            t.close().unwrap();
        }
    }

    #[test]
    fn close_is_idempotent_and_blocks_send() {
        for kind in kinds() {
            let t = open(&ProxyConfig::default().with_transport(kind)).unwrap();
            t.close().unwrap();
            assert!(t.is_closed());
            t.close().unwrap();
            let msg = Message::new(MsgId::unpack(0), Opcode::Flush, None, 0);
            assert!(matches!(t.send(&msg), Err(Error::InvalidState(_))));
        }
    }
}
