//! In-process emulation of a remote DSP core.
//!
//! Each opened transport starts one core on its own thread. The core owns a
//! message pool carved from local scratch memory, a local dispatch queue
//! shared with its transport interrupt path, and the components the host
//! has registered. Buffers live in shared memory; the core addresses them
//! by offset.
//!
//! Failures on the core are reported to the host as negative result codes
//! in the response's `ret` field, using errno values.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::shmem::SharedMemory;
use crate::transport::RemoteLink;

mod dispatch;
mod node;

pub(crate) const ENOENT: i32 = 2;
pub(crate) const ENOMEM: i32 = 12;
pub(crate) const EBUSY: i32 = 16;
pub(crate) const EINVAL: i32 = 22;

/// Host-side handle on a running core thread.
pub(crate) struct RemoteHandle {
    ready: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl RemoteHandle {
    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the core to stop. The caller must have closed the link first.
    pub(crate) fn join(self) {
        if self.thread.join().is_err() {
            log::error!("remote core thread panicked");
        }
    }
}

/// Start a core serving `link`.
pub(crate) fn spawn(
    config: &ProxyConfig,
    link: Box<dyn RemoteLink>,
    shm: Arc<SharedMemory>,
) -> Result<RemoteHandle> {
    let core_id = config.core_id as u8;
    let ready = Arc::new(AtomicBool::new(false));
    let settings = dispatch::CoreSettings {
        core_id,
        msg_pool_size: config.msg_pool_size,
        local_memory: config.dsp_local_memory,
    };
    let thread = std::thread::Builder::new()
        .name(format!("dsp-core{core_id}"))
        .spawn({
            let ready = ready.clone();
            move || dispatch::run(settings, link, shm, ready)
        })?;
    Ok(RemoteHandle { ready, thread })
}
