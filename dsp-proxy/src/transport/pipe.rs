//! Transport over a pair of OS pipes.
//!
//! One pipe per direction. Every record is a single 16-byte `write(2)`,
//! below `PIPE_BUF`, so concurrent writers never interleave and the host
//! side needs no send lock. Read ends are non-blocking; readiness comes
//! from `poll(2)`.

use core::time::Duration;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::ProxyConfig;
use crate::constants::WIRE_MESSAGE_SIZE;
use crate::error::{Error, Result};
use crate::message::{Message, WireMessage};
use crate::remote::{self, RemoteHandle};
use crate::shmem::{AddressMap, SharedMemory};

use super::{RemoteLink, Transport};

/// Host end: writes to the core, reads from it.
struct HostFds {
    to_remote: OwnedFd,
    from_remote: OwnedFd,
}

pub struct PipeTransport {
    core_id: u32,
    shm: Arc<SharedMemory>,
    map: AddressMap,
    /// `None` once closed. Readers hold the lock across a syscall so the
    /// descriptors cannot be closed and reused underneath them.
    fds: RwLock<Option<HostFds>>,
    remote: Mutex<Option<RemoteHandle>>,
}

impl PipeTransport {
    pub fn open(config: &ProxyConfig) -> Result<Self> {
        let shm = Arc::new(SharedMemory::new(config.shmem_size)?);
        let (remote_rx, host_tx) = pipe()?;
        let (host_rx, remote_tx) = pipe()?;
        set_nonblocking(&remote_rx)?;
        set_nonblocking(&host_rx)?;

        let link = PipeLink {
            from_host: remote_rx,
            to_host: remote_tx,
        };
        let remote = remote::spawn(config, Box::new(link), shm.clone())?;
        let transport = PipeTransport {
            core_id: config.core_id,
            map: shm.host_map(),
            shm,
            fds: RwLock::new(Some(HostFds {
                to_remote: host_tx,
                from_remote: host_rx,
            })),
            remote: Mutex::new(Some(remote)),
        };

        let ready = {
            let remote = transport.remote.lock();
            match remote.as_ref() {
                Some(r) => super::await_ready(r, config),
                None => Err(Error::DeviceUnavailable),
            }
        };
        if let Err(e) = ready {
            let _ = transport.close();
            return Err(e);
        }
        Ok(transport)
    }
}

impl Transport for PipeTransport {
    fn core_id(&self) -> u32 {
        self.core_id
    }

    fn shared_memory(&self) -> &Arc<SharedMemory> {
        &self.shm
    }

    fn send(&self, msg: &Message) -> Result<()> {
        let record = WireMessage::encode(msg, &self.map)?;
        let fds = self.fds.read();
        let fds = fds.as_ref().ok_or(Error::InvalidState("transport closed"))?;
        write_record(fds.to_remote.as_fd(), &record)
    }

    fn wait(&self, timeout: Duration) -> Result<()> {
        let fds = self.fds.read();
        let fds = fds.as_ref().ok_or(Error::InvalidState("transport closed"))?;
        if poll_readable(fds.from_remote.as_fd(), timeout)? {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }

    fn recv(&self) -> Result<Option<Message>> {
        let fds = self.fds.read();
        let fds = fds.as_ref().ok_or(Error::InvalidState("transport closed"))?;
        match read_record(fds.from_remote.as_fd())? {
            Some(record) => record.decode(&self.map).map(Some),
            None => Ok(None),
        }
    }

    fn close(&self) -> Result<()> {
        // Dropping both host descriptors makes the core's next poll see a
        // hangup and its next write fail, so the join below terminates.
        let Some(fds) = self.fds.write().take() else {
            return Ok(());
        };
        drop(fds);
        if let Some(remote) = self.remote.lock().take() {
            remote.join();
        }
        log::debug!("pipe transport to core {} closed", self.core_id);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.fds.read().is_none()
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Remote end: reads from the host, writes to it.
struct PipeLink {
    from_host: OwnedFd,
    to_host: OwnedFd,
}

impl RemoteLink for PipeLink {
    fn send(&self, record: WireMessage) -> Result<()> {
        write_record(self.to_host.as_fd(), &record)
    }

    fn wait(&self, timeout: Duration) -> Result<bool> {
        poll_readable(self.from_host.as_fd(), timeout)
    }

    fn recv(&self) -> Result<Option<WireMessage>> {
        read_record(self.from_host.as_fd())
    }
}

/// `(read end, write end)`
fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe(2) succeeded, so both descriptors are open and owned by us.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` is an open descriptor for the duration of both calls.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn write_record(fd: BorrowedFd<'_>, record: &WireMessage) -> Result<()> {
    let bytes = record.to_bytes();
    loop {
        // SAFETY: `bytes` is valid for reads of its full length.
        let n = unsafe { libc::write(fd.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        if n as usize != WIRE_MESSAGE_SIZE {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short record write").into());
        }
        return Ok(());
    }
}

/// Read one record from a non-blocking descriptor. `None` if nothing is queued.
fn read_record(fd: BorrowedFd<'_>) -> Result<Option<WireMessage>> {
    let mut bytes = [0u8; WIRE_MESSAGE_SIZE];
    loop {
        // SAFETY: `bytes` is valid for writes of its full length.
        let n = unsafe { libc::read(fd.as_raw_fd(), bytes.as_mut_ptr().cast(), bytes.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(err.into()),
            }
        }
        return match n as usize {
            0 => Err(Error::DeviceUnavailable),
            WIRE_MESSAGE_SIZE => Ok(Some(WireMessage::from_bytes(&bytes))),
            _ => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short record read").into()),
        };
    }
}

/// `Ok(true)` if readable, `Ok(false)` on timeout.
fn poll_readable(fd: BorrowedFd<'_>, timeout: Duration) -> Result<bool> {
    let mut pollfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_micros().div_ceil(1000).min(libc::c_int::MAX as u128) as libc::c_int;

    // SAFETY: one valid pollfd.
    let result = unsafe { libc::poll(&mut pollfd, 1, millis) };

    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Err(Error::Interrupted);
        }
        return Err(err.into());
    }
    if result == 0 {
        return Ok(false);
    }
    // Data may still be queued behind a hangup.
    if pollfd.revents & libc::POLLIN != 0 {
        Ok(true)
    } else if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        Err(Error::DeviceUnavailable)
    } else {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    fn record(id: u32) -> WireMessage {
        WireMessage {
            id,
            opcode: Opcode::Flush.raw(),
            length: 0,
            address: u32::MAX,
        }
    }

    #[test]
    fn records_cross_a_pipe() {
        let (rx, tx) = pipe().unwrap();
        set_nonblocking(&rx).unwrap();
        assert!(read_record(rx.as_fd()).unwrap().is_none());
        write_record(tx.as_fd(), &record(7)).unwrap();
        write_record(tx.as_fd(), &record(8)).unwrap();
        assert!(poll_readable(rx.as_fd(), Duration::from_millis(100)).unwrap());
        assert_eq!(read_record(rx.as_fd()).unwrap(), Some(record(7)));
        assert_eq!(read_record(rx.as_fd()).unwrap(), Some(record(8)));
    }

    #[test]
    fn poll_times_out_on_idle_pipe() {
        let (rx, _tx) = pipe().unwrap();
        assert!(!poll_readable(rx.as_fd(), Duration::from_millis(5)).unwrap());
    }

    #[test]
    fn closed_writer_is_reported() {
        let (rx, tx) = pipe().unwrap();
        set_nonblocking(&rx).unwrap();
        write_record(tx.as_fd(), &record(1)).unwrap();
        drop(tx);
        // queued record is still delivered before the hangup
        assert!(poll_readable(rx.as_fd(), Duration::from_millis(100)).unwrap());
        assert_eq!(read_record(rx.as_fd()).unwrap(), Some(record(1)));
        assert!(matches!(
            poll_readable(rx.as_fd(), Duration::from_millis(100)),
            Err(Error::DeviceUnavailable)
        ));
        assert!(matches!(read_record(rx.as_fd()), Err(Error::DeviceUnavailable)));
    }
}
