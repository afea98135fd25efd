//! An in-memory duplex-pipe medium: the default test harness.
//!
//! `pair()` returns two [`MemorySocket`]s, each the mirror image of the
//! other, connected by bounded byte-chunk channels. No real sockets or
//! threads outside the caller's own are involved, which makes this the
//! natural backbone for the integration tests in `tests/`.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{Error, ErrorKind, ResultWrappedExt, Result};
use crate::medium::{FoundEndpoint, Medium, MediumTag, Socket};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "memory socket closed")
}

/// One end of an in-memory duplex pipe.
#[derive(Clone)]
pub struct MemorySocket {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    leftover: Arc<Mutex<VecDeque<u8>>>,
    closed: Arc<AtomicBool>,
}

/// Creates a connected pair of in-memory sockets.
pub fn pair() -> (MemorySocket, MemorySocket) {
    let (tx_a, rx_a) = unbounded();
    let (tx_b, rx_b) = unbounded();
    let closed = Arc::new(AtomicBool::new(false));
    let a = MemorySocket {
        tx: tx_a,
        rx: rx_b,
        leftover: Arc::new(Mutex::new(VecDeque::new())),
        closed: closed.clone(),
    };
    let b = MemorySocket {
        tx: tx_b,
        rx: rx_a,
        leftover: Arc::new(Mutex::new(VecDeque::new())),
        closed,
    };
    (a, b)
}

impl io::Read for MemorySocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut leftover = self.leftover.lock();
            if !leftover.is_empty() {
                let n = leftover.len().min(buf.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = leftover.pop_front().unwrap();
                }
                return Ok(n);
            }
        }
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(broken_pipe());
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if chunk.len() > n {
                        self.leftover.lock().extend(chunk[n..].iter().copied());
                    }
                    return Ok(n);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return Err(broken_pipe())
                }
            }
        }
    }
}

impl io::Write for MemorySocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(broken_pipe());
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| broken_pipe())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Socket for MemorySocket {
    fn try_clone(&self) -> io::Result<Box<dyn Socket>> {
        Ok(Box::new(self.clone()))
    }

    fn shutdown(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// A `Medium` implementation backed by in-memory pipes. `connect` dials
/// whichever endpoint currently has `start_accepting` registered for the
/// target `service_id` on this same medium instance; `deliver` and
/// `announce` exist for tests that want to drive one side by hand instead.
pub struct MemoryMedium {
    tag: MediumTag,
    listeners: Mutex<std::collections::HashMap<String, Box<dyn Fn(Box<dyn Socket>) + Send + Sync>>>,
    scanners: Mutex<std::collections::HashMap<String, Box<dyn Fn(FoundEndpoint) + Send + Sync>>>,
}

impl MemoryMedium {
    pub fn new(tag: MediumTag) -> Self {
        Self {
            tag,
            listeners: Mutex::new(std::collections::HashMap::new()),
            scanners: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Directly deliver `socket` to whatever service is accepting on
    /// `service_id`, as if a peer had just connected to it in-process.
    pub fn deliver(&self, service_id: &str, socket: MemorySocket) -> Result<()> {
        let listeners = self.listeners.lock();
        match listeners.get(service_id) {
            Some(cb) => {
                cb(Box::new(socket));
                Ok(())
            }
            None => Err(Error::simple(ErrorKind::EndpointUnknown)),
        }
    }

    /// Test helper standing in for an over-the-air advertisement: informs
    /// whoever is scanning `service_id` that `endpoint_id` is visible,
    /// reachable later via `remote` (typically a `String` the paired
    /// `MemoryMedium`'s `connect` can resolve back to a deliverable
    /// listener key).
    pub fn announce(&self, service_id: &str, found: FoundEndpoint) {
        if let Some(cb) = self.scanners.lock().get(service_id) {
            cb(found);
        }
    }
}

impl Medium for MemoryMedium {
    fn tag(&self) -> MediumTag {
        self.tag
    }

    fn advertise(&self, _service_id: &str, _endpoint_info: &[u8]) -> Result<()> {
        Ok(())
    }

    fn stop_advertising(&self, _service_id: &str) -> Result<()> {
        Ok(())
    }

    fn start_accepting(
        &self,
        service_id: &str,
        on_incoming: Box<dyn Fn(Box<dyn Socket>) + Send + Sync>,
    ) -> Result<()> {
        self.listeners
            .lock()
            .insert(service_id.to_owned(), on_incoming);
        Ok(())
    }

    fn stop_accepting(&self, service_id: &str) -> Result<()> {
        self.listeners.lock().remove(service_id);
        Ok(())
    }

    fn start_scanning(
        &self,
        service_id: &str,
        on_found: Box<dyn Fn(FoundEndpoint) + Send + Sync>,
        _on_lost: Box<dyn Fn(String) + Send + Sync>,
    ) -> Result<()> {
        self.scanners.lock().insert(service_id.to_owned(), on_found);
        Ok(())
    }

    fn stop_scanning(&self, service_id: &str) -> Result<()> {
        self.scanners.lock().remove(service_id);
        Ok(())
    }

    /// A single `MemoryMedium` instance has at most one accept listener per
    /// `service_id` (the last `start_accepting` call wins, same as
    /// `deliver`), so `remote` carries no information this in-memory
    /// transport needs beyond `service_id` itself: whichever endpoint is
    /// advertising `service_id` on this medium instance is the only
    /// possible dial target.
    fn connect(
        &self,
        service_id: &str,
        _remote: &dyn crate::medium::RemoteHandle,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Box<dyn Socket>> {
        if cancelled() {
            return Err("connect cancelled before dialing").wrapped(ErrorKind::Cancelled);
        }
        let listeners = self.listeners.lock();
        let on_incoming = listeners
            .get(service_id)
            .ok_or_else(|| Error::simple(ErrorKind::EndpointUnknown))?;
        let (local, remote_socket) = pair();
        on_incoming(Box::new(remote_socket));
        Ok(Box::new(local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn pair_roundtrips_bytes() {
        let (mut a, mut b) = pair();
        a.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn partial_reads_reassemble_from_leftover_buffer() {
        let (mut a, mut b) = pair();
        a.write_all(b"0123456789").unwrap();
        let mut first = [0u8; 3];
        b.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"012");
        let mut rest = [0u8; 7];
        b.read_exact(&mut rest).unwrap();
        assert_eq!(&rest, b"3456789");
    }

    #[test]
    fn shutdown_unblocks_a_pending_read() {
        let (a, mut b) = pair();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 1];
            b.read_exact(&mut buf)
        });
        thread::sleep(Duration::from_millis(50));
        a.shutdown().unwrap();
        let result = handle.join().unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn announce_reaches_a_registered_scanner() {
        let medium = MemoryMedium::new(MediumTag::WifiLan);
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = seen.clone();
        medium
            .start_scanning(
                "svc",
                Box::new(move |found| *seen_cb.lock() = Some(found.endpoint_id)),
                Box::new(|_| {}),
            )
            .unwrap();

        medium.announce(
            "svc",
            FoundEndpoint {
                endpoint_id: "peer-1".into(),
                endpoint_info: b"info".to_vec(),
                medium: MediumTag::WifiLan,
                remote: Arc::new("peer-1".to_string()),
            },
        );
        assert_eq!(seen.lock().as_deref(), Some("peer-1"));
    }
}
