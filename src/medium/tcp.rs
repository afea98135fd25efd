//! A TCP-loopback medium, built on blocking `std::net::TcpStream` since
//! this crate's concurrency model is OS threads, not an async runtime.
//!
//! Useful for local multi-process demos and for exercising real socket
//! teardown (`shutdown(Shutdown::Both)` unblocking a thread parked in
//! `read`).

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;

use crate::error::{ErrorKind, ResultWrappedExt, Result};
use crate::medium::{Medium, MediumTag, Socket};

pub struct TcpSocket {
    inner: TcpStream,
}

impl TcpSocket {
    pub fn new(inner: TcpStream) -> Self {
        Self { inner }
    }
}

impl io::Read for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl io::Write for TcpSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Socket for TcpSocket {
    fn try_clone(&self) -> io::Result<Box<dyn Socket>> {
        Ok(Box::new(TcpSocket::new(self.inner.try_clone()?)))
    }

    fn shutdown(&self) -> io::Result<()> {
        match self.inner.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // already shut down by a concurrent close; treat as success
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// A `Medium` that binds one local TCP listener per `service_id` and
/// connects to `SocketAddr` remote handles.
pub struct TcpMedium {
    tag: MediumTag,
}

impl TcpMedium {
    pub fn new(tag: MediumTag) -> Self {
        Self { tag }
    }
}

impl Medium for TcpMedium {
    fn tag(&self) -> MediumTag {
        self.tag
    }

    fn advertise(&self, _service_id: &str, _endpoint_info: &[u8]) -> Result<()> {
        // real BT/BLE/WiFi advertisement payloads are a platform concern;
        // over loopback TCP there is nothing to broadcast.
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
        let addr: SocketAddr = service_id
            .parse()
            .wrapped(ErrorKind::Error)?;
        let listener = TcpListener::bind(addr).wrapped(ErrorKind::EndpointIoError)?;
        thread::Builder::new()
            .name(format!("medium-accept-{}", service_id))
            .spawn(move || {
                for conn in listener.incoming() {
                    match conn {
                        Ok(stream) => on_incoming(Box::new(TcpSocket::new(stream))),
                        Err(_) => break,
                    }
                }
            })
            .wrapped(ErrorKind::Error)?;
        Ok(())
    }

    fn stop_accepting(&self, _service_id: &str) -> Result<()> {
        // the accept thread is torn down by dropping the listener; this
        // medium does not track listener handles beyond their thread,
        // mirroring the loopback-only scope of this reference medium.
        Ok(())
    }

    fn start_scanning(
        &self,
        _service_id: &str,
        _on_found: Box<dyn Fn(crate::medium::FoundEndpoint) + Send + Sync>,
        _on_lost: Box<dyn Fn(String) + Send + Sync>,
    ) -> Result<()> {
        // loopback TCP has no broadcast discovery; callers dial a known
        // `SocketAddr` directly via `RequestConnection`.
        Ok(())
    }

    fn stop_scanning(&self, _service_id: &str) -> Result<()> {
        Ok(())
    }

    fn connect(
        &self,
        service_id: &str,
        remote: &dyn crate::medium::RemoteHandle,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Box<dyn Socket>> {
        if cancelled() {
            return Err("connect cancelled before dialing").wrapped(ErrorKind::Cancelled);
        }
        let addr: SocketAddr = format!("{:?}", remote)
            .trim_matches('"')
            .parse()
            .or_else(|_| service_id.parse())
            .wrapped(ErrorKind::Error)?;
        let stream = TcpStream::connect(addr).wrapped(ErrorKind::EndpointIoError)?;
        Ok(Box::new(TcpSocket::new(stream)))
    }
}
