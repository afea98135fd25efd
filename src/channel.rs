//! The per-connection duplex channel abstraction: length-prefix framing,
//! crypto-then-socket-write ordering, and a stray-keepalive fallback for
//! the moment a peer's encryption hasn't kicked in yet, built on
//! `parking_lot` primitives rather than a hand-rolled mutex wrapper.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::encryption::EncryptionContext;
use crate::error::{Error, ErrorKind, Result};
use crate::frame::{self, validate_frame_len};
use crate::medium::{MediumTag, Socket};

/// A bidirectional framed byte stream to one endpoint over one medium.
///
/// Five independent locks guard disjoint concerns so that a slow writer
/// never blocks a concurrent reader and vice versa: `reader`, `writer`,
/// `crypto`, `paused` (+ condvar), and the last-I/O timestamps. `close`
/// deliberately bypasses `reader`/`writer` so it can unblock an in-flight
/// socket operation instead of deadlocking behind it.
pub struct EndpointChannel {
    service_id: String,
    channel_name: String,
    medium_tag: MediumTag,
    try_count: u32,

    reader: Mutex<Box<dyn Read + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    closer: Box<dyn Socket>,

    crypto: Mutex<Option<Arc<dyn EncryptionContext>>>,

    paused: Mutex<bool>,
    pause_cv: Condvar,

    last_read_ts: Mutex<Instant>,
    last_write_ts: Mutex<Instant>,

    closed: AtomicBool,
}

impl EndpointChannel {
    pub fn new(
        service_id: impl Into<String>,
        channel_name: impl Into<String>,
        medium_tag: MediumTag,
        socket: Box<dyn Socket>,
    ) -> Result<Arc<Self>> {
        let reader_socket = socket.try_clone().map_err(Error::from)?;
        let writer_socket = socket.try_clone().map_err(Error::from)?;
        let now = Instant::now();
        Ok(Arc::new(Self {
            service_id: service_id.into(),
            channel_name: channel_name.into(),
            medium_tag,
            try_count: 0,
            reader: Mutex::new(reader_socket),
            writer: Mutex::new(writer_socket),
            closer: socket,
            crypto: Mutex::new(None),
            paused: Mutex::new(false),
            pause_cv: Condvar::new(),
            last_read_ts: Mutex::new(now),
            last_write_ts: Mutex::new(now),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn medium_tag(&self) -> MediumTag {
        self.medium_tag
    }

    pub fn try_count(&self) -> u32 {
        self.try_count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn last_read_at(&self) -> Instant {
        *self.last_read_ts.lock()
    }

    pub fn last_write_at(&self) -> Instant {
        *self.last_write_ts.lock()
    }

    /// Reads one length-prefixed frame body, decrypting it if encryption
    /// is enabled. Blocks until a frame arrives, the channel is closed, or
    /// a protocol violation is detected.
    pub fn read(&self) -> Result<Vec<u8>> {
        if self.is_closed() {
            return Err(Error::simple(ErrorKind::EndpointIoError));
        }

        let raw = {
            let mut reader = self.reader.lock();
            let mut len_buf = [0u8; 4];
            if let Err(e) = reader.read_exact(&mut len_buf) {
                self.closed.store(true, Ordering::Release);
                return Err(Error::wrapped(ErrorKind::EndpointIoError, e));
            }
            let n = validate_frame_len(i32::from_be_bytes(len_buf))?;
            let mut body = vec![0u8; n];
            if let Err(e) = reader.read_exact(&mut body) {
                self.closed.store(true, Ordering::Release);
                return Err(Error::wrapped(ErrorKind::EndpointIoError, e));
            }
            body
        };
        *self.last_read_ts.lock() = Instant::now();

        let crypto = self.crypto.lock().clone();
        let plaintext = match crypto {
            None => raw,
            Some(ctx) => match ctx.decrypt(&raw) {
                Ok(plain) => plain,
                Err(_) => {
                    // peer's encryption may not have kicked in yet; tolerate a
                    // stray plaintext KEEP_ALIVE racing the handshake
                    match frame::decode_frame(&raw) {
                        Ok(f) if f.is_keep_alive() => raw,
                        _ => {
                            tracing::warn!(
                                channel = %self.channel_name,
                                "undecryptable, non-keepalive frame on encrypted channel"
                            );
                            return Err(Error::simple(ErrorKind::InvalidProtocolBuffer));
                        }
                    }
                }
            },
        };
        Ok(plaintext)
    }

    /// Writes one length-prefixed frame body, encrypting it first if
    /// encryption is enabled. Blocks while the channel is paused.
    pub fn write(&self, payload: &[u8]) -> Result<()> {
        {
            let mut paused = self.paused.lock();
            while *paused && !self.is_closed() {
                self.pause_cv.wait(&mut paused);
            }
        }
        if self.is_closed() {
            return Err(Error::simple(ErrorKind::EndpointIoError));
        }

        let mut writer = self.writer.lock();
        let body = {
            let crypto = self.crypto.lock();
            match crypto.as_ref() {
                Some(ctx) => ctx.encrypt(payload)?,
                None => payload.to_vec(),
            }
            // crypto lock dropped here, before the blocking socket write
        };

        let len = body.len() as i32;
        if let Err(e) = writer.write_all(&len.to_be_bytes()) {
            self.closed.store(true, Ordering::Release);
            return Err(Error::wrapped(ErrorKind::EndpointIoError, e));
        }
        if let Err(e) = writer.write_all(&body) {
            self.closed.store(true, Ordering::Release);
            return Err(Error::wrapped(ErrorKind::EndpointIoError, e));
        }
        if let Err(e) = writer.flush() {
            self.closed.store(true, Ordering::Release);
            return Err(Error::wrapped(ErrorKind::EndpointIoError, e));
        }
        drop(writer);
        *self.last_write_ts.lock() = Instant::now();
        Ok(())
    }

    pub fn enable_encryption(&self, ctx: Arc<dyn EncryptionContext>) {
        *self.crypto.lock() = Some(ctx);
    }

    pub fn disable_encryption(&self) {
        *self.crypto.lock() = None;
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypto.lock().is_some()
    }

    pub fn encryption_context(&self) -> Option<Arc<dyn EncryptionContext>> {
        self.crypto.lock().clone()
    }

    pub fn pause(&self) {
        *self.paused.lock() = true;
    }

    pub fn resume(&self) {
        *self.paused.lock() = false;
        self.pause_cv.notify_all();
    }

    /// Idempotent. Closes the underlying socket directly, without taking
    /// `reader`/`writer`, so an in-flight blocking `read`/`write` is
    /// unblocked by socket teardown rather than left to deadlock.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.closer.shutdown();
        *self.paused.lock() = false;
        self.pause_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::AeadEncryptionContext;
    use crate::medium::memory;
    use std::thread;
    use std::time::Duration;

    fn channel_pair() -> (Arc<EndpointChannel>, Arc<EndpointChannel>) {
        let (a, b) = memory::pair();
        let a = EndpointChannel::new("svc", "a", MediumTag::WifiLan, Box::new(a)).unwrap();
        let b = EndpointChannel::new("svc", "b", MediumTag::WifiLan, Box::new(b)).unwrap();
        (a, b)
    }

    #[test]
    fn write_then_read_roundtrips_plaintext() {
        let (a, b) = channel_pair();
        a.write(b"seventeen bytes!!").unwrap();
        let got = b.read().unwrap();
        assert_eq!(got, b"seventeen bytes!!");
    }

    #[test]
    fn encryption_is_sticky_until_disabled() {
        let (a, b) = channel_pair();
        let secret = [3u8; 32];
        let ctx_a = Arc::new(AeadEncryptionContext::derive(&secret).unwrap());
        let ctx_b = Arc::new(AeadEncryptionContext::derive(&secret).unwrap());
        a.enable_encryption(ctx_a);
        b.enable_encryption(ctx_b);

        a.write(b"first").unwrap();
        assert_eq!(b.read().unwrap(), b"first");
        a.write(b"second").unwrap();
        assert_eq!(b.read().unwrap(), b"second");
    }

    #[test]
    fn close_unblocks_pending_read() {
        let (a, b) = channel_pair();
        let handle = thread::spawn(move || b.read());
        thread::sleep(Duration::from_millis(50));
        a.close();
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn close_unblocks_a_paused_writer() {
        let (a, _b) = channel_pair();
        a.pause();
        let writer = a.clone();
        let handle = thread::spawn(move || writer.write(b"stuck"));
        thread::sleep(Duration::from_millis(50));
        a.close();
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn resume_delivers_writes_issued_while_paused() {
        let (a, b) = channel_pair();
        a.pause();
        let writer = a.clone();
        let handle = thread::spawn(move || writer.write(b"queued"));
        thread::sleep(Duration::from_millis(50));
        a.resume();
        handle.join().unwrap().unwrap();
        assert_eq!(b.read().unwrap(), b"queued");
    }

    #[test]
    fn oversized_length_prefix_is_rejected_as_a_fatal_protocol_error() {
        // Writes a raw length prefix one byte over the 1 MiB bound directly
        // on the underlying socket, bypassing `write`'s own framing so the
        // bad prefix reaches `read`'s validation unmodified.
        let (mut raw, socket) = memory::pair();
        let channel = EndpointChannel::new("svc", "peer", MediumTag::WifiLan, Box::new(socket)).unwrap();
        let bad_len = (frame::MAX_FRAME_LEN as i32) + 1;
        raw.write_all(&bad_len.to_be_bytes()).unwrap();

        let err = channel.read().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EndpointIoError);
    }

    #[test]
    fn negative_length_prefix_is_rejected() {
        let (mut raw, socket) = memory::pair();
        let channel = EndpointChannel::new("svc", "peer", MediumTag::WifiLan, Box::new(socket)).unwrap();
        raw.write_all(&(-1i32).to_be_bytes()).unwrap();

        let err = channel.read().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EndpointIoError);
    }
}
