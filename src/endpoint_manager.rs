//! Per-endpoint reader/writer threads and keep-alive supervision, grounded
//! on `endpoint_manager.cc`: one reader thread decoding and dispatching
//! frames until the channel dies, one writer thread draining a FIFO queue
//! so a slow write never blocks whoever calls `send_payload`, and a
//! keep-alive thread per endpoint rather than one shared timer wheel --
//! this crate has no cross-endpoint per-tick work to batch, so a
//! dedicated thread per endpoint keeps the teardown path a single,
//! easy-to-reason-about sequence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::EndpointChannel;
use crate::channel_manager::{ChannelManager, DisconnectReason};
use crate::dispatch::FrameProcessorRegistry;
use crate::error::Result;
use crate::frame::{self, Frame};
use crate::listeners::ConnectionListener;

/// Keep-alive cadence for one endpoint. Mirrors the fields negotiated in
/// `CONNECTION_REQUEST`.
#[derive(Copy, Clone, Debug)]
pub struct KeepAliveConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

enum WriterCommand {
    Send(Vec<u8>),
    Stop,
}

struct EndpointState {
    channel: Arc<EndpointChannel>,
    writer_tx: Sender<WriterCommand>,
    stop: Arc<AtomicBool>,
    listener: Arc<dyn ConnectionListener>,
}

/// Owns the reader/writer/keep-alive threads for every connected
/// endpoint. One instance is shared by the whole core context.
///
/// Each endpoint carries its own [`ConnectionListener`] rather than one
/// global listener for the whole manager, since the advertiser of one
/// service and the requester of a connection to a different endpoint may
/// each want their own callbacks: the listener passed to
/// `register_endpoint` is whichever one accepted or initiated that
/// specific connection.
pub struct EndpointManager {
    channel_manager: Arc<ChannelManager>,
    dispatch: Arc<FrameProcessorRegistry>,
    endpoints: Mutex<HashMap<String, EndpointState>>,
}

impl EndpointManager {
    pub fn new(channel_manager: Arc<ChannelManager>, dispatch: Arc<FrameProcessorRegistry>) -> Arc<Self> {
        Arc::new(Self {
            channel_manager,
            dispatch,
            endpoints: Mutex::new(HashMap::new()),
        })
    }

    /// Starts the reader, writer, and keep-alive threads for a newly
    /// accepted/established channel. The channel is expected to already
    /// be registered with the `ChannelManager`.
    pub fn register_endpoint(
        self: &Arc<Self>,
        endpoint_id: &str,
        channel: Arc<EndpointChannel>,
        listener: Arc<dyn ConnectionListener>,
        keep_alive: KeepAliveConfig,
    ) {
        let (writer_tx, writer_rx) = mpsc::channel::<WriterCommand>();
        let stop = Arc::new(AtomicBool::new(false));

        self.endpoints.lock().insert(
            endpoint_id.to_owned(),
            EndpointState {
                channel: channel.clone(),
                writer_tx: writer_tx.clone(),
                stop: stop.clone(),
                listener,
            },
        );

        {
            let manager = self.clone();
            let endpoint_id = endpoint_id.to_owned();
            let channel = channel.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name(format!("endpoint-reader-{}", endpoint_id))
                .spawn(move || manager.run_reader(endpoint_id, channel, stop))
                .expect("spawn endpoint reader thread");
        }
        {
            let channel = channel.clone();
            thread::Builder::new()
                .name(format!("endpoint-writer-{}", endpoint_id))
                .spawn(move || run_writer(channel, writer_rx))
                .expect("spawn endpoint writer thread");
        }
        {
            let manager = self.clone();
            let endpoint_id = endpoint_id.to_owned();
            thread::Builder::new()
                .name(format!("endpoint-keepalive-{}", endpoint_id))
                .spawn(move || manager.run_keep_alive(endpoint_id, channel, keep_alive, stop))
                .expect("spawn endpoint keep-alive thread");
        }
    }

    /// Enqueues an opaque payload for delivery; returns once queued, not
    /// once written. Fails if the endpoint is unknown or already torn down.
    pub fn send_payload(&self, endpoint_id: &str, payload: Vec<u8>) -> Result<()> {
        let bytes = frame::encode_frame(&Frame::PayloadTransfer(payload))?;
        self.enqueue(endpoint_id, bytes)
    }

    fn enqueue(&self, endpoint_id: &str, bytes: Vec<u8>) -> Result<()> {
        use crate::error::{Error, ErrorKind};
        let tx = {
            let endpoints = self.endpoints.lock();
            endpoints.get(endpoint_id).map(|s| s.writer_tx.clone())
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(WriterCommand::Send(bytes));
                Ok(())
            }
            None => Err(Error::simple(ErrorKind::EndpointUnknown)),
        }
    }

    /// Tears an endpoint down: stops its keep-alive thread, closes its
    /// channel (unblocking the reader and writer threads), removes it
    /// from the `ChannelManager`, and notifies the lifecycle listener.
    /// Idempotent -- the second call for an already-removed endpoint is a
    /// no-op.
    pub fn unregister_endpoint(&self, endpoint_id: &str, reason: DisconnectReason) {
        let state = self.endpoints.lock().remove(endpoint_id);
        let Some(state) = state else { return };

        state.stop.store(true, Ordering::Release);
        state.channel.close();
        let _ = state.writer_tx.send(WriterCommand::Stop);
        self.channel_manager.unregister(endpoint_id, reason);
        state.listener.on_disconnected(endpoint_id, reason);
    }

    pub fn is_registered(&self, endpoint_id: &str) -> bool {
        self.endpoints.lock().contains_key(endpoint_id)
    }

    /// The listener registered for `endpoint_id`, if it is currently
    /// connected. Used by the bandwidth-upgrade manager to notify the
    /// right listener of a medium change without holding one itself.
    pub fn listener_for(&self, endpoint_id: &str) -> Option<Arc<dyn ConnectionListener>> {
        self.endpoints.lock().get(endpoint_id).map(|s| s.listener.clone())
    }

    /// Swaps the live channel for an already-registered endpoint without
    /// treating it as a disconnect: used by the bandwidth-upgrade manager
    /// at cutover. Stops the old reader/writer/keep-alive threads and
    /// starts fresh ones against `new_channel`, carrying over the
    /// endpoint's existing listener. The old channel itself is left open
    /// -- BWU decides when it is safe to close, since the two peers
    /// confirm that over a final pair of frames.
    pub fn swap_channel(
        self: &Arc<Self>,
        endpoint_id: &str,
        new_channel: Arc<EndpointChannel>,
        keep_alive: KeepAliveConfig,
    ) {
        let old = self.endpoints.lock().remove(endpoint_id);
        let Some(old) = old else { return };
        old.stop.store(true, Ordering::Release);
        let _ = old.writer_tx.send(WriterCommand::Stop);
        self.register_endpoint(endpoint_id, new_channel, old.listener, keep_alive);
    }

    fn run_reader(self: Arc<Self>, endpoint_id: String, channel: Arc<EndpointChannel>, stop: Arc<AtomicBool>) {
        loop {
            if stop.load(Ordering::Acquire) {
                return;
            }
            let bytes = match channel.read() {
                Ok(b) => b,
                Err(_) => {
                    // a BWU cutover swaps this endpoint onto a new channel
                    // and abandons this one without closing it; `stop` is
                    // what tells us this read failure is expected and must
                    // not tear down the (now unrelated) current entry.
                    if !stop.load(Ordering::Acquire) {
                        self.unregister_endpoint(&endpoint_id, DisconnectReason::IoError);
                    }
                    return;
                }
            };
            if stop.load(Ordering::Acquire) {
                return;
            }
            let frame = match frame::decode_frame(&bytes) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(endpoint_id = %endpoint_id, error = %e, "undecodable frame, dropping endpoint");
                    self.unregister_endpoint(&endpoint_id, DisconnectReason::IoError);
                    return;
                }
            };
            if matches!(frame, Frame::Disconnection) {
                self.unregister_endpoint(&endpoint_id, DisconnectReason::RemoteDisconnection);
                return;
            }
            if let Frame::KeepAlive { ack: false } = &frame {
                let _ = self.enqueue(
                    &endpoint_id,
                    frame::encode_frame(&Frame::KeepAlive { ack: true }).expect("encode keep-alive"),
                );
            }
            self.dispatch.dispatch(frame, &endpoint_id, channel.medium_tag());
        }
    }

    fn run_keep_alive(
        self: Arc<Self>,
        endpoint_id: String,
        channel: Arc<EndpointChannel>,
        config: KeepAliveConfig,
        stop: Arc<AtomicBool>,
    ) {
        loop {
            thread::sleep(config.interval);
            if stop.load(Ordering::Acquire) {
                return;
            }
            if channel.last_read_at().elapsed() > config.timeout {
                self.unregister_endpoint(&endpoint_id, DisconnectReason::KeepAliveTimeout);
                return;
            }
            let bytes = frame::encode_frame(&Frame::KeepAlive { ack: false }).expect("encode keep-alive");
            let _ = self.enqueue(&endpoint_id, bytes);
        }
    }
}

fn run_writer(channel: Arc<EndpointChannel>, rx: mpsc::Receiver<WriterCommand>) {
    for command in rx {
        match command {
            WriterCommand::Send(bytes) => {
                if channel.write(&bytes).is_err() {
                    return;
                }
            }
            WriterCommand::Stop => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::memory;
    use crate::medium::MediumTag;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct RecordingListener {
        count: AtomicUsize,
    }
    impl ConnectionListener for RecordingListener {
        fn on_connection_result(&self, _endpoint_id: &str, _accepted: bool) {}

        fn on_disconnected(&self, _endpoint_id: &str, _reason: DisconnectReason) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager_with(channel_manager: Arc<ChannelManager>) -> (Arc<EndpointManager>, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener { count: AtomicUsize::new(0) });
        let dispatch = Arc::new(FrameProcessorRegistry::new());
        let manager = EndpointManager::new(channel_manager, dispatch);
        (manager, listener)
    }

    #[test]
    fn send_payload_reaches_the_peer() {
        let (a, b) = memory::pair();
        let a = EndpointChannel::new("svc", "a", MediumTag::WifiLan, Box::new(a)).unwrap();
        let b = EndpointChannel::new("svc", "b", MediumTag::WifiLan, Box::new(b)).unwrap();

        let channel_manager = Arc::new(ChannelManager::new());
        channel_manager.register_channel("peer", a.clone(), false);
        let (manager, listener) = manager_with(channel_manager);
        manager.register_endpoint(
            "peer",
            a,
            listener,
            KeepAliveConfig { interval: Duration::from_secs(60), timeout: Duration::from_secs(120) },
        );

        manager.send_payload("peer", b"hello".to_vec()).unwrap();
        let bytes = b.read().unwrap();
        assert_eq!(frame::decode_frame(&bytes).unwrap(), Frame::PayloadTransfer(b"hello".to_vec()));
    }

    #[test]
    fn remote_disconnection_frame_tears_down_and_notifies() {
        let (a, b) = memory::pair();
        let a = EndpointChannel::new("svc", "a", MediumTag::WifiLan, Box::new(a)).unwrap();
        let b = EndpointChannel::new("svc", "b", MediumTag::WifiLan, Box::new(b)).unwrap();

        let channel_manager = Arc::new(ChannelManager::new());
        channel_manager.register_channel("peer", a.clone(), false);
        let (manager, listener) = manager_with(channel_manager);
        manager.register_endpoint(
            "peer",
            a,
            listener.clone(),
            KeepAliveConfig { interval: Duration::from_secs(60), timeout: Duration::from_secs(120) },
        );

        b.write(&frame::encode_frame(&Frame::Disconnection).unwrap()).unwrap();
        // reader thread needs a moment to observe and tear down
        let deadline = Instant::now() + Duration::from_secs(2);
        while listener.count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(listener.count.load(Ordering::SeqCst), 1);
        assert!(!manager.is_registered("peer"));
    }

    #[test]
    fn swap_channel_moves_traffic_without_disconnecting() {
        let (a, b) = memory::pair();
        let a = EndpointChannel::new("svc", "a", MediumTag::WifiLan, Box::new(a)).unwrap();
        let b = EndpointChannel::new("svc", "b", MediumTag::WifiLan, Box::new(b)).unwrap();

        let channel_manager = Arc::new(ChannelManager::new());
        channel_manager.register_channel("peer", a.clone(), false);
        let (manager, listener) = manager_with(channel_manager);
        let cfg = KeepAliveConfig { interval: Duration::from_secs(60), timeout: Duration::from_secs(120) };
        manager.register_endpoint("peer", a, listener.clone(), cfg);

        let (c, d) = memory::pair();
        let c = EndpointChannel::new("svc", "c", MediumTag::WifiDirect, Box::new(c)).unwrap();
        let d = EndpointChannel::new("svc", "d", MediumTag::WifiDirect, Box::new(d)).unwrap();
        manager.swap_channel("peer", c, cfg);

        manager.send_payload("peer", b"over-new-path".to_vec()).unwrap();
        let bytes = d.read().unwrap();
        assert_eq!(frame::decode_frame(&bytes).unwrap(), Frame::PayloadTransfer(b"over-new-path".to_vec()));
        assert_eq!(listener.count.load(Ordering::SeqCst), 0);
        assert!(manager.is_registered("peer"));

        // the abandoned old channel's stale reader must not tear down the
        // freshly-swapped entry once it notices the socket is gone.
        b.close();
        thread::sleep(Duration::from_millis(100));
        assert!(manager.is_registered("peer"));
        assert_eq!(listener.count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregister_is_idempotent() {
        let (a, _b) = memory::pair();
        let a = EndpointChannel::new("svc", "a", MediumTag::WifiLan, Box::new(a)).unwrap();
        let channel_manager = Arc::new(ChannelManager::new());
        channel_manager.register_channel("peer", a.clone(), false);
        let (manager, listener) = manager_with(channel_manager);
        manager.register_endpoint(
            "peer",
            a,
            listener.clone(),
            KeepAliveConfig { interval: Duration::from_secs(60), timeout: Duration::from_secs(120) },
        );

        manager.unregister_endpoint("peer", DisconnectReason::LocalShutdown);
        manager.unregister_endpoint("peer", DisconnectReason::LocalShutdown);
        assert_eq!(listener.count.load(Ordering::SeqCst), 1);
    }
}
