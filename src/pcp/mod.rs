//! The PCP (peer connection protocol) handler: a single serial worker
//! thread owning every pending and in-progress connection, driving
//! itself off a command channel rather than exposing state for callers
//! to poll, since this module has background work of its own
//! (handshakes, delayed discards) to schedule between commands.
//!
//! Every public method here posts a command onto that channel and then
//! blocks its caller on a one-shot reply, so all the actual state
//! mutation still happens on the worker thread in `Worker::handle` with
//! no locking of its own, while the public API keeps the synchronous,
//! `-> Result<()>` shape callers expect. `request_connection`'s reply is
//! the one exception to "replied immediately": its one-shot is handed
//! to the pending connection itself and only fires once the connect →
//! handshake → accept/reject chain reaches a terminal state, so the
//! caller's thread is the one blocked waiting for that outcome (see
//! `PendingConnection::pending_result`).

pub mod discovery;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use rand::RngCore;

use crate::channel::EndpointChannel;
use crate::channel_manager::ChannelManager;
use crate::config::{ConnectionOptions, REJECTED_CONNECTION_CLOSE_DELAY};
use crate::dispatch::FrameProcessorRegistry;
use crate::encryption::{EncryptionContext, EncryptionOutcome, EncryptionResultListener, EncryptionRunner};
use crate::endpoint_manager::{EndpointManager, KeepAliveConfig};
use crate::error::{Error, ErrorKind, Result, ResultSimpleExt};
use crate::frame::{self, ConnectionRequest, ConnectionResponse, Frame};
use crate::listeners::{ConnectionListener, DiscoveryListener};
use crate::medium::{FoundEndpoint, Medium, MediumTag, RemoteHandle, Socket};

use discovery::DiscoveredEndpointCache;

/// Where a pending connection sits in the symmetric accept/reject
/// handshake. Both sides track this independently; a connection is
/// promoted to the `EndpointManager` only once *this side* observes
/// both halves as accepted.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Handshaking,
    AwaitingBoth,
    AwaitingLocalResponse,
    AwaitingRemoteResponse,
    Accepted,
    Rejected,
}

struct PendingConnection {
    channel: Option<Arc<EndpointChannel>>,
    context: Option<Arc<dyn EncryptionContext>>,
    medium_tag: MediumTag,
    nonce: i32,
    is_incoming: bool,
    cancel: Arc<AtomicBool>,
    local_accept: Option<bool>,
    remote_accept: Option<bool>,
    state: ConnectionState,
    listener: Arc<dyn ConnectionListener>,
    reader_stop: Arc<AtomicBool>,
    /// One-shot sink for the outgoing `request_connection` future; `Some`
    /// only for connections this side initiated. Fulfilled exactly once,
    /// when the connection reaches a terminal state (accepted, rejected,
    /// handshake failure, tie-break loss, or I/O error while pending).
    pending_result: Option<oneshot::Sender<Result<()>>>,
}

impl PendingConnection {
    fn recompute_state(&mut self) {
        self.state = match (self.local_accept, self.remote_accept) {
            (Some(false), _) | (_, Some(false)) => ConnectionState::Rejected,
            (Some(true), Some(true)) => ConnectionState::Accepted,
            (None, None) => ConnectionState::AwaitingBoth,
            (Some(true), None) => ConnectionState::AwaitingRemoteResponse,
            (None, Some(true)) => ConnectionState::AwaitingLocalResponse,
        };
    }
}

struct Advertisement {
    listener: Arc<dyn ConnectionListener>,
}

enum Command {
    StartAdvertising { service_id: String, endpoint_info: Vec<u8>, listener: Arc<dyn ConnectionListener>, reply: oneshot::Sender<Result<()>> },
    StopAdvertising { service_id: String, reply: oneshot::Sender<Result<()>> },
    StartDiscovery { service_id: String, listener: Arc<dyn DiscoveryListener>, reply: oneshot::Sender<Result<()>> },
    StopDiscovery { service_id: String, reply: oneshot::Sender<Result<()>> },
    EndpointFound { service_id: String, found: FoundEndpoint },
    EndpointLost { service_id: String, endpoint_id: String, medium_tag: MediumTag },
    IncomingSocket { service_id: String, socket: Box<dyn Socket>, medium_tag: MediumTag },
    IncomingRequest {
        service_id: String,
        endpoint_id: String,
        request: ConnectionRequest,
        channel: Arc<EndpointChannel>,
    },
    /// `reply` is not answered here: it is stashed on the resulting
    /// `PendingConnection::pending_result` and fulfilled later, whenever
    /// that connection reaches a terminal state.
    RequestConnection { endpoint_id: String, local_endpoint_info: Vec<u8>, listener: Arc<dyn ConnectionListener>, reply: oneshot::Sender<Result<()>> },
    AcceptConnection { endpoint_id: String, reply: oneshot::Sender<Result<()>> },
    RejectConnection { endpoint_id: String, reply: oneshot::Sender<Result<()>> },
    HandshakeDone { endpoint_id: String, channel: Arc<EndpointChannel>, outcome: EncryptionOutcome },
    HandshakeFailed { endpoint_id: String },
    PendingFrame { endpoint_id: String, frame: Frame },
    PendingIoError { endpoint_id: String },
    DiscardRejected { endpoint_id: String },
}

/// Public handle to the PCP worker thread. Cloning the handler clones
/// only the command channel; the worker thread itself is singular.
pub struct PcpHandler {
    cmd_tx: Sender<Command>,
}

impl PcpHandler {
    pub fn new(
        local_endpoint_id: String,
        mediums: Vec<Arc<dyn Medium>>,
        channel_manager: Arc<ChannelManager>,
        dispatch: Arc<FrameProcessorRegistry>,
        endpoint_manager: Arc<EndpointManager>,
        options: ConnectionOptions,
        config: crate::config::PcpConfig,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = unbounded();
        let mediums = mediums
            .into_iter()
            .filter(|m| config.allowed_mediums.contains(&m.tag()))
            .map(|m| (m.tag(), m))
            .collect();
        let worker = Worker {
            local_endpoint_id,
            mediums,
            channel_manager,
            dispatch,
            endpoint_manager,
            options,
            config,
            cmd_tx: cmd_tx.clone(),
            advertising: HashMap::new(),
            discovering: HashMap::new(),
            discovered: DiscoveredEndpointCache::new(),
            pending: HashMap::new(),
        };
        thread::Builder::new()
            .name("pcp-handler".into())
            .spawn(move || worker.run(cmd_rx))
            .expect("spawn PCP worker thread");
        Arc::new(Self { cmd_tx })
    }

    /// Posts a command built around a one-shot reply channel and blocks
    /// the caller until that reply arrives. Used by every public
    /// operation that blocks the caller until the PCP worker thread has
    /// settled the outcome (immediately for most operations; only once
    /// the connect/handshake/accept chain concludes for
    /// `request_connection`, which stashes its `reply` rather than
    /// answering it inline -- see `Command::RequestConnection`).
    fn call(&self, build: impl FnOnce(oneshot::Sender<Result<()>>) -> Command) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx.send(build(reply_tx)).simple(ErrorKind::Error)?;
        reply_rx.recv().simple(ErrorKind::Error)?
    }

    pub fn start_advertising(
        &self,
        service_id: impl Into<String>,
        endpoint_info: Vec<u8>,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<()> {
        let service_id = service_id.into();
        self.call(|reply| Command::StartAdvertising { service_id, endpoint_info, listener, reply })
    }

    pub fn stop_advertising(&self, service_id: impl Into<String>) -> Result<()> {
        let service_id = service_id.into();
        self.call(|reply| Command::StopAdvertising { service_id, reply })
    }

    pub fn start_discovery(&self, service_id: impl Into<String>, listener: Arc<dyn DiscoveryListener>) -> Result<()> {
        let service_id = service_id.into();
        self.call(|reply| Command::StartDiscovery { service_id, listener, reply })
    }

    pub fn stop_discovery(&self, service_id: impl Into<String>) -> Result<()> {
        let service_id = service_id.into();
        self.call(|reply| Command::StopDiscovery { service_id, reply })
    }

    /// Blocks until the requested endpoint reaches a terminal state:
    /// connected (both sides accepted), rejected, or failed (medium
    /// connect error, handshake failure, cancellation, or tie-break
    /// loss). Mirrors `pending_result`, the one-shot result sink the
    /// data model attaches to every outgoing request.
    pub fn request_connection(
        &self,
        endpoint_id: impl Into<String>,
        local_endpoint_info: Vec<u8>,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<()> {
        let endpoint_id = endpoint_id.into();
        self.call(|reply| Command::RequestConnection { endpoint_id, local_endpoint_info, listener, reply })
    }

    pub fn accept_connection(&self, endpoint_id: impl Into<String>) -> Result<()> {
        let endpoint_id = endpoint_id.into();
        self.call(|reply| Command::AcceptConnection { endpoint_id, reply })
    }

    pub fn reject_connection(&self, endpoint_id: impl Into<String>) -> Result<()> {
        let endpoint_id = endpoint_id.into();
        self.call(|reply| Command::RejectConnection { endpoint_id, reply })
    }

    /// Delivered by a `Medium`'s scan callback.
    pub fn on_endpoint_found(&self, service_id: impl Into<String>, found: FoundEndpoint) {
        let _ = self.cmd_tx.send(Command::EndpointFound { service_id: service_id.into(), found });
    }

    /// Delivered by a `Medium`'s scan callback.
    pub fn on_endpoint_lost(&self, service_id: impl Into<String>, endpoint_id: impl Into<String>, medium_tag: MediumTag) {
        let _ = self.cmd_tx.send(Command::EndpointLost {
            service_id: service_id.into(),
            endpoint_id: endpoint_id.into(),
            medium_tag,
        });
    }
}

struct Worker {
    local_endpoint_id: String,
    mediums: HashMap<MediumTag, Arc<dyn Medium>>,
    channel_manager: Arc<ChannelManager>,
    dispatch: Arc<FrameProcessorRegistry>,
    endpoint_manager: Arc<EndpointManager>,
    options: ConnectionOptions,
    config: crate::config::PcpConfig,
    cmd_tx: Sender<Command>,
    advertising: HashMap<String, Advertisement>,
    discovering: HashMap<String, Arc<dyn DiscoveryListener>>,
    discovered: DiscoveredEndpointCache,
    pending: HashMap<String, PendingConnection>,
}

impl Worker {
    fn run(mut self, cmd_rx: Receiver<Command>) {
        for command in cmd_rx {
            self.handle(command);
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::StartAdvertising { service_id, endpoint_info, listener, reply } => {
                self.start_advertising(service_id, endpoint_info, listener);
                let _ = reply.send(Ok(()));
            }
            Command::StopAdvertising { service_id, reply } => {
                self.stop_advertising(&service_id);
                let _ = reply.send(Ok(()));
            }
            Command::StartDiscovery { service_id, listener, reply } => {
                self.start_discovery(service_id, listener);
                let _ = reply.send(Ok(()));
            }
            Command::StopDiscovery { service_id, reply } => {
                self.stop_discovery(&service_id);
                let _ = reply.send(Ok(()));
            }
            Command::EndpointFound { service_id, found } => {
                use discovery::FoundEvent;
                let event = self.discovered.on_found(&found.endpoint_id, &service_id, found.clone());
                if let Some(listener) = self.discovering.get(&service_id) {
                    match event {
                        FoundEvent::New => listener.on_endpoint_found(&found.endpoint_id, &found),
                        FoundEvent::InfoChanged => {
                            listener.on_endpoint_lost(&found.endpoint_id);
                            listener.on_endpoint_found(&found.endpoint_id, &found);
                        }
                        FoundEvent::Unchanged => {}
                    }
                }
            }
            Command::EndpointLost { service_id, endpoint_id, medium_tag } => {
                if self.discovered.on_lost(&endpoint_id, medium_tag) {
                    if let Some(listener) = self.discovering.get(&service_id) {
                        listener.on_endpoint_lost(&endpoint_id);
                    }
                }
            }
            Command::IncomingSocket { service_id, socket, medium_tag } => {
                spawn_incoming_handshake(self.cmd_tx.clone(), socket, service_id, medium_tag);
            }
            Command::IncomingRequest { service_id, endpoint_id, request, channel } => {
                self.on_incoming_request(service_id, endpoint_id, request, channel)
            }
            Command::RequestConnection { endpoint_id, local_endpoint_info, listener, reply } => {
                self.request_connection(endpoint_id, local_endpoint_info, listener, reply)
            }
            Command::AcceptConnection { endpoint_id, reply } => {
                let result = self.set_local_decision(&endpoint_id, true);
                let _ = reply.send(result);
            }
            Command::RejectConnection { endpoint_id, reply } => {
                let result = self.set_local_decision(&endpoint_id, false);
                let _ = reply.send(result);
            }
            Command::HandshakeDone { endpoint_id, channel, outcome } => {
                self.on_handshake_done(endpoint_id, channel, outcome)
            }
            Command::HandshakeFailed { endpoint_id } => self.on_handshake_failed(&endpoint_id),
            Command::PendingFrame { endpoint_id, frame } => self.on_pending_frame(&endpoint_id, frame),
            Command::PendingIoError { endpoint_id } => {
                self.discard_pending(&endpoint_id, "I/O error while connection was pending")
            }
            Command::DiscardRejected { endpoint_id } => {
                tracing::debug!(endpoint_id = %endpoint_id, "rejected connection bookkeeping discarded");
            }
        }
    }

    fn start_advertising(&mut self, service_id: String, endpoint_info: Vec<u8>, listener: Arc<dyn ConnectionListener>) {
        for medium in self.mediums.values() {
            if !self.config.medium_enabled(medium.tag()) {
                continue;
            }
            let _ = medium.advertise(&service_id, &endpoint_info);
            let svc = service_id.clone();
            let cmd_tx = self.cmd_tx.clone();
            let medium_tag = medium.tag();
            let _ = medium.start_accepting(
                &service_id,
                Box::new(move |socket| {
                    let _ = cmd_tx.send(Command::IncomingSocket { service_id: svc.clone(), socket, medium_tag });
                }),
            );
        }
        self.advertising.insert(service_id, Advertisement { listener });
    }

    fn stop_advertising(&mut self, service_id: &str) {
        for medium in self.mediums.values() {
            let _ = medium.stop_accepting(service_id);
            let _ = medium.stop_advertising(service_id);
        }
        self.advertising.remove(service_id);
    }

    fn start_discovery(&mut self, service_id: String, listener: Arc<dyn DiscoveryListener>) {
        for medium in self.mediums.values() {
            let svc_found = service_id.clone();
            let svc_lost = service_id.clone();
            let cmd_tx_found = self.cmd_tx.clone();
            let cmd_tx_lost = self.cmd_tx.clone();
            let medium_tag = medium.tag();
            let _ = medium.start_scanning(
                &service_id,
                Box::new(move |found| {
                    let _ = cmd_tx_found.send(Command::EndpointFound { service_id: svc_found.clone(), found });
                }),
                Box::new(move |endpoint_id| {
                    let _ = cmd_tx_lost.send(Command::EndpointLost {
                        service_id: svc_lost.clone(),
                        endpoint_id,
                        medium_tag,
                    });
                }),
            );
        }
        self.discovering.insert(service_id, listener);
    }

    fn stop_discovery(&mut self, service_id: &str) {
        for medium in self.mediums.values() {
            let _ = medium.stop_scanning(service_id);
        }
        self.discovering.remove(service_id);
    }

    fn request_connection(
        &mut self,
        endpoint_id: String,
        local_endpoint_info: Vec<u8>,
        listener: Arc<dyn ConnectionListener>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        if self.pending.contains_key(&endpoint_id) || self.channel_manager.get_channel(&endpoint_id).is_some() {
            tracing::warn!(endpoint_id = %endpoint_id, "RequestConnection for an endpoint already connecting or connected");
            let _ = reply.send(Err(Error::simple(ErrorKind::AlreadyConnectedToEndpoint)));
            return;
        }
        let Some(discovered) = self.discovered.get(&endpoint_id) else {
            tracing::warn!(endpoint_id = %endpoint_id, "RequestConnection for an undiscovered endpoint");
            let _ = reply.send(Err(Error::simple(ErrorKind::EndpointUnknown)));
            return;
        };
        let Some(medium_tag) = discovered.best_medium() else {
            tracing::warn!(endpoint_id = %endpoint_id, "discovered endpoint has no usable medium");
            let _ = reply.send(Err(Error::simple(ErrorKind::EndpointUnknown)));
            return;
        };
        let Some(medium) = self.mediums.get(&medium_tag).cloned() else {
            let _ = reply.send(Err(Error::simple(ErrorKind::EndpointUnknown)));
            return;
        };
        let Some(remote) = discovered.remote_for(medium_tag) else {
            let _ = reply.send(Err(Error::simple(ErrorKind::EndpointUnknown)));
            return;
        };
        let service_id = discovered.service_id.clone();

        let nonce = next_nonce();
        let cancel = Arc::new(AtomicBool::new(false));
        self.pending.insert(
            endpoint_id.clone(),
            PendingConnection {
                channel: None,
                context: None,
                medium_tag,
                nonce,
                is_incoming: false,
                cancel: cancel.clone(),
                local_accept: None,
                remote_accept: None,
                state: ConnectionState::Handshaking,
                listener,
                reader_stop: Arc::new(AtomicBool::new(false)),
                pending_result: Some(reply),
            },
        );
        spawn_outgoing_handshake(
            self.cmd_tx.clone(),
            endpoint_id,
            self.local_endpoint_id.clone(),
            local_endpoint_info,
            medium,
            medium_tag,
            service_id,
            remote,
            cancel,
            nonce,
            self.options,
        );
    }

    fn on_incoming_request(&mut self, service_id: String, endpoint_id: String, request: ConnectionRequest, channel: Arc<EndpointChannel>) {
        if let Some(existing) = self.pending.get(&endpoint_id) {
            if !existing.is_incoming && existing.channel.is_none() {
                // higher local nonce wins: keep ours and close the incoming
                // attempt; lower local nonce loses: cancel ours and let the
                // incoming attempt proceed; equal nonces: close both, the
                // devices will retry.
                match existing.nonce.cmp(&request.nonce) {
                    std::cmp::Ordering::Greater => {
                        tracing::info!(endpoint_id = %endpoint_id, "tie-break: higher local nonce wins, keeping outgoing attempt");
                        channel.close();
                        return;
                    }
                    std::cmp::Ordering::Less => {
                        tracing::info!(endpoint_id = %endpoint_id, "tie-break: lower local nonce loses, favoring inbound request");
                        existing.cancel.store(true, Ordering::Release);
                        if let Some(mut cancelled) = self.pending.remove(&endpoint_id) {
                            if let Some(reply) = cancelled.pending_result.take() {
                                let _ = reply.send(Err(Error::simple(ErrorKind::Cancelled)));
                            }
                        }
                    }
                    std::cmp::Ordering::Equal => {
                        tracing::info!(endpoint_id = %endpoint_id, "tie-break: equal nonces, closing both pending attempts");
                        existing.cancel.store(true, Ordering::Release);
                        if let Some(mut cancelled) = self.pending.remove(&endpoint_id) {
                            if let Some(reply) = cancelled.pending_result.take() {
                                let _ = reply.send(Err(Error::simple(ErrorKind::Cancelled)));
                            }
                        }
                        channel.close();
                        return;
                    }
                }
            } else {
                tracing::warn!(endpoint_id = %endpoint_id, "duplicate connection request for an already-pending endpoint");
                channel.close();
                return;
            }
        }
        let Some(advertisement) = self.advertising.get(&service_id) else {
            channel.close();
            return;
        };
        if self.config.enforce_topology_constraints
            && self.config.strategy == crate::config::Strategy::PointToPoint
            && (self.channel_manager.connected_endpoint_count() > 0
                || self.pending.values().any(|p| p.is_incoming))
        {
            tracing::info!(endpoint_id = %endpoint_id, "topology constraints reject a second incoming connection under point-to-point");
            channel.close();
            return;
        }
        self.pending.insert(
            endpoint_id,
            PendingConnection {
                channel: Some(channel),
                context: None,
                medium_tag: request.supported_mediums.first().copied().unwrap_or(MediumTag::WifiLan),
                nonce: request.nonce,
                is_incoming: true,
                cancel: Arc::new(AtomicBool::new(false)),
                local_accept: None,
                remote_accept: None,
                state: ConnectionState::Handshaking,
                listener: advertisement.listener.clone(),
                reader_stop: Arc::new(AtomicBool::new(false)),
                pending_result: None,
            },
        );
    }

    fn on_handshake_done(&mut self, endpoint_id: String, channel: Arc<EndpointChannel>, outcome: EncryptionOutcome) {
        let Some(pending) = self.pending.get_mut(&endpoint_id) else {
            tracing::warn!(endpoint_id = %endpoint_id, "handshake completed for an unknown or cancelled connection");
            channel.close();
            return;
        };
        channel.enable_encryption(outcome.context.clone());
        pending.channel = Some(channel.clone());
        pending.context = Some(outcome.context.clone());
        pending.recompute_state();
        let stop = pending.reader_stop.clone();
        pending.listener.on_connection_initiated(&endpoint_id, &outcome);
        spawn_pending_reader(self.cmd_tx.clone(), endpoint_id, channel, stop);
    }

    fn on_handshake_failed(&mut self, endpoint_id: &str) {
        if let Some(mut pending) = self.pending.remove(endpoint_id) {
            if let Some(channel) = &pending.channel {
                channel.close();
            }
            pending.listener.on_connection_result(endpoint_id, false);
            if let Some(reply) = pending.pending_result.take() {
                let _ = reply.send(Err(Error::simple(ErrorKind::AuthenticationFailure)));
            }
        }
    }

    fn on_pending_frame(&mut self, endpoint_id: &str, frame: Frame) {
        match frame {
            Frame::ConnectionResponse(response) => {
                let Some(pending) = self.pending.get_mut(endpoint_id) else { return };
                pending.remote_accept = Some(response.is_accept());
                pending.recompute_state();
                self.evaluate(endpoint_id);
            }
            Frame::Disconnection => {
                self.discard_pending(endpoint_id, "peer disconnected while connection was pending");
            }
            other => {
                tracing::debug!(endpoint_id = %endpoint_id, frame = ?other, "unexpected frame while connection pending");
            }
        }
    }

    fn set_local_decision(&mut self, endpoint_id: &str, accept: bool) -> Result<()> {
        let Some(pending) = self.pending.get_mut(endpoint_id) else {
            tracing::warn!(endpoint_id = %endpoint_id, "accept/reject for an unknown pending connection");
            return Err(Error::simple(ErrorKind::EndpointUnknown));
        };
        if pending.context.is_none() {
            tracing::warn!(endpoint_id = %endpoint_id, "accept/reject before the handshake completed");
            return Err(Error::simple(ErrorKind::OutOfOrderApiCall));
        }
        pending.local_accept = Some(accept);
        pending.recompute_state();
        if let Some(channel) = &pending.channel {
            let response = if accept { ConnectionResponse::accept() } else { ConnectionResponse::reject() };
            if let Ok(bytes) = frame::encode_frame(&Frame::ConnectionResponse(response)) {
                let _ = channel.write(&bytes);
            }
        }
        self.evaluate(endpoint_id);
        Ok(())
    }

    fn evaluate(&mut self, endpoint_id: &str) {
        let Some(state) = self.pending.get(endpoint_id).map(|p| p.state) else { return };
        match state {
            ConnectionState::Accepted => {
                let mut pending = self.pending.remove(endpoint_id).expect("checked above");
                pending.reader_stop.store(true, Ordering::Release);
                let channel = pending.channel.take().expect("accepted connection has a channel");
                let context = pending.context.take().expect("accepted connection is encrypted");
                self.channel_manager.register_channel(endpoint_id, channel.clone(), true);
                self.channel_manager.encrypt_channel_for_endpoint(endpoint_id, context);
                self.endpoint_manager.register_endpoint(
                    endpoint_id,
                    channel,
                    pending.listener.clone(),
                    KeepAliveConfig { interval: self.options.interval(), timeout: self.options.timeout() },
                );
                pending.listener.on_connection_result(endpoint_id, true);
                if let Some(reply) = pending.pending_result.take() {
                    let _ = reply.send(Ok(()));
                }
                tracing::info!(endpoint_id = %endpoint_id, "connection accepted by both sides");
            }
            ConnectionState::Rejected => {
                let mut pending = self.pending.remove(endpoint_id).expect("checked above");
                pending.reader_stop.store(true, Ordering::Release);
                pending.listener.on_connection_result(endpoint_id, false);
                if let Some(reply) = pending.pending_result.take() {
                    let _ = reply.send(Err(Error::simple(ErrorKind::ConnectionRejected)));
                }
                let cmd_tx = self.cmd_tx.clone();
                let endpoint_id = endpoint_id.to_owned();
                let channel = pending.channel;
                thread::Builder::new()
                    .name(format!("pcp-reject-delay-{}", endpoint_id))
                    .spawn(move || {
                        thread::sleep(REJECTED_CONNECTION_CLOSE_DELAY);
                        if let Some(channel) = channel {
                            channel.close();
                        }
                        let _ = cmd_tx.send(Command::DiscardRejected { endpoint_id });
                    })
                    .expect("spawn rejected-connection discard thread");
            }
            _ => {}
        }
    }

    fn discard_pending(&mut self, endpoint_id: &str, reason: &str) {
        if let Some(mut pending) = self.pending.remove(endpoint_id) {
            pending.reader_stop.store(true, Ordering::Release);
            if let Some(channel) = &pending.channel {
                channel.close();
            }
            pending.listener.on_connection_result(endpoint_id, false);
            if let Some(reply) = pending.pending_result.take() {
                let _ = reply.send(Err(Error::simple(ErrorKind::EndpointIoError)));
            }
            tracing::info!(endpoint_id = %endpoint_id, reason, "pending connection discarded");
        }
    }
}

fn next_nonce() -> i32 {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    i32::from_be_bytes(bytes)
}

struct PcpEncryptionListener {
    cmd_tx: Sender<Command>,
    endpoint_id: String,
    channel: Arc<EndpointChannel>,
}

impl EncryptionResultListener for PcpEncryptionListener {
    fn on_success(&self, outcome: EncryptionOutcome) {
        let _ = self.cmd_tx.send(Command::HandshakeDone {
            endpoint_id: self.endpoint_id.clone(),
            channel: self.channel.clone(),
            outcome,
        });
    }

    fn on_failure(&self, endpoint_id: String, channel: Arc<EndpointChannel>) {
        channel.close();
        let _ = self.cmd_tx.send(Command::HandshakeFailed { endpoint_id });
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_outgoing_handshake(
    cmd_tx: Sender<Command>,
    endpoint_id: String,
    local_endpoint_id: String,
    local_endpoint_info: Vec<u8>,
    medium: Arc<dyn Medium>,
    medium_tag: MediumTag,
    service_id: String,
    remote: Arc<dyn RemoteHandle>,
    cancel: Arc<AtomicBool>,
    nonce: i32,
    options: ConnectionOptions,
) {
    thread::Builder::new()
        .name(format!("pcp-connect-{}", endpoint_id))
        .spawn(move || {
            let cancelled = || cancel.load(Ordering::Acquire);
            let socket = match medium.connect(&service_id, remote.as_ref(), &cancelled) {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::warn!(endpoint_id = %endpoint_id, error = %e, "medium connect failed");
                    let _ = cmd_tx.send(Command::HandshakeFailed { endpoint_id });
                    return;
                }
            };
            let channel = match EndpointChannel::new(service_id.as_str(), endpoint_id.as_str(), medium_tag, socket) {
                Ok(channel) => channel,
                Err(_) => {
                    let _ = cmd_tx.send(Command::HandshakeFailed { endpoint_id });
                    return;
                }
            };
            let request = ConnectionRequest {
                endpoint_id: local_endpoint_id,
                endpoint_info: local_endpoint_info,
                nonce,
                supported_mediums: vec![medium_tag],
                keep_alive_interval_ms: options.keep_alive_interval_ms,
                keep_alive_timeout_ms: options.keep_alive_timeout_ms,
            };
            let bytes = match frame::encode_frame(&Frame::ConnectionRequest(request)) {
                Ok(bytes) => bytes,
                Err(_) => {
                    let _ = cmd_tx.send(Command::HandshakeFailed { endpoint_id });
                    return;
                }
            };
            if channel.write(&bytes).is_err() {
                let _ = cmd_tx.send(Command::HandshakeFailed { endpoint_id });
                return;
            }
            let enc_listener =
                Box::new(PcpEncryptionListener { cmd_tx: cmd_tx.clone(), endpoint_id: endpoint_id.clone(), channel: channel.clone() });
            EncryptionRunner::start_client(endpoint_id, channel, enc_listener);
        })
        .expect("spawn outgoing connect/handshake thread");
}

/// Bound on how long `spawn_incoming_handshake` waits for the initial
/// CONNECTION_REQUEST frame before giving up on a peer that opened a
/// socket and never wrote anything.
const INITIAL_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

fn spawn_incoming_handshake(cmd_tx: Sender<Command>, socket: Box<dyn Socket>, service_id: String, medium_tag: MediumTag) {
    thread::Builder::new()
        .name("pcp-incoming".into())
        .spawn(move || {
            let channel = match EndpointChannel::new(service_id.as_str(), "incoming", medium_tag, socket) {
                Ok(channel) => channel,
                Err(_) => return,
            };

            let dispatched = Arc::new(AtomicBool::new(false));
            {
                let dispatched = dispatched.clone();
                let channel = channel.clone();
                thread::Builder::new()
                    .name("pcp-incoming-watchdog".into())
                    .spawn(move || {
                        thread::sleep(INITIAL_REQUEST_TIMEOUT);
                        if !dispatched.load(Ordering::Acquire) {
                            tracing::warn!("initial CONNECTION_REQUEST not received within the bound, closing channel");
                            channel.close();
                        }
                    })
                    .expect("spawn incoming-request watchdog thread");
            }

            let bytes = match channel.read() {
                Ok(bytes) => bytes,
                Err(_) => {
                    dispatched.store(true, Ordering::Release);
                    return;
                }
            };
            let request = match frame::decode_frame(&bytes) {
                Ok(Frame::ConnectionRequest(request)) => request,
                _ => {
                    dispatched.store(true, Ordering::Release);
                    channel.close();
                    return;
                }
            };
            dispatched.store(true, Ordering::Release);
            let endpoint_id = request.endpoint_id.clone();
            let _ = cmd_tx.send(Command::IncomingRequest {
                service_id: service_id.clone(),
                endpoint_id: endpoint_id.clone(),
                request,
                channel: channel.clone(),
            });
            let enc_listener =
                Box::new(PcpEncryptionListener { cmd_tx: cmd_tx.clone(), endpoint_id: endpoint_id.clone(), channel: channel.clone() });
            EncryptionRunner::start_server(endpoint_id, channel, enc_listener);
        })
        .expect("spawn incoming handshake thread");
}

fn spawn_pending_reader(cmd_tx: Sender<Command>, endpoint_id: String, channel: Arc<EndpointChannel>, stop: Arc<AtomicBool>) {
    thread::Builder::new()
        .name(format!("pcp-pending-reader-{}", endpoint_id))
        .spawn(move || loop {
            if stop.load(Ordering::Acquire) {
                return;
            }
            match channel.read() {
                Ok(bytes) => {
                    if let Ok(frame) = frame::decode_frame(&bytes) {
                        if stop.load(Ordering::Acquire) {
                            return;
                        }
                        let _ = cmd_tx.send(Command::PendingFrame { endpoint_id: endpoint_id.clone(), frame });
                    }
                }
                Err(_) => {
                    if !stop.load(Ordering::Acquire) {
                        let _ = cmd_tx.send(Command::PendingIoError { endpoint_id: endpoint_id.clone() });
                    }
                    return;
                }
            }
        })
        .expect("spawn pending-connection reader thread");
}
