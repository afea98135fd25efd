//! Peer-to-peer connection establishment and framed data transport core
//! for Nearby Connections: advertise/discover, the symmetric
//! accept/reject handshake, an AEAD-secured frame channel, keep-alive
//! supervision, and bandwidth upgrade -- everything above the raw radio
//! and below payload chunking.
//!
//! One `pub mod` per subsystem at the crate root, plus a single explicit
//! context struct ([`NearbyConnectionsCore`]) gathering the singletons a
//! session needs, in place of process-wide `init`/`InitGuard` globals --
//! this crate has no async runtime to spin up, and several independent
//! sessions in one process are a reasonable thing to want.

pub mod bwu;
pub mod channel;
pub mod channel_manager;
pub mod config;
pub mod dispatch;
pub mod encryption;
pub mod endpoint_manager;
pub mod error;
pub mod frame;
pub mod listeners;
pub mod medium;
pub mod pcp;

use std::sync::Arc;

use channel_manager::{ChannelManager, ChannelManagerConfig};
use config::{ConnectionOptions, PcpConfig};
use dispatch::FrameProcessorRegistry;
use endpoint_manager::EndpointManager;
use error::Result;
use frame::{Frame, FrameType};
use listeners::{ConnectionListener, DiscoveryListener, PayloadListener, SharedPayloadListener};
use medium::{FoundEndpoint, Medium, MediumTag};

use bwu::BwuManager;
use pcp::PcpHandler;

/// Bridges `Frame::PayloadTransfer` frames off the dispatch registry to a
/// user-supplied [`PayloadListener`], so a payload-chunking layer built
/// on top of this crate never needs to reach back into
/// `EndpointManager` internals.
struct PayloadFrameProcessor {
    listener: SharedPayloadListener,
}

impl dispatch::FrameProcessor for PayloadFrameProcessor {
    fn process(&self, frame: Frame, endpoint_id: &str, _medium_tag: MediumTag) {
        if let Frame::PayloadTransfer(bytes) = frame {
            self.listener.on_payload_received(endpoint_id, bytes);
        }
    }
}

/// Every knob `NearbyConnectionsCore::new` validates up front: one plain
/// struct of constructor inputs rather than a builder.
pub struct CoreConfig {
    pub local_endpoint_id: String,
    pub mediums: Vec<Arc<dyn Medium>>,
    pub connection_options: ConnectionOptions,
    pub pcp_config: PcpConfig,
    pub channel_manager_config: ChannelManagerConfig,
    /// If set, `Frame::PayloadTransfer` frames are routed here. Left
    /// `None` when this crate is embedded by a payload layer that
    /// registers its own `FrameProcessor` directly.
    pub payload_listener: Option<SharedPayloadListener>,
}

impl CoreConfig {
    pub fn new(local_endpoint_id: impl Into<String>, mediums: Vec<Arc<dyn Medium>>) -> Self {
        Self {
            local_endpoint_id: local_endpoint_id.into(),
            mediums,
            connection_options: ConnectionOptions::default(),
            pcp_config: PcpConfig::default(),
            channel_manager_config: ChannelManagerConfig::default(),
            payload_listener: None,
        }
    }
}

/// One client session: the PCP handler, `ChannelManager`,
/// `EndpointManager`, and `BwuManager` singletons wired together, plus
/// the `FrameProcessorRegistry` they share. Construct one per
/// process/session; nothing here is a process-wide global.
pub struct NearbyConnectionsCore {
    pcp: Arc<PcpHandler>,
    bwu: Arc<BwuManager>,
    channel_manager: Arc<ChannelManager>,
    endpoint_manager: Arc<EndpointManager>,
}

impl NearbyConnectionsCore {
    /// Validates `config` and wires up a new session. Mediums are shared
    /// between the PCP handler (advertise/discover/connect) and the BWU
    /// manager (upgrade targets); both filter to `config.pcp_config.allowed_mediums`.
    pub fn new(config: CoreConfig) -> Result<Self> {
        config.connection_options.validate()?;
        config.pcp_config.validate()?;

        let channel_manager = Arc::new(ChannelManager::with_config(config.channel_manager_config));
        let dispatch = Arc::new(FrameProcessorRegistry::new());
        let endpoint_manager = EndpointManager::new(channel_manager.clone(), dispatch.clone());

        let bwu = BwuManager::new(config.mediums.clone(), channel_manager.clone(), endpoint_manager.clone());
        dispatch.register(FrameType::BwuNegotiation, bwu.clone());

        if let Some(payload_listener) = config.payload_listener {
            dispatch.register(
                FrameType::PayloadTransfer,
                Arc::new(PayloadFrameProcessor { listener: payload_listener }),
            );
        }

        let pcp = PcpHandler::new(
            config.local_endpoint_id,
            config.mediums,
            channel_manager.clone(),
            dispatch,
            endpoint_manager.clone(),
            config.connection_options,
            config.pcp_config,
        );

        Ok(Self { pcp, bwu, channel_manager, endpoint_manager })
    }

    pub fn start_advertising(
        &self,
        service_id: impl Into<String>,
        endpoint_info: Vec<u8>,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<()> {
        self.pcp.start_advertising(service_id, endpoint_info, listener)
    }

    pub fn stop_advertising(&self, service_id: impl Into<String>) -> Result<()> {
        self.pcp.stop_advertising(service_id)
    }

    pub fn start_discovery(&self, service_id: impl Into<String>, listener: Arc<dyn DiscoveryListener>) -> Result<()> {
        self.pcp.start_discovery(service_id, listener)
    }

    pub fn stop_discovery(&self, service_id: impl Into<String>) -> Result<()> {
        self.pcp.stop_discovery(service_id)
    }

    /// Blocks until `endpoint_id`'s connection attempt reaches a terminal
    /// state (connected, rejected, or failed).
    pub fn request_connection(
        &self,
        endpoint_id: impl Into<String>,
        local_endpoint_info: Vec<u8>,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<()> {
        self.pcp.request_connection(endpoint_id, local_endpoint_info, listener)
    }

    pub fn accept_connection(&self, endpoint_id: impl Into<String>) -> Result<()> {
        self.pcp.accept_connection(endpoint_id)
    }

    pub fn reject_connection(&self, endpoint_id: impl Into<String>) -> Result<()> {
        self.pcp.reject_connection(endpoint_id)
    }

    /// Delivered by a `Medium`'s scan callback, forwarded to the PCP
    /// handler's discovery cache.
    pub fn on_endpoint_found(&self, service_id: impl Into<String>, found: FoundEndpoint) {
        self.pcp.on_endpoint_found(service_id, found);
    }

    pub fn on_endpoint_lost(&self, service_id: impl Into<String>, endpoint_id: impl Into<String>, medium_tag: MediumTag) {
        self.pcp.on_endpoint_lost(service_id, endpoint_id, medium_tag);
    }

    pub fn send_payload(&self, endpoint_id: &str, payload: Vec<u8>) -> Result<()> {
        self.endpoint_manager.send_payload(endpoint_id, payload)
    }

    /// Starts a bandwidth upgrade for an already-connected endpoint onto
    /// `target_medium`. A no-op if the endpoint is not connected or an
    /// upgrade is already in flight.
    pub fn upgrade_bandwidth(&self, endpoint_id: impl Into<String>, target_medium: MediumTag) {
        self.bwu.initiate_upgrade(
            endpoint_id,
            target_medium,
            endpoint_manager::KeepAliveConfig {
                interval: std::time::Duration::from_millis(config::DEFAULT_KEEP_ALIVE_INTERVAL_MS as u64),
                timeout: std::time::Duration::from_millis(config::DEFAULT_KEEP_ALIVE_TIMEOUT_MS as u64),
            },
        );
    }

    pub fn is_connected(&self, endpoint_id: &str) -> bool {
        self.endpoint_manager.is_registered(endpoint_id)
    }

    pub fn connected_endpoint_count(&self) -> usize {
        self.channel_manager.connected_endpoint_count()
    }
}
