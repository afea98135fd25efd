//! Callback traits delivered across the public API boundary. Kept as
//! plain `Send + Sync` traits rather than channels: callers generally
//! want to react to a connection event on their own thread of choice.

use std::sync::Arc;

use crate::channel_manager::DisconnectReason;
use crate::encryption::EncryptionOutcome;
use crate::medium::{FoundEndpoint, MediumTag};

/// Reacts to advertisement-side and discovery-side connection lifecycle
/// events for one endpoint.
pub trait ConnectionListener: Send + Sync + 'static {
    /// An incoming or outgoing connection authenticated and is waiting on
    /// `AcceptConnection`/`RejectConnection` from this side.
    fn on_connection_initiated(&self, endpoint_id: &str, outcome: &EncryptionOutcome) {
        let _ = (endpoint_id, outcome);
    }

    /// Both sides accepted; the endpoint is now handed to the
    /// `EndpointManager` and ready for `send_payload`.
    fn on_connection_result(&self, endpoint_id: &str, accepted: bool);

    /// The endpoint was torn down after having been connected.
    fn on_disconnected(&self, endpoint_id: &str, reason: DisconnectReason);

    /// The active medium for this endpoint changed, e.g. after a
    /// bandwidth upgrade completed.
    fn on_bandwidth_changed(&self, endpoint_id: &str, medium: MediumTag) {
        let _ = (endpoint_id, medium);
    }
}

/// Reacts to discovery-side endpoint presence, independent of whether a
/// connection is ever attempted.
pub trait DiscoveryListener: Send + Sync + 'static {
    fn on_endpoint_found(&self, endpoint_id: &str, info: &FoundEndpoint);
    fn on_endpoint_lost(&self, endpoint_id: &str);
}

/// Opaque payload delivery, passed through from `Frame::PayloadTransfer`
/// without interpretation (chunking and reassembly are out of scope).
pub trait PayloadListener: Send + Sync + 'static {
    fn on_payload_received(&self, endpoint_id: &str, payload: Vec<u8>);
}

pub type SharedConnectionListener = Arc<dyn ConnectionListener>;
pub type SharedDiscoveryListener = Arc<dyn DiscoveryListener>;
pub type SharedPayloadListener = Arc<dyn PayloadListener>;
