//! Process-wide registry of active channels, grounded on
//! `endpoint_channel_manager.cc`'s `ChannelState`/`EndpointData` split: one
//! global mutex, short critical sections, and a clean separation between
//! "the channel" and "the encryption context that outlives any one
//! channel instance".

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::EndpointChannel;
use crate::encryption::EncryptionContext;
use crate::frame::{self, Frame};
use std::sync::Arc;

/// Why an endpoint was unregistered. Threaded all the way to
/// `ConnectionListener::on_disconnected` so callers can distinguish a
/// clean local shutdown from a keep-alive timeout or a peer bounce.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DisconnectReason {
    IoError,
    RemoteDisconnection,
    KeepAliveTimeout,
    LocalShutdown,
    UpgradeFailure,
}

/// Delay after writing a best-effort DISCONNECTION frame, to give the
/// peer a chance to read it before the socket closes.
pub const DATA_TRANSFER_DELAY: Duration = Duration::from_millis(500);

/// Tunables for [`ChannelManager`], split out from [`crate::config::PcpConfig`]
/// since they govern teardown behavior shared by every endpoint rather
/// than PCP-specific policy.
#[derive(Copy, Clone, Debug)]
pub struct ChannelManagerConfig {
    pub data_transfer_delay: Duration,
}

impl Default for ChannelManagerConfig {
    fn default() -> Self {
        Self { data_transfer_delay: DATA_TRANSFER_DELAY }
    }
}

#[derive(Default)]
struct EndpointData {
    channel: Option<Arc<EndpointChannel>>,
    context: Option<Arc<dyn EncryptionContext>>,
}

/// Thread-safe `endpoint_id -> (channel, encryption context)` registry.
pub struct ChannelManager {
    endpoints: Mutex<HashMap<String, EndpointData>>,
    config: ChannelManagerConfig,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::with_config(ChannelManagerConfig::default())
    }

    pub fn with_config(config: ChannelManagerConfig) -> Self {
        Self { endpoints: Mutex::new(HashMap::new()), config }
    }

    /// Inserts (or replaces) the active channel for `endpoint_id`. If an
    /// encryption context was pre-attached via
    /// [`Self::encrypt_channel_for_endpoint`], it is applied to the new
    /// channel when `enable_encryption` is set.
    pub fn register_channel(
        &self,
        endpoint_id: &str,
        channel: Arc<EndpointChannel>,
        enable_encryption: bool,
    ) {
        self.set_active_channel(endpoint_id, channel, enable_encryption);
    }

    /// Same as [`Self::register_channel`], used by the BWU manager during
    /// a bandwidth upgrade. The previously active channel, if any, is
    /// returned so the caller (who owns the handover protocol) can decide
    /// when it is safe to close it.
    pub fn replace_channel(
        &self,
        endpoint_id: &str,
        channel: Arc<EndpointChannel>,
        enable_encryption: bool,
    ) -> Option<Arc<EndpointChannel>> {
        let old = {
            let endpoints = self.endpoints.lock();
            endpoints.get(endpoint_id).and_then(|d| d.channel.clone())
        };
        self.set_active_channel(endpoint_id, channel, enable_encryption);
        old
    }

    fn set_active_channel(
        &self,
        endpoint_id: &str,
        channel: Arc<EndpointChannel>,
        enable_encryption: bool,
    ) {
        let mut endpoints = self.endpoints.lock();
        let entry = endpoints.entry(endpoint_id.to_owned()).or_default();
        entry.channel = Some(channel.clone());
        if enable_encryption {
            if let Some(ctx) = entry.context.clone() {
                channel.enable_encryption(ctx);
            }
        }
    }

    /// Stores `ctx` for `endpoint_id` and, if a channel is already
    /// registered, applies it immediately.
    pub fn encrypt_channel_for_endpoint(&self, endpoint_id: &str, ctx: Arc<dyn EncryptionContext>) {
        let mut endpoints = self.endpoints.lock();
        let entry = endpoints.entry(endpoint_id.to_owned()).or_default();
        entry.context = Some(ctx.clone());
        if let Some(channel) = &entry.channel {
            channel.enable_encryption(ctx);
        }
    }

    pub fn get_channel(&self, endpoint_id: &str) -> Option<Arc<EndpointChannel>> {
        self.endpoints.lock().get(endpoint_id).and_then(|d| d.channel.clone())
    }

    pub fn connected_endpoint_count(&self) -> usize {
        self.endpoints.lock().values().filter(|d| d.channel.is_some()).count()
    }

    /// Best-effort DISCONNECTION write, a fixed flush delay, then the
    /// entry (and its channel) is dropped and closed.
    pub fn unregister(&self, endpoint_id: &str, reason: DisconnectReason) {
        let channel = self.endpoints.lock().remove(endpoint_id).and_then(|d| d.channel);
        let Some(channel) = channel else {
            tracing::debug!(endpoint_id, "unregister called for unknown endpoint");
            return;
        };
        if let Ok(bytes) = frame::encode_frame(&Frame::Disconnection) {
            if let Err(e) = channel.write(&bytes) {
                tracing::debug!(endpoint_id, error = %e, "best-effort DISCONNECTION write failed");
            }
        }
        thread::sleep(self.config.data_transfer_delay);
        channel.close();
        tracing::info!(endpoint_id, ?reason, "endpoint unregistered");
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::AeadEncryptionContext;
    use crate::medium::memory;
    use crate::medium::MediumTag;

    fn new_channel() -> (Arc<EndpointChannel>, Arc<EndpointChannel>) {
        let (a, b) = memory::pair();
        (
            EndpointChannel::new("svc", "a", MediumTag::WifiLan, Box::new(a)).unwrap(),
            EndpointChannel::new("svc", "b", MediumTag::WifiLan, Box::new(b)).unwrap(),
        )
    }

    #[test]
    fn get_channel_returns_most_recently_registered() {
        let mgr = ChannelManager::new();
        let (c1, _p1) = new_channel();
        let (c2, _p2) = new_channel();
        mgr.register_channel("e1", c1.clone(), true);
        assert!(Arc::ptr_eq(&mgr.get_channel("e1").unwrap(), &c1));
        mgr.register_channel("e1", c2.clone(), true);
        assert!(Arc::ptr_eq(&mgr.get_channel("e1").unwrap(), &c2));
    }

    #[test]
    fn replace_channel_preserves_encryption_context() {
        let mgr = ChannelManager::new();
        let (c1, _p1) = new_channel();
        let (c2, _p2) = new_channel();
        let ctx = Arc::new(AeadEncryptionContext::derive(&[9u8; 32]).unwrap());
        mgr.register_channel("e1", c1.clone(), true);
        mgr.encrypt_channel_for_endpoint("e1", ctx);
        assert!(c1.is_encrypted());

        let old = mgr.replace_channel("e1", c2.clone(), true);
        assert!(Arc::ptr_eq(&old.unwrap(), &c1));
        assert!(c2.is_encrypted());
    }

    #[test]
    fn unregister_removes_the_entry() {
        let mgr = ChannelManager::new();
        let (c1, peer) = new_channel();
        mgr.register_channel("e1", c1, true);
        mgr.unregister("e1", DisconnectReason::LocalShutdown);
        assert!(mgr.get_channel("e1").is_none());
        drop(peer);
    }
}
