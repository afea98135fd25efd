//! The medium abstraction: everything this crate needs from a concrete
//! radio/transport implementation, and nothing more.
//!
//! Platform medium drivers (real BT/BLE/Wi-Fi scan+advertise+connect) are
//! out of scope for this crate; only the trait contract lives here. Two
//! reference implementations ship alongside it: a TCP-loopback medium
//! (`tcp`, useful for local multi-process demos over real sockets) and an
//! in-memory duplex-pipe medium (`memory`, the default test harness).

pub mod memory;
#[cfg(feature = "medium_tcp")]
pub mod tcp;

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::error::Result;

/// One of the transports a `Medium` implementation may provide.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum MediumTag {
    BluetoothClassic,
    Ble,
    WifiLan,
    WifiDirect,
    WifiHotspot,
    WebRtc,
}

impl MediumTag {
    /// Implementation-defined medium priority, highest bandwidth first.
    /// Used to order `DiscoveredEndpoint` entries and connect attempts.
    pub fn priority(self) -> u8 {
        match self {
            MediumTag::WifiLan => 0,
            MediumTag::WifiDirect => 1,
            MediumTag::WifiHotspot => 2,
            MediumTag::WebRtc => 3,
            MediumTag::Ble => 4,
            MediumTag::BluetoothClassic => 5,
        }
    }
}

impl fmt::Display for MediumTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MediumTag::BluetoothClassic => "BT",
            MediumTag::Ble => "BLE",
            MediumTag::WifiLan => "WIFI_LAN",
            MediumTag::WifiDirect => "WIFI_DIRECT",
            MediumTag::WifiHotspot => "WIFI_HOTSPOT",
            MediumTag::WebRtc => "WEB_RTC",
        };
        f.write_str(s)
    }
}

/// A byte-oriented duplex connection handed to an `EndpointChannel`.
///
/// Mirrors a `TcpStream`: any clone of the handle may read or write
/// independently, and `shutdown` on any clone tears down all of them,
/// which lets `EndpointChannel::close` unblock an in-flight `read`/`write`
/// on a different clone without taking its mutex.
pub trait Socket: io::Read + io::Write + Send + 'static {
    /// Returns an independent handle to the same underlying connection.
    fn try_clone(&self) -> io::Result<Box<dyn Socket>>;

    /// Shuts down both halves of the connection. Idempotent.
    fn shutdown(&self) -> io::Result<()>;
}

/// A remote handle a platform `Medium` can `connect` to, opaque to this
/// crate (an address, a Bluetooth MAC, a signaling-channel peer id, ...).
pub trait RemoteHandle: Send + Sync + fmt::Debug + 'static {}
impl<T: Send + Sync + fmt::Debug + 'static> RemoteHandle for T {}

/// A service discovered on a medium, reported by `start_scanning`.
#[derive(Clone, Debug)]
pub struct FoundEndpoint {
    pub endpoint_id: String,
    pub endpoint_info: Vec<u8>,
    pub medium: MediumTag,
    /// Opaque handle this medium's `connect` accepts to dial this
    /// specific endpoint back.
    pub remote: Arc<dyn RemoteHandle>,
}

/// Platform trait implemented once per concrete transport. The core
/// depends only on this trait; it never talks to real radios directly.
pub trait Medium: Send + Sync + 'static {
    /// Which medium this implementation provides.
    fn tag(&self) -> MediumTag;

    /// Begin advertising `service_id` with the given opaque `endpoint_info`.
    fn advertise(&self, service_id: &str, endpoint_info: &[u8]) -> Result<()>;

    /// Stop advertising `service_id`.
    fn stop_advertising(&self, service_id: &str) -> Result<()>;

    /// Begin accepting incoming connections for `service_id`. Every
    /// accepted socket is delivered to `on_incoming`, which runs on a
    /// medium-owned thread and must not block for long.
    fn start_accepting(
        &self,
        service_id: &str,
        on_incoming: Box<dyn Fn(Box<dyn Socket>) + Send + Sync>,
    ) -> Result<()>;

    /// Stop accepting incoming connections for `service_id`.
    fn stop_accepting(&self, service_id: &str) -> Result<()>;

    /// Begin scanning for `service_id` being advertised by other
    /// endpoints. `on_found`/`on_lost` run on a medium-owned thread and
    /// must not block for long.
    fn start_scanning(
        &self,
        service_id: &str,
        on_found: Box<dyn Fn(FoundEndpoint) + Send + Sync>,
        on_lost: Box<dyn Fn(String) + Send + Sync>,
    ) -> Result<()>;

    /// Stop scanning for `service_id`.
    fn stop_scanning(&self, service_id: &str) -> Result<()>;

    /// Open a connection to `remote`, honoring `cancelled` (checked at
    /// least once before blocking on the network).
    fn connect(
        &self,
        service_id: &str,
        remote: &dyn RemoteHandle,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Box<dyn Socket>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn medium_priority_orders_wifi_lan_first() {
        let mut tags = vec![
            MediumTag::BluetoothClassic,
            MediumTag::WifiLan,
            MediumTag::Ble,
        ];
        tags.sort_by_key(|t| t.priority());
        assert_eq!(tags[0], MediumTag::WifiLan);
    }
}
