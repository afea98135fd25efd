//! Tunable knobs for the PCP handler, channel manager, and keep-alive
//! scheduler: a plain struct of public fields plus a couple of
//! constructors, rather than a builder -- this crate has few enough
//! knobs that a builder would only add ceremony.

use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};
use crate::medium::MediumTag;

/// Default keep-alive cadence, used when a `CONNECTION_REQUEST` does not
/// override it.
pub const DEFAULT_KEEP_ALIVE_INTERVAL_MS: i32 = 5_000;
pub const DEFAULT_KEEP_ALIVE_TIMEOUT_MS: i32 = 30_000;

/// Delay before discarding a rejected pending connection's bookkeeping,
/// giving both sides time to flush their `REJECT` response.
pub const REJECTED_CONNECTION_CLOSE_DELAY: Duration = Duration::from_secs(2);

#[derive(Copy, Clone, Debug)]
pub struct ConnectionOptions {
    pub keep_alive_interval_ms: i32,
    pub keep_alive_timeout_ms: i32,
    /// Whether an inbound-accepted connection should automatically kick
    /// off a bandwidth upgrade to the best available medium.
    pub auto_upgrade_bandwidth: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            keep_alive_interval_ms: DEFAULT_KEEP_ALIVE_INTERVAL_MS,
            keep_alive_timeout_ms: DEFAULT_KEEP_ALIVE_TIMEOUT_MS,
            auto_upgrade_bandwidth: true,
        }
    }
}

impl ConnectionOptions {
    pub fn validate(&self) -> Result<()> {
        if self.keep_alive_interval_ms <= 0 || self.keep_alive_timeout_ms <= 0 {
            return Err(Error::wrapped(
                ErrorKind::Error,
                "keep-alive interval and timeout must be positive",
            ));
        }
        if self.keep_alive_interval_ms >= self.keep_alive_timeout_ms {
            return Err(Error::wrapped(
                ErrorKind::Error,
                "keep-alive interval must be smaller than its timeout",
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms as u64)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms as u64)
    }
}

/// The connection topology this session advertises/discovers under.
/// Only `PointToPoint` is fully enforced by the PCP handler; `Star` and
/// `Cluster` are accepted but their topology constraints (roles beyond
/// two-party point-to-point, multi-advertiser star enforcement) are
/// left to a future revision.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Strategy {
    PointToPoint,
    Star,
    Cluster,
}

/// Service-wide knobs governing which mediums are used and how strictly
/// topology is enforced: one struct, a `Default` impl with documented
/// values, and a `validate` pass run once at construction.
#[derive(Clone, Debug)]
pub struct PcpConfig {
    pub strategy: Strategy,
    pub allowed_mediums: Vec<MediumTag>,
    pub low_power: bool,
    pub enforce_topology_constraints: bool,
    /// Enables Bluetooth-MAC-derived endpoint synthesis. Left as a plain
    /// knob rather than wired up to synthesis logic: the triggering
    /// conditions are medium-layer conveniences that are
    /// implementation-defined per platform and not worth hard-coding
    /// here.
    pub remote_bluetooth_mac_address: Option<String>,
    pub enable_webrtc_listening: bool,
    pub enable_bluetooth_listening: bool,
}

impl Default for PcpConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::PointToPoint,
            allowed_mediums: vec![
                MediumTag::WifiLan,
                MediumTag::WifiDirect,
                MediumTag::WifiHotspot,
                MediumTag::WebRtc,
                MediumTag::Ble,
                MediumTag::BluetoothClassic,
            ],
            low_power: false,
            enforce_topology_constraints: true,
            remote_bluetooth_mac_address: None,
            enable_webrtc_listening: false,
            enable_bluetooth_listening: false,
        }
    }
}

impl PcpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.allowed_mediums.is_empty() {
            return Err(Error::wrapped(ErrorKind::Error, "allowed_mediums must not be empty"));
        }
        Ok(())
    }

    /// Whether a medium listens for incoming connections/scans given the
    /// service-wide gates (`allowed_mediums` plus the two listening
    /// opt-ins for the radios that default to off).
    pub fn medium_enabled(&self, tag: MediumTag) -> bool {
        if !self.allowed_mediums.contains(&tag) {
            return false;
        }
        match tag {
            MediumTag::WebRtc => self.enable_webrtc_listening,
            MediumTag::Ble | MediumTag::BluetoothClassic => self.enable_bluetooth_listening,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ConnectionOptions::default().validate().unwrap();
        PcpConfig::default().validate().unwrap();
    }

    #[test]
    fn interval_must_be_smaller_than_timeout() {
        let opts = ConnectionOptions { keep_alive_interval_ms: 30_000, keep_alive_timeout_ms: 5_000 };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn empty_allowed_mediums_is_rejected() {
        let cfg = PcpConfig { allowed_mediums: Vec::new(), ..PcpConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn webrtc_and_bluetooth_listening_default_off() {
        let cfg = PcpConfig::default();
        assert!(!cfg.medium_enabled(MediumTag::WebRtc));
        assert!(!cfg.medium_enabled(MediumTag::Ble));
        assert!(cfg.medium_enabled(MediumTag::WifiLan));
    }
}
