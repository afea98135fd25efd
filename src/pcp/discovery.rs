//! The cache of endpoints currently visible on at least one medium.

use std::collections::HashMap;
use std::sync::Arc;

use crate::medium::{FoundEndpoint, MediumTag, RemoteHandle};

#[derive(Clone, Debug)]
pub struct DiscoveredEndpoint {
    pub endpoint_id: String,
    pub endpoint_info: Vec<u8>,
    pub service_id: String,
    pub mediums: Vec<MediumTag>,
    /// Per-medium dial-back handle, populated as each medium reports the
    /// endpoint; `remote_for` looks one up by tag.
    remotes: Vec<(MediumTag, Arc<dyn RemoteHandle>)>,
}

impl DiscoveredEndpoint {
    /// The medium a connection attempt should prefer, highest bandwidth
    /// first.
    pub fn best_medium(&self) -> Option<MediumTag> {
        self.mediums.iter().copied().min_by_key(|m| m.priority())
    }

    pub fn remote_for(&self, medium: MediumTag) -> Option<Arc<dyn RemoteHandle>> {
        self.remotes.iter().find(|(m, _)| *m == medium).map(|(_, r)| r.clone())
    }
}

/// `endpoint_id -> DiscoveredEndpoint`, merging reports from more than one
/// medium rather than overwriting them, since a phone advertising on both
/// BLE and Wi-Fi LAN is still one logical endpoint.
#[derive(Default)]
pub struct DiscoveredEndpointCache {
    endpoints: HashMap<String, DiscoveredEndpoint>,
}

/// What `on_found` learned about an endpoint, driving whether the
/// discovery listener sees `OnEndpointFound`, a lost/found pair, or
/// nothing at all.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FoundEvent {
    /// First medium to report this endpoint: `OnEndpointFound` should fire.
    New,
    /// An already-known medium is now reporting different `endpoint_info`
    /// for the same endpoint: the stale entry must be reported lost before
    /// the fresh one is reported found.
    InfoChanged,
    /// Either a new medium for an already-known endpoint with unchanged
    /// info, or a repeat report: nothing to tell the listener.
    Unchanged,
}

impl DiscoveredEndpointCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a medium's report of `endpoint_id` into the cache and
    /// reports what changed. `endpoint_info` is tracked per medium: if a
    /// medium that already reported this endpoint now reports different
    /// info, the caller must emit `OnEndpointLost` before `OnEndpointFound`
    /// for the refreshed entry.
    pub fn on_found(&mut self, endpoint_id: &str, service_id: &str, found: FoundEndpoint) -> FoundEvent {
        let is_new = !self.endpoints.contains_key(endpoint_id);
        let entry = self.endpoints.entry(endpoint_id.to_owned()).or_insert_with(|| DiscoveredEndpoint {
            endpoint_id: endpoint_id.to_owned(),
            endpoint_info: found.endpoint_info.clone(),
            service_id: service_id.to_owned(),
            mediums: Vec::new(),
            remotes: Vec::new(),
        });

        let existing_medium = entry.mediums.contains(&found.medium);
        let info_changed = existing_medium && entry.endpoint_info != found.endpoint_info;

        entry.endpoint_info = found.endpoint_info;
        if !existing_medium {
            entry.mediums.push(found.medium);
        }
        if let Some(slot) = entry.remotes.iter_mut().find(|(m, _)| *m == found.medium) {
            slot.1 = found.remote;
        } else {
            entry.remotes.push((found.medium, found.remote));
        }

        if is_new {
            FoundEvent::New
        } else if info_changed {
            FoundEvent::InfoChanged
        } else {
            FoundEvent::Unchanged
        }
    }

    /// Returns `true` if `endpoint_id` is no longer visible on any medium
    /// (i.e. `OnEndpointLost` should fire).
    pub fn on_lost(&mut self, endpoint_id: &str, medium: MediumTag) -> bool {
        let Some(entry) = self.endpoints.get_mut(endpoint_id) else { return false };
        entry.mediums.retain(|m| *m != medium);
        if entry.mediums.is_empty() {
            self.endpoints.remove(endpoint_id);
            true
        } else {
            false
        }
    }

    pub fn get(&self, endpoint_id: &str) -> Option<&DiscoveredEndpoint> {
        self.endpoints.get(endpoint_id)
    }

    pub fn remove(&mut self, endpoint_id: &str) -> Option<DiscoveredEndpoint> {
        self.endpoints.remove(endpoint_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn found(medium: MediumTag) -> FoundEndpoint {
        FoundEndpoint {
            endpoint_id: "e1".into(),
            endpoint_info: b"info".to_vec(),
            medium,
            remote: Arc::new("e1".to_string()),
        }
    }

    #[test]
    fn second_medium_for_same_endpoint_does_not_refire_found() {
        let mut cache = DiscoveredEndpointCache::new();
        assert_eq!(cache.on_found("e1", "svc", found(MediumTag::Ble)), FoundEvent::New);
        assert_eq!(cache.on_found("e1", "svc", found(MediumTag::WifiLan)), FoundEvent::Unchanged);
        assert_eq!(cache.get("e1").unwrap().mediums.len(), 2);
    }

    #[test]
    fn changed_info_on_an_already_known_medium_reports_info_changed() {
        let mut cache = DiscoveredEndpointCache::new();
        assert_eq!(cache.on_found("e1", "svc", found(MediumTag::Ble)), FoundEvent::New);
        let mut changed = found(MediumTag::Ble);
        changed.endpoint_info = b"new-info".to_vec();
        assert_eq!(cache.on_found("e1", "svc", changed), FoundEvent::InfoChanged);
    }

    #[test]
    fn lost_on_last_medium_removes_the_endpoint() {
        let mut cache = DiscoveredEndpointCache::new();
        cache.on_found("e1", "svc", found(MediumTag::Ble));
        cache.on_found("e1", "svc", found(MediumTag::WifiLan));
        assert!(!cache.on_lost("e1", MediumTag::Ble));
        assert!(cache.get("e1").is_some());
        assert!(cache.on_lost("e1", MediumTag::WifiLan));
        assert!(cache.get("e1").is_none());
    }

    #[test]
    fn best_medium_prefers_wifi_lan_over_ble() {
        let mut cache = DiscoveredEndpointCache::new();
        cache.on_found("e1", "svc", found(MediumTag::Ble));
        cache.on_found("e1", "svc", found(MediumTag::WifiLan));
        assert_eq!(cache.get("e1").unwrap().best_medium(), Some(MediumTag::WifiLan));
    }
}
