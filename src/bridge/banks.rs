//! Track, device and parameter banks
//!
//! Built once from the host at startup, bounded by the configured sizes. Every
//! capability's properties are observed; observers push listener callbacks into
//! the deferred queue unless the capability is being calibrated.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashSet;
use tracing::{debug, info};

use super::queue::QueueProducer;
use super::registry::{Deferred, SharedRegistry};
use crate::config::BanksConfig;
use crate::error::{BridgeError, HostError};
use crate::host::{Capability, CapabilityId, CapabilityInfo, Host};

pub struct Banks {
    tracks: Vec<Arc<dyn Capability>>,
    devices: HashMap<CapabilityId, Vec<Arc<dyn Capability>>>,
    parameters: HashMap<CapabilityId, Vec<Arc<dyn Capability>>>,
    transport: Arc<dyn Capability>,
    by_id: HashMap<CapabilityId, Arc<dyn Capability>>,
}

impl Banks {
    /// Walk the host's tracks, devices and parameters up to the limits
    pub fn build(host: &dyn Host, limits: &BanksConfig) -> Self {
        let transport = host.transport();
        let tracks = host.tracks(limits.max_tracks);

        let mut by_id: HashMap<CapabilityId, Arc<dyn Capability>> = HashMap::new();
        let mut devices = HashMap::new();
        let mut parameters = HashMap::new();

        by_id.insert(transport.id(), transport.clone());

        for track in &tracks {
            by_id.insert(track.id(), track.clone());

            let track_devices = host.devices(track.id(), limits.max_devices);
            for device in &track_devices {
                by_id.insert(device.id(), device.clone());

                let device_params = host.parameters(device.id(), limits.max_parameters);
                for param in &device_params {
                    by_id.insert(param.id(), param.clone());
                }
                parameters.insert(device.id(), device_params);
            }
            devices.insert(track.id(), track_devices);
        }

        info!(
            tracks = tracks.len(),
            devices = devices.values().map(Vec::len).sum::<usize>(),
            parameters = parameters.values().map(Vec::len).sum::<usize>(),
            "Banks built"
        );

        Self {
            tracks,
            devices,
            parameters,
            transport,
            by_id,
        }
    }

    /// Observe every property of every capability
    ///
    /// Returns the number of observers installed.
    pub fn wire(
        &self,
        registry: &SharedRegistry,
        sink: &QueueProducer<Deferred>,
        suppressed: &Arc<DashSet<CapabilityId>>,
    ) -> Result<usize, HostError> {
        let mut installed = 0;
        for capability in self.by_id.values() {
            let id = capability.id();
            for &property in capability.properties() {
                let registry = registry.clone();
                let sink = sink.clone();
                let suppressed = suppressed.clone();
                capability.watch(
                    property,
                    Arc::new(move || {
                        if !suppressed.contains(&id) {
                            registry.fire(id, property, &sink);
                        }
                    }),
                )?;
                installed += 1;
            }
        }
        debug!(observers = installed, "Host observers installed");
        Ok(installed)
    }

    pub fn get(&self, id: CapabilityId) -> Option<&Arc<dyn Capability>> {
        self.by_id.get(&id)
    }

    /// Look up a capability or fail with `UnknownCapability`
    pub fn require(&self, id: CapabilityId) -> Result<&Arc<dyn Capability>, BridgeError> {
        self.get(id).ok_or(BridgeError::UnknownCapability(id))
    }

    pub fn tracks(&self) -> Vec<CapabilityInfo> {
        self.tracks.iter().map(|t| t.info()).collect()
    }

    pub fn devices(&self, track: CapabilityId) -> Result<Vec<CapabilityInfo>, BridgeError> {
        self.devices
            .get(&track)
            .map(|list| list.iter().map(|d| d.info()).collect())
            .ok_or(BridgeError::UnknownCapability(track))
    }

    pub fn parameters(&self, device: CapabilityId) -> Result<Vec<CapabilityInfo>, BridgeError> {
        self.parameters
            .get(&device)
            .map(|list| list.iter().map(|p| p.info()).collect())
            .ok_or(BridgeError::UnknownCapability(device))
    }

    pub fn transport(&self) -> &Arc<dyn Capability> {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::queue;
    use crate::host::{CapabilityKind, SimHost, SimLayout};
    use serde_json::json;

    fn host() -> SimHost {
        SimHost::new(&SimLayout {
            tracks: 4,
            devices_per_track: 3,
            parameters_per_device: 5,
            project: "Banks".into(),
        })
    }

    #[test]
    fn test_limits_are_applied() {
        let host = host();
        let limits = BanksConfig {
            max_tracks: 2,
            max_devices: 2,
            max_parameters: 4,
        };
        let banks = Banks::build(&host, &limits);

        let tracks = banks.tracks();
        assert_eq!(tracks.len(), 2);
        assert!(tracks.iter().all(|t| t.kind == CapabilityKind::Track));

        let devices = banks.devices(tracks[0].id).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(banks.parameters(devices[1].id).unwrap().len(), 4);
        // transport + 2 tracks + 4 devices + 16 parameters
        assert_eq!(banks.by_id.len(), 23);
    }

    #[test]
    fn test_unknown_ids() {
        let banks = Banks::build(&host(), &BanksConfig::default());
        assert!(matches!(
            banks.devices(CapabilityId(99_999)),
            Err(BridgeError::UnknownCapability(CapabilityId(99_999)))
        ));
        // A track id is not a device id
        let track = banks.tracks()[0].id;
        assert!(banks.parameters(track).is_err());
        assert!(banks.require(track).is_ok());
    }

    #[test]
    fn test_observers_feed_registry_unless_suppressed() {
        let host = host();
        let banks = Banks::build(&host, &BanksConfig::default());
        let registry = SharedRegistry::new();
        let (tx, rx) = queue::channel();
        let suppressed = Arc::new(DashSet::new());

        let installed = banks.wire(&registry, &tx, &suppressed).unwrap();
        // 4 tracks x 3 + 12 devices x 1 + 60 parameters x 1 + transport x 3
        assert_eq!(installed, 12 + 12 + 60 + 3);

        let track = host.sim_tracks()[0].clone();
        registry.add(1, track.id(), "mute", 1, Arc::new(|| Ok(())));

        track.set("mute", json!(true)).unwrap();
        assert_eq!(rx.drain_all().len(), 1);

        suppressed.insert(track.id());
        track.set("mute", json!(false)).unwrap();
        assert!(rx.drain_all().is_empty());
    }
}
