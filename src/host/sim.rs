//! In-memory host
//!
//! `SimHost` implements [`Host`] without a real audio engine: a fixed layout of
//! tracks, devices and parameters whose values live in memory. Observers run
//! synchronously on whichever thread performed the mutation, which is as
//! arbitrary as a real host's notification threads. Notifications and log lines
//! are recorded so callers can inspect what the bridge surfaced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info};

use super::{
    value_as_f64, Capability, CapabilityId, CapabilityKind, ChangeObserver, Host, HostLog,
    MidiCallback, SysexCallback, PARAMETER_VALUE,
};
use crate::error::HostError;
use crate::midi::RawEvent;

const TRACK_PROPERTIES: &[&str] = &["mute", "volume", "pan"];
const DEVICE_PROPERTIES: &[&str] = &["enabled"];
const PARAMETER_PROPERTIES: &[&str] = &[PARAMETER_VALUE];
const TRANSPORT_PROPERTIES: &[&str] = &["playing", "recording", "position"];

/// Shape of the simulated project
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimLayout {
    #[serde(default = "default_tracks")]
    pub tracks: usize,
    #[serde(default = "default_devices_per_track")]
    pub devices_per_track: usize,
    #[serde(default = "default_parameters_per_device")]
    pub parameters_per_device: usize,
    #[serde(default = "default_project")]
    pub project: String,
}

impl Default for SimLayout {
    fn default() -> Self {
        Self {
            tracks: default_tracks(),
            devices_per_track: default_devices_per_track(),
            parameters_per_device: default_parameters_per_device(),
            project: default_project(),
        }
    }
}

fn default_tracks() -> usize { 8 }
fn default_devices_per_track() -> usize { 2 }
fn default_parameters_per_device() -> usize { 8 }
fn default_project() -> String { "Untitled".to_string() }

/// A line written to the host log surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLine {
    Info(String),
    Error(String),
}

/// An in-memory capability
pub struct SimCapability {
    id: CapabilityId,
    kind: CapabilityKind,
    name: RwLock<String>,
    values: Mutex<HashMap<&'static str, Value>>,
    observers: Mutex<HashMap<String, Vec<ChangeObserver>>>,
    /// Raw bounds the normalized parameter value maps onto
    raw_range: Mutex<(f64, f64)>,
    invoked: Mutex<Vec<String>>,
}

impl SimCapability {
    fn new(id: CapabilityId, kind: CapabilityKind, name: String) -> Self {
        let mut values: HashMap<&'static str, Value> = HashMap::new();
        match kind {
            CapabilityKind::Track => {
                values.insert("mute", json!(false));
                values.insert("volume", json!(0.793));
                values.insert("pan", json!(0.5));
            }
            CapabilityKind::Device => {
                values.insert("enabled", json!(true));
            }
            CapabilityKind::Parameter => {
                values.insert(PARAMETER_VALUE, json!(0.5));
            }
            CapabilityKind::Transport => {
                values.insert("playing", json!(false));
                values.insert("recording", json!(false));
                values.insert("position", json!(0.0));
            }
        }

        Self {
            id,
            kind,
            name: RwLock::new(name),
            values: Mutex::new(values),
            observers: Mutex::new(HashMap::new()),
            raw_range: Mutex::new((0.0, 1.0)),
            invoked: Mutex::new(Vec::new()),
        }
    }

    /// Change the raw bounds a parameter's normalized value maps onto
    pub fn set_raw_range(&self, low: f64, high: f64) {
        *self.raw_range.lock() = (low, high);
    }

    pub fn rename(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    /// Actions invoked so far, in order
    pub fn invoked(&self) -> Vec<String> {
        self.invoked.lock().clone()
    }

    /// Number of observers registered for a property
    pub fn observer_count(&self, property: &str) -> usize {
        self.observers
            .lock()
            .get(property)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn property_key(&self, property: &str) -> Result<&'static str, HostError> {
        self.properties()
            .iter()
            .copied()
            .find(|p| *p == property)
            .ok_or_else(|| HostError::UnknownProperty {
                kind: self.kind,
                property: property.to_string(),
            })
    }

    /// Store a value and notify observers if it changed
    fn store(&self, key: &'static str, value: Value) {
        let changed = {
            let mut values = self.values.lock();
            let previous = values.insert(key, value.clone());
            previous.as_ref() != Some(&value)
        };

        if changed {
            // Observers run outside the value lock so they may read back
            let observers: Vec<ChangeObserver> = self
                .observers
                .lock()
                .get(key)
                .cloned()
                .unwrap_or_default();
            for observer in observers {
                observer();
            }
        }
    }

    fn current(&self, key: &'static str) -> Value {
        self.values.lock().get(key).cloned().unwrap_or(Value::Null)
    }
}

impl Capability for SimCapability {
    fn id(&self) -> CapabilityId {
        self.id
    }

    fn kind(&self) -> CapabilityKind {
        self.kind
    }

    fn name(&self) -> String {
        self.name.read().clone()
    }

    fn properties(&self) -> &'static [&'static str] {
        match self.kind {
            CapabilityKind::Track => TRACK_PROPERTIES,
            CapabilityKind::Device => DEVICE_PROPERTIES,
            CapabilityKind::Parameter => PARAMETER_PROPERTIES,
            CapabilityKind::Transport => TRANSPORT_PROPERTIES,
        }
    }

    fn watch(&self, property: &str, observer: ChangeObserver) -> Result<(), HostError> {
        let key = self.property_key(property)?;
        self.observers
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(observer);
        Ok(())
    }

    fn get(&self, property: &str) -> Result<Value, HostError> {
        let key = self.property_key(property)?;
        Ok(self.current(key))
    }

    fn set(&self, property: &str, value: Value) -> Result<(), HostError> {
        let key = self.property_key(property)?;
        let invalid = || HostError::InvalidValue {
            property: property.to_string(),
            value: value.clone(),
        };

        let stored = match self.current(key) {
            Value::Bool(_) => Value::Bool(value.as_bool().ok_or_else(invalid)?),
            _ => {
                let number = value_as_f64(property, &value)?;
                if self.kind == CapabilityKind::Parameter || key == "volume" || key == "pan" {
                    json!(number.clamp(0.0, 1.0))
                } else {
                    json!(number)
                }
            }
        };

        self.store(key, stored);
        Ok(())
    }

    fn get_raw(&self, property: &str) -> Result<f64, HostError> {
        let key = self.property_key(property)?;
        let normalized = value_as_f64(property, &self.current(key))?;
        if self.kind == CapabilityKind::Parameter {
            let (low, high) = *self.raw_range.lock();
            Ok(low + normalized * (high - low))
        } else {
            Ok(normalized)
        }
    }

    fn invoke(&self, action: &str) -> Result<(), HostError> {
        if self.kind != CapabilityKind::Transport {
            return Err(HostError::UnsupportedAction {
                kind: self.kind,
                action: action.to_string(),
            });
        }

        match action {
            "play" => self.store("playing", json!(true)),
            "stop" => self.store("playing", json!(false)),
            "record" => {
                let recording = self.current("recording").as_bool().unwrap_or(false);
                self.store("recording", json!(!recording));
            }
            "rewind" => self.store("position", json!(0.0)),
            "fast_forward" => {
                let position = self.current("position").as_f64().unwrap_or(0.0);
                self.store("position", json!(position + 4.0));
            }
            _ => {
                return Err(HostError::UnsupportedAction {
                    kind: self.kind,
                    action: action.to_string(),
                })
            }
        }

        self.invoked.lock().push(action.to_string());
        Ok(())
    }
}

/// In-memory host application
pub struct SimHost {
    tracks: Vec<Arc<SimCapability>>,
    devices: HashMap<CapabilityId, Vec<Arc<SimCapability>>>,
    parameters: HashMap<CapabilityId, Vec<Arc<SimCapability>>>,
    transport: Arc<SimCapability>,
    by_id: HashMap<CapabilityId, Arc<SimCapability>>,
    project: Mutex<String>,
    project_observers: Mutex<Vec<ChangeObserver>>,
    midi: RwLock<Option<(MidiCallback, SysexCallback)>>,
    muted: AtomicBool,
    mute_history: Mutex<Vec<bool>>,
    notifications: Mutex<Vec<String>>,
    log: Mutex<Vec<LogLine>>,
}

impl SimHost {
    /// Build a host with the given layout
    pub fn new(layout: &SimLayout) -> Self {
        let next_id = AtomicU64::new(1);
        let mint = || CapabilityId(next_id.fetch_add(1, Ordering::Relaxed));

        let mut by_id = HashMap::new();
        let mut tracks = Vec::with_capacity(layout.tracks);
        let mut devices = HashMap::new();
        let mut parameters = HashMap::new();

        let transport = Arc::new(SimCapability::new(
            mint(),
            CapabilityKind::Transport,
            "Transport".to_string(),
        ));
        by_id.insert(transport.id, transport.clone());

        for t in 0..layout.tracks {
            let track = Arc::new(SimCapability::new(
                mint(),
                CapabilityKind::Track,
                format!("Track {}", t + 1),
            ));
            by_id.insert(track.id, track.clone());

            let mut track_devices = Vec::with_capacity(layout.devices_per_track);
            for d in 0..layout.devices_per_track {
                let device = Arc::new(SimCapability::new(
                    mint(),
                    CapabilityKind::Device,
                    format!("Device {}.{}", t + 1, d + 1),
                ));
                by_id.insert(device.id, device.clone());

                let device_params: Vec<_> = (0..layout.parameters_per_device)
                    .map(|p| {
                        let param = Arc::new(SimCapability::new(
                            mint(),
                            CapabilityKind::Parameter,
                            format!("Param {}", p + 1),
                        ));
                        by_id.insert(param.id, param.clone());
                        param
                    })
                    .collect();
                parameters.insert(device.id, device_params);
                track_devices.push(device);
            }
            devices.insert(track.id, track_devices);
            tracks.push(track);
        }

        debug!(
            tracks = layout.tracks,
            capabilities = by_id.len(),
            "Simulated host created"
        );

        Self {
            tracks,
            devices,
            parameters,
            transport,
            by_id,
            project: Mutex::new(layout.project.clone()),
            project_observers: Mutex::new(Vec::new()),
            midi: RwLock::new(None),
            muted: AtomicBool::new(false),
            mute_history: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Look up a capability with its concrete type
    pub fn capability(&self, id: CapabilityId) -> Option<Arc<SimCapability>> {
        self.by_id.get(&id).cloned()
    }

    pub fn sim_tracks(&self) -> &[Arc<SimCapability>] {
        &self.tracks
    }

    pub fn sim_devices(&self, track: CapabilityId) -> Vec<Arc<SimCapability>> {
        self.devices.get(&track).cloned().unwrap_or_default()
    }

    pub fn sim_parameters(&self, device: CapabilityId) -> Vec<Arc<SimCapability>> {
        self.parameters.get(&device).cloned().unwrap_or_default()
    }

    pub fn sim_transport(&self) -> Arc<SimCapability> {
        self.transport.clone()
    }

    /// Deliver a short MIDI message as the host's input thread would
    ///
    /// Returns false when no callback is installed (the message is dropped).
    pub fn inject_midi(&self, event: RawEvent) -> bool {
        let callback = self.midi.read().as_ref().map(|(short, _)| short.clone());
        match callback {
            Some(callback) => {
                callback(event);
                true
            }
            None => false,
        }
    }

    /// Deliver a SysEx message as the host's input thread would
    pub fn inject_sysex(&self, data: &[u8]) -> bool {
        let callback = self.midi.read().as_ref().map(|(_, sysex)| sysex.clone());
        match callback {
            Some(callback) => {
                callback(data);
                true
            }
            None => false,
        }
    }

    /// Switch to another project and notify project observers
    pub fn load_project(&self, name: &str) {
        *self.project.lock() = name.to_string();
        info!(project = name, "Simulated project loaded");
        let observers = self.project_observers.lock().clone();
        for observer in observers {
            observer();
        }
    }

    pub fn project_name(&self) -> String {
        self.project.lock().clone()
    }

    /// Popup notifications shown so far
    pub fn notifications(&self) -> Vec<String> {
        self.notifications.lock().clone()
    }

    /// Log lines written so far
    pub fn log_lines(&self) -> Vec<LogLine> {
        self.log.lock().clone()
    }

    /// Every mute state change requested, in order
    pub fn mute_history(&self) -> Vec<bool> {
        self.mute_history.lock().clone()
    }

    pub fn has_midi_callbacks(&self) -> bool {
        self.midi.read().is_some()
    }
}

impl HostLog for SimHost {
    fn println(&self, line: &str) {
        info!(target: "host", "{}", line);
        self.log.lock().push(LogLine::Info(line.to_string()));
    }

    fn errorln(&self, line: &str) {
        error!(target: "host", "{}", line);
        self.log.lock().push(LogLine::Error(line.to_string()));
    }
}

impl Host for SimHost {
    fn tracks(&self, max: usize) -> Vec<Arc<dyn Capability>> {
        self.tracks
            .iter()
            .take(max)
            .map(|t| t.clone() as Arc<dyn Capability>)
            .collect()
    }

    fn devices(&self, track: CapabilityId, max: usize) -> Vec<Arc<dyn Capability>> {
        self.devices
            .get(&track)
            .map(|list| {
                list.iter()
                    .take(max)
                    .map(|d| d.clone() as Arc<dyn Capability>)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn parameters(&self, device: CapabilityId, max: usize) -> Vec<Arc<dyn Capability>> {
        self.parameters
            .get(&device)
            .map(|list| {
                list.iter()
                    .take(max)
                    .map(|p| p.clone() as Arc<dyn Capability>)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn transport(&self) -> Arc<dyn Capability> {
        self.transport.clone()
    }

    fn watch_project(&self, observer: ChangeObserver) {
        self.project_observers.lock().push(observer);
    }

    fn set_midi_callbacks(&self, short: MidiCallback, sysex: SysexCallback) {
        *self.midi.write() = Some((short, sysex));
    }

    fn clear_midi_callbacks(&self) {
        *self.midi.write() = None;
    }

    fn is_audio_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn set_audio_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
        self.mute_history.lock().push(muted);
    }

    fn show_notification(&self, message: &str) {
        info!(target: "host", "Notification: {}", message);
        self.notifications.lock().push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn small_host() -> SimHost {
        SimHost::new(&SimLayout {
            tracks: 2,
            devices_per_track: 1,
            parameters_per_device: 3,
            project: "Test".into(),
        })
    }

    #[test]
    fn test_layout_ids_are_unique() {
        let host = small_host();
        // 1 transport + 2 tracks + 2 devices + 6 parameters
        assert_eq!(host.by_id.len(), 11);
        let track = &host.sim_tracks()[0];
        let device = &host.sim_devices(track.id())[0];
        assert_eq!(host.sim_parameters(device.id()).len(), 3);
    }

    #[test]
    fn test_bank_limits() {
        let host = small_host();
        assert_eq!(host.tracks(1).len(), 1);
        let track = host.tracks(8)[1].id();
        assert_eq!(host.devices(track, 16).len(), 1);
        assert!(host.devices(CapabilityId(9999), 16).is_empty());
    }

    #[test]
    fn test_observer_fires_only_on_change() {
        let host = small_host();
        let track = host.sim_tracks()[0].clone();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        track
            .watch(
                "mute",
                Arc::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        track.set("mute", json!(true)).unwrap();
        track.set("mute", json!(true)).unwrap();
        track.set("mute", json!(false)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_parameter_raw_mapping() {
        let host = small_host();
        let track = host.sim_tracks()[0].id();
        let device = host.sim_devices(track)[0].id();
        let param = host.sim_parameters(device)[0].clone();

        param.set_raw_range(-12.0, 12.0);
        param.set(PARAMETER_VALUE, json!(1.0)).unwrap();
        assert_eq!(param.get_raw(PARAMETER_VALUE).unwrap(), 12.0);
        param.set(PARAMETER_VALUE, json!(2.5)).unwrap();
        assert_eq!(param.get(PARAMETER_VALUE).unwrap(), json!(1.0));
        param.set(PARAMETER_VALUE, json!(0.0)).unwrap();
        assert_eq!(param.get_raw(PARAMETER_VALUE).unwrap(), -12.0);
    }

    #[test]
    fn test_type_checks() {
        let host = small_host();
        let track = host.sim_tracks()[0].clone();
        assert!(matches!(
            track.set("mute", json!(0.4)),
            Err(HostError::InvalidValue { .. })
        ));
        assert!(matches!(
            track.get("tempo"),
            Err(HostError::UnknownProperty { .. })
        ));
    }

    #[test]
    fn test_transport_actions() {
        let host = small_host();
        let transport = host.sim_transport();
        transport.invoke("play").unwrap();
        assert_eq!(transport.get("playing").unwrap(), json!(true));
        transport.invoke("fast_forward").unwrap();
        transport.invoke("rewind").unwrap();
        assert_eq!(transport.get("position").unwrap(), json!(0.0));
        assert!(transport.invoke("eject").is_err());
        assert_eq!(transport.invoked(), vec!["play", "fast_forward", "rewind"]);

        let track = host.sim_tracks()[0].clone();
        assert!(matches!(
            track.invoke("play"),
            Err(HostError::UnsupportedAction { .. })
        ));
    }

    #[test]
    fn test_midi_dropped_without_callbacks() {
        let host = small_host();
        assert!(!host.inject_midi(RawEvent::new(0x90, 60, 100)));
        assert!(!host.inject_sysex(&[0xF0, 0xF7]));
    }

    #[test]
    fn test_project_observers() {
        let host = small_host();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        host.watch_project(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        host.load_project("Second");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(host.project_name(), "Second");
    }

    #[test]
    fn test_mute_history() {
        let host = small_host();
        host.set_audio_muted(true);
        host.set_audio_muted(false);
        assert_eq!(host.mute_history(), vec![true, false]);
        assert!(!host.is_audio_muted());
    }
}
