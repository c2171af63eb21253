//! Host application boundary
//!
//! The host exposes its state as capabilities: tracks, devices, parameters and
//! the transport. Each capability carries a stable id minted by the host when the
//! capability is created; the bridge keys every lookup by that id and never by
//! object identity.
//!
//! Observers registered through [`Capability::watch`] may be called on any host
//! thread at any time. Implementations must deliver every change eventually, with
//! no ordering guarantee across capabilities.

pub mod sim;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HostError;
use crate::midi::RawEvent;

pub use sim::{SimHost, SimLayout};

/// Stable identity of a host capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(pub u64);

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// What kind of host entity a capability addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Track,
    Device,
    Parameter,
    Transport,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CapabilityKind::Track => "track",
            CapabilityKind::Device => "device",
            CapabilityKind::Parameter => "parameter",
            CapabilityKind::Transport => "transport",
        };
        f.write_str(name)
    }
}

/// Observer invoked by the host when a watched property changes
pub type ChangeObserver = Arc<dyn Fn() + Send + Sync>;

/// Callback for short MIDI messages arriving at the host's input ports
pub type MidiCallback = Arc<dyn Fn(RawEvent) + Send + Sync>;

/// Callback for SysEx messages arriving at the host's input ports
pub type SysexCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Name of the normalized value property on parameters
pub const PARAMETER_VALUE: &str = "value";

/// A watchable, mutable host entity
///
/// `set` on a parameter's [`PARAMETER_VALUE`] takes a normalized input in `[0, 1]`;
/// `get_raw` returns the underlying engine value.
pub trait Capability: Send + Sync {
    fn id(&self) -> CapabilityId;

    fn kind(&self) -> CapabilityKind;

    fn name(&self) -> String;

    /// Properties that can be watched, read and written
    fn properties(&self) -> &'static [&'static str];

    /// Register a push notification for a property
    fn watch(&self, property: &str, observer: ChangeObserver) -> Result<(), HostError>;

    fn get(&self, property: &str) -> Result<Value, HostError>;

    fn set(&self, property: &str, value: Value) -> Result<(), HostError>;

    /// Underlying (non-normalized) value of a numeric property
    fn get_raw(&self, property: &str) -> Result<f64, HostError>;

    /// Trigger a momentary action (transport play/stop, ...)
    fn invoke(&self, action: &str) -> Result<(), HostError> {
        Err(HostError::UnsupportedAction {
            kind: self.kind(),
            action: action.to_string(),
        })
    }

    fn info(&self) -> CapabilityInfo {
        CapabilityInfo {
            id: self.id(),
            kind: self.kind(),
            name: self.name(),
        }
    }
}

/// Serializable description of a capability handed to the consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub id: CapabilityId,
    pub kind: CapabilityKind,
    pub name: String,
}

/// Host logging surface
pub trait HostLog: Send + Sync {
    fn println(&self, line: &str);

    fn errorln(&self, line: &str);
}

/// The host application as seen by the bridge
pub trait Host: HostLog {
    /// Up to `max` tracks of the current project
    fn tracks(&self, max: usize) -> Vec<Arc<dyn Capability>>;

    /// Up to `max` devices on a track
    fn devices(&self, track: CapabilityId, max: usize) -> Vec<Arc<dyn Capability>>;

    /// Up to `max` remote parameters of a device
    fn parameters(&self, device: CapabilityId, max: usize) -> Vec<Arc<dyn Capability>>;

    fn transport(&self) -> Arc<dyn Capability>;

    /// Register an observer for project changes (project switched, track count changed)
    fn watch_project(&self, observer: ChangeObserver);

    /// Install the callbacks for all MIDI input ports
    fn set_midi_callbacks(&self, short: MidiCallback, sysex: SysexCallback);

    /// Remove the MIDI input callbacks; input is dropped until new ones are set
    fn clear_midi_callbacks(&self);

    fn is_audio_muted(&self) -> bool;

    fn set_audio_muted(&self, muted: bool);

    /// Show a user-visible popup notification
    fn show_notification(&self, message: &str);
}

/// Read a JSON value as a float, accepting booleans as 0/1
pub fn value_as_f64(property: &str, value: &Value) -> Result<f64, HostError> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
    .ok_or_else(|| HostError::InvalidValue {
        property: property.to_string(),
        value: value.clone(),
    })
}
