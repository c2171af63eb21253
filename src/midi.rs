//! MIDI types carried through the bridge
//!
//! Raw short messages are queued untouched as `RawEvent` triplets; decoding into
//! `MidiMessage` only happens for logging. SysEx input is inspected for MIDI
//! Machine Control transport commands.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A raw short MIDI message as delivered by the host
///
/// Serialized as a three-element array so batches stay compact on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u8; 3]", into = "[u8; 3]")]
pub struct RawEvent {
    pub status: u8,
    pub data1: u8,
    pub data2: u8,
}

impl RawEvent {
    pub fn new(status: u8, data1: u8, data2: u8) -> Self {
        Self {
            status,
            data1,
            data2,
        }
    }

    pub fn to_bytes(self) -> [u8; 3] {
        [self.status, self.data1, self.data2]
    }

    /// Decode for display purposes
    pub fn message(&self) -> Option<MidiMessage> {
        MidiMessage::parse(&self.to_bytes())
    }
}

impl From<[u8; 3]> for RawEvent {
    fn from(bytes: [u8; 3]) -> Self {
        Self::new(bytes[0], bytes[1], bytes[2])
    }
}

impl From<RawEvent> for [u8; 3] {
    fn from(event: RawEvent) -> Self {
        event.to_bytes()
    }
}

impl fmt::Display for RawEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{} ({})", format_hex(&self.to_bytes()), msg),
            None => write!(f, "{}", format_hex(&self.to_bytes())),
        }
    }
}

/// MIDI channel message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    /// Note Off: channel (0-15), note (0-127), velocity (0-127)
    NoteOff { channel: u8, note: u8, velocity: u8 },

    /// Note On: channel (0-15), note (0-127), velocity (0-127)
    NoteOn { channel: u8, note: u8, velocity: u8 },

    /// Polyphonic Key Pressure: channel (0-15), note (0-127), pressure (0-127)
    PolyPressure { channel: u8, note: u8, pressure: u8 },

    /// Control Change: channel (0-15), cc (0-127), value (0-127)
    ControlChange { channel: u8, cc: u8, value: u8 },

    /// Program Change: channel (0-15), program (0-127)
    ProgramChange { channel: u8, program: u8 },

    /// Channel Pressure: channel (0-15), pressure (0-127)
    ChannelPressure { channel: u8, pressure: u8 },

    /// Pitch Bend: channel (0-15), value (0-16383, 14-bit)
    PitchBend { channel: u8, value: u16 },
}

impl MidiMessage {
    /// Parse a channel message from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        let status = *data.first()?;

        // Running status and system messages are not decoded
        if !(0x80..0xF0).contains(&status) {
            return None;
        }

        let channel = status & 0x0F;
        let d1 = data.get(1).map(|b| b & 0x7F);
        let d2 = data.get(2).map(|b| b & 0x7F);

        match status & 0xF0 {
            0x80 => Some(MidiMessage::NoteOff {
                channel,
                note: d1?,
                velocity: d2?,
            }),
            0x90 => {
                let (note, velocity) = (d1?, d2?);
                // velocity 0 = Note Off
                if velocity == 0 {
                    Some(MidiMessage::NoteOff {
                        channel,
                        note,
                        velocity: 0,
                    })
                } else {
                    Some(MidiMessage::NoteOn {
                        channel,
                        note,
                        velocity,
                    })
                }
            }
            0xA0 => Some(MidiMessage::PolyPressure {
                channel,
                note: d1?,
                pressure: d2?,
            }),
            0xB0 => Some(MidiMessage::ControlChange {
                channel,
                cc: d1?,
                value: d2?,
            }),
            0xC0 => Some(MidiMessage::ProgramChange {
                channel,
                program: d1?,
            }),
            0xD0 => Some(MidiMessage::ChannelPressure {
                channel,
                pressure: d1?,
            }),
            0xE0 => {
                let (lsb, msb) = (d1? as u16, d2? as u16);
                Some(MidiMessage::PitchBend {
                    channel,
                    value: (msb << 7) | lsb,
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MidiMessage::NoteOff {
                channel,
                note,
                velocity,
            } => write!(f, "NoteOff ch:{} n:{} v:{}", channel + 1, note, velocity),
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => write!(f, "NoteOn ch:{} n:{} v:{}", channel + 1, note, velocity),
            MidiMessage::PolyPressure {
                channel,
                note,
                pressure,
            } => write!(f, "PolyPressure ch:{} n:{} p:{}", channel + 1, note, pressure),
            MidiMessage::ControlChange { channel, cc, value } => {
                write!(f, "CC ch:{} cc:{} v:{}", channel + 1, cc, value)
            }
            MidiMessage::ProgramChange { channel, program } => {
                write!(f, "ProgramChange ch:{} p:{}", channel + 1, program)
            }
            MidiMessage::ChannelPressure { channel, pressure } => {
                write!(f, "ChannelPressure ch:{} p:{}", channel + 1, pressure)
            }
            MidiMessage::PitchBend { channel, value } => {
                write!(f, "PitchBend ch:{} v:{}", channel + 1, value)
            }
        }
    }
}

/// Transport commands carried by MIDI Machine Control SysEx
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    Stop,
    Play,
    FastForward,
    Rewind,
    Record,
}

impl TransportCommand {
    /// Decode an MMC command message: `F0 7F <device> 06 <command> F7`
    ///
    /// Any device id is accepted (0x7F is the all-call id most surfaces send).
    pub fn from_sysex(data: &[u8]) -> Option<Self> {
        match data {
            [0xF0, 0x7F, _device, 0x06, command, 0xF7] => match command {
                0x01 => Some(TransportCommand::Stop),
                0x02 => Some(TransportCommand::Play),
                0x04 => Some(TransportCommand::FastForward),
                0x05 => Some(TransportCommand::Rewind),
                0x06 => Some(TransportCommand::Record),
                _ => None,
            },
            _ => None,
        }
    }

    /// Action name understood by the transport capability
    pub fn action(&self) -> &'static str {
        match self {
            TransportCommand::Stop => "stop",
            TransportCommand::Play => "play",
            TransportCommand::FastForward => "fast_forward",
            TransportCommand::Rewind => "rewind",
            TransportCommand::Record => "record",
        }
    }
}

/// Format MIDI bytes as hex string for debugging
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
