//! Raw MIDI parsing for the per-period event pass.
//!
//! The engine listens on one MIDI port and routes each event to the player
//! whose slot index matches the event's channel.

/// A decoded channel-voice message. Note on with velocity zero is folded
/// into [`MidiEvent::NoteOff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiEvent {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    PitchBend { channel: u8, value: u16 },
}

impl MidiEvent {
    /// Decode the leading message in `bytes`, ignoring anything the engine
    /// does not react to.
    pub fn parse(bytes: &[u8]) -> Option<MidiEvent> {
        if bytes.len() < 3 || bytes[0] < 0x80 {
            return None;
        }
        let channel = bytes[0] & 0x0F;
        let (data1, data2) = (bytes[1] & 0x7F, bytes[2] & 0x7F);
        match bytes[0] & 0xF0 {
            0x80 => Some(MidiEvent::NoteOff {
                channel,
                note: data1,
            }),
            0x90 if data2 == 0 => Some(MidiEvent::NoteOff {
                channel,
                note: data1,
            }),
            0x90 => Some(MidiEvent::NoteOn {
                channel,
                note: data1,
                velocity: data2,
            }),
            0xB0 => Some(MidiEvent::ControlChange {
                channel,
                controller: data1,
                value: data2,
            }),
            0xE0 => Some(MidiEvent::PitchBend {
                channel,
                value: data1 as u16 | ((data2 as u16) << 7),
            }),
            _ => None,
        }
    }

    pub fn channel(&self) -> u8 {
        match *self {
            MidiEvent::NoteOn { channel, .. }
            | MidiEvent::NoteOff { channel, .. }
            | MidiEvent::ControlChange { channel, .. }
            | MidiEvent::PitchBend { channel, .. } => channel,
        }
    }
}

/// Pitch ratio for a triggering note, relative to middle C. Each source
/// sample is stretched across `ratio` output samples, so notes below 60
/// play slower and lower, notes above play faster and higher.
pub fn note_to_ratio(note: u8) -> f32 {
    ((60.0 - note as f32) / 12.0).exp2()
}
