// Shoal
// Copyright (C) 2021  Wesley Merkel
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! MIDI output and input.
//!
//! [`MidiHandler`] plays notes and forwards channel and transport messages to an output port.
//! Notes are monophonic per key: playing a note that is still sounding on the same channel
//! replaces its pending note-off instead of stacking a second one, so a key never has more than
//! one note-off waiting.
//!
//! Every message a handler plays is dispatched through the environment as an
//! [`Event::Midi`] addressed to that handler before it is written, so other handlers can observe
//! the output.
//!
//! [`MidiInHandler`](input::MidiInHandler) buffers messages from an input port for runners to
//! read.
//!
//! Real devices are opened through `midir` and need the `device` feature. Without it, or when a
//! device cannot be opened, handlers are created disabled and log instead of failing.

use crate::{
    event::{Event, EventKind, EventKinds},
    handler::{self, Handler},
    pattern::{reduce, Param, ParseError, Value},
    runner::Cycle,
    timer::TimerHandle,
    Environment,
};
use std::{
    collections::HashMap,
    io,
    sync::{
        mpsc::{self, Sender},
        Arc, Mutex, Weak,
    },
    thread,
};
use thiserror::Error;

pub mod input;

pub use input::{extract_value, ListenTarget, MidiInHandler, MidiQueue, Reading};

/// A specialized [`Result`] type for MIDI operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for MIDI operations.
#[derive(Debug, Error)]
pub enum Error {
    #[cfg(feature = "device")]
    #[error("initializing MIDI")]
    Init(#[source] midir::InitError),
    #[cfg(feature = "device")]
    #[error("writing to MIDI port")]
    Send(#[source] midir::SendError),
    #[error("no MIDI port named {0:?}")]
    PortNotFound(String),
    #[error("no MIDI ports available")]
    NoPorts,
    #[error("connecting to MIDI port: {0}")]
    Connect(String),
    #[error("MIDI devices are not supported by this build, enable the `device` feature")]
    Unsupported,
    #[error("MIDI port is closed")]
    Closed,
    #[error("MIDI writer thread has stopped")]
    WriterClosed,
    #[error("spawning MIDI thread")]
    Spawn(#[source] io::Error),
}

/// The kind of a [`MidiMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MidiKind {
    NoteOn,
    NoteOff,
    ControlChange,
    ProgramChange,
    PitchWheel,
    PolyTouch,
    AfterTouch,
    SysEx,
    Start,
    Continue,
    Stop,
    Reset,
    Clock,
}

impl MidiKind {
    pub const ALL: [MidiKind; 13] = [
        MidiKind::NoteOn,
        MidiKind::NoteOff,
        MidiKind::ControlChange,
        MidiKind::ProgramChange,
        MidiKind::PitchWheel,
        MidiKind::PolyTouch,
        MidiKind::AfterTouch,
        MidiKind::SysEx,
        MidiKind::Start,
        MidiKind::Continue,
        MidiKind::Stop,
        MidiKind::Reset,
        MidiKind::Clock,
    ];
}

/// A MIDI channel voice or realtime message.
///
/// Channels are numbered from 0 to 15. Data fields are 7-bit; [`validated`](MidiMessage::validated)
/// clamps everything into range and is applied before a message is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8, velocity: u8 },
    ControlChange { channel: u8, control: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    /// A pitch bend between -8192 and 8191, centered at 0.
    PitchWheel { channel: u8, pitch: i16 },
    PolyTouch { channel: u8, note: u8, value: u8 },
    AfterTouch { channel: u8, value: u8 },
    /// A system exclusive message, without the framing bytes.
    SysEx(Vec<u8>),
    Start,
    Continue,
    Stop,
    Reset,
    Clock,
}

const DATA_MAX: u8 = 127;
const CHANNEL_MAX: u8 = 15;
const PITCH_MIN: i16 = -8192;
const PITCH_MAX: i16 = 8191;

impl MidiMessage {
    pub fn kind(&self) -> MidiKind {
        match self {
            MidiMessage::NoteOn { .. } => MidiKind::NoteOn,
            MidiMessage::NoteOff { .. } => MidiKind::NoteOff,
            MidiMessage::ControlChange { .. } => MidiKind::ControlChange,
            MidiMessage::ProgramChange { .. } => MidiKind::ProgramChange,
            MidiMessage::PitchWheel { .. } => MidiKind::PitchWheel,
            MidiMessage::PolyTouch { .. } => MidiKind::PolyTouch,
            MidiMessage::AfterTouch { .. } => MidiKind::AfterTouch,
            MidiMessage::SysEx(_) => MidiKind::SysEx,
            MidiMessage::Start => MidiKind::Start,
            MidiMessage::Continue => MidiKind::Continue,
            MidiMessage::Stop => MidiKind::Stop,
            MidiMessage::Reset => MidiKind::Reset,
            MidiMessage::Clock => MidiKind::Clock,
        }
    }

    /// The message's channel, or `None` for system messages.
    pub fn channel(&self) -> Option<u8> {
        match *self {
            MidiMessage::NoteOn { channel, .. }
            | MidiMessage::NoteOff { channel, .. }
            | MidiMessage::ControlChange { channel, .. }
            | MidiMessage::ProgramChange { channel, .. }
            | MidiMessage::PitchWheel { channel, .. }
            | MidiMessage::PolyTouch { channel, .. }
            | MidiMessage::AfterTouch { channel, .. } => Some(channel),
            _ => None,
        }
    }

    /// Clamps every field into its valid range.
    ///
    /// # Examples
    ///
    /// ```
    /// use shoal::midi::MidiMessage;
    ///
    /// let message = MidiMessage::NoteOn { channel: 20, note: 200, velocity: 90 };
    /// assert_eq!(
    ///     MidiMessage::NoteOn { channel: 15, note: 127, velocity: 90 },
    ///     message.validated()
    /// );
    /// ```
    pub fn validated(self) -> MidiMessage {
        let data = |value: u8| value.min(DATA_MAX);
        let channel = |value: u8| value.min(CHANNEL_MAX);
        match self {
            MidiMessage::NoteOn {
                channel: c,
                note,
                velocity,
            } => MidiMessage::NoteOn {
                channel: channel(c),
                note: data(note),
                velocity: data(velocity),
            },
            MidiMessage::NoteOff {
                channel: c,
                note,
                velocity,
            } => MidiMessage::NoteOff {
                channel: channel(c),
                note: data(note),
                velocity: data(velocity),
            },
            MidiMessage::ControlChange {
                channel: c,
                control,
                value,
            } => MidiMessage::ControlChange {
                channel: channel(c),
                control: data(control),
                value: data(value),
            },
            MidiMessage::ProgramChange {
                channel: c,
                program,
            } => MidiMessage::ProgramChange {
                channel: channel(c),
                program: data(program),
            },
            MidiMessage::PitchWheel { channel: c, pitch } => MidiMessage::PitchWheel {
                channel: channel(c),
                pitch: pitch.clamp(PITCH_MIN, PITCH_MAX),
            },
            MidiMessage::PolyTouch {
                channel: c,
                note,
                value,
            } => MidiMessage::PolyTouch {
                channel: channel(c),
                note: data(note),
                value: data(value),
            },
            MidiMessage::AfterTouch { channel: c, value } => MidiMessage::AfterTouch {
                channel: channel(c),
                value: data(value),
            },
            MidiMessage::SysEx(bytes) => {
                MidiMessage::SysEx(bytes.into_iter().map(data).collect())
            }
            realtime => realtime,
        }
    }

    /// Encodes the message for the wire, clamping it first.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self.clone().validated() {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => vec![0x90 | channel, note, velocity],
            MidiMessage::NoteOff {
                channel,
                note,
                velocity,
            } => vec![0x80 | channel, note, velocity],
            MidiMessage::ControlChange {
                channel,
                control,
                value,
            } => vec![0xB0 | channel, control, value],
            MidiMessage::ProgramChange { channel, program } => vec![0xC0 | channel, program],
            MidiMessage::PitchWheel { channel, pitch } => {
                let value = (i32::from(pitch) + 8192) as u16;
                vec![0xE0 | channel, (value & 0x7F) as u8, (value >> 7) as u8]
            }
            MidiMessage::PolyTouch {
                channel,
                note,
                value,
            } => vec![0xA0 | channel, note, value],
            MidiMessage::AfterTouch { channel, value } => vec![0xD0 | channel, value],
            MidiMessage::SysEx(data) => {
                let mut bytes = Vec::with_capacity(data.len() + 2);
                bytes.push(0xF0);
                bytes.extend(data);
                bytes.push(0xF7);
                bytes
            }
            MidiMessage::Start => vec![0xFA],
            MidiMessage::Continue => vec![0xFB],
            MidiMessage::Stop => vec![0xFC],
            MidiMessage::Reset => vec![0xFF],
            MidiMessage::Clock => vec![0xF8],
        }
    }

    /// Decodes a message from the wire. Returns `None` for anything unrecognized or truncated.
    pub fn from_bytes(bytes: &[u8]) -> Option<MidiMessage> {
        let (&status, data) = bytes.split_first()?;
        match status {
            0xF8 => return Some(MidiMessage::Clock),
            0xFA => return Some(MidiMessage::Start),
            0xFB => return Some(MidiMessage::Continue),
            0xFC => return Some(MidiMessage::Stop),
            0xFF => return Some(MidiMessage::Reset),
            0xF0 => {
                let end = data.iter().position(|&byte| byte == 0xF7)?;
                return Some(MidiMessage::SysEx(data[..end].to_vec()));
            }
            _ => {}
        }

        let channel = status & 0x0F;
        Some(match (status & 0xF0, data) {
            (0x90, &[note, velocity, ..]) => MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            },
            (0x80, &[note, velocity, ..]) => MidiMessage::NoteOff {
                channel,
                note,
                velocity,
            },
            (0xB0, &[control, value, ..]) => MidiMessage::ControlChange {
                channel,
                control,
                value,
            },
            (0xC0, &[program, ..]) => MidiMessage::ProgramChange { channel, program },
            (0xE0, &[lsb, msb, ..]) => MidiMessage::PitchWheel {
                channel,
                pitch: ((i16::from(msb) << 7) | i16::from(lsb)) - 8192,
            },
            (0xA0, &[note, value, ..]) => MidiMessage::PolyTouch {
                channel,
                note,
                value,
            },
            (0xD0, &[value, ..]) => MidiMessage::AfterTouch { channel, value },
            _ => return None,
        })
    }
}

/// A destination for encoded MIDI messages.
pub trait MidiPort: Send + 'static {
    fn send(&mut self, bytes: &[u8]) -> Result<()>;
}

impl MidiPort for Sender<Vec<u8>> {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        Sender::send(self, bytes.to_vec()).map_err(|_| Error::Closed)
    }
}

#[cfg(feature = "device")]
impl MidiPort for midir::MidiOutputConnection {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        midir::MidiOutputConnection::send(self, bytes).map_err(Error::Send)
    }
}

/// Opens the output port named `port`, or a virtual `shoal` port where the platform supports
/// them, or the first port available.
#[cfg(feature = "device")]
pub fn connect(port: Option<&str>) -> Result<midir::MidiOutputConnection> {
    use midir::MidiOutput;

    let output = MidiOutput::new("shoal").map_err(Error::Init)?;
    let ports = output.ports();

    let selected = match port {
        Some(name) => ports
            .iter()
            .find(|port| {
                output
                    .port_name(port)
                    .map(|port_name| port_name == name || port_name.contains(name))
                    .unwrap_or(false)
            })
            .ok_or_else(|| Error::PortNotFound(name.to_owned()))?,
        None => return connect_default(output),
    };

    let name = output
        .port_name(selected)
        .unwrap_or_else(|_| "unknown".to_owned());
    log::debug!("connecting to MIDI output {}", name);
    output
        .connect(selected, "shoal-out")
        .map_err(|err| Error::Connect(err.to_string()))
}

#[cfg(all(feature = "device", unix))]
fn connect_default(output: midir::MidiOutput) -> Result<midir::MidiOutputConnection> {
    use midir::os::unix::VirtualOutput;

    log::debug!("creating virtual MIDI output shoal");
    output
        .create_virtual("shoal")
        .map_err(|err| Error::Connect(err.to_string()))
}

#[cfg(all(feature = "device", not(unix)))]
fn connect_default(output: midir::MidiOutput) -> Result<midir::MidiOutputConnection> {
    let ports = output.ports();
    let port = ports.first().ok_or(Error::NoPorts)?;
    output
        .connect(port, "shoal-out")
        .map_err(|err| Error::Connect(err.to_string()))
}

/// Clamps a resolved pattern number into a MIDI data range.
fn clamp(value: f64, max: u8) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, f64::from(max)) as u8
}

/// The sounding notes of one handler and the note-offs pending for them.
#[derive(Clone)]
struct Voices {
    name: String,
    env: Weak<Environment>,
    active: Arc<Mutex<HashMap<(u8, u8), TimerHandle>>>,
}

impl Voices {
    fn dispatch(&self, env: &Environment, message: MidiMessage) {
        env.dispatch(&Event::Midi {
            target: self.name.clone(),
            message: message.validated(),
        });
    }

    /// Plays a note now and schedules its note-off `duration` beats later.
    fn play(&self, note: u8, velocity: u8, channel: u8, duration: f64) {
        let env = match self.env.upgrade() {
            Some(env) => env,
            None => return,
        };
        let key = (note, channel);

        if let Some(pending) = self.active.lock().unwrap().remove(&key) {
            if pending.cancel() {
                log::debug!("{}: retriggering note {} on channel {}", self.name, note, channel);
            }
        }
        self.dispatch(
            &env,
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            },
        );
        self.schedule_off(&env, key, duration);
    }

    /// Schedules the note-off for `key`, replacing any note-off already pending for it.
    fn schedule_off(&self, env: &Environment, key: (u8, u8), delay: f64) -> TimerHandle {
        let voices = self.clone();
        let mut active = self.active.lock().unwrap();
        let handle = env
            .timer()
            .call_after(env.beats_to_duration(delay), move || voices.release(key));
        if let Some(replaced) = active.insert(key, handle.clone()) {
            replaced.cancel();
        }
        handle
    }

    /// Runs a note-off that came due.
    fn release(&self, key: (u8, u8)) {
        {
            let mut active = self.active.lock().unwrap();
            match active.get(&key) {
                // A pending entry belongs to a retrigger that replaced this note-off.
                Some(handle) if handle.is_pending() => return,
                None => return,
                Some(_) => {}
            }
            active.remove(&key);
        }
        if let Some(env) = self.env.upgrade() {
            let (note, channel) = key;
            self.dispatch(
                &env,
                MidiMessage::NoteOff {
                    channel,
                    note,
                    velocity: 0,
                },
            );
        }
    }

    /// Cancels every pending note-off, returning the keys that were still sounding.
    fn drain(&self) -> Vec<(u8, u8)> {
        let mut active = self.active.lock().unwrap();
        let mut keys: Vec<_> = active
            .drain()
            .filter(|(_, handle)| handle.cancel())
            .map(|(key, _)| key)
            .collect();
        keys.sort_unstable();
        keys
    }

    fn pending(&self) -> usize {
        let active = self.active.lock().unwrap();
        active.values().filter(|handle| handle.is_pending()).count()
    }
}

/// Parameters of a note played with [`MidiHandler::send`].
///
/// Every parameter is a literal or a pattern expression. The element played from each pattern is
/// chosen with [`reduce`] from the iterator, divisor and rate. The iterator defaults to the
/// runner's iteration, so patterns step forward once per cycle.
///
/// # Examples
///
/// ```
/// use shoal::midi::Note;
///
/// let arpeggio = Note::new()
///     .note("60 64 67 72")
///     .velocity("100 70")
///     .duration(0.25)
///     .channel(1);
/// # let _ = arpeggio;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    note: Param,
    velocity: Param,
    channel: Param,
    duration: Param,
    iterator: Option<Param>,
    divisor: Param,
    rate: Param,
}

impl Default for Note {
    /// Middle C at velocity 100 on channel 0, lasting one beat.
    fn default() -> Note {
        Note {
            note: Param::from(60),
            velocity: Param::from(100),
            channel: Param::from(0),
            duration: Param::from(1),
            iterator: None,
            divisor: Param::from(1),
            rate: Param::from(1),
        }
    }
}

impl Note {
    pub fn new() -> Note {
        Note::default()
    }

    pub fn note(mut self, note: impl Into<Param>) -> Note {
        self.note = note.into();
        self
    }

    pub fn velocity(mut self, velocity: impl Into<Param>) -> Note {
        self.velocity = velocity.into();
        self
    }

    pub fn channel(mut self, channel: impl Into<Param>) -> Note {
        self.channel = channel.into();
        self
    }

    /// Duration in beats.
    pub fn duration(mut self, duration: impl Into<Param>) -> Note {
        self.duration = duration.into();
        self
    }

    pub fn iterator(mut self, iterator: impl Into<Param>) -> Note {
        self.iterator = Some(iterator.into());
        self
    }

    pub fn divisor(mut self, divisor: impl Into<Param>) -> Note {
        self.divisor = divisor.into();
        self
    }

    pub fn rate(mut self, rate: impl Into<Param>) -> Note {
        self.rate = rate.into();
        self
    }
}

/// Picks pattern elements for one send.
pub(crate) struct Picker<'a> {
    env: &'a Environment,
    iterator: f64,
    divisor: f64,
    rate: f64,
}

impl<'a> Picker<'a> {
    pub(crate) fn new(
        env: &'a Environment,
        iterator: Option<&Param>,
        divisor: &Param,
        rate: &Param,
        iteration: u64,
    ) -> std::result::Result<Picker<'a>, ParseError> {
        let first = |param: &Param, default: f64| -> std::result::Result<f64, ParseError> {
            Ok(Picker::number(env, param, 0.0, 1.0, 1.0)?.unwrap_or(default))
        };
        Ok(Picker {
            env,
            iterator: match iterator {
                Some(iterator) => first(iterator, iteration as f64)?,
                None => iteration as f64,
            },
            divisor: first(divisor, 1.0)?,
            rate: first(rate, 1.0)?,
        })
    }

    /// The number picked from `param`, or `None` for a rest.
    ///
    /// An empty pattern and the rest words both count as rests.
    pub(crate) fn pick(&self, param: &Param) -> std::result::Result<Option<f64>, ParseError> {
        Picker::number(self.env, param, self.iterator, self.divisor, self.rate)
    }

    /// The value picked from `param`, or `None` for a rest.
    pub(crate) fn pick_value(
        &self,
        param: &Param,
    ) -> std::result::Result<Option<Value>, ParseError> {
        let values = self.env.resolve(param)?;
        Ok(reduce(&values, self.iterator, self.divisor, self.rate)
            .filter(|value| !value.is_rest())
            .cloned())
    }

    fn number(
        env: &Environment,
        param: &Param,
        iterator: f64,
        divisor: f64,
        rate: f64,
    ) -> std::result::Result<Option<f64>, ParseError> {
        let values = env.resolve(param)?;
        match reduce(&values, iterator, divisor, rate) {
            Some(value) if value.is_rest() => Ok(None),
            Some(value) => value
                .as_f64()
                .map(Some)
                .ok_or_else(|| ParseError::NotANumber(value.to_string())),
            None => Ok(None),
        }
    }
}

/// Plays notes and messages on a MIDI output port.
///
/// Device writes happen on a dedicated writer thread so a slow device never holds up the clock.
pub struct MidiHandler {
    voices: Voices,
    writer: Mutex<Option<Sender<Vec<u8>>>>,
}

impl MidiHandler {
    /// Opens a device output named `port`, or the default port when `port` is `None`.
    ///
    /// If the port cannot be opened the error is logged and a disabled handler is returned.
    pub fn open(env: &Arc<Environment>, port: Option<&str>) -> MidiHandler {
        match MidiHandler::try_open(env, port) {
            Ok(handler) => handler,
            Err(err) => {
                log::error!("MIDI output disabled: {}", err);
                MidiHandler::disabled(env, "midi")
            }
        }
    }

    #[cfg(feature = "device")]
    fn try_open(env: &Arc<Environment>, port: Option<&str>) -> Result<MidiHandler> {
        MidiHandler::with_port(env, "midi", connect(port)?)
    }

    #[cfg(not(feature = "device"))]
    fn try_open(_env: &Arc<Environment>, _port: Option<&str>) -> Result<MidiHandler> {
        Err(Error::Unsupported)
    }

    /// Creates a handler named `name` writing to `port`.
    pub fn with_port(
        env: &Arc<Environment>,
        name: impl Into<String>,
        port: impl MidiPort,
    ) -> Result<MidiHandler> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Vec<u8>>();
        let mut port = port;
        let thread_name = name.clone();
        thread::Builder::new()
            .name(format!("shoal-midi-{}", name))
            .spawn(move || {
                for bytes in receiver {
                    if let Err(err) = port.send(&bytes) {
                        log::error!("{}: {}", thread_name, err);
                    }
                }
            })
            .map_err(Error::Spawn)?;

        Ok(MidiHandler {
            voices: MidiHandler::voices(env, name),
            writer: Mutex::new(Some(sender)),
        })
    }

    /// Creates a handler that drops everything it is asked to play.
    pub fn disabled(env: &Arc<Environment>, name: impl Into<String>) -> MidiHandler {
        MidiHandler {
            voices: MidiHandler::voices(env, name.into()),
            writer: Mutex::new(None),
        }
    }

    fn voices(env: &Arc<Environment>, name: String) -> Voices {
        Voices {
            name,
            env: Arc::downgrade(env),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.lock().unwrap().is_some()
    }

    /// Plays a note at the cycle's perceived time.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter cannot be resolved. Nothing is played in that case.
    pub fn send(&self, cycle: &Cycle, note: Note) -> std::result::Result<(), ParseError> {
        if !self.is_enabled() {
            log::debug!("{}: disabled, dropping note", self.voices.name);
            return Ok(());
        }
        let picker = Picker::new(
            cycle.env(),
            note.iterator.as_ref(),
            &note.divisor,
            &note.rate,
            cycle.iteration(),
        )?;
        let picked = (
            picker.pick(&note.note)?,
            picker.pick(&note.velocity)?,
            picker.pick(&note.channel)?,
            picker.pick(&note.duration)?,
        );
        let (number, velocity, channel, duration) = match picked {
            (Some(number), Some(velocity), Some(channel), Some(duration)) => {
                (number, velocity, channel, duration)
            }
            _ => return Ok(()),
        };

        let voices = self.voices.clone();
        cycle.call_timed(move || {
            voices.play(
                clamp(number, DATA_MAX),
                clamp(velocity, DATA_MAX),
                clamp(channel, CHANNEL_MAX),
                duration.max(0.0),
            )
        });
        Ok(())
    }

    /// Sends a control change at the cycle's perceived time, with each parameter picked like a
    /// [`Note`] parameter.
    pub fn send_control(
        &self,
        cycle: &Cycle,
        channel: impl Into<Param>,
        control: impl Into<Param>,
        value: impl Into<Param>,
    ) -> std::result::Result<(), ParseError> {
        let picker = Picker::new(
            cycle.env(),
            None,
            &Param::from(1),
            &Param::from(1),
            cycle.iteration(),
        )?;
        let picked = (
            picker.pick(&channel.into())?,
            picker.pick(&control.into())?,
            picker.pick(&value.into())?,
        );
        if let (Some(channel), Some(control), Some(value)) = picked {
            let message = MidiMessage::ControlChange {
                channel: clamp(channel, CHANNEL_MAX),
                control: clamp(control, DATA_MAX),
                value: clamp(value, DATA_MAX),
            };
            let voices = self.voices.clone();
            cycle.call_timed(move || {
                if let Some(env) = voices.env.upgrade() {
                    voices.dispatch(&env, message);
                }
            });
        }
        Ok(())
    }

    /// Plays a note right away, lasting `duration` beats.
    pub fn play(&self, note: u8, velocity: u8, channel: u8, duration: f64) {
        if self.is_enabled() {
            self.voices.play(
                note.min(DATA_MAX),
                velocity.min(DATA_MAX),
                channel.min(CHANNEL_MAX),
                duration.max(0.0),
            );
        }
    }

    /// Sends a note-off for `note` on `channel` after `delay` beats, replacing any note-off
    /// already pending for that key.
    ///
    /// Cancelling the returned handle more than once, or after it fired, does nothing.
    pub fn send_off(&self, delay: f64, note: u8, channel: u8) -> Option<TimerHandle> {
        let env = self.voices.env.upgrade()?;
        let key = (note.min(DATA_MAX), channel.min(CHANNEL_MAX));
        Some(self.voices.schedule_off(&env, key, delay.max(0.0)))
    }

    /// The number of note-offs waiting to fire.
    pub fn pending_offs(&self) -> usize {
        self.voices.pending()
    }

    /// Sends `message` right away.
    pub fn send_message(&self, message: MidiMessage) {
        if let Some(env) = self.voices.env.upgrade() {
            self.voices.dispatch(&env, message);
        }
    }

    pub fn control_change(&self, channel: u8, control: u8, value: u8) {
        self.send_message(MidiMessage::ControlChange {
            channel,
            control,
            value,
        });
    }

    pub fn program_change(&self, channel: u8, program: u8) {
        self.send_message(MidiMessage::ProgramChange { channel, program });
    }

    pub fn pitchwheel(&self, channel: u8, pitch: i16) {
        self.send_message(MidiMessage::PitchWheel { channel, pitch });
    }

    pub fn polytouch(&self, channel: u8, note: u8, value: u8) {
        self.send_message(MidiMessage::PolyTouch {
            channel,
            note,
            value,
        });
    }

    pub fn aftertouch(&self, channel: u8, value: u8) {
        self.send_message(MidiMessage::AfterTouch { channel, value });
    }

    pub fn sysex(&self, data: Vec<u8>) {
        self.send_message(MidiMessage::SysEx(data));
    }

    pub fn start(&self) {
        self.send_message(MidiMessage::Start);
    }

    /// Sends a transport continue message.
    pub fn resume(&self) {
        self.send_message(MidiMessage::Continue);
    }

    pub fn stop(&self) {
        self.send_message(MidiMessage::Stop);
    }

    pub fn reset(&self) {
        self.send_message(MidiMessage::Reset);
    }

    /// Sends a single timing clock pulse.
    pub fn clock(&self) {
        self.send_message(MidiMessage::Clock);
    }

    /// Silences every sounding note and closes the port.
    pub fn close(&self) {
        self.release_all();
        if self.writer.lock().unwrap().take().is_some() {
            log::debug!("{}: closed", self.voices.name);
        }
    }

    fn release_all(&self) {
        for (note, channel) in self.voices.drain() {
            let message = MidiMessage::NoteOff {
                channel,
                note,
                velocity: 0,
            };
            if let Err(err) = self.write(&message) {
                log::error!("{}: {}", self.voices.name, err);
            }
        }
    }

    fn write(&self, message: &MidiMessage) -> Result<()> {
        match self.writer.lock().unwrap().as_ref() {
            Some(writer) => writer
                .send(message.to_bytes())
                .map_err(|_| Error::WriterClosed),
            None => {
                log::debug!("{}: disabled, dropping {:?}", self.voices.name, message);
                Ok(())
            }
        }
    }
}

impl Handler for MidiHandler {
    fn name(&self) -> &str {
        &self.voices.name
    }

    fn setup(&self) -> EventKinds {
        EventKinds::midi().with(EventKind::Panic)
    }

    fn hook(&self, event: &Event) -> std::result::Result<(), handler::Error> {
        match event {
            Event::Midi { target, message } if *target == self.voices.name => {
                self.write(message)?;
            }
            Event::Panic => self.release_all(),
            _ => {}
        }
        Ok(())
    }

    fn teardown(&self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockConfig;
    use pretty_assertions::assert_eq;
    use std::{
        sync::mpsc::Receiver,
        time::{Duration, Instant},
    };

    fn env() -> Arc<Environment> {
        Environment::new(ClockConfig {
            bpm: 600.0,
            active: false,
            ..ClockConfig::default()
        })
        .unwrap()
    }

    fn handler(env: &Arc<Environment>) -> (Arc<MidiHandler>, Receiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::channel();
        let handler = Arc::new(MidiHandler::with_port(env, "out", sender).unwrap());
        env.add_handler(handler.clone());
        (handler, receiver)
    }

    fn next(receiver: &Receiver<Vec<u8>>) -> MidiMessage {
        let bytes = receiver.recv_timeout(Duration::from_secs(2)).unwrap();
        MidiMessage::from_bytes(&bytes).unwrap()
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn encodes_channel_messages() {
        let cases = vec![
            (
                MidiMessage::NoteOn {
                    channel: 1,
                    note: 60,
                    velocity: 100,
                },
                vec![0x91, 60, 100],
            ),
            (
                MidiMessage::ControlChange {
                    channel: 0,
                    control: 20,
                    value: 64,
                },
                vec![0xB0, 20, 64],
            ),
            (
                MidiMessage::PitchWheel {
                    channel: 2,
                    pitch: 0,
                },
                vec![0xE2, 0x00, 0x40],
            ),
            (MidiMessage::SysEx(vec![1, 2, 3]), vec![0xF0, 1, 2, 3, 0xF7]),
            (MidiMessage::Continue, vec![0xFB]),
        ];
        for (message, bytes) in cases {
            assert_eq!(bytes, message.to_bytes());
            assert_eq!(Some(message), MidiMessage::from_bytes(&bytes));
        }
    }

    #[test]
    fn clamps_out_of_range_fields() {
        assert_eq!(
            vec![0xC0 | 15, 127],
            MidiMessage::ProgramChange {
                channel: 99,
                program: 255,
            }
            .to_bytes()
        );
        assert_eq!(
            vec![0xE0, 0x7F, 0x7F],
            MidiMessage::PitchWheel {
                channel: 0,
                pitch: i16::MAX,
            }
            .to_bytes()
        );
        assert_eq!(
            vec![0xF0, 127, 5, 0xF7],
            MidiMessage::SysEx(vec![200, 5]).to_bytes()
        );
        assert_eq!(0, clamp(-4.0, DATA_MAX));
        assert_eq!(127, clamp(300.0, DATA_MAX));
        assert_eq!(15, clamp(16.0, CHANNEL_MAX));
        assert_eq!(0, clamp(f64::NAN, DATA_MAX));
    }

    #[test]
    fn rejects_truncated_messages() {
        assert_eq!(None, MidiMessage::from_bytes(&[]));
        assert_eq!(None, MidiMessage::from_bytes(&[0x90, 60]));
        assert_eq!(None, MidiMessage::from_bytes(&[0xF0, 1, 2]));
    }

    #[test]
    fn plays_note_then_releases_it() {
        let env = env();
        let (midi, output) = handler(&env);

        // At 600 bpm a beat is 100ms.
        midi.play(60, 100, 0, 1.0);
        assert_eq!(
            MidiMessage::NoteOn {
                channel: 0,
                note: 60,
                velocity: 100
            },
            next(&output)
        );
        assert_eq!(
            MidiMessage::NoteOff {
                channel: 0,
                note: 60,
                velocity: 0
            },
            next(&output)
        );
        wait_for(|| midi.pending_offs() == 0);
    }

    #[test]
    fn retrigger_keeps_a_single_pending_off() {
        let env = env();
        let (midi, output) = handler(&env);

        // One beat is 100ms. The second call's single beat decides when the note ends.
        midi.play(60, 100, 0, 4.0);
        midi.play(60, 90, 0, 1.0);
        let retriggered = Instant::now();
        assert_eq!(1, midi.pending_offs());

        assert_eq!(
            vec![
                MidiMessage::NoteOn {
                    channel: 0,
                    note: 60,
                    velocity: 100
                },
                MidiMessage::NoteOn {
                    channel: 0,
                    note: 60,
                    velocity: 90
                },
            ],
            vec![next(&output), next(&output)]
        );
        assert_eq!(
            MidiMessage::NoteOff {
                channel: 0,
                note: 60,
                velocity: 0
            },
            next(&output)
        );
        let held = retriggered.elapsed();
        assert!(
            held > Duration::from_millis(50) && held < Duration::from_millis(250),
            "note held for {:?}",
            held
        );
        assert!(output.recv_timeout(Duration::from_millis(500)).is_err());
        assert_eq!(0, midi.pending_offs());
    }

    #[test]
    fn cancelling_a_note_off_is_idempotent() {
        let env = env();
        let (midi, output) = handler(&env);

        let handle = midi.send_off(1.0, 64, 3).unwrap();
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(output.recv_timeout(Duration::from_millis(300)).is_err());

        let handle = midi.send_off(0.0, 64, 3).unwrap();
        assert_eq!(
            MidiMessage::NoteOff {
                channel: 3,
                note: 64,
                velocity: 0
            },
            next(&output)
        );
        assert!(!handle.cancel());
    }

    #[test]
    fn panic_releases_sounding_notes() {
        let env = env();
        let (midi, output) = handler(&env);

        midi.play(48, 100, 0, 50.0);
        midi.play(52, 100, 0, 50.0);
        next(&output);
        next(&output);

        env.dispatch(&Event::Panic);
        assert_eq!(0, midi.pending_offs());
        let released: Vec<_> = (0..2).map(|_| next(&output)).collect();
        assert_eq!(
            vec![
                MidiMessage::NoteOff {
                    channel: 0,
                    note: 48,
                    velocity: 0
                },
                MidiMessage::NoteOff {
                    channel: 0,
                    note: 52,
                    velocity: 0
                },
            ],
            released
        );
    }

    #[test]
    fn handlers_only_write_their_own_messages() {
        let env = env();
        let (first, first_output) = handler(&env);
        let (sender, second_output) = mpsc::channel();
        env.add_handler(Arc::new(
            MidiHandler::with_port(&env, "second", sender).unwrap(),
        ));

        first.control_change(0, 7, 100);
        assert_eq!(
            MidiMessage::ControlChange {
                channel: 0,
                control: 7,
                value: 100
            },
            next(&first_output)
        );
        assert!(second_output
            .recv_timeout(Duration::from_millis(100))
            .is_err());
    }

    #[test]
    fn send_picks_pattern_elements_by_iteration() {
        let env = env();
        let (midi, output) = handler(&env);
        let cycle = Cycle::new(env.clone(), "arp".to_owned(), 0, 2, Vec::new());

        midi.send(
            &cycle,
            Note::new().note("60 64 67").velocity(200).duration(0.5),
        )
        .unwrap();
        assert_eq!(
            MidiMessage::NoteOn {
                channel: 0,
                note: 67,
                velocity: 127
            },
            next(&output)
        );
        assert_eq!(
            MidiMessage::NoteOff {
                channel: 0,
                note: 67,
                velocity: 0
            },
            next(&output)
        );
    }

    #[test]
    fn rests_and_bad_patterns_play_nothing() {
        let env = env();
        let (midi, output) = handler(&env);
        let cycle = Cycle::new(env.clone(), "rest".to_owned(), 0, 1, Vec::new());

        midi.send(&cycle, Note::new().note("60 ~")).unwrap();
        assert_eq!(
            Err(ParseError::NotANumber("bd".to_owned())),
            midi.send(&cycle, Note::new().note("bd"))
        );
        assert!(output.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn disabled_handler_drops_everything() {
        let env = env();
        let midi = Arc::new(MidiHandler::disabled(&env, "off"));
        env.add_handler(midi.clone());

        assert!(!midi.is_enabled());
        midi.play(60, 100, 0, 1.0);
        midi.start();
        assert_eq!(0, midi.pending_offs());
    }
}
