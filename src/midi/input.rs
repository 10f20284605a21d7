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

//! Buffered MIDI input.

use super::{Error, MidiMessage, Result};
use crate::{
    event::{Event, EventKinds},
    handler::{self, Handler},
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

/// How many messages a [`MidiQueue`] holds by default.
pub const DEFAULT_CAPACITY: usize = 20;

/// Restricts which inbound messages are queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenTarget {
    /// Only control changes for `control` on `channel`.
    Control { control: u8, channel: u8 },
    /// Only messages on this channel.
    Channel(u8),
}

impl ListenTarget {
    pub fn matches(&self, message: &MidiMessage) -> bool {
        match *self {
            ListenTarget::Control { control, channel } => matches!(
                *message,
                MidiMessage::ControlChange { channel: c, control: n, .. } if c == channel && n == control
            ),
            ListenTarget::Channel(channel) => message.channel() == Some(channel),
        }
    }
}

/// What a read from a [`MidiQueue`] returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reading {
    /// The value of a control change, or the note number of a note message.
    Value(u8),
    /// Any other message, unchanged.
    Message(MidiMessage),
}

/// Projects a message to the number a runner usually wants from it.
///
/// Control changes become their value and note messages their note number. Everything else is
/// returned as is.
///
/// # Examples
///
/// ```
/// use shoal::midi::{extract_value, MidiMessage, Reading};
///
/// let knob = MidiMessage::ControlChange { channel: 0, control: 20, value: 64 };
/// assert_eq!(Reading::Value(64), extract_value(knob));
/// assert_eq!(Reading::Message(MidiMessage::Start), extract_value(MidiMessage::Start));
/// ```
pub fn extract_value(message: MidiMessage) -> Reading {
    match message {
        MidiMessage::ControlChange { value, .. } => Reading::Value(value),
        MidiMessage::NoteOn { note, .. } | MidiMessage::NoteOff { note, .. } => {
            Reading::Value(note)
        }
        message => Reading::Message(message),
    }
}

/// A bounded FIFO of inbound messages.
///
/// When full, the oldest message is dropped to make room. Reads never fail: reading an empty
/// queue returns whatever the previous read returned, which starts out as `Value(0)`. A runner can
/// therefore poll a knob every cycle and keep its last position between moves.
#[derive(Debug, Clone)]
pub struct MidiQueue {
    capacity: usize,
    target: Option<ListenTarget>,
    messages: VecDeque<MidiMessage>,
    last: Reading,
}

impl MidiQueue {
    pub fn new(target: Option<ListenTarget>) -> MidiQueue {
        MidiQueue::with_capacity(DEFAULT_CAPACITY, target)
    }

    pub fn with_capacity(capacity: usize, target: Option<ListenTarget>) -> MidiQueue {
        let capacity = capacity.max(1);
        MidiQueue {
            capacity,
            target,
            messages: VecDeque::with_capacity(capacity),
            last: Reading::Value(0),
        }
    }

    pub fn target(&self) -> Option<ListenTarget> {
        self.target
    }

    /// Queues `message` if it passes the target filter. Returns `false` if it was filtered out.
    pub fn accept(&mut self, message: MidiMessage) -> bool {
        if let Some(target) = self.target {
            if !target.matches(&message) {
                return false;
            }
        }
        if self.messages.len() == self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
        true
    }

    /// Takes the oldest message.
    pub fn get(&mut self) -> Reading {
        if let Some(message) = self.messages.pop_front() {
            self.last = extract_value(message);
        }
        self.last.clone()
    }

    /// Takes the newest message and discards the rest.
    pub fn get_last(&mut self) -> Reading {
        if let Some(message) = self.messages.pop_back() {
            self.messages.clear();
            self.last = extract_value(message);
        }
        self.last.clone()
    }

    /// [`get_last`](MidiQueue::get_last) if `last` is set, otherwise [`get`](MidiQueue::get).
    pub fn read(&mut self, last: bool) -> Reading {
        if last {
            self.get_last()
        } else {
            self.get()
        }
    }

    /// The queued messages, oldest first.
    pub fn inspect(&self) -> Vec<MidiMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Listens on a MIDI input port and queues what arrives for runners to read.
///
/// The handler subscribes to no events; registering it with an environment ties the port's
/// lifetime to the environment.
pub struct MidiInHandler {
    name: String,
    queue: Arc<Mutex<MidiQueue>>,
    #[cfg(feature = "device")]
    connection: Mutex<Option<midir::MidiInputConnection<()>>>,
}

impl MidiInHandler {
    /// Listens on the input port named `port`, or the first input port when `port` is `None`.
    ///
    /// If the port cannot be opened the error is logged and the handler is created without one;
    /// reads then keep returning the initial value.
    pub fn open(target: Option<ListenTarget>, port: Option<&str>) -> MidiInHandler {
        let handler = MidiInHandler::with_queue("midi-in", MidiQueue::new(target));
        if let Err(err) = handler.listen(port) {
            log::error!("MIDI input disabled: {}", err);
        }
        handler
    }

    /// Creates a handler around `queue` without opening a port. Messages are fed with
    /// [`feed`](MidiInHandler::feed).
    pub fn with_queue(name: impl Into<String>, queue: MidiQueue) -> MidiInHandler {
        MidiInHandler {
            name: name.into(),
            queue: Arc::new(Mutex::new(queue)),
            #[cfg(feature = "device")]
            connection: Mutex::new(None),
        }
    }

    #[cfg(feature = "device")]
    fn listen(&self, port: Option<&str>) -> Result<()> {
        use midir::MidiInput;

        let input = MidiInput::new("shoal").map_err(Error::Init)?;
        let ports = input.ports();
        let selected = match port {
            Some(name) => ports
                .iter()
                .find(|port| {
                    input
                        .port_name(port)
                        .map(|port_name| port_name == name || port_name.contains(name))
                        .unwrap_or(false)
                })
                .ok_or_else(|| Error::PortNotFound(name.to_owned()))?,
            None => ports.first().ok_or(Error::NoPorts)?,
        };

        let queue = Arc::clone(&self.queue);
        let connection = input
            .connect(
                selected,
                "shoal-in",
                move |_, bytes, _| {
                    if let Some(message) = MidiMessage::from_bytes(bytes) {
                        queue.lock().unwrap().accept(message);
                    }
                },
                (),
            )
            .map_err(|err| Error::Connect(err.to_string()))?;
        *self.connection.lock().unwrap() = Some(connection);
        Ok(())
    }

    #[cfg(not(feature = "device"))]
    fn listen(&self, _port: Option<&str>) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Decodes and queues raw bytes as if they came from the port.
    pub fn feed(&self, bytes: &[u8]) -> bool {
        match MidiMessage::from_bytes(bytes) {
            Some(message) => self.queue.lock().unwrap().accept(message),
            None => {
                log::debug!("{}: ignoring undecodable input {:?}", self.name, bytes);
                false
            }
        }
    }

    pub fn get(&self) -> Reading {
        self.queue.lock().unwrap().get()
    }

    pub fn get_last(&self) -> Reading {
        self.queue.lock().unwrap().get_last()
    }

    pub fn read(&self, last: bool) -> Reading {
        self.queue.lock().unwrap().read(last)
    }

    pub fn inspect(&self) -> Vec<MidiMessage> {
        self.queue.lock().unwrap().inspect()
    }

    /// Stops listening. Queued messages can still be read.
    pub fn close(&self) {
        self.disconnect();
    }

    #[cfg(feature = "device")]
    fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().unwrap().take() {
            connection.close();
            log::debug!("{}: closed", self.name);
        }
    }

    #[cfg(not(feature = "device"))]
    fn disconnect(&self) {}
}

impl Handler for MidiInHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&self) -> EventKinds {
        EventKinds::new()
    }

    fn hook(&self, _event: &Event) -> std::result::Result<(), handler::Error> {
        Ok(())
    }

    fn teardown(&self) {
        self.close();
    }
}
