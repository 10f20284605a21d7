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

//! Events carried by the environment's dispatch bus.

use crate::midi::{MidiKind, MidiMessage};
use rosc::OscType;
use std::collections::BTreeSet;

/// Something that happened in the environment.
///
/// Events are delivered by [`Environment::dispatch`](crate::Environment::dispatch) to every
/// handler that subscribed to the event's [`EventKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The clock advanced to the given tick.
    Tick(u64),
    /// The clock started.
    Start,
    /// The clock was paused.
    Pause,
    /// The clock resumed after a pause.
    Resume,
    /// The clock stopped, either on request or because it failed.
    Stop,
    /// A MIDI message for the [`MidiHandler`](crate::midi::MidiHandler) named `target`.
    Midi {
        target: String,
        message: MidiMessage,
    },
    /// An OSC message for the [`OscHandler`](crate::osc::OscHandler) named `target`.
    Osc {
        target: String,
        address: String,
        args: Vec<OscType>,
    },
    /// Arguments of a `/dirt/play` message.
    DirtPlay(Vec<OscType>),
    /// Silence everything.
    Panic,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Tick(_) => EventKind::Tick,
            Event::Start => EventKind::Start,
            Event::Pause => EventKind::Pause,
            Event::Resume => EventKind::Resume,
            Event::Stop => EventKind::Stop,
            Event::Midi { message, .. } => EventKind::Midi(message.kind()),
            Event::Osc { .. } => EventKind::Osc,
            Event::DirtPlay(_) => EventKind::DirtPlay,
            Event::Panic => EventKind::Panic,
        }
    }
}

/// The kind of an [`Event`], used for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    Tick,
    Start,
    Pause,
    Resume,
    Stop,
    Midi(MidiKind),
    Osc,
    DirtPlay,
    Panic,
}

/// The set of event kinds a handler subscribes to.
///
/// # Examples
///
/// ```
/// use shoal::event::{EventKind, EventKinds};
/// use shoal::midi::MidiKind;
///
/// let kinds = EventKinds::new()
///     .with(EventKind::Midi(MidiKind::NoteOn))
///     .with(EventKind::Panic);
/// assert!(kinds.contains(EventKind::Panic));
/// assert!(!kinds.contains(EventKind::Tick));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventKinds(BTreeSet<EventKind>);

impl EventKinds {
    pub fn new() -> EventKinds {
        EventKinds::default()
    }

    /// Every MIDI message kind.
    pub fn midi() -> EventKinds {
        MidiKind::ALL
            .iter()
            .map(|&kind| EventKind::Midi(kind))
            .collect()
    }

    pub fn with(mut self, kind: EventKind) -> EventKinds {
        self.0.insert(kind);
        self
    }

    pub fn contains(&self, kind: EventKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = EventKind> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<EventKind> for EventKinds {
    fn from_iter<I: IntoIterator<Item = EventKind>>(iter: I) -> EventKinds {
        EventKinds(iter.into_iter().collect())
    }
}

impl Extend<EventKind> for EventKinds {
    fn extend<I: IntoIterator<Item = EventKind>>(&mut self, iter: I) {
        self.0.extend(iter)
    }
}
