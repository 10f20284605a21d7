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

//! A live-coding environment for making music with Rust.
//!
//! # Introduction
//!
//! Music is written as _swimming functions_: small closures that play something, then ask to be
//! called again a few beats later. An [`Environment`] owns a tick-accurate musical clock and calls
//! each function when it is due. Functions can be redefined while they play, so a piece can be
//! changed without stopping the music.
//!
//! The crate is organized as follows:
//!
//!  * [`clock`](crate::clock) - The musical clock. Ticks come from an internal source that corrects
//!    its own drift, or from a source that follows a peer's timeline over OSC.
//!
//!  * [`runner`](crate::runner) - Scheduling of swimming functions, and the [`Cycle`] each
//!    invocation receives. [`Cycle::sleep`] shifts a function's sense of time without blocking.
//!
//!  * [`event`](crate::event) and [`handler`](crate::handler) - Everything the environment does
//!    is broadcast as an [`Event`](event::Event) to the handlers subscribed to it. Handlers are
//!    isolated from each other: one that fails or panics never disturbs the rest.
//!
//!  * [`midi`](crate::midi) - MIDI output with monophonic note handling, and a buffered MIDI input.
//!
//!  * [`osc`](crate::osc) - OSC output, including a handler for SuperDirt.
//!
//!  * [`pattern`](crate::pattern) - Values and the small list language used to write patterns
//!    such as `"60 62 64|67"`.
//!
//!  * [`timer`](crate::timer) - Delayed actions, used for note-offs and timed sends.
//!
//! # Examples
//!
//! This example plays a four note arpeggio on the default MIDI output, one note every half beat.
//!
//! ```no_run
//! use shoal::{
//!     midi::{MidiHandler, Note},
//!     ClockConfig, Cycle, Environment, SwimResult,
//! };
//! use std::{sync::Arc, thread::sleep, time::Duration};
//!
//! // A clock at 110 beats per minute. It starts ticking right away.
//! let env = Environment::new(ClockConfig {
//!     bpm: 110.0,
//!     ..ClockConfig::default()
//! })?;
//!
//! // Without the `device` feature, or without a MIDI port, the handler is disabled and only logs.
//! let midi = Arc::new(MidiHandler::open(&env, None));
//! env.add_handler(midi.clone());
//!
//! env.schedule("arp", move |cycle: &mut Cycle| -> SwimResult {
//!     // The cycle iteration picks one element of the list each time.
//!     midi.send(cycle, Note::new().note("60 64 67 72").duration(0.25))?;
//!     cycle.again(0.5);
//!     Ok(())
//! });
//!
//! sleep(Duration::from_secs(8));
//! env.remove_all();
//! # Ok::<(), shoal::clock::Error>(())
//! ```

pub mod clock;
mod environment;
pub mod event;
pub mod handler;
pub mod midi;
pub mod osc;
pub mod pattern;
pub mod runner;
pub mod timer;

pub use clock::ClockConfig;
pub use environment::Environment;
pub use pattern::{Param, Value};
pub use runner::{Cycle, Swim, SwimResult};
