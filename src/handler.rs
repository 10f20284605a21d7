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

//! The handler contract.

use crate::event::{Event, EventKinds};

/// The error type handlers return from [`Handler::hook`].
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Something that reacts to events dispatched by an [`Environment`](crate::Environment).
///
/// Handlers are registered with
/// [`Environment::add_handler`](crate::Environment::add_handler), which calls
/// [`setup`](Handler::setup) once to learn which event kinds to deliver. Only those kinds ever
/// reach [`hook`](Handler::hook).
///
/// A failing or panicking hook is logged by the environment and does not affect delivery to any
/// other handler.
pub trait Handler: Send + Sync + 'static {
    /// A name, unique within an environment.
    fn name(&self) -> &str;

    /// Returns the event kinds this handler subscribes to.
    fn setup(&self) -> EventKinds;

    /// Handles a dispatched event.
    fn hook(&self, event: &Event) -> Result<(), Error>;

    /// Releases the handler's resources. Called when the handler is removed.
    fn teardown(&self) {}
}
