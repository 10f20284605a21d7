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

//! Swimming functions: user code invoked on a musical schedule.
//!
//! A _runner_ is a named function scheduled on an [`Environment`]. When its due tick arrives the
//! environment invokes it on the runner thread with a fresh [`Cycle`]. The function plays
//! whatever it wants to play, then decides whether and when it runs again by calling
//! [`Cycle::again`]. A function that does not ask to run again is finished and removed.
//!
//! ```no_run
//! use shoal::{
//!     midi::{MidiHandler, Note},
//!     ClockConfig, Cycle, Environment, SwimResult,
//! };
//! use std::sync::Arc;
//!
//! let env = Environment::new(ClockConfig::default())?;
//! let midi = Arc::new(MidiHandler::open(&env, None));
//! env.add_handler(midi.clone());
//!
//! env.schedule("bass", move |cycle: &mut Cycle| -> SwimResult {
//!     midi.send(cycle, Note::new().note("36 36 43 41"))?;
//!     cycle.sleep(0.5);
//!     midi.send(cycle, Note::new().note(48).velocity(80))?;
//!     cycle.again(1.0);
//!     Ok(())
//! });
//! # Ok::<(), shoal::clock::Error>(())
//! ```
//!
//! # Redefinition
//!
//! Scheduling a function under a name that is already in use replaces the runner's function and
//! arguments while keeping its cadence. If the old function is running at that moment it is
//! allowed to finish, but its request to run again is ignored. There is never more than one live
//! runner per name.
//!
//! # Time inside a cycle
//!
//! [`Cycle::sleep`] does not block. It shifts the cycle's perceived time forward, and everything
//! the cycle plays afterwards is timestamped at the shifted instant, so a single function body can
//! lay out a whole phrase. Real time spent inside the function is added on top of the shift.
//!
//! # Order
//!
//! Runners due on the same tick are invoked one after another, in the order they were first
//! scheduled. Functions are expected to return quickly: one that blocks holds up every runner
//! after it.
//!
//! # Failures
//!
//! A function that returns an error or panics is logged and removed. The clock and all other
//! runners carry on.

use crate::{event::Event, pattern::Value, timer::TimerHandle, Environment};
use std::{
    error::Error as StdError,
    fmt,
    sync::{Arc, Weak},
    time::Instant,
};
use thiserror::Error;

mod executor;
mod registry;

pub(crate) use executor::Executor;

pub(crate) use registry::{panic_message, Invocation, Runners};

/// A boxed error returned from user code.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// The result of a single invocation of a swimming function.
pub type SwimResult = std::result::Result<(), BoxError>;

/// Arguments passed to a runner. They can be replaced on each cycle with [`Cycle::again_with`].
pub type Args = Vec<Value>;

/// A function that can be scheduled as a runner.
///
/// This is implemented for every `FnMut(&mut Cycle) -> SwimResult` closure, which is how most
/// runners are written. Implement it directly for runners that carry their own state.
pub trait Swim: Send + 'static {
    fn swim(&mut self, cycle: &mut Cycle) -> SwimResult;
}

impl<F> Swim for F
where
    F: FnMut(&mut Cycle) -> SwimResult + Send + 'static,
{
    fn swim(&mut self, cycle: &mut Cycle) -> SwimResult {
        self(cycle)
    }
}

/// The state of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Waiting for its first due tick, or for the first due tick after a redefinition.
    Scheduled,
    /// An invocation is in flight.
    Running,
    /// The last invocation asked to run again.
    AwaitingNextCycle,
    /// The last invocation did not ask to run again, or the runner was removed.
    Cancelled,
    /// The last invocation failed.
    Errored,
}

/// Why an invocation failed.
#[derive(Debug, Error)]
pub enum Error {
    #[error("runner failed")]
    Failed(#[source] BoxError),
    #[error("runner panicked: {0}")]
    Panicked(String),
}

/// A request made by [`Cycle::again`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Again {
    pub(crate) ticks: u64,
    pub(crate) args: Option<Args>,
}

/// The context of a single invocation of a runner.
pub struct Cycle {
    env: Arc<Environment>,
    name: String,
    due: u64,
    shift: u64,
    iteration: u64,
    args: Args,
    again: Option<Again>,
}

impl Cycle {
    pub(crate) fn new(
        env: Arc<Environment>,
        name: String,
        due: u64,
        iteration: u64,
        args: Args,
    ) -> Cycle {
        Cycle {
            env,
            name,
            due,
            shift: 0,
            iteration,
            args,
            again: None,
        }
    }

    /// The runner's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    /// How many times this runner has run before, starting at zero.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// The tick this invocation was due at.
    pub fn due(&self) -> u64 {
        self.due
    }

    /// Shifts this cycle's perceived time forward by `beats`, rounded to the nearest tick.
    ///
    /// This never blocks.
    pub fn sleep(&mut self, beats: f64) {
        self.shift += self.env.beats_to_ticks(beats);
    }

    /// The total shift accumulated by [`sleep`](Cycle::sleep), in ticks.
    pub fn shift(&self) -> u64 {
        self.shift
    }

    /// The perceived tick: the clock's current tick plus the accumulated shift.
    pub fn tick(&self) -> u64 {
        self.env.tick() + self.shift
    }

    /// The wall-clock instant of the perceived tick.
    pub fn deadline(&self) -> Instant {
        let state = self.env.clock_state();
        let base = state.last_tick_at().unwrap_or_else(Instant::now);
        base + state.ticks_to_duration(self.shift)
    }

    /// Runs this function again `beats` after the tick this invocation was due at.
    ///
    /// Calling this more than once keeps the last request.
    pub fn again(&mut self, beats: f64) {
        self.again = Some(Again {
            ticks: self.env.beats_to_ticks(beats),
            args: None,
        });
    }

    /// Like [`again`](Cycle::again), but replaces the runner's arguments for the next cycle.
    pub fn again_with(&mut self, beats: f64, args: Args) {
        self.again = Some(Again {
            ticks: self.env.beats_to_ticks(beats),
            args: Some(args),
        });
    }

    /// Dispatches `event` at this cycle's [deadline](Cycle::deadline).
    pub fn push(&self, event: Event) -> Option<TimerHandle> {
        let env = Arc::downgrade(&self.env);
        self.call_timed(move || dispatch(&env, &event))
    }

    /// Runs `action` at this cycle's [deadline](Cycle::deadline).
    ///
    /// Runs it right away, returning `None`, if the deadline is not in the future.
    pub fn call_timed<F>(&self, action: F) -> Option<TimerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = self.deadline();
        if deadline <= Instant::now() {
            action();
            None
        } else {
            Some(self.env.timer().call_at(deadline, action))
        }
    }

    pub(crate) fn take_again(&mut self) -> Option<Again> {
        self.again.take()
    }
}

impl fmt::Debug for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cycle")
            .field("name", &self.name)
            .field("due", &self.due)
            .field("shift", &self.shift)
            .field("iteration", &self.iteration)
            .field("args", &self.args)
            .field("again", &self.again)
            .finish()
    }
}

fn dispatch(env: &Weak<Environment>, event: &Event) {
    if let Some(env) = env.upgrade() {
        env.dispatch(event);
    }
}

/// Formats an error followed by each of its sources.
pub(crate) fn chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io;

    #[test]
    fn chain_includes_sources() {
        let err = Error::Failed(Box::new(io::Error::new(io::ErrorKind::Other, "device gone")));
        assert_eq!("runner failed: device gone", chain(&err));
    }
}
