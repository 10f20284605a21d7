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

use super::{ClockSource, ClockState, Result};
use std::time::Instant;

/// A free running clock.
///
/// Tick boundaries are computed from an absolute expected instant rather than by sleeping for one
/// period after each wake up. Lateness in one wake up therefore shortens the next wait, and drift
/// does not accumulate. If the clock falls more than a beat behind, for example after the host was
/// suspended, it re-anchors at the current instant instead of delivering a burst of ticks.
#[derive(Debug, Default)]
pub struct InternalClock {
    expected: Option<Instant>,
}

impl InternalClock {
    pub fn new() -> InternalClock {
        InternalClock::default()
    }
}

impl ClockSource for InternalClock {
    fn name(&self) -> &str {
        "internal"
    }

    fn reset(&mut self, _state: &ClockState, now: Instant) {
        self.expected = Some(now);
    }

    fn next_boundary(&mut self, state: &mut ClockState, now: Instant) -> Result<Instant> {
        let period = state.tick_duration();
        let last = *self.expected.get_or_insert(now);
        let mut next = last + period;

        let behind = now.saturating_duration_since(next);
        if behind > state.tempo().beat_duration() {
            log::warn!(
                "internal clock fell {:.3}s behind at tick {}, re-anchoring",
                behind.as_secs_f64(),
                state.tick()
            );
            next = now;
        }

        self.expected = Some(next);
        Ok(next)
    }
}
