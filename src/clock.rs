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

//! Clocks that drive an [`Environment`](crate::Environment).
//!
//! A clock produces _ticks_, the smallest schedulable unit of musical time. The tick rate is
//! derived from a [`Tempo`] and a resolution given in pulses per quarter note (ppqn):
//!
//! ```text
//! tick period = 60 / (bpm * ppqn) seconds
//! ```
//!
//! The environment owns exactly one active clock. The clock runs on its own thread and, for every
//! tick, advances the [`ClockState`] and asks the environment to dispatch
//! [`Event::Tick`](crate::event::Event::Tick) and run any due runners. _When_ the next tick happens
//! is decided by a [`ClockSource`]. Two sources are provided:
//!
//! * [`InternalClock`] - a free running clock with closed-loop drift correction.
//! * [`SyncedClock`] - a clock that follows the beat position and tempo of an external time-sync
//!   [`Peer`], so that independent processes agree on where the beat is.
//!
//! The clock thread only ever suspends between ticks. If the suspension fails the clock stops and
//! the failure is recorded on the environment. The tick counter is never rewound or skipped.

use crate::{event::Event, runner::panic_message, Environment};
use serde::{Deserialize, Serialize};
use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;

mod internal;
mod synced;

pub use internal::InternalClock;
pub use synced::{OscPeer, Peer, SyncedClock, Timeline};

/// A specialized [`Result`] type for clock operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned by clock operations.
///
/// The `Tempo`, `Ppqn`, `BeatsPerBar` and `Tolerance` variants are configuration errors. They are
/// returned when an environment is set up and never while the clock is running.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid tempo {0}: must be finite and greater than zero")]
    Tempo(f64),
    #[error("invalid ppqn {0}: must be greater than zero")]
    Ppqn(u32),
    #[error("invalid beats per bar {0}: must be greater than zero")]
    BeatsPerBar(u32),
    #[error("invalid deferred scheduling tolerance {0}: must be finite and not negative")]
    Tolerance(f64),
    #[error("clock control channel disconnected while waiting for the next tick")]
    Disconnected,
    #[error("time-sync peer failed: {0}")]
    Peer(#[source] io::Error),
    #[error("spawning clock thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("clock source was lost when the clock thread panicked")]
    SourceLost,
    #[error("time-sync position {0} cannot be placed on the local clock")]
    Timeline(f64),
    #[error("clock source panicked: {0}")]
    SourcePanicked(String),
}

/// A musical tempo.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Tempo {
    bpm: f64,
}

impl Default for Tempo {
    /// Returns a tempo of 120 BPM (beats per minute).
    fn default() -> Tempo {
        Tempo { bpm: 120.0 }
    }
}

impl Tempo {
    /// Create a tempo from a BPM (beats per minute).
    ///
    /// # Errors
    ///
    /// Returns an error if `bpm` is not finite, not positive, or so slow that a beat cannot be
    /// represented as a [`Duration`].
    ///
    /// # Examples
    ///
    /// ```
    /// use shoal::clock::Tempo;
    /// use std::time::Duration;
    ///
    /// let tempo = Tempo::from_bpm(120.0).unwrap();
    /// assert_eq!(tempo.beat_duration(), Duration::from_millis(500));
    /// assert_eq!(tempo.tick_duration(4), Duration::from_millis(125));
    /// assert!(Tempo::from_bpm(0.0).is_err());
    /// ```
    pub fn from_bpm(bpm: f64) -> Result<Tempo> {
        if !bpm.is_finite() || bpm <= 0.0 || Duration::try_from_secs_f64(60.0 / bpm).is_err() {
            return Err(Error::Tempo(bpm));
        }
        Ok(Tempo { bpm })
    }

    /// Beats per minute.
    pub fn bpm(self) -> f64 {
        self.bpm
    }

    /// The duration of a single beat.
    pub fn beat_duration(self) -> Duration {
        Duration::from_secs_f64(60.0 / self.bpm)
    }

    /// The duration of a single tick at the given resolution.
    pub fn tick_duration(self, ppqn: u32) -> Duration {
        Duration::from_secs_f64(60.0 / (self.bpm * f64::from(ppqn)))
    }
}

/// A snapshot of the clock.
///
/// Returned by [`Environment::clock_state`](crate::Environment::clock_state). The live state is
/// owned by the environment and is only advanced by the clock thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockState {
    tick: u64,
    tempo: Tempo,
    ppqn: u32,
    beats_per_bar: u32,
    running: bool,
    paused: bool,
    last_tick_at: Option<Instant>,
}

impl ClockState {
    /// Create a stopped clock state at tick zero.
    ///
    /// # Errors
    ///
    /// Returns an error if `ppqn` or `beats_per_bar` are zero.
    pub fn new(tempo: Tempo, ppqn: u32, beats_per_bar: u32) -> Result<ClockState> {
        if ppqn == 0 {
            return Err(Error::Ppqn(ppqn));
        }
        if beats_per_bar == 0 {
            return Err(Error::BeatsPerBar(beats_per_bar));
        }
        Ok(ClockState {
            tick: 0,
            tempo,
            ppqn,
            beats_per_bar,
            running: false,
            paused: false,
            last_tick_at: None,
        })
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn tempo(&self) -> Tempo {
        self.tempo
    }

    pub fn ppqn(&self) -> u32 {
        self.ppqn
    }

    pub fn beats_per_bar(&self) -> u32 {
        self.beats_per_bar
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// The instant at which the current tick was produced, if any tick was produced yet.
    pub fn last_tick_at(&self) -> Option<Instant> {
        self.last_tick_at
    }

    /// Number of whole beats elapsed since tick zero.
    pub fn beat(&self) -> u64 {
        self.tick / u64::from(self.ppqn)
    }

    /// Number of whole bars elapsed since tick zero.
    pub fn bar(&self) -> u64 {
        self.beat() / u64::from(self.beats_per_bar)
    }

    /// The beat within the current bar, starting at zero.
    pub fn beat_in_bar(&self) -> u64 {
        self.beat() % u64::from(self.beats_per_bar)
    }

    /// Position within the current beat, in the range `[0, 1)`.
    pub fn phase(&self) -> f64 {
        (self.tick % u64::from(self.ppqn)) as f64 / f64::from(self.ppqn)
    }

    /// Converts beats to ticks, rounding to the nearest tick. Negative beats count as zero.
    pub fn beats_to_ticks(&self, beats: f64) -> u64 {
        if !beats.is_finite() || beats <= 0.0 {
            return 0;
        }
        (beats * f64::from(self.ppqn)).round() as u64
    }

    pub fn tick_duration(&self) -> Duration {
        self.tempo.tick_duration(self.ppqn)
    }

    /// Saturates at [`Duration::MAX`].
    pub fn ticks_to_duration(&self, ticks: u64) -> Duration {
        let secs = ticks as f64 * 60.0 / (self.tempo.bpm * f64::from(self.ppqn));
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Negative beats count as zero. Saturates at [`Duration::MAX`].
    pub fn beats_to_duration(&self, beats: f64) -> Duration {
        if !beats.is_finite() || beats <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(beats * 60.0 / self.tempo.bpm).unwrap_or(Duration::MAX)
    }

    pub(crate) fn set_tempo(&mut self, tempo: Tempo) {
        self.tempo = tempo;
    }

    pub(crate) fn set_beats_per_bar(&mut self, beats_per_bar: u32) -> Result<()> {
        if beats_per_bar == 0 {
            return Err(Error::BeatsPerBar(beats_per_bar));
        }
        self.beats_per_bar = beats_per_bar;
        Ok(())
    }

    fn advance(&mut self, now: Instant) -> u64 {
        self.tick += 1;
        self.last_tick_at = Some(now);
        self.tick
    }
}

/// Selects the [`ClockSource`] built by [`ClockConfig::source`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Internal,
    Synced,
}

/// Clock configuration.
///
/// Loading this from a file is left to the host program; the struct deserializes with `serde`
/// and every missing field falls back to its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Tempo in beats per minute. Defaults to 120.
    pub bpm: f64,
    /// Defaults to 4.
    pub beats_per_bar: u32,
    /// Clock resolution in pulses per quarter note. Defaults to 48.
    pub ppqn: u32,
    /// When enabled, a runner that is due more than `deferred_tolerance` beats in the past skips
    /// the missed cycles instead of running very late. Defaults to `true`.
    pub deferred_scheduling: bool,
    /// Lateness tolerance in beats. Defaults to half a beat.
    pub deferred_tolerance: f64,
    /// Defaults to [`SourceKind::Internal`].
    pub source: SourceKind,
    /// UDP address the [`OscPeer`] listens on when `source` is [`SourceKind::Synced`].
    pub sync_address: String,
    /// Start the clock as soon as the environment is created. Defaults to `true`.
    pub active: bool,
}

impl Default for ClockConfig {
    fn default() -> ClockConfig {
        ClockConfig {
            bpm: 120.0,
            beats_per_bar: 4,
            ppqn: 48,
            deferred_scheduling: true,
            deferred_tolerance: 0.5,
            source: SourceKind::Internal,
            sync_address: "127.0.0.1:57130".to_owned(),
            active: true,
        }
    }
}

impl ClockConfig {
    /// Checks every field, returning the first configuration error found.
    pub fn validate(&self) -> Result<()> {
        self.state()?;
        if !self.deferred_tolerance.is_finite() || self.deferred_tolerance < 0.0 {
            return Err(Error::Tolerance(self.deferred_tolerance));
        }
        Ok(())
    }

    /// The initial clock state described by this configuration.
    pub fn state(&self) -> Result<ClockState> {
        ClockState::new(Tempo::from_bpm(self.bpm)?, self.ppqn, self.beats_per_bar)
    }

    /// The lateness tolerance in beats, or `None` when deferred scheduling is disabled.
    pub fn tolerance(&self) -> Option<f64> {
        if self.deferred_scheduling {
            Some(self.deferred_tolerance)
        } else {
            None
        }
    }

    /// Builds the configured clock source.
    ///
    /// # Errors
    ///
    /// Returns an error if the synced source cannot bind its UDP socket.
    pub fn source(&self) -> Result<Box<dyn ClockSource>> {
        Ok(match self.source {
            SourceKind::Internal => Box::new(InternalClock::new()),
            SourceKind::Synced => {
                let peer = OscPeer::bind(&self.sync_address).map_err(Error::Peer)?;
                Box::new(SyncedClock::new(peer))
            }
        })
    }
}

/// Decides when the next tick happens.
///
/// The clock thread calls [`next_boundary`](ClockSource::next_boundary) before every tick,
/// suspends until the returned instant, then advances the tick. A boundary in the past makes the
/// tick happen immediately, which is how sources catch up after falling behind.
pub trait ClockSource: Send + 'static {
    /// A short name used in log messages.
    fn name(&self) -> &str;

    /// Re-anchors the source. Called when the clock starts or resumes.
    fn reset(&mut self, state: &ClockState, now: Instant);

    /// Returns the instant of the next tick boundary.
    ///
    /// Sources following an external peer may update the tempo in `state`.
    fn next_boundary(&mut self, state: &mut ClockState, now: Instant) -> Result<Instant>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Pause,
    Resume,
    Stop,
}

struct Running {
    sender: Sender<Control>,
    thread: thread::JoinHandle<Box<dyn ClockSource>>,
}

// A panic on the clock thread must not make the clock state unreadable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The environment's active clock: the shared state plus the thread driving it.
pub(crate) struct Clock {
    state: Mutex<ClockState>,
    source: Mutex<Option<Box<dyn ClockSource>>>,
    running: Mutex<Option<Running>>,
    failure: Mutex<Option<Arc<Error>>>,
}

impl Clock {
    pub(crate) fn new(state: ClockState, source: Box<dyn ClockSource>) -> Clock {
        Clock {
            state: Mutex::new(state),
            source: Mutex::new(Some(source)),
            running: Mutex::new(None),
            failure: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ClockState {
        lock(&self.state).clone()
    }

    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&mut ClockState) -> T) -> T {
        f(&mut lock(&self.state))
    }

    pub(crate) fn failure(&self) -> Option<Arc<Error>> {
        lock(&self.failure).clone()
    }

    /// Starts the clock thread. Returns `false` if the clock was already running.
    pub(crate) fn start(&self, env: Weak<Environment>) -> Result<bool> {
        let mut running = lock(&self.running);
        if let Some(current) = running.take() {
            let active = lock(&self.state).running;
            if active && !current.thread.is_finished() {
                *running = Some(current);
                return Ok(false);
            }
            if current.thread.thread().id() == thread::current().id() {
                log::warn!("the clock cannot be restarted from its own thread");
                *running = Some(current);
                return Ok(false);
            }
            self.reclaim(current)?;
        }

        let mut source = lock(&self.source).take().ok_or(Error::SourceLost)?;
        {
            let mut state = lock(&self.state);
            source.reset(&state, Instant::now());
            state.running = true;
            state.paused = false;
        }
        *lock(&self.failure) = None;

        let (sender, receiver) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("shoal-clock".to_owned())
            .spawn(move || run(source, receiver, env))
            .map_err(Error::Spawn)?;
        *running = Some(Running { sender, thread });
        Ok(true)
    }

    /// Stops the clock thread. Returns `false` if the clock was not running.
    pub(crate) fn stop(&self) -> Result<bool> {
        let current = match lock(&self.running).take() {
            Some(current) => current,
            None => return Ok(false),
        };
        {
            let mut state = lock(&self.state);
            state.running = false;
            state.paused = false;
        }
        let _ = current.sender.send(Control::Stop);

        // Stopping from a hook or runner on the clock thread itself cannot wait for the thread.
        // The source is reclaimed on the next start instead.
        if current.thread.thread().id() == thread::current().id() {
            *lock(&self.running) = Some(current);
            return Ok(true);
        }
        self.reclaim(current)?;
        Ok(true)
    }

    pub(crate) fn pause(&self) -> bool {
        self.control(Control::Pause, |state| {
            let changed = state.running && !state.paused;
            state.paused = true;
            changed
        })
    }

    pub(crate) fn resume(&self) -> bool {
        self.control(Control::Resume, |state| {
            let changed = state.running && state.paused;
            state.paused = false;
            changed
        })
    }

    pub(crate) fn replace_source(&self, source: Box<dyn ClockSource>) {
        *lock(&self.source) = Some(source);
    }

    fn control(&self, control: Control, update: impl FnOnce(&mut ClockState) -> bool) -> bool {
        let running = lock(&self.running);
        let current = match running.as_ref() {
            Some(current) => current,
            None => return false,
        };
        if !update(&mut lock(&self.state)) {
            return false;
        }
        current.sender.send(control).is_ok()
    }

    fn reclaim(&self, current: Running) -> Result<()> {
        drop(current.sender);
        match current.thread.join() {
            Ok(source) => {
                // A source installed while the thread was stopping takes precedence.
                lock(&self.source).get_or_insert(source);
                Ok(())
            }
            Err(_) => Err(Error::SourceLost),
        }
    }

    /// Advances the tick. This is the only place the tick counter changes.
    pub(crate) fn advance(&self) -> u64 {
        lock(&self.state).advance(Instant::now())
    }

    fn fail(&self, err: Error) {
        log::error!("clock stopped: {}", err);
        {
            let mut state = lock(&self.state);
            state.running = false;
            state.paused = false;
        }
        *lock(&self.failure) = Some(Arc::new(err));
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        // The last reference to the environment may be dropped on the clock thread itself, so
        // the thread is told to stop but never joined here.
        if let Some(current) = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take() {
            let _ = current.sender.send(Control::Stop);
        }
    }
}

fn run(
    mut source: Box<dyn ClockSource>,
    control: Receiver<Control>,
    env: Weak<Environment>,
) -> Box<dyn ClockSource> {
    log::debug!("{} clock started", source.name());
    if let Err(err) = drive(source.as_mut(), &control, &env) {
        if let Some(env) = env.upgrade() {
            env.clock().fail(err);
            env.dispatch(&Event::Stop);
        }
    }
    log::debug!("{} clock stopped", source.name());
    source
}

fn drive(
    source: &mut dyn ClockSource,
    control: &Receiver<Control>,
    env: &Weak<Environment>,
) -> Result<()> {
    loop {
        let boundary = match env.upgrade() {
            Some(env) => env.clock().with_state(|state| {
                let next = AssertUnwindSafe(|| source.next_boundary(state, Instant::now()));
                panic::catch_unwind(next).unwrap_or_else(|payload| {
                    Err(Error::SourcePanicked(panic_message(payload.as_ref())))
                })
            })?,
            None => return Ok(()),
        };

        match wait_until(control, boundary) {
            Wake::Boundary => match env.upgrade() {
                Some(env) => env.pulse(),
                None => return Ok(()),
            },
            Wake::Control(Control::Pause) => {
                loop {
                    match control.recv() {
                        Ok(Control::Resume) => break,
                        Ok(Control::Pause) => {}
                        Ok(Control::Stop) => return Ok(()),
                        Err(_) => return Err(Error::Disconnected),
                    }
                }
                match env.upgrade() {
                    Some(env) => env
                        .clock()
                        .with_state(|state| source.reset(state, Instant::now())),
                    None => return Ok(()),
                }
            }
            Wake::Control(Control::Resume) => {}
            Wake::Control(Control::Stop) => return Ok(()),
            Wake::Disconnected => return Err(Error::Disconnected),
        }
    }
}

enum Wake {
    Boundary,
    Control(Control),
    Disconnected,
}

fn wait_until(control: &Receiver<Control>, boundary: Instant) -> Wake {
    loop {
        let now = Instant::now();
        if now >= boundary {
            return Wake::Boundary;
        }
        match control.recv_timeout(boundary - now) {
            Ok(message) => return Wake::Control(message),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Wake::Disconnected,
        }
    }
}
