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

//! The environment: the clock, the dispatch bus and the shared session.

use crate::{
    clock::{self, Clock, ClockConfig, ClockSource, ClockState, Tempo},
    event::{Event, EventKinds},
    handler::Handler,
    pattern::{self, ListParser, Param, ParseError, Parser, Session, Value},
    runner::{chain, panic_message, Args, Executor, RunnerState, Runners, Swim},
    timer::Timer,
};
use std::{
    cell::Cell,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak},
    time::Duration,
};

thread_local! {
    static DISPATCHING: Cell<bool> = Cell::new(false);
}

struct Registration {
    name: String,
    kinds: EventKinds,
    handler: Arc<dyn Handler>,
}

/// The live-coding environment.
///
/// An environment owns the clock, the registered [handlers](Handler), the runners, a timer for
/// delayed actions, the active pattern [`Parser`] and the shared [`Session`]. It is always used
/// through an [`Arc`]: the clock thread, the runner thread and handlers all refer back to it.
///
/// # Examples
///
/// ```
/// use shoal::{ClockConfig, Environment, Value};
///
/// let config = ClockConfig {
///     bpm: 90.0,
///     active: false,
///     ..ClockConfig::default()
/// };
/// let env = Environment::new(config)?;
/// env.set_variable("root", 48);
/// assert_eq!(
///     vec![Value::Number(48.0), Value::Number(55.0)],
///     env.resolve(&"root 55".into())?
/// );
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Environment {
    me: Weak<Environment>,
    clock: Clock,
    tolerance: Option<f64>,
    handlers: RwLock<Vec<Registration>>,
    dispatch_lock: Mutex<()>,
    runners: Runners,
    executor: Executor,
    session: Mutex<Session>,
    parser: Mutex<Box<dyn Parser>>,
    timer: Timer,
}

impl Environment {
    /// Creates an environment with the clock source named in `config`.
    ///
    /// The clock is started right away if `config.active` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the clock source cannot be set up.
    pub fn new(config: ClockConfig) -> clock::Result<Arc<Environment>> {
        config.validate()?;
        let source = config.source()?;
        Environment::with_source(&config, source)
    }

    /// Creates an environment driven by `source`, ignoring `config.source`.
    pub fn with_source(
        config: &ClockConfig,
        source: Box<dyn ClockSource>,
    ) -> clock::Result<Arc<Environment>> {
        config.validate()?;
        let state = config.state()?;
        let timer = Timer::new().map_err(clock::Error::Spawn)?;
        let executor = Executor::new().map_err(clock::Error::Spawn)?;

        let env = Arc::new_cyclic(|me| Environment {
            me: me.clone(),
            clock: Clock::new(state, source),
            tolerance: config.tolerance(),
            handlers: RwLock::new(Vec::new()),
            dispatch_lock: Mutex::new(()),
            runners: Runners::new(),
            executor,
            session: Mutex::new(Session::default()),
            parser: Mutex::new(Box::new(ListParser::new())),
            timer,
        });

        if config.active {
            env.start()?;
        }
        Ok(env)
    }

    /// Starts the clock. Returns `false` if it was already running.
    pub fn start(&self) -> clock::Result<bool> {
        let started = self.clock.start(self.me.clone())?;
        if started {
            log::debug!("clock started at tick {}", self.tick());
            self.dispatch(&Event::Start);
        }
        Ok(started)
    }

    /// Stops the clock. The tick count is kept. Returns `false` if the clock was not running.
    pub fn stop(&self) -> clock::Result<bool> {
        let stopped = self.clock.stop()?;
        if stopped {
            log::debug!("clock stopped at tick {}", self.tick());
            self.dispatch(&Event::Stop);
        }
        Ok(stopped)
    }

    /// Pauses the clock. Returns `false` if the clock was not running or already paused.
    pub fn pause(&self) -> bool {
        let paused = self.clock.pause();
        if paused {
            self.dispatch(&Event::Pause);
        }
        paused
    }

    /// Resumes a paused clock. Returns `false` if the clock was not paused.
    pub fn resume(&self) -> bool {
        let resumed = self.clock.resume();
        if resumed {
            self.dispatch(&Event::Resume);
        }
        resumed
    }

    pub fn is_running(&self) -> bool {
        self.clock.state().is_running()
    }

    pub fn is_paused(&self) -> bool {
        self.clock.state().is_paused()
    }

    /// A snapshot of the clock.
    pub fn clock_state(&self) -> ClockState {
        self.clock.state()
    }

    /// The current tick.
    pub fn tick(&self) -> u64 {
        self.clock.with_state(|state| state.tick())
    }

    /// Changes the tempo. Takes effect from the next tick.
    pub fn set_tempo(&self, bpm: f64) -> clock::Result<()> {
        let tempo = Tempo::from_bpm(bpm)?;
        self.clock.with_state(|state| state.set_tempo(tempo));
        Ok(())
    }

    pub fn set_beats_per_bar(&self, beats_per_bar: u32) -> clock::Result<()> {
        self.clock
            .with_state(|state| state.set_beats_per_bar(beats_per_bar))
    }

    /// The error that stopped the clock, if it stopped because of one.
    pub fn clock_failure(&self) -> Option<Arc<clock::Error>> {
        self.clock.failure()
    }

    /// Replaces the clock source. A running clock is restarted on the new source.
    pub fn set_clock_source(&self, source: Box<dyn ClockSource>) -> clock::Result<()> {
        let running = self.is_running();
        if running {
            self.clock.stop()?;
        }
        self.clock.replace_source(source);
        if running {
            self.clock.start(self.me.clone())?;
        }
        Ok(())
    }

    pub fn beats_to_ticks(&self, beats: f64) -> u64 {
        self.clock.with_state(|state| state.beats_to_ticks(beats))
    }

    pub fn beats_to_duration(&self, beats: f64) -> Duration {
        self.clock.with_state(|state| state.beats_to_duration(beats))
    }

    /// Delivers `event` to every handler subscribed to its kind, in registration order.
    ///
    /// Returns once every handler has seen the event. A handler that fails or panics is logged
    /// and skipped. Dispatches from different threads never interleave; a handler that dispatches
    /// from inside its hook has that event delivered right away.
    pub fn dispatch(&self, event: &Event) {
        let kind = event.kind();
        let subscribers: Vec<(String, Arc<dyn Handler>)> = self
            .handlers
            .read()
            .unwrap()
            .iter()
            .filter(|registration| registration.kinds.contains(kind))
            .map(|registration| (registration.name.clone(), Arc::clone(&registration.handler)))
            .collect();
        if subscribers.is_empty() {
            return;
        }

        let nested = DISPATCHING.with(|dispatching| dispatching.replace(true));
        let _serialized = if nested {
            None
        } else {
            Some(
                self.dispatch_lock
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            )
        };

        for (name, handler) in subscribers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler.hook(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    log::error!("handler {} failed on {:?}: {}", name, kind, chain(&*err))
                }
                Err(_) => log::error!("handler {} panicked on {:?}", name, kind),
            }
        }

        DISPATCHING.with(|dispatching| dispatching.set(nested));
    }

    /// Registers a handler, subscribing it to the event kinds returned by its
    /// [`setup`](Handler::setup).
    ///
    /// A handler already registered under the same name is torn down and replaced in place.
    pub fn add_handler(&self, handler: Arc<dyn Handler>) {
        let name = handler.name().to_owned();
        let kinds = handler.setup();
        log::debug!("adding handler {} for {:?}", name, kinds);

        let registration = Registration {
            name,
            kinds,
            handler,
        };
        let replaced = {
            let mut handlers = self.handlers.write().unwrap();
            match handlers
                .iter()
                .position(|existing| existing.name == registration.name)
            {
                Some(index) => Some(std::mem::replace(&mut handlers[index], registration)),
                None => {
                    handlers.push(registration);
                    None
                }
            }
        };
        if let Some(replaced) = replaced {
            replaced.handler.teardown();
        }
    }

    /// Unregisters the handler named `name` and tears it down.
    pub fn remove_handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
        let removed = {
            let mut handlers = self.handlers.write().unwrap();
            let index = handlers.iter().position(|existing| existing.name == name)?;
            handlers.remove(index)
        };
        log::debug!("removing handler {}", name);
        removed.handler.teardown();
        Some(removed.handler)
    }

    /// Names of the registered handlers, in registration order.
    pub fn handler_names(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap()
            .iter()
            .map(|registration| registration.name.clone())
            .collect()
    }

    /// Replaces the pattern parser, returning the previous one. The clock keeps running.
    pub fn swap_parser(&self, parser: Box<dyn Parser>) -> Box<dyn Parser> {
        std::mem::replace(&mut *lock(&self.parser), parser)
    }

    /// Resolves a parameter into its list of values with the active parser.
    ///
    /// A parser that panics fails only this call, with [`ParseError::Panicked`].
    pub fn resolve(&self, param: &Param) -> Result<Vec<Value>, ParseError> {
        let mut parser = lock(&self.parser);
        let session = lock(&self.session);
        panic::catch_unwind(AssertUnwindSafe(|| {
            pattern::resolve(parser.as_mut(), param, &session)
        }))
        .unwrap_or_else(|payload| Err(ParseError::Panicked(panic_message(payload.as_ref()))))
    }

    /// A copy of the session.
    pub fn session(&self) -> Session {
        lock(&self.session).clone()
    }

    pub fn scale(&self) -> String {
        lock(&self.session).scale().to_owned()
    }

    pub fn set_scale(&self, scale: impl Into<String>) {
        lock(&self.session).set_scale(scale);
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        lock(&self.session).variable(name).cloned()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: impl Into<Value>) {
        lock(&self.session).set_variable(name, value);
    }

    /// Schedules `swim` to run on the next tick under `name`.
    ///
    /// If a runner named `name` exists, its function is replaced and it keeps its cadence. See
    /// the [`runner`](crate::runner) module for details.
    pub fn schedule(&self, name: impl Into<String>, swim: impl Swim) {
        self.schedule_with(name, swim, Args::new());
    }

    /// Like [`schedule`](Environment::schedule), with arguments available through
    /// [`Cycle::args`](crate::Cycle::args).
    pub fn schedule_with(&self, name: impl Into<String>, swim: impl Swim, args: Args) {
        self.runners
            .schedule(name.into(), Box::new(swim), args, self.tick());
    }

    /// Removes the runner named `name`. Returns `false` if there was none.
    pub fn remove(&self, name: &str) -> bool {
        self.runners.remove(name)
    }

    /// Removes every runner, returning how many were removed.
    pub fn remove_all(&self) -> usize {
        self.runners.remove_all()
    }

    /// Names of the live runners, in the order they were first scheduled.
    pub fn runners(&self) -> Vec<String> {
        self.runners.names()
    }

    pub fn runner_state(&self, name: &str) -> Option<RunnerState> {
        self.runners.state(name)
    }

    /// The timer used for delayed actions such as note-offs.
    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Advances the clock by one tick, dispatches it and hands the due runners to the runner
    /// thread.
    pub(crate) fn pulse(&self) {
        let tick = self.clock.advance();
        self.dispatch(&Event::Tick(tick));

        let tolerance = self.tolerance.map(|beats| self.beats_to_ticks(beats));
        let due = self.runners.collect_due(tick, tolerance);
        if let Some(env) = self.me.upgrade() {
            self.executor.submit(env, due);
        }
    }
}

// The parser and session are shared by every runner and handler, so a panic while one of them is
// held must not lock the others out.
fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for Environment {
    fn drop(&mut self) {
        let handlers = std::mem::take(self.handlers.get_mut().unwrap());
        for registration in handlers {
            registration.handler.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::EventKind,
        handler,
        runner::{Cycle, SwimResult},
    };
    use pretty_assertions::assert_eq;
    use std::{
        sync::mpsc::{self, Sender},
        thread,
    };

    fn env() -> Arc<Environment> {
        Environment::new(ClockConfig {
            ppqn: 4,
            active: false,
            ..ClockConfig::default()
        })
        .unwrap()
    }

    struct Recorder {
        name: String,
        kinds: EventKinds,
        seen: Mutex<Vec<String>>,
        log: Sender<String>,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &str, log: Sender<String>) -> Recorder {
            Recorder {
                name: name.to_owned(),
                kinds: EventKinds::new().with(EventKind::Panic).with(EventKind::Start),
                seen: Mutex::new(Vec::new()),
                log,
                fail: false,
            }
        }

        fn failing(mut self) -> Recorder {
            self.fail = true;
            self
        }

        fn watching(mut self, kinds: EventKinds) -> Recorder {
            self.kinds = kinds;
            self
        }
    }

    impl Handler for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn setup(&self) -> EventKinds {
            self.kinds.clone()
        }

        fn hook(&self, event: &Event) -> Result<(), handler::Error> {
            self.seen.lock().unwrap().push(format!("{:?}", event));
            self.log.send(self.name.clone()).unwrap();
            if self.fail {
                return Err("hook failed".into());
            }
            Ok(())
        }

        fn teardown(&self) {
            let _ = self.log.send(format!("{} teardown", self.name));
        }
    }

    struct Panicker;

    impl Handler for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }

        fn setup(&self) -> EventKinds {
            EventKinds::new().with(EventKind::Panic)
        }

        fn hook(&self, _: &Event) -> Result<(), handler::Error> {
            panic!("hook panicked")
        }
    }

    #[test]
    fn dispatch_without_subscribers_is_a_no_op() {
        let env = env();
        env.dispatch(&Event::Panic);
        env.dispatch(&Event::Tick(3));
    }

    #[test]
    fn failing_handlers_do_not_block_later_ones() {
        let env = env();
        let (sender, log) = mpsc::channel();
        env.add_handler(Arc::new(Recorder::new("first", sender.clone()).failing()));
        env.add_handler(Arc::new(Panicker));
        env.add_handler(Arc::new(Recorder::new("last", sender)));

        env.dispatch(&Event::Panic);
        assert_eq!(vec!["first", "last"], log.try_iter().collect::<Vec<_>>());
    }

    #[test]
    fn only_subscribed_kinds_are_delivered() {
        let env = env();
        let (sender, log) = mpsc::channel();
        let recorder = Arc::new(Recorder::new("recorder", sender));
        env.add_handler(recorder.clone());

        env.dispatch(&Event::Tick(1));
        env.dispatch(&Event::Stop);
        env.dispatch(&Event::Panic);
        assert_eq!(vec!["Panic"], *recorder.seen.lock().unwrap());
        assert_eq!(1, log.try_iter().count());
    }

    #[test]
    fn replacing_and_removing_handlers_tears_them_down() {
        let env = env();
        let (sender, log) = mpsc::channel();
        env.add_handler(Arc::new(Recorder::new("a", sender.clone())));
        env.add_handler(Arc::new(Recorder::new("b", sender.clone())));
        env.add_handler(Arc::new(Recorder::new("a", sender)));
        assert_eq!(vec!["a", "b"], env.handler_names());

        assert!(env.remove_handler("b").is_some());
        assert!(env.remove_handler("b").is_none());
        assert_eq!(vec!["a"], env.handler_names());
        assert_eq!(
            vec!["a teardown", "b teardown"],
            log.try_iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn nested_dispatch_is_delivered_inline() {
        struct Relay(Weak<Environment>);

        impl Handler for Relay {
            fn name(&self) -> &str {
                "relay"
            }

            fn setup(&self) -> EventKinds {
                EventKinds::new().with(EventKind::Start)
            }

            fn hook(&self, _: &Event) -> Result<(), handler::Error> {
                if let Some(env) = self.0.upgrade() {
                    env.dispatch(&Event::Panic);
                }
                Ok(())
            }
        }

        let env = env();
        let (sender, log) = mpsc::channel();
        env.add_handler(Arc::new(Relay(Arc::downgrade(&env))));
        env.add_handler(Arc::new(Recorder::new("recorder", sender)));

        env.dispatch(&Event::Start);
        assert_eq!(
            vec!["recorder", "recorder"],
            log.try_iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn sleep_shifts_perceived_tick_without_blocking() {
        let env = env();
        let (sender, ticks) = mpsc::channel();
        env.schedule("sleeper", move |cycle: &mut Cycle| -> SwimResult {
            let before = cycle.tick();
            cycle.sleep(0.5);
            sender.send((before, cycle.tick(), cycle.shift()))?;
            Ok(())
        });

        env.pulse();
        let (before, after, shift) = ticks.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(2, shift);
        assert_eq!(before + 2, after);
    }

    #[test]
    fn runner_failures_are_isolated() {
        let env = env();
        let (sender, ran) = mpsc::channel();
        env.schedule("broken", |_: &mut Cycle| -> SwimResult {
            panic!("bad user code")
        });
        env.schedule("fine", move |cycle: &mut Cycle| -> SwimResult {
            sender.send(cycle.iteration())?;
            cycle.again(0.25);
            Ok(())
        });

        for expected in 0..3 {
            env.pulse();
            assert_eq!(expected, ran.recv_timeout(Duration::from_secs(1)).unwrap());
            // Let the invocation report back before the next tick.
            while env.runner_state("fine") == Some(RunnerState::Running) {
                thread::sleep(Duration::from_millis(1));
            }
        }
        while env.runner_state("broken").is_some() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(vec!["fine"], env.runners());
    }

    #[test]
    fn session_and_parser() {
        struct Constant;

        impl Parser for Constant {
            fn parse(&mut self, _: &str, _: &Session) -> Result<Vec<Value>, ParseError> {
                Ok(vec![Value::Number(1.0)])
            }
        }

        let env = env();
        env.set_scale("minor");
        env.set_variable("root", 50);
        assert_eq!("minor", env.scale());
        assert_eq!(Some(Value::Number(50.0)), env.variable("root"));
        assert_eq!(
            vec![Value::Number(50.0)],
            env.resolve(&Param::from("root")).unwrap()
        );

        env.swap_parser(Box::new(Constant));
        assert_eq!(
            vec![Value::Number(1.0)],
            env.resolve(&Param::from("root")).unwrap()
        );
    }

    #[test]
    fn lifecycle_events_follow_state_changes() {
        let env = env();
        let (sender, _log) = mpsc::channel();
        let recorder = Arc::new(Recorder::new("recorder", sender).watching(
            EventKinds::new()
                .with(EventKind::Start)
                .with(EventKind::Pause)
                .with(EventKind::Resume)
                .with(EventKind::Stop),
        ));
        env.add_handler(recorder.clone());

        assert!(!env.pause());
        assert!(env.start().unwrap());
        assert!(!env.start().unwrap());
        assert!(env.pause());
        assert!(!env.pause());
        assert!(env.is_paused());
        assert!(env.resume());
        assert!(!env.resume());
        assert!(env.stop().unwrap());
        assert!(!env.stop().unwrap());
        assert!(!env.is_running());

        assert_eq!(
            vec!["Start", "Pause", "Resume", "Stop"],
            *recorder.seen.lock().unwrap()
        );
    }

    #[test]
    fn due_runners_execute_in_scheduling_order() {
        let env = env();
        let (sender, order) = mpsc::channel();
        let names: Vec<String> = (0..8).map(|index| format!("r{}", index)).collect();
        for (index, name) in names.iter().enumerate() {
            let sender = sender.clone();
            env.schedule(name.clone(), move |cycle: &mut Cycle| -> SwimResult {
                sender.send(index)?;
                cycle.again(0.25);
                Ok(())
            });
        }

        for _ in 0..20 {
            env.pulse();
            let ran: Vec<usize> = (0..names.len())
                .map(|_| order.recv_timeout(Duration::from_secs(1)).unwrap())
                .collect();
            assert_eq!((0..names.len()).collect::<Vec<_>>(), ran);
            while names
                .iter()
                .any(|name| env.runner_state(name) == Some(RunnerState::Running))
            {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn bad_patterns_fail_only_their_own_resolve() {
        struct Exploding;

        impl Parser for Exploding {
            fn parse(&mut self, _: &str, _: &Session) -> Result<Vec<Value>, ParseError> {
                panic!("parser bug")
            }
        }

        let env = env();
        env.set_variable("lo", f64::NAN);
        assert_eq!(
            Err(ParseError::NotANumber("lo:3".to_owned())),
            env.resolve(&Param::from("lo:3"))
        );
        assert_eq!(
            vec![Value::Number(60.0)],
            env.resolve(&Param::from("60")).unwrap()
        );

        let previous = env.swap_parser(Box::new(Exploding));
        assert_eq!(
            Err(ParseError::Panicked("parser bug".to_owned())),
            env.resolve(&Param::from("60"))
        );
        env.set_scale("dorian");
        assert_eq!("dorian", env.scale());

        env.swap_parser(previous);
        assert_eq!(
            vec![Value::Number(60.0)],
            env.resolve(&Param::from("60")).unwrap()
        );
    }
}
