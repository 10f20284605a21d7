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

use super::{chain, Again, Args, Cycle, Error, RunnerState, Swim};
use crate::Environment;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex},
};

/// The runner table, shared between the environment and in-flight invocations.
#[derive(Clone, Default)]
pub(crate) struct Runners {
    table: Arc<Mutex<Table>>,
}

#[derive(Default)]
struct Table {
    runners: Vec<Runner>,
    generation: u64,
}

struct Runner {
    name: String,
    swim: Option<Box<dyn Swim>>,
    args: Args,
    generation: u64,
    next_due: u64,
    period: u64,
    iteration: u64,
    state: RunnerState,
}

impl Runner {
    fn transition(&mut self, state: RunnerState) {
        log::debug!("runner {}: {:?} -> {:?}", self.name, self.state, state);
        self.state = state;
    }
}

impl Table {
    fn position(&self, name: &str) -> Option<usize> {
        self.runners.iter().position(|runner| runner.name == name)
    }

    fn remove_at(&mut self, index: usize, state: RunnerState) {
        let mut runner = self.runners.remove(index);
        runner.transition(state);
    }
}

impl Runners {
    pub(crate) fn new() -> Runners {
        Runners::default()
    }

    /// Installs `swim` under `name`, replacing any runner already using that name.
    ///
    /// A new runner is first due on the tick after `tick`. A replaced runner keeps its due tick;
    /// if it is running at the moment, the next cycle is due one period after the running one.
    pub(crate) fn schedule(&self, name: String, swim: Box<dyn Swim>, args: Args, tick: u64) {
        let mut table = self.table.lock().unwrap();
        table.generation += 1;
        let generation = table.generation;

        match table.position(&name) {
            Some(index) => {
                let runner = &mut table.runners[index];
                log::debug!("redefining runner {}", name);
                if runner.state == RunnerState::Running {
                    runner.next_due += runner.period.max(1);
                }
                runner.swim = Some(swim);
                runner.args = args;
                runner.generation = generation;
                runner.transition(RunnerState::Scheduled);
            }
            None => {
                log::debug!("scheduling runner {} at tick {}", name, tick + 1);
                table.runners.push(Runner {
                    name,
                    swim: Some(swim),
                    args,
                    generation,
                    next_due: tick + 1,
                    period: 0,
                    iteration: 0,
                    state: RunnerState::Scheduled,
                });
            }
        }
    }

    /// Takes every runner due at `tick`, in the order they were first scheduled.
    ///
    /// With a `tolerance`, a runner more than that many ticks late skips the cycles it missed and
    /// realigns to its period. A runner that is still not due after realigning is left for later.
    pub(crate) fn collect_due(&self, tick: u64, tolerance: Option<u64>) -> Vec<Invocation> {
        let mut table = self.table.lock().unwrap();
        let mut due = Vec::new();

        for runner in table.runners.iter_mut() {
            let waiting = matches!(
                runner.state,
                RunnerState::Scheduled | RunnerState::AwaitingNextCycle
            );
            if !waiting || runner.next_due > tick {
                continue;
            }

            let lateness = tick - runner.next_due;
            if let Some(tolerance) = tolerance.filter(|&tolerance| lateness > tolerance) {
                if runner.period == 0 {
                    log::warn!(
                        "runner {} is {} ticks late, running it now",
                        runner.name,
                        lateness
                    );
                    runner.next_due = tick;
                } else {
                    let missed = (lateness - tolerance + runner.period - 1) / runner.period;
                    runner.next_due += missed * runner.period;
                    log::warn!(
                        "runner {} is {} ticks late, dropped {} missed cycle(s)",
                        runner.name,
                        lateness,
                        missed
                    );
                    if runner.next_due > tick {
                        continue;
                    }
                }
            }

            let swim = match runner.swim.take() {
                Some(swim) => swim,
                None => continue,
            };
            runner.transition(RunnerState::Running);
            due.push(Invocation {
                table: Arc::clone(&self.table),
                name: runner.name.clone(),
                generation: runner.generation,
                due: runner.next_due,
                iteration: runner.iteration,
                args: runner.args.clone(),
                swim,
            });
        }

        due
    }

    /// Removes the runner named `name`. An invocation in flight finishes but does not run again.
    pub(crate) fn remove(&self, name: &str) -> bool {
        let mut table = self.table.lock().unwrap();
        match table.position(name) {
            Some(index) => {
                table.remove_at(index, RunnerState::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Removes every runner, returning how many there were.
    pub(crate) fn remove_all(&self) -> usize {
        let mut table = self.table.lock().unwrap();
        let count = table.runners.len();
        while !table.runners.is_empty() {
            table.remove_at(0, RunnerState::Cancelled);
        }
        count
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let table = self.table.lock().unwrap();
        table.runners.iter().map(|runner| runner.name.clone()).collect()
    }

    pub(crate) fn state(&self, name: &str) -> Option<RunnerState> {
        let table = self.table.lock().unwrap();
        table.position(name).map(|index| table.runners[index].state)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.table.lock().unwrap().runners.len()
    }
}

/// A single due cycle of a runner, taken out of the table while it runs.
pub(crate) struct Invocation {
    table: Arc<Mutex<Table>>,
    name: String,
    generation: u64,
    due: u64,
    iteration: u64,
    args: Args,
    swim: Box<dyn Swim>,
}

impl Invocation {
    #[cfg(test)]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Runs the function and reports the outcome back to the table.
    pub(crate) fn run(mut self, env: Arc<Environment>) {
        let mut cycle = Cycle::new(
            env,
            self.name.clone(),
            self.due,
            self.iteration,
            self.args.clone(),
        );
        let swim = &mut self.swim;
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| swim.swim(&mut cycle))) {
            Ok(Ok(())) => Ok(cycle.take_again()),
            Ok(Err(err)) => Err(Error::Failed(err)),
            Err(payload) => Err(Error::Panicked(panic_message(payload.as_ref()))),
        };
        self.complete(outcome);
    }

    /// Gives up on an invocation that could not be started.
    pub(crate) fn abandon(self, err: std::io::Error) {
        self.complete(Err(Error::Failed(Box::new(err))));
    }

    fn complete(self, outcome: Result<Option<Again>, Error>) {
        let Invocation {
            table,
            name,
            generation,
            due,
            swim,
            ..
        } = self;

        if let Err(err) = &outcome {
            log::error!("runner {} at tick {}: {}", name, due, chain(err));
        }

        let mut table = table.lock().unwrap();
        let index = match table.position(&name) {
            Some(index) => index,
            None => {
                log::debug!("runner {} was removed while running", name);
                return;
            }
        };
        if table.runners[index].generation != generation {
            log::debug!("discarding continuation of redefined runner {}", name);
            return;
        }

        match outcome {
            Ok(Some(again)) => {
                let runner = &mut table.runners[index];
                runner.period = again.ticks.max(1);
                runner.next_due = due + runner.period;
                runner.iteration += 1;
                if let Some(args) = again.args {
                    runner.args = args;
                }
                runner.swim = Some(swim);
                runner.transition(RunnerState::AwaitingNextCycle);
            }
            Ok(None) => table.remove_at(index, RunnerState::Cancelled),
            Err(_) => table.remove_at(index, RunnerState::Errored),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pattern::Value, SwimResult};
    use pretty_assertions::assert_eq;

    fn swim() -> Box<dyn Swim> {
        Box::new(|_: &mut Cycle| -> SwimResult { Ok(()) })
    }

    fn again(ticks: u64) -> Result<Option<Again>, Error> {
        Ok(Some(Again { ticks, args: None }))
    }

    fn due_names(runners: &Runners, tick: u64) -> Vec<(String, u64)> {
        runners
            .collect_due(tick, None)
            .into_iter()
            .map(|invocation| {
                let entry = (invocation.name().to_owned(), invocation.due);
                invocation.complete(again(4));
                entry
            })
            .collect()
    }

    #[test]
    fn new_runner_is_due_on_the_next_tick() {
        let runners = Runners::new();
        runners.schedule("a".to_owned(), swim(), vec![], 10);
        assert!(runners.collect_due(10, None).is_empty());

        let due = runners.collect_due(11, None);
        assert_eq!(1, due.len());
        assert_eq!(Some(RunnerState::Running), runners.state("a"));
        // An in-flight runner is not collected twice.
        assert!(runners.collect_due(12, None).is_empty());
    }

    #[test]
    fn one_runner_per_name() {
        let runners = Runners::new();
        runners.schedule("a".to_owned(), swim(), vec![], 0);
        runners.schedule("a".to_owned(), swim(), vec![], 0);
        runners.schedule("a".to_owned(), swim(), vec![], 0);
        assert_eq!(vec!["a".to_owned()], runners.names());
        assert_eq!(1, runners.collect_due(1, None).len());
    }

    #[test]
    fn due_runners_run_in_insertion_order() {
        let runners = Runners::new();
        runners.schedule("b".to_owned(), swim(), vec![], 0);
        runners.schedule("a".to_owned(), swim(), vec![], 0);
        assert_eq!(
            vec![("b".to_owned(), 1), ("a".to_owned(), 1)],
            due_names(&runners, 1)
        );
    }

    #[test]
    fn again_keeps_cadence_and_replaces_args() {
        let runners = Runners::new();
        runners.schedule("a".to_owned(), swim(), vec![Value::from(1)], 0);
        let invocation = runners.collect_due(3, None).pop().unwrap();
        assert_eq!(1, invocation.due);
        invocation.complete(Ok(Some(Again {
            ticks: 4,
            args: Some(vec![Value::from(2)]),
        })));

        assert_eq!(Some(RunnerState::AwaitingNextCycle), runners.state("a"));
        assert!(runners.collect_due(4, None).is_empty());
        let invocation = runners.collect_due(5, None).pop().unwrap();
        assert_eq!(5, invocation.due);
        assert_eq!(1, invocation.iteration);
        assert_eq!(vec![Value::from(2)], invocation.args);
    }

    #[test]
    fn finished_and_failed_runners_are_removed() {
        let runners = Runners::new();
        runners.schedule("done".to_owned(), swim(), vec![], 0);
        runners.schedule("broken".to_owned(), swim(), vec![], 0);
        runners.schedule("panicked".to_owned(), swim(), vec![], 0);

        let mut due = runners.collect_due(1, None).into_iter();
        due.next().unwrap().complete(Ok(None));
        due.next()
            .unwrap()
            .complete(Err(Error::Failed("bad note".into())));
        due.next()
            .unwrap()
            .complete(Err(Error::Panicked("boom".to_owned())));

        assert_eq!(0, runners.len());
    }

    #[test]
    fn redefinition_discards_stale_continuation() {
        let runners = Runners::new();
        runners.schedule("a".to_owned(), swim(), vec![], 0);
        let old = runners.collect_due(1, None).pop().unwrap();

        runners.schedule("a".to_owned(), swim(), vec![], 1);
        assert_eq!(Some(RunnerState::Scheduled), runners.state("a"));

        // The old invocation asks to run again right away, which must not take effect.
        old.complete(again(1));
        assert_eq!(Some(RunnerState::Scheduled), runners.state("a"));
        let due = runners.collect_due(2, None);
        assert_eq!(1, due.len());
        assert_eq!(2, due[0].due);
    }

    #[test]
    fn stale_failure_does_not_remove_redefinition() {
        let runners = Runners::new();
        runners.schedule("a".to_owned(), swim(), vec![], 0);
        let old = runners.collect_due(1, None).pop().unwrap();
        runners.schedule("a".to_owned(), swim(), vec![], 1);
        old.complete(Err(Error::Panicked("boom".to_owned())));
        assert_eq!(Some(RunnerState::Scheduled), runners.state("a"));
    }

    #[test]
    fn late_runner_drops_missed_cycles() {
        let runners = Runners::new();
        runners.schedule("a".to_owned(), swim(), vec![], 0);
        runners.collect_due(1, None).pop().unwrap().complete(again(4));

        // Due at 5, but the clock is at 15: cycles at 5 and 9 are dropped.
        let invocation = runners.collect_due(15, Some(2)).pop().unwrap();
        assert_eq!(13, invocation.due);
    }

    #[test]
    fn late_runner_waits_for_realigned_cycle() {
        let runners = Runners::new();
        runners.schedule("a".to_owned(), swim(), vec![], 0);
        runners.collect_due(1, None).pop().unwrap().complete(again(8));

        // Due at 9, the clock is at 13 with a tolerance of 1: realigned to 17.
        assert!(runners.collect_due(13, Some(1)).is_empty());
        assert_eq!(17, runners.collect_due(17, Some(1)).pop().unwrap().due);
    }

    #[test]
    fn late_runner_runs_without_deferred_scheduling() {
        let runners = Runners::new();
        runners.schedule("a".to_owned(), swim(), vec![], 0);
        runners.collect_due(1, None).pop().unwrap().complete(again(4));
        assert_eq!(5, runners.collect_due(50, None).pop().unwrap().due);
    }

    #[test]
    fn remove_and_remove_all() {
        let runners = Runners::new();
        for name in ["a", "b", "c"] {
            runners.schedule(name.to_owned(), swim(), vec![], 0);
        }
        let running = runners.collect_due(1, None);

        assert!(runners.remove("b"));
        assert!(!runners.remove("b"));
        assert_eq!(2, runners.remove_all());
        assert_eq!(0, runners.len());

        // Invocations that were in flight finish without coming back.
        for invocation in running {
            invocation.complete(again(1));
        }
        assert_eq!(0, runners.len());
        assert!(runners.collect_due(10, None).is_empty());
    }
}
