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

//! Delayed actions.
//!
//! The [`Timer`] owns a single thread that sleeps until the earliest pending action is due and
//! runs it. Every scheduled action returns a [`TimerHandle`] that can cancel it. Handlers use the
//! environment's timer for note-offs and for events that should happen at a runner's perceived
//! time rather than right away.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU8, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const FIRED: u8 = 2;

type Action = Box<dyn FnOnce() + Send + 'static>;

/// A handle to an action scheduled on a [`Timer`].
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    state: Arc<AtomicU8>,
}

impl TimerHandle {
    /// Cancels the action if it has not run yet.
    ///
    /// Returns `true` only for the call that actually cancelled it. Cancelling twice, or after the
    /// action ran, does nothing.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Returns `true` if the action has neither run nor been cancelled.
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::SeqCst) == PENDING
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn fire(&self) -> bool {
        self.state
            .compare_exchange(PENDING, FIRED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

struct Entry {
    handle: TimerHandle,
    action: Action,
}

/// Runs actions at instants in the future.
pub struct Timer {
    sender: Mutex<Sender<(Instant, Entry)>>,
    next_id: Mutex<u64>,
}

impl Timer {
    /// Starts the timer thread. The thread exits when the timer is dropped.
    pub fn new() -> std::io::Result<Timer> {
        let (sender, receiver) = mpsc::channel();
        thread::Builder::new()
            .name("shoal-timer".to_owned())
            .spawn(move || run(receiver))?;
        Ok(Timer {
            sender: Mutex::new(sender),
            next_id: Mutex::new(0),
        })
    }

    /// Runs `action` at `at`. An instant in the past runs it as soon as possible.
    pub fn call_at<F>(&self, at: Instant, action: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.handle();
        let entry = Entry {
            handle: handle.clone(),
            action: Box::new(action),
        };
        if self.sender.lock().unwrap().send((at, entry)).is_err() {
            log::error!("timer thread is gone, dropping action {}", handle.id);
            handle.cancel();
        }
        handle
    }

    /// Runs `action` after `delay`.
    ///
    /// A delay too long to be represented as an instant never comes due: the action is dropped
    /// and the returned handle is already cancelled.
    pub fn call_after<F>(&self, delay: Duration, action: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        match Instant::now().checked_add(delay) {
            Some(at) => self.call_at(at, action),
            None => {
                let handle = self.handle();
                log::warn!("delay {:?} is out of range, dropping action {}", delay, handle.id);
                handle.cancel();
                handle
            }
        }
    }

    fn handle(&self) -> TimerHandle {
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        TimerHandle {
            id: *next_id,
            state: Arc::new(AtomicU8::new(PENDING)),
        }
    }
}

fn run(receiver: Receiver<(Instant, Entry)>) {
    let mut queue: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut entries: HashMap<u64, Entry> = HashMap::new();

    loop {
        let now = Instant::now();
        while let Some(&Reverse((at, id))) = queue.peek() {
            if at > now {
                break;
            }
            queue.pop();
            if let Some(entry) = entries.remove(&id) {
                fire(entry);
            }
        }

        let received = match queue.peek() {
            Some(&Reverse((at, _))) => {
                match receiver.recv_timeout(at.saturating_duration_since(Instant::now())) {
                    Ok(received) => Some(received),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match receiver.recv() {
                Ok(received) => Some(received),
                Err(_) => return,
            },
        };

        if let Some((at, entry)) = received {
            let id = entry.handle.id;
            queue.push(Reverse((at, id)));
            entries.insert(id, entry);
        }
    }
}

fn fire(entry: Entry) {
    if !entry.handle.fire() {
        return;
    }
    let action = entry.action;
    if panic::catch_unwind(AssertUnwindSafe(action)).is_err() {
        log::error!("timer action {} panicked", entry.handle.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn runs_actions_in_time_order() {
        let timer = Timer::new().unwrap();
        let (sender, receiver) = mpsc::channel();
        let now = Instant::now();
        for (delay, label) in [(60, "c"), (20, "a"), (40, "b")] {
            let sender = sender.clone();
            timer.call_at(now + Duration::from_millis(delay), move || {
                sender.send(label).unwrap();
            });
        }

        let order: Vec<_> = (0..3)
            .map(|_| receiver.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(vec!["a", "b", "c"], order);
    }

    #[test]
    fn cancel_is_idempotent() {
        let timer = Timer::new().unwrap();
        let (sender, receiver) = mpsc::channel();
        let handle = timer.call_after(Duration::from_millis(50), move || {
            sender.send(()).unwrap();
        });

        assert!(handle.is_pending());
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(!handle.is_pending());
        assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn cancel_after_firing_does_nothing() {
        let timer = Timer::new().unwrap();
        let (sender, receiver) = mpsc::channel();
        let handle = timer.call_after(Duration::ZERO, move || {
            sender.send(()).unwrap();
        });

        receiver.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(!handle.cancel());
    }

    #[test]
    fn panicking_action_does_not_stop_the_timer() {
        let timer = Timer::new().unwrap();
        let (sender, receiver) = mpsc::channel();
        timer.call_after(Duration::ZERO, || panic!("boom"));
        timer.call_after(Duration::from_millis(10), move || {
            sender.send(()).unwrap();
        });
        receiver.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn out_of_range_delay_is_dropped() {
        let timer = Timer::new().unwrap();
        let handle = timer.call_after(Duration::MAX, || {});
        assert!(!handle.is_pending());

        let (sender, receiver) = mpsc::channel();
        timer.call_after(Duration::ZERO, move || {
            sender.send(()).unwrap();
        });
        receiver.recv_timeout(Duration::from_secs(1)).unwrap();
    }
}
