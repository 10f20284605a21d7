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

use super::Invocation;
use crate::Environment;
use std::{
    io,
    sync::{
        mpsc::{self, SendError, Sender},
        Arc, Mutex,
    },
    thread,
};

type Batch = (Arc<Environment>, Vec<Invocation>);

/// The thread that invokes due runners.
///
/// Every batch handed over by the clock is run to completion, one invocation after another in the
/// order the batch was collected, before the next batch starts. The thread exits when the
/// executor is dropped.
pub(crate) struct Executor {
    sender: Mutex<Sender<Batch>>,
}

impl Executor {
    pub(crate) fn new() -> io::Result<Executor> {
        let (sender, receiver) = mpsc::channel::<Batch>();
        thread::Builder::new()
            .name("shoal-runners".to_owned())
            .spawn(move || {
                for (env, batch) in receiver {
                    for invocation in batch {
                        invocation.run(Arc::clone(&env));
                    }
                }
            })?;
        Ok(Executor {
            sender: Mutex::new(sender),
        })
    }

    pub(crate) fn submit(&self, env: Arc<Environment>, batch: Vec<Invocation>) {
        if batch.is_empty() {
            return;
        }
        if let Err(SendError((_, batch))) = self.sender.lock().unwrap().send((env, batch)) {
            log::error!("runner thread is gone, abandoning {} invocations", batch.len());
            for invocation in batch {
                invocation.abandon(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "runner thread has stopped",
                ));
            }
        }
    }
}
