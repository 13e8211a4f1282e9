// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Background timeout sweep.

use crate::orchestrator::Orchestrator;
use crossbeam::channel::{Sender, bounded, select, tick};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Runs [`Orchestrator::sweep_timeouts`] every `interval` on its own thread
/// until stopped or dropped.
pub struct TimeoutSweeper {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TimeoutSweeper {
    pub fn spawn(orchestrator: Arc<Orchestrator>, interval: Duration) -> std::io::Result<Self> {
        let (shutdown, stop) = bounded::<()>(1);
        let ticker = tick(interval);
        let handle = thread::Builder::new()
            .name("timeout-sweeper".into())
            .spawn(move || {
                tracing::info!(interval_ms = interval.as_millis() as u64, "timeout sweeper started");
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let expired = orchestrator.sweep_timeouts();
                            if !expired.is_empty() {
                                tracing::info!(count = expired.len(), "sweep timed out payments");
                            }
                        }
                        recv(stop) -> _ => break,
                    }
                }
                tracing::info!("timeout sweeper stopped");
            })?;
        Ok(Self {
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    /// Signals the thread and waits for the current sweep to finish.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        // Dropping the sender disconnects `stop`, which also ends the loop.
        drop(self.shutdown.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("timeout sweeper panicked");
            }
        }
    }
}

impl Drop for TimeoutSweeper {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
