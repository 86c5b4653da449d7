// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic trim timer.
//!
//! A background thread fires the pool's trim pass every `interval`. The
//! handle stops and joins the thread when dropped; stopping uses a condvar
//! instead of a bare sleep so `dispose()` never waits out a 10-minute
//! interval.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Handle to a running trim timer thread.
///
/// When dropped, signals the thread to stop and joins it.
pub(crate) struct TrimTimer {
    signal: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl TrimTimer {
    /// Spawn the timer. `tick` runs once per interval; returning false ends
    /// the timer (the pool is gone).
    pub(crate) fn spawn(interval: Duration, mut tick: impl FnMut() -> bool + Send + 'static) -> Self {
        let signal = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let signal_clone = Arc::clone(&signal);

        let thread = std::thread::Builder::new()
            .name("segmem-trim".to_string())
            .spawn(move || {
                log::debug!("[trim] started with interval {interval:?}");
                loop {
                    {
                        let mut stopped = signal_clone.stopped.lock();
                        if !*stopped {
                            let _ = signal_clone.wake.wait_for(&mut stopped, interval);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    if !tick() {
                        break;
                    }
                }
                log::debug!("[trim] stopped");
            })
            .expect("failed to spawn trim timer thread");

        Self {
            signal,
            thread: Some(thread),
        }
    }
}

impl Drop for TrimTimer {
    fn drop(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() == std::thread::current().id() {
                // The last pool handle died inside a tick, so this drop is
                // running on the timer thread itself. Detach; the stop flag
                // ends the loop right after the tick returns.
                return;
            }
            let _ = handle.join();
        }
    }
}
