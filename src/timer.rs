//! Single-shot, cancelable timeout timer (spec §4.2).
//!
//! `start` always cancels whatever timer was previously armed before
//! arming a new one, per spec: "Each call to `start_timer` first cancels
//! any previously registered timer for this client and then arms a fresh
//! one." A generation counter makes a timer that fires after it has
//! already been superseded a silent no-op rather than requiring a real
//! task-cancellation race to be won.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

pub struct Timer {
    generation: Arc<AtomicU64>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn new() -> Self {
        Timer {
            generation: Arc::new(AtomicU64::new(0)),
            handle: std::sync::Mutex::new(None),
        }
    }

    /// Cancel any previously armed timer, then arm a fresh one that invokes
    /// `on_fire` after `duration` unless canceled first.
    pub fn start<F>(&self, duration: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.stop();
        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = Arc::clone(&self.generation);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if generation.load(Ordering::SeqCst) == my_generation {
                on_fire();
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Cancel the currently armed timer, if any. A no-op if none is armed.
    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
