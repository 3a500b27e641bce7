//! Periodic eviction of stale chunk sets.
//!
//! Runs on its own thread so memory stays bounded even when no fragments
//! arrive at all.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::aggregator::ChunkAggregator;

pub struct Evictor {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Evictor {
    /// Start scanning `aggregator` every `period`, dropping sets older than
    /// the aggregator's configured max age.
    pub fn spawn(aggregator: Arc<ChunkAggregator>, period: Duration) -> std::io::Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = stop.clone();
        let max_age = aggregator.limits().max_age;

        let handle = std::thread::Builder::new()
            .name("chunk-evictor".into())
            .spawn(move || {
                let (lock, cvar) = &*signal;
                let mut stopped = lock.lock();
                loop {
                    let deadline = Instant::now() + period;
                    while !*stopped {
                        if cvar.wait_until(&mut stopped, deadline).timed_out() {
                            break;
                        }
                    }
                    if *stopped {
                        tracing::debug!("chunk evictor stopping");
                        return;
                    }

                    let evicted = aggregator.evict_stale(Instant::now(), max_age);
                    if evicted > 0 {
                        tracing::debug!(evicted, waiting = aggregator.waiting(), "evicted stale chunk sets");
                    }
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let (lock, cvar) = &*self.stop;
        *lock.lock() = true;
        cvar.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("chunk evictor thread panicked");
            }
        }
    }
}

impl Drop for Evictor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
