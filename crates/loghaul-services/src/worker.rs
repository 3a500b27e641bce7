//! Fixed-size worker pools over a ring buffer.
//!
//! Worker `o` of `W` handles exactly the sequences `s` with `s % W == o`
//! and skips the rest. Every worker still walks the whole sequence space
//! and advances its gating position after each sequence, so a slot is
//! released once every worker is past it. The partition is static: no two
//! workers ever contend for the same event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::metrics::{WorkerSnapshot, WorkerStats};
use crate::ring::{RingBuffer, Sequence};

/// How long an idle worker parks before re-checking for shutdown.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Processes one buffered event. Called from worker threads concurrently.
pub trait EventHandler<T>: Send + Sync + 'static {
    fn on_event(&self, event: T, sequence: u64) -> anyhow::Result<()>;
}

impl<T, F> EventHandler<T> for F
where
    F: Fn(T, u64) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_event(&self, event: T, sequence: u64) -> anyhow::Result<()> {
        self(event, sequence)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool needs at least one worker")]
    Empty,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result of a pool shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Published cursor the pool was asked to drain up to.
    pub drain_target: u64,
    /// Events assigned to a worker that had not finished them at the deadline.
    pub abandoned: u64,
    /// Workers still running at the deadline and left detached.
    pub detached_workers: usize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned == 0 && self.detached_workers == 0
    }
}

/// Shutdown coordination shared by a pool and its threads.
struct Control {
    /// Workers stop once they reach this sequence. `u64::MAX` while running.
    halt_at: AtomicU64,
    /// Set after the drain deadline; workers stop at the next sequence.
    abort: AtomicBool,
    finished: Mutex<usize>,
    all_finished: Condvar,
}

struct Worker {
    ordinal: usize,
    sequence: Arc<Sequence>,
    stats: Arc<WorkerStats>,
    done: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

pub struct WorkerPool<T> {
    name: String,
    ring: Arc<RingBuffer<T>>,
    workers: Vec<Worker>,
    control: Arc<Control>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Register `size` consumers on `ring` and start their threads.
    pub fn start(
        name: impl Into<String>,
        ring: Arc<RingBuffer<T>>,
        size: usize,
        handler: Arc<dyn EventHandler<T>>,
    ) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::Empty);
        }

        let name = name.into();
        let control = Arc::new(Control {
            halt_at: AtomicU64::new(u64::MAX),
            abort: AtomicBool::new(false),
            finished: Mutex::new(0),
            all_finished: Condvar::new(),
        });

        // All gating sequences exist before any thread runs, so no worker
        // can race ahead and let a producer overwrite a slot another worker
        // still owns.
        let mut workers: Vec<Worker> = (0..size)
            .map(|ordinal| Worker {
                ordinal,
                sequence: ring.add_gating_sequence(),
                stats: Arc::new(WorkerStats::default()),
                done: Arc::new(AtomicBool::new(false)),
                thread: None,
            })
            .collect();

        for i in 0..size {
            let ctx = WorkerContext {
                pool: name.clone(),
                ordinal: i,
                pool_size: size,
                ring: ring.clone(),
                sequence: workers[i].sequence.clone(),
                stats: workers[i].stats.clone(),
                done: workers[i].done.clone(),
                handler: handler.clone(),
                control: control.clone(),
            };
            let spawned = std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || ctx.run());

            match spawned {
                Ok(handle) => workers[i].thread = Some(handle),
                Err(e) => {
                    control.abort.store(true, Ordering::SeqCst);
                    for worker in &mut workers {
                        ring.remove_gating_sequence(&worker.sequence);
                        if let Some(handle) = worker.thread.take() {
                            let _ = handle.join();
                        }
                    }
                    return Err(PoolError::Spawn(e));
                }
            }
        }

        tracing::info!(pool = %name, workers = size, "worker pool started");
        Ok(Self {
            name,
            ring,
            workers,
            control,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .iter()
            .map(|w| w.stats.snapshot(w.ordinal))
            .collect()
    }

    /// Drain every event published so far, then stop.
    ///
    /// Waits at most `timeout`. Workers still busy at the deadline are told
    /// to abort and left detached; their unfinished share is reported as
    /// abandoned.
    pub fn shutdown(mut self, timeout: Duration) -> ShutdownReport {
        let target = self.ring.published();
        self.control.halt_at.store(target, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;

        {
            let mut finished = self.control.finished.lock();
            while *finished < self.workers.len() {
                if self
                    .control
                    .all_finished
                    .wait_until(&mut finished, deadline)
                    .timed_out()
                {
                    break;
                }
            }
        }
        self.control.abort.store(true, Ordering::SeqCst);

        let pool_size = self.workers.len() as u64;
        let mut report = ShutdownReport {
            drain_target: target,
            ..ShutdownReport::default()
        };

        for worker in &mut self.workers {
            let position = worker.sequence.get().min(target);
            report.abandoned += owned_between(position, target, pool_size, worker.ordinal as u64);

            if let Some(handle) = worker.thread.take() {
                if worker.done.load(Ordering::SeqCst) {
                    if handle.join().is_err() {
                        tracing::error!(pool = %self.name, ordinal = worker.ordinal, "worker thread panicked");
                    }
                } else {
                    report.detached_workers += 1;
                }
            }
            self.ring.remove_gating_sequence(&worker.sequence);
        }

        if report.is_clean() {
            tracing::info!(pool = %self.name, drained = target, "worker pool stopped");
        } else {
            tracing::warn!(
                pool = %self.name,
                abandoned = report.abandoned,
                detached = report.detached_workers,
                "worker pool drain timed out"
            );
        }
        report
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        // Reached only when `shutdown` was never called.
        self.control.abort.store(true, Ordering::SeqCst);
        for worker in &mut self.workers {
            if let Some(handle) = worker.thread.take() {
                let _ = handle.join();
            }
            self.ring.remove_gating_sequence(&worker.sequence);
        }
    }
}

/// Count sequences `s` in `[from, to)` with `s % size == ordinal`.
fn owned_between(from: u64, to: u64, size: u64, ordinal: u64) -> u64 {
    let below = |x: u64| if x <= ordinal { 0 } else { (x - ordinal - 1) / size + 1 };
    below(to).saturating_sub(below(from))
}

struct WorkerContext<T> {
    pool: String,
    ordinal: usize,
    pool_size: usize,
    ring: Arc<RingBuffer<T>>,
    sequence: Arc<Sequence>,
    stats: Arc<WorkerStats>,
    done: Arc<AtomicBool>,
    handler: Arc<dyn EventHandler<T>>,
    control: Arc<Control>,
}

impl<T: 'static> WorkerContext<T> {
    fn run(self) {
        let mut next = self.sequence.get();
        let pool_size = self.pool_size as u64;
        let ordinal = self.ordinal as u64;

        'outer: loop {
            if self.control.abort.load(Ordering::SeqCst) {
                break;
            }
            let mut halt = self.control.halt_at.load(Ordering::SeqCst);
            if self.ring.is_closed() {
                // Nothing more can be published; drain what is there.
                halt = halt.min(self.ring.published());
            }
            if next >= halt {
                break;
            }

            let available = self.ring.wait_for(next, IDLE_WAIT).min(halt);
            for s in next..available {
                if self.control.abort.load(Ordering::SeqCst) {
                    break 'outer;
                }
                if s % pool_size == ordinal {
                    if let Some(event) = self.ring.take(s) {
                        self.process(event, s);
                    }
                }
                self.ring.advance(&self.sequence, s + 1);
            }
            next = next.max(available);
        }

        self.done.store(true, Ordering::SeqCst);
        let mut finished = self.control.finished.lock();
        *finished += 1;
        self.control.all_finished.notify_all();
    }

    fn process(&self, event: T, sequence: u64) {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.handler.on_event(event, sequence)));
        let ok = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(pool = %self.pool, ordinal = self.ordinal, sequence, error = %e, "event handler failed");
                false
            }
            Err(_) => {
                tracing::error!(pool = %self.pool, ordinal = self.ordinal, sequence, "event handler panicked");
                false
            }
        };
        self.stats.record(started.elapsed(), ok);
    }
}
