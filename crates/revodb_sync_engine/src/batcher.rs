//! Delay/size-based work batching.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, trace};

/// Callback invoked with each drained batch of work.
pub type BatchProcessor<T> = Box<dyn Fn(Vec<T>) + Send + Sync>;

/// Queues up objects until the queue fills up or a time interval elapses,
/// then passes them, in groups of at most `capacity`, to a client-supplied
/// processor callback.
///
/// Reaching `capacity` flushes immediately on the calling thread. Otherwise
/// a single delayed flush is scheduled; re-scheduling with a shorter delay
/// replaces the pending one. If more than `delay` has elapsed since the last
/// flush, the next flush is scheduled with zero delay to bound latency.
pub struct Batcher<T: Send + 'static> {
    inner: Arc<BatcherInner<T>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

struct BatcherInner<T> {
    capacity: usize,
    delay: Duration,
    processor: BatchProcessor<T>,
    state: Mutex<BatcherState<T>>,
    wakeup: Condvar,
}

struct BatcherState<T> {
    inbox: VecDeque<T>,
    /// Deadline of the single in-flight delayed flush, if one is scheduled.
    deadline: Option<Instant>,
    last_processed: Option<Instant>,
    shutdown: bool,
}

impl<T: Send + 'static> Batcher<T> {
    /// Creates a batcher and starts its scheduler.
    ///
    /// `capacity` is the batch size that triggers an immediate flush;
    /// `delay` is the debounce window for partially filled batches.
    pub fn new(capacity: usize, delay: Duration, processor: BatchProcessor<T>) -> Self {
        let inner = Arc::new(BatcherInner {
            capacity: capacity.max(1),
            delay,
            processor,
            state: Mutex::new(BatcherState {
                inbox: VecDeque::new(),
                deadline: None,
                last_processed: None,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let scheduler_inner = Arc::clone(&inner);
        let scheduler = thread::Builder::new()
            .name("batcher".into())
            .spawn(move || scheduler_inner.scheduler_loop())
            .ok();

        Self {
            inner,
            scheduler: Mutex::new(scheduler),
        }
    }

    /// Adds an object to the queue.
    pub fn queue_object(&self, object: T) {
        self.queue_objects(vec![object]);
    }

    /// Adds multiple objects to the queue.
    pub fn queue_objects(&self, objects: Vec<T>) {
        self.inner.queue_objects(objects);
    }

    /// Cancels any pending delayed flush and processes one batch now.
    pub fn flush(&self) {
        self.inner.unschedule();
        self.inner.process_now();
    }

    /// Sends all queued objects to the processor, regardless of capacity,
    /// until the queue is empty.
    pub fn flush_all(&self) {
        self.inner.flush_all();
    }

    /// Number of objects currently queued.
    pub fn count(&self) -> usize {
        self.inner.state.lock().inbox.len()
    }

    /// Empties the queue without processing anything.
    pub fn clear(&self) {
        self.inner.unschedule();
        self.inner.state.lock().inbox.clear();
    }
}

impl<T: Send + 'static> Drop for Batcher<T> {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
        }
        self.inner.wakeup.notify_all();
        if let Some(handle) = self.scheduler.lock().take() {
            let _ = handle.join();
        }
    }
}

impl<T: Send + 'static> BatcherInner<T> {
    fn queue_objects(&self, objects: Vec<T>) {
        if objects.is_empty() {
            return;
        }
        let over_capacity = {
            let mut state = self.state.lock();
            trace!(queued = objects.len(), pending = state.inbox.len(), "queueing objects");
            state.inbox.extend(objects);
            if state.inbox.len() >= self.capacity {
                // Full batch: drop the pending timer and flush right away.
                state.deadline = None;
                true
            } else {
                let delay = self.delay_to_use(&state);
                self.schedule_locked(&mut state, delay);
                false
            }
        };
        if over_capacity {
            self.process_now();
        }
    }

    /// Zero once more than `delay` has passed since the last flush.
    fn delay_to_use(&self, state: &BatcherState<T>) -> Duration {
        match state.last_processed {
            Some(last) if last.elapsed() < self.delay => self.delay,
            _ => Duration::ZERO,
        }
    }

    fn schedule_locked(&self, state: &mut BatcherState<T>, delay: Duration) {
        let target = Instant::now() + delay;
        match state.deadline {
            // An earlier flush is already on its way.
            Some(existing) if existing <= target => {}
            _ => {
                state.deadline = Some(target);
                self.wakeup.notify_all();
            }
        }
    }

    fn unschedule(&self) {
        self.state.lock().deadline = None;
    }

    fn process_now(&self) {
        let batch = {
            let mut state = self.state.lock();
            if state.inbox.is_empty() {
                return;
            }
            let take = state.inbox.len().min(self.capacity);
            let batch: Vec<T> = state.inbox.drain(..take).collect();
            if !state.inbox.is_empty() {
                // More objects left; schedule them for processing real soon.
                self.schedule_locked(&mut state, Duration::ZERO);
            }
            batch
        };
        self.run_processor(batch);
    }

    fn flush_all(&self) {
        loop {
            let batch: Vec<T> = {
                let mut state = self.state.lock();
                state.deadline = None;
                if state.inbox.is_empty() {
                    return;
                }
                state.inbox.drain(..).collect()
            };
            self.run_processor(batch);
        }
    }

    fn run_processor(&self, batch: Vec<T>) {
        trace!(items = batch.len(), "invoking batch processor");
        // The processor must never take the scheduler down with it.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.processor)(batch)));
        if outcome.is_err() {
            error!("batch processor panicked; batch dropped");
        }
        self.state.lock().last_processed = Some(Instant::now());
    }

    fn scheduler_loop(&self) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            match state.deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    state.deadline = None;
                    drop(state);
                    self.process_now();
                    state = self.state.lock();
                }
                Some(deadline) => {
                    self.wakeup.wait_until(&mut state, deadline);
                }
                None => {
                    self.wakeup.wait(&mut state);
                }
            }
        }
    }
}
