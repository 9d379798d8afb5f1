//! Optional worker-thread pool for offloading relay-cell cryptography.
//!
//! The channel core is single-threaded and does not depend on this
//! module.  When a relay wants to spend more than one core on
//! relay-cell crypto, it can keep a [`Dispatcher`] with a fixed set of
//! worker threads and one [`Job`] per (circuit, direction); the main
//! thread queues cell payloads onto jobs and collects the transformed
//! results between event-loop turns.
//!
//! Locking discipline: there are exactly two kinds of mutex here, the
//! dispatcher's pending-list mutex and the per-job mutexes.  Code takes
//! the dispatcher's before a job's when it needs both, and never holds
//! two of the same kind at once.  Workers detect circuit death without
//! any lock at all: the `alive` flag on a job is cleared at most once,
//! by the main thread, and merely polled by workers.
//!
//! TODO: wire the circuit multiplexer's cell queues into these jobs
//! once the multiplexer grows a second thread; today callers must move
//! payloads in and out by hand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::trace;

use orlink_cell::BoxedPayload;

/// A transform to apply to relay-cell payloads.
///
/// (In a real relay this is the AES layer of onion encryption; tests
/// use whatever they like.)
pub trait RelayCrypt: Send + 'static {
    /// Transform one 509-byte payload in place.
    fn transform(&mut self, payload: &mut BoxedPayload);
}

/// The lifecycle of a job.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum JobState {
    /// Nothing queued; no worker interested.
    Idle,
    /// Work queued; waiting for a worker.
    Ready,
    /// A worker is processing this job right now.
    Running,
    /// The circuit is gone; the job will never run again.
    Dead,
}

/// Which direction of a circuit a job serves.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum Direction {
    /// Cells moving toward the client.
    Inbound,
    /// Cells moving toward the exit.
    Outbound,
}

/// The lock-guarded parts of a job.
struct JobInner {
    /// Where the job is in its lifecycle.
    state: JobState,
    /// Payloads waiting to be transformed.
    queue: VecDeque<BoxedPayload>,
    /// Payloads already transformed, waiting for the main thread.
    done: VecDeque<BoxedPayload>,
    /// The transform.
    crypt: Box<dyn RelayCrypt>,
}

/// One (circuit, direction)'s crypto work.
pub struct Job {
    /// Which direction this job serves.
    direction: Direction,
    /// Cleared (at most once, by the main thread) when the circuit
    /// dies; polled by workers without any lock.
    alive: AtomicBool,
    /// Everything else, under the per-job mutex.
    inner: Mutex<JobInner>,
}

impl Job {
    /// Return this job's direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }
    /// Return this job's current state.
    pub fn state(&self) -> JobState {
        self.inner.lock().expect("job lock poisoned").state
    }
}

/// The dispatcher's lock-guarded parts.
struct DispatcherInner {
    /// Jobs with queued work, in arrival order.
    pending: VecDeque<Arc<Job>>,
    /// Set when the workers should exit.
    shutdown: bool,
}

/// A fixed pool of worker threads and the queue of jobs they serve.
pub struct Dispatcher {
    /// The pending-jobs list, under the dispatcher mutex.
    inner: Mutex<DispatcherInner>,
    /// Signalled when pending work (or shutdown) appears.
    work_ready: Condvar,
}

impl Dispatcher {
    /// Create a dispatcher with `n_workers` worker threads.
    ///
    /// Returns the dispatcher and the workers' join handles; call
    /// [`Dispatcher::shutdown`] and then join them to stop cleanly.
    pub fn spawn(n_workers: usize) -> (Arc<Dispatcher>, Vec<thread::JoinHandle<()>>) {
        let dispatcher = Arc::new(Dispatcher {
            inner: Mutex::new(DispatcherInner {
                pending: VecDeque::new(),
                shutdown: false,
            }),
            work_ready: Condvar::new(),
        });
        let workers = (0..n_workers)
            .map(|i| {
                let dispatcher = Arc::clone(&dispatcher);
                thread::Builder::new()
                    .name(format!("relaycrypt-{}", i))
                    .spawn(move || dispatcher.worker_loop())
                    .expect("could not spawn worker thread")
            })
            .collect();
        (dispatcher, workers)
    }

    /// Create a new job for one (circuit, direction).
    pub fn new_job(&self, direction: Direction, crypt: Box<dyn RelayCrypt>) -> Arc<Job> {
        Arc::new(Job {
            direction,
            alive: AtomicBool::new(true),
            inner: Mutex::new(JobInner {
                state: JobState::Idle,
                queue: VecDeque::new(),
                done: VecDeque::new(),
                crypt,
            }),
        })
    }

    /// Queue one payload onto `job` and wake a worker.
    ///
    /// Payloads queued onto a dead job are quietly dropped.
    pub fn submit(&self, job: &Arc<Job>, payload: BoxedPayload) {
        let newly_ready = {
            // Job lock only.
            let mut inner = job.inner.lock().expect("job lock poisoned");
            match inner.state {
                JobState::Dead => return,
                JobState::Idle => {
                    inner.state = JobState::Ready;
                    inner.queue.push_back(payload);
                    true
                }
                JobState::Ready | JobState::Running => {
                    inner.queue.push_back(payload);
                    false
                }
            }
        };
        if newly_ready {
            // Dispatcher lock only (the job lock is already released).
            let mut inner = self.inner.lock().expect("dispatcher lock poisoned");
            inner.pending.push_back(Arc::clone(job));
            drop(inner);
            self.work_ready.notify_one();
        }
    }

    /// Take every transformed payload a job has finished.
    pub fn collect(&self, job: &Job) -> Vec<BoxedPayload> {
        let mut inner = job.inner.lock().expect("job lock poisoned");
        inner.done.drain(..).collect()
    }

    /// The circuit behind `job` is gone: mark the job dead and discard
    /// its work.
    ///
    /// Main thread only.  A worker mid-[`JobState::Running`] notices
    /// the cleared flag between payloads and abandons the rest.
    pub fn kill_job(&self, job: &Job) {
        job.alive.store(false, Ordering::Release);
        let mut inner = job.inner.lock().expect("job lock poisoned");
        inner.state = JobState::Dead;
        inner.queue.clear();
        inner.done.clear();
    }

    /// Tell the workers to exit once current work is done.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("dispatcher lock poisoned");
        inner.shutdown = true;
        drop(inner);
        self.work_ready.notify_all();
    }

    /// Body of each worker thread.
    fn worker_loop(&self) {
        loop {
            // Phase 1: dispatcher lock, to find a job.
            let job = {
                let mut inner = self.inner.lock().expect("dispatcher lock poisoned");
                loop {
                    if inner.shutdown {
                        return;
                    }
                    if let Some(job) = inner.pending.pop_front() {
                        break job;
                    }
                    inner = self
                        .work_ready
                        .wait(inner)
                        .expect("dispatcher lock poisoned");
                }
            };
            // Phase 2: job lock only; the dispatcher lock is released.
            self.run_job(&job);
        }
    }

    /// Transform everything queued on one job.
    fn run_job(&self, job: &Job) {
        loop {
            let mut payload = {
                let mut inner = job.inner.lock().expect("job lock poisoned");
                if inner.state == JobState::Dead {
                    return;
                }
                match inner.queue.pop_front() {
                    Some(p) => {
                        inner.state = JobState::Running;
                        p
                    }
                    None => {
                        inner.state = JobState::Idle;
                        return;
                    }
                }
            };
            // Check for circuit death between payloads, without a lock.
            if !job.alive.load(Ordering::Acquire) {
                trace!("dropping relaycrypt work for a dead circuit");
                return;
            }
            {
                // Job lock again, for the transform state and results.
                let mut inner = job.inner.lock().expect("job lock poisoned");
                let crypt = &mut inner.crypt;
                crypt.transform(&mut payload);
                inner.done.push_back(payload);
            }
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use orlink_cell::PAYLOAD_SIZE;
    use std::time::Duration;

    /// A transform that XORs every byte with a constant.
    struct Xor(u8);
    impl RelayCrypt for Xor {
        fn transform(&mut self, payload: &mut BoxedPayload) {
            for b in payload.iter_mut() {
                *b ^= self.0;
            }
        }
    }

    fn payload(fill: u8) -> BoxedPayload {
        Box::new([fill; PAYLOAD_SIZE])
    }

    /// Wait (bounded) until `job` has `n` finished payloads.
    fn wait_for(dispatcher: &Dispatcher, job: &Job, n: usize) -> Vec<BoxedPayload> {
        let mut out = Vec::new();
        for _ in 0..500 {
            out.extend(dispatcher.collect(job));
            if out.len() >= n {
                return out;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("workers never finished: got {} of {}", out.len(), n);
    }

    #[test]
    fn transforms_flow_through() {
        let (dispatcher, workers) = Dispatcher::spawn(2);
        let job = dispatcher.new_job(Direction::Outbound, Box::new(Xor(0xff)));
        assert_eq!(job.direction(), Direction::Outbound);
        for i in 0..8 {
            dispatcher.submit(&job, payload(i));
        }
        let done = wait_for(&dispatcher, &job, 8);
        assert_eq!(done.len(), 8);
        // Order is preserved within a job.
        for (i, p) in done.iter().enumerate() {
            assert_eq!(p[0], (i as u8) ^ 0xff);
        }
        dispatcher.shutdown();
        for w in workers {
            w.join().unwrap();
        }
    }

    #[test]
    fn dead_jobs_do_no_work() {
        let (dispatcher, workers) = Dispatcher::spawn(1);
        let job = dispatcher.new_job(Direction::Inbound, Box::new(Xor(0x01)));
        dispatcher.kill_job(&job);
        assert_eq!(job.state(), JobState::Dead);
        dispatcher.submit(&job, payload(9));
        // Nothing to collect, now or ever.
        std::thread::sleep(Duration::from_millis(10));
        assert!(dispatcher.collect(&job).is_empty());
        dispatcher.shutdown();
        for w in workers {
            w.join().unwrap();
        }
    }

    #[test]
    fn shutdown_stops_workers() {
        let (dispatcher, workers) = Dispatcher::spawn(3);
        dispatcher.shutdown();
        for w in workers {
            w.join().unwrap();
        }
    }
}
