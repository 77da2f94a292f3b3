//! A multithreaded runtime hosting the ensemble's worker event loops.
//!
//! The manager runs on the calling thread; each worker runs its event loop
//! on a spawned thread. Shutdown is cooperative: every worker owns a kill
//! signal and a parker, and long-running callbacks that want to be killable
//! park on the worker's parker so a shutdown can wake them.

use crate::comms::WorkerLink;
use crate::launcher::Launcher;
use crate::registry::WorkerId;
use crate::specs::{GenSpecs, SimSpecs};
use crate::worker::worker_main;
use crossbeam_utils::sync::{Parker, Unparker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread::{Builder, JoinHandle, LocalKey, Result as ThreadResult};
use std::time::{Duration, Instant};

// Thread-local variables used by the termination protocol.
thread_local! {
    // Parker that callbacks within the worker thread must use for any
    // cancellable wait, so that they get woken up by a shutdown.
    static PARKER: Parker = Parker::new();

    // Raised by `RuntimeHandle::kill` and by the shutdown deadline.
    // The worker event loop checks this between receives and exits
    // promptly once it is set.
    static KILL_SIGNAL: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

    // Id of the current worker thread, or 0 outside a runtime (the
    // manager's id).
    static WORKER_ID: std::cell::Cell<WorkerId> = std::cell::Cell::new(0);
}

/// Everything one worker thread needs to run.
pub(crate) struct WorkerSetup {
    pub id: WorkerId,
    pub link: WorkerLink,
    pub sim_specs: Arc<SimSpecs>,
    pub gen_specs: Arc<GenSpecs>,
    pub launcher: Option<Arc<dyn Launcher>>,
    pub dump_dir: std::path::PathBuf,
}

/// The runtime facade worker-side code sees.
pub struct Runtime;

impl Runtime {
    /// Spawn one thread per worker setup and return the control handle.
    pub(crate) fn run(setups: Vec<WorkerSetup>) -> RuntimeHandle {
        let mut workers = Vec::with_capacity(setups.len());

        for setup in setups {
            let worker_id = setup.id;
            let builder = Builder::new().name(format!("worker{}", worker_id));
            let done = Arc::new(AtomicBool::new(false));
            let done_in_thread = done.clone();

            let (init_sender, init_receiver) = sync_channel(0);

            let join_handle = builder
                .spawn(move || {
                    WORKER_ID.with(|w| w.set(worker_id));
                    init_sender
                        .send((
                            PARKER.with(|parker| parker.unparker().clone()),
                            KILL_SIGNAL.with(|s| s.clone()),
                        ))
                        .unwrap();
                    // Mark the thread finished even if the event loop
                    // panics, so shutdown does not wait out its deadline.
                    let _done = DoneGuard(done_in_thread);
                    worker_main(setup);
                })
                .unwrap_or_else(|_| panic!("failed to spawn worker thread {}", worker_id));

            let (unparker, kill_signal) = init_receiver.recv().unwrap();
            workers.push(WorkerHandle {
                join_handle,
                unparker,
                kill_signal,
                done,
            });
        }

        RuntimeHandle { workers }
    }

    /// Id of the current worker thread; `0` for threads outside a runtime.
    pub fn worker_id() -> WorkerId {
        WORKER_ID.with(|w| w.get())
    }

    /// The current worker's parker. Callbacks must use this parker for any
    /// wait they want a shutdown to interrupt.
    pub fn parker() -> &'static LocalKey<Parker> {
        &PARKER
    }

    /// True once the current worker has been told to exit as soon as
    /// possible. Checked by the event loop between receives; long-running
    /// callbacks should check it after parking.
    pub fn kill_in_progress() -> bool {
        KILL_SIGNAL.with(|signal| signal.load(Ordering::SeqCst))
    }
}

struct DoneGuard(Arc<AtomicBool>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Per-worker controls.
struct WorkerHandle {
    join_handle: JoinHandle<()>,
    unparker: Unparker,
    kill_signal: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
}

impl WorkerHandle {
    fn raise_kill(&self) {
        self.kill_signal.store(true, Ordering::SeqCst);
        self.unparker.unpark();
    }
}

/// Handle returned by [`Runtime::run`].
pub struct RuntimeHandle {
    workers: Vec<WorkerHandle>,
}

impl RuntimeHandle {
    /// Wait for all workers to terminate.
    pub fn join(self) -> ThreadResult<()> {
        // Insist on joining all threads even if some of them fail.
        let results: Vec<ThreadResult<()>> = self
            .workers
            .into_iter()
            .map(|h| h.join_handle.join())
            .collect();
        results.into_iter().collect()
    }

    /// Terminate all workers without waiting for in-progress work.
    pub fn kill(self) -> ThreadResult<()> {
        for worker in self.workers.iter() {
            worker.raise_kill();
        }
        self.join()
    }

    /// Orderly shutdown: wait up to `timeout` for workers to exit on their
    /// own (they have been sent a finish signal), then raise kill signals
    /// on the laggards and give them one short grace period. Workers still
    /// running after that are abandoned; returns how many.
    pub(crate) fn shutdown(self, timeout: Duration) -> usize {
        wait_all_done(&self.workers, timeout);

        for worker in self.workers.iter().filter(|w| !is_done(w)) {
            worker.raise_kill();
        }
        wait_all_done(&self.workers, GRACE);

        let mut abandoned = 0;
        for worker in self.workers {
            if is_done(&worker) {
                let _ = worker.join_handle.join();
            } else {
                // The thread is stuck in user code; leave it behind.
                abandoned += 1;
            }
        }
        abandoned
    }
}

const GRACE: Duration = Duration::from_millis(500);

fn is_done(worker: &WorkerHandle) -> bool {
    worker.done.load(Ordering::SeqCst)
}

fn wait_all_done(workers: &[WorkerHandle], timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while workers.iter().any(|w| !is_done(w)) {
        if Instant::now() >= deadline {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
