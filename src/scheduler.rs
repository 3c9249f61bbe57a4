use std::{
    collections::VecDeque,
    mem,
    sync::Arc,
    thread::{self, JoinHandle},
};

use anyhow::Result;
use log::{error, info, trace};
use parking_lot::{Condvar, Mutex};

use crate::{
    arena::{ChunkPool, CommandChunk},
    commands::{CommandBufferManager, Pipeline, PresentRequest},
    driver::{DescriptorPoolHandle, GpuDriver, PresentResult, SemaphoreHandle, WaitStage},
};

type Chunk = CommandChunk<CommandBufferManager>;

/// Hook run on the recording worker right before every submit,
/// standing in for the renderer's end-of-render-pass callback.
pub type PreSubmitHook = Arc<dyn Fn(&mut CommandBufferManager) + Send + Sync>;

struct WorkQueue {
    chunks: VecDeque<Chunk>,
    idle: bool,
    exiting: bool,
}

struct WorkerShared {
    work: Mutex<WorkQueue>,
    /// Wakes the recording worker when a chunk is queued.
    wake: Condvar,
    /// Broadcast by the worker whenever it observes an empty
    /// queue; `sync_worker` blocks on it.
    idle: Condvar,
    pool: ChunkPool<CommandBufferManager>,
}

/// Producer-facing façade over the deferred command pipeline.
///
/// Commands are recorded into the current chunk without
/// blocking; full chunks travel to the recording worker, which
/// replays them against the `CommandBufferManager` in exactly
/// the order they were recorded, across chunk and submit
/// boundaries. One scheduler owns one recording worker, which in
/// turn owns the manager and its submission and fence workers.
pub struct Scheduler {
    shared: Arc<WorkerShared>,
    pipeline: Arc<Pipeline>,
    current_chunk: Chunk,
    pre_submit: Option<PreSubmitHook>,
    worker: Option<JoinHandle<()>>,
    shut_down: bool,
}

impl Scheduler {
    pub fn new(driver: Arc<dyn GpuDriver>) -> Result<Self> {
        let manager = CommandBufferManager::new(driver)?;
        let pipeline = manager.pipeline();

        let shared = Arc::new(WorkerShared {
            work: Mutex::new(WorkQueue {
                chunks: VecDeque::new(),
                idle: true,
                exiting: false,
            }),
            wake: Condvar::new(),
            idle: Condvar::new(),
            pool: ChunkPool::new(),
        });

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("prospero-record".into())
                .spawn(move || recording_worker_loop(shared, manager))?
        };

        let current_chunk = shared.pool.acquire();
        info!("Scheduler started.");

        Ok(Self {
            shared,
            pipeline,
            current_chunk,
            pre_submit: None,
            worker: Some(worker),
            shut_down: false,
        })
    }

    /// Install the callback run before every submit closes the
    /// draw buffer, typically the renderer's render-pass end.
    pub fn set_pre_submit_hook<F>(&mut self, hook: F)
    where
        F: Fn(&mut CommandBufferManager) + Send + Sync + 'static,
    {
        self.pre_submit = Some(Arc::new(hook));
    }

    /// Record a command for deferred execution on the recording
    /// worker. Never blocks beyond an uncontended pool lock: if
    /// the current chunk cannot hold the command, the chunk is
    /// flushed and the record retried on a fresh one, which is
    /// guaranteed to succeed for any command that compiled.
    pub fn record<F>(&mut self, command: F)
    where
        F: FnOnce(&mut CommandBufferManager) + Send + 'static,
    {
        assert!(!self.shut_down, "command recorded after shutdown");

        if let Err(command) = self.current_chunk.record(command) {
            self.flush();
            if self.current_chunk.record(command).is_err() {
                // An empty chunk holds at least twice the
                // per-command bound, so this is unreachable for
                // any command that passed the compile-time check.
                unreachable!("fresh chunk rejected a correctly sized command");
            }
        }
    }

    /// Hand the current chunk to the recording worker and make a
    /// fresh one current. No-op if nothing has been recorded.
    pub fn flush(&mut self) {
        if self.current_chunk.is_empty() {
            return;
        }

        let full = mem::replace(&mut self.current_chunk, self.shared.pool.acquire());
        let mut work = self.shared.work.lock();
        work.chunks.push_back(full);
        work.idle = false;
        self.shared.wake.notify_one();
    }

    /// Flush, then block until the work queue is empty and the
    /// recording worker has gone idle. On return every command
    /// recorded before the call has executed.
    pub fn sync_worker(&mut self) {
        self.flush();

        let mut work = self.shared.work.lock();
        while !(work.chunks.is_empty() && work.idle) {
            self.shared.idle.wait(&mut work);
        }
    }

    /// `sync_worker`, then block until the submission worker has
    /// drained its queue and returned from any in-flight submit.
    pub fn synchronize_submission_thread(&mut self) {
        self.sync_worker();
        self.pipeline.wait_submission_idle();
    }

    /// Close the current command buffer under a fresh fence
    /// generation and route it to the driver queue, optionally
    /// presenting a swapchain image afterwards. Returns the
    /// generation assigned to this submit.
    ///
    /// With `wait_for_completion` the call blocks until the GPU
    /// has passed the new generation; otherwise it only flushes,
    /// so the submit is never starved in the current chunk.
    pub fn submit(
        &mut self,
        on_worker_thread: bool,
        wait_for_completion: bool,
        present: Option<PresentRequest>,
    ) -> u64 {
        let counter = self.pipeline.fence().next();
        let hook = self.pre_submit.clone();

        self.record(move |manager| {
            if let Some(hook) = &hook {
                hook(manager);
            }
            manager.submit(counter, on_worker_thread, wait_for_completion, present);
        });

        if wait_for_completion {
            self.wait_for_fence(counter);
        } else {
            self.flush();
        }

        counter
    }

    /// Block until generation `counter` has completed on the
    /// GPU. Returns immediately when it already has.
    pub fn wait_for_fence(&mut self, counter: u64) {
        if self.pipeline.fence().completed() >= counter {
            return;
        }

        // The submit closure for `counter` may still be sitting
        // in a chunk; push everything through before blocking on
        // the counter itself.
        self.sync_worker();
        self.pipeline.fence().wait_completed(counter);
    }

    /// Drain both pipeline stages, then stop and join all worker
    /// threads. Recording anything afterwards is a precondition
    /// violation. Idempotent; also run on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }

        self.sync_worker();
        self.synchronize_submission_thread();

        {
            let mut work = self.shared.work.lock();
            work.exiting = true;
            self.shared.wake.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            // Joining the recording worker also drops the
            // manager, which stops the submission and fence
            // workers and destroys the driver objects.
            if worker.join().is_err() {
                error!("Recording worker panicked.");
            }
        }

        self.shut_down = true;
        info!("Scheduler stopped.");
    }

    /// Enqueue a destruction thunk against the command buffer
    /// currently being recorded; it runs only once the GPU has
    /// passed that buffer's fence generation.
    pub fn defer_destruction<F>(&mut self, thunk: F)
    where
        F: FnOnce(&Arc<dyn GpuDriver>) + Send + 'static,
    {
        self.record(move |manager| manager.defer_destruction(thunk));
    }

    pub fn defer_semaphore_destruction(&mut self, semaphore: SemaphoreHandle) {
        self.record(move |manager| manager.defer_semaphore_destruction(semaphore));
    }

    pub fn defer_descriptor_pool_destruction(&mut self, pool: DescriptorPoolHandle) {
        self.record(move |manager| manager.defer_descriptor_pool_destruction(pool));
    }

    /// Make the next submit wait on `semaphore`, typically the
    /// one signalled by swapchain image acquisition.
    pub fn set_wait_semaphore(&mut self, semaphore: SemaphoreHandle, stage: WaitStage) {
        self.record(move |manager| manager.set_wait_semaphore(semaphore, stage));
    }

    pub fn current_fence(&self) -> u64 {
        self.pipeline.fence().current()
    }

    pub fn completed_fence(&self) -> u64 {
        self.pipeline.fence().completed()
    }

    /// True exactly once after a failing present, then false
    /// until the next failure.
    pub fn check_last_present_failed(&self) -> bool {
        self.pipeline.check_last_present_failed()
    }

    /// True exactly once after any present has completed.
    pub fn check_last_present_done(&self) -> bool {
        self.pipeline.check_last_present_done()
    }

    pub fn last_present_result(&self) -> PresentResult {
        self.pipeline.last_present_result()
    }

    /// True exactly once after the pipeline has observed a fatal
    /// driver error; the device is assumed lost.
    pub fn check_device_lost(&self) -> bool {
        self.pipeline.check_device_lost()
    }

    #[cfg(test)]
    fn pool_reserved(&self) -> usize {
        self.shared.pool.reserved()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn recording_worker_loop(shared: Arc<WorkerShared>, mut manager: CommandBufferManager) {
    trace!("Recording worker started.");
    loop {
        let mut chunk = {
            let mut work = shared.work.lock();
            loop {
                if let Some(chunk) = work.chunks.pop_front() {
                    break chunk;
                }
                if work.exiting {
                    trace!("Recording worker exiting.");
                    return;
                }
                work.idle = true;
                shared.idle.notify_all();
                shared.wake.wait(&mut work);
            }
        };

        // The worker only ever touches chunks it has dequeued,
        // never the producer's current one.
        chunk.execute_all(&mut manager);
        shared.pool.release(chunk);

        // Mark idle again if the queue drained while replaying;
        // `sync_worker` may be blocked on exactly this state.
        let mut work = shared.work.lock();
        if work.chunks.is_empty() {
            work.idle = true;
            shared.idle.notify_all();
        }
    }
}
