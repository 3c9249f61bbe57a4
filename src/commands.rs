use std::{
    collections::VecDeque,
    mem,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use anyhow::Result;
use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::{
    driver::{
        CommandBufferHandle, CommandPoolHandle, DescriptorPoolHandle, DescriptorSetHandle,
        DescriptorSetLayoutHandle, DriverError, FenceHandle, GpuDriver, PresentResult,
        SemaphoreHandle, SubmitBatch, SwapchainHandle, WaitStage,
    },
    fence::FenceCounter,
};

/// Number of flight slots in the command buffer ring. Exactly
/// one slot is being recorded into at any time; the rest are
/// somewhere between submitted and retired.
pub const NUM_COMMAND_BUFFERS: usize = 8;

/// Number of frame slots. Descriptor pools live per frame, not
/// per flight slot, so several consecutive submits share them.
pub const NUM_FRAMES_IN_FLIGHT: usize = 2;

/// Flight slots owned by each frame slot.
pub const BUFFERS_PER_FRAME: usize = NUM_COMMAND_BUFFERS / NUM_FRAMES_IN_FLIGHT;

/// Sets granted by one descriptor pool; the pool list grows in
/// units of this when a frame runs dry.
pub const DESCRIPTOR_SETS_PER_POOL: u32 = 1024;

const _: () = assert!(NUM_COMMAND_BUFFERS % NUM_FRAMES_IN_FLIGHT == 0);

/// A swapchain present to perform right after a queue submit.
#[derive(Clone, Copy, Debug)]
pub struct PresentRequest {
    pub swapchain: SwapchainHandle,
    pub image_index: u32,
}

type CleanupFn = Box<dyn FnOnce(&Arc<dyn GpuDriver>) + Send>;

// One entry in the command buffer ring. The driver handles are
// immutable after creation, so the submission and fence workers
// read them without locking; only the per-use state (stamped
// generation, wait semaphore, cleanup list) needs interior
// mutability.
struct FlightSlot {
    pool: CommandPoolHandle,
    init_buffer: CommandBufferHandle,
    draw_buffer: CommandBufferHandle,
    fence: FenceHandle,
    present_semaphore: SemaphoreHandle,
    /// Generation this slot was last submitted under; zero
    /// means the slot has never been submitted.
    fence_counter: AtomicU64,
    wait_semaphore: Mutex<Option<(SemaphoreHandle, WaitStage)>>,
    cleanup_resources: Mutex<Vec<CleanupFn>>,
}

/// Descriptor pools for one frame in flight, reset wholesale
/// when the frame slot is reused.
struct FrameResources {
    descriptor_pools: Vec<DescriptorPoolHandle>,
    current_pool: usize,
}

struct PendingSubmit {
    cmd_buffer_index: usize,
    use_init_buffer: bool,
    wait_semaphore: Option<(SemaphoreHandle, WaitStage)>,
    present: Option<PresentRequest>,
}

struct PendingFence {
    fence: FenceHandle,
    counter: u64,
}

struct SubmitQueue {
    pending: VecDeque<PendingSubmit>,
    idle: bool,
    exiting: bool,
}

struct FenceQueue {
    pending: VecDeque<PendingFence>,
    exiting: bool,
}

// State shared between the recording thread (which owns the
// CommandBufferManager), the submission worker and the fence
// worker. Each condition variable is paired with exactly one
// mutex and one predicate.
pub(crate) struct Pipeline {
    driver: Arc<dyn GpuDriver>,
    slots: Vec<FlightSlot>,
    fence: FenceCounter,
    submit_queue: Mutex<SubmitQueue>,
    submit_wake: Condvar,
    submit_idle: Condvar,
    fence_queue: Mutex<FenceQueue>,
    fence_wake: Condvar,
    last_present_result: AtomicI32,
    last_present_done: AtomicBool,
    last_present_failed: AtomicBool,
    device_lost: AtomicBool,
}

impl Pipeline {
    pub(crate) fn fence(&self) -> &FenceCounter {
        &self.fence
    }

    /// Block until the submission queue is empty and the worker
    /// has returned from its in-flight submit.
    pub(crate) fn wait_submission_idle(&self) {
        let mut queue = self.submit_queue.lock();
        while !(queue.pending.is_empty() && queue.idle) {
            self.submit_idle.wait(&mut queue);
        }
    }

    pub(crate) fn check_last_present_failed(&self) -> bool {
        self.last_present_failed.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn check_last_present_done(&self) -> bool {
        self.last_present_done.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn last_present_result(&self) -> PresentResult {
        PresentResult::from_raw(self.last_present_result.load(Ordering::Acquire))
    }

    pub(crate) fn check_device_lost(&self) -> bool {
        self.device_lost.swap(false, Ordering::AcqRel)
    }

    fn note_failure(&self, what: &str, result: Result<(), DriverError>) {
        if let Err(err) = result {
            error!("{what} failed: {err}");
            self.device_lost.store(true, Ordering::Release);
        }
    }

    /// Execute and clear the slot's deferred-destruction list.
    /// Thunks are taken under the lock, so whichever thread gets
    /// here first runs them and later callers see an empty list.
    fn run_cleanup(&self, index: usize) {
        let thunks: Vec<CleanupFn> = mem::take(&mut *self.slots[index].cleanup_resources.lock());
        for thunk in thunks {
            thunk(&self.driver);
        }
    }

    /// Retire every slot whose stamped generation is covered by
    /// `counter`, then publish the new completed generation and
    /// wake producer-side waiters. Cleanup runs first so a
    /// woken producer can never record into a slot whose
    /// callbacks are still pending.
    fn retire(&self, counter: u64) {
        for index in 0..self.slots.len() {
            let stamped = self.slots[index].fence_counter.load(Ordering::Acquire);
            if stamped != 0 && stamped <= counter {
                self.run_cleanup(index);
            }
        }

        self.fence.advance_completed(counter);
    }

    /// The actual queue submit + present, called either inline
    /// on the recording thread or from the submission worker.
    fn perform_submit(&self, request: PendingSubmit) {
        let slot = &self.slots[request.cmd_buffer_index];
        let counter = slot.fence_counter.load(Ordering::Acquire);

        // Init buffer first, draw buffer second, in one batch:
        // the driver executes them in array order.
        let buffers = [slot.init_buffer, slot.draw_buffer];
        let command_buffers: &[CommandBufferHandle] = if request.use_init_buffer {
            &buffers
        } else {
            &buffers[1..]
        };

        let batch = SubmitBatch {
            command_buffers,
            wait_semaphore: request.wait_semaphore,
            signal_semaphore: request.present.map(|_| slot.present_semaphore),
            fence: slot.fence,
        };

        if let Err(err) = self.driver.queue_submit(batch) {
            // The device is assumed lost. The slot's fence will
            // never signal now, so retire its generation here or
            // every later wait would block forever.
            error!("Queue submit failed: {err}");
            self.device_lost.store(true, Ordering::Release);
            self.retire(counter);
            return;
        }

        if let Some(present) = request.present {
            let result = self.driver.queue_present(
                present.swapchain,
                present.image_index,
                slot.present_semaphore,
            );

            self.last_present_result
                .store(result.to_raw(), Ordering::Release);
            self.last_present_done.store(true, Ordering::Release);
            if !result.is_success() {
                warn!("Present failed: {result:?}");
                self.last_present_failed.store(true, Ordering::Release);
            }
        }

        // Hand the fence to the fence worker, which advances the
        // completed counter once the GPU passes it.
        let mut queue = self.fence_queue.lock();
        queue.pending.push_back(PendingFence {
            fence: slot.fence,
            counter,
        });
        self.fence_wake.notify_one();
    }
}

/// Owner of the command buffer ring. Lives on the recording
/// worker thread; command closures receive it mutably and drive
/// everything through it.
pub struct CommandBufferManager {
    pipeline: Arc<Pipeline>,
    frames: Vec<FrameResources>,
    current_cmd_buffer: usize,
    current_frame: usize,
    init_buffer_used: bool,
    submit_worker: Option<JoinHandle<()>>,
    fence_worker: Option<JoinHandle<()>>,
}

impl CommandBufferManager {
    pub fn new(driver: Arc<dyn GpuDriver>) -> Result<Self> {
        let mut slots = Vec::with_capacity(NUM_COMMAND_BUFFERS);
        for _ in 0..NUM_COMMAND_BUFFERS {
            let pool = driver.create_command_pool()?;
            slots.push(FlightSlot {
                pool,
                init_buffer: driver.allocate_command_buffer(pool)?,
                draw_buffer: driver.allocate_command_buffer(pool)?,
                fence: driver.create_fence()?,
                present_semaphore: driver.create_semaphore()?,
                fence_counter: AtomicU64::new(0),
                wait_semaphore: Mutex::new(None),
                cleanup_resources: Mutex::new(Vec::new()),
            });
        }

        let mut frames = Vec::with_capacity(NUM_FRAMES_IN_FLIGHT);
        for _ in 0..NUM_FRAMES_IN_FLIGHT {
            frames.push(FrameResources {
                descriptor_pools: vec![driver.create_descriptor_pool(DESCRIPTOR_SETS_PER_POOL)?],
                current_pool: 0,
            });
        }

        // The first slot starts recording immediately.
        driver.begin_command_buffer(slots[0].draw_buffer)?;

        let pipeline = Arc::new(Pipeline {
            driver,
            slots,
            fence: FenceCounter::new(),
            submit_queue: Mutex::new(SubmitQueue {
                pending: VecDeque::new(),
                idle: true,
                exiting: false,
            }),
            submit_wake: Condvar::new(),
            submit_idle: Condvar::new(),
            fence_queue: Mutex::new(FenceQueue {
                pending: VecDeque::new(),
                exiting: false,
            }),
            fence_wake: Condvar::new(),
            last_present_result: AtomicI32::new(PresentResult::Success.to_raw()),
            last_present_done: AtomicBool::new(false),
            last_present_failed: AtomicBool::new(false),
            device_lost: AtomicBool::new(false),
        });

        let submit_worker = {
            let pipeline = pipeline.clone();
            thread::Builder::new()
                .name("prospero-submit".into())
                .spawn(move || submission_worker_loop(pipeline))?
        };
        let fence_worker = {
            let pipeline = pipeline.clone();
            thread::Builder::new()
                .name("prospero-fence".into())
                .spawn(move || fence_worker_loop(pipeline))?
        };

        debug!(
            "Command buffer ring ready ({NUM_COMMAND_BUFFERS} slots, {NUM_FRAMES_IN_FLIGHT} frames in flight)."
        );

        Ok(Self {
            pipeline,
            frames,
            current_cmd_buffer: 0,
            current_frame: 0,
            init_buffer_used: false,
            submit_worker: Some(submit_worker),
            fence_worker: Some(fence_worker),
        })
    }

    pub(crate) fn pipeline(&self) -> Arc<Pipeline> {
        self.pipeline.clone()
    }

    pub fn driver(&self) -> &Arc<dyn GpuDriver> {
        &self.pipeline.driver
    }

    /// The draw command buffer currently open for recording.
    pub fn draw_command_buffer(&self) -> CommandBufferHandle {
        self.pipeline.slots[self.current_cmd_buffer].draw_buffer
    }

    /// The init command buffer for uploads that must land before
    /// this slot's draw commands. Begun lazily on first use per
    /// slot; the submit orders it ahead of the draw buffer.
    pub fn init_command_buffer(&mut self) -> CommandBufferHandle {
        let slot = &self.pipeline.slots[self.current_cmd_buffer];
        if !self.init_buffer_used {
            self.pipeline.note_failure(
                "Begin init command buffer",
                self.pipeline.driver.begin_command_buffer(slot.init_buffer),
            );
            self.init_buffer_used = true;
        }
        slot.init_buffer
    }

    /// Stamp the current slot with the semaphore its submit must
    /// wait on, typically handed out by swapchain acquisition.
    pub fn set_wait_semaphore(&mut self, semaphore: SemaphoreHandle, stage: WaitStage) {
        *self.pipeline.slots[self.current_cmd_buffer]
            .wait_semaphore
            .lock() = Some((semaphore, stage));
    }

    /// Append a destruction thunk to the current slot. It runs
    /// once the GPU has passed the generation this slot is next
    /// submitted under, and before the slot is recorded into
    /// again.
    pub fn defer_destruction<F>(&mut self, thunk: F)
    where
        F: FnOnce(&Arc<dyn GpuDriver>) + Send + 'static,
    {
        self.pipeline.slots[self.current_cmd_buffer]
            .cleanup_resources
            .lock()
            .push(Box::new(thunk));
    }

    pub fn defer_semaphore_destruction(&mut self, semaphore: SemaphoreHandle) {
        self.defer_destruction(move |driver| driver.destroy_semaphore(semaphore));
    }

    pub fn defer_descriptor_pool_destruction(&mut self, pool: DescriptorPoolHandle) {
        self.defer_destruction(move |driver| driver.destroy_descriptor_pool(pool));
    }

    /// Allocate a descriptor set from the current frame's pools,
    /// growing the pool list when the driver reports exhaustion.
    pub fn allocate_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle, DriverError> {
        let driver = self.pipeline.driver.clone();
        let frame = &mut self.frames[self.current_frame];
        let mut grew = false;

        loop {
            let pool = frame.descriptor_pools[frame.current_pool];
            match driver.allocate_descriptor_set(pool, layout) {
                Ok(set) => return Ok(set),
                Err(DriverError::OutOfPoolMemory) if !grew => {
                    if frame.current_pool + 1 < frame.descriptor_pools.len() {
                        frame.current_pool += 1;
                    } else {
                        debug!("Descriptor pools exhausted, growing the frame's pool list.");
                        let pool = driver.create_descriptor_pool(DESCRIPTOR_SETS_PER_POOL)?;
                        frame.descriptor_pools.push(pool);
                        frame.current_pool = frame.descriptor_pools.len() - 1;
                        grew = true;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Close the current slot and hand it to the submission
    /// pipeline under generation `counter`, then rotate the ring
    /// and prepare the next slot for recording.
    ///
    /// Invoked on the recording worker by the closure that
    /// `Scheduler::submit` records. Internal driver failures are
    /// logged and flagged; they never propagate across the
    /// worker boundary.
    pub fn submit(
        &mut self,
        counter: u64,
        on_worker_thread: bool,
        wait_for_completion: bool,
        present: Option<PresentRequest>,
    ) {
        let pipeline = self.pipeline.clone();
        let slot = &pipeline.slots[self.current_cmd_buffer];

        // End recording on everything this slot has open.
        if self.init_buffer_used {
            pipeline.note_failure(
                "End init command buffer",
                pipeline.driver.end_command_buffer(slot.init_buffer),
            );
        }
        pipeline.note_failure(
            "End draw command buffer",
            pipeline.driver.end_command_buffer(slot.draw_buffer),
        );

        // Stamp the generation before the request becomes
        // visible to the workers; they read it back through the
        // slot.
        slot.fence_counter.store(counter, Ordering::Release);

        let request = PendingSubmit {
            cmd_buffer_index: self.current_cmd_buffer,
            use_init_buffer: self.init_buffer_used,
            wait_semaphore: slot.wait_semaphore.lock().take(),
            present,
        };

        if on_worker_thread {
            {
                let mut queue = pipeline.submit_queue.lock();
                queue.pending.push_back(request);
                queue.idle = false;
                pipeline.submit_wake.notify_one();
            }
            if wait_for_completion {
                pipeline.wait_submission_idle();
            }
        } else {
            pipeline.perform_submit(request);
        }

        // Rotate the ring; crossing a frame boundary moves the
        // descriptor-pool frame along with it.
        self.init_buffer_used = false;
        self.current_cmd_buffer = (self.current_cmd_buffer + 1) % NUM_COMMAND_BUFFERS;
        let crossed_frame = self.current_cmd_buffer % BUFFERS_PER_FRAME == 0;
        if crossed_frame {
            self.current_frame = (self.current_frame + 1) % NUM_FRAMES_IN_FLIGHT;
        }

        self.prepare_slot(self.current_cmd_buffer, crossed_frame);
    }

    /// Make a slot recordable again: wait out its previous
    /// generation, run whatever cleanup is still queued on it,
    /// reset its fence and pool, and open its draw buffer.
    fn prepare_slot(&mut self, index: usize, reset_frame: bool) {
        let pipeline = self.pipeline.clone();
        let slot = &pipeline.slots[index];

        let stamped = slot.fence_counter.load(Ordering::Acquire);
        if stamped != 0 {
            pipeline.fence.wait_completed(stamped);
        }

        // Normally drained by the fence worker when the
        // generation retired; taking it again here covers
        // thunks that were queued after retirement.
        pipeline.run_cleanup(index);

        pipeline.note_failure("Reset fence", pipeline.driver.reset_fence(slot.fence));
        pipeline.note_failure(
            "Reset command pool",
            pipeline.driver.reset_command_pool(slot.pool),
        );

        if reset_frame {
            let frame = &mut self.frames[self.current_frame];
            for &pool in &frame.descriptor_pools {
                pipeline.note_failure(
                    "Reset descriptor pool",
                    pipeline.driver.reset_descriptor_pool(pool),
                );
            }
            frame.current_pool = 0;
        }

        pipeline.note_failure(
            "Begin draw command buffer",
            pipeline.driver.begin_command_buffer(slot.draw_buffer),
        );
    }

    fn shutdown_workers(&mut self) {
        if self.submit_worker.is_none() && self.fence_worker.is_none() {
            return;
        }

        // Submission first, since it feeds the fence queue; both
        // workers drain their queues before honouring the flag.
        {
            let mut queue = self.pipeline.submit_queue.lock();
            queue.exiting = true;
            self.pipeline.submit_wake.notify_all();
        }
        if let Some(worker) = self.submit_worker.take() {
            if worker.join().is_err() {
                error!("Submission worker panicked.");
            }
        }

        {
            let mut queue = self.pipeline.fence_queue.lock();
            queue.exiting = true;
            self.pipeline.fence_wake.notify_all();
        }
        if let Some(worker) = self.fence_worker.take() {
            if worker.join().is_err() {
                error!("Fence worker panicked.");
            }
        }

        trace!("Submission and fence workers stopped.");
    }
}

impl Drop for CommandBufferManager {
    fn drop(&mut self) {
        self.shutdown_workers();

        // Outstanding cleanup thunks still own driver resources;
        // release them before tearing the ring down.
        for index in 0..self.pipeline.slots.len() {
            self.pipeline.run_cleanup(index);
        }

        let driver = &self.pipeline.driver;
        for slot in &self.pipeline.slots {
            driver.destroy_semaphore(slot.present_semaphore);
            driver.destroy_fence(slot.fence);
            // Destroying the pool frees its command buffers.
            driver.destroy_command_pool(slot.pool);
        }
        for frame in &self.frames {
            for &pool in &frame.descriptor_pools {
                driver.destroy_descriptor_pool(pool);
            }
        }

        trace!("Command buffer resources destroyed.");
    }
}

fn submission_worker_loop(pipeline: Arc<Pipeline>) {
    trace!("Submission worker started.");
    loop {
        let request = {
            let mut queue = pipeline.submit_queue.lock();
            loop {
                if let Some(request) = queue.pending.pop_front() {
                    break request;
                }
                if queue.exiting {
                    trace!("Submission worker exiting.");
                    return;
                }
                queue.idle = true;
                pipeline.submit_idle.notify_all();
                pipeline.submit_wake.wait(&mut queue);
            }
        };

        pipeline.perform_submit(request);

        // Mark idle again if nothing arrived while the submit
        // was in flight, so synchronizers do not miss the drain.
        let mut queue = pipeline.submit_queue.lock();
        if queue.pending.is_empty() {
            queue.idle = true;
            pipeline.submit_idle.notify_all();
        }
    }
}

fn fence_worker_loop(pipeline: Arc<Pipeline>) {
    trace!("Fence worker started.");
    loop {
        let pending = {
            let mut queue = pipeline.fence_queue.lock();
            loop {
                if let Some(pending) = queue.pending.pop_front() {
                    break pending;
                }
                if queue.exiting {
                    trace!("Fence worker exiting.");
                    return;
                }
                pipeline.fence_wake.wait(&mut queue);
            }
        };

        match pipeline.driver.wait_for_fence(pending.fence) {
            Ok(()) => {}
            Err(err) => {
                // A wait can only fail this way if the device is
                // gone; retire the generation regardless so
                // nothing upstream deadlocks.
                error!("Fence wait failed: {err}");
                pipeline.device_lost.store(true, Ordering::Release);
            }
        }

        pipeline.retire(pending.counter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::MockDriver;
    use std::sync::atomic::AtomicUsize;

    fn init_logging() {
        let _ = pretty_env_logger::try_init();
    }

    #[test]
    fn ring_wraps_without_deadlocking() {
        init_logging();
        let driver = MockDriver::new();
        let mut manager = CommandBufferManager::new(driver.clone()).unwrap();

        for gen in 1..=(2 * NUM_COMMAND_BUFFERS as u64) {
            let counter = manager.pipeline.fence.next();
            assert_eq!(counter, gen);
            manager.submit(counter, false, false, None);
        }

        manager
            .pipeline
            .fence
            .wait_completed(2 * NUM_COMMAND_BUFFERS as u64);
        assert_eq!(driver.submits.lock().len(), 2 * NUM_COMMAND_BUFFERS);
    }

    #[test]
    fn init_buffer_precedes_draw_buffer_in_the_batch() {
        init_logging();
        let driver = MockDriver::new();
        let mut manager = CommandBufferManager::new(driver.clone()).unwrap();

        let init = manager.init_command_buffer();
        let draw = manager.draw_command_buffer();
        let counter = manager.pipeline.fence.next();
        manager.submit(counter, false, false, None);

        let submits = driver.submits.lock();
        assert_eq!(submits.len(), 1);
        assert_eq!(submits[0], vec![init.0, draw.0]);
    }

    #[test]
    fn submit_without_init_buffer_sends_only_the_draw_buffer() {
        init_logging();
        let driver = MockDriver::new();
        let mut manager = CommandBufferManager::new(driver.clone()).unwrap();

        let draw = manager.draw_command_buffer();
        let counter = manager.pipeline.fence.next();
        manager.submit(counter, false, false, None);

        let submits = driver.submits.lock();
        assert_eq!(submits[0], vec![draw.0]);
    }

    #[test]
    fn cleanup_runs_once_after_the_generation_retires() {
        init_logging();
        let driver = MockDriver::new();
        let mut manager = CommandBufferManager::new(driver).unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        {
            let runs = runs.clone();
            manager.defer_destruction(move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }

        let counter = manager.pipeline.fence.next();
        manager.submit(counter, false, false, None);
        manager.pipeline.fence.wait_completed(counter);

        // Cycle the whole ring so the original slot is prepared
        // for reuse; the thunk must not run a second time.
        for _ in 0..NUM_COMMAND_BUFFERS {
            let counter = manager.pipeline.fence.next();
            manager.submit(counter, false, false, None);
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn worker_submission_path_drains_on_idle_wait() {
        init_logging();
        let driver = MockDriver::new();
        let mut manager = CommandBufferManager::new(driver.clone()).unwrap();

        let counter = manager.pipeline.fence.next();
        manager.submit(counter, true, true, None);

        assert_eq!(driver.submits.lock().len(), 1);
        manager.pipeline.fence.wait_completed(counter);
    }

    #[test]
    fn descriptor_allocation_grows_past_an_exhausted_pool() {
        init_logging();
        let driver = MockDriver::new();
        let mut manager = CommandBufferManager::new(driver.clone()).unwrap();

        let before = driver.descriptor_pools_created.load(Ordering::SeqCst);
        driver.fail_next_descriptor_alloc.store(true, Ordering::SeqCst);

        let set = manager
            .allocate_descriptor_set(DescriptorSetLayoutHandle(1))
            .unwrap();
        assert_ne!(set, DescriptorSetHandle(0));
        assert_eq!(
            driver.descriptor_pools_created.load(Ordering::SeqCst),
            before + 1
        );
    }

    #[test]
    fn failed_submit_flags_device_loss_and_stays_live() {
        init_logging();
        let driver = MockDriver::new();
        let mut manager = CommandBufferManager::new(driver.clone()).unwrap();

        driver.fail_next_submit.store(true, Ordering::SeqCst);
        let counter = manager.pipeline.fence.next();
        manager.submit(counter, false, false, None);

        // The generation still retires so nothing waits forever.
        manager.pipeline.fence.wait_completed(counter);
        assert!(manager.pipeline.check_device_lost());
        assert!(!manager.pipeline.check_device_lost());

        // And the ring still accepts further submits.
        let counter = manager.pipeline.fence.next();
        manager.submit(counter, false, false, None);
        manager.pipeline.fence.wait_completed(counter);
    }

    #[test]
    fn teardown_destroys_every_created_object() {
        init_logging();
        let driver = MockDriver::new();
        let manager = CommandBufferManager::new(driver.clone()).unwrap();
        drop(manager);
        assert_eq!(driver.leaked(), 0);
    }
}
