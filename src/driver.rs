use thiserror::Error;

// The scheduler never interprets these handles; they are raw
// driver object identifiers that only the driver implementation
// knows how to dereference. Non-dispatchable Vulkan handles are
// 64-bit, so `u64` round-trips every handle kind.

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct CommandPoolHandle(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct CommandBufferHandle(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct FenceHandle(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct SemaphoreHandle(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct DescriptorPoolHandle(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct DescriptorSetHandle(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct DescriptorSetLayoutHandle(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct SwapchainHandle(pub u64);

/// Pipeline stages a queue submit blocks on its wait semaphore.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStage {
    /// Only colour-attachment output waits on the semaphore;
    /// earlier stages may start before it signals. The usual
    /// choice for a swapchain-acquire semaphore.
    ColorAttachmentOutput,
    /// Every stage waits on the semaphore.
    AllCommands,
}

/// One queue-submit call. `command_buffers` is ordered: when an
/// init buffer accompanies the draw buffer it comes first, and
/// the driver must keep that order within the single batch.
pub struct SubmitBatch<'a> {
    pub command_buffers: &'a [CommandBufferHandle],
    pub wait_semaphore: Option<(SemaphoreHandle, WaitStage)>,
    pub signal_semaphore: Option<SemaphoreHandle>,
    pub fence: FenceHandle,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("device lost")]
    DeviceLost,
    #[error("descriptor pool exhausted")]
    OutOfPoolMemory,
    #[error("out of memory")]
    OutOfMemory,
    #[error("driver call failed with code {0}")]
    Api(i32),
}

/// Outcome of a present operation. Presents that miss are not
/// fatal: the caller is expected to recreate the swapchain and
/// try again, so the result is carried as a value rather than
/// an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentResult {
    Success,
    Suboptimal,
    OutOfDate,
    DeviceLost,
    Error,
}

impl PresentResult {
    pub fn is_success(self) -> bool {
        matches!(self, PresentResult::Success | PresentResult::Suboptimal)
    }

    // The result is published through an atomic, so it needs a
    // stable integer encoding.
    pub(crate) fn to_raw(self) -> i32 {
        match self {
            PresentResult::Success => 0,
            PresentResult::Suboptimal => 1,
            PresentResult::OutOfDate => 2,
            PresentResult::DeviceLost => 3,
            PresentResult::Error => 4,
        }
    }

    pub(crate) fn from_raw(raw: i32) -> Self {
        match raw {
            0 => PresentResult::Success,
            1 => PresentResult::Suboptimal,
            2 => PresentResult::OutOfDate,
            3 => PresentResult::DeviceLost,
            _ => PresentResult::Error,
        }
    }
}

/// The slice of the graphics driver the scheduler consumes.
///
/// The trait is object safe so the pipeline can hold it as
/// `Arc<dyn GpuDriver>`; implementations are expected to be
/// callable from any of the worker threads at once. Fence waits
/// are unbounded by design; a caller wanting a timeout polls
/// the completed counter instead.
pub trait GpuDriver: Send + Sync {
    fn create_command_pool(&self) -> Result<CommandPoolHandle, DriverError>;
    fn reset_command_pool(&self, pool: CommandPoolHandle) -> Result<(), DriverError>;
    fn destroy_command_pool(&self, pool: CommandPoolHandle);

    fn allocate_command_buffer(
        &self,
        pool: CommandPoolHandle,
    ) -> Result<CommandBufferHandle, DriverError>;
    fn begin_command_buffer(&self, buffer: CommandBufferHandle) -> Result<(), DriverError>;
    fn end_command_buffer(&self, buffer: CommandBufferHandle) -> Result<(), DriverError>;

    fn create_fence(&self) -> Result<FenceHandle, DriverError>;
    fn reset_fence(&self, fence: FenceHandle) -> Result<(), DriverError>;
    /// Block until the fence signals. Unbounded.
    fn wait_for_fence(&self, fence: FenceHandle) -> Result<(), DriverError>;
    fn destroy_fence(&self, fence: FenceHandle);

    fn create_semaphore(&self) -> Result<SemaphoreHandle, DriverError>;
    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    fn create_descriptor_pool(&self, max_sets: u32) -> Result<DescriptorPoolHandle, DriverError>;
    fn reset_descriptor_pool(&self, pool: DescriptorPoolHandle) -> Result<(), DriverError>;
    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle);
    /// Allocate one set from `pool`; exhaustion is reported as
    /// `DriverError::OutOfPoolMemory` so the caller can grow.
    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle, DriverError>;

    fn queue_submit(&self, batch: SubmitBatch<'_>) -> Result<(), DriverError>;
    fn queue_present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait_semaphore: SemaphoreHandle,
    ) -> PresentResult;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use parking_lot::{Condvar, Mutex};

    /// Driver test double. Fences become waitable the moment
    /// the batch carrying them is submitted, present outcomes
    /// can be scripted, and create/destroy calls are counted so
    /// tests can assert that nothing leaks.
    #[derive(Default)]
    pub struct MockDriver {
        next_handle: AtomicU64,
        signalled: Mutex<HashSet<u64>>,
        fence_signal: Condvar,
        pub submits: Mutex<Vec<Vec<u64>>>,
        pub wait_semaphores: Mutex<Vec<Option<u64>>>,
        pub presents: Mutex<Vec<u32>>,
        present_script: Mutex<VecDeque<PresentResult>>,
        pub fail_next_submit: AtomicBool,
        pub fail_next_descriptor_alloc: AtomicBool,
        pub created: AtomicU64,
        pub destroyed: AtomicU64,
        pub descriptor_pools_created: AtomicU64,
    }

    impl MockDriver {
        pub fn new() -> std::sync::Arc<Self> {
            let driver = Self {
                next_handle: AtomicU64::new(1),
                ..Self::default()
            };
            std::sync::Arc::new(driver)
        }

        fn fresh(&self) -> u64 {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.next_handle.fetch_add(1, Ordering::SeqCst)
        }

        pub fn script_present(&self, result: PresentResult) {
            self.present_script.lock().push_back(result);
        }

        pub fn leaked(&self) -> i64 {
            self.created.load(Ordering::SeqCst) as i64 - self.destroyed.load(Ordering::SeqCst) as i64
        }
    }

    impl GpuDriver for MockDriver {
        fn create_command_pool(&self) -> Result<CommandPoolHandle, DriverError> {
            Ok(CommandPoolHandle(self.fresh()))
        }

        fn reset_command_pool(&self, _pool: CommandPoolHandle) -> Result<(), DriverError> {
            Ok(())
        }

        fn destroy_command_pool(&self, _pool: CommandPoolHandle) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }

        fn allocate_command_buffer(
            &self,
            _pool: CommandPoolHandle,
        ) -> Result<CommandBufferHandle, DriverError> {
            // Buffers die with their pool, so they are not part
            // of the leak accounting.
            Ok(CommandBufferHandle(
                self.next_handle.fetch_add(1, Ordering::SeqCst),
            ))
        }

        fn begin_command_buffer(&self, _buffer: CommandBufferHandle) -> Result<(), DriverError> {
            Ok(())
        }

        fn end_command_buffer(&self, _buffer: CommandBufferHandle) -> Result<(), DriverError> {
            Ok(())
        }

        fn create_fence(&self) -> Result<FenceHandle, DriverError> {
            Ok(FenceHandle(self.fresh()))
        }

        fn reset_fence(&self, fence: FenceHandle) -> Result<(), DriverError> {
            self.signalled.lock().remove(&fence.0);
            Ok(())
        }

        fn wait_for_fence(&self, fence: FenceHandle) -> Result<(), DriverError> {
            let mut signalled = self.signalled.lock();
            while !signalled.contains(&fence.0) {
                self.fence_signal.wait(&mut signalled);
            }
            Ok(())
        }

        fn destroy_fence(&self, _fence: FenceHandle) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }

        fn create_semaphore(&self) -> Result<SemaphoreHandle, DriverError> {
            Ok(SemaphoreHandle(self.fresh()))
        }

        fn destroy_semaphore(&self, _semaphore: SemaphoreHandle) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }

        fn create_descriptor_pool(
            &self,
            _max_sets: u32,
        ) -> Result<DescriptorPoolHandle, DriverError> {
            self.descriptor_pools_created.fetch_add(1, Ordering::SeqCst);
            Ok(DescriptorPoolHandle(self.fresh()))
        }

        fn reset_descriptor_pool(&self, _pool: DescriptorPoolHandle) -> Result<(), DriverError> {
            Ok(())
        }

        fn destroy_descriptor_pool(&self, _pool: DescriptorPoolHandle) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }

        fn allocate_descriptor_set(
            &self,
            _pool: DescriptorPoolHandle,
            _layout: DescriptorSetLayoutHandle,
        ) -> Result<DescriptorSetHandle, DriverError> {
            if self.fail_next_descriptor_alloc.swap(false, Ordering::SeqCst) {
                return Err(DriverError::OutOfPoolMemory);
            }
            Ok(DescriptorSetHandle(
                self.next_handle.fetch_add(1, Ordering::SeqCst),
            ))
        }

        fn queue_submit(&self, batch: SubmitBatch<'_>) -> Result<(), DriverError> {
            if self.fail_next_submit.swap(false, Ordering::SeqCst) {
                return Err(DriverError::DeviceLost);
            }

            self.submits
                .lock()
                .push(batch.command_buffers.iter().map(|b| b.0).collect());
            self.wait_semaphores
                .lock()
                .push(batch.wait_semaphore.map(|(semaphore, _)| semaphore.0));

            self.signalled.lock().insert(batch.fence.0);
            self.fence_signal.notify_all();
            Ok(())
        }

        fn queue_present(
            &self,
            _swapchain: SwapchainHandle,
            image_index: u32,
            _wait_semaphore: SemaphoreHandle,
        ) -> PresentResult {
            self.presents.lock().push(image_index);
            self.present_script
                .lock()
                .pop_front()
                .unwrap_or(PresentResult::Success)
        }
    }
}
