use std::sync::Arc;

use vulkanalia::{
    prelude::v1_0::*,
    vk::{Handle, KhrSwapchainExtension},
};
use log::info;

use crate::driver::{
    CommandBufferHandle, CommandPoolHandle, DescriptorPoolHandle, DescriptorSetHandle,
    DescriptorSetLayoutHandle, DriverError, FenceHandle, GpuDriver, PresentResult,
    SemaphoreHandle, SubmitBatch, SwapchainHandle, WaitStage,
};

/// Vulkan implementation of the driver seam. Handles crossing
/// the seam are raw Vulkan handles, converted back and forth
/// with `vk::Handle::{as_raw, from_raw}`; dispatchable command
/// buffer handles are pointer-sized and round-trip through the
/// same 64 bits.
pub struct VulkanDriver {
    device: Device,
    queue: vk::Queue,
    queue_family: u32,
}

impl VulkanDriver {
    /// # Safety
    ///
    /// `device` must be a live logical device, `queue` a queue
    /// of `queue_family` on that device, and both must outlive
    /// every scheduler handle created from this driver.
    pub unsafe fn new(device: Device, queue: vk::Queue, queue_family: u32) -> Arc<Self> {
        info!("Vulkan driver ready (queue family {queue_family}).");
        Arc::new(Self {
            device,
            queue,
            queue_family,
        })
    }
}

fn map_error(code: vk::ErrorCode) -> DriverError {
    match code {
        vk::ErrorCode::DEVICE_LOST => DriverError::DeviceLost,
        vk::ErrorCode::OUT_OF_POOL_MEMORY | vk::ErrorCode::FRAGMENTED_POOL => {
            DriverError::OutOfPoolMemory
        }
        vk::ErrorCode::OUT_OF_HOST_MEMORY | vk::ErrorCode::OUT_OF_DEVICE_MEMORY => {
            DriverError::OutOfMemory
        }
        code => DriverError::Api(code.as_raw()),
    }
}

fn wait_stage_flags(stage: WaitStage) -> vk::PipelineStageFlags {
    match stage {
        WaitStage::ColorAttachmentOutput => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        WaitStage::AllCommands => vk::PipelineStageFlags::ALL_COMMANDS,
    }
}

impl GpuDriver for VulkanDriver {
    fn create_command_pool(&self) -> Result<CommandPoolHandle, DriverError> {
        // The pool is reset wholesale between uses of its slot,
        // which is cheaper than resetting buffers one by one.
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(self.queue_family);

        let pool = unsafe { self.device.create_command_pool(&info, None) }.map_err(map_error)?;
        Ok(CommandPoolHandle(pool.as_raw()))
    }

    fn reset_command_pool(&self, pool: CommandPoolHandle) -> Result<(), DriverError> {
        unsafe {
            self.device.reset_command_pool(
                vk::CommandPool::from_raw(pool.0),
                vk::CommandPoolResetFlags::empty(),
            )
        }
        .map_err(map_error)
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        unsafe {
            self.device
                .destroy_command_pool(vk::CommandPool::from_raw(pool.0), None);
        }
    }

    fn allocate_command_buffer(
        &self,
        pool: CommandPoolHandle,
    ) -> Result<CommandBufferHandle, DriverError> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(vk::CommandPool::from_raw(pool.0))
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&info) }.map_err(map_error)?;
        Ok(CommandBufferHandle(buffers[0].as_raw() as u64))
    }

    fn begin_command_buffer(&self, buffer: CommandBufferHandle) -> Result<(), DriverError> {
        // Every buffer in the ring is re-recorded after each
        // submit, so they are all one-time-submit.
        let info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .begin_command_buffer(vk::CommandBuffer::from_raw(buffer.0 as _), &info)
        }
        .map_err(map_error)
    }

    fn end_command_buffer(&self, buffer: CommandBufferHandle) -> Result<(), DriverError> {
        unsafe {
            self.device
                .end_command_buffer(vk::CommandBuffer::from_raw(buffer.0 as _))
        }
        .map_err(map_error)
    }

    fn create_fence(&self) -> Result<FenceHandle, DriverError> {
        // Unsignalled: the fence is only waited on after the
        // submit that will signal it.
        let info = vk::FenceCreateInfo::builder();
        let fence = unsafe { self.device.create_fence(&info, None) }.map_err(map_error)?;
        Ok(FenceHandle(fence.as_raw()))
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<(), DriverError> {
        unsafe { self.device.reset_fences(&[vk::Fence::from_raw(fence.0)]) }.map_err(map_error)
    }

    fn wait_for_fence(&self, fence: FenceHandle) -> Result<(), DriverError> {
        // With an unbounded timeout the only success code is
        // SUCCESS; the value is discarded either way.
        unsafe {
            self.device
                .wait_for_fences(&[vk::Fence::from_raw(fence.0)], true, u64::MAX)
        }
        .map(|_| ())
        .map_err(map_error)
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        unsafe {
            self.device.destroy_fence(vk::Fence::from_raw(fence.0), None);
        }
    }

    fn create_semaphore(&self) -> Result<SemaphoreHandle, DriverError> {
        let info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { self.device.create_semaphore(&info, None) }.map_err(map_error)?;
        Ok(SemaphoreHandle(semaphore.as_raw()))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        unsafe {
            self.device
                .destroy_semaphore(vk::Semaphore::from_raw(semaphore.0), None);
        }
    }

    fn create_descriptor_pool(&self, max_sets: u32) -> Result<DescriptorPoolHandle, DriverError> {
        let sizes = [
            vk::DescriptorPoolSize::builder()
                .type_(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(max_sets)
                .build(),
            vk::DescriptorPoolSize::builder()
                .type_(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(max_sets)
                .build(),
            vk::DescriptorPoolSize::builder()
                .type_(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(max_sets)
                .build(),
        ];

        let info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(&sizes);

        let pool = unsafe { self.device.create_descriptor_pool(&info, None) }.map_err(map_error)?;
        Ok(DescriptorPoolHandle(pool.as_raw()))
    }

    fn reset_descriptor_pool(&self, pool: DescriptorPoolHandle) -> Result<(), DriverError> {
        unsafe {
            self.device.reset_descriptor_pool(
                vk::DescriptorPool::from_raw(pool.0),
                vk::DescriptorPoolResetFlags::empty(),
            )
        }
        .map_err(map_error)
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        unsafe {
            self.device
                .destroy_descriptor_pool(vk::DescriptorPool::from_raw(pool.0), None);
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle, DriverError> {
        let layouts = [vk::DescriptorSetLayout::from_raw(layout.0)];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(vk::DescriptorPool::from_raw(pool.0))
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }.map_err(map_error)?;
        Ok(DescriptorSetHandle(sets[0].as_raw()))
    }

    fn queue_submit(&self, batch: SubmitBatch<'_>) -> Result<(), DriverError> {
        let command_buffers = batch
            .command_buffers
            .iter()
            .map(|buffer| vk::CommandBuffer::from_raw(buffer.0 as _))
            .collect::<Vec<_>>();

        let mut info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        let wait_semaphores;
        let wait_stages;
        if let Some((semaphore, stage)) = batch.wait_semaphore {
            wait_semaphores = [vk::Semaphore::from_raw(semaphore.0)];
            wait_stages = [wait_stage_flags(stage)];
            info = info
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages);
        }

        let signal_semaphores;
        if let Some(semaphore) = batch.signal_semaphore {
            signal_semaphores = [vk::Semaphore::from_raw(semaphore.0)];
            info = info.signal_semaphores(&signal_semaphores);
        }

        unsafe {
            self.device
                .queue_submit(self.queue, &[info], vk::Fence::from_raw(batch.fence.0))
        }
        .map_err(map_error)
    }

    fn queue_present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait_semaphore: SemaphoreHandle,
    ) -> PresentResult {
        let wait_semaphores = [vk::Semaphore::from_raw(wait_semaphore.0)];
        let swapchains = [vk::SwapchainKHR::from_raw(swapchain.0)];
        let image_indices = [image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // An out-of-date or suboptimal swapchain is an ordinary
        // outcome here; the renderer reacts to it through the
        // scheduler's present-status polls.
        match unsafe { self.device.queue_present_khr(self.queue, &info) } {
            Ok(vk::SuccessCode::SUBOPTIMAL_KHR) => PresentResult::Suboptimal,
            Ok(_) => PresentResult::Success,
            Err(vk::ErrorCode::OUT_OF_DATE_KHR) => PresentResult::OutOfDate,
            Err(vk::ErrorCode::DEVICE_LOST) => PresentResult::DeviceLost,
            Err(_) => PresentResult::Error,
        }
    }
}
