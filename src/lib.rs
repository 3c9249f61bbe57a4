//! Deferred GPU command scheduling.
//!
//! The thread producing GPU work records opaque command
//! closures through a [`Scheduler`]; the closures travel in
//! bump-allocated chunks to a recording worker that replays
//! them against a [`CommandBufferManager`], which in turn feeds
//! finished command buffers (and optional swapchain presents)
//! to a submission worker and watches their fences on a fence
//! worker. Monotonic fence generations let the producer
//! synchronize with GPU completion without ever blocking inside
//! `record` itself.
//!
//! The scheduler is a transport: commands are replayed verbatim
//! in recording order, across chunk and submit boundaries, and
//! never re-ordered or coalesced. The graphics driver is
//! consumed through the [`GpuDriver`] seam; [`vulkan`] provides
//! the vulkanalia-backed implementation.

pub mod arena;
pub mod commands;
pub mod driver;
pub mod fence;
pub mod scheduler;
pub mod vulkan;

pub use arena::{ChunkPool, CommandChunk, CHUNK_BYTES, MAX_COMMAND_BYTES};
pub use commands::{
    CommandBufferManager, PresentRequest, DESCRIPTOR_SETS_PER_POOL, NUM_COMMAND_BUFFERS,
    NUM_FRAMES_IN_FLIGHT,
};
pub use driver::{
    CommandBufferHandle, CommandPoolHandle, DescriptorPoolHandle, DescriptorSetHandle,
    DescriptorSetLayoutHandle, DriverError, FenceHandle, GpuDriver, PresentResult,
    SemaphoreHandle, SubmitBatch, SwapchainHandle, WaitStage,
};
pub use fence::FenceCounter;
pub use scheduler::Scheduler;
pub use vulkan::VulkanDriver;
