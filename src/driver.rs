//! Contracts between the pool and its host environment.
//!
//! The pool never talks to hardware itself. Completed command buffers are
//! handed to a [`Gpu`] implementation which consumes the word stream
//! asynchronously and reports progress through a monotonically increasing
//! retirement timestamp. Core identity comes from the [`Platform`] shim so
//! that the per-core active-buffer bookkeeping works on any scheduler.

use {crate::Submission, std::ptr::NonNull};

/// The GPU backend that consumes queued command buffers.
///
/// Implementations must consume buffers in the order they were queued and
/// give each one back through
/// [`CommandBufferPool::free_command_buffer`](crate::CommandBufferPool::free_command_buffer)
/// once it retires. Buffers must be returned *before* the matching
/// [`submit_time`](Submission::submit_time) becomes visible through
/// [`retired_timestamp`](Self::retired_timestamp), otherwise a thread woken
/// from [`wait_for_timestamp`](Self::wait_for_timestamp) can observe a pool
/// which still has no room.
pub trait Gpu: Send + Sync {
    /// Enqueues a completed buffer for consumption.
    fn queue_command_buffer(&self, cmd_buf: Submission);

    /// The submit timestamp of the most recently retired buffer, or zero when
    /// nothing has retired yet.
    fn retired_timestamp(&self) -> u64;

    /// Blocks the calling thread until `retired_timestamp()` reaches `time`.
    fn wait_for_timestamp(&self, time: u64);
}

/// The multi-core OS shim.
pub trait Platform: Send + Sync {
    /// The CPU core the calling thread is running on.
    fn core_id(&self) -> u32;

    /// Exclusive upper bound on core ids.
    fn core_count(&self) -> u32;
}

/// Guest-supplied growth callback for user display lists.
///
/// Called as `(old_buffer, used_bytes, needed_bytes)` when a display list
/// runs out of room; returns the replacement buffer and its size in bytes.
/// Returning `None` or a zero size aborts the process.
pub type DisplayListOverrun =
    dyn Fn(NonNull<u32>, usize, usize) -> Option<(NonNull<u32>, usize)> + Send + Sync;
