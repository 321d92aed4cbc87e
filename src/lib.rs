//! GPU command-buffer pool and lease manager for console-graphics
//! compatibility layers.
//!
//! Guest software issues drawing commands which must be serialized into a
//! contiguous stream of 32-bit words for an asynchronous GPU backend. This
//! crate owns one large ring region of words carved out of caller-supplied
//! memory, hands out write leases over it, reclaims them as the backend
//! retires buffers, and supports caller-owned "display list" buffers which
//! bypass the pool entirely.
//!
//! # Pool mode
//!
//! The main graphics core always holds one active pool-backed buffer. Guest
//! code reserves space with [`CommandBufferPool::get_command_buffer`] and
//! appends words through the returned [`CommandSpace`]; when a reservation
//! does not fit, the active buffer is padded, queued to the [`Gpu`] backend
//! and replaced with a fresh lease. A full ring blocks the allocating thread
//! until a retirement frees space, which is how GPU backpressure reaches the
//! guest.
//!
//! # Display lists
//!
//! Any core may open a session over its own buffer with
//! [`CommandBufferPool::begin_user_command_buffer`]; writes target that
//! buffer, and running out of room invokes a guest-supplied growth callback
//! instead of the pool. Preformed buffers can also be queued in one shot with
//! [`CommandBufferPool::queue_display_list`].
//!
//! # Examples
//!
//! Basic usage:
//!
//! ```no_run
//! use std::{ptr::NonNull, sync::Arc};
//!
//! use cmd_ring::{
//!     driver::{Gpu, Platform},
//!     CommandBufferPool, PoolInfo, Submission,
//! };
//!
//! struct Backend;
//!
//! impl Gpu for Backend {
//!     fn queue_command_buffer(&self, _cmd_buf: Submission) {
//!         // Hand the submission to the GPU thread.
//!     }
//!
//!     fn retired_timestamp(&self) -> u64 {
//!         0
//!     }
//!
//!     fn wait_for_timestamp(&self, _time: u64) {}
//! }
//!
//! struct SingleCore;
//!
//! impl Platform for SingleCore {
//!     fn core_id(&self) -> u32 {
//!         0
//!     }
//!
//!     fn core_count(&self) -> u32 {
//!         1
//!     }
//! }
//!
//! let mut region = vec![0u32; 0x40000].into_boxed_slice();
//! let base = NonNull::new(region.as_mut_ptr()).unwrap();
//! let pool = unsafe {
//!     CommandBufferPool::new(
//!         PoolInfo::new(base, region.len()),
//!         Arc::new(Backend),
//!         Arc::new(SingleCore),
//!     )
//! };
//!
//! let mut space = pool.get_command_buffer(4);
//! space.write_all(&[0xC001_3D00u32.to_be(), 0, 0, 7]);
//! pool.flush();
//! ```
//!
//! [`Gpu`]: driver::Gpu

pub mod driver;

mod cmd_buf;
mod pool;
mod ring;

pub use self::{
    cmd_buf::{CommandSpace, Submission, PAD_ALIGN_WORDS, PAD_WORD},
    pool::{CommandBufferPool, PoolInfo, PoolInfoBuilder},
    ring::{MAX_LEASE_WORDS, MIN_LEASE_WORDS},
};
