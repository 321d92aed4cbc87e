//! Command buffer descriptors and the descriptor free-list.

use {
    log::trace,
    std::{
        fmt::{Debug, Formatter},
        ptr::{self, NonNull},
        slice,
        sync::atomic::{AtomicPtr, Ordering},
    },
};

/// Filler word appended when a command buffer is padded, written in device
/// byte order.
pub const PAD_WORD: u32 = 0xBEEF_2929;

/// Command buffers are padded to a multiple of this many words (32 bytes)
/// before they are queued.
pub const PAD_ALIGN_WORDS: usize = 8;

/// Descriptor for one command buffer.
///
/// The descriptor is metadata only; `buf` points either into the pool's ring
/// region or at caller-owned display-list storage. A descriptor lives in
/// exactly one of three places at any time: the free-list, a core's
/// active-buffer slot, or in flight with the GPU.
pub(crate) struct CommandBuffer {
    pub buf: *mut u32,

    /// Words written so far.
    pub cur_size: usize,

    /// Words reserved.
    pub max_size: usize,

    pub display_list: bool,

    /// Timestamp assigned when the buffer was queued; zero before that.
    pub submit_time: u64,

    /// Free-list link.
    next: AtomicPtr<CommandBuffer>,
}

impl CommandBuffer {
    fn new() -> Self {
        Self {
            buf: ptr::null_mut(),
            cur_size: 0,
            max_size: 0,
            display_list: false,
            submit_time: 0,
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Repopulates a recycled descriptor.
    pub fn reset(&mut self, buf: *mut u32, cur_size: usize, max_size: usize, display_list: bool) {
        self.buf = buf;
        self.cur_size = cur_size;
        self.max_size = max_size;
        self.display_list = display_list;
        self.submit_time = 0;
    }

    pub fn remaining(&self) -> usize {
        self.max_size - self.cur_size
    }

    pub fn write(&mut self, word: u32) {
        assert!(self.cur_size < self.max_size, "command buffer overrun");

        unsafe { self.buf.add(self.cur_size).write(word) };
        self.cur_size += 1;
    }

    /// Fills up to the next [`PAD_ALIGN_WORDS`] boundary with [`PAD_WORD`].
    pub fn pad(&mut self) {
        let aligned = self.cur_size.next_multiple_of(PAD_ALIGN_WORDS);

        assert!(aligned <= self.max_size, "no room to pad the command buffer");

        while self.cur_size < aligned {
            self.write(PAD_WORD.to_be());
        }
    }

    pub fn words(&self) -> &[u32] {
        unsafe { slice::from_raw_parts(self.buf, self.cur_size) }
    }
}

/// Lock-free LIFO of reusable command buffer descriptors.
///
/// Descriptors are created on demand and only ever returned to the list,
/// never destroyed, while the list is alive; the pop CAS cannot observe a
/// recycled node address, so the plain Treiber scheme is sufficient.
pub(crate) struct DescriptorList {
    head: AtomicPtr<CommandBuffer>,
}

impl DescriptorList {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pops a descriptor, creating a fresh one when the list is empty.
    pub fn acquire(&self) -> NonNull<CommandBuffer> {
        let mut head = self.head.load(Ordering::Acquire);

        loop {
            let Some(cmd_buf) = NonNull::new(head) else {
                trace!("allocating a fresh command buffer descriptor");

                return NonNull::from(Box::leak(Box::new(CommandBuffer::new())));
            };
            let next = unsafe { (*cmd_buf.as_ptr()).next.load(Ordering::Relaxed) };

            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return cmd_buf,
                Err(current) => head = current,
            }
        }
    }

    /// Pushes a descriptor back for reuse.
    pub fn release(&self, cmd_buf: NonNull<CommandBuffer>) {
        let mut head = self.head.load(Ordering::Relaxed);

        loop {
            unsafe { (*cmd_buf.as_ptr()).next.store(head, Ordering::Relaxed) };

            match self.head.compare_exchange_weak(
                head,
                cmd_buf.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }
}

impl Drop for DescriptorList {
    fn drop(&mut self) {
        let mut head = *self.head.get_mut();

        while let Some(cmd_buf) = NonNull::new(head) {
            head = *unsafe { &mut *cmd_buf.as_ptr() }.next.get_mut();

            drop(unsafe { Box::from_raw(cmd_buf.as_ptr()) });
        }
    }
}

/// Ownership token for a command buffer that is in flight with the GPU.
///
/// Created when the pool queues a buffer; the backend gives it back through
/// [`CommandBufferPool::free_command_buffer`](crate::CommandBufferPool::free_command_buffer)
/// once the words have been consumed.
pub struct Submission {
    cmd_buf: NonNull<CommandBuffer>,
}

// The descriptor is owned exclusively by whoever holds the token.
unsafe impl Send for Submission {}

impl Submission {
    pub(crate) fn new(cmd_buf: NonNull<CommandBuffer>) -> Self {
        Self { cmd_buf }
    }

    pub(crate) fn into_inner(self) -> NonNull<CommandBuffer> {
        self.cmd_buf
    }

    /// The queued command words.
    pub fn words(&self) -> &[u32] {
        unsafe { self.cmd_buf.as_ref() }.words()
    }

    /// The timestamp assigned when this buffer was queued.
    pub fn submit_time(&self) -> u64 {
        unsafe { self.cmd_buf.as_ref() }.submit_time
    }

    /// Whether the buffer is caller-owned display-list storage rather than a
    /// pool lease.
    pub fn is_display_list(&self) -> bool {
        unsafe { self.cmd_buf.as_ref() }.display_list
    }
}

impl Debug for Submission {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let cmd_buf = unsafe { self.cmd_buf.as_ref() };

        f.debug_struct("Submission")
            .field("words", &cmd_buf.cur_size)
            .field("submit_time", &cmd_buf.submit_time)
            .field("display_list", &cmd_buf.display_list)
            .finish()
    }
}

/// Write access to the current core's active command buffer.
///
/// Obtained from
/// [`CommandBufferPool::get_command_buffer`](crate::CommandBufferPool::get_command_buffer),
/// which guarantees the requested number of free words. Each write appends
/// one word and advances the buffer's written size.
pub struct CommandSpace<'a> {
    cmd_buf: &'a mut CommandBuffer,
}

impl<'a> CommandSpace<'a> {
    pub(crate) fn new(cmd_buf: &'a mut CommandBuffer) -> Self {
        Self { cmd_buf }
    }

    /// Appends one command word.
    ///
    /// The word must already be in device byte order.
    pub fn write(&mut self, word: u32) {
        self.cmd_buf.write(word);
    }

    /// Appends a run of command words.
    pub fn write_all(&mut self, words: &[u32]) {
        for &word in words {
            self.cmd_buf.write(word);
        }
    }

    /// Free words left in the buffer.
    pub fn remaining(&self) -> usize {
        self.cmd_buf.remaining()
    }
}
