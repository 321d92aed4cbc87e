//! Command buffer leasing and per-core active-buffer management.

use {
    crate::{
        cmd_buf::{CommandBuffer, CommandSpace, DescriptorList, Submission},
        driver::{DisplayListOverrun, Gpu, Platform},
        ring::{CommandRing, MIN_LEASE_WORDS},
    },
    derive_builder::{Builder, UninitializedFieldError},
    log::{debug, trace, warn},
    parking_lot::Mutex,
    std::{
        cell::UnsafeCell,
        fmt::{Debug, Formatter},
        mem::size_of,
        ptr::{null_mut, NonNull},
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        thread::panicking,
    },
};

/// One active-buffer slot per CPU core.
struct ActiveBuffers {
    slots: Box<[UnsafeCell<*mut CommandBuffer>]>,
}

// Each slot is only ever accessed from the thread running on its core.
unsafe impl Send for ActiveBuffers {}
unsafe impl Sync for ActiveBuffers {}

impl ActiveBuffers {
    fn new(core_count: usize) -> Self {
        let mut slots = Vec::with_capacity(core_count);
        slots.resize_with(core_count, || UnsafeCell::new(null_mut()));

        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    fn get(&self, core: u32) -> Option<NonNull<CommandBuffer>> {
        NonNull::new(unsafe { *self.slots[core as usize].get() })
    }

    fn set(&self, core: u32, cmd_buf: *mut CommandBuffer) {
        unsafe { *self.slots[core as usize].get() = cmd_buf };
    }

    fn take(&self, core: u32) -> Option<NonNull<CommandBuffer>> {
        let cmd_buf = self.get(core);
        self.set(core, null_mut());

        cmd_buf
    }
}

/// A pool of GPU command buffers carved out of one caller-supplied ring
/// region.
///
/// Guest code obtains write space through [`get_command_buffer`][Self::get_command_buffer]
/// and appends 32-bit command words; full buffers are queued to the [`Gpu`]
/// backend and their storage is reclaimed once the backend reports
/// retirement. At most one pool lease is outstanding at a time, and only the
/// main graphics core may hold one. When the ring has no room for the next
/// lease, allocation blocks until the GPU retires a buffer; that is the
/// backpressure point for guest threads.
///
/// Caller-owned display-list buffers bypass the ring entirely, either as
/// one-shot submissions ([`queue_display_list`][Self::queue_display_list]) or
/// as build-it-yourself sessions
/// ([`begin_user_command_buffer`][Self::begin_user_command_buffer]).
///
/// Every protocol violation (out-of-order retirement, mismatched session
/// buffers, a lease while a lease is outstanding) is a defect in the guest or
/// the backend and aborts the process; there is no recoverable error surface.
pub struct CommandBufferPool {
    active: ActiveBuffers,
    descriptors: DescriptorList,
    gpu: Arc<dyn Gpu>,
    main_core: u32,
    overrun: Mutex<Option<Box<DisplayListOverrun>>>,
    platform: Arc<dyn Platform>,
    ring: CommandRing,
    submit_clock: AtomicU64,
}

impl CommandBufferPool {
    /// Creates the pool over the `info.size` words at `info.base` and takes
    /// the initial minimum-size lease as the main core's active buffer.
    ///
    /// Must be called on the main graphics core.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes of `info.size` words,
    /// must not be accessed except through the pool and its lease holders,
    /// and must outlive the returned instance.
    pub unsafe fn new(
        info: impl Into<PoolInfo>,
        gpu: Arc<dyn Gpu>,
        platform: Arc<dyn Platform>,
    ) -> Arc<Self> {
        let info = info.into();
        let core = platform.core_id();

        assert_eq!(
            core, info.main_core,
            "the pool must be created on the main graphics core"
        );

        debug!("create: {:?}", info);

        let this = Arc::new(Self {
            active: ActiveBuffers::new(platform.core_count() as usize),
            descriptors: DescriptorList::new(),
            gpu,
            main_core: info.main_core,
            overrun: Mutex::new(None),
            platform,
            ring: CommandRing::new(info.base, info.size),
            submit_clock: AtomicU64::new(0),
        });

        let cmd_buf = this
            .allocate_command_buffer(MIN_LEASE_WORDS)
            .expect("created on the main core");
        this.active.set(core, cmd_buf.as_ptr());

        this
    }

    /// Returns write space for at least `words` words in the current core's
    /// active buffer, first flushing (pool mode) or growing (display-list
    /// mode) the buffer when it cannot hold them.
    #[profiling::function]
    pub fn get_command_buffer(&self, words: usize) -> CommandSpace<'_> {
        let core = self.platform.core_id();
        let needs_flush = match self.active.get(core) {
            Some(cmd_buf) => unsafe { &*cmd_buf.as_ptr() }.remaining() < words,
            None => true,
        };

        if needs_flush {
            self.flush_command_buffer(words);
        }

        let cmd_buf = self.active.get(core).expect("flush installs a buffer");

        CommandSpace::new(unsafe { &mut *cmd_buf.as_ptr() })
    }

    /// Pads the current core's active buffer to a 32-byte boundary with
    /// [`PAD_WORD`](crate::PAD_WORD) filler.
    pub fn pad_command_buffer(&self) {
        let cmd_buf = self
            .active
            .get(self.platform.core_id())
            .expect("no active command buffer");

        unsafe { &mut *cmd_buf.as_ptr() }.pad();
    }

    /// Queues whatever has been written to the active pool-backed buffer and
    /// opens a fresh minimum-size lease in its place.
    #[profiling::function]
    pub fn flush(&self) {
        let core = self.platform.core_id();
        let cmd_buf = self.active.get(core).expect("no active command buffer");

        assert!(
            !unsafe { &*cmd_buf.as_ptr() }.display_list,
            "cannot flush a user display list"
        );

        self.flush_command_buffer(MIN_LEASE_WORDS);
    }

    /// Queues a caller-built display list without touching the active buffer.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for reads of `words` words until the GPU
    /// retires the submission.
    pub unsafe fn queue_display_list(&self, buffer: NonNull<u32>, words: usize) {
        let cmd_buf = self.descriptors.acquire();

        unsafe { &mut *cmd_buf.as_ptr() }.reset(buffer.as_ptr(), words, words, true);

        self.queue(cmd_buf);
    }

    /// Opens a user display-list session on the current core.
    ///
    /// On the main core any pool-backed work is drained to the GPU first.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for reads and writes of `words` words until the
    /// session ends.
    pub unsafe fn begin_user_command_buffer(&self, buffer: NonNull<u32>, words: usize) {
        let core = self.platform.core_id();

        if let Some(cmd_buf) = self.active.get(core) {
            let cmd_buf = unsafe { &mut *cmd_buf.as_ptr() };

            assert!(
                !cmd_buf.display_list,
                "a display list is already active on core {core}"
            );

            cmd_buf.pad();
            self.flush_active_command_buffer();
        }

        let cmd_buf = self.descriptors.acquire();

        unsafe { &mut *cmd_buf.as_ptr() }.reset(buffer.as_ptr(), 0, words, true);

        self.active.set(core, cmd_buf.as_ptr());

        trace!("user display list of {words} words active on core {core}");
    }

    /// Closes the current core's display-list session and returns the padded
    /// word count, so the caller can tell the GPU how many words are real.
    ///
    /// On the main core a fresh pool lease becomes the active buffer again.
    pub fn end_user_command_buffer(&self, buffer: NonNull<u32>) -> usize {
        let core = self.platform.core_id();
        let cmd_buf = self.active.take(core).expect("no active display list");

        {
            let cmd_buf = unsafe { &mut *cmd_buf.as_ptr() };

            assert!(
                cmd_buf.display_list,
                "the active command buffer is not a display list"
            );
            assert_eq!(
                cmd_buf.buf,
                buffer.as_ptr(),
                "mismatched display list buffer"
            );

            cmd_buf.pad();
        }

        let used = unsafe { &*cmd_buf.as_ptr() }.cur_size;

        self.descriptors.release(cmd_buf);

        if core == self.main_core {
            let cmd_buf = self
                .allocate_command_buffer(MIN_LEASE_WORDS)
                .expect("closed on the main core");
            self.active.set(core, cmd_buf.as_ptr());
        }

        trace!("user display list closed with {used} words");

        used
    }

    /// The current core's user display-list buffer and its capacity in words,
    /// or `None` when no display-list session is active.
    pub fn user_command_buffer(&self) -> Option<(NonNull<u32>, usize)> {
        let cmd_buf = self.active.get(self.platform.core_id())?;
        let cmd_buf = unsafe { &*cmd_buf.as_ptr() };

        cmd_buf
            .display_list
            .then(|| (NonNull::new(cmd_buf.buf).expect("display list buffer"), cmd_buf.max_size))
    }

    /// Installs the guest callback used to grow user display lists that run
    /// out of room.
    pub fn set_display_list_overrun(&self, callback: Box<DisplayListOverrun>) {
        *self.overrun.lock() = Some(callback);
    }

    /// Returns a retired buffer to the pool.
    ///
    /// Invoked by the GPU backend once it has consumed a submission; pool
    /// buffers must come back in queue order.
    #[profiling::function]
    pub fn free_command_buffer(&self, cmd_buf: Submission) {
        let cmd_buf = cmd_buf.into_inner();

        {
            let cmd_buf = unsafe { &*cmd_buf.as_ptr() };

            assert_eq!(
                cmd_buf.cur_size, cmd_buf.max_size,
                "retired command buffer is not fully accounted"
            );

            trace!(
                "retired {} words queued at t{}",
                cmd_buf.max_size,
                cmd_buf.submit_time
            );

            if !cmd_buf.display_list {
                self.ring.retire(
                    NonNull::new(cmd_buf.buf).expect("pool-backed buffer"),
                    cmd_buf.max_size,
                );
            }
        }

        self.descriptors.release(cmd_buf);
    }

    /// The timestamp assigned to the most recently queued buffer, or zero
    /// when nothing has been queued yet.
    pub fn last_submitted_timestamp(&self) -> u64 {
        self.submit_clock.load(Ordering::Relaxed)
    }

    /// The timestamp of the most recently retired buffer, as reported by the
    /// GPU backend.
    pub fn retired_timestamp(&self) -> u64 {
        self.gpu.retired_timestamp()
    }

    /// Blocks until every buffer queued so far has retired.
    pub fn wait_until_retired(&self) {
        let submitted = self.last_submitted_timestamp();

        if self.gpu.retired_timestamp() < submitted {
            self.gpu.wait_for_timestamp(submitted);
        }
    }

    /// Leases pool space and binds a fresh descriptor to it, blocking on GPU
    /// retirement while the ring is full.
    #[profiling::function]
    fn allocate_command_buffer(&self, wanted: usize) -> Option<NonNull<CommandBuffer>> {
        let core = self.platform.core_id();

        if core != self.main_core {
            warn!("core {core} cannot lease pool command buffers");

            return None;
        }

        let (buf, granted) = loop {
            if let Some(lease) = self.ring.lease(wanted) {
                break lease;
            }

            // The pool is full; room opens up when the GPU retires a buffer.
            let retired = self.gpu.retired_timestamp();

            debug!("pool exhausted, waiting for a retirement past t{retired}");

            self.gpu.wait_for_timestamp(retired + 1);
        };

        let cmd_buf = self.descriptors.acquire();

        unsafe { &mut *cmd_buf.as_ptr() }.reset(buf.as_ptr(), 0, granted, false);

        Some(cmd_buf)
    }

    /// Closes the active lease and hands the written words to the GPU; an
    /// untouched buffer goes straight back to the free-list instead.
    fn flush_active_command_buffer(&self) {
        let core = self.platform.core_id();

        assert_eq!(
            core, self.main_core,
            "only the main core owns pool command buffers"
        );

        let cmd_buf = self.active.take(core).expect("no active command buffer");
        let used = {
            let cmd_buf = unsafe { &mut *cmd_buf.as_ptr() };

            assert!(
                !cmd_buf.display_list,
                "the active command buffer is a display list"
            );

            self.ring.shrink_lease(
                NonNull::new(cmd_buf.buf).expect("pool-backed buffer"),
                cmd_buf.cur_size,
                cmd_buf.max_size,
            );
            cmd_buf.max_size = cmd_buf.cur_size;

            cmd_buf.cur_size
        };

        if used == 0 {
            self.descriptors.release(cmd_buf);
        } else {
            self.queue(cmd_buf);
        }
    }

    /// Retires the current core's active buffer from service and installs one
    /// that can hold `needed` more words.
    #[profiling::function]
    fn flush_command_buffer(&self, needed: usize) {
        let core = self.platform.core_id();

        if let Some(cmd_buf) = self.active.get(core) {
            let cmd_buf = unsafe { &mut *cmd_buf.as_ptr() };

            cmd_buf.pad();

            if cmd_buf.display_list {
                self.grow_display_list(cmd_buf, needed);

                return;
            }

            self.flush_active_command_buffer();
        }

        let cmd_buf = self
            .allocate_command_buffer(needed)
            .unwrap_or_else(|| panic!("no command buffer available on core {core}"));
        self.active.set(core, cmd_buf.as_ptr());
    }

    /// Migrates a full display-list descriptor onto replacement storage
    /// obtained from the guest's overrun callback.
    fn grow_display_list(&self, cmd_buf: &mut CommandBuffer, needed: usize) {
        let overrun = self.overrun.lock();
        let overrun = overrun
            .as_deref()
            .expect("display list overran with no overrun callback");

        let buf = NonNull::new(cmd_buf.buf).expect("active display list buffer");
        let used_bytes = cmd_buf.cur_size * size_of::<u32>();
        let needed_bytes = needed * size_of::<u32>();

        let (new_buf, new_bytes) = overrun(buf, used_bytes, needed_bytes)
            .expect("display list overrun callback returned no buffer");

        assert_ne!(
            new_bytes, 0,
            "display list overrun callback returned an empty buffer"
        );

        debug!("display list grown from {used_bytes} used bytes to {new_bytes} bytes");

        cmd_buf.buf = new_buf.as_ptr();
        cmd_buf.cur_size = 0;
        cmd_buf.max_size = new_bytes / size_of::<u32>();
    }

    /// Stamps a submit timestamp onto the descriptor and hands it to the GPU
    /// backend.
    fn queue(&self, cmd_buf: NonNull<CommandBuffer>) {
        {
            let cmd_buf = unsafe { &mut *cmd_buf.as_ptr() };

            cmd_buf.submit_time = self.submit_clock.fetch_add(1, Ordering::Relaxed) + 1;

            debug!("queue: {} words at t{}", cmd_buf.cur_size, cmd_buf.submit_time);
        }

        self.gpu.queue_command_buffer(Submission::new(cmd_buf));
    }
}

impl Debug for CommandBufferPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBufferPool")
            .field("main_core", &self.main_core)
            .field("last_submitted", &self.last_submitted_timestamp())
            .finish_non_exhaustive()
    }
}

impl Drop for CommandBufferPool {
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        // Descriptors parked in active slots are not on the free-list; the
        // free-list reclaims its own nodes when it drops.
        for core in 0..self.platform.core_count() {
            if let Some(cmd_buf) = self.active.take(core) {
                drop(unsafe { Box::from_raw(cmd_buf.as_ptr()) });
            }
        }
    }
}

/// Information used to create a [`CommandBufferPool`] instance.
#[derive(Builder, Clone, Copy, Debug)]
#[builder(
    build_fn(private, name = "fallible_build", error = "PoolInfoBuilderError"),
    derive(Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct PoolInfo {
    /// First word of the pool region.
    pub base: NonNull<u32>,

    /// Size of the pool region in words.
    ///
    /// Must be at least [`MIN_LEASE_WORDS`] and a multiple of
    /// [`PAD_ALIGN_WORDS`](crate::PAD_ALIGN_WORDS).
    pub size: usize,

    /// The only core allowed to own pool-backed command buffers. The default
    /// value is core zero.
    #[builder(default)]
    pub main_core: u32,
}

impl PoolInfo {
    /// Specifies a pool over the `size` words starting at `base`.
    pub fn new(base: NonNull<u32>, size: usize) -> PoolInfoBuilder {
        PoolInfoBuilder::default().base(base).size(size)
    }

    /// Converts a `PoolInfo` into a `PoolInfoBuilder`.
    #[inline(always)]
    pub fn to_builder(self) -> PoolInfoBuilder {
        PoolInfoBuilder {
            base: Some(self.base),
            size: Some(self.size),
            main_core: Some(self.main_core),
        }
    }
}

impl From<PoolInfoBuilder> for PoolInfo {
    fn from(info: PoolInfoBuilder) -> Self {
        info.build()
    }
}

// HACK: https://github.com/colin-kiegel/rust-derive-builder/issues/56
impl PoolInfoBuilder {
    /// Builds a new `PoolInfo`.
    pub fn build(self) -> PoolInfo {
        self.fallible_build()
            .expect("All required fields set at initialization")
    }
}

#[derive(Debug)]
struct PoolInfoBuilderError;

impl From<UninitializedFieldError> for PoolInfoBuilderError {
    fn from(_: UninitializedFieldError) -> Self {
        Self
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            cmd_buf::PAD_WORD,
            ring::MAX_LEASE_WORDS,
        },
        parking_lot::Condvar,
        rand::{rngs::SmallRng, Rng, SeedableRng},
        std::{collections::VecDeque, sync::atomic::AtomicU32, thread, time::Duration},
    };

    struct TestGpu {
        queued: Mutex<VecDeque<Submission>>,
        retired: Mutex<u64>,
        on_retired: Condvar,
    }

    impl TestGpu {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                queued: Mutex::new(VecDeque::new()),
                retired: Mutex::new(0),
                on_retired: Condvar::new(),
            })
        }

        fn queued_len(&self) -> usize {
            self.queued.lock().len()
        }

        /// Retires the oldest queued buffer: the words go back to the pool
        /// first, then the timestamp becomes visible to waiters.
        fn retire_next(&self, pool: &CommandBufferPool) {
            let cmd_buf = self.queued.lock().pop_front().expect("nothing queued");
            let time = cmd_buf.submit_time();

            pool.free_command_buffer(cmd_buf);

            let mut retired = self.retired.lock();
            *retired = time;
            self.on_retired.notify_all();
        }
    }

    impl Gpu for TestGpu {
        fn queue_command_buffer(&self, cmd_buf: Submission) {
            self.queued.lock().push_back(cmd_buf);
        }

        fn retired_timestamp(&self) -> u64 {
            *self.retired.lock()
        }

        fn wait_for_timestamp(&self, time: u64) {
            let mut retired = self.retired.lock();

            while *retired < time {
                self.on_retired.wait(&mut retired);
            }
        }
    }

    struct TestPlatform {
        core: AtomicU32,
    }

    impl TestPlatform {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                core: AtomicU32::new(0),
            })
        }
    }

    impl Platform for TestPlatform {
        fn core_id(&self) -> u32 {
            self.core.load(Ordering::Relaxed)
        }

        fn core_count(&self) -> u32 {
            3
        }
    }

    fn pool_with(
        size: usize,
    ) -> (
        Arc<CommandBufferPool>,
        Arc<TestGpu>,
        Arc<TestPlatform>,
        Box<[u32]>,
    ) {
        let mut words = vec![0u32; size].into_boxed_slice();
        let base = NonNull::new(words.as_mut_ptr()).unwrap();
        let gpu = TestGpu::new();
        let platform = TestPlatform::new();
        let gpu_dyn: Arc<dyn Gpu> = gpu.clone() as Arc<dyn Gpu>;
        let platform_dyn: Arc<dyn Platform> = platform.clone() as Arc<dyn Platform>;
        let pool = unsafe { CommandBufferPool::new(PoolInfo::new(base, size), gpu_dyn, platform_dyn) };

        (pool, gpu, platform, words)
    }

    #[test]
    pub fn initial_lease_sits_at_the_base() {
        let (pool, gpu, _platform, words) = pool_with(0x40000);

        let mut space = pool.get_command_buffer(1);

        assert_eq!(space.remaining(), MAX_LEASE_WORDS);

        space.write(0xC0DE_0001);

        assert_eq!(words[0], 0xC0DE_0001);
        assert_eq!(gpu.queued_len(), 0);
        assert_eq!(pool.last_submitted_timestamp(), 0);
    }

    #[test]
    pub fn flush_pads_and_queues() {
        let (pool, gpu, _platform, words) = pool_with(0x40000);

        let mut space = pool.get_command_buffer(0x100);

        for word in 0..100 {
            space.write(word);
        }

        pool.flush();

        assert_eq!(gpu.queued_len(), 1);

        {
            let queued = gpu.queued.lock();
            let cmd_buf = queued.front().unwrap();

            assert_eq!(cmd_buf.words().len(), 104);
            assert_eq!(cmd_buf.submit_time(), 1);
            assert!(!cmd_buf.is_display_list());
            assert!(cmd_buf.words()[100..]
                .iter()
                .all(|&word| word == PAD_WORD.to_be()));
        }

        // The unused tail of the first lease went back to the pool, so the
        // fresh lease starts right after the padded words.
        let mut space = pool.get_command_buffer(1);
        space.write(0xC0DE_0002);

        assert_eq!(words[104], 0xC0DE_0002);
    }

    #[test]
    pub fn opening_a_session_queues_pending_pool_work() {
        let (pool, gpu, _platform, _words) = pool_with(0x40000);

        let mut space = pool.get_command_buffer(8);
        space.write_all(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut list = vec![0u32; 64].into_boxed_slice();
        let base = NonNull::new(list.as_mut_ptr()).unwrap();

        unsafe { pool.begin_user_command_buffer(base, 64) };

        assert_eq!(gpu.queued_len(), 1);
        assert_eq!(gpu.queued.lock().front().unwrap().words().len(), 8);

        pool.end_user_command_buffer(base);
    }

    #[test]
    pub fn in_order_retirement_reclaims_the_ring() {
        let (pool, gpu, _platform, _words) = pool_with(0x40000);

        for _ in 0..3 {
            let mut space = pool.get_command_buffer(0x100);

            for word in 0..256 {
                space.write(word);
            }

            pool.flush();
        }

        assert_eq!(gpu.queued_len(), 3);

        while gpu.queued_len() > 0 {
            gpu.retire_next(&pool);
        }

        pool.wait_until_retired();

        assert_eq!(pool.retired_timestamp(), 3);

        // Only the active lease remains live: three 256-word buffers retired
        // in order, so the tail caught up with its start.
        let (_head, tail, skipped) = pool.ring.snapshot();

        assert_eq!(tail, Some(768));
        assert_eq!(skipped, 0);
    }

    #[test]
    pub fn user_display_list_session() {
        let (pool, gpu, _platform, _words) = pool_with(0x40000);

        let mut user = vec![0u32; 512].into_boxed_slice();
        let user_base = NonNull::new(user.as_mut_ptr()).unwrap();

        let mut grown = vec![0u32; 1024].into_boxed_slice();
        let grown_addr = grown.as_mut_ptr() as usize;

        pool.set_display_list_overrun(Box::new(move |_old, used_bytes, needed_bytes| {
            assert_eq!(used_bytes, 512 * 4);
            assert_eq!(needed_bytes, 88 * 4);

            Some((NonNull::new(grown_addr as *mut u32).unwrap(), 1024 * 4))
        }));

        assert!(pool.user_command_buffer().is_none());

        unsafe { pool.begin_user_command_buffer(user_base, 512) };

        // The untouched pool-backed buffer was reclaimed, not queued.
        assert_eq!(gpu.queued_len(), 0);
        assert_eq!(pool.user_command_buffer(), Some((user_base, 512)));

        let mut space = pool.get_command_buffer(512);

        for word in 0..512 {
            space.write(word);
        }

        // The next reservation does not fit: the session migrates onto the
        // grown buffer supplied by the callback.
        let mut space = pool.get_command_buffer(88);

        for word in 0..85 {
            space.write(word);
        }

        let grown_base = NonNull::new(grown_addr as *mut u32).unwrap();

        assert_eq!(pool.user_command_buffer(), Some((grown_base, 1024)));

        let used = pool.end_user_command_buffer(grown_base);

        assert_eq!(used, 88);
        assert_eq!(&grown[85..88], &[PAD_WORD.to_be(); 3]);
        assert_eq!(&user[..512], &(0..512).collect::<Vec<_>>()[..]);

        // Back in pool mode with a fresh lease.
        assert!(pool.user_command_buffer().is_none());
        assert!(pool.get_command_buffer(1).remaining() >= 0x100);
        assert_eq!(gpu.queued_len(), 0);
    }

    #[test]
    pub fn display_lists_work_on_secondary_cores() {
        let (pool, gpu, platform, _words) = pool_with(0x40000);

        platform.core.store(2, Ordering::Relaxed);

        let mut list = vec![0u32; 64].into_boxed_slice();
        let base = NonNull::new(list.as_mut_ptr()).unwrap();

        unsafe { pool.begin_user_command_buffer(base, 64) };

        let mut space = pool.get_command_buffer(5);
        space.write_all(&[1, 2, 3, 4, 5]);

        assert_eq!(pool.end_user_command_buffer(base), 8);

        // No pool lease on a secondary core; the slot stays empty.
        assert!(pool.user_command_buffer().is_none());
        assert_eq!(gpu.queued_len(), 0);

        // The main core still holds its own active buffer.
        platform.core.store(0, Ordering::Relaxed);

        assert_eq!(pool.get_command_buffer(1).remaining(), MAX_LEASE_WORDS);
    }

    #[test]
    pub fn queued_display_list_round_trips() {
        let (pool, gpu, _platform, _words) = pool_with(0x40000);

        let mut list = vec![0u32; 64].into_boxed_slice();
        let base = NonNull::new(list.as_mut_ptr()).unwrap();

        unsafe { pool.queue_display_list(base, 64) };

        assert_eq!(gpu.queued_len(), 1);

        {
            let queued = gpu.queued.lock();
            let cmd_buf = queued.front().unwrap();

            assert!(cmd_buf.is_display_list());
            assert_eq!(cmd_buf.words().len(), 64);
            assert_eq!(cmd_buf.submit_time(), 1);
        }

        let ring_before = pool.ring.snapshot();

        gpu.retire_next(&pool);

        // Display lists never touch the ring.
        assert_eq!(pool.ring.snapshot(), ring_before);
        assert_eq!(pool.retired_timestamp(), 1);
    }

    #[test]
    #[should_panic(expected = "out of allocation order")]
    pub fn out_of_order_retirement_aborts() {
        let (pool, gpu, _platform, _words) = pool_with(0x40000);

        for _ in 0..2 {
            let mut space = pool.get_command_buffer(8);

            for word in 0..8 {
                space.write(word);
            }

            pool.flush();
        }

        let second = gpu.queued.lock().pop_back().unwrap();

        pool.free_command_buffer(second);
    }

    #[test]
    #[should_panic(expected = "no command buffer available on core 1")]
    pub fn secondary_cores_cannot_lease() {
        let (pool, _gpu, platform, _words) = pool_with(0x40000);

        platform.core.store(1, Ordering::Relaxed);

        pool.get_command_buffer(0x100);
    }

    #[test]
    #[should_panic(expected = "already active")]
    pub fn nested_display_lists_abort() {
        let (pool, _gpu, _platform, _words) = pool_with(0x40000);

        let mut list = vec![0u32; 64].into_boxed_slice();
        let base = NonNull::new(list.as_mut_ptr()).unwrap();

        unsafe {
            pool.begin_user_command_buffer(base, 64);
            pool.begin_user_command_buffer(base, 64);
        }
    }

    #[test]
    #[should_panic(expected = "mismatched display list buffer")]
    pub fn mismatched_session_buffer_aborts() {
        let (pool, _gpu, _platform, _words) = pool_with(0x40000);

        let mut list = vec![0u32; 64].into_boxed_slice();
        let mut other = vec![0u32; 64].into_boxed_slice();

        unsafe {
            pool.begin_user_command_buffer(NonNull::new(list.as_mut_ptr()).unwrap(), 64)
        };

        pool.end_user_command_buffer(NonNull::new(other.as_mut_ptr()).unwrap());
    }

    #[test]
    #[should_panic(expected = "cannot flush a user display list")]
    pub fn flushing_a_display_list_aborts() {
        let (pool, _gpu, _platform, _words) = pool_with(0x40000);

        let mut list = vec![0u32; 64].into_boxed_slice();

        unsafe {
            pool.begin_user_command_buffer(NonNull::new(list.as_mut_ptr()).unwrap(), 64)
        };

        pool.flush();
    }

    #[test]
    pub fn exhaustion_blocks_until_retirement() {
        pretty_env_logger::try_init().ok();

        let (pool, gpu, _platform, _words) = pool_with(0x800);

        let gpu_thread = {
            let pool = Arc::clone(&pool);
            let gpu = Arc::clone(&gpu);

            thread::spawn(move || {
                for _ in 0..4 {
                    while gpu.queued_len() == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }

                    thread::sleep(Duration::from_millis(10));
                    gpu.retire_next(&pool);
                }
            })
        };

        // Four 512-word flushes overcommit the 2048-word ring; the last
        // lease stalls until the GPU thread starts retiring.
        for _ in 0..4 {
            let mut space = pool.get_command_buffer(512);

            for word in 0..512 {
                space.write(word);
            }

            pool.flush();
        }

        gpu_thread.join().unwrap();
        pool.wait_until_retired();

        assert_eq!(pool.last_submitted_timestamp(), 4);
        assert_eq!(pool.retired_timestamp(), 4);
    }

    #[test]
    pub fn soak() {
        pretty_env_logger::try_init().ok();

        let (pool, gpu, _platform, _words) = pool_with(0x4000);
        let mut rng = SmallRng::seed_from_u64(0xBEEF);

        for _ in 0..1_000 {
            let words = rng.gen_range(1..=512);
            let mut space = pool.get_command_buffer(words);

            for _ in 0..words {
                space.write(rng.gen());
            }

            pool.flush();

            let keep = rng.gen_range(0..4);

            while gpu.queued_len() > keep {
                gpu.retire_next(&pool);
            }
        }

        while gpu.queued_len() > 0 {
            gpu.retire_next(&pool);
        }

        pool.wait_until_retired();

        let (head, tail, skipped) = pool.ring.snapshot();

        // Everything queued has retired; only the active lease is live.
        assert!(head <= 0x4000);
        assert!(tail.is_some());
        assert!(tail.unwrap_or(0) + skipped <= 0x4000);
    }

    #[test]
    pub fn pool_info() {
        let mut words = [0u32; 256];
        let base = NonNull::new(words.as_mut_ptr()).unwrap();
        let info = PoolInfo::new(base, 256).main_core(0).build();

        assert_eq!(info.to_builder().build().size, 256);
    }
}
