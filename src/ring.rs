//! Ring-region accounting for pool-backed command buffers.
//!
//! The pool owns one contiguous region of 32-bit words. Leases advance
//! `head`, retirements advance `tail`, and because a lease must be physically
//! contiguous a wraparound records the unusable trailing words in `skipped`
//! instead of splitting the allocation. Retirement consumes the gap when it
//! reaches the wrap boundary, without scanning.

use {crate::cmd_buf::PAD_ALIGN_WORDS, log::trace, parking_lot::Mutex, std::ptr::NonNull};

/// Smallest number of words a single pool lease reserves; smaller requests
/// are rounded up.
pub const MIN_LEASE_WORDS: usize = 0x100;

/// Largest number of words a single pool lease reserves, regardless of how
/// much contiguous space is free.
pub const MAX_LEASE_WORDS: usize = 0x2_0000;

#[derive(Debug)]
struct State {
    /// Next write offset.
    head: usize,

    /// Oldest live allocation, or `None` while the ring is empty.
    tail: Option<usize>,

    /// Unusable words before the end of the region after a forced wrap.
    skipped: usize,

    /// A lease is outstanding.
    leased: bool,
}

pub(crate) struct CommandRing {
    base: NonNull<u32>,

    /// Region size in words.
    size: usize,

    state: Mutex<State>,
}

// The region is exclusively owned by the ring; `base` is only dereferenced
// through the current lease holder.
unsafe impl Send for CommandRing {}
unsafe impl Sync for CommandRing {}

impl CommandRing {
    pub fn new(base: NonNull<u32>, size: usize) -> Self {
        assert!(
            size >= MIN_LEASE_WORDS,
            "pool of {size} words cannot hold a minimum lease"
        );
        assert_eq!(
            size % PAD_ALIGN_WORDS,
            0,
            "pool size must be a multiple of {PAD_ALIGN_WORDS} words"
        );

        Self {
            base,
            size,
            state: Mutex::new(State {
                head: 0,
                tail: None,
                skipped: 0,
                leased: false,
            }),
        }
    }

    /// Reserves contiguous space for `wanted` words and marks the lease
    /// outstanding. The grant is the whole chosen segment, capped at
    /// [`MAX_LEASE_WORDS`]; `None` means nothing large enough is free until
    /// further retirements.
    #[profiling::function]
    pub fn lease(&self, wanted: usize) -> Option<(NonNull<u32>, usize)> {
        let wanted = wanted.max(MIN_LEASE_WORDS);

        assert!(
            wanted <= self.size,
            "lease of {wanted} words exceeds the {} word pool",
            self.size
        );

        let mut state = self.state.lock();

        assert!(!state.leased, "a pool lease is already outstanding");

        let available = match state.tail {
            None => {
                // Empty ring; everything from the base is free.
                assert_eq!(state.head, 0);
                state.tail = Some(0);

                self.size
            }
            Some(tail) if state.head < tail => {
                let available = tail - state.head;
                if available < wanted {
                    return None;
                }

                available
            }
            Some(tail) => {
                let available = self.size - state.head;
                if available >= wanted {
                    available
                } else if tail < wanted {
                    return None;
                } else {
                    // The trailing words cannot hold the lease: skip them and
                    // restart at the base.
                    state.skipped = self.size - state.head;
                    state.head = 0;

                    tail
                }
            }
        };

        let granted = available.min(MAX_LEASE_WORDS);
        let offset = state.head;

        state.head += granted;
        state.leased = true;

        trace!("leased {granted} words at +{offset:#x}");

        Some((self.word_ptr(offset), granted))
    }

    /// Closes the outstanding lease, giving the `used..original` words back
    /// to the pool. The used words stay live until [`retire`](Self::retire).
    pub fn shrink_lease(&self, buf: NonNull<u32>, used: usize, original: usize) {
        debug_assert!(used <= original);

        let offset = self.offset_of(buf);
        let mut state = self.state.lock();

        assert!(state.leased, "no pool lease is outstanding");
        assert_eq!(
            state.head,
            offset + original,
            "lease does not match the allocation cursor"
        );

        state.head = offset + used;
        state.leased = false;
    }

    /// Returns a retired buffer's words to the free space. Buffers must
    /// retire in allocation order.
    #[profiling::function]
    pub fn retire(&self, buf: NonNull<u32>, words: usize) {
        let offset = self.offset_of(buf);
        let mut state = self.state.lock();
        let mut tail = state.tail.expect("retire on an empty ring");

        // Consume the wrap gap once retirement reaches it.
        if tail + state.skipped == self.size {
            state.skipped = 0;
            tail = 0;
        }

        assert_eq!(tail, offset, "command buffers retired out of allocation order");

        tail += words;

        if tail == state.head {
            state.head = 0;
            state.tail = None;
        } else {
            state.tail = Some(tail);
        }

        trace!("retired {words} words at +{offset:#x}");
    }

    fn offset_of(&self, buf: NonNull<u32>) -> usize {
        let offset = unsafe { buf.as_ptr().offset_from(self.base.as_ptr()) };

        assert!(
            0 <= offset && (offset as usize) < self.size,
            "buffer does not belong to the pool"
        );

        offset as usize
    }

    fn word_ptr(&self, offset: usize) -> NonNull<u32> {
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> (usize, Option<usize>, usize) {
        let state = self.state.lock();

        (state.head, state.tail, state.skipped)
    }
}
