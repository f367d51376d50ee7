//! The allocator core.
use core::{mem, ptr::NonNull};

use crate::int::{log2_ceil, log2_floor, pow2};

/// The alignment of every fragment base address and every payload pointer
/// returned by [`Heap::allocate`].
///
/// It is four machine words: the smallest power of two that can hold a
/// fragment header.
pub const ALIGNMENT: usize = mem::size_of::<usize>() * 4;

/// The smallest possible fragment: one [`ALIGNMENT`] of header plus one
/// [`ALIGNMENT`] of payload.
pub const FRAGMENT_SIZE_MIN: usize = ALIGNMENT * 2;

/// The largest possible fragment (the highest power of two representable in
/// `usize`). No arena can offer more than this in one piece.
pub const FRAGMENT_SIZE_MAX: usize = (usize::MAX >> 1) + 1;

/// One bin per power of two; the top bins stay empty on any realistic arena
/// but keeping the count at the word width makes the mask arithmetic total.
const BIN_COUNT: usize = usize::BITS as usize;

/// Bytes reserved at the front of the arena for the [`Heap`] instance,
/// padded so the first fragment lands on an [`ALIGNMENT`] boundary.
const INSTANCE_SIZE_PADDED: usize = (mem::size_of::<Heap>() + ALIGNMENT - 1) & !(ALIGNMENT - 1);

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(ALIGNMENT >= 2 * mem::size_of::<*mut u8>());
const _: () = assert!(FRAGMENT_SIZE_MIN.is_power_of_two());
const _: () = assert!(FRAGMENT_SIZE_MAX.is_power_of_two());
const _: () = assert!(mem::size_of::<FragmentHdr>() <= ALIGNMENT);
const _: () = assert!(mem::size_of::<FreeFragment>() <= FRAGMENT_SIZE_MIN);
const _: () = assert!(mem::align_of::<Heap>() <= ALIGNMENT);

/// A critical-section hook. Zero-argument, infallible, reentrancy concerns
/// are the caller's.
pub type Hook = fn();

/// Invokes the enter hook on construction and the leave hook on drop, so
/// that every exit path of a public operation leaves the critical section.
struct CriticalSection {
    leave: Option<Hook>,
}

impl CriticalSection {
    #[inline]
    fn enter(enter: Option<Hook>, leave: Option<Hook>) -> Self {
        if let Some(hook) = enter {
            hook();
        }
        Self { leave }
    }
}

impl Drop for CriticalSection {
    #[inline]
    fn drop(&mut self) {
        if let Some(hook) = self.leave {
            hook();
        }
    }
}

/// Runtime figures describing the state of a [`Heap`].
///
/// All sizes are in bytes and include fragment headers; `allocated` is
/// therefore always a multiple of [`FRAGMENT_SIZE_MIN`] and may exceed the
/// sum of the payload sizes the caller asked for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Usable arena size. Invariant for the life of the instance.
    pub capacity: usize,
    /// Total size of the fragments currently owned by the caller.
    pub allocated: usize,
    /// High-water mark of `allocated`.
    pub peak_allocated: usize,
    /// The largest `amount` ever passed to [`Heap::allocate`], including
    /// requests that failed.
    pub peak_request_size: usize,
    /// Number of allocation requests that returned `None`.
    pub oom_count: u64,
}

/// The in-place header at the base of every fragment.
#[repr(C)]
struct FragmentHdr {
    /// The physically next fragment (higher address). `None` iff this is
    /// the last fragment of the arena.
    next: Option<NonNull<FragmentHdr>>,
    /// The physically previous fragment. `None` iff this is the first.
    prev: Option<NonNull<FragmentHdr>>,
    /// Total fragment size, header included. A multiple of
    /// [`FRAGMENT_SIZE_MIN`] within `FRAGMENT_SIZE_MIN..=FRAGMENT_SIZE_MAX`.
    size: usize,
    /// Set while the fragment is owned by the caller.
    used: bool,
}

/// A free fragment: the header plus the segregated-list links that occupy
/// the first payload bytes while the fragment is not in use.
#[repr(C)]
struct FreeFragment {
    header: FragmentHdr,
    next_free: Option<NonNull<FreeFragment>>,
    prev_free: Option<NonNull<FreeFragment>>,
}

/// Maps a fragment size to its segregated bin:
/// `⌊log₂(size / FRAGMENT_SIZE_MIN)⌋`.
///
/// Bin *i* therefore holds exactly the free fragments whose size lies in
/// `FRAGMENT_SIZE_MIN << i .. FRAGMENT_SIZE_MIN << (i + 1)`.
#[inline]
fn bin_index(size: usize) -> u32 {
    debug_assert!(size >= FRAGMENT_SIZE_MIN);
    debug_assert!(size % FRAGMENT_SIZE_MIN == 0);
    log2_floor(size / FRAGMENT_SIZE_MIN)
}

#[doc = svgbobdoc::transform!(
/// The allocator instance. One per arena, placement-constructed at the front
/// of the arena by [`Heap::init`].
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///                            ,-----+-----+-----+-----+-----+-----,
///       "nonempty_bin_mask"  |  0  |  0  |  1  |  0  |  1  |  0  |  one bit per bin
///                            +-----+-----+-----+-----+-----+-----+
///         bin min size, "M"  | 2⁵M | 2⁴M | 2³M | 2²M | 2¹M | 2⁰M |  "M = FRAGMENT_SIZE_MIN"
///                            +-----+-----+-----+-----+-----+-----+
///                 "bins[..]" |     |     |  o  |     |  o  |     |
///                            '-----+-----+--+--+-----+--+--+-----'
///                                         |           |
///                                         |           |  "next_free / prev_free"
///                                         v           v
///                                     ,-------,   ,-------,   ,-------,
///                                     | frag  |   | frag  +-->| frag  |
///                                     '-------'   '-------'<--'-------'
/// ```
/// </center>
///
/// Independent of the bins, every fragment (free or used) sits on a doubly
/// linked *physical-order* list threaded through the fragment headers in
/// ascending address order. Allocation splits the tail off a fragment into a
/// new physical neighbor; deallocation merges a freed fragment with whichever
/// neighbors are free, so no two adjacent free fragments ever exist.
///
/// # Concurrency
///
/// A `Heap` performs no synchronization of its own and is neither `Send` nor
/// `Sync`. The hook pair passed to [`Heap::init`] brackets every public
/// operation; a caller that shares the instance across execution contexts
/// must make those hooks suspend the competing contexts (mask interrupts,
/// take a spinlock, and so on). Nested calls into the allocator from within
/// a hook are forbidden.
)]
#[derive(Debug)]
pub struct Heap {
    /// `bins[i]` heads the list of free fragments in bin *i*.
    bins: [Option<NonNull<FreeFragment>>; BIN_COUNT],
    /// Bit *i* is set iff `bins[i]` is non-empty. This is what makes bin
    /// selection two machine instructions instead of a scan.
    nonempty_bin_mask: usize,
    critical_section_enter: Option<Hook>,
    critical_section_leave: Option<Hook>,
    diagnostics: Diagnostics,
}

impl Heap {
    /// Constructs an allocator instance at the front of the arena
    /// `base..base + size` and hands back a pointer to it.
    ///
    /// `base` is rounded up to [`ALIGNMENT`] first; it only needs to carry
    /// the platform's natural pointer alignment. After the instance, the
    /// remaining space is rounded down to a multiple of
    /// [`FRAGMENT_SIZE_MIN`] (and capped at [`FRAGMENT_SIZE_MAX`]) and
    /// becomes the arena body, initially one single free fragment.
    ///
    /// The hooks, if given, are invoked at the entry and exit of every
    /// subsequent operation on the instance.
    ///
    /// Returns `None` when `base` is null or the arena cannot hold the
    /// instance plus one minimal fragment.
    ///
    /// # Time Complexity
    ///
    /// This method completes in constant time.
    ///
    /// # Safety
    ///
    /// `base..base + size` must be valid for reads and writes and must not
    /// be accessed except through this allocator for as long as the
    /// instance is in use.
    pub unsafe fn init(
        base: *mut u8,
        size: usize,
        critical_section_enter: Option<Hook>,
        critical_section_leave: Option<Hook>,
    ) -> Option<NonNull<Heap>> {
        if base.is_null() {
            return None;
        }

        // Round the base up to the fragment alignment.
        let unaligned_start = base as usize;
        let start = unaligned_start.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1);
        let size = size.checked_sub(start - unaligned_start)?;

        if size < INSTANCE_SIZE_PADDED + FRAGMENT_SIZE_MIN {
            return None;
        }

        let mut capacity = size - INSTANCE_SIZE_PADDED;
        if capacity > FRAGMENT_SIZE_MAX {
            capacity = FRAGMENT_SIZE_MAX;
        }
        capacity -= capacity % FRAGMENT_SIZE_MIN;
        debug_assert!(capacity >= FRAGMENT_SIZE_MIN);
        debug_assert!(capacity % FRAGMENT_SIZE_MIN == 0);

        let heap = start as *mut Heap;

        // Safety: `start` is `ALIGNMENT`-aligned and the preceding size
        // check guarantees the instance and the first fragment fit in the
        // caller's arena.
        unsafe {
            heap.write(Heap {
                bins: [None; BIN_COUNT],
                nonempty_bin_mask: 0,
                critical_section_enter,
                critical_section_leave,
                diagnostics: Diagnostics {
                    capacity,
                    ..Diagnostics::default()
                },
            });

            let mut first: NonNull<FreeFragment> =
                NonNull::new_unchecked((start + INSTANCE_SIZE_PADDED) as *mut FreeFragment);
            first.as_mut().header = FragmentHdr {
                next: None,
                prev: None,
                size: capacity,
                used: false,
            };
            (*heap).link_free_fragment(first);

            Some(NonNull::new_unchecked(heap))
        }
    }

    /// Allocates `amount` bytes of `ALIGNMENT`-aligned storage.
    ///
    /// Returns `None` when no free fragment is large enough, when `amount`
    /// is zero, or when the rounded fragment size is not representable.
    /// Every failure is counted in [`Diagnostics::oom_count`].
    ///
    /// # Time Complexity
    ///
    /// This method completes in constant time: the segregated-bin bitmask
    /// reduces the search for the smallest suitable fragment to a pair of
    /// bit-scan instructions, and the subsequent split touches a fixed
    /// number of headers.
    pub fn allocate(&mut self, amount: usize) -> Option<NonNull<u8>> {
        let _cs = CriticalSection::enter(self.critical_section_enter, self.critical_section_leave);

        if self.diagnostics.peak_request_size < amount {
            self.diagnostics.peak_request_size = amount;
        }

        let out = self.try_allocate(amount);
        if out.is_none() {
            self.diagnostics.oom_count += 1;
        }
        out
    }

    /// [`Heap::allocate`] minus the critical section and the failure
    /// counter.
    fn try_allocate(&mut self, amount: usize) -> Option<NonNull<u8>> {
        // The allocator never vends zero-sized regions.
        if amount == 0 {
            return None;
        }

        // Round the payload plus its header up to the next power of two,
        // with `FRAGMENT_SIZE_MIN` as the floor. A sum that is not
        // representable cannot be satisfied either.
        let unrounded = amount.checked_add(ALIGNMENT)?;
        if unrounded > FRAGMENT_SIZE_MAX {
            return None;
        }
        let fragment_size = if unrounded <= FRAGMENT_SIZE_MIN {
            FRAGMENT_SIZE_MIN
        } else {
            pow2(log2_ceil(unrounded))
        };
        debug_assert!(fragment_size % FRAGMENT_SIZE_MIN == 0);

        // The smallest bin every member of which fits the request, and the
        // set of non-empty bins at least that large.
        let optimal_bin = log2_ceil(fragment_size / FRAGMENT_SIZE_MIN);
        debug_assert!((optimal_bin as usize) < BIN_COUNT);
        let candidate_mask = self.nonempty_bin_mask & (usize::MAX << optimal_bin);
        if candidate_mask == 0 {
            return None;
        }

        // Isolating the lowest set bit picks the smallest suitable bin.
        // This is the only "search" the allocator ever performs.
        let smallest_bin_mask = candidate_mask & candidate_mask.wrapping_neg();
        let bin = log2_floor(smallest_bin_mask) as usize;

        let mut frag = self.bins[bin].expect("nonempty bin mask out of sync");

        // Safety: bin heads always point at live free fragments inside the
        // arena, and the physical-order neighbors reached below are live
        // headers by invariant.
        unsafe {
            debug_assert!(!frag.as_ref().header.used);
            debug_assert!(frag.as_ref().header.size >= fragment_size);
            debug_assert!(frag.as_ref().prev_free.is_none());

            // Unlink the bin head; its `prev_free` is known to be `None`.
            self.bins[bin] = frag.as_ref().next_free;
            if let Some(mut next_free) = frag.as_ref().next_free {
                next_free.as_mut().prev_free = None;
            } else {
                self.nonempty_bin_mask &= !smallest_bin_mask;
            }

            // Split the unused tail off into a new free fragment. The
            // remainder goes on the high side, which keeps the physical
            // list address-ordered.
            let leftover = frag.as_ref().header.size - fragment_size;
            if leftover >= FRAGMENT_SIZE_MIN {
                let mut remainder: NonNull<FreeFragment> =
                    NonNull::new_unchecked(frag.as_ptr().cast::<u8>().add(fragment_size)).cast();
                remainder.as_mut().header = FragmentHdr {
                    next: frag.as_ref().header.next,
                    prev: Some(frag.cast()),
                    size: leftover,
                    used: false,
                };
                if let Some(mut next) = frag.as_ref().header.next {
                    next.as_mut().prev = Some(remainder.cast());
                }
                frag.as_mut().header.next = Some(remainder.cast());
                frag.as_mut().header.size = fragment_size;
                self.link_free_fragment(remainder);
            }

            frag.as_mut().header.used = true;

            self.diagnostics.allocated += fragment_size;
            if self.diagnostics.peak_allocated < self.diagnostics.allocated {
                self.diagnostics.peak_allocated = self.diagnostics.allocated;
            }

            Some(NonNull::new_unchecked(frag.as_ptr().cast::<u8>().add(ALIGNMENT)))
        }
    }

    /// Returns `ptr` to the arena. A null `ptr` is a no-op.
    ///
    /// The freed fragment is merged with its physical neighbors where they
    /// are free, so no two adjacent free fragments survive the call.
    ///
    /// # Time Complexity
    ///
    /// This method completes in constant time: at most two neighbors are
    /// examined and unlinked, and one fragment is re-binned.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer previously returned by
    /// [`Heap::allocate`] on this instance. Passing the same pointer twice
    /// without re-allocating it in between is tolerated as a no-op, but only
    /// as long as the fragment has not been coalesced away meanwhile;
    /// callers must not rely on it.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let _cs = CriticalSection::enter(self.critical_section_enter, self.critical_section_leave);

        debug_assert!(ptr as usize % ALIGNMENT == 0, "foreign or corrupted pointer");

        // Safety: per the contract, `ptr` came out of `allocate` on this
        // instance, so the fragment header sits `ALIGNMENT` bytes below it.
        let mut frag: NonNull<FragmentHdr> =
            unsafe { NonNull::new_unchecked(ptr.sub(ALIGNMENT)).cast() };

        // Safety: the header recovered above is live; every physical or
        // free-list neighbor reached from it is a live header by invariant.
        unsafe {
            debug_assert!(frag.as_ref().size >= FRAGMENT_SIZE_MIN);
            debug_assert!(frag.as_ref().size <= FRAGMENT_SIZE_MAX);
            debug_assert!(frag.as_ref().size % FRAGMENT_SIZE_MIN == 0);

            // Tolerate a repeated `free` of the same fragment.
            if !frag.as_ref().used {
                return;
            }

            frag.as_mut().used = false;
            self.diagnostics.allocated -= frag.as_ref().size;

            // Merge into the left neighbor if it is free. The neighbor keeps
            // its base address; `frag` ceases to exist.
            if let Some(mut prev) = frag.as_ref().prev {
                if !prev.as_ref().used {
                    self.unlink_free_fragment(prev.cast());
                    prev.as_mut().size += frag.as_ref().size;
                    prev.as_mut().next = frag.as_ref().next;
                    if let Some(mut next) = frag.as_ref().next {
                        next.as_mut().prev = Some(prev);
                    }
                    frag = prev;
                }
            }

            // Merge the right neighbor into `frag` if it is free.
            if let Some(mut next) = frag.as_ref().next {
                if !next.as_ref().used {
                    self.unlink_free_fragment(next.cast());
                    frag.as_mut().size += next.as_ref().size;
                    frag.as_mut().next = next.as_ref().next;
                    if let Some(mut new_next) = next.as_ref().next {
                        new_next.as_mut().prev = Some(frag);
                    }
                }
            }

            self.link_free_fragment(frag.cast());
        }
    }

    /// Takes a snapshot of the diagnostic counters.
    ///
    /// The snapshot is taken under the critical section, so it is
    /// self-consistent even when other execution contexts mutate the heap,
    /// provided the hook pair suspends them.
    pub fn diagnostics(&self) -> Diagnostics {
        let _cs = CriticalSection::enter(self.critical_section_enter, self.critical_section_leave);
        self.diagnostics
    }

    /// Checks the internal invariants that are verifiable in bounded time:
    /// the diagnostic counters' mutual consistency, the agreement between
    /// `nonempty_bin_mask` and the bins, and the well-formedness of every
    /// bin head.
    ///
    /// Returns `false` when the instance is corrupt, typically the aftermath
    /// of a heap overrun or a foreign `free`. Intended for watchdog and
    /// self-test use; the work is proportional to the number of bins, never
    /// to the arena state.
    pub fn check_invariants(&self) -> bool {
        let _cs = CriticalSection::enter(self.critical_section_enter, self.critical_section_leave);

        let d = &self.diagnostics;
        let mut valid = d.capacity >= FRAGMENT_SIZE_MIN
            && d.capacity <= FRAGMENT_SIZE_MAX
            && d.capacity % FRAGMENT_SIZE_MIN == 0;
        valid = valid && d.allocated <= d.capacity && d.allocated % FRAGMENT_SIZE_MIN == 0;
        valid = valid
            && d.peak_allocated >= d.allocated
            && d.peak_allocated <= d.capacity
            && d.peak_allocated % FRAGMENT_SIZE_MIN == 0;
        valid = valid && (d.peak_request_size <= d.capacity || d.oom_count > 0);

        for (bin, head) in self.bins.iter().enumerate() {
            let mask_bit_set = self.nonempty_bin_mask & pow2(bin as u32) != 0;
            match head {
                Some(head) => {
                    // Safety: bin heads always point at live free fragments
                    // inside the arena.
                    let frag = unsafe { head.as_ref() };
                    let size_valid = frag.header.size >= FRAGMENT_SIZE_MIN
                        && frag.header.size <= FRAGMENT_SIZE_MAX
                        && frag.header.size % FRAGMENT_SIZE_MIN == 0;
                    valid = valid
                        && mask_bit_set
                        && !frag.header.used
                        && frag.prev_free.is_none()
                        && size_valid
                        && bin_index(frag.header.size) as usize == bin;
                }
                None => {
                    valid = valid && !mask_bit_set;
                }
            }
        }

        valid
    }

    /// Pushes `frag` onto the head of the bin for its size and marks the
    /// bin non-empty.
    ///
    /// # Safety
    ///
    /// `frag` must point at a fragment of this arena whose header is valid
    /// and whose `used` flag is clear, and it must not currently be on any
    /// free list.
    #[inline]
    unsafe fn link_free_fragment(&mut self, mut frag: NonNull<FreeFragment>) {
        // Safety: upheld by the caller.
        unsafe {
            debug_assert!(!frag.as_ref().header.used);
            let bin = bin_index(frag.as_ref().header.size) as usize;

            let head = self.bins[bin];
            frag.as_mut().next_free = head;
            frag.as_mut().prev_free = None;
            if let Some(mut head) = head {
                head.as_mut().prev_free = Some(frag);
            }
            self.bins[bin] = Some(frag);
            self.nonempty_bin_mask |= pow2(bin as u32);
        }
    }

    /// Removes `frag` from the free list it is on, clearing the bin's mask
    /// bit if the bin becomes empty.
    ///
    /// # Safety
    ///
    /// `frag` must be on the free list that matches its current header
    /// size.
    #[inline]
    unsafe fn unlink_free_fragment(&mut self, frag: NonNull<FreeFragment>) {
        // Safety: upheld by the caller.
        unsafe {
            let next_free = frag.as_ref().next_free;
            let prev_free = frag.as_ref().prev_free;

            if let Some(mut next_free) = next_free {
                next_free.as_mut().prev_free = prev_free;
            }

            if let Some(mut prev_free) = prev_free {
                prev_free.as_mut().next_free = next_free;
            } else {
                let bin = bin_index(frag.as_ref().header.size) as usize;
                debug_assert!(self.bins[bin].map(NonNull::as_ptr) == Some(frag.as_ptr()));
                self.bins[bin] = next_free;
                if next_free.is_none() {
                    self.nonempty_bin_mask &= !pow2(bin as u32);
                }
            }
        }
    }
}
