//! A constant-time dynamic memory allocator for hard real-time and
//! safety-critical embedded systems.
//!
//! The allocator manages a single contiguous arena supplied by the caller at
//! initialization time. It never calls into the operating system and has no
//! dependency on a system heap; the entire state, including the allocator
//! instance itself, lives inside the arena. Both [`Heap::allocate`] and
//! [`Heap::free`] complete in a bounded number of steps independent of the
//! arena state, making the worst-case execution time suitable for static
//! WCET analysis.
//!
//! # Properties
//!
//!  - Allocation and deallocation are *O(1)*: free fragments are kept in
//!    power-of-two segregated bins, and a one-machine-word bitmask plus a
//!    count-leading-zeros primitive selects the best bin without searching.
//!
//!  - Fragments are coalesced with their free physical neighbors eagerly on
//!    every [`Heap::free`], so no two adjacent free fragments ever exist and
//!    the worst-case external fragmentation is deterministic.
//!
//!  - Allocation sizes are rounded up to powers of two. This buys the
//!    unconditional "any fragment in bin *i* satisfies any request routed to
//!    bin *i*" invariant at the cost of up to 2× internal fragmentation,
//!    the usual bargain for predictable real-time behavior.
//!
//!  - The allocator performs no locking of its own. An optional pair of
//!    critical-section hooks, invoked at the entry and exit of every public
//!    operation, lets the caller plug in whatever serialization mechanism is
//!    cheapest on the target (interrupt masking on a microcontroller, a
//!    spinlock on SMP).
//!
//! # Usage
//!
//! ```rust,no_run
//! use core::{mem::MaybeUninit, ptr::addr_of_mut};
//! use halffit::Heap;
//!
//! static mut ARENA: MaybeUninit<[u8; 65536]> = MaybeUninit::uninit();
//!
//! // Safety: `ARENA` is not accessed anywhere else.
//! let mut handle = unsafe { Heap::init(addr_of_mut!(ARENA).cast(), 65536, None, None) }
//!     .expect("the arena is too small");
//!
//! // Safety: the instance lives inside `ARENA` and is never aliased.
//! let heap = unsafe { handle.as_mut() };
//!
//! if let Some(payload) = heap.allocate(123) {
//!     // ... use the 123-byte region at `payload` ...
//!     // Safety: `payload` was returned by `allocate` on this instance.
//!     unsafe { heap.free(payload.as_ptr()) };
//! }
//! ```
//!
//! # Portability
//!
//! The crate is `no_std` and contains no architecture-specific code. The
//! allocation granularity and the number of segregated bins are derived from
//! the target's pointer width, so the same source supports 16-, 32- and
//! 64-bit targets.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

mod heap;
mod int;

pub use self::heap::{
    Diagnostics, Heap, Hook, ALIGNMENT, FRAGMENT_SIZE_MAX, FRAGMENT_SIZE_MIN,
};
