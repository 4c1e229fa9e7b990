//! Multi-instance synchronization primitives.
//!
//! Three mechanisms cooperate to let several scheduler instances share one
//! graph image:
//!
//! * the per-node *collision byte* in the arc descriptor (best-effort lock,
//!   see [`crate::arc::ArcHandle::try_lock`]), whose raw byte operations
//!   live here so the services dispatcher can expose them to platforms;
//! * a Lamport bakery ticket lock for platforms with multiple non-coherent
//!   caches, each participant writing only its own cache-line-sized slot;
//! * the reset barrier: every instance walks INIT → START → DONE locally
//!   and is promoted to DONE_SYNC only once all of its siblings reached
//!   DONE.

use core::sync::atomic::{fence, AtomicU32, AtomicU8, Ordering};

/// Maximum number of scheduler instances reading one graph.
pub const MAX_INSTANCES: usize = 4;

/// Reset progression of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResetState {
    /// Instance object exists, RESET not started.
    Init = 0,
    /// RESET in progress.
    Start = 1,
    /// Own RESET finished, waiting for siblings.
    Done = 2,
    /// Every sibling reached [`ResetState::Done`]; RUN may proceed.
    DoneSync = 3,
}

impl ResetState {
    pub fn from_raw(raw: u32) -> ResetState {
        match raw & 0b11 {
            0 => ResetState::Init,
            1 => ResetState::Start,
            2 => ResetState::Done,
            _ => ResetState::DoneSync,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw byte cell operations (internal service group)

/// Write `whoami` to the byte cell, publish, and read it back. Returns
/// `true` when the cell still carries `whoami`, i.e. no other writer
/// stomped it between the store and the load.
///
/// # Safety
/// `addr` must point to a byte that is only ever accessed atomically.
pub(crate) unsafe fn write_byte_and_check(addr: usize, whoami: u8) -> bool {
    let cell = &*(addr as *const AtomicU8);
    cell.store(whoami, Ordering::SeqCst);
    fence(Ordering::SeqCst);
    cell.load(Ordering::SeqCst) == whoami
}

/// # Safety
/// See [`write_byte_and_check`].
pub(crate) unsafe fn write_byte(addr: usize, value: u8) {
    let cell = &*(addr as *const AtomicU8);
    cell.store(value, Ordering::SeqCst);
    fence(Ordering::SeqCst);
}

/// # Safety
/// See [`write_byte_and_check`].
pub(crate) unsafe fn read_byte(addr: usize) -> u8 {
    fence(Ordering::SeqCst);
    (*(addr as *const AtomicU8)).load(Ordering::SeqCst)
}

/// # Safety
/// See [`write_byte_and_check`].
pub(crate) unsafe fn clear_bit(addr: usize, bit: u32) {
    let cell = &*(addr as *const AtomicU8);
    cell.fetch_and(!(1u8 << bit), Ordering::SeqCst);
}

// ---------------------------------------------------------------------------
// Bakery lock

/// One participant's slot, padded to a cache line so that slot writes never
/// share a line between threads on write-back caches without coherency.
#[repr(align(64))]
#[derive(Default)]
struct BakerySlot {
    choosing: AtomicU32,
    number: AtomicU32,
}

/// Lamport bakery mutex for up to [`MAX_INSTANCES`] participants.
///
/// `try_lock` is polled, not blocking: the scheduler never spins inside the
/// core, it skips the contended resource and returns to the node loop.
pub struct BakeryLock {
    slots: [BakerySlot; MAX_INSTANCES],
}

impl Default for BakeryLock {
    fn default() -> Self {
        BakeryLock::new()
    }
}

impl BakeryLock {
    pub fn new() -> BakeryLock {
        BakeryLock {
            slots: Default::default(),
        }
    }

    fn max_ticket(&self) -> u32 {
        self.slots
            .iter()
            .map(|s| s.number.load(Ordering::SeqCst))
            .max()
            .unwrap_or(0)
    }

    /// Attempt to take the lock for participant `me`: sweep every other
    /// slot, and retry the whole sweep up to `max_polls` times before
    /// withdrawing the ticket. A sweep fails the moment it observes a
    /// competitor that is choosing or holds a better ticket.
    pub fn try_lock(&self, me: usize, max_polls: u32) -> bool {
        assert!(me < MAX_INSTANCES);
        let slot = &self.slots[me];

        slot.choosing.store(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        let my_ticket = 1 + self.max_ticket();
        slot.number.store(my_ticket, Ordering::SeqCst);
        slot.choosing.store(0, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        for _ in 0..max_polls {
            let mut clear = true;
            for (other, other_slot) in self.slots.iter().enumerate() {
                if other == me {
                    continue;
                }
                let choosing = other_slot.choosing.load(Ordering::SeqCst);
                let number = other_slot.number.load(Ordering::SeqCst);
                if choosing != 0 || (number != 0 && (number, other) < (my_ticket, me)) {
                    clear = false;
                    break;
                }
            }
            if clear {
                return true;
            }
            core::hint::spin_loop();
        }

        slot.number.store(0, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        false
    }

    pub fn unlock(&self, me: usize) {
        assert!(me < MAX_INSTANCES);
        self.slots[me].number.store(0, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }
}
