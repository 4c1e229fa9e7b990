//! Ring-buffer arc descriptors and the operations on them.
//!
//! An arc is a single-producer single-consumer byte FIFO between two nodes
//! (or between a device driver and a node). Its descriptor is five words in
//! shared RAM:
//!
//! ```text
//! word 0  BASE   [HIGH_QOS 1 | MPFLUSH 2 | packed buffer base 29]
//! word 1  SIZE   [.. | RESET_DONE 1 | NEW_PARAM 1 | buffer bytes 24]
//! word 2  READ   [collision byte 8 | read index 24]
//! word 3  WRITE  [.. | ALIGN_BLOCKED 1 | write index 24]
//! word 4  FMT    [.. | script 10 | consumer format 8 | producer format 8]
//! ```
//!
//! Invariant: `0 <= read <= write <= size`. Data is written at `write`,
//! consumed at `read`; nothing wraps. When the tail of the buffer becomes
//! smaller than one producer frame the producer raises ALIGN_BLOCKED and the
//! consumer shifts the pending bytes down to the base address.
//!
//! Descriptors are shared between scheduler instances on different
//! processors, so every mutation is an atomic read-modify-write and the
//! MPFLUSH flag gates acquire/release fencing plus cache maintenance, in the
//! same shape as a perf-event ring buffer's head/tail protocol.

use core::sync::atomic::{fence, AtomicU32, Ordering};

use crate::bits::{field, with_field};
use crate::error::Error;
use crate::packed::{BankTable, PackedAddr};
use crate::platform::Platform;

/// Words per arc descriptor.
pub const ARC_DESC_WORDS: usize = 5;

/// Direction bit of an arc reference in a node header: set means the arc is
/// an output (TX) of that node.
pub const ARC_REF_TX: u16 = 0x0800;

/// Mask extracting the arc id from a node header arc reference.
pub const ARC_REF_ID_MASK: u16 = 0x07FF;

/// Arc id reserved for "unused".
pub const ARC_ID_UNUSED: u16 = 0x07FF;

const BASE: usize = 0;
const SIZE: usize = 1;
const READ: usize = 2;
const WRITE: usize = 3;
const FMT: usize = 4;

const HIGH_QOS_BIT: u32 = 1 << 31;
const MPFLUSH_MASK: u32 = 0b11 << 29;
const RESET_DONE_BIT: u32 = 1 << 25;
const NEW_PARAM_BIT: u32 = 1 << 24;
const ALIGN_BLOCKED_BIT: u32 = 1 << 24;
const INDEX_MASK: u32 = 0x00FF_FFFF;
const COLLISION_SHIFT: u32 = 24;

const SCRIPT_MSB: u32 = 25;
const SCRIPT_LSB: u32 = 16;
const CONSUMER_FMT_MSB: u32 = 15;
const CONSUMER_FMT_LSB: u32 = 8;
const PRODUCER_FMT_MSB: u32 = 7;
const PRODUCER_FMT_LSB: u32 = 0;

/// Optional flags of an arc, encoded in the BASE word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArcFlags {
    /// Run the node as soon as this arc is ready, regardless of the others.
    pub high_qos: bool,
    /// Descriptor and buffer are shared with a non-coherent observer.
    pub mp_flush: bool,
}

/// Assemble the five descriptor words of an idle arc.
pub fn descriptor_words(
    base: PackedAddr,
    size: usize,
    producer_fmt: u8,
    consumer_fmt: u8,
    flags: ArcFlags,
) -> [u32; ARC_DESC_WORDS] {
    let mut w0 = base.word();
    if flags.high_qos {
        w0 |= HIGH_QOS_BIT;
    }
    if flags.mp_flush {
        w0 |= 1 << 29;
    }
    let mut w4 = 0;
    w4 = with_field(w4, CONSUMER_FMT_MSB, CONSUMER_FMT_LSB, consumer_fmt as u32);
    w4 = with_field(w4, PRODUCER_FMT_MSB, PRODUCER_FMT_LSB, producer_fmt as u32);
    [w0, size as u32 & INDEX_MASK, 0, 0, w4]
}

/// The arcs section of the graph, viewed as atomic words in shared RAM.
#[derive(Debug, Clone, Copy)]
pub struct ArcTable {
    base: *const AtomicU32,
    count: usize,
}

// The table points into application-owned bank RAM that outlives the
// runtime; all access goes through atomic operations.
unsafe impl Send for ArcTable {}
unsafe impl Sync for ArcTable {}

impl ArcTable {
    /// Build a table over `words` words of RAM at `addr`.
    ///
    /// # Safety
    /// `addr` must point to at least `words * 4` bytes of readable and
    /// writable memory, 4-byte aligned, that stays valid for the lifetime of
    /// the table.
    pub unsafe fn from_raw(addr: usize, words: usize) -> ArcTable {
        ArcTable {
            base: addr as *const AtomicU32,
            count: words / ARC_DESC_WORDS,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn arc(&self, id: u16) -> ArcHandle<'_> {
        let id = (id & ARC_REF_ID_MASK) as usize;
        assert!(id < self.count, "arc id {id} out of range");
        let words = unsafe {
            core::slice::from_raw_parts(self.base.add(id * ARC_DESC_WORDS), ARC_DESC_WORDS)
        };
        ArcHandle { words }
    }
}

/// One arc descriptor.
#[derive(Clone, Copy)]
pub struct ArcHandle<'a> {
    words: &'a [AtomicU32],
}

impl<'a> ArcHandle<'a> {
    #[inline]
    fn load(&self, w: usize) -> u32 {
        self.words[w].load(Ordering::Acquire)
    }

    #[inline]
    fn update(&self, w: usize, f: impl Fn(u32) -> u32) -> u32 {
        let mut out = 0;
        self.words[w]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                out = f(v);
                Some(out)
            })
            .expect("arc word update cannot fail");
        out
    }

    // --- descriptor fields -------------------------------------------------

    pub fn base_packed(&self) -> PackedAddr {
        PackedAddr::from_word(self.load(BASE))
    }

    pub fn high_qos(&self) -> bool {
        self.load(BASE) & HIGH_QOS_BIT != 0
    }

    pub fn mp_flush(&self) -> bool {
        self.load(BASE) & MPFLUSH_MASK != 0
    }

    pub fn size(&self) -> usize {
        (self.load(SIZE) & INDEX_MASK) as usize
    }

    pub fn read_index(&self) -> usize {
        (self.load(READ) & INDEX_MASK) as usize
    }

    pub fn write_index(&self) -> usize {
        (self.load(WRITE) & INDEX_MASK) as usize
    }

    /// Bytes available for the consumer.
    pub fn available(&self) -> usize {
        self.write_index().saturating_sub(self.read_index())
    }

    /// Bytes of free tail for the producer.
    pub fn free_space(&self) -> usize {
        self.size().saturating_sub(self.write_index())
    }

    pub fn producer_format(&self) -> u8 {
        field(self.load(FMT), PRODUCER_FMT_MSB, PRODUCER_FMT_LSB) as u8
    }

    pub fn consumer_format(&self) -> u8 {
        field(self.load(FMT), CONSUMER_FMT_MSB, CONSUMER_FMT_LSB) as u8
    }

    pub fn script(&self) -> u16 {
        field(self.load(FMT), SCRIPT_MSB, SCRIPT_LSB) as u16
    }

    pub fn alignment_blocked(&self) -> bool {
        self.load(WRITE) & ALIGN_BLOCKED_BIT != 0
    }

    pub fn reset_done(&self) -> bool {
        self.load(SIZE) & RESET_DONE_BIT != 0
    }

    pub fn set_reset_done(&self) {
        self.update(SIZE, |v| v | RESET_DONE_BIT);
    }

    pub fn new_param(&self) -> bool {
        self.load(SIZE) & NEW_PARAM_BIT != 0
    }

    pub fn set_new_param(&self) {
        self.update(SIZE, |v| v | NEW_PARAM_BIT);
    }

    pub fn clear_new_param(&self) {
        self.update(SIZE, |v| v & !NEW_PARAM_BIT);
    }

    /// Clear indices and state flags, keeping base, size, formats and QoS.
    /// Used when STOP is followed by a fresh RESET.
    pub fn clear_state(&self) {
        self.update(SIZE, |v| v & !(RESET_DONE_BIT | NEW_PARAM_BIT));
        self.update(READ, |_| 0);
        self.update(WRITE, |_| 0);
    }

    // --- collision byte ----------------------------------------------------

    /// Attempt to take single-owner custody of the node attached to this
    /// arc: check the byte is free, write our signature, publish it, and
    /// read it back. A mismatch on the read-back means another instance
    /// stomped the byte between the store and the load.
    pub fn try_lock(&self, whoami: u8) -> bool {
        debug_assert!(whoami != 0, "instance signature 0 means unlocked");
        if self.lock_owner() != 0 {
            return false;
        }
        self.update(READ, |v| {
            (v & INDEX_MASK) | ((whoami as u32) << COLLISION_SHIFT)
        });
        fence(Ordering::SeqCst);
        self.lock_owner() == whoami
    }

    /// Confirm the collision byte still carries our signature. Cheap second
    /// check between lock acquisition and node entry.
    pub fn still_locked(&self, whoami: u8) -> bool {
        fence(Ordering::SeqCst);
        self.lock_owner() == whoami
    }

    pub fn unlock(&self) {
        self.update(READ, |v| v & INDEX_MASK);
        fence(Ordering::SeqCst);
    }

    pub fn lock_owner(&self) -> u8 {
        (self.load(READ) >> COLLISION_SHIFT) as u8
    }

    // --- flow --------------------------------------------------------------

    /// `(ok, free_bytes)`: can the producer deposit one frame? A frame size
    /// of zero means "any amount" and is always ready.
    pub fn ready_for_write(&self, producer_frame: usize) -> (bool, usize) {
        let free = self.free_space();
        (free >= producer_frame, free)
    }

    /// `(ok, available_bytes)`: can the consumer take one frame?
    pub fn ready_for_read(&self, consumer_frame: usize) -> (bool, usize) {
        let avail = self.available();
        (avail >= consumer_frame, avail)
    }

    pub fn read_address(&self, banks: &BankTable) -> Result<usize, Error> {
        Ok(banks.to_linear(self.base_packed())? + self.read_index())
    }

    pub fn write_address(&self, banks: &BankTable) -> Result<usize, Error> {
        Ok(banks.to_linear(self.base_packed())? + self.write_index())
    }

    /// Commit `n` produced bytes and refresh the alignment-blocked flag.
    pub fn advance_write(&self, n: usize, producer_frame: usize) {
        self.update(WRITE, |v| {
            let idx = (v & INDEX_MASK) + n as u32;
            (v & !INDEX_MASK) | (idx & INDEX_MASK)
        });
        self.update_alignment_bit(producer_frame);
    }

    /// Consume `n` bytes; realign to base when the producer can no longer
    /// fit a frame in the tail.
    pub fn advance_read(
        &self,
        n: usize,
        producer_frame: usize,
        banks: &BankTable,
    ) -> Result<(), Error> {
        self.update(READ, |v| {
            let idx = (v & INDEX_MASK) + n as u32;
            (v & !INDEX_MASK) | (idx & INDEX_MASK)
        });
        if self.write_index() + producer_frame > self.size() {
            self.realign_to_base(producer_frame, banks)?;
        }
        Ok(())
    }

    /// Raise ALIGN_BLOCKED when the tail is smaller than one producer
    /// frame; drop it again once room reappears.
    pub fn update_alignment_bit(&self, producer_frame: usize) {
        if self.write_index() + producer_frame > self.size() {
            self.update(WRITE, |v| v | ALIGN_BLOCKED_BIT);
        } else if self.alignment_blocked() {
            self.update(WRITE, |v| v & !ALIGN_BLOCKED_BIT);
        }
    }

    /// Shift the pending bytes `[read, write)` down to the buffer base and
    /// rewind the indices. Only the consumer side runs this, and only while
    /// the producer is blocked, so the data cannot move under the producer.
    pub fn realign_to_base(&self, producer_frame: usize, banks: &BankTable) -> Result<(), Error> {
        let read = self.read_index();
        if read != 0 {
            let write = self.write_index();
            let len = write - read;
            if len > 0 {
                let base = banks.to_linear(self.base_packed())?;
                unsafe {
                    core::ptr::copy((base + read) as *const u8, base as *mut u8, len);
                }
            }
            self.update(READ, |v| v & !INDEX_MASK);
            self.update(WRITE, |v| (v & !INDEX_MASK) | (len as u32 & INDEX_MASK));
        }
        self.update_alignment_bit(producer_frame);
        Ok(())
    }

    /// Exchange `n` bytes at the read position with an external buffer.
    /// Backs the SWAP memory-segment option, where a node borrows an arc
    /// buffer as fast working memory for the duration of one call.
    pub fn swap_with(&self, buffer: *mut u8, n: usize, banks: &BankTable) -> Result<(), Error> {
        let addr = self.read_address(banks)?;
        unsafe {
            core::ptr::swap_nonoverlapping(addr as *mut u8, buffer, n);
        }
        Ok(())
    }

    /// Point the arc at a driver-owned buffer, replacing base and size and
    /// resetting the indices.
    pub fn rebase(
        &self,
        addr: usize,
        size: usize,
        read: usize,
        write: usize,
        banks: &BankTable,
    ) -> Result<(), Error> {
        let packed = banks.to_packed(addr)?;
        self.update(BASE, |v| {
            (v & (HIGH_QOS_BIT | MPFLUSH_MASK)) | packed.word()
        });
        self.update(SIZE, |v| (v & !INDEX_MASK) | (size as u32 & INDEX_MASK));
        self.update(READ, |v| (v & !INDEX_MASK) | (read as u32 & INDEX_MASK));
        self.update(WRITE, |v| (v & !INDEX_MASK) | (write as u32 & INDEX_MASK));
        Ok(())
    }

    // --- multiprocessor cache discipline ----------------------------------

    /// Before reading on a non-coherent observer: invalidate descriptor and
    /// buffer, then fence.
    pub fn mp_acquire(&self, platform: &dyn Platform, banks: &BankTable) {
        if !self.mp_flush() {
            return;
        }
        platform.invalidate(self.words.as_ptr() as usize, ARC_DESC_WORDS * 4);
        if let Ok(base) = banks.to_linear(self.base_packed()) {
            platform.invalidate(base, self.size());
        }
        fence(Ordering::Acquire);
    }

    /// After writing on a non-coherent observer: fence, then clean
    /// descriptor and buffer.
    pub fn mp_release(&self, platform: &dyn Platform, banks: &BankTable) {
        if !self.mp_flush() {
            return;
        }
        fence(Ordering::Release);
        platform.clean(self.words.as_ptr() as usize, ARC_DESC_WORDS * 4);
        if let Ok(base) = banks.to_linear(self.base_packed()) {
            platform.clean(base, self.size());
        }
    }
}
