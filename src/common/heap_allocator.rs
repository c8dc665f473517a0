//! The boot-time heap is a linked list of disjoint memory regions, each carrying
//! a circular, doubly linked ring of free blocks.
//!
//! All sizes are counted in 'cells', where each cell is the size of 4 pointers
//! (16 bytes on 32-bit and 32 bytes on 64-bit). A cell is the same size as a
//! [`BlockHeader`]; the header for all blocks of memory, used or free. A block's
//! payload starts directly after its header, so an allocation of `n` payload
//! cells occupies `n + 1` cells.
//!
//! Free blocks of a region form a ring sorted by address; the region's
//! `first_free` points at the lowest-addressed element, or is `None` once the
//! region has been allocated dry. Headers are stamped with one of two magic
//! words so that a stray write over allocator metadata is caught on the next
//! touch instead of corrupting the heap silently.
//!
//! Each region maps every allocation [`Policy`] to a scan [`Strategy`], which
//! lets callers steer classes of allocations (for example firmware-visible
//! buffers) into specific physical regions while everything else stays out of
//! them.
//!
//! ## Initialization steps
//!
//! 1. Figure out which memory ranges are usable (done by the caller).
//! 2. Register each range: its region record and a single spanning free block
//!    are initialized in place, then the region is inserted into the heap's
//!    list, sorted by ascending length so small regions are consumed before
//!    large ones.

use core::{
    cmp, mem,
    ptr::{self, NonNull},
};

#[cfg(not(test))]
use log::{debug, error};
#[cfg(test)]
use std::{println as debug, println as error};

/// The size of a single 'cell' contained in a memory block.
const CELL_SIZE: usize = mem::size_of::<BlockHeader>();
/// The size of a [`Region`] record.
const REGION_HEADER_SIZE: usize = mem::size_of::<Region>();
/// The smallest registrable region.
const SMALLEST_REGION_SIZE: usize = 4 * CELL_SIZE;

/// These magic numbers are used to tell whether a block is free or allocated.
/// They also catch corruption; if a header's magic matches neither value,
/// another part of the program has overwritten allocator metadata, and the
/// only safe reaction at boot time is an immediate abort.
const FREE_MAGIC: usize = 0xf4ee_b10c;
const ALLOC_MAGIC: usize = 0xa110_c4ed;

/// Number of allocation-policy slots in each region's strategy table.
pub const POLICY_COUNT: usize = 2;

/// Number of pressure-relief stages tried before an allocation gives up.
const RELIEF_STAGES: usize = 2;

/// A memory class selected by the caller of an allocation.
///
/// Every region maps each policy to the [`Strategy`] it serves it with, or to
/// [`Strategy::Skip`] to decline it entirely.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Policy {
    /// General-purpose allocations.
    Default = 0,
    /// Allocations that must land in a low physical region, such as buffers
    /// that firmware needs to address.
    LowMemory = 1,
}

/// How a region scans its free ring for one [`Policy`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Strategy {
    /// Begin at the lowest-addressed free block and walk forward.
    First,
    /// Begin at the second free block and walk forward. This is the usual
    /// choice; it avoids biasing every allocation toward the lowest address,
    /// which keeps worst-case fragmentation down.
    Second,
    /// Begin at the highest-addressed free block and walk backward, placing
    /// each allocation as high inside its block as the alignment allows.
    Last,
    /// Decline to serve this policy.
    Skip,
}

/// Per-region strategy table, indexed by `Policy as usize`.
pub type PolicyTable = [Strategy; POLICY_COUNT];

/// A callback invoked when every region has declined an allocation.
///
/// Hooks run in stage order and may release memory by re-entering the heap
/// through [`Heap::release`]; the failed scan is retried after each stage.
pub type ReliefHook = fn(&mut Heap);

/// The fixed order in which pressure-relief hooks are tried.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReliefStage {
    /// First resort: drop disk caches.
    InvalidateCaches = 0,
    /// Second resort: unload modules nothing depends on.
    UnloadModules = 1,
}

/// The error type returned by failed heap operations.
///
/// Corruption is not an error value; a damaged heap aborts immediately
/// instead, since nothing can be trusted after metadata has been overwritten.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeapError {
    /// No region could serve the request, even after pressure relief.
    OutOfMemory,
    /// An array allocation's element count times element size overflowed.
    SizeOverflow,
}

/// The header preceding every block of memory, allocated or free.
///
/// A header is exactly one cell wide. `prev` and `next` are the free-ring
/// links and carry meaning only while the block is free; allocation leaves
/// them stale rather than clearing them, and they are rewritten when the
/// block reenters a ring.
#[repr(C)]
struct BlockHeader {
    prev: Option<NonNull<BlockHeader>>,
    next: Option<NonNull<BlockHeader>>,
    /// Size of this block in cells, including the header cell.
    cells: usize,
    magic: usize,
}

fn header_addr(block: NonNull<BlockHeader>) -> usize {
    block.as_ptr() as usize
}

/// # Safety
///
/// `addr` must be a cell-aligned, non-null address inside a registered region.
unsafe fn header_at(addr: usize) -> NonNull<BlockHeader> {
    NonNull::new_unchecked(addr as *mut BlockHeader)
}

unsafe fn payload_of(block: NonNull<BlockHeader>) -> NonNull<u8> {
    NonNull::new_unchecked(block.as_ptr().add(1) as *mut u8)
}

unsafe fn ring_next(block: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
    match (*block.as_ptr()).next {
        Some(next) => next,
        None => panic!("heap: null link in free ring at {:#x}", header_addr(block)),
    }
}

unsafe fn ring_prev(block: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
    match (*block.as_ptr()).prev {
        Some(prev) => prev,
        None => panic!("heap: null link in free ring at {:#x}", header_addr(block)),
    }
}

/// Rounds `value` up to a multiple of `align`, which must be a power of two.
fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Number of cells needed to hold `bytes` payload bytes.
fn cells_for(bytes: usize) -> Option<usize> {
    Some(bytes.checked_add(CELL_SIZE - 1)? / CELL_SIZE)
}

/// Converts a byte alignment into cells. Zero means natural cell alignment,
/// as does anything not coarser than a cell.
fn align_in_cells(align: usize) -> usize {
    debug_assert!(align == 0 || align.is_power_of_two());
    if align <= CELL_SIZE {
        1
    } else {
        align / CELL_SIZE
    }
}

/// A registered range of memory, holding its own record at its start.
#[repr(C)]
struct Region {
    /// Lowest-addressed element of the free ring, or `None` once the region
    /// is allocated dry.
    first_free: Option<NonNull<BlockHeader>>,
    next: Option<NonNull<Region>>,
    /// Cell-aligned start of the usable area.
    base: usize,
    /// Size of the usable area in bytes, a multiple of the cell size.
    size: usize,
    policies: PolicyTable,
}

impl Region {
    fn end(&self) -> usize {
        self.base + self.size
    }

    /// True if `addr` can be a payload address of this region. Payloads start
    /// one cell past their header, so `base` itself is excluded while the
    /// one-past-the-end address is not.
    fn contains(&self, addr: usize) -> bool {
        self.base < addr && addr <= self.end()
    }

    /// Removes `block` from the free ring.
    unsafe fn unlink(&mut self, block: NonNull<BlockHeader>) {
        let next = ring_next(block);
        if next == block {
            self.first_free = None;
            return;
        }
        let prev = ring_prev(block);
        (*prev.as_ptr()).next = Some(next);
        (*next.as_ptr()).prev = Some(prev);
        if self.first_free == Some(block) {
            self.first_free = Some(next);
        }
    }

    /// Hands `old`'s place in the ring over to `new`.
    unsafe fn replace(&mut self, old: NonNull<BlockHeader>, new: NonNull<BlockHeader>) {
        let next = ring_next(old);
        if next == old {
            (*new.as_ptr()).prev = Some(new);
            (*new.as_ptr()).next = Some(new);
        } else {
            let prev = ring_prev(old);
            (*new.as_ptr()).prev = Some(prev);
            (*new.as_ptr()).next = Some(next);
            (*prev.as_ptr()).next = Some(new);
            (*next.as_ptr()).prev = Some(new);
        }
        if self.first_free == Some(old) {
            self.first_free = Some(new);
        }
    }

    /// Splices `block` into the ring directly after `anchor`.
    unsafe fn insert_after(&mut self, anchor: NonNull<BlockHeader>, block: NonNull<BlockHeader>) {
        let next = ring_next(anchor);
        (*block.as_ptr()).prev = Some(anchor);
        (*block.as_ptr()).next = Some(next);
        (*next.as_ptr()).prev = Some(block);
        (*anchor.as_ptr()).next = Some(block);
    }

    /// Scans the free ring for `want` cells aligned to `align` cells, using
    /// the given strategy's starting point and walk direction. Returns the
    /// payload pointer of the carved block, or `None` if nothing fits.
    unsafe fn search(
        &mut self,
        want: usize,
        align: usize,
        strategy: Strategy,
    ) -> Option<NonNull<u8>> {
        let first = self.first_free?;
        let (start, last, backward) = match strategy {
            Strategy::First => (first, ring_prev(first), false),
            Strategy::Second => (ring_next(first), first, false),
            Strategy::Last => (ring_prev(first), first, true),
            Strategy::Skip => return None,
        };

        let mut block = start;
        loop {
            let magic = (*block.as_ptr()).magic;
            if magic != FREE_MAGIC {
                panic!(
                    "heap: free magic broken at {:#x}: {:#x}",
                    header_addr(block),
                    magic
                );
            }
            if let Some(payload) = self.carve(block, want, align, strategy) {
                return Some(payload);
            }
            if block == last {
                return None;
            }
            block = if backward {
                ring_prev(block)
            } else {
                ring_next(block)
            };
        }
    }

    /// Tries to carve `want` cells out of the free `block`.
    ///
    /// The carved piece is placed at the lowest position inside the block that
    /// satisfies the alignment, except under [`Strategy::Last`], where it is
    /// placed at the highest such position. Depending on where the piece
    /// lands, the block is taken whole, split in two, or split in three:
    ///
    /// ```text
    /// +--------------+   +--------------+   +--------------+
    /// | alloc, want  |   | alloc, want  |   | free,  pad   |
    /// +--------------+   +--------------+   +--------------+
    ///                    | free,  rest  |   | alloc, want  |
    ///                    +--------------+   +--------------+
    ///                                       | free,  rest  |
    ///                                       +--------------+
    /// ```
    unsafe fn carve(
        &mut self,
        block: NonNull<BlockHeader>,
        want: usize,
        align: usize,
        strategy: Strategy,
    ) -> Option<NonNull<u8>> {
        let addr = header_addr(block);
        let have = (*block.as_ptr()).cells;

        // The header occupies one cell in front of the payload, so alignment
        // is computed for the cell after the block's start.
        let misfit = (addr / CELL_SIZE + 1) % align;
        let front = if misfit == 0 { 0 } else { align - misfit };
        if have < want + front {
            return None;
        }
        let pad = if strategy == Strategy::Last {
            front + (have - front - want) / align * align
        } else {
            front
        };

        if pad == 0 && have == want {
            // Complete match: take the block out of the ring as-is.
            self.unlink(block);
            (*block.as_ptr()).magic = ALLOC_MAGIC;
            return Some(payload_of(block));
        }

        if pad == 0 {
            // The allocation sits at the block's start; the rest of the block
            // becomes a new free header that takes over the ring slot.
            let rest = header_at(addr + want * CELL_SIZE);
            (*rest.as_ptr()).cells = have - want;
            (*rest.as_ptr()).magic = FREE_MAGIC;
            self.replace(block, rest);
            (*block.as_ptr()).cells = want;
            (*block.as_ptr()).magic = ALLOC_MAGIC;
            return Some(payload_of(block));
        }

        // The allocation sits `pad` cells in; the front piece keeps the ring
        // slot, and any cells past the allocation become a second free block.
        let taken = header_at(addr + pad * CELL_SIZE);
        (*block.as_ptr()).cells = pad;
        if have > pad + want {
            let rest = header_at(addr + (pad + want) * CELL_SIZE);
            (*rest.as_ptr()).cells = have - pad - want;
            (*rest.as_ptr()).magic = FREE_MAGIC;
            self.insert_after(block, rest);
        }
        (*taken.as_ptr()).cells = want;
        (*taken.as_ptr()).magic = ALLOC_MAGIC;
        Some(payload_of(taken))
    }

    /// Returns `block` to the free ring, keeping the ring sorted by address,
    /// then merges it with whichever neighbors touch it.
    unsafe fn insert_free(&mut self, block: NonNull<BlockHeader>) {
        (*block.as_ptr()).magic = FREE_MAGIC;

        let Some(first) = self.first_free else {
            // The region was allocated dry; restart the ring with `block` as
            // its only element.
            (*block.as_ptr()).prev = Some(block);
            (*block.as_ptr()).next = Some(block);
            self.first_free = Some(block);
            return;
        };

        let anchor = if block < first {
            self.first_free = Some(block);
            ring_prev(first)
        } else {
            // Find the free block with the greatest address below `block`.
            let mut anchor = first;
            loop {
                let next = ring_next(anchor);
                if next == first || header_addr(next) > header_addr(block) {
                    break;
                }
                anchor = next;
            }
            anchor
        };
        self.insert_after(anchor, block);

        // Merge forward. The absorbed header's magic is zeroed so that a
        // dangling reference to it trips the corruption check.
        let next = ring_next(block);
        if next != block
            && header_addr(block) + (*block.as_ptr()).cells * CELL_SIZE == header_addr(next)
        {
            let absorbed = (*next.as_ptr()).cells;
            self.unlink(next);
            (*next.as_ptr()).magic = 0;
            (*block.as_ptr()).cells += absorbed;
        }

        // Merge backward.
        let prev = ring_prev(block);
        if prev != block
            && header_addr(prev) + (*prev.as_ptr()).cells * CELL_SIZE == header_addr(block)
        {
            let absorbed = (*block.as_ptr()).cells;
            self.unlink(block);
            (*block.as_ptr()).magic = 0;
            (*prev.as_ptr()).cells += absorbed;
        }
    }
}

/// The boot heap: an ordered list of regions plus the pressure-relief hooks.
///
/// The heap is a plain value; the boot path creates one and threads it through
/// whatever context object the rest of the loader shares. It is not a global
/// and holds no locks. For backing Rust's `alloc` collections, see
/// [`LockedHeap`].
#[derive(Debug)]
pub struct Heap {
    /// Regions sorted by ascending length, so small regions are allocated
    /// dry before large ones are touched.
    first_region: Option<NonNull<Region>>,
    relief_hooks: [Option<ReliefHook>; RELIEF_STAGES],
}

// The loader runs on a single core with no preemption; the raw region
// pointers are never shared between threads of execution. `Send` is granted
// so a `LockedHeap` static can exist, and its lock provides the exclusion.
unsafe impl Send for Heap {}

impl Heap {
    /// Creates a heap with no regions. Every allocation fails until at least
    /// one region is registered.
    pub const fn new() -> Self {
        Heap {
            first_region: None,
            relief_hooks: [None; RELIEF_STAGES],
        }
    }

    /// Builds a heap from a discovered memory map.
    ///
    /// # Safety
    ///
    /// Every `(addr, size, policies)` entry must describe memory that is
    /// valid, writable, unused and disjoint from all other entries, and that
    /// stays that way for the heap's lifetime.
    pub unsafe fn from_memory_map(memory_map: &[(usize, usize, PolicyTable)]) -> Self {
        let mut heap = Heap::new();
        for &(addr, size, policies) in memory_map {
            heap.register_region(addr, size, policies);
        }
        heap
    }

    /// Contributes `[addr, addr + size)` to the heap.
    ///
    /// The range is trimmed to cell boundaries and the region record is placed
    /// at its start; what remains becomes a single spanning free block. Ranges
    /// too small to hold the record plus a header and a payload cell are
    /// skipped with a debug trace, leaving the heap unchanged.
    ///
    /// # Safety
    ///
    /// The range must be valid, writable, unused memory, disjoint from every
    /// other registered region, for the heap's lifetime.
    pub unsafe fn register_region(&mut self, addr: usize, size: usize, policies: PolicyTable) {
        if size < SMALLEST_REGION_SIZE || addr.checked_add(size).is_none() {
            debug!("heap: skipping unusable region {:#x}+{:#x}", addr, size);
            return;
        }

        let record_addr = align_up(addr, CELL_SIZE);
        let base = align_up(record_addr + REGION_HEADER_SIZE, CELL_SIZE);
        let end = (addr + size) & !(CELL_SIZE - 1);
        if end < base.saturating_add(2 * CELL_SIZE) {
            debug!("heap: skipping unusable region {:#x}+{:#x}", addr, size);
            return;
        }
        let length = end - base;

        let first_block = header_at(base);
        ptr::write(
            first_block.as_ptr(),
            BlockHeader {
                prev: Some(first_block),
                next: Some(first_block),
                cells: length / CELL_SIZE,
                magic: FREE_MAGIC,
            },
        );

        let record = record_addr as *mut Region;
        ptr::write(
            record,
            Region {
                first_free: Some(first_block),
                next: None,
                base,
                size: length,
                policies,
            },
        );

        self.insert_region(NonNull::new_unchecked(record));
        debug!(
            "heap: registered region {:#x}..{:#x} ({} cells)",
            base,
            end,
            length / CELL_SIZE
        );
    }

    /// Inserts `region` in front of the first region longer than it, keeping
    /// the list sorted ascending by length. Equal lengths stay in
    /// registration order.
    unsafe fn insert_region(&mut self, region: NonNull<Region>) {
        let length = (*region.as_ptr()).size;
        let mut link: *mut Option<NonNull<Region>> = &mut self.first_region;
        while let Some(existing) = *link {
            if (*existing.as_ptr()).size > length {
                break;
            }
            link = &mut (*existing.as_ptr()).next;
        }
        (*region.as_ptr()).next = *link;
        *link = Some(region);
    }

    /// Installs or clears the hook for one pressure-relief stage.
    pub fn set_relief_hook(&mut self, stage: ReliefStage, hook: Option<ReliefHook>) {
        self.relief_hooks[stage as usize] = hook;
    }

    /// Allocates `size` bytes aligned to the natural cell boundary.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.allocate_aligned(0, size)
    }

    /// Allocates `size` bytes aligned to `align`, a power of two. An `align`
    /// of zero means natural cell alignment.
    pub fn allocate_aligned(&mut self, align: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.allocate_aligned_policy(align, size, Policy::Default)
    }

    /// As [`Heap::allocate`], with the payload cleared to zero.
    pub fn allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let payload = self.allocate(size)?;
        unsafe {
            ptr::write_bytes(payload.as_ptr(), 0, size);
        }
        Ok(payload)
    }

    /// Allocates a zeroed array of `count` elements of `size` bytes each,
    /// failing cleanly if the total overflows.
    pub fn allocate_array(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        let total = count.checked_mul(size).ok_or(HeapError::SizeOverflow)?;
        self.allocate_zeroed(total)
    }

    /// Allocates `size` bytes aligned to `align` under a caller-selected
    /// policy.
    ///
    /// Regions are tried smallest-first; a region serves the request with the
    /// strategy its table assigns to `policy`, or is passed over if the table
    /// says [`Strategy::Skip`] or the region is allocated dry. If every region
    /// declines, the pressure-relief hooks run in stage order with a full
    /// rescan after each, and only then does the request fail.
    pub fn allocate_aligned_policy(
        &mut self,
        align: usize,
        size: usize,
        policy: Policy,
    ) -> Result<NonNull<u8>, HeapError> {
        let want = match cells_for(size) {
            Some(cells) => cells + 1,
            None => return Err(HeapError::OutOfMemory),
        };
        let align = align_in_cells(align);

        for stage in 0..=RELIEF_STAGES {
            if let Some(payload) = self.scan_regions(want, align, policy) {
                return Ok(payload);
            }
            if stage < RELIEF_STAGES {
                if let Some(hook) = self.relief_hooks[stage] {
                    hook(self);
                }
            }
        }

        error!("heap: out of memory ({} bytes, align {} cells)", size, align);
        Err(HeapError::OutOfMemory)
    }

    fn scan_regions(&mut self, want: usize, align: usize, policy: Policy) -> Option<NonNull<u8>> {
        let mut next = self.first_region;
        while let Some(region) = next {
            let region = unsafe { &mut *region.as_ptr() };
            next = region.next;
            let strategy = region.policies[policy as usize];
            if strategy == Strategy::Skip {
                continue;
            }
            if let Some(payload) = unsafe { region.search(want, align, strategy) } {
                return Some(payload);
            }
        }
        None
    }

    /// Grows or shrinks the allocation behind `ptr` to `size` bytes.
    ///
    /// A null `ptr` allocates; a zero `size` releases and yields `Ok(None)`.
    /// Shrinking returns `ptr` unchanged and keeps the trailing cells with the
    /// block until it is released. Growth first tries to absorb a free block
    /// sitting directly after `ptr`'s; failing that, the payload moves to a
    /// fresh default-policy allocation and the old block is released. A failed
    /// relocation returns the error with the original allocation untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live payload pointer returned by this heap.
    pub unsafe fn resize(
        &mut self,
        ptr: *mut u8,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        if ptr.is_null() {
            return self.allocate(size).map(Some);
        }
        if size == 0 {
            self.release(ptr);
            return Ok(None);
        }

        let (region, block) = self.lookup(ptr);
        let have = (*block.as_ptr()).cells;
        let want = match cells_for(size) {
            Some(cells) => cells + 1,
            None => return Err(HeapError::OutOfMemory),
        };
        if have >= want {
            return Ok(Some(NonNull::new_unchecked(ptr)));
        }

        let region = &mut *region.as_ptr();
        let succ_addr = header_addr(block) + have * CELL_SIZE;
        if succ_addr < region.end() {
            let succ = header_at(succ_addr);
            if (*succ.as_ptr()).magic == FREE_MAGIC {
                let succ_cells = (*succ.as_ptr()).cells;
                if have + succ_cells >= want {
                    let taken = want - have;
                    if succ_cells == taken {
                        region.unlink(succ);
                    } else {
                        let rest = header_at(succ_addr + taken * CELL_SIZE);
                        (*rest.as_ptr()).cells = succ_cells - taken;
                        (*rest.as_ptr()).magic = FREE_MAGIC;
                        region.replace(succ, rest);
                    }
                    (*succ.as_ptr()).magic = 0;
                    (*block.as_ptr()).cells = want;
                    return Ok(Some(NonNull::new_unchecked(ptr)));
                }
            }
        }

        let new_payload = self.allocate(size)?;
        ptr::copy_nonoverlapping(
            ptr,
            new_payload.as_ptr(),
            cmp::min(size, (have - 1) * CELL_SIZE),
        );
        self.release(ptr);
        Ok(Some(new_payload))
    }

    /// Returns the allocation behind `ptr` to its region's free ring,
    /// coalescing with adjacent free blocks. A null `ptr` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live payload pointer returned by this heap.
    /// Anything else aborts: an address that is unaligned, outside every
    /// region, or whose header is not stamped as allocated (a double release
    /// lands here) is corruption, not an error.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let (region, block) = self.lookup(ptr);
        (*region.as_ptr()).insert_free(block);
    }

    /// Recovers the region and header behind a payload pointer, aborting on
    /// anything that cannot be a live allocation of this heap.
    unsafe fn lookup(&mut self, ptr: *mut u8) -> (NonNull<Region>, NonNull<BlockHeader>) {
        let addr = ptr as usize;
        if addr % CELL_SIZE != 0 {
            panic!("heap: unaligned pointer {:#x}", addr);
        }
        let mut next = self.first_region;
        while let Some(region) = next {
            let record = &*region.as_ptr();
            if record.contains(addr) {
                let block = header_at(addr - CELL_SIZE);
                let magic = (*block.as_ptr()).magic;
                if magic != ALLOC_MAGIC {
                    panic!("heap: alloc magic broken at {:#x}: {:#x}", addr, magic);
                }
                return (region, block);
            }
            next = record.next;
        }
        panic!("heap: out-of-range pointer {:#x}", addr);
    }

    /// Total usable bytes over all regions.
    pub fn capacity(&self) -> usize {
        let mut total = 0;
        let mut next = self.first_region;
        while let Some(region) = next {
            let region = unsafe { &*region.as_ptr() };
            total += region.size;
            next = region.next;
        }
        total
    }

    /// Bytes currently sitting on free rings, headers included. Walking the
    /// rings revalidates every free header's magic.
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut next = self.first_region;
        while let Some(region) = next {
            let region = unsafe { &*region.as_ptr() };
            if let Some(first) = region.first_free {
                let mut block = first;
                loop {
                    let header = unsafe { &*block.as_ptr() };
                    if header.magic != FREE_MAGIC {
                        panic!(
                            "heap: free magic broken at {:#x}: {:#x}",
                            header_addr(block),
                            header.magic
                        );
                    }
                    total += header.cells * CELL_SIZE;
                    block = unsafe { ring_next(block) };
                    if block == first {
                        break;
                    }
                }
            }
            next = region.next;
        }
        total
    }

    /// Prints every region, every block, and every free ring through the
    /// logging facade, validating each header's magic on the way. Whether the
    /// output is visible is the logger's decision; the walk and its checks
    /// run either way.
    pub fn dump(&self) {
        let mut next = self.first_region;
        while let Some(region) = next {
            let region = unsafe { &*region.as_ptr() };
            debug!(
                "heap: region {:#x}..{:#x}, {} bytes",
                region.base,
                region.end(),
                region.size
            );

            let mut addr = region.base;
            while addr < region.end() {
                let header = unsafe { &*(addr as *const BlockHeader) };
                let state = match header.magic {
                    FREE_MAGIC => "free",
                    ALLOC_MAGIC => "allocated",
                    other => panic!("heap: block magic broken at {:#x}: {:#x}", addr, other),
                };
                if header.cells == 0 {
                    panic!("heap: zero-sized block at {:#x}", addr);
                }
                debug!("heap:   {:#x}: {} cells, {}", addr, header.cells, state);
                addr += header.cells * CELL_SIZE;
            }

            if let Some(first) = region.first_free {
                let mut block = first;
                loop {
                    debug!("heap:   ring: {:#x}", header_addr(block));
                    block = unsafe { ring_next(block) };
                    if block == first {
                        break;
                    }
                }
            } else {
                debug!("heap:   ring: empty");
            }
            next = region.next;
        }
    }
}

/// A [`Heap`] behind a spinlock, fit to stand as the global allocator.
///
/// The lock exists to satisfy the `Sync` bound on allocator statics; the
/// loader itself stays single-threaded.
///
/// ```ignore
/// #[global_allocator]
/// static HEAP: LockedHeap = LockedHeap::empty();
///
/// // during boot, once the memory map is known:
/// unsafe { HEAP.lock().register_region(addr, size, policies) };
/// ```
pub struct LockedHeap(spin::Mutex<Heap>);

impl LockedHeap {
    /// Creates a locked heap with no regions.
    pub const fn empty() -> Self {
        LockedHeap(spin::Mutex::new(Heap::new()))
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, Heap> {
        self.0.lock()
    }
}

unsafe impl core::alloc::GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        match self.lock().allocate_aligned(layout.align(), layout.size()) {
            Ok(payload) => payload.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        self.lock().release(ptr);
    }

    unsafe fn alloc_zeroed(&self, layout: core::alloc::Layout) -> *mut u8 {
        match self.lock().allocate_aligned(layout.align(), layout.size()) {
            Ok(payload) => {
                ptr::write_bytes(payload.as_ptr(), 0, layout.size());
                payload.as_ptr()
            }
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn realloc(
        &self,
        ptr: *mut u8,
        layout: core::alloc::Layout,
        new_size: usize,
    ) -> *mut u8 {
        let mut heap = self.lock();
        if layout.align() <= CELL_SIZE {
            return match heap.resize(ptr, new_size) {
                Ok(Some(payload)) => payload.as_ptr(),
                Ok(None) | Err(_) => ptr::null_mut(),
            };
        }
        // An in-place probe cannot honor an over-aligned layout after a move,
        // so such blocks always relocate through a fresh aligned allocation.
        match heap.allocate_aligned(layout.align(), new_size) {
            Ok(new_payload) => {
                ptr::copy_nonoverlapping(
                    ptr,
                    new_payload.as_ptr(),
                    cmp::min(layout.size(), new_size),
                );
                heap.release(ptr);
                new_payload.as_ptr()
            }
            Err(_) => ptr::null_mut(),
        }
    }
}
