//! Shared transposition table.
//!
//! One table serves every search thread in the process. Access is racy on
//! purpose: probes and writes use relaxed atomic loads and stores on the
//! individual entry fields, with no locks, fences, or compare-and-swap, so a
//! reader may assemble a snapshot out of bytes from different writes.
//! Synchronizing would cost thinking time; the engine instead filters what it
//! reads (key stub comparison, occupancy check, move legality on the caller's
//! side) and accepts the occasional wrong value.
//!
//! `probe` is the primary operation: it maps a position key to a cluster,
//! scans the cluster for a matching key stub, and returns whether the
//! position was found, a copy of the prior data, and a writer handle for
//! committing an update later.

use std::mem::size_of;
use std::ops::Deref;
use std::sync::atomic::{AtomicI16, AtomicU16, AtomicU8, Ordering};

use crate::mem::{Allocation, PageKind};
use crate::types::{Bound, Depth, Key, Move, Value, DEPTH_ENTRY_OFFSET, VALUE_NONE};

/// Entries per cluster.
pub const CLUSTER_SIZE: usize = 3;

// The generation lives in the 5 leading bits of `gen_bound8`; the 3 trailing
// bits hold the PV flag and the bound.
const GENERATION_BITS: u32 = 3;
pub const GENERATION_DELTA: u8 = 1 << GENERATION_BITS;
const GENERATION_CYCLE: u16 = 255 + GENERATION_DELTA as u16;
const GENERATION_MASK: u16 = (0xFF << GENERATION_BITS) & 0xFF;

// Weight of relative age against depth when scoring replacement victims.
const REPLACE_AGE_FACTOR: i32 = 2;

/// One cached position, 10 bytes:
///
/// key        16 bit
/// depth       8 bit
/// generation  5 bit
/// pv node     1 bit
/// bound type  2 bit
/// move       16 bit
/// value      16 bit
/// evaluation 16 bit
///
/// The fields are in the order `probe` reads them. The per-entry cut flag is
/// not here; it lives in the owning cluster's shared `extra` bits.
#[repr(C)]
pub struct TTEntry {
    key16: AtomicU16,
    depth8: AtomicU8,
    gen_bound8: AtomicU8,
    move16: AtomicU16,
    value16: AtomicI16,
    eval16: AtomicI16,
}

const _: () = assert!(size_of::<TTEntry>() == 10);

impl TTEntry {
    #[cfg(test)]
    const fn empty() -> Self {
        Self {
            key16: AtomicU16::new(0),
            depth8: AtomicU8::new(0),
            gen_bound8: AtomicU8::new(0),
            move16: AtomicU16::new(0),
            value16: AtomicI16::new(0),
            eval16: AtomicI16::new(0),
        }
    }

    #[inline]
    fn key16(&self) -> u16 {
        self.key16.load(Ordering::Relaxed)
    }

    #[inline]
    fn depth8(&self) -> u8 {
        self.depth8.load(Ordering::Relaxed)
    }

    #[inline]
    fn gen_bound8(&self) -> u8 {
        self.gen_bound8.load(Ordering::Relaxed)
    }

    /// A raw depth byte of zero marks a free slot, see `DEPTH_ENTRY_OFFSET`.
    #[inline]
    pub fn is_occupied(&self) -> bool {
        self.depth8() != 0
    }

    /// Distance from the stored generation to `generation8` in the cyclic
    /// 8-bit generation space. Adding `GENERATION_CYCLE` keeps the
    /// subtraction well-defined after the counter wraps and lets the mask
    /// strip the non-generation bits of `gen_bound8` from the result. Always
    /// a multiple of `GENERATION_DELTA`.
    #[inline]
    fn relative_age(&self, generation8: u8) -> u8 {
        ((GENERATION_CYCLE + generation8 as u16 - self.gen_bound8() as u16) & GENERATION_MASK)
            as u8
    }

    #[inline]
    fn replace_score(&self, generation8: u8) -> i32 {
        self.depth8() as i32 - REPLACE_AGE_FACTOR * self.relative_age(generation8) as i32
    }
}

// Bits available to each entry inside the cluster's `extra` field.
const EXTRA_BITS_PER_ENTRY: u32 = (8 * size_of::<u16>() / CLUSTER_SIZE) as u32;

/// Typed view of a per-entry bit range inside a cluster's `extra` field:
/// `WIDTH` bits starting `OFFSET` bits into the entry's share. The range is
/// checked against the available bits when the accessor is instantiated.
struct ExtraBits<const WIDTH: u32, const OFFSET: u32>;

impl<const WIDTH: u32, const OFFSET: u32> ExtraBits<WIDTH, OFFSET> {
    const FITS: () = assert!(OFFSET + WIDTH <= EXTRA_BITS_PER_ENTRY);

    #[inline]
    fn shift(slot: usize) -> u32 {
        let () = Self::FITS;
        slot as u32 * EXTRA_BITS_PER_ENTRY + OFFSET
    }

    #[inline]
    fn get(extra: &AtomicU16, slot: usize) -> u16 {
        (extra.load(Ordering::Relaxed) >> Self::shift(slot)) & ((1 << WIDTH) - 1)
    }

    /// Read-modify-write preserving the other entries' bits. Two concurrent
    /// writers to sibling slots may lose one update; a dropped flag bit is
    /// accepted.
    #[inline]
    fn set(extra: &AtomicU16, slot: usize, bits: u16) {
        let shift = Self::shift(slot);
        let mask = ((1u16 << WIDTH) - 1) << shift;
        let old = extra.load(Ordering::Relaxed);
        extra.store((old & !mask) | ((bits << shift) & mask), Ordering::Relaxed);
    }
}

type CutFlag = ExtraBits<1, 0>;

/// Half a cache line: three entries plus 16 bits shared between them. The
/// cut flags live in `extra`, which leaves room for future per-entry bits.
#[repr(C, align(32))]
pub struct Cluster {
    entries: [TTEntry; CLUSTER_SIZE],
    extra: AtomicU16,
}

const _: () = assert!(size_of::<Cluster>() == 32);
const _: () = assert!(CLUSTER_SIZE <= 4);

impl Cluster {
    #[cfg(test)]
    const fn empty() -> Self {
        Self {
            entries: [TTEntry::empty(), TTEntry::empty(), TTEntry::empty()],
            extra: AtomicU16::new(0),
        }
    }

    /// Expands one slot into a plain-data snapshot.
    fn read(&self, slot: usize) -> TTData {
        let entry = &self.entries[slot];
        let gen_bound8 = entry.gen_bound8();
        TTData {
            mv: Move(entry.move16.load(Ordering::Relaxed)),
            value: entry.value16.load(Ordering::Relaxed),
            eval: entry.eval16.load(Ordering::Relaxed),
            depth: entry.depth8() as Depth + DEPTH_ENTRY_OFFSET,
            bound: Bound::from_bits(gen_bound8),
            is_pv: gen_bound8 & 0x4 != 0,
            cut: CutFlag::get(&self.extra, slot) != 0,
        }
    }

    /// Populates one slot with a new node's data, possibly overwriting an
    /// old position. The update is not atomic and can be racy.
    #[allow(clippy::too_many_arguments)]
    fn save(
        &self,
        slot: usize,
        key: Key,
        value: Value,
        is_pv: bool,
        bound: Bound,
        depth: Depth,
        mv: Move,
        eval: Value,
        cut: bool,
        generation8: u8,
    ) {
        let entry = &self.entries[slot];
        let key16 = key as u16;
        let stored16 = entry.key16();

        // Preserve the old move if we don't have a new one
        if !mv.is_none() || key16 != stored16 {
            entry.move16.store(mv.raw(), Ordering::Relaxed);
        }

        // Overwrite less valuable entries (cheapest checks first)
        if bound == Bound::Exact
            || key16 != stored16
            || depth - DEPTH_ENTRY_OFFSET + 2 * (is_pv as Depth) > entry.depth8() as Depth - 4
            || entry.relative_age(generation8) != 0
        {
            debug_assert!(depth > DEPTH_ENTRY_OFFSET);
            debug_assert!(depth < 256 + DEPTH_ENTRY_OFFSET);

            entry.key16.store(key16, Ordering::Relaxed);
            entry
                .depth8
                .store((depth - DEPTH_ENTRY_OFFSET) as u8, Ordering::Relaxed);
            entry.gen_bound8.store(
                generation8 | (is_pv as u8) << 2 | bound as u8,
                Ordering::Relaxed,
            );
            entry.value16.store(value, Ordering::Relaxed);
            entry.eval16.store(eval, Ordering::Relaxed);
            CutFlag::set(&self.extra, slot, cut as u16);
        } else if entry.depth8() as Depth + DEPTH_ENTRY_OFFSET >= 5
            && Bound::from_bits(entry.gen_bound8()) != Bound::Exact
        {
            // Age non-exact entries that keep surviving probes
            entry.depth8.store(entry.depth8() - 1, Ordering::Relaxed);
        }
    }
}

/// A copy of the data already in an entry (possibly collided). `probe` may
/// be racy, so the fields can be mutually inconsistent.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TTData {
    pub mv: Move,
    pub value: Value,
    pub eval: Value,
    pub depth: Depth,
    pub bound: Bound,
    pub is_pv: bool,
    pub cut: bool,
}

impl TTData {
    pub const EMPTY: Self = Self {
        mv: Move::NONE,
        value: VALUE_NONE,
        eval: VALUE_NONE,
        depth: DEPTH_ENTRY_OFFSET,
        bound: Bound::None,
        is_pv: false,
        cut: false,
    };
}

impl Default for TTData {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Handle for making a racy write to the slot picked by `probe`. Holds no
/// lock; writers to the same slot race and the replacement rules in `save`
/// decide what sticks.
pub struct TTWriter<'a> {
    cluster: &'a Cluster,
    slot: usize,
}

impl TTWriter<'_> {
    #[allow(clippy::too_many_arguments)]
    #[inline]
    pub fn write(
        &self,
        key: Key,
        value: Value,
        is_pv: bool,
        bound: Bound,
        depth: Depth,
        mv: Move,
        eval: Value,
        cut: bool,
        generation8: u8,
    ) {
        self.cluster
            .save(self.slot, key, value, is_pv, bound, depth, mv, eval, cut, generation8);
    }
}

struct ClusterTable {
    alloc: Option<Allocation>,
    len: usize,
}

impl ClusterTable {
    /// Allocates without zeroing; the caller runs a parallel clear before
    /// the clusters are read.
    fn allocate(len: usize) -> Option<Self> {
        let alloc = Allocation::new(len * size_of::<Cluster>(), std::mem::align_of::<Cluster>())?;
        Some(Self {
            alloc: Some(alloc),
            len,
        })
    }

    const fn released() -> Self {
        Self {
            alloc: None,
            len: 0,
        }
    }

    fn raw(&self) -> *mut Cluster {
        match &self.alloc {
            Some(a) => a.ptr().as_ptr() as *mut Cluster,
            None => std::ptr::NonNull::dangling().as_ptr(),
        }
    }

    fn uses_large_pages(&self) -> bool {
        matches!(&self.alloc, Some(a) if a.kind() == PageKind::Huge)
    }
}

impl Deref for ClusterTable {
    type Target = [Cluster];

    fn deref(&self) -> &[Cluster] {
        match &self.alloc {
            Some(a) => unsafe {
                std::slice::from_raw_parts(a.ptr().as_ptr() as *const Cluster, self.len)
            },
            None => &[],
        }
    }
}

/// The process-wide table. `probe`, `write`, `new_search`, `hashfull` and
/// `generation` may be called from any number of threads at once; `resize`
/// and `clear` must not overlap with them, which the enclosing engine
/// guarantees by only resizing or clearing while its search threads are
/// idle.
pub struct TranspositionTable {
    table: ClusterTable,
    cluster_count: usize,
    generation8: AtomicU8,
}

impl TranspositionTable {
    pub fn new(mb: usize, threads: &rayon::ThreadPool) -> Self {
        let mut tt = Self {
            table: ClusterTable::released(),
            cluster_count: 0,
            generation8: AtomicU8::new(0),
        };
        tt.resize(mb, threads);
        tt
    }

    /// Builds a table sized from the global tunables.
    pub fn from_params(threads: &rayon::ThreadPool) -> Self {
        Self::new(crate::params::PARAMS.read().hash_mb, threads)
    }

    /// Sets the size of the table in megabytes, dropping all stored data.
    /// The previous pages are released before the new request. A refused
    /// allocation is fatal.
    pub fn resize(&mut self, mb: usize, threads: &rayon::ThreadPool) {
        self.table = ClusterTable::released();
        self.cluster_count = (mb * 1024 * 1024 / size_of::<Cluster>()).max(1);

        self.table = match ClusterTable::allocate(self.cluster_count) {
            Some(table) => table,
            None => {
                eprintln!("Failed to allocate {mb}MB for transposition table.");
                std::process::exit(1);
            }
        };

        self.clear(threads);
    }

    /// Zeroes the table and resets the generation. One job per pool thread,
    /// each taking a disjoint stride of clusters; the last job absorbs the
    /// remainder. Returns after every job has finished.
    pub fn clear(&self, threads: &rayon::ThreadPool) {
        self.generation8.store(0, Ordering::Relaxed);

        let thread_count = threads.current_num_threads().max(1);
        let stride = self.cluster_count / thread_count;
        // Sent as an address so the closure stays Send
        let base = self.table.raw() as usize;

        threads.scope(|scope| {
            for i in 0..thread_count {
                let start = stride * i;
                let len = if i + 1 == thread_count {
                    self.cluster_count - start
                } else {
                    stride
                };
                scope.spawn(move |_| unsafe {
                    std::ptr::write_bytes((base as *mut Cluster).add(start), 0, len);
                });
            }
        });
    }

    /// Advances the generation before a new search. Incrementing by the
    /// delta leaves the low flag bits of stored `gen_bound8` values out of
    /// the comparison. Never touches table memory.
    pub fn new_search(&self) {
        self.generation8
            .fetch_add(GENERATION_DELTA, Ordering::Relaxed);
    }

    #[inline]
    pub fn generation(&self) -> u8 {
        self.generation8.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn cluster_count(&self) -> usize {
        self.cluster_count
    }

    pub fn uses_large_pages(&self) -> bool {
        self.table.uses_large_pages()
    }

    /// Looks up `key`. On a hit, returns the occupancy flag, a snapshot of
    /// the stored data, and a writer for the matching slot. On a miss,
    /// returns an empty snapshot and a writer for the cluster's least
    /// valuable slot, scored by depth minus weighted relative age.
    pub fn probe(&self, key: Key) -> (bool, TTData, TTWriter<'_>) {
        let cluster = self.cluster_for(key);
        let key16 = key as u16;

        for slot in 0..CLUSTER_SIZE {
            if cluster.entries[slot].key16() == key16 {
                return (
                    cluster.entries[slot].is_occupied(),
                    cluster.read(slot),
                    TTWriter { cluster, slot },
                );
            }
        }

        // Find an entry to be replaced
        let generation8 = self.generation();
        let mut victim = 0;
        for slot in 1..CLUSTER_SIZE {
            if cluster.entries[slot].replace_score(generation8)
                < cluster.entries[victim].replace_score(generation8)
            {
                victim = slot;
            }
        }

        (false, TTData::EMPTY, TTWriter { cluster, slot: victim })
    }

    /// Approximate occupancy in permille, for `info hashfull`. Samples the
    /// first 1000 clusters and counts entries no older than `max_age`
    /// searches.
    pub fn hashfull(&self, max_age: u8) -> u16 {
        let generation8 = self.generation();
        let max_age = max_age as u16 * GENERATION_DELTA as u16;
        let mut count = 0u32;

        for cluster in self.table.iter().take(1000) {
            for entry in &cluster.entries {
                count += (entry.is_occupied()
                    && entry.relative_age(generation8) as u16 <= max_age)
                    as u32;
            }
        }

        (count / CLUSTER_SIZE as u32) as u16
    }

    /// Hints the cache to pull in the cluster `key` maps to.
    #[inline]
    pub fn prefetch(&self, key: Key) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
            _mm_prefetch(self.cluster_for(key) as *const Cluster as *const i8, _MM_HINT_T0);
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = key;
    }

    /// High half of the widening `key * cluster_count` product: a uniform
    /// map onto `[0, cluster_count)` with no division and no power-of-two
    /// requirement on the table size.
    #[inline]
    fn cluster_for(&self, key: Key) -> &Cluster {
        let index = ((key as u128 * self.cluster_count as u128) >> 64) as usize;
        &self.table[index]
    }
}
