//! Bounded, non-growing per-transaction read-set buffer.
//!
//! A transaction's read set is recorded as a list of `CompositeKey`s
//! (validated again at commit time). Rather than a growable `Vec` per
//! transaction, every read set is built from fixed-capacity segments drawn
//! from a preallocated, per-worker pool (`VersionBufferAllocator`): this
//! bounds peak memory to a configured budget and avoids an allocator call on
//! every read. Capacity (6 entries/segment) and the allocator's counting
//! semantics are grounded on the original implementation's boundary tests.

use chronodb_core::{CompositeKey, Error, Result};

/// Entries held per segment.
pub const SEGMENT_CAPACITY: usize = 6;

/// Bytes consumed by one segment's slot in the allocator's budget. A logical
/// unit, not a literal `size_of`, matching the original test harness's use
/// of a named constant rather than `sizeof`.
pub const BUFFER_SIZE: usize = SEGMENT_CAPACITY * std::mem::size_of::<CompositeKey>();

struct Segment {
    entries: [Option<CompositeKey>; SEGMENT_CAPACITY],
    len: usize,
    next: Option<Box<Segment>>,
}

impl Segment {
    fn empty() -> Box<Segment> {
        Box::new(Segment { entries: [None; SEGMENT_CAPACITY], len: 0, next: None })
    }

    fn is_full(&self) -> bool {
        self.len == SEGMENT_CAPACITY
    }

    fn push(&mut self, key: CompositeKey) {
        debug_assert!(!self.is_full());
        self.entries[self.len] = Some(key);
        self.len += 1;
    }
}

/// A pool of preallocated segments, shared by one worker's transactions.
///
/// Never grows past its initial capacity: once exhausted, callers get
/// `Error::BufferCapacityExceeded` rather than a fresh heap allocation. This
/// makes a worker's peak read-set memory a fixed, predictable budget
/// (spec.md §3).
pub struct VersionBufferAllocator {
    free: Vec<Box<Segment>>,
}

impl VersionBufferAllocator {
    /// Preallocate enough segments to cover `capacity_bytes`, in units of
    /// [`BUFFER_SIZE`]. `capacity_bytes` must be an exact multiple of
    /// `BUFFER_SIZE`; the remainder (if any) is simply unused capacity.
    pub fn new(capacity_bytes: usize) -> Self {
        let n = capacity_bytes / BUFFER_SIZE;
        let mut free = Vec::with_capacity(n);
        for _ in 0..n {
            free.push(Segment::empty());
        }
        VersionBufferAllocator { free }
    }

    /// Number of segments currently available.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    fn acquire(&mut self) -> Result<Box<Segment>> {
        self.free.pop().ok_or(Error::BufferCapacityExceeded { requested: BUFFER_SIZE })
    }

    fn release(&mut self, mut segment: Box<Segment>) {
        segment.len = 0;
        segment.entries = [None; SEGMENT_CAPACITY];
        segment.next = None;
        self.free.push(segment);
    }
}

/// One transaction's read set: a singly linked list of fixed-capacity
/// segments drawn from a [`VersionBufferAllocator`].
///
/// Dropping (via [`VersionBuffer::release`]) returns every held segment to
/// the allocator it came from; a `VersionBuffer` that is simply dropped
/// without calling `release` leaks its segments back to nothing (by design:
/// callers must explicitly release at the end of a transaction's lifetime,
/// mirroring the original's explicit buffer-return call).
pub struct VersionBuffer {
    head: Option<Box<Segment>>,
    len: usize,
}

impl VersionBuffer {
    /// An empty read set, holding no segments yet.
    pub fn new() -> Self {
        VersionBuffer { head: None, len: 0 }
    }

    /// Number of keys recorded so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Record a read of `key`, drawing a fresh segment from `allocator` if
    /// the current one is full or none exists yet.
    pub fn record(&mut self, allocator: &mut VersionBufferAllocator, key: CompositeKey) -> Result<()> {
        let needs_new = match &self.head {
            Some(seg) => seg.is_full(),
            None => true,
        };
        if needs_new {
            let mut fresh = allocator.acquire()?;
            fresh.next = self.head.take();
            self.head = Some(fresh);
        }
        self.head.as_mut().unwrap().push(key);
        self.len += 1;
        Ok(())
    }

    /// Visit every recorded key, oldest-segment-last (insertion order is not
    /// meaningful for validation, which checks membership only).
    pub fn for_each(&self, mut f: impl FnMut(CompositeKey)) {
        let mut cur = self.head.as_deref();
        while let Some(seg) = cur {
            for entry in &seg.entries[..seg.len] {
                if let Some(key) = entry {
                    f(*key);
                }
            }
            cur = seg.next.as_deref();
        }
    }

    /// Return every held segment to `allocator`, leaving this buffer empty.
    pub fn release(&mut self, allocator: &mut VersionBufferAllocator) {
        let mut cur = self.head.take();
        while let Some(mut seg) = cur {
            cur = seg.next.take();
            allocator.release(seg);
        }
        self.len = 0;
    }
}

impl Default for VersionBuffer {
    fn default() -> Self {
        Self::new()
    }
}
