//! Thread-local evacuation buffers.
//!
//! During evacuation every GC thread owns two bump buffers: a GCLAB in young
//! for survivors that stay young, and a PLAB in old for promotions and
//! old-to-old copies. Both are carved out of regions under the heap lock and
//! then used without synchronisation.

use crate::object::{Address, MIN_OBJECT_WORDS};

/// Bounds of a buffer handed out by the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabBuffer {
    pub start: Address,
    pub end: Address,
}

impl LabBuffer {
    #[must_use]
    pub const fn words(&self) -> usize {
        self.end.offset_from(self.start)
    }
}

/// A bump allocator over one [`LabBuffer`].
#[derive(Debug, Default)]
pub struct Lab {
    buffer: Option<LabBuffer>,
    top: usize,
}

impl Lab {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffer: None,
            top: 0,
        }
    }

    /// Installs a fresh buffer. The previous one must have been retired.
    pub(crate) fn set_buf(&mut self, buffer: LabBuffer) {
        debug_assert!(self.buffer.is_none(), "installing a LAB over a live one");
        self.top = buffer.start.to_usize();
        self.buffer = Some(buffer);
    }

    #[must_use]
    pub const fn buffer(&self) -> Option<LabBuffer> {
        self.buffer
    }

    /// Current allocation point.
    #[must_use]
    pub fn top(&self) -> Option<Address> {
        self.buffer.map(|_| Address::new(self.top))
    }

    #[must_use]
    pub fn words_remaining(&self) -> usize {
        self.buffer
            .map_or(0, |b| b.end.to_usize() - self.top)
    }

    /// Bumps `size` words.
    ///
    /// Fails rather than leave a tail too small for a filler, so the buffer can
    /// always be retired into a parsable state.
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        let remaining = self.words_remaining();
        if size > remaining || (remaining - size > 0 && remaining - size < MIN_OBJECT_WORDS) {
            return None;
        }
        let obj = Address::new(self.top);
        self.top += size;
        Some(obj)
    }

    /// Rolls back the most recent allocation.
    pub fn undo_allocation(&mut self, obj: Address, size: usize) -> bool {
        if self.buffer.is_some() && obj.to_usize() + size == self.top {
            self.top = obj.to_usize();
            true
        } else {
            false
        }
    }

    /// Detaches the buffer together with its final top.
    pub(crate) fn take(&mut self) -> Option<(LabBuffer, Address)> {
        let buffer = self.buffer.take()?;
        Some((buffer, Address::new(self.top)))
    }
}

/// Per-thread evacuation state.
///
/// Passed explicitly to every evacuation entry point on
/// [`GenerationalHeap`](crate::GenerationalHeap).
#[derive(Debug)]
pub struct GcThreadLocal {
    pub(crate) gclab: Lab,
    pub(crate) gclab_size: usize,
    pub(crate) plab: Lab,
    pub(crate) plab_size: usize,
    pub(crate) plab_promoted: usize,
    pub(crate) plab_actual_size: usize,
    pub(crate) allow_plab_promotions: bool,
    pub(crate) plab_retries_enabled: bool,
    pub(crate) oom_during_evac: bool,
}

impl Default for GcThreadLocal {
    fn default() -> Self {
        Self::new()
    }
}

impl GcThreadLocal {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            gclab: Lab::new(),
            gclab_size: 0,
            plab: Lab::new(),
            plab_size: 0,
            plab_promoted: 0,
            plab_actual_size: 0,
            allow_plab_promotions: true,
            plab_retries_enabled: true,
            oom_during_evac: false,
        }
    }

    #[must_use]
    pub const fn plab(&self) -> &Lab {
        &self.plab
    }

    #[must_use]
    pub const fn gclab(&self) -> &Lab {
        &self.gclab
    }

    /// Desired size of the next PLAB.
    #[must_use]
    pub const fn plab_size(&self) -> usize {
        self.plab_size
    }

    pub fn set_plab_size(&mut self, words: usize) {
        self.plab_size = words;
    }

    /// Words promoted into the current PLAB.
    #[must_use]
    pub const fn plab_promoted(&self) -> usize {
        self.plab_promoted
    }

    #[must_use]
    pub const fn allow_plab_promotions(&self) -> bool {
        self.allow_plab_promotions
    }

    #[must_use]
    pub const fn plab_retries_enabled(&self) -> bool {
        self.plab_retries_enabled
    }

    /// Set once this thread failed to allocate during evacuation. It will only
    /// resolve forwarding pointers from then on.
    #[must_use]
    pub const fn is_oom_during_evac(&self) -> bool {
        self.oom_during_evac
    }

    /// Re-arms the thread for the next evacuation phase.
    pub fn reset_for_evacuation(&mut self) {
        self.oom_during_evac = false;
        self.allow_plab_promotions = true;
        self.plab_retries_enabled = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab(start: usize, end: usize) -> Lab {
        let mut lab = Lab::new();
        lab.set_buf(LabBuffer {
            start: Address::new(start),
            end: Address::new(end),
        });
        lab
    }

    #[test]
    fn test_bump_and_undo() {
        let mut l = lab(100, 116);
        let a = l.allocate(4).expect("fits");
        let b = l.allocate(4).expect("fits");
        assert_eq!(a, Address::new(100));
        assert_eq!(b, Address::new(104));
        assert!(!l.undo_allocation(a, 4));
        assert!(l.undo_allocation(b, 4));
        assert_eq!(l.words_remaining(), 12);
    }

    #[test]
    fn test_refuses_one_word_tail() {
        let mut l = lab(0, 8);
        assert!(l.allocate(7).is_none());
        assert!(l.allocate(6).is_some());
        assert!(l.allocate(2).is_some());
        assert_eq!(l.words_remaining(), 0);
    }

    #[test]
    fn test_take_detaches() {
        let mut l = lab(0, 64);
        let _ = l.allocate(10);
        let (buf, top) = l.take().expect("installed");
        assert_eq!(buf.words(), 64);
        assert_eq!(top, Address::new(10));
        assert!(l.buffer().is_none());
        assert_eq!(l.words_remaining(), 0);
    }
}
