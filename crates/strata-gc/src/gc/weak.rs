//! Weak roots.
//!
//! A weak slot does not keep its referent alive. After old marking, slots
//! whose referent is an unmarked old object are cleared. This must happen
//! before coalesce-and-fill overwrites the dead object with a filler.

use parking_lot::Mutex;

use crate::generational::GenerationalHeap;
use crate::object::Address;

/// Registered weak slots.
#[derive(Debug, Default)]
pub struct WeakRefTable {
    slots: Mutex<Vec<Option<Address>>>,
}

impl WeakRefTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Register a weak reference to `obj`. Returns its slot index.
    pub fn register(&self, obj: Address) -> usize {
        let mut slots = self.slots.lock();
        slots.push(Some(obj));
        slots.len() - 1
    }

    /// Referent of slot `index`, or `None` once cleared.
    ///
    /// # Panics
    ///
    /// Panics if no such slot was registered.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Address> {
        self.slots.lock()[index]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Clears slots whose referent did not survive old marking. Returns how
    /// many were cleared.
    ///
    /// Only old referents below their region's TAMS are judged; anything
    /// else is treated as live.
    pub fn process(&self, heap: &GenerationalHeap) -> usize {
        let mut cleared = 0;
        for slot in self.slots.lock().iter_mut() {
            let Some(obj) = *slot else { continue };
            let region = heap.region_containing(obj);
            if !region.is_old() {
                continue;
            }
            let offset = obj.offset_from(region.bottom());
            if !region.is_marked_or_above_tams(offset) {
                *slot = None;
                cleared += 1;
            }
        }
        cleared
    }

    pub(crate) fn update(&self, mut f: impl FnMut(Address) -> Address) {
        for obj in self.slots.lock().iter_mut().flatten() {
            *obj = f(*obj);
        }
    }
}
