//! Strong roots.
//!
//! Roots are slots owned by the runtime. Each slot is addressed by the index
//! [`RootSet::add`] returned; clearing a slot keeps its index reserved so other
//! indices stay stable.

use parking_lot::Mutex;

use crate::object::Address;

/// The heap's strong roots.
#[derive(Debug, Default)]
pub struct RootSet {
    slots: Mutex<Vec<Option<Address>>>,
}

impl RootSet {
    /// Create an empty root set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Register a root. Returns its slot index.
    pub fn add(&self, obj: Address) -> usize {
        let mut slots = self.slots.lock();
        slots.push(Some(obj));
        slots.len() - 1
    }

    /// Current value of slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if no such slot was registered.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Address> {
        self.slots.lock()[index]
    }

    /// Overwrite slot `index`; `None` drops the root.
    ///
    /// # Panics
    ///
    /// Panics if no such slot was registered.
    pub fn set(&self, index: usize, value: Option<Address>) {
        self.slots.lock()[index] = value;
    }

    /// Number of slots ever registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Visit every non-empty slot.
    pub fn for_each(&self, mut f: impl FnMut(Address)) {
        for obj in self.slots.lock().iter().flatten() {
            f(*obj);
        }
    }

    /// Replace every non-empty slot with `f(slot)`.
    pub fn update(&self, mut f: impl FnMut(Address) -> Address) {
        for obj in self.slots.lock().iter_mut().flatten() {
            *obj = f(*obj);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_stable() {
        let roots = RootSet::new();
        let a = roots.add(Address::new(8));
        let b = roots.add(Address::new(16));
        roots.set(a, None);
        assert_eq!(roots.get(b), Some(Address::new(16)));
        assert_eq!(roots.len(), 2);

        let mut seen = Vec::new();
        roots.for_each(|obj| seen.push(obj));
        assert_eq!(seen, vec![Address::new(16)]);

        roots.update(|obj| obj.offset(4));
        assert_eq!(roots.get(b), Some(Address::new(20)));
        assert_eq!(roots.get(a), None);
    }
}
