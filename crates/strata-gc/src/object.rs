//! Heap-word object layout.
//!
//! Every object starts with two header words:
//!
//! | word | contents                                                         |
//! |------|------------------------------------------------------------------|
//! | 0    | mark word: object age, or the forwardee once evacuated           |
//! | 1    | class word: `size << 8 \| refs << 2 \| kind`                      |
//!
//! followed by `refs` reference slots and then plain payload. Fillers use the
//! same layout with [`ObjectKind::Filler`] so that any run of dead words can be
//! walked by size alone.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bytes per heap word.
pub const HEAP_WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Words taken by the object header.
pub const HEADER_WORDS: usize = 2;

/// Smallest object, and therefore smallest filler, in words.
pub const MIN_OBJECT_WORDS: usize = HEADER_WORDS;

/// Largest number of reference slots an object can declare.
pub const MAX_REFS: usize = 63;

/// Object ages saturate here.
pub const MAX_AGE: u8 = 15;

/// A heap address, measured in words from the start of the heap.
///
/// Address zero is the first word of region zero; it is never handed out as an
/// object because region zero's first object starts there only when the region
/// is allocated, so the null reference is encoded separately in reference
/// slots (see [`Address::NULL_SLOT`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    /// Encoding of an empty reference slot.
    pub const NULL_SLOT: usize = usize::MAX;

    /// Address of heap word `word`.
    #[must_use]
    pub const fn new(word: usize) -> Self {
        Self(word)
    }

    /// Word index of this address.
    #[must_use]
    pub const fn to_usize(self) -> usize {
        self.0
    }

    /// The address `words` words further on.
    #[must_use]
    pub const fn offset(self, words: usize) -> Self {
        Self(self.0 + words)
    }

    /// Number of words from `start` to `self`.
    #[must_use]
    pub const fn offset_from(self, start: Self) -> usize {
        self.0 - start.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

const TAG_MASK: usize = 0b11;
const FORWARDED_TAG: usize = 0b11;
const AGE_SHIFT: usize = 2;
const AGE_MASK: usize = 0xF;

/// First header word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkWord(usize);

impl MarkWord {
    /// Mark word of a freshly allocated object.
    #[must_use]
    pub const fn prototype() -> Self {
        Self(0)
    }

    /// Rebuilds a mark word from its raw bits.
    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw bits.
    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Mark word that forwards to `to`.
    #[must_use]
    pub const fn forwarded_to(to: Address) -> Self {
        Self((to.0 << 2) | FORWARDED_TAG)
    }

    /// Whether the object has been evacuated.
    #[must_use]
    pub const fn is_forwarded(self) -> bool {
        self.0 & TAG_MASK == FORWARDED_TAG
    }

    /// The evacuated copy, if any.
    #[must_use]
    pub const fn forwardee(self) -> Option<Address> {
        if self.is_forwarded() {
            Some(Address(self.0 >> 2))
        } else {
            None
        }
    }

    /// Number of collections the object survived. Zero once forwarded.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn age(self) -> u8 {
        if self.is_forwarded() {
            0
        } else {
            ((self.0 >> AGE_SHIFT) & AGE_MASK) as u8
        }
    }

    /// Same mark word with its age replaced, saturating at [`MAX_AGE`].
    #[must_use]
    pub const fn with_age(self, age: u8) -> Self {
        let age = if age > MAX_AGE { MAX_AGE } else { age };
        Self((self.0 & !(AGE_MASK << AGE_SHIFT)) | ((age as usize) << AGE_SHIFT))
    }
}

/// What a header describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum ObjectKind {
    /// A regular object.
    Object = 1,
    /// Dead space made walkable.
    Filler = 2,
}

const KIND_MASK: usize = 0b11;
const REFS_SHIFT: usize = 2;
const REFS_MASK: usize = 0x3F;
const SIZE_SHIFT: usize = 8;

/// Second header word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassWord(usize);

impl ClassWord {
    /// Class word for an object of `size` words with `refs` reference slots.
    ///
    /// # Panics
    ///
    /// Panics if the object cannot hold its header and reference slots.
    #[must_use]
    pub fn new(kind: ObjectKind, size: usize, refs: usize) -> Self {
        assert!(size >= MIN_OBJECT_WORDS, "object of {size} words is smaller than its header");
        assert!(refs <= MAX_REFS, "object declares {refs} reference slots, max is {MAX_REFS}");
        assert!(
            HEADER_WORDS + refs <= size,
            "{refs} reference slots do not fit in an object of {size} words"
        );
        Self((size << SIZE_SHIFT) | (refs << REFS_SHIFT) | kind as usize)
    }

    /// Class word of a filler covering `size` words.
    #[must_use]
    pub fn filler(size: usize) -> Self {
        Self::new(ObjectKind::Filler, size, 0)
    }

    /// Rebuilds a class word from its raw bits.
    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw bits.
    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Kind, or `None` for words that were never initialised as a header.
    #[must_use]
    pub const fn kind(self) -> Option<ObjectKind> {
        match self.0 & KIND_MASK {
            1 => Some(ObjectKind::Object),
            2 => Some(ObjectKind::Filler),
            _ => None,
        }
    }

    /// Whether this header describes a filler.
    #[must_use]
    pub const fn is_filler(self) -> bool {
        matches!(self.kind(), Some(ObjectKind::Filler))
    }

    /// Size in words, header included.
    #[must_use]
    pub const fn size(self) -> usize {
        self.0 >> SIZE_SHIFT
    }

    /// Number of reference slots after the header.
    #[must_use]
    pub const fn refs(self) -> usize {
        (self.0 >> REFS_SHIFT) & REFS_MASK
    }
}

// ============================================================================
// Word-slice accessors
// ============================================================================
//
// `at` is an index into `words`. Callers pass either the whole heap or a single
// region together with a matching index.

/// Reads the mark word at `at`.
#[must_use]
pub fn mark_word(words: &[AtomicUsize], at: usize) -> MarkWord {
    MarkWord(words[at].load(Ordering::Acquire))
}

/// Reads the class word of the object at `at`.
#[must_use]
pub fn class_word(words: &[AtomicUsize], at: usize) -> ClassWord {
    ClassWord(words[at + 1].load(Ordering::Acquire))
}

/// Size of the object at `at`.
///
/// # Panics
///
/// Panics when `at` does not hold an initialised header; walking into
/// uninitialised memory means a region is not parsable.
#[must_use]
pub fn object_size(words: &[AtomicUsize], at: usize) -> usize {
    let class = class_word(words, at);
    assert!(
        class.kind().is_some(),
        "no object header at word {at}: region is not parsable"
    );
    class.size()
}

/// Initialises an object header and clears its reference slots.
pub fn write_object(words: &[AtomicUsize], at: usize, size: usize, refs: usize) {
    let class = ClassWord::new(ObjectKind::Object, size, refs);
    for slot in &words[at + HEADER_WORDS..at + HEADER_WORDS + refs] {
        slot.store(Address::NULL_SLOT, Ordering::Relaxed);
    }
    words[at].store(MarkWord::prototype().raw(), Ordering::Relaxed);
    words[at + 1].store(class.raw(), Ordering::Release);
}

/// Overwrites `[at, at + size)` with a single filler.
///
/// Only the header is written; the filler's payload is never read.
pub fn write_filler(words: &[AtomicUsize], at: usize, size: usize) {
    words[at].store(MarkWord::prototype().raw(), Ordering::Relaxed);
    words[at + 1].store(ClassWord::filler(size).raw(), Ordering::Release);
}

/// Copies `size` words from `from` to `to`.
///
/// The destination header is published last so a concurrent walker never sees
/// a class word before the payload it describes.
pub fn copy_words(words: &[AtomicUsize], from: usize, to: usize, size: usize) {
    for i in HEADER_WORDS..size {
        words[to + i].store(words[from + i].load(Ordering::Relaxed), Ordering::Relaxed);
    }
    let mark = mark_word(words, from);
    // A racing evacuator may already have forwarded the original; the copy
    // must never carry a forwarding tag.
    let mark = if mark.is_forwarded() {
        MarkWord::prototype()
    } else {
        mark
    };
    words[to].store(mark.raw(), Ordering::Relaxed);
    words[to + 1].store(class_word(words, from).raw(), Ordering::Release);
}

/// Adds `additional` to the age of an object nobody else can see yet.
pub fn increase_object_age(words: &[AtomicUsize], at: usize, additional: u8) {
    let mark = mark_word(words, at);
    debug_assert!(!mark.is_forwarded(), "aging a forwarded object at word {at}");
    let aged = mark.with_age(mark.age().saturating_add(additional));
    words[at].store(aged.raw(), Ordering::Release);
}

/// Installs `copy` as forwardee of the object at `at`, unless another thread
/// already did. Returns whichever copy is now canonical.
pub fn try_update_forwardee(words: &[AtomicUsize], at: usize, copy: Address) -> Address {
    let mut current = mark_word(words, at);
    loop {
        if let Some(winner) = current.forwardee() {
            return winner;
        }
        match words[at].compare_exchange_weak(
            current.raw(),
            MarkWord::forwarded_to(copy).raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return copy,
            Err(actual) => current = MarkWord(actual),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> Vec<AtomicUsize> {
        (0..n).map(|_| AtomicUsize::new(0)).collect()
    }

    #[test]
    fn test_class_word_fields() {
        let c = ClassWord::new(ObjectKind::Object, 12, 3);
        assert_eq!(c.kind(), Some(ObjectKind::Object));
        assert_eq!(c.size(), 12);
        assert_eq!(c.refs(), 3);
        assert!(!c.is_filler());
        assert!(ClassWord::filler(2).is_filler());
        assert_eq!(ClassWord::from_raw(0).kind(), None);
    }

    #[test]
    #[should_panic(expected = "do not fit")]
    fn test_refs_must_fit() {
        let _ = ClassWord::new(ObjectKind::Object, 4, 3);
    }

    #[test]
    fn test_mark_word_age_saturates() {
        let m = MarkWord::prototype().with_age(3);
        assert_eq!(m.age(), 3);
        assert_eq!(m.with_age(40).age(), MAX_AGE);
        assert!(!m.is_forwarded());
    }

    #[test]
    fn test_forwarding_round_trip() {
        let m = MarkWord::forwarded_to(Address::new(0x1234));
        assert!(m.is_forwarded());
        assert_eq!(m.forwardee(), Some(Address::new(0x1234)));
        assert_eq!(m.age(), 0);
    }

    #[test]
    fn test_only_first_forwardee_wins() {
        let w = words(8);
        write_object(&w, 0, 4, 1);
        let first = try_update_forwardee(&w, 0, Address::new(100));
        let second = try_update_forwardee(&w, 0, Address::new(200));
        assert_eq!(first, Address::new(100));
        assert_eq!(second, Address::new(100));
    }

    #[test]
    fn test_copy_clears_forwarding_tag() {
        let w = words(16);
        write_object(&w, 0, 4, 1);
        w[2].store(77, Ordering::Relaxed);
        w[3].store(99, Ordering::Relaxed);
        let _ = try_update_forwardee(&w, 0, Address::new(8));
        copy_words(&w, 0, 8, 4);
        assert!(!mark_word(&w, 8).is_forwarded());
        assert_eq!(object_size(&w, 8), 4);
        assert_eq!(w[10].load(Ordering::Relaxed), 77);
        assert_eq!(w[11].load(Ordering::Relaxed), 99);
    }
}
