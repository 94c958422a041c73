//! Virtual memory reservation for the strata region heap.
//!
//! The collector reserves its whole heap up front as one anonymous mapping and
//! carves it into fixed-size regions. Recycled regions hand their pages back
//! to the OS with [`Reservation::discard`], after which they read as zero.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the system page size.
#[must_use]
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Rounds `value` up to a multiple of `align`, which must be a power of two.
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Rounds `value` down to a multiple of `align`, which must be a power of two.
#[must_use]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// An anonymous, read-write, zero-initialised memory reservation.
///
/// The mapping is released when the reservation is dropped.
pub struct Reservation {
    inner: os::MmapInner,
}

impl Reservation {
    /// Reserves and commits `len` bytes, rounded up to the allocation granularity.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the mapping cannot be created.
    pub fn reserve(len: usize) -> io::Result<Self> {
        ReserveOptions::new().len(len).reserve()
    }

    /// Start of the reservation. Always aligned to the allocation granularity.
    #[must_use]
    pub fn start(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Length of the reservation in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the reservation is empty. Never true for a live reservation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Gives the pages backing `[offset, offset + len)` back to the OS.
    ///
    /// The range stays mapped and reads as zero afterwards. Partial pages at
    /// either end are zeroed in place.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the kernel rejects the request.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside the reservation.
    pub fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len()),
            "discard range {offset:#x}+{len:#x} outside reservation of {:#x} bytes",
            self.len()
        );
        if len == 0 {
            return Ok(());
        }

        let page = page_size();
        let first_page = align_up(offset, page);
        let last_page = align_down(offset + len, page);

        if first_page >= last_page {
            // SAFETY: range checked against the reservation above.
            unsafe { std::ptr::write_bytes(self.start().add(offset), 0, len) };
            return Ok(());
        }

        // SAFETY: both partial ranges lie inside the reservation.
        unsafe {
            std::ptr::write_bytes(self.start().add(offset), 0, first_page - offset);
            std::ptr::write_bytes(self.start().add(last_page), 0, offset + len - last_page);
        }

        // SAFETY: page-aligned subrange of our own mapping.
        unsafe { self.inner.discard(first_page, last_page - first_page) }
    }
}

// SAFETY: the reservation is plain memory. Synchronisation of its contents is
// the user's responsibility.
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

/// Options for creating a [`Reservation`].
#[derive(Debug, Clone)]
pub struct ReserveOptions {
    len: usize,
    populate: bool,
    no_reserve: bool,
}

impl ReserveOptions {
    /// New options with length 0. A length must be set before reserving.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            populate: false,
            no_reserve: true,
        }
    }

    /// Sets the length of the reservation in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Pre-faults the page tables (`MAP_POPULATE` on Linux).
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Skips reserving swap space (`MAP_NORESERVE` where supported). On by default.
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates the reservation.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidInput` for a zero length, or with the OS error.
    pub fn reserve(&self) -> io::Result<Reservation> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        let len = align_up(self.len, allocation_granularity());
        // SAFETY: anonymous mapping without an address hint.
        let inner = unsafe { os::MmapInner::map_anon(len, self.populate, self.no_reserve)? };

        Ok(Reservation { inner })
    }
}

impl Default for ReserveOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size_is_power_of_two() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0);
        assert!(allocation_granularity() >= ps);
    }

    #[test]
    fn test_reserve_rounds_to_granularity() {
        let r = Reservation::reserve(100).expect("reserve");
        assert_eq!(r.len() % allocation_granularity(), 0);
        assert_eq!(r.start() as usize % allocation_granularity(), 0);
    }

    #[test]
    fn test_zero_length_rejected() {
        let err = ReserveOptions::new().reserve().err().expect("must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_discard_zeroes_contents() {
        let len = 4 * page_size();
        let r = Reservation::reserve(len).expect("reserve");
        unsafe {
            ptr::write_bytes(r.start(), 0xAB, len);
        }

        // Unaligned on both ends to exercise the partial-page path.
        r.discard(17, 2 * page_size()).expect("discard");

        unsafe {
            assert_eq!(ptr::read(r.start().add(16)), 0xAB);
            assert_eq!(ptr::read(r.start().add(17)), 0);
            assert_eq!(ptr::read(r.start().add(page_size() + 5)), 0);
            assert_eq!(ptr::read(r.start().add(17 + 2 * page_size() - 1)), 0);
            assert_eq!(ptr::read(r.start().add(17 + 2 * page_size())), 0xAB);
        }
    }

    #[test]
    #[should_panic(expected = "outside reservation")]
    fn test_discard_out_of_range_panics() {
        let r = Reservation::reserve(page_size()).expect("reserve");
        let _ = r.discard(0, r.len() + 1);
    }
}
