//! Growable byte buffer with head/tail indices, and a non-owning byte view.
//!
//! Grounded on the buffer contract `conn.cc`/`codec.cc` assume of
//! `handy::Buffer` (`makeRoom`, `consume`, `addSize`, `absorb`) - the
//! original's own `buffer.h` wasn't in the retrieved source, so the shape
//! here is reconstructed from every call site that touches one.

use std::cmp;

/// A growable region of bytes with a live span `[b, e)` inside `data`.
///
/// Bytes before `b` are dead space left by a previous `consume`; bytes at or
/// after `e` are uninitialized capacity. This mirrors a `read(2)`/`write(2)`
/// staging buffer: data accumulates at the tail and is drained from the
/// head.
#[derive(Clone, Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    b: usize,
    e: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::default()
    }

    pub fn size(&self) -> usize {
        self.e - self.b
    }

    pub fn is_empty(&self) -> bool {
        self.b == self.e
    }

    pub fn space(&self) -> usize {
        self.data.len() - self.e
    }

    /// The live payload.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.b..self.e]
    }

    /// Ensures at least `len` writable bytes exist at the tail, then returns
    /// the writable region. Prefers (1) existing tail space, (2) shifting
    /// the payload down to offset 0 when that frees enough room, (3)
    /// reallocating to at least double the current capacity.
    pub fn make_room(&mut self, len: usize) -> &mut [u8] {
        if self.space() < len {
            let size = self.size();
            if self.b > 0 && size + len <= self.data.len() / 2 {
                self.data.copy_within(self.b..self.e, 0);
                self.b = 0;
                self.e = size;
            }
            if self.space() < len {
                let want = cmp::max(cmp::max(len, self.data.len() * 2), size + len);
                self.data.resize(self.e + want, 0);
            }
        }
        &mut self.data[self.e..]
    }

    /// Records that `n` freshly-written bytes at the tail are now valid
    /// payload (the caller writes into the slice `make_room` returned,
    /// then calls this with however many bytes it actually produced).
    pub fn add_size(&mut self, n: usize) {
        debug_assert!(self.e + n <= self.data.len());
        self.e += n;
    }

    /// Drops `n` bytes from the head. Once the buffer empties, indices reset
    /// to 0 so later `make_room` calls don't keep chasing dead space.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.size());
        self.b += n;
        if self.b == self.e {
            self.b = 0;
            self.e = 0;
        }
    }

    /// If `self` is empty, swaps storage with `other` in O(1); otherwise
    /// appends `other`'s payload and clears it. Either way `other` ends up
    /// empty and `self` holds the combined bytes.
    pub fn absorb(&mut self, other: &mut Buffer) {
        if self.is_empty() {
            std::mem::swap(self, other);
        } else {
            let len = other.size();
            self.make_room(len);
            let start = other.b;
            self.data[self.e..self.e + len].copy_from_slice(&other.data[start..other.e]);
            self.add_size(len);
        }
        other.b = 0;
        other.e = 0;
    }

    /// Appends raw bytes to the tail, growing as needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.make_room(bytes.len());
        let e = self.e;
        self.data[e..e + bytes.len()].copy_from_slice(bytes);
        self.add_size(bytes.len());
    }
}

/// A non-owning view into a byte slice, named distinctly from `&[u8]` so the
/// codec contract (`Codec::try_decode`) reads as "a borrowed message", not
/// "some bytes". Equality and ordering are by content.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slice<'a>(&'a [u8]);

impl<'a> Slice<'a> {
    pub fn new(bytes: &'a [u8]) -> Slice<'a> {
        Slice(bytes)
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> From<&'a [u8]> for Slice<'a> {
    fn from(bytes: &'a [u8]) -> Slice<'a> {
        Slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_room_then_consume_resets_indices() {
        let mut buf = Buffer::new();
        buf.make_room(4);
        buf.as_mut_for_test()[..4].copy_from_slice(b"abcd");
        buf.add_size(4);
        assert_eq!(buf.as_slice(), b"abcd");
        buf.consume(4);
        assert!(buf.is_empty());
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn absorb_swaps_when_self_empty() {
        let mut a = Buffer::new();
        let mut b = Buffer::new();
        b.append(b"hello");
        a.absorb(&mut b);
        assert_eq!(a.as_slice(), b"hello");
        assert!(b.is_empty());
    }

    #[test]
    fn absorb_appends_when_self_nonempty() {
        let mut a = Buffer::new();
        a.append(b"hello ");
        let mut b = Buffer::new();
        b.append(b"world");
        a.absorb(&mut b);
        assert_eq!(a.as_slice(), b"hello world");
        assert!(b.is_empty());
    }

    #[test]
    fn consume_partial_keeps_remainder() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        buf.consume(6);
        assert_eq!(buf.as_slice(), b"world");
    }

    impl Buffer {
        fn as_mut_for_test(&mut self) -> &mut [u8] {
            let e = self.e;
            &mut self.data[e..]
        }
    }
}
