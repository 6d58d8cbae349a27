//! Intrusive first-fit allocator over a byte arena.
//!
//! Free chunks carry their bookkeeping inline: the first `pointer_bytes`
//! bytes of a chunk hold its size and the next `pointer_bytes` bytes hold the
//! address of the following free chunk. Pointers are stored as `address + 1`
//! so that zero means "none". The head pointer lives in a separate header
//! buffer so the arena can start at any offset of a page.
//!
//! # Invariants
//!
//! - Free chunks are linked in strictly increasing address order
//! - No two free chunks are adjacent (freeing coalesces eagerly)
//! - An allocated chunk keeps its size field, so `free` needs only the address

#![allow(clippy::cast_possible_truncation)]

use std::fmt;

use crate::storage::codec::{MAX_WIDTH, byte_width, read_be, write_be};

/// Errors returned by [`FreeList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeListError {
    /// No free chunk can hold the request.
    OutOfMemory { requested: usize },
    /// The address is not the start of an allocated chunk.
    InvalidAddress(usize),
}

impl fmt::Display for FreeListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory allocating {requested} bytes")
            }
            Self::InvalidAddress(addr) => write!(f, "address {addr} is not allocated"),
        }
    }
}

impl std::error::Error for FreeListError {}

/// First-fit allocator managing `arena` with its list head stored in `head`.
pub struct FreeList<H, A> {
    head: H,
    arena: A,
    pointer_bytes: usize,
}

impl<H, A> FreeList<H, A>
where
    H: AsRef<[u8]> + AsMut<[u8]>,
    A: AsRef<[u8]> + AsMut<[u8]>,
{
    /// Wrap existing buffers. The pointer width is the length of `head`.
    ///
    /// # Panics
    /// Panics if `head` is not 1..=8 bytes or cannot address the whole arena.
    pub fn new(head: H, arena: A) -> Self {
        let pointer_bytes = head.as_ref().len();
        assert!(
            (1..=MAX_WIDTH).contains(&pointer_bytes),
            "pointer width must be 1..=8 bytes"
        );
        assert!(
            byte_width(arena.as_ref().len() as u64 + 1) <= pointer_bytes,
            "arena too large for {pointer_bytes}-byte pointers"
        );
        Self {
            head,
            arena,
            pointer_bytes,
        }
    }

    /// Bytes of bookkeeping at the start of every chunk.
    #[must_use]
    pub const fn header_bytes(&self) -> usize {
        2 * self.pointer_bytes
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.as_ref().len()
    }

    #[must_use]
    pub fn arena(&self) -> &[u8] {
        self.arena.as_ref()
    }

    /// Mark the whole arena as a single free chunk.
    pub fn reset(&mut self) {
        let capacity = self.capacity();
        if capacity < self.header_bytes() {
            self.write_first(None);
            return;
        }
        self.write_first(Some(0));
        self.write_size(0, capacity);
        self.write_next(0, None);
    }

    /// Allocate `n` usable bytes, returning the chunk address.
    pub fn alloc(&mut self, n: usize) -> Result<usize, FreeListError> {
        let hb = self.header_bytes();
        let needed = n + hb;

        let mut prev = None;
        let mut curr = self.read_first();
        while let Some(chunk) = curr {
            let size = self.read_size(chunk);
            if size >= needed {
                let mut next = self.read_next(chunk);
                let taken = if size - needed >= hb {
                    let rest = chunk + needed;
                    self.write_size(rest, size - needed);
                    self.write_next(rest, next);
                    next = Some(rest);
                    needed
                } else {
                    size
                };

                match prev {
                    None => self.write_first(next),
                    Some(p) => self.write_next(p, next),
                }
                self.write_size(chunk, taken);
                return Ok(chunk);
            }
            prev = Some(chunk);
            curr = self.read_next(chunk);
        }

        Err(FreeListError::OutOfMemory { requested: n })
    }

    /// Return the chunk at `addr` to the free list.
    pub fn free(&mut self, addr: usize) -> Result<(), FreeListError> {
        if addr + self.header_bytes() > self.capacity() {
            return Err(FreeListError::InvalidAddress(addr));
        }
        let size = self.read_size(addr);
        if size < self.header_bytes() || addr + size > self.capacity() {
            return Err(FreeListError::InvalidAddress(addr));
        }

        let Some(first) = self.read_first() else {
            self.write_first(Some(addr));
            self.write_next(addr, None);
            return Ok(());
        };

        if addr < first {
            if addr + size > first {
                return Err(FreeListError::InvalidAddress(addr));
            }
            self.write_first(Some(addr));
            if addr + size == first {
                let merged = size + self.read_size(first);
                let next = self.read_next(first);
                self.write_size(addr, merged);
                self.write_next(addr, next);
            } else {
                self.write_next(addr, Some(first));
            }
            return Ok(());
        }

        let mut prev = first;
        let mut curr = self.read_next(first);
        loop {
            let prev_size = self.read_size(prev);
            if prev + prev_size > addr {
                return Err(FreeListError::InvalidAddress(addr));
            }
            let touches_prev = prev + prev_size == addr;

            match curr {
                Some(chunk) if chunk > addr => {
                    if addr + size > chunk {
                        return Err(FreeListError::InvalidAddress(addr));
                    }
                    let touches_curr = addr + size == chunk;
                    let chunk_size = self.read_size(chunk);
                    let chunk_next = self.read_next(chunk);

                    match (touches_prev, touches_curr) {
                        (true, true) => {
                            self.write_size(prev, prev_size + size + chunk_size);
                            self.write_next(prev, chunk_next);
                        }
                        (true, false) => self.write_size(prev, prev_size + size),
                        (false, true) => {
                            self.write_next(prev, Some(addr));
                            self.write_size(addr, size + chunk_size);
                            self.write_next(addr, chunk_next);
                        }
                        (false, false) => {
                            self.write_next(prev, Some(addr));
                            self.write_next(addr, Some(chunk));
                        }
                    }
                    return Ok(());
                }
                Some(chunk) => {
                    prev = chunk;
                    curr = self.read_next(chunk);
                }
                None => {
                    if touches_prev {
                        self.write_size(prev, prev_size + size);
                    } else {
                        self.write_next(prev, Some(addr));
                        self.write_next(addr, None);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Usable bytes of the allocated chunk at `addr`.
    #[must_use]
    pub fn payload(&self, addr: usize) -> &[u8] {
        let size = self.read_size(addr);
        &self.arena.as_ref()[addr + self.header_bytes()..addr + size]
    }

    /// Mutable usable bytes of the allocated chunk at `addr`.
    pub fn payload_mut(&mut self, addr: usize) -> &mut [u8] {
        let size = self.read_size(addr);
        let start = addr + self.header_bytes();
        &mut self.arena.as_mut()[start..addr + size]
    }

    /// `(address, size)` of every free chunk in address order.
    pub fn free_chunks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        std::iter::successors(self.read_first(), |&chunk| self.read_next(chunk))
            .map(|chunk| (chunk, self.read_size(chunk)))
    }

    fn read_first(&self) -> Option<usize> {
        decode_pointer(read_be(self.head.as_ref()))
    }

    fn write_first(&mut self, first: Option<usize>) {
        write_be(self.head.as_mut(), encode_pointer(first));
    }

    fn read_size(&self, addr: usize) -> usize {
        read_be(&self.arena.as_ref()[addr..addr + self.pointer_bytes]) as usize
    }

    fn write_size(&mut self, addr: usize, size: usize) {
        let pb = self.pointer_bytes;
        write_be(&mut self.arena.as_mut()[addr..addr + pb], size as u64);
    }

    fn read_next(&self, addr: usize) -> Option<usize> {
        let pb = self.pointer_bytes;
        decode_pointer(read_be(&self.arena.as_ref()[addr + pb..addr + 2 * pb]))
    }

    fn write_next(&mut self, addr: usize, next: Option<usize>) {
        let pb = self.pointer_bytes;
        write_be(
            &mut self.arena.as_mut()[addr + pb..addr + 2 * pb],
            encode_pointer(next),
        );
    }
}

const fn encode_pointer(pointer: Option<usize>) -> u64 {
    match pointer {
        Some(p) => p as u64 + 1,
        None => 0,
    }
}

const fn decode_pointer(raw: u64) -> Option<usize> {
    if raw == 0 { None } else { Some(raw as usize - 1) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(capacity: usize) -> FreeList<[u8; 2], Vec<u8>> {
        let mut list = FreeList::new([0u8; 2], vec![0u8; capacity]);
        list.reset();
        list
    }

    #[test]
    fn test_alloc_free_alloc_reuses_address() {
        let mut list = list(256);
        let a = list.alloc(32).expect("alloc");
        list.free(a).expect("free");
        let b = list.alloc(32).expect("alloc");
        assert_eq!(a, b);
        assert_eq!(list.free_chunks().collect::<Vec<_>>(), vec![(36, 220)]);
    }

    #[test]
    fn test_adjacent_frees_coalesce() {
        let mut list = list(128);
        let a = list.alloc(10).expect("alloc a");
        let b = list.alloc(10).expect("alloc b");
        let c = list.alloc(10).expect("alloc c");
        assert_eq!((a, b, c), (0, 14, 28));

        list.free(a).expect("free a");
        list.free(b).expect("free b");
        assert_eq!(
            list.free_chunks().collect::<Vec<_>>(),
            vec![(0, 28), (42, 86)]
        );

        // Freeing the middle piece bridges both neighbours.
        list.free(c).expect("free c");
        assert_eq!(list.free_chunks().collect::<Vec<_>>(), vec![(0, 128)]);
    }

    #[test]
    fn test_free_out_of_order_keeps_address_order() {
        let mut list = list(120);
        let chunks: Vec<usize> = (0..5).map(|_| list.alloc(8).expect("alloc")).collect();
        list.free(chunks[3]).expect("free");
        list.free(chunks[1]).expect("free");
        let free: Vec<usize> = list.free_chunks().map(|(addr, _)| addr).collect();
        assert_eq!(free, vec![chunks[1], chunks[3], 60]);

        list.free(chunks[2]).expect("free");
        assert_eq!(
            list.free_chunks().collect::<Vec<_>>(),
            vec![(chunks[1], 36), (60, 60)]
        );
    }

    #[test]
    fn test_first_fit_skips_small_chunks() {
        let mut list = list(100);
        let a = list.alloc(4).expect("alloc");
        let _b = list.alloc(4).expect("alloc");
        list.free(a).expect("free");

        // The first free chunk (8 bytes) is too small for 20.
        let c = list.alloc(20).expect("alloc");
        assert_eq!(c, 16);
        // But a 4-byte request fits into it.
        assert_eq!(list.alloc(4).expect("alloc"), a);
    }

    #[test]
    fn test_small_remainder_is_not_split() {
        let mut list = list(20);
        // 20 - (14 + 4) = 2 bytes left, too small for a header.
        let a = list.alloc(14).expect("alloc");
        assert_eq!(list.payload(a).len(), 16);
        assert_eq!(list.free_chunks().count(), 0);
        assert_eq!(
            list.alloc(1),
            Err(FreeListError::OutOfMemory { requested: 1 })
        );
    }

    #[test]
    fn test_payload_is_writable() {
        let mut list = list(64);
        let a = list.alloc(5).expect("alloc");
        list.payload_mut(a).copy_from_slice(b"hello");
        let b = list.alloc(5).expect("alloc");
        list.payload_mut(b).copy_from_slice(b"world");
        assert_eq!(list.payload(a), b"hello");
        assert_eq!(list.payload(b), b"world");
    }

    #[test]
    fn test_double_free_is_rejected() {
        let mut list = list(64);
        let a = list.alloc(8).expect("alloc");
        let _b = list.alloc(8).expect("alloc");
        list.free(a).expect("free");
        assert_eq!(list.free(a), Err(FreeListError::InvalidAddress(a)));
    }

    #[test]
    fn test_borrowed_buffers() {
        let mut head = [0u8; 1];
        let mut arena = [0u8; 40];
        let mut list = FreeList::new(&mut head[..], &mut arena[..]);
        list.reset();
        let a = list.alloc(6).expect("alloc");
        assert_eq!(a, 0);
        list.free(a).expect("free");
        assert_eq!(list.free_chunks().collect::<Vec<_>>(), vec![(0, 40)]);
    }
}
