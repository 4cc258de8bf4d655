// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-direction connection scratch buffer: a single backing allocation
//! with a `(pos, len)` window over the unread/unsent bytes, compacted in
//! place (`tidy`) instead of ever reallocating.

use crate::slice::{OwnedSharedSlice, SharedSlice};

pub struct ScratchBuffer {
    storage: OwnedSharedSlice,
    pos: usize,
    len: usize,
}

impl ScratchBuffer {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            storage: OwnedSharedSlice::zeroed(cap),
            pos: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    fn free_space(&self) -> usize {
        self.storage.capacity() - self.pos - self.len
    }

    /// Copies buffered bytes into `dst`, consuming them (original `Read`).
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len);
        dst[..n].copy_from_slice(&self.storage.as_slice()[self.pos..self.pos + n]);
        if n < self.len {
            self.pos += n;
            self.len -= n;
        } else {
            self.pos = 0;
            self.len = 0;
        }
        n
    }

    /// Appends `src`, compacting first if there isn't room (original
    /// `Append`, which tidies eagerly rather than growing the buffer).
    pub fn append(&mut self, src: &[u8]) -> usize {
        if src.len() > self.free_space() {
            self.tidy();
        }
        let start = self.pos + self.len;
        let cap = self.storage.capacity();
        let space = &mut self.storage.as_mut_slice()[start..cap];
        let n = src.len().min(space.len());
        space[..n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    /// Slides unread bytes down to offset zero, reclaiming the space ahead
    /// of `pos`. Returns whether anything was moved.
    pub fn tidy(&mut self) -> bool {
        if self.pos == 0 {
            return false;
        }
        let (pos, len) = (self.pos, self.len);
        self.storage.as_mut_slice().copy_within(pos..pos + len, 0);
        self.pos = 0;
        true
    }

    /// Advances the read cursor past `offset` bytes already handed to the
    /// stack by a successful write.
    pub fn move_cursor(&mut self, offset: usize) {
        self.len -= offset;
        self.pos += offset;
    }

    /// View over the free space at the tail, for the worker's `read` target.
    pub fn free_view(&mut self) -> SharedSlice {
        let start = self.pos + self.len;
        let free = self.free_space();
        self.storage.view(start, free)
    }

    /// Records that `n` bytes landed in the region from the last
    /// `free_view` call.
    pub fn commit(&mut self, n: usize) {
        self.len += n;
    }

    /// View over the unread/unsent data, for the worker's `write` source.
    pub fn data_view(&mut self) -> SharedSlice {
        self.storage.view(self.pos, self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_round_trips() {
        let mut buf = ScratchBuffer::with_capacity(16);
        assert_eq!(buf.append(b"hello"), 5);
        let mut out = [0u8; 5];
        assert_eq!(buf.read(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_read_advances_cursor_without_resetting() {
        let mut buf = ScratchBuffer::with_capacity(16);
        buf.append(b"data_xxxx");
        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out), 4);
        assert_eq!(&out, b"data");
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn tidy_reclaims_space_after_partial_consume() {
        let mut buf = ScratchBuffer::with_capacity(8);
        buf.append(b"abcd");
        let mut out = [0u8; 2];
        buf.read(&mut out);
        assert_eq!(buf.len(), 2);
        assert!(buf.tidy());
        assert_eq!(buf.data_view().len(), 2);
    }

    #[test]
    fn move_cursor_shrinks_unsent_region() {
        let mut buf = ScratchBuffer::with_capacity(8);
        buf.append(b"abcdef");
        buf.move_cursor(3);
        assert_eq!(buf.len(), 3);
    }
}
