// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A circular queue of fixed-size records, backed by borrowed memory.
//!
//! `Mailbox` is the record-granular sibling of a byte FIFO: every transfer
//! moves exactly one whole `msg_size`-byte record, so a consumer can never
//! observe half a message. The backing slice is treated as `len /
//! msg_size` slots, one of which is always kept empty to tell a full
//! mailbox from an empty one — usable capacity is `len / msg_size - 1`
//! records.
//!
//! Like the byte FIFO, one producer and one consumer may operate from
//! either side of an interrupt boundary without a lock (each side mutates
//! only its own index), and the optional `data_added` hook lets the
//! producer side wake a consumer. The single-`&mut` ownership story is the
//! caller's to arrange.

#![cfg_attr(not(test), no_std)]

/// Error returned when writing into a full mailbox.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Full;

/// Error returned when reading from an empty mailbox.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Empty;

/// A single-producer/single-consumer queue of fixed-size records.
#[derive(Debug)]
pub struct Mailbox<'s> {
    buf: &'s mut [u8],
    msg_size: usize,
    read: usize,
    write: usize,
    data_added: Option<fn()>,
}

impl<'s> Mailbox<'s> {
    /// Creates an empty mailbox over `backing` with `msg_size`-byte
    /// records. `data_added`, if given, is called after every write
    /// operation that stored at least one record.
    ///
    /// # Panics
    ///
    /// If `msg_size` is zero or `backing` is not a whole number of
    /// records. Both are configuration bugs; the slot math below depends
    /// on the indices landing exactly on `backing.len()`.
    pub fn new(
        backing: &'s mut [u8],
        msg_size: usize,
        data_added: Option<fn()>,
    ) -> Self {
        assert!(msg_size > 0);
        assert!(backing.len() % msg_size == 0);
        Self {
            buf: backing,
            msg_size,
            read: 0,
            write: 0,
            data_added,
        }
    }

    /// Size of one record, in bytes.
    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    /// Number of records the mailbox can hold. One slot stays empty, so
    /// this is one less than the slot count.
    pub fn capacity(&self) -> usize {
        self.buf.len() / self.msg_size - 1
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    pub fn is_full(&self) -> bool {
        self.bump(self.write) == self.read
    }

    /// Advances a slot index by one record, wrapping at the end.
    fn bump(&self, pos: usize) -> usize {
        let next = pos + self.msg_size;
        if next == self.buf.len() {
            0
        } else {
            next
        }
    }

    /// Stores one record without firing the callback.
    fn push(&mut self, msg: &[u8]) -> Result<(), Full> {
        let next = self.bump(self.write);
        if next == self.read {
            return Err(Full);
        }
        self.buf[self.write..self.write + self.msg_size].copy_from_slice(msg);
        self.write = next;
        Ok(())
    }

    /// Appends one record, failing when the mailbox is full.
    ///
    /// # Panics
    ///
    /// If `msg` is not exactly one record long.
    pub fn write(&mut self, msg: &[u8]) -> Result<(), Full> {
        assert!(msg.len() == self.msg_size);
        self.push(msg)?;
        if let Some(hook) = self.data_added {
            hook();
        }
        Ok(())
    }

    /// Appends records from `msgs` until the mailbox fills, returning how
    /// many records were stored. The callback fires at most once, and only
    /// if at least one record was stored.
    ///
    /// # Panics
    ///
    /// If `msgs` is not a whole number of records.
    pub fn write_all(&mut self, msgs: &[u8]) -> usize {
        assert!(msgs.len() % self.msg_size == 0);
        let mut n = 0;
        for msg in msgs.chunks_exact(self.msg_size) {
            if self.push(msg).is_err() {
                break;
            }
            n += 1;
        }
        if n > 0 {
            if let Some(hook) = self.data_added {
                hook();
            }
        }
        n
    }

    /// Removes the oldest record into `out`, failing when empty.
    ///
    /// # Panics
    ///
    /// If `out` is not exactly one record long.
    pub fn read(&mut self, out: &mut [u8]) -> Result<(), Empty> {
        assert!(out.len() == self.msg_size);
        if self.is_empty() {
            return Err(Empty);
        }
        out.copy_from_slice(&self.buf[self.read..self.read + self.msg_size]);
        self.read = self.bump(self.read);
        Ok(())
    }

    /// Reads up to `out.len() / msg_size` records, returning how many were
    /// read.
    ///
    /// # Panics
    ///
    /// If `out` is not a whole number of records.
    pub fn read_all(&mut self, out: &mut [u8]) -> usize {
        assert!(out.len() % self.msg_size == 0);
        let msg_size = self.msg_size;
        let mut n = 0;
        for slot in out.chunks_exact_mut(msg_size) {
            if self.read(slot).is_err() {
                break;
            }
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn capacity_reserves_one_slot() {
        let mut backing = [0; 12];
        let mb = Mailbox::new(&mut backing, 4, None);
        assert_eq!(mb.capacity(), 2);

        let mut backing = [0; 64];
        let mb = Mailbox::new(&mut backing, 8, None);
        assert_eq!(mb.capacity(), 7);
    }

    #[test]
    fn accepts_exactly_capacity_records() {
        let mut backing = [0; 16];
        let mut mb = Mailbox::new(&mut backing, 4, None);
        assert_eq!(mb.capacity(), 3);

        mb.write(&[1, 1, 1, 1]).unwrap();
        mb.write(&[2, 2, 2, 2]).unwrap();
        mb.write(&[3, 3, 3, 3]).unwrap();
        assert_eq!(mb.write(&[4, 4, 4, 4]), Err(Full));
        assert!(mb.is_full());

        // One record out, one record back in; then drain in FIFO order.
        let mut rec = [0; 4];
        mb.read(&mut rec).unwrap();
        assert_eq!(rec, [1, 1, 1, 1]);
        mb.write(&[4, 4, 4, 4]).unwrap();

        let mut drained = [0; 12];
        assert_eq!(mb.read_all(&mut drained), 3);
        assert_eq!(drained, [2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4]);
        assert!(mb.is_empty());
    }

    #[test]
    fn transfers_move_whole_records_only() {
        let mut backing = [0; 24];
        let mut mb = Mailbox::new(&mut backing, 8, None);

        let msg = *b"deadline";
        mb.write(&msg).unwrap();

        let mut out = [0; 8];
        mb.read(&mut out).unwrap();
        assert_eq!(out, msg);
        assert_eq!(mb.read(&mut out), Err(Empty));
    }

    #[test]
    fn wraparound_keeps_record_alignment() {
        let mut backing = [0; 12];
        let mut mb = Mailbox::new(&mut backing, 4, None);

        // Cycle enough records through to wrap the indices repeatedly.
        for round in 0..10u8 {
            mb.write(&[round; 4]).unwrap();
            mb.write(&[round ^ 0xFF; 4]).unwrap();
            assert_eq!(mb.write(&[0xAA; 4]), Err(Full));

            let mut out = [0; 4];
            mb.read(&mut out).unwrap();
            assert_eq!(out, [round; 4]);
            mb.read(&mut out).unwrap();
            assert_eq!(out, [round ^ 0xFF; 4]);
            assert!(mb.is_empty());
        }
    }

    #[test]
    fn write_all_reports_partial_store() {
        let mut backing = [0; 12];
        let mut mb = Mailbox::new(&mut backing, 4, None);

        let msgs = [1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3];
        assert_eq!(mb.write_all(&msgs), 2);

        let mut out = [0; 12];
        assert_eq!(mb.read_all(&mut out), 2);
        assert_eq!(&out[..8], &msgs[..8]);
    }

    static ADDED: AtomicUsize = AtomicUsize::new(0);

    fn count_added() {
        ADDED.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn callback_fires_once_per_storing_write() {
        ADDED.store(0, Ordering::Relaxed);
        let mut backing = [0; 12];
        let mut mb = Mailbox::new(&mut backing, 4, Some(count_added));

        mb.write(&[7; 4]).unwrap();
        assert_eq!(ADDED.load(Ordering::Relaxed), 1);
        assert_eq!(mb.write_all(&[8, 8, 8, 8, 9, 9, 9, 9]), 1);
        assert_eq!(ADDED.load(Ordering::Relaxed), 2);

        // Full mailbox: nothing stored, nothing fired.
        assert_eq!(mb.write(&[1; 4]), Err(Full));
        assert_eq!(mb.write_all(&[1, 1, 1, 1]), 0);
        assert_eq!(ADDED.load(Ordering::Relaxed), 2);
    }

    #[test]
    #[should_panic]
    fn ragged_backing_is_rejected() {
        let mut backing = [0; 10];
        let _ = Mailbox::new(&mut backing, 4, None);
    }

    #[test]
    #[should_panic]
    fn zero_record_size_is_rejected() {
        let mut backing = [0; 8];
        let _ = Mailbox::new(&mut backing, 0, None);
    }
}
