// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest memory access for device emulation.
//!
//! Guest memory is shared with an untrusted, concurrently running guest, so
//! every access is bounds checked and goes through atomics. Naturally aligned
//! accesses of 1, 2, 4, or 8 bytes are single atomic operations and cannot be
//! observed torn. The ordering of individual accesses is relaxed; callers
//! that publish data to the guest use explicit fences.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::ops::Range;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

const WORD: u64 = size_of::<u64>() as u64;

/// A memory access error returned by one of the [`GuestMemory`] methods.
#[derive(Debug, Error)]
#[error("guest memory '{debug_name}': {op} error: {range:#x?} is outside {limit:#x} bytes")]
pub struct GuestMemoryError {
    op: GuestMemoryOperation,
    debug_name: Arc<str>,
    range: Range<u64>,
    limit: u64,
}

impl GuestMemoryError {
    /// The guest address range that could not be accessed, relative to the
    /// memory object the access was made through.
    pub fn range(&self) -> Range<u64> {
        self.range.clone()
    }
}

#[derive(Debug, Copy, Clone)]
enum GuestMemoryOperation {
    Read,
    Write,
    Subrange,
    Probe,
}

impl std::fmt::Display for GuestMemoryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            GuestMemoryOperation::Read => "read",
            GuestMemoryOperation::Write => "write",
            GuestMemoryOperation::Subrange => "subrange",
            GuestMemoryOperation::Probe => "probe",
        })
    }
}

struct Backing {
    debug_name: Arc<str>,
    words: Box<[AtomicU64]>,
}

impl Backing {
    fn load(&self, mut offset: u64, dest: &mut [u8]) {
        let mut dest = dest;
        while !dest.is_empty() {
            let shift = (offset % WORD) as usize;
            let n = dest.len().min(WORD as usize - shift);
            let word = self.words[(offset / WORD) as usize]
                .load(Ordering::Relaxed)
                .to_le_bytes();
            let (current, rest) = dest.split_at_mut(n);
            current.copy_from_slice(&word[shift..shift + n]);
            dest = rest;
            offset += n as u64;
        }
    }

    fn store(&self, mut offset: u64, src: &[u8]) {
        let mut src = src;
        while !src.is_empty() {
            let shift = (offset % WORD) as usize;
            let n = src.len().min(WORD as usize - shift);
            let (current, rest) = src.split_at(n);
            let word = &self.words[(offset / WORD) as usize];
            if n == WORD as usize {
                let mut bytes = [0; WORD as usize];
                bytes.copy_from_slice(current);
                word.store(u64::from_le_bytes(bytes), Ordering::Relaxed);
            } else {
                // Merge into the surrounding word without disturbing bytes the
                // guest may be writing concurrently.
                let _ = word.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                    let mut bytes = old.to_le_bytes();
                    bytes[shift..shift + n].copy_from_slice(current);
                    Some(u64::from_le_bytes(bytes))
                });
            }
            src = rest;
            offset += n as u64;
        }
    }
}

/// A view of guest memory.
///
/// Cloning is cheap; clones and subranges share the same backing.
#[derive(Clone)]
pub struct GuestMemory {
    backing: Arc<Backing>,
    base: u64,
    len: u64,
}

impl Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("debug_name", &self.backing.debug_name)
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &format_args!("{:#x}", self.len))
            .finish()
    }
}

impl GuestMemory {
    /// Allocates zeroed guest memory of `size` bytes.
    pub fn new(debug_name: impl Into<Arc<str>>, size: usize) -> Self {
        let words = (size as u64).div_ceil(WORD) as usize;
        Self {
            backing: Arc::new(Backing {
                debug_name: debug_name.into(),
                words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            }),
            base: 0,
            len: size as u64,
        }
    }

    /// Allocates zeroed heap memory to act as guest memory. Useful for tests.
    pub fn allocate(size: usize) -> Self {
        Self::new("heap", size)
    }

    /// The number of addressable bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if no bytes are addressable.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(
        &self,
        op: GuestMemoryOperation,
        gpa: u64,
        len: u64,
    ) -> Result<u64, GuestMemoryError> {
        match gpa.checked_add(len) {
            Some(end) if end <= self.len => Ok(self.base + gpa),
            _ => Err(GuestMemoryError {
                op,
                debug_name: self.backing.debug_name.clone(),
                range: gpa..gpa.saturating_add(len),
                limit: self.len,
            }),
        }
    }

    /// Creates a smaller view into guest memory. Addresses passed to the new
    /// view are relative to `offset`.
    pub fn subrange(&self, offset: u64, len: u64) -> Result<GuestMemory, GuestMemoryError> {
        let base = self.check(GuestMemoryOperation::Subrange, offset, len)?;
        Ok(Self {
            backing: self.backing.clone(),
            base,
            len,
        })
    }

    /// Checks that `gpa..gpa+len` is accessible without touching it.
    pub fn probe_range(&self, gpa: u64, len: u64) -> Result<(), GuestMemoryError> {
        self.check(GuestMemoryOperation::Probe, gpa, len)?;
        Ok(())
    }

    /// Reads `dest.len()` bytes starting at `gpa`.
    pub fn read_at(&self, gpa: u64, dest: &mut [u8]) -> Result<(), GuestMemoryError> {
        let offset = self.check(GuestMemoryOperation::Read, gpa, dest.len() as u64)?;
        self.backing.load(offset, dest);
        Ok(())
    }

    /// Writes `src` starting at `gpa`.
    pub fn write_at(&self, gpa: u64, src: &[u8]) -> Result<(), GuestMemoryError> {
        let offset = self.check(GuestMemoryOperation::Write, gpa, src.len() as u64)?;
        self.backing.store(offset, src);
        Ok(())
    }

    /// Writes `len` copies of `val` starting at `gpa`.
    pub fn fill_at(&self, gpa: u64, val: u8, len: usize) -> Result<(), GuestMemoryError> {
        self.write_at(gpa, &vec![val; len])
    }

    /// Reads an object from guest memory at `gpa`.
    ///
    /// Naturally aligned objects of 1, 2, 4, or 8 bytes are read atomically.
    pub fn read_plain<T: FromBytes + IntoBytes + Immutable + KnownLayout>(
        &self,
        gpa: u64,
    ) -> Result<T, GuestMemoryError> {
        let mut obj = T::new_zeroed();
        self.read_at(gpa, obj.as_mut_bytes())?;
        Ok(obj)
    }

    /// Writes an object to guest memory at `gpa`.
    ///
    /// Naturally aligned objects of 1, 2, 4, or 8 bytes are written
    /// atomically, so concurrent readers see either the old or the new value.
    pub fn write_plain<T: IntoBytes + Immutable + KnownLayout>(
        &self,
        gpa: u64,
        b: &T,
    ) -> Result<(), GuestMemoryError> {
        self.write_at(gpa, b.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::GuestMemory;
    use zerocopy::LittleEndian;
    use zerocopy::U16;
    use zerocopy::U64;

    #[test]
    fn test_read_write_unaligned() {
        let mem = GuestMemory::allocate(64);
        let data: Vec<u8> = (1..=21).collect();
        mem.write_at(3, &data).unwrap();
        let mut out = vec![0; 21];
        mem.read_at(3, &mut out).unwrap();
        assert_eq!(out, data);

        let mut around = [0xffu8; 2];
        mem.read_at(2, &mut around[..1]).unwrap();
        mem.read_at(24, &mut around[1..]).unwrap();
        assert_eq!(around, [0, 0]);
    }

    #[test]
    fn test_plain() {
        let mem = GuestMemory::allocate(32);
        mem.write_plain(6, &U16::<LittleEndian>::new(0xbeef)).unwrap();
        mem.write_plain(8, &U64::<LittleEndian>::new(0x0123_4567_89ab_cdef))
            .unwrap();
        assert_eq!(mem.read_plain::<U16<LittleEndian>>(6).unwrap().get(), 0xbeef);
        assert_eq!(
            mem.read_plain::<U64<LittleEndian>>(8).unwrap().get(),
            0x0123_4567_89ab_cdef
        );
        assert_eq!(mem.read_plain::<u8>(6).unwrap(), 0xef);
    }

    #[test]
    fn test_bounds() {
        let mem = GuestMemory::allocate(0x100);
        assert!(mem.write_at(0xff, &[1]).is_ok());
        assert!(mem.write_at(0xff, &[1, 2]).is_err());
        assert!(mem.read_plain::<u64>(0xf9).is_err());
        assert!(mem.probe_range(u64::MAX, 2).is_err());
        let err = mem.read_at(0x200, &mut [0; 4]).unwrap_err();
        assert_eq!(err.range(), 0x200..0x204);
    }

    #[test]
    fn test_subrange() {
        let mem = GuestMemory::allocate(0x100);
        let sub = mem.subrange(0x40, 0x20).unwrap();
        assert_eq!(sub.len(), 0x20);
        sub.write_at(0, b"abc").unwrap();
        let mut out = [0; 3];
        mem.read_at(0x40, &mut out).unwrap();
        assert_eq!(&out, b"abc");
        assert!(sub.write_at(0x1f, b"xy").is_err());
        assert!(mem.subrange(0xf0, 0x20).is_err());
        let nested = sub.subrange(0x10, 0x10).unwrap();
        nested.fill_at(0, 7, 0x10).unwrap();
        assert_eq!(mem.read_plain::<u8>(0x5f).unwrap(), 7);
        assert_eq!(mem.read_plain::<u8>(0x60).unwrap(), 0);
    }
}
