//! # Flat Guest Memory
//!
//! The flat, byte-addressable memory shared by the whole simulated device,
//! together with the parent allocator that segment managers carve their
//! arenas from.
//!
//! ## Design
//!
//! Storage is a lazily-grown byte vector. The allocator is a first-fit
//! free list over 8-byte-rounded blocks with address-ordered coalescing on
//! free. Address zero is never handed out; the first [`GuestMemory::BASE`]
//! bytes are reserved so that a zero address can serve as a null sentinel
//! throughout the core.

use std::collections::BTreeMap;

use crate::error::{EmuError, Result};

/// Block granularity of the flat allocator.
const BLOCK_ALIGN: u32 = 8;

pub(crate) fn align_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Flat byte-addressable guest memory with a built-in block allocator.
pub struct GuestMemory {
    /// Backing storage, grown on demand up to `limit`.
    data: Vec<u8>,
    /// Free blocks, keyed by address.
    free: BTreeMap<u32, u32>,
    /// Live allocations, keyed by address.
    used: BTreeMap<u32, u32>,
    /// High-water mark: addresses at and above this are untouched.
    top: u32,
    /// Hard capacity limit in bytes.
    limit: u32,
}

impl GuestMemory {
    /// Lowest address the allocator will ever return. Everything below is
    /// reserved null-sentinel space.
    pub const BASE: u32 = 16;

    /// Create a guest memory with the given capacity limit in bytes.
    pub fn new(limit: u32) -> Self {
        Self {
            data: Vec::new(),
            free: BTreeMap::new(),
            used: BTreeMap::new(),
            top: Self::BASE,
            limit,
        }
    }

    /// Total bytes handed out and not yet freed.
    pub fn used_bytes(&self) -> u32 {
        self.used.values().sum()
    }

    /// Allocate `size` bytes from the flat address space.
    ///
    /// The returned address is 8-byte aligned and never zero.
    pub fn allocate(&mut self, size: u32) -> Result<u32> {
        debug_assert!(size > 0, "zero-size flat allocation");
        let size = align_up(size.max(1), BLOCK_ALIGN);

        // First fit over the free list, address order.
        let candidate = self
            .free
            .iter()
            .find(|(_, &block_size)| block_size >= size)
            .map(|(&addr, &block_size)| (addr, block_size));
        if let Some((addr, block_size)) = candidate {
            self.free.remove(&addr);
            if block_size > size {
                self.free.insert(addr + size, block_size - size);
            }
            self.used.insert(addr, size);
            return Ok(addr);
        }

        // Extend the high-water mark.
        let addr = self.top;
        let new_top = addr.checked_add(size).ok_or(EmuError::OutOfSpace {
            size,
            alignment: BLOCK_ALIGN,
        })?;
        if new_top > self.limit {
            return Err(EmuError::OutOfSpace {
                size,
                alignment: BLOCK_ALIGN,
            });
        }
        self.top = new_top;
        if self.data.len() < new_top as usize {
            self.data.resize(new_top as usize, 0);
        }
        self.used.insert(addr, size);
        Ok(addr)
    }

    /// Free a previously allocated block.
    pub fn free(&mut self, address: u32) -> Result<()> {
        let size = self
            .used
            .remove(&address)
            .ok_or(EmuError::InvalidFree { address })?;

        let mut addr = address;
        let mut len = size;

        // Merge with the preceding free block, if contiguous.
        if let Some((&prev_addr, &prev_size)) = self.free.range(..address).next_back() {
            if prev_addr + prev_size == addr {
                self.free.remove(&prev_addr);
                addr = prev_addr;
                len += prev_size;
            }
        }
        // Merge with the following free block, if contiguous.
        if let Some(&next_size) = self.free.get(&(address + size)) {
            self.free.remove(&(address + size));
            len += next_size;
        }

        self.free.insert(addr, len);
        Ok(())
    }

    /// Borrow `size` bytes at `address` for reading.
    pub fn view(&self, address: u32, size: u32) -> Result<&[u8]> {
        let start = address as usize;
        let end = start + size as usize;
        self.data
            .get(start..end)
            .ok_or(EmuError::MemoryFault { address, size })
    }

    /// Borrow `size` bytes at `address` for writing.
    pub fn view_mut(&mut self, address: u32, size: u32) -> Result<&mut [u8]> {
        let start = address as usize;
        let end = start + size as usize;
        self.data
            .get_mut(start..end)
            .ok_or(EmuError::MemoryFault { address, size })
    }

    /// Copy `buf.len()` bytes from `address` into `buf`.
    pub fn read(&self, address: u32, buf: &mut [u8]) -> Result<()> {
        let src = self.view(address, buf.len() as u32)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    /// Copy `buf` into guest memory at `address`.
    pub fn write(&mut self, address: u32, buf: &[u8]) -> Result<()> {
        let dst = self.view_mut(address, buf.len() as u32)?;
        dst.copy_from_slice(buf);
        Ok(())
    }

    /// Copy `len` bytes from `src` to `dst` within guest memory.
    ///
    /// Overlapping ranges are handled like `memmove`.
    pub fn copy(&mut self, dst: u32, src: u32, len: u32) -> Result<()> {
        // Validate both ranges before touching anything.
        self.view(src, len)?;
        self.view(dst, len)?;
        self.data
            .copy_within(src as usize..(src + len) as usize, dst as usize);
        Ok(())
    }

    /// Read a little-endian `u32` at `address`.
    pub fn read_u32(&self, address: u32) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Write a little-endian `u32` at `address`.
    pub fn write_u32(&mut self, address: u32, value: u32) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("top", &self.top)
            .field("limit", &self.limit)
            .field("used_blocks", &self.used.len())
            .field("free_blocks", &self.free.len())
            .finish()
    }
}
