// SEC PDCP Job Ring Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Owned allocations in DMA-visible memory.
//!
//! [`DmaBox`] and [`DmaSlice`] behave like `Box<T>` and `Box<[T]>` but take
//! their memory from a [`DmaMemory`] and remember the physical address the
//! accelerator must be given. Only plain-old-data (`Copy`) types are stored.

use crate::error::{SecError, SecResult};
use crate::hw::{DmaMemory, PhysAddr};
use scopeguard::ScopeGuard;
use std::alloc::Layout;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

fn alloc_translated(
    mem: &Arc<dyn DmaMemory>,
    layout: Layout,
) -> SecResult<(NonNull<u8>, PhysAddr)> {
    let raw = mem
        .alloc(layout)
        .ok_or(SecError::DmaExhausted(layout.size()))?;
    // Give the memory back if it turns out not to be reachable by hardware.
    let guard = scopeguard::guard(raw, |p| unsafe { mem.free(p, layout) });
    let phys = mem.virt_to_phys(raw.as_ptr()).ok_or_else(|| {
        SecError::InvalidConfig("allocator returned memory without a physical address".into())
    })?;
    Ok((ScopeGuard::into_inner(guard), phys))
}

/// Single value in DMA memory.
pub struct DmaBox<T: Copy> {
    ptr: NonNull<T>,
    phys: PhysAddr,
    mem: Arc<dyn DmaMemory>,
}

// SAFETY: DmaBox owns its allocation exclusively, like Box<T>.
unsafe impl<T: Copy + Send> Send for DmaBox<T> {}

impl<T: Copy> DmaBox<T> {
    /// Allocate and initialize a value.
    pub fn new(mem: &Arc<dyn DmaMemory>, value: T) -> SecResult<Self> {
        let (raw, phys) = alloc_translated(mem, Layout::new::<T>())?;
        let ptr = raw.cast::<T>();
        // SAFETY: freshly allocated with T's layout.
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self {
            ptr,
            phys,
            mem: Arc::clone(mem),
        })
    }

    /// Physical address of the value.
    #[inline]
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Virtual address of the value.
    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }
}

impl<T: Copy> Deref for DmaBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: valid and initialized for the lifetime of self.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: Copy> DerefMut for DmaBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: valid, initialized and exclusively owned.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T: Copy> Drop for DmaBox<T> {
    fn drop(&mut self) {
        unsafe { self.mem.free(self.ptr.cast(), Layout::new::<T>()) };
    }
}

impl<T: Copy + std::fmt::Debug> std::fmt::Debug for DmaBox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBox")
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("value", &**self)
            .finish()
    }
}

/// Fixed-length array in DMA memory.
pub struct DmaSlice<T: Copy> {
    ptr: NonNull<T>,
    len: usize,
    phys: PhysAddr,
    mem: Arc<dyn DmaMemory>,
}

// SAFETY: DmaSlice owns its allocation exclusively, like Box<[T]>.
unsafe impl<T: Copy + Send> Send for DmaSlice<T> {}

impl<T: Copy> DmaSlice<T> {
    /// Allocate `len` elements, each set to `fill`.
    pub fn new(mem: &Arc<dyn DmaMemory>, len: usize, fill: T) -> SecResult<Self> {
        let layout = Self::layout(len)?;
        let (raw, phys) = alloc_translated(mem, layout)?;
        let ptr = raw.cast::<T>();
        for i in 0..len {
            // SAFETY: i < len elements were allocated.
            unsafe { ptr.as_ptr().add(i).write(fill) };
        }
        Ok(Self {
            ptr,
            len,
            phys,
            mem: Arc::clone(mem),
        })
    }

    fn layout(len: usize) -> SecResult<Layout> {
        let layout = Layout::array::<T>(len)
            .map_err(|_| SecError::InvalidInput(format!("DMA array of {len} elements")))?;
        // Cacheline alignment keeps ring memory from sharing lines with
        // unrelated data.
        layout
            .align_to(64)
            .map_err(|_| SecError::InvalidInput("DMA array alignment".into()))
    }

    /// Physical address of element 0.
    #[inline]
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Physical address of element `index`.
    #[inline]
    pub fn phys_of(&self, index: usize) -> PhysAddr {
        self.phys + (index * std::mem::size_of::<T>()) as PhysAddr
    }

    /// Volatile read of element `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn read_volatile(&self, index: usize) -> T {
        assert!(index < self.len);
        // SAFETY: bounds checked above.
        unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(index)) }
    }

    /// Volatile write of element `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn write_volatile(&mut self, index: usize, value: T) {
        assert!(index < self.len);
        // SAFETY: bounds checked above.
        unsafe { std::ptr::write_volatile(self.ptr.as_ptr().add(index), value) }
    }
}

impl<T: Copy> Deref for DmaSlice<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: len initialized elements.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Copy> DerefMut for DmaSlice<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: len initialized elements, exclusively owned.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Copy> Drop for DmaSlice<T> {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.len) {
            unsafe { self.mem.free(self.ptr.cast(), layout) };
        }
    }
}

impl<T: Copy> std::fmt::Debug for DmaSlice<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaSlice")
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::{DmaRegion, HeapMemory};

    fn heap() -> Arc<dyn DmaMemory> {
        Arc::new(HeapMemory)
    }

    #[test]
    fn test_box_value_and_phys() {
        let mut b = DmaBox::new(&heap(), 41u64).unwrap();
        *b += 1;
        assert_eq!(*b, 42);
        assert_eq!(b.phys(), b.as_ptr() as u64);
    }

    #[test]
    fn test_slice_fill_and_volatile_access() {
        let mut s = DmaSlice::new(&heap(), 8, 0u64).unwrap();
        assert_eq!(s.len(), 8);
        assert_eq!(s.phys() % 64, 0);
        s.write_volatile(3, 0xABCD);
        assert_eq!(s.read_volatile(3), 0xABCD);
        assert_eq!(s[3], 0xABCD);
        assert_eq!(s.phys_of(2), s.phys() + 16);
    }

    #[test]
    fn test_region_exhaustion() {
        let mut backing = vec![0u8; 256];
        let region: Arc<dyn DmaMemory> = Arc::new(unsafe {
            DmaRegion::new(backing.as_mut_ptr() as usize, 0x4000_0000, backing.len())
        });
        let s = DmaSlice::new(&region, 16, 0u64).unwrap();
        assert!(s.phys() >= 0x4000_0000);
        assert!(matches!(
            DmaSlice::new(&region, 64, 0u64),
            Err(SecError::DmaExhausted(_))
        ));
    }
}
