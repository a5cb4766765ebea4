//! Device-visible storage handed out as region handles.
//!
//! The host allocates before a launch, kernels borrow the heap shared, and the
//! host frees (and reads back) once the launch has joined. A handle is an index
//! plus a generation, so a freed region cannot be reached through an old handle.

use std::any::Any;
use std::marker::PhantomData;

use tracing::warn;

pub const DEFAULT_HEAP_BYTES: usize = 64 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionError {
    /// Allocation would exceed the heap's byte capacity.
    Exhausted = 1,
    InvalidRegion = 2,
    /// Handle outlived the region it named.
    Stale = 3,
    TypeMismatch = 4,
}

/// Typed handle into a [`DeviceHeap`].
pub struct Region<T> {
    index: u32,
    generation: u32,
    _ty: PhantomData<fn() -> T>,
}

impl<T> Clone for Region<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Region<T> {}

impl<T> PartialEq for Region<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Region<T> {}

impl<T> core::fmt::Debug for Region<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Region")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

impl<T> Region<T> {
    #[inline(always)]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline(always)]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Entry {
    value: Box<dyn Any + Send + Sync>,
    bytes: usize,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

pub struct DeviceHeap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    used_bytes: usize,
    capacity_bytes: usize,
}

impl DeviceHeap {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            used_bytes: 0,
            capacity_bytes,
        }
    }

    /// One value, accounted at `size_of::<T>()`.
    pub fn alloc<T: Any + Send + Sync>(&mut self, value: T) -> Result<Region<T>, RegionError> {
        self.insert(value, core::mem::size_of::<T>())
    }

    /// `len` elements built by `fill`, accounted at `len * size_of::<T>()`.
    pub fn alloc_array<T, F>(&mut self, len: usize, fill: F) -> Result<Region<Vec<T>>, RegionError>
    where
        T: Any + Send + Sync,
        F: FnMut(usize) -> T,
    {
        let bytes = len
            .checked_mul(core::mem::size_of::<T>())
            .ok_or(RegionError::Exhausted)?;
        self.reserve(bytes)?;
        let values: Vec<T> = (0..len).map(fill).collect();
        self.insert(values, bytes)
    }

    pub fn get<T: Any>(&self, region: Region<T>) -> Result<&T, RegionError> {
        self.entry(region)?
            .value
            .downcast_ref::<T>()
            .ok_or(RegionError::TypeMismatch)
    }

    pub fn get_mut<T: Any>(&mut self, region: Region<T>) -> Result<&mut T, RegionError> {
        let slot = self.slot_mut(region)?;
        slot.entry
            .as_mut()
            .ok_or(RegionError::Stale)?
            .value
            .downcast_mut::<T>()
            .ok_or(RegionError::TypeMismatch)
    }

    /// Release a region and hand its value back for readback.
    pub fn free<T: Any>(&mut self, region: Region<T>) -> Result<T, RegionError> {
        let slot = self.slot_mut(region)?;
        let entry = slot.entry.take().ok_or(RegionError::Stale)?;
        let bytes = entry.bytes;
        let value = match entry.value.downcast::<T>() {
            Ok(value) => value,
            Err(value) => {
                slot.entry = Some(Entry { value, bytes });
                return Err(RegionError::TypeMismatch);
            }
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(region.index);
        self.used_bytes -= bytes;
        Ok(*value)
    }

    #[inline(always)]
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    #[inline(always)]
    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn live_regions(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    fn reserve(&self, bytes: usize) -> Result<(), RegionError> {
        let fits = self
            .used_bytes
            .checked_add(bytes)
            .map_or(false, |total| total <= self.capacity_bytes);
        if !fits {
            warn!(
                requested = bytes,
                used = self.used_bytes,
                capacity = self.capacity_bytes,
                "device heap exhausted"
            );
            return Err(RegionError::Exhausted);
        }
        Ok(())
    }

    fn insert<T: Any + Send + Sync>(
        &mut self,
        value: T,
        bytes: usize,
    ) -> Result<Region<T>, RegionError> {
        self.reserve(bytes)?;
        let entry = Entry {
            value: Box::new(value),
            bytes,
        };
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len()).map_err(|_| RegionError::Exhausted)?;
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                index
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(entry);
        self.used_bytes += bytes;
        Ok(Region {
            index,
            generation: slot.generation,
            _ty: PhantomData,
        })
    }

    fn entry<T>(&self, region: Region<T>) -> Result<&Entry, RegionError> {
        let slot = self
            .slots
            .get(region.index as usize)
            .ok_or(RegionError::InvalidRegion)?;
        if slot.generation != region.generation {
            return Err(RegionError::Stale);
        }
        slot.entry.as_ref().ok_or(RegionError::Stale)
    }

    fn slot_mut<T>(&mut self, region: Region<T>) -> Result<&mut Slot, RegionError> {
        let slot = self
            .slots
            .get_mut(region.index as usize)
            .ok_or(RegionError::InvalidRegion)?;
        if slot.generation != region.generation {
            return Err(RegionError::Stale);
        }
        Ok(slot)
    }
}

impl Default for DeviceHeap {
    fn default() -> Self {
        Self::new(DEFAULT_HEAP_BYTES)
    }
}

impl core::fmt::Debug for DeviceHeap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceHeap")
            .field("live_regions", &self.live_regions())
            .field("used_bytes", &self.used_bytes)
            .field("capacity_bytes", &self.capacity_bytes)
            .finish()
    }
}
