use crate::arch::{TierKind, round_up};
use crate::error::{AllocationError, DeviceResult, Fault};
use bytemuck::Pod;
use core::marker::PhantomData;

/// Alignment of every global memory allocation.
pub const GM_ALIGN: usize = 512;

/// Handle to a region of global memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct GmBuffer {
    /// Byte address of the first element.
    pub addr: usize,
    /// Length in bytes.
    pub len: usize,
}

impl GmBuffer {
    /// Typed view of the buffer for device code.
    pub fn tensor<E: Pod>(&self) -> GlobalTensor<E> {
        GlobalTensor::new(self.addr)
    }

    pub fn num_elements<E: Pod>(&self) -> usize {
        self.len / size_of::<E>()
    }
}

/// Typed address into global memory.
///
/// Indexing with [`offset`](GlobalTensor::offset) mirrors pointer arithmetic on the device: no
/// bounds are attached, only the arena size is checked on access.
pub struct GlobalTensor<E> {
    addr: usize,
    _element: PhantomData<E>,
}

impl<E> Clone for GlobalTensor<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for GlobalTensor<E> {}

impl<E> core::fmt::Debug for GlobalTensor<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "GlobalTensor<{}>({:#x})", core::any::type_name::<E>(), self.addr)
    }
}

impl<E> PartialEq for GlobalTensor<E> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl<E: Pod> GlobalTensor<E> {
    pub fn new(addr: usize) -> Self {
        Self {
            addr,
            _element: PhantomData,
        }
    }

    /// Byte address of the first element.
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Tensor starting `elements` further.
    pub fn offset(self, elements: usize) -> Self {
        Self::new(self.addr + elements * size_of::<E>())
    }

    pub fn reinterpret<T: Pod>(self) -> GlobalTensor<T> {
        GlobalTensor::new(self.addr)
    }
}

/// Byte addressable device memory shared by every core.
///
/// Cores never write overlapping ranges, so a reader-writer lock held for the duration of one
/// DMA burst is enough to keep accesses sound.
pub struct GlobalMemory {
    data: spin::RwLock<Vec<u64>>,
    cursor: spin::Mutex<usize>,
    capacity: usize,
}

impl core::fmt::Debug for GlobalMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GlobalMemory")
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .finish()
    }
}

impl GlobalMemory {
    /// Creates an arena that can hold up to `capacity` bytes. Pages are materialized on
    /// allocation.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: spin::RwLock::new(Vec::new()),
            cursor: spin::Mutex::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        *self.cursor.lock()
    }

    /// Reserves `len` zeroed bytes.
    pub fn alloc(&self, len: usize) -> Result<GmBuffer, AllocationError> {
        let mut cursor = self.cursor.lock();
        let addr = *cursor;
        let end = round_up(addr + len.max(1), GM_ALIGN);

        if end > self.capacity {
            return Err(AllocationError::OutOfMemory {
                requested: len,
                available: self.capacity.saturating_sub(addr),
            });
        }

        let mut data = self.data.write();
        let words = end.div_ceil(size_of::<u64>());
        if data.len() < words {
            data.resize(words, 0);
        }
        *cursor = end;

        Ok(GmBuffer::new(addr, len))
    }

    pub fn alloc_zeroed<E: Pod>(&self, count: usize) -> Result<GmBuffer, AllocationError> {
        self.alloc(count * size_of::<E>())
    }

    /// Allocates a buffer and fills it with `values`.
    pub fn create<E: Pod>(&self, values: &[E]) -> Result<GmBuffer, AllocationError> {
        let buffer = self.alloc(size_of_val(values))?;
        self.write(buffer, values)?;
        Ok(buffer)
    }

    /// Host to device transfer.
    pub fn write<E: Pod>(&self, buffer: GmBuffer, values: &[E]) -> Result<(), AllocationError> {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        if bytes.len() > buffer.len {
            return Err(AllocationError::BufferTooSmall {
                buffer_len: buffer.len,
                requested: bytes.len(),
            });
        }

        let mut data = self.data.write();
        let arena: &mut [u8] = bytemuck::cast_slice_mut(data.as_mut_slice());
        let region = arena
            .get_mut(buffer.addr..buffer.addr + bytes.len())
            .ok_or(AllocationError::Released { addr: buffer.addr })?;
        region.copy_from_slice(bytes);
        Ok(())
    }

    /// Device to host transfer of the whole buffer.
    pub fn read<E: Pod>(&self, buffer: GmBuffer) -> Result<Vec<E>, AllocationError> {
        let data = self.data.read();
        let arena: &[u8] = bytemuck::cast_slice(data.as_slice());
        let len = buffer.len / size_of::<E>() * size_of::<E>();
        let region = arena
            .get(buffer.addr..buffer.addr + len)
            .ok_or(AllocationError::Released { addr: buffer.addr })?;
        Ok(bytemuck::pod_collect_to_vec(region))
    }

    /// Releases every allocation.
    pub fn reset(&self) {
        let mut cursor = self.cursor.lock();
        self.data.write().clear();
        *cursor = 0;
    }

    /// Runs `func` with the arena bytes for a read burst.
    pub(crate) fn with_bytes<R>(&self, func: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.data.read();
        func(bytemuck::cast_slice(data.as_slice()))
    }

    /// Runs `func` with the arena bytes for a write burst.
    pub(crate) fn with_bytes_mut<R>(&self, func: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.data.write();
        func(bytemuck::cast_slice_mut(data.as_mut_slice()))
    }
}

pub(crate) fn check_global(addr: usize, len: usize, size: usize) -> DeviceResult {
    if addr + len > size {
        return Err(Fault::GlobalOutOfBounds { addr, len, size });
    }
    Ok(())
}

/// Typed window into one on-chip tier of the current core.
pub struct LocalTensor<E> {
    tier: TierKind,
    offset: usize,
    len: usize,
    _element: PhantomData<E>,
}

impl<E> Clone for LocalTensor<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for LocalTensor<E> {}

impl<E> PartialEq for LocalTensor<E> {
    fn eq(&self, other: &Self) -> bool {
        self.tier == other.tier && self.offset == other.offset && self.len == other.len
    }
}

impl<E> core::fmt::Debug for LocalTensor<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "LocalTensor<{}>({}[{}..+{}])",
            core::any::type_name::<E>(),
            self.tier,
            self.offset,
            self.len
        )
    }
}

impl<E: Pod> LocalTensor<E> {
    /// Unchecked window; bounds are checked when the tensor is accessed.
    pub fn new(tier: TierKind, offset: usize, len: usize) -> Self {
        Self {
            tier,
            offset,
            len,
            _element: PhantomData,
        }
    }

    pub fn tier(&self) -> TierKind {
        self.tier
    }

    /// Byte offset inside the tier.
    pub fn byte_offset(&self) -> usize {
        self.offset
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len * size_of::<E>()
    }

    /// Sub tensor starting `start` elements in, clamped to the parent's end.
    pub fn slice(self, start: usize, len: usize) -> Self {
        let start = start.min(self.len);
        let len = len.min(self.len - start);
        Self::new(self.tier, self.offset + start * size_of::<E>(), len)
    }

    /// Everything from `start` to the end.
    pub fn tail(self, start: usize) -> Self {
        self.slice(start, usize::MAX)
    }

    /// Views the same bytes as another element type.
    pub fn reinterpret<T: Pod>(self) -> LocalTensor<T> {
        LocalTensor::new(self.tier, self.offset, self.byte_len() / size_of::<T>())
    }
}

/// Contiguous run of elements moved by one DMA burst, in element units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct CopyRun {
    pub src: usize,
    pub dst: usize,
    pub len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn allocations_are_aligned_and_zeroed() {
        let memory = GlobalMemory::new(1 << 20);
        let first = memory.alloc(100).unwrap();
        let second = memory.alloc_zeroed::<f32>(8).unwrap();

        assert_eq!(first.addr, 0);
        assert_eq!(second.addr, GM_ALIGN);
        assert_eq!(memory.read::<f32>(second).unwrap(), vec![0.0; 8]);
    }

    #[test_log::test]
    fn create_then_read() {
        let memory = GlobalMemory::new(1 << 20);
        let buffer = memory.create(&[1i32, -2, 3]).unwrap();

        assert_eq!(memory.read::<i32>(buffer).unwrap(), vec![1, -2, 3]);
    }

    #[test_log::test]
    fn read_reinterprets_the_bytes() {
        let memory = GlobalMemory::new(1 << 20);
        let buffer = memory.create(&[0x00u8, 0x3c, 0x00, 0x40, 0xff]).unwrap();

        assert_eq!(
            memory.read::<half::f16>(buffer).unwrap(),
            vec![half::f16::ONE, half::f16::from_f32(2.0)]
        );
    }

    #[test_log::test]
    fn out_of_memory() {
        let memory = GlobalMemory::new(1024);
        memory.alloc(600).unwrap();

        assert_eq!(
            memory.alloc(600),
            Err(AllocationError::OutOfMemory {
                requested: 600,
                available: 0
            })
        );
    }

    #[test_log::test]
    fn write_larger_than_buffer() {
        let memory = GlobalMemory::new(4096);
        let buffer = memory.alloc(4).unwrap();

        assert!(memory.write(buffer, &[0u32, 1]).is_err());
    }

    #[test_log::test]
    fn stale_handle_after_reset() {
        let memory = GlobalMemory::new(4096);
        let buffer = memory.create(&[1u8; 16]).unwrap();
        memory.reset();

        assert_eq!(
            memory.read::<u8>(buffer),
            Err(AllocationError::Released { addr: 0 })
        );
    }

    #[test_log::test]
    fn local_slices_clamp() {
        let tensor = LocalTensor::<u16>::new(TierKind::Ub, 64, 10);
        let sub = tensor.slice(8, 16);

        assert_eq!(sub.byte_offset(), 80);
        assert_eq!(sub.len(), 2);
        assert_eq!(tensor.reinterpret::<u32>().len(), 5);
    }
}
