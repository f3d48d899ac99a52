//! Describes graphic buffers and manages their backing memory.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::allocator::{AllocError, BufferAllocator};

/// Smallest stride alignment a request may ask for, in bytes.
pub const MIN_STRIDE_ALIGNMENT: u32 = 4;
/// Largest stride alignment a request may ask for, in bytes.
pub const MAX_STRIDE_ALIGNMENT: u32 = 32;

/// Globally unique identifier of an allocated buffer.
///
/// Assigned once when the buffer's memory is created and never reused, even when the
/// queue slot that held the buffer is recycled for a different allocation. The counter
/// is 64 bits wide so it cannot wrap within a process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// Wraps a raw sequence value, e.g. one received over a transport.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Hands out the next process-wide sequence number.
    pub fn next_unique() -> Self {
        static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);
        SequenceNumber(NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw `u64` value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Enumerates the pixel formats a buffer can be allocated with.
///
/// These line up with the common `wl_shm` / DRM fourcc formats. Packed formats
/// report a fixed byte count per pixel; `Nv12` is planar and handled separately
/// when computing the allocation size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 32-bit RGBA, 8 bits per channel.
    Rgba8888,
    /// 32-bit RGBX, alpha ignored.
    Rgbx8888,
    /// 32-bit BGRA, 8 bits per channel.
    Bgra8888,
    /// 32-bit ARGB format, 8 bits per channel, alpha first.
    Argb8888,
    /// 32-bit XRGB format, alpha ignored (X).
    Xrgb8888,
    /// 16-bit RGB 5:6:5.
    Rgb565,
    /// YUV format, NV12 (2-plane Y followed by interleaved UV).
    Nv12,
}

impl PixelFormat {
    /// Bytes used by one pixel of the first plane.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgba8888
            | PixelFormat::Rgbx8888
            | PixelFormat::Bgra8888
            | PixelFormat::Argb8888
            | PixelFormat::Xrgb8888 => 4,
            PixelFormat::Rgb565 => 2,
            PixelFormat::Nv12 => 1,
        }
    }
}

bitflags! {
    /// How a buffer is going to be used. The allocator may pick different memory
    /// depending on these bits; the queue only compares them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct BufferUsage: u64 {
        /// CPU reads the buffer.
        const CPU_READ = 1 << 0;
        /// CPU writes the buffer.
        const CPU_WRITE = 1 << 1;
        /// Direct memory access buffer.
        const MEM_DMA = 1 << 3;
        /// Shared memory buffer.
        const MEM_SHARE = 1 << 4;
        /// Framebuffer memory.
        const MEM_FB = 1 << 6;
        /// GPU renders into the buffer.
        const HW_RENDER = 1 << 8;
        /// GPU samples the buffer as a texture.
        const HW_TEXTURE = 1 << 9;
        /// Scanned out by the hardware composer.
        const HW_COMPOSER = 1 << 10;
        /// Protected content, not CPU accessible.
        const PROTECTED = 1 << 11;
        /// Video encoder input.
        const VIDEO_ENCODER = 1 << 14;
        /// Video decoder output.
        const VIDEO_DECODER = 1 << 15;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        BufferUsage::CPU_READ | BufferUsage::CPU_WRITE | BufferUsage::MEM_DMA
    }
}

/// Parameters an allocation is requested with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRequest {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format.
    pub format: PixelFormat,
    /// Usage bits.
    pub usage: BufferUsage,
    /// Row alignment in bytes. Must be a power of two.
    pub stride_alignment: u32,
}

impl BufferRequest {
    /// Checks that the request can be turned into a [`BufferDescriptor`].
    ///
    /// # Errors
    /// Returns [`AllocError::InvalidRequest`] for zero dimensions, a stride alignment that
    /// is not a power of two, or a size that does not fit in memory.
    pub fn describe(&self) -> Result<BufferDescriptor, AllocError> {
        if self.width == 0 || self.height == 0 {
            return Err(AllocError::InvalidRequest(format!(
                "dimensions must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.stride_alignment == 0 || !self.stride_alignment.is_power_of_two() {
            return Err(AllocError::InvalidRequest(format!(
                "stride alignment must be a power of two, got {}",
                self.stride_alignment
            )));
        }

        let overflow = || {
            AllocError::InvalidRequest(format!(
                "{}x{} {:?} overflows the addressable size",
                self.width, self.height, self.format
            ))
        };
        let row_bytes = u64::from(self.width) * u64::from(self.format.bytes_per_pixel());
        let align = u64::from(self.stride_alignment);
        let stride = row_bytes
            .checked_add(align - 1)
            .map(|padded| padded / align * align)
            .ok_or_else(overflow)?;
        let mut size = stride.checked_mul(u64::from(self.height)).ok_or_else(overflow)?;
        if self.format == PixelFormat::Nv12 {
            // Chroma plane is half the luma plane.
            size = size.checked_add(size / 2).ok_or_else(overflow)?;
        }

        let stride = u32::try_from(stride).map_err(|_| overflow())?;
        let size = usize::try_from(size).map_err(|_| overflow())?;

        Ok(BufferDescriptor {
            width: self.width,
            height: self.height,
            format: self.format,
            usage: self.usage,
            stride_alignment: self.stride_alignment,
            stride,
            size,
        })
    }
}

/// Immutable description of an allocated buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    /// Width of the buffer in pixels.
    pub width: u32,
    /// Height of the buffer in pixels.
    pub height: u32,
    /// Pixel format of the buffer.
    pub format: PixelFormat,
    /// Usage bits the buffer was allocated for.
    pub usage: BufferUsage,
    /// Alignment the stride was rounded to.
    pub stride_alignment: u32,
    /// Stride of the buffer in bytes (bytes per row of the first plane).
    pub stride: u32,
    /// Total size of the backing memory in bytes.
    pub size: usize,
}

impl BufferDescriptor {
    /// Returns `true` if a buffer with this description can satisfy `request`.
    pub fn matches(&self, request: &BufferRequest) -> bool {
        self.width == request.width
            && self.height == request.height
            && self.format == request.format
            && self.usage == request.usage
            && self.stride_alignment == request.stride_alignment
    }
}

struct BufferInner {
    sequence: SequenceNumber,
    descriptor: BufferDescriptor,
    memory: RwLock<Box<[u8]>>,
}

/// Shared reference to an allocated buffer.
///
/// Cloning is cheap and never copies pixel data: producer and consumer see the same
/// memory. The memory itself stays alive until the last handle is dropped, but only the
/// allocator decides when the allocation is considered released.
#[derive(Clone)]
pub struct BufferHandle {
    inner: Arc<BufferInner>,
}

impl BufferHandle {
    /// Wraps zero-initialized memory for `descriptor` under a fresh sequence number.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if `descriptor.size` bytes cannot be reserved.
    pub fn new(descriptor: BufferDescriptor) -> Result<Self, AllocError> {
        let mut memory = Vec::new();
        memory
            .try_reserve_exact(descriptor.size)
            .map_err(|_| AllocError::OutOfMemory { requested: descriptor.size })?;
        memory.resize(descriptor.size, 0u8);
        Ok(Self {
            inner: Arc::new(BufferInner {
                sequence: SequenceNumber::next_unique(),
                descriptor,
                memory: RwLock::new(memory.into_boxed_slice()),
            }),
        })
    }

    /// The buffer's sequence number.
    pub fn sequence(&self) -> SequenceNumber {
        self.inner.sequence
    }

    /// The buffer's immutable description.
    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.inner.descriptor
    }

    pub fn width(&self) -> u32 {
        self.inner.descriptor.width
    }

    pub fn height(&self) -> u32 {
        self.inner.descriptor.height
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.descriptor.format
    }

    pub fn usage(&self) -> BufferUsage {
        self.inner.descriptor.usage
    }

    /// Runs `f` over the mapped pixels.
    pub fn with_pixels<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.inner.memory.read();
        f(&guard)
    }

    /// Runs `f` over the mapped pixels with write access.
    pub fn with_pixels_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.inner.memory.write();
        f(&mut guard)
    }

    /// Returns `true` if both handles refer to the same allocation.
    pub fn ptr_eq(&self, other: &BufferHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for BufferHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for BufferHandle {}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("sequence", &self.inner.sequence)
            .field("descriptor", &self.inner.descriptor)
            .finish()
    }
}

/// Shared-memory allocator that keeps track of every live allocation.
///
/// It allows allocating new buffers, looking them up by sequence number, and freeing
/// them again. Counters of allocate/free calls are kept so callers can check that
/// memory is handed back exactly once.
#[derive(Default)]
pub struct BufferManager {
    buffers: Mutex<HashMap<SequenceNumber, BufferHandle>>,
    allocations: AtomicUsize,
    frees: AtomicUsize,
    /// Maximum number of simultaneously live buffers, `None` for unbounded.
    limit: Option<usize>,
    fail_next: AtomicBool,
}

impl BufferManager {
    /// Creates a new, empty `BufferManager`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a manager that refuses to hold more than `limit` live buffers.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Makes the next call to [`BufferAllocator::allocate`] fail with
    /// [`AllocError::OutOfMemory`].
    pub fn fail_next_allocation(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Retrieves a live buffer by its sequence number.
    ///
    /// # Returns
    /// `Some` if the buffer was allocated here and not freed yet, `None` otherwise.
    pub fn get_buffer(&self, sequence: SequenceNumber) -> Option<BufferHandle> {
        self.buffers.lock().get(&sequence).cloned()
    }

    /// Returns `true` if `sequence` is a live allocation of this manager.
    pub fn is_live(&self, sequence: SequenceNumber) -> bool {
        self.buffers.lock().contains_key(&sequence)
    }

    /// Number of buffers allocated and not yet freed.
    pub fn live_count(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Number of successful allocations since creation.
    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    /// Number of successful frees since creation.
    pub fn free_count(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }
}

impl BufferAllocator for BufferManager {
    fn allocate(&self, request: &BufferRequest) -> Result<BufferHandle, AllocError> {
        let descriptor = request.describe()?;
        if self.fail_next.swap(false, Ordering::SeqCst) {
            tracing::warn!(width = request.width, height = request.height, "Injected allocation failure");
            return Err(AllocError::OutOfMemory { requested: descriptor.size });
        }

        let mut buffers = self.buffers.lock();
        if let Some(limit) = self.limit {
            if buffers.len() >= limit {
                return Err(AllocError::LimitReached { limit });
            }
        }

        let handle = BufferHandle::new(descriptor)?;
        buffers.insert(handle.sequence(), handle.clone());
        self.allocations.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            sequence = %handle.sequence(),
            width = descriptor.width,
            height = descriptor.height,
            format = ?descriptor.format,
            size = descriptor.size,
            "Allocated buffer"
        );
        Ok(handle)
    }

    fn free(&self, handle: &BufferHandle) -> Result<(), AllocError> {
        let sequence = handle.sequence();
        match self.buffers.lock().remove(&sequence) {
            Some(_) => {
                self.frees.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(%sequence, "Freed buffer");
                Ok(())
            }
            None => Err(AllocError::UnknownBuffer(sequence)),
        }
    }
}

impl fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("live", &self.live_count())
            .field("allocations", &self.allocation_count())
            .field("frees", &self.free_count())
            .field("limit", &self.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn rgba_request(width: u32, height: u32) -> BufferRequest {
        BufferRequest {
            width,
            height,
            format: PixelFormat::Rgba8888,
            usage: BufferUsage::default(),
            stride_alignment: 8,
        }
    }

    #[test]
    fn test_unique_sequence_numbers() {
        let id1 = SequenceNumber::next_unique();
        let id2 = SequenceNumber::next_unique();
        assert_ne!(id1, id2, "SequenceNumber::next_unique should generate unique IDs.");
        assert!(id2 > id1, "Sequence numbers must increase monotonically.");
    }

    #[test]
    fn test_sequence_numbers_exceed_u32_range() {
        let beyond = SequenceNumber::new(u64::from(u32::MAX) + 1);
        assert_eq!(beyond.get(), 1 << 32);
        assert_ne!(beyond, SequenceNumber::new(0));
    }

    #[rstest]
    #[case(PixelFormat::Rgba8888, 100, 4, 400, 400 * 10)]
    #[case(PixelFormat::Rgb565, 3, 4, 8, 8 * 10)]
    #[case(PixelFormat::Rgb565, 3, 32, 32, 32 * 10)]
    #[case(PixelFormat::Nv12, 64, 16, 64, 64 * 10 + 64 * 5)]
    fn test_describe_computes_stride_and_size(
        #[case] format: PixelFormat,
        #[case] width: u32,
        #[case] alignment: u32,
        #[case] stride: u32,
        #[case] size: usize,
    ) {
        let request = BufferRequest {
            width,
            height: 10,
            format,
            usage: BufferUsage::CPU_WRITE,
            stride_alignment: alignment,
        };
        let descriptor = request.describe().unwrap();
        assert_eq!(descriptor.stride, stride);
        assert_eq!(descriptor.size, size);
        assert!(descriptor.matches(&request));
    }

    #[test]
    fn test_describe_rejects_invalid_requests() {
        assert!(matches!(rgba_request(0, 10).describe(), Err(AllocError::InvalidRequest(_))));
        let mut request = rgba_request(10, 10);
        request.stride_alignment = 12;
        assert!(matches!(request.describe(), Err(AllocError::InvalidRequest(_))));
    }

    #[rstest]
    #[case(PixelFormat::Rgba8888, u32::MAX, u32::MAX)]
    #[case(PixelFormat::Rgba8888, u32::MAX, 1)]
    #[case(PixelFormat::Rgb565, u32::MAX / 2 + 1, 2)]
    #[case(PixelFormat::Nv12, u32::MAX - 31, u32::MAX)]
    fn test_describe_rejects_oversized_requests(#[case] format: PixelFormat, #[case] width: u32, #[case] height: u32) {
        let request = BufferRequest {
            width,
            height,
            format,
            usage: BufferUsage::default(),
            stride_alignment: 32,
        };
        assert!(
            matches!(request.describe(), Err(AllocError::InvalidRequest(_))),
            "{}x{} {:?} must be rejected, not wrap",
            width,
            height,
            format
        );
    }

    #[test]
    fn test_oversized_allocation_leaves_manager_untouched() {
        let manager = BufferManager::new();
        assert!(matches!(
            manager.allocate(&rgba_request(u32::MAX, u32::MAX)),
            Err(AllocError::InvalidRequest(_))
        ));
        assert_eq!(manager.live_count(), 0);
        assert_eq!(manager.allocation_count(), 0);
    }

    #[test]
    fn test_allocate_buffer() {
        let manager = BufferManager::new();
        let handle = manager.allocate(&rgba_request(640, 480)).unwrap();

        assert!(manager.is_live(handle.sequence()), "Buffer should be registered.");
        let retrieved = manager.get_buffer(handle.sequence()).unwrap();
        assert!(retrieved.ptr_eq(&handle));
        assert_eq!(retrieved.width(), 640);
        assert_eq!(retrieved.height(), 480);
        assert_eq!(retrieved.descriptor().stride, 640 * 4);
        assert_eq!(retrieved.format(), PixelFormat::Rgba8888);
        assert_eq!(manager.allocation_count(), 1);
    }

    #[test]
    fn test_free_buffer_only_once() {
        let manager = BufferManager::new();
        let handle = manager.allocate(&rgba_request(32, 32)).unwrap();

        manager.free(&handle).unwrap();
        assert!(!manager.is_live(handle.sequence()), "Buffer should be removed after free.");
        assert_eq!(manager.free_count(), 1);

        match manager.free(&handle) {
            Err(AllocError::UnknownBuffer(seq)) => assert_eq!(seq, handle.sequence()),
            other => panic!("Expected UnknownBuffer, got {:?}", other),
        }
        assert_eq!(manager.free_count(), 1, "A double free must not be counted.");
    }

    #[test]
    fn test_limit_and_injected_failure() {
        let manager = BufferManager::with_limit(1);
        let first = manager.allocate(&rgba_request(8, 8)).unwrap();
        assert!(matches!(
            manager.allocate(&rgba_request(8, 8)),
            Err(AllocError::LimitReached { limit: 1 })
        ));
        manager.free(&first).unwrap();

        manager.fail_next_allocation();
        assert!(matches!(manager.allocate(&rgba_request(8, 8)), Err(AllocError::OutOfMemory { .. })));
        assert!(manager.allocate(&rgba_request(8, 8)).is_ok(), "Failure injection is one-shot.");
    }

    #[test]
    fn test_handles_share_memory() {
        let manager = BufferManager::new();
        let producer_view = manager.allocate(&rgba_request(4, 4)).unwrap();
        let consumer_view = producer_view.clone();

        producer_view.with_pixels_mut(|pixels| pixels[0] = 0xAB);
        assert_eq!(consumer_view.with_pixels(|pixels| pixels[0]), 0xAB);
    }
}
