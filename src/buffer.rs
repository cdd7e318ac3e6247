//! Device memory buffers.
//!
//! A [`Buffer`] is a handle: clones refer to the same allocation, and kernel
//! argument slots compare buffers by that identity. All transfers are
//! blocking on the device context's single queue.

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::Rc;

use bytemuck::Pod;

use crate::device::DeviceContext;
use crate::diagnostics::Event;
use crate::driver::Driver;
use crate::{ClError, ClResult};

struct BufferState<M> {
    /// `None` once released, and for zero-sized buffers.
    mem: Option<M>,
    size: usize,
    released: bool,
}

struct BufferInner<D: Driver> {
    // Dropped before `ctx`: memory is released while the context is alive.
    state: RefCell<BufferState<D::Mem>>,
    name: String,
    ctx: Rc<DeviceContext<D>>,
}

/// One device allocation of fixed byte size.
pub struct Buffer<D: Driver> {
    inner: Rc<BufferInner<D>>,
}

impl<D: Driver> Clone for Buffer<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<D: Driver> fmt::Debug for Buffer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Buffer")
            .field("name", &self.inner.name)
            .field("size", &state.size)
            .field("released", &state.released)
            .finish()
    }
}

impl<D: Driver> Buffer<D> {
    /// Allocate `size` bytes of uninitialized device memory.
    pub(crate) fn allocate(
        ctx: &Rc<DeviceContext<D>>,
        size: usize,
        name: impl Into<String>,
    ) -> ClResult<Self> {
        let name = name.into();
        let mem = if size == 0 {
            None
        } else {
            let mem = ctx
                .driver()
                .create_buffer(ctx.context(), size)
                .map_err(|e| ClError::AllocationFailed {
                    name: name.clone(),
                    size,
                    reason: e.to_string(),
                })?;
            Some(mem)
        };
        ctx.emit(Event::BufferAllocated {
            name: name.clone(),
            size,
        });
        Ok(Self {
            inner: Rc::new(BufferInner {
                state: RefCell::new(BufferState {
                    mem,
                    size,
                    released: false,
                }),
                name,
                ctx: Rc::clone(ctx),
            }),
        })
    }

    /// Allocate exactly `size_of_val(data)` bytes and upload `data`.
    pub(crate) fn from_slice<T: Pod>(
        ctx: &Rc<DeviceContext<D>>,
        data: &[T],
        name: impl Into<String>,
    ) -> ClResult<Self> {
        let buf = Self::allocate(ctx, mem::size_of_val(data), name)?;
        buf.write(data)?;
        Ok(buf)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Byte size; 0 after release.
    pub fn size(&self) -> usize {
        self.inner.state.borrow().size
    }

    pub fn is_released(&self) -> bool {
        self.inner.state.borrow().released
    }

    /// Whether both handles refer to the same allocation.
    pub fn same_allocation(&self, other: &Buffer<D>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn context(&self) -> &Rc<DeviceContext<D>> {
        &self.inner.ctx
    }

    fn ensure_live(&self) -> ClResult<()> {
        if self.is_released() {
            return Err(ClError::usage(format!(
                "buffer {} has been released",
                self.inner.name
            )));
        }
        Ok(())
    }

    /// Blocking upload of `data` to the start of the buffer. A zero-length
    /// slice is a no-op, even on a released buffer.
    pub fn write<T: Pod>(&self, data: &[T]) -> ClResult<&Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.is_empty() {
            return Ok(self);
        }
        self.ensure_live()?;
        let mut state = self.inner.state.borrow_mut();
        if bytes.len() > state.size {
            return Err(ClError::usage(format!(
                "write of {} bytes into buffer {} of {} bytes",
                bytes.len(),
                self.inner.name,
                state.size
            )));
        }
        let ctx = &self.inner.ctx;
        if let Some(mem) = state.mem.as_mut() {
            ctx.driver().write_buffer(ctx.queue(), mem, 0, bytes)?;
        }
        ctx.emit(Event::BufferWritten {
            name: self.inner.name.clone(),
            bytes: bytes.len(),
        });
        Ok(self)
    }

    /// The whole buffer as `size / size_of::<T>()` elements.
    pub fn read<T: Pod>(&self) -> ClResult<Vec<T>> {
        self.read_range(0, None)
    }

    /// Read `len` bytes (default: the rest of the buffer) starting at
    /// `start`, clamped to the buffer size. An explicit `len` must be a
    /// multiple of `size_of::<T>()`. An explicit zero `len` is a no-op in
    /// any buffer state.
    pub fn read_range<T: Pod>(&self, start: usize, len: Option<usize>) -> ClResult<Vec<T>> {
        if len == Some(0) {
            return Ok(Vec::new());
        }
        self.ensure_live()?;
        let width = element_width::<T>()?;
        let size = self.size();
        let start = start.min(size);
        let len = match len {
            Some(len) if len % width != 0 => {
                return Err(ClError::usage(format!(
                    "read of {len} bytes is not a multiple of the {width}-byte element"
                )));
            }
            Some(len) => len,
            None => (size - start) / width * width,
        };
        self.check_range(start, len)?;

        let mut out = vec![T::zeroed(); len / width];
        self.transfer_out(start, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    /// Read into `target`. `start` is clamped to the buffer size; `len`
    /// defaults to the rest of the buffer and must fit in `target`.
    pub fn read_into<T: Pod>(
        &self,
        target: &mut [T],
        start: usize,
        len: Option<usize>,
    ) -> ClResult<&Self> {
        if len == Some(0) {
            return Ok(self);
        }
        self.ensure_live()?;
        let size = self.size();
        let start = start.min(size);
        let len = len.unwrap_or(size - start);
        self.check_range(start, len)?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(target);
        if len > bytes.len() {
            return Err(ClError::usage(format!(
                "target of {} bytes cannot hold a {len}-byte read",
                bytes.len()
            )));
        }
        self.transfer_out(start, &mut bytes[..len])?;
        Ok(self)
    }

    fn check_range(&self, start: usize, len: usize) -> ClResult<()> {
        let size = self.size();
        if start.checked_add(len).map_or(true, |end| end > size) {
            return Err(ClError::usage(format!(
                "range {start}..{} is outside buffer {} of {size} bytes",
                start.saturating_add(len),
                self.inner.name
            )));
        }
        Ok(())
    }

    fn transfer_out(&self, start: usize, out: &mut [u8]) -> ClResult<()> {
        if out.is_empty() {
            return Ok(());
        }
        let state = self.inner.state.borrow();
        let ctx = &self.inner.ctx;
        if let Some(mem) = state.mem.as_ref() {
            ctx.driver().read_buffer(ctx.queue(), mem, start, out)?;
        }
        ctx.emit(Event::BufferRead {
            name: self.inner.name.clone(),
            bytes: out.len(),
        });
        Ok(())
    }

    /// Device-to-device copy of `min(self.size(), dest.size())` bytes,
    /// followed by a queue finish.
    pub fn copy_into<'a>(&self, dest: &'a Buffer<D>) -> ClResult<&'a Buffer<D>> {
        self.ensure_live()?;
        dest.ensure_live()?;
        if !Rc::ptr_eq(&self.inner.ctx, &dest.inner.ctx) {
            return Err(ClError::usage(format!(
                "buffers {} and {} belong to different contexts",
                self.inner.name, dest.inner.name
            )));
        }
        if self.same_allocation(dest) {
            return Ok(dest);
        }
        let len = self.size().min(dest.size());
        if len == 0 {
            return Ok(dest);
        }

        let src = self.inner.state.borrow();
        let mut dst = dest.inner.state.borrow_mut();
        let ctx = &self.inner.ctx;
        if let (Some(s), Some(d)) = (src.mem.as_ref(), dst.mem.as_mut()) {
            ctx.driver().copy_buffer(ctx.queue(), s, d, len)?;
            ctx.finish()?;
        }
        ctx.emit(Event::BufferCopied {
            from: self.inner.name.clone(),
            to: dest.inner.name.clone(),
            bytes: len,
        });
        Ok(dest)
    }

    /// Free the device memory. Every handle to this allocation sees size 0
    /// afterwards, and any further operation is a usage error.
    pub fn release(&self) -> ClResult<()> {
        self.ensure_live()?;
        let mem = {
            let mut state = self.inner.state.borrow_mut();
            state.size = 0;
            state.released = true;
            state.mem.take()
        };
        drop(mem);
        self.inner.ctx.emit(Event::BufferReleased {
            name: self.inner.name.clone(),
        });
        Ok(())
    }

    /// Run `f` with the device handle, for binding as a kernel argument.
    pub(crate) fn with_mem<R>(&self, f: impl FnOnce(&D::Mem) -> R) -> ClResult<R> {
        self.ensure_live()?;
        let state = self.inner.state.borrow();
        match state.mem.as_ref() {
            Some(mem) => Ok(f(mem)),
            None => Err(ClError::usage(format!(
                "buffer {} has no device memory",
                self.inner.name
            ))),
        }
    }
}

fn element_width<T>() -> ClResult<usize> {
    match mem::size_of::<T>() {
        0 => Err(ClError::usage("cannot read zero-sized elements")),
        n => Ok(n),
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::{SimDevice, SimDriver};
    use crate::{ClError, ErrorKind, Runtime};
    use rstest::rstest;

    fn runtime() -> (Runtime<SimDriver>, SimDriver) {
        let driver = SimDriver::new(vec![SimDevice::gpu("sim", "NVIDIA")]);
        (Runtime::simulated(driver.clone()).unwrap(), driver)
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(4096)]
    fn test_round_trip(#[case] len: usize) {
        let (rt, _) = runtime();
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
        let buf = rt.create_buffer(len, "rt").unwrap();
        buf.write(&data).unwrap();
        assert_eq!(buf.read::<u8>().unwrap(), data);
    }

    #[test]
    fn test_zero_length_submits_nothing() {
        let (rt, driver) = runtime();
        let buf = rt.create_buffer(16, "b").unwrap();
        let before = driver.stats();
        buf.write::<u32>(&[]).unwrap();
        assert!(buf.read_range::<u32>(4, Some(0)).unwrap().is_empty());
        let mut empty: [u8; 0] = [];
        buf.read_into(&mut empty, 0, Some(0)).unwrap();
        let after = driver.stats();
        assert_eq!(after.writes, before.writes);
        assert_eq!(after.reads, before.reads);
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_zero_length_ignores_buffer_state(#[case] released: bool) {
        let (rt, driver) = runtime();
        let buf = rt.create_buffer(16, "b").unwrap();
        if released {
            buf.release().unwrap();
        }
        let before = driver.stats();
        buf.write::<u32>(&[]).unwrap();
        assert!(buf.read_range::<u32>(0, Some(0)).unwrap().is_empty());
        let mut empty: [u8; 0] = [];
        buf.read_into(&mut empty, 0, Some(0)).unwrap();
        let after = driver.stats();
        assert_eq!(after.writes, before.writes);
        assert_eq!(after.reads, before.reads);
    }

    #[test]
    fn test_create_from_slice() {
        let (rt, driver) = runtime();
        let buf = rt.create_buffer_from(&[1.5f32, 2.5, 3.5], "floats").unwrap();
        assert_eq!(buf.size(), 12);
        assert_eq!(buf.read::<f32>().unwrap(), vec![1.5, 2.5, 3.5]);
        assert_eq!(driver.stats().writes, 1);
    }

    #[test]
    fn test_allocation_failure() {
        let driver = SimDriver::new(vec![SimDevice::gpu("tiny", "NVIDIA").with_max_alloc(64)]);
        let rt = Runtime::simulated(driver).unwrap();
        let err = rt.create_buffer(128, "big").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AllocationFailed);
        assert!(matches!(err, ClError::AllocationFailed { size: 128, .. }));
    }

    #[test]
    fn test_oversized_write_is_usage_error() {
        let (rt, _) = runtime();
        let buf = rt.create_buffer(4, "small").unwrap();
        let err = buf.write(&[1u32, 2]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UsageError);
    }

    #[test]
    fn test_read_range() {
        let (rt, _) = runtime();
        let buf = rt.create_buffer_from(&[10u32, 20, 30, 40], "v").unwrap();
        assert_eq!(buf.read_range::<u32>(4, Some(8)).unwrap(), vec![20, 30]);
        assert_eq!(buf.read_range::<u32>(8, None).unwrap(), vec![30, 40]);
        // start is clamped to the size
        assert!(buf.read_range::<u32>(100, None).unwrap().is_empty());
        let err = buf.read_range::<u32>(0, Some(6)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UsageError);
        let err = buf.read_range::<u32>(12, Some(8)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UsageError);
    }

    #[test]
    fn test_read_into() {
        let (rt, _) = runtime();
        let buf = rt.create_buffer_from(&[1u8, 2, 3, 4, 5], "v").unwrap();
        let mut target = [0u8; 8];
        buf.read_into(&mut target, 2, None).unwrap();
        assert_eq!(&target[..3], &[3, 4, 5]);
        let mut small = [0u8; 2];
        let err = buf.read_into(&mut small, 0, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UsageError);
    }

    #[rstest]
    #[case(8, 16, 8)]
    #[case(16, 8, 8)]
    #[case(12, 12, 12)]
    fn test_copy_into_copies_min(#[case] src: usize, #[case] dst: usize, #[case] copied: usize) {
        let (rt, driver) = runtime();
        let a = rt
            .create_buffer_from(&vec![0xAAu8; src], "a")
            .unwrap();
        let b = rt.create_buffer_from(&vec![0x11u8; dst], "b").unwrap();
        let finishes = driver.stats().finishes;
        a.copy_into(&b).unwrap();
        assert_eq!(driver.stats().finishes, finishes + 1);
        let out = b.read::<u8>().unwrap();
        assert!(out[..copied].iter().all(|&x| x == 0xAA));
        assert!(out[copied..].iter().all(|&x| x == 0x11));
        assert_eq!(driver.stats().copied_bytes, copied);
    }

    #[test]
    fn test_copy_into_self_is_noop() {
        let (rt, driver) = runtime();
        let a = rt.create_buffer_from(&[1u32, 2], "a").unwrap();
        let alias = a.clone();
        a.copy_into(&alias).unwrap();
        assert_eq!(driver.stats().copies, 0);
    }

    #[test]
    fn test_release() {
        let (rt, driver) = runtime();
        let a = rt.create_buffer(32, "a").unwrap();
        let alias = a.clone();
        a.release().unwrap();
        assert_eq!(alias.size(), 0);
        assert!(alias.is_released());
        assert_eq!(driver.stats().releases, 1);

        for err in [
            alias.read::<u8>().unwrap_err(),
            alias.write(&[1u8]).map(|_| ()).unwrap_err(),
            alias.release().unwrap_err(),
        ] {
            assert_eq!(err.kind(), ErrorKind::UsageError);
        }
    }

    #[test]
    fn test_drop_frees_memory() {
        let (rt, driver) = runtime();
        let a = rt.create_buffer(32, "a").unwrap();
        let alias = a.clone();
        drop(a);
        assert_eq!(driver.stats().releases, 0);
        drop(alias);
        assert_eq!(driver.stats().releases, 1);
    }
}
