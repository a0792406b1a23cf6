//! The linear memory shared by the calling thread and every worker, and the
//! bounds-checked view host functions use to read and write guest memory.

use std::cell::UnsafeCell;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use wasmtime::{Caller, Engine, Extern, MemoryType, SharedMemory};

use crate::error::{Error, Result};
use crate::wasi::Errno;

/// Size of a wasm page.
pub const PAGE_SIZE: u64 = 64 * 1024;

/// 1 GiB
pub const DEFAULT_INITIAL_PAGES: u32 = 16384;
/// 4 GiB
pub const DEFAULT_MAXIMUM_PAGES: u32 = 65536;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MemoryConfig {
    pub initial_pages: u32,
    pub maximum_pages: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            initial_pages: DEFAULT_INITIAL_PAGES,
            maximum_pages: DEFAULT_MAXIMUM_PAGES,
        }
    }
}

/// A growable memory shared across threads.
///
/// Clones refer to the same bytes; a write made through one clone (or by the
/// module on any thread) is visible through every other clone without copying.
/// The bridge takes no lock on these bytes, concurrent access is the module's
/// own business.
#[derive(Clone)]
pub struct SharedLinearMemory {
    inner: SharedMemory,
}

impl SharedLinearMemory {
    pub fn new(engine: &Engine, config: MemoryConfig) -> Result<Self> {
        let MemoryConfig {
            initial_pages,
            maximum_pages,
        } = config;
        if initial_pages > maximum_pages {
            return Err(Error::InvalidArgument(format!(
                "initial memory ({initial_pages} pages) exceeds maximum ({maximum_pages} pages)"
            )));
        }
        let ty = MemoryType::shared(initial_pages, maximum_pages);
        let inner = SharedMemory::new(engine, ty)
            .map_err(|err| Error::Link(format!("failed to allocate shared memory: {err}")))?;
        log::debug!("allocated shared memory: {initial_pages} pages, maximum {maximum_pages}");
        Ok(Self { inner })
    }

    /// Current size in pages.
    pub fn size_pages(&self) -> u64 {
        self.inner.size()
    }

    pub fn maximum_pages(&self) -> Option<u64> {
        self.inner.ty().maximum()
    }

    /// Current size in bytes.
    pub fn data_size(&self) -> usize {
        self.inner.data_size()
    }

    /// Grows the memory by `delta` pages and returns the previous size.
    /// Memory never shrinks.
    pub fn grow(&self, delta: u64) -> Result<u64> {
        self.inner
            .grow(delta)
            .map_err(|err| Error::InvalidArgument(format!("cannot grow memory: {err}")))
    }

    /// Copies bytes out of the memory.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        MemView::shared(self.inner.data())
            .read_into(offset, buf)
            .map_err(|_| out_of_bounds(offset, buf.len(), self.data_size()))
    }

    /// Copies bytes into the memory.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        MemView::shared(self.inner.data())
            .write_at(offset, data)
            .map_err(|_| out_of_bounds(offset, data.len(), self.data_size()))
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Whether the module's import accepts this memory.
    pub(crate) fn check_import(&self, ty: &MemoryType) -> Result<()> {
        if !ty.is_shared() {
            return Err(Error::Link(
                "the module imports a non-shared memory; only shared memories can be linked"
                    .into(),
            ));
        }
        let size = self.size_pages();
        if size < ty.minimum() {
            return Err(Error::Link(format!(
                "memory import requires at least {} pages, shared memory has {size}",
                ty.minimum()
            )));
        }
        match (ty.maximum(), self.maximum_pages()) {
            (Some(required), Some(ours)) if ours > required => Err(Error::Link(format!(
                "memory import allows at most {required} pages, shared memory may grow to {ours}"
            ))),
            _ => Ok(()),
        }
    }

    pub(crate) fn as_extern(&self) -> SharedMemory {
        self.inner.clone()
    }
}

fn out_of_bounds(offset: usize, len: usize, size: usize) -> Error {
    Error::InvalidArgument(format!(
        "range {offset}..{} is outside of linear memory ({size} bytes)",
        offset.saturating_add(len)
    ))
}

/// A bounds-checked view over guest memory, either the shared memory or a
/// memory the module exports itself.
pub struct MemView<'a> {
    bytes: Bytes<'a>,
}

enum Bytes<'a> {
    Shared(&'a [UnsafeCell<u8>]),
    Exclusive(&'a mut [u8]),
}

impl<'a> MemView<'a> {
    pub fn shared(bytes: &'a [UnsafeCell<u8>]) -> Self {
        Self {
            bytes: Bytes::Shared(bytes),
        }
    }

    pub fn exclusive(bytes: &'a mut [u8]) -> Self {
        Self {
            bytes: Bytes::Exclusive(bytes),
        }
    }

    pub fn len(&self) -> usize {
        match &self.bytes {
            Bytes::Shared(b) => b.len(),
            Bytes::Exclusive(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), Errno> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(Errno::Fault),
        }
    }

    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> Result<(), Errno> {
        self.check(offset, buf.len())?;
        match &self.bytes {
            Bytes::Shared(b) => {
                let src = UnsafeCell::raw_get(b[offset..].as_ptr()) as *const u8;
                // SAFETY: the range was bounds checked and `UnsafeCell<u8>` has
                // the layout of `u8`. Racing writes from other threads can only
                // produce torn values, which the module has to synchronise.
                unsafe { std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) }
            }
            Bytes::Exclusive(b) => buf.copy_from_slice(&b[offset..offset + buf.len()]),
        }
        Ok(())
    }

    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<(), Errno> {
        self.check(offset, data.len())?;
        match &mut self.bytes {
            Bytes::Shared(b) => {
                let dst = UnsafeCell::raw_get(b[offset..].as_ptr());
                // SAFETY: see `read_into`.
                unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) }
            }
            Bytes::Exclusive(b) => b[offset..offset + data.len()].copy_from_slice(data),
        }
        Ok(())
    }

    pub fn read(&self, ptr: u32, len: u32) -> Result<Vec<u8>, Errno> {
        self.check(ptr as usize, len as usize)?;
        let mut buf = vec![0; len as usize];
        self.read_into(ptr as usize, &mut buf)?;
        Ok(buf)
    }

    pub fn read_str(&self, ptr: u32, len: u32) -> Result<String, Errno> {
        String::from_utf8(self.read(ptr, len)?).map_err(|_| Errno::Ilseq)
    }

    pub fn read_u32(&self, ptr: u32) -> Result<u32, Errno> {
        let mut buf = [0u8; 4];
        self.read_into(ptr as usize, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, ptr: u32) -> Result<u64, Errno> {
        let mut buf = [0u8; 8];
        self.read_into(ptr as usize, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_u16(&self, ptr: u32) -> Result<u16, Errno> {
        let mut buf = [0u8; 2];
        self.read_into(ptr as usize, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u8(&self, ptr: u32) -> Result<u8, Errno> {
        let mut buf = [0u8; 1];
        self.read_into(ptr as usize, &mut buf)?;
        Ok(buf[0])
    }

    pub fn write(&mut self, ptr: u32, data: &[u8]) -> Result<(), Errno> {
        self.write_at(ptr as usize, data)
    }

    pub fn write_u8(&mut self, ptr: u32, value: u8) -> Result<(), Errno> {
        self.write(ptr, &[value])
    }

    pub fn write_u16(&mut self, ptr: u32, value: u16) -> Result<(), Errno> {
        self.write(ptr, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, ptr: u32, value: u32) -> Result<(), Errno> {
        self.write(ptr, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, ptr: u32, value: u64) -> Result<(), Errno> {
        self.write(ptr, &value.to_le_bytes())
    }

    /// Reads an array of `(ptr, len)` pairs (`iovec`/`ciovec`).
    pub fn read_iovecs(&self, iovs: u32, count: u32) -> Result<Vec<(u32, u32)>, Errno> {
        (0..count)
            .map(|i| {
                let base = i
                    .checked_mul(8)
                    .and_then(|offset| iovs.checked_add(offset))
                    .ok_or(Errno::Fault)?;
                let len = base.checked_add(4).ok_or(Errno::Fault)?;
                Ok((self.read_u32(base)?, self.read_u32(len)?))
            })
            .collect()
    }
}

/// Implemented by store data that may carry the shared memory.
pub trait MemoryView {
    fn shared_memory(&self) -> Option<&SharedLinearMemory>;
}

/// Runs `f` with a view over the caller's linear memory and its store data.
///
/// The shared memory is preferred; otherwise the module's exported `memory`
/// is used.
pub fn with_memory<T, R>(
    caller: &mut Caller<'_, T>,
    f: impl FnOnce(&mut MemView<'_>, &mut T) -> R,
) -> anyhow::Result<R>
where
    T: MemoryView + 'static,
{
    if let Some(shared) = caller.data().shared_memory().map(|m| m.as_extern()) {
        let mut view = MemView::shared(shared.data());
        return Ok(f(&mut view, caller.data_mut()));
    }
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => {
            let (bytes, data) = memory.data_and_store_mut(caller);
            Ok(f(&mut MemView::exclusive(bytes), data))
        }
        Some(Extern::SharedMemory(memory)) => {
            let mut view = MemView::shared(memory.data());
            Ok(f(&mut view, caller.data_mut()))
        }
        _ => bail!("module has no linear memory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        let mut config = wasmtime::Config::new();
        config.wasm_threads(true);
        Engine::new(&config).unwrap()
    }

    #[test]
    fn test_shared_memory_clones_share_bytes() -> anyhow::Result<()> {
        let memory = SharedLinearMemory::new(
            &engine(),
            MemoryConfig {
                initial_pages: 1,
                maximum_pages: 4,
            },
        )?;
        let other = memory.clone();

        memory.write(100, b"hello")?;
        let mut buf = [0u8; 5];
        other.read(100, &mut buf)?;
        assert_eq!(&buf, b"hello");

        let writer = std::thread::spawn(move || other.write_u32(200, 0xdead_beef));
        writer.join().unwrap()?;
        assert_eq!(memory.read_u32(200)?, 0xdead_beef);

        Ok(())
    }

    #[test]
    fn test_shared_memory_grows_monotonically() -> anyhow::Result<()> {
        let memory = SharedLinearMemory::new(
            &engine(),
            MemoryConfig {
                initial_pages: 1,
                maximum_pages: 2,
            },
        )?;
        assert_eq!(memory.size_pages(), 1);
        assert_eq!(memory.data_size(), PAGE_SIZE as usize);
        assert_eq!(memory.grow(1)?, 1);
        assert_eq!(memory.size_pages(), 2);
        assert!(memory.grow(1).is_err());
        assert_eq!(memory.size_pages(), 2);
        Ok(())
    }

    #[test]
    fn test_out_of_bounds_access() -> anyhow::Result<()> {
        let memory = SharedLinearMemory::new(
            &engine(),
            MemoryConfig {
                initial_pages: 1,
                maximum_pages: 1,
            },
        )?;
        let mut buf = [0u8; 8];
        assert!(memory.read(PAGE_SIZE as usize - 4, &mut buf).is_err());
        assert!(memory.write(usize::MAX, b"x").is_err());
        Ok(())
    }

    #[test]
    fn test_initial_above_maximum_is_rejected() {
        let result = SharedLinearMemory::new(
            &engine(),
            MemoryConfig {
                initial_pages: 4,
                maximum_pages: 2,
            },
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_view_iovecs_and_faults() {
        let mut bytes = vec![0u8; 64];
        let mut view = MemView::exclusive(&mut bytes);
        view.write_u32(0, 32).unwrap();
        view.write_u32(4, 5).unwrap();
        view.write_u32(8, 40).unwrap();
        view.write_u32(12, 3).unwrap();
        assert_eq!(view.read_iovecs(0, 2).unwrap(), vec![(32, 5), (40, 3)]);
        assert_eq!(view.read(60, 8), Err(Errno::Fault));
        assert_eq!(view.read_iovecs(u32::MAX - 2, 1), Err(Errno::Fault));
        assert_eq!(view.read_iovecs(u32::MAX - 3, 1), Err(Errno::Fault));
        assert_eq!(view.read_iovecs(8, u32::MAX), Err(Errno::Fault));
    }

    #[test]
    fn test_check_import_shape() -> anyhow::Result<()> {
        let memory = SharedLinearMemory::new(
            &engine(),
            MemoryConfig {
                initial_pages: 2,
                maximum_pages: 16,
            },
        )?;
        assert!(memory.check_import(&MemoryType::shared(1, 16)).is_ok());
        assert!(memory.check_import(&MemoryType::shared(1, 65536)).is_ok());
        assert!(matches!(
            memory.check_import(&MemoryType::shared(4, 16)),
            Err(Error::Link(_))
        ));
        assert!(matches!(
            memory.check_import(&MemoryType::shared(1, 8)),
            Err(Error::Link(_))
        ));
        assert!(matches!(
            memory.check_import(&MemoryType::new(1, Some(16))),
            Err(Error::Link(_))
        ));
        Ok(())
    }
}
