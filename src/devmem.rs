//! Direct /dev/mem access through a single page window
//!
//! Maps exactly one page of physical memory around the target address and
//! provides typed 1/2/4/8-byte loads and stores inside it.
//!
//! Accesses go straight to whatever the physical address decodes to. A bus
//! error or fault from the hardware kills the process; nothing here tries to
//! catch it.
//!
//! Aligned targets get a single volatile access of the element width. A
//! misaligned target (native policy only) goes through an unaligned,
//! non-volatile load or store, which the compiler may split into narrower
//! accesses. Registers that care about access width need aligned addresses
//! or a strict-alignment build.

use std::fs::{File, OpenOptions};
use std::io;
use std::mem::{self, ManuallyDrop};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

use thiserror::Error;

use crate::config::ElementSize;

/// Size of the mapped window (one page)
pub const WINDOW_SIZE: usize = 4096;
const WINDOW_MASK: u64 = WINDOW_SIZE as u64 - 1;

/// Physical address of the window containing `address`
pub const fn page_base(address: u64) -> u64 {
    address & !WINDOW_MASK
}

/// Byte offset of `address` inside its window
pub const fn page_offset(address: u64) -> usize {
    (address & WINDOW_MASK) as usize
}

// 32-bit glibc and bionic have a 32-bit off_t; the *64 calls keep the full
// physical range reachable there. musl's off_t is always 64 bits.
#[cfg(any(all(target_os = "linux", target_env = "gnu"), target_os = "android"))]
use libc::{mmap64 as mmap, off64_t as MapOffset};
#[cfg(not(any(all(target_os = "linux", target_env = "gnu"), target_os = "android")))]
use libc::{mmap, off_t as MapOffset};

/// `mmap` offset for a page base, if the platform can express it
pub fn map_offset(physical_base: u64) -> Option<MapOffset> {
    MapOffset::try_from(physical_base).ok()
}

/// How misaligned targets are treated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlignmentPolicy {
    /// Access the computed address as is
    Native,
    /// Round down to a multiple of the element size first
    Strict,
}

impl AlignmentPolicy {
    /// Policy selected at build time (`DEVMEM_STRICT_ALIGNMENT`)
    pub const BUILD: AlignmentPolicy = if cfg!(strict_alignment) {
        AlignmentPolicy::Strict
    } else {
        AlignmentPolicy::Native
    };

    /// Apply the policy to a window offset.
    ///
    /// The window base is page aligned, so rounding the offset rounds the
    /// virtual address by the same amount.
    pub fn fixup(self, offset: usize, size: ElementSize) -> usize {
        match self {
            AlignmentPolicy::Native => offset,
            AlignmentPolicy::Strict => offset & !(size.bytes() - 1),
        }
    }
}

#[derive(Debug, Error)]
pub enum DevMemError {
    #[error("unable to open {}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("mmap of physical page 0x{address:08x} failed: {source}")]
    Map { address: u64, source: io::Error },

    #[error("munmap failed: {0}")]
    Unmap(io::Error),

    #[error("closing the memory device failed: {0}")]
    Close(io::Error),

    #[error("{size}-byte access at window offset 0x{offset:03x} crosses the end of the page")]
    OutOfWindow { offset: usize, size: ElementSize },
}

/// One mapped page of physical memory
pub struct PageWindow {
    ptr: NonNull<u8>,
    file: File,
    physical_base: u64,
    alignment: AlignmentPolicy,
}

impl PageWindow {
    /// Open `device` and map the page containing `address`
    pub fn open(device: &Path, address: u64) -> Result<Self, DevMemError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(device)
            .map_err(|source| DevMemError::Open {
                path: device.to_path_buf(),
                source,
            })?;

        let physical_base = page_base(address);
        let offset = map_offset(physical_base).ok_or_else(|| DevMemError::Map {
            address: physical_base,
            source: io::Error::from_raw_os_error(libc::EOVERFLOW),
        })?;

        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                WINDOW_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(DevMemError::Map {
                address: physical_base,
                source: io::Error::last_os_error(),
            });
        }
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| DevMemError::Map {
            address: physical_base,
            source: io::Error::from_raw_os_error(libc::EINVAL),
        })?;

        tracing::debug!("map_base={:p}", ptr.as_ptr());

        Ok(Self {
            ptr,
            file,
            physical_base,
            alignment: AlignmentPolicy::BUILD,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_alignment(mut self, alignment: AlignmentPolicy) -> Self {
        self.alignment = alignment;
        self
    }

    /// Physical address of the first byte of the window
    pub fn physical_base(&self) -> u64 {
        self.physical_base
    }

    /// Load one element from `address`, zero-extended
    pub fn load(&self, address: u64, size: ElementSize) -> Result<u64, DevMemError> {
        let target = self.target(address, size)?;
        tracing::debug!(
            "reading {} bytes from 0x{:08x} (mapped to {:p})",
            size,
            address,
            target
        );

        // Safety: `target` is inside the mapping and valid for `size` bytes
        let value = unsafe {
            match size {
                ElementSize::U8 => u64::from(read_element::<u8>(target)),
                ElementSize::U16 => u64::from(read_element::<u16>(target)),
                ElementSize::U32 => u64::from(read_element::<u32>(target)),
                ElementSize::U64 => read_element::<u64>(target),
            }
        };
        Ok(value)
    }

    /// Store the low `size` bytes of `value` at `address`
    pub fn store(&self, address: u64, size: ElementSize, value: u64) -> Result<(), DevMemError> {
        let target = self.target(address, size)?;
        tracing::debug!(
            "writing {} bytes (value 0x{:x}) to 0x{:08x} (mapped to {:p})",
            size,
            size.truncate(value),
            address,
            target
        );

        // Safety: `target` is inside the mapping and valid for `size` bytes
        unsafe {
            match size {
                ElementSize::U8 => write_element(target, value as u8),
                ElementSize::U16 => write_element(target, value as u16),
                ElementSize::U32 => write_element(target, value as u32),
                ElementSize::U64 => write_element(target, value),
            }
        }
        Ok(())
    }

    /// Unmap the window and close the device.
    ///
    /// Both releases are attempted even if the first fails; the first
    /// failure is returned.
    pub fn close(self) -> Result<(), DevMemError> {
        let this = ManuallyDrop::new(self);
        // Safety: `this` is never dropped, so the file is moved out exactly once
        let file = unsafe { ptr::read(&this.file) };

        let unmapped = unsafe { unmap(this.ptr) };
        let closed = if unsafe { libc::close(file.into_raw_fd()) } == -1 {
            Err(DevMemError::Close(io::Error::last_os_error()))
        } else {
            Ok(())
        };

        unmapped.and(closed)
    }

    fn target(&self, address: u64, size: ElementSize) -> Result<*mut u8, DevMemError> {
        let offset = self.alignment.fixup(page_offset(address), size);
        if offset + size.bytes() > WINDOW_SIZE {
            return Err(DevMemError::OutOfWindow { offset, size });
        }
        // Safety: offset is below WINDOW_SIZE, the mapping length
        Ok(unsafe { self.ptr.as_ptr().add(offset) })
    }
}

impl Drop for PageWindow {
    fn drop(&mut self) {
        // Only reached on paths that skipped close(); the file closes itself.
        let _ = unsafe { unmap(self.ptr) };
    }
}

unsafe fn unmap(ptr: NonNull<u8>) -> Result<(), DevMemError> {
    if libc::munmap(ptr.as_ptr().cast(), WINDOW_SIZE) == -1 {
        return Err(DevMemError::Unmap(io::Error::last_os_error()));
    }
    Ok(())
}

fn is_aligned<T>(ptr: *const u8) -> bool {
    ptr as usize % mem::align_of::<T>() == 0
}

// Misaligned targets only happen under the native policy. Volatile access
// requires alignment, so those fall back to unaligned loads and stores.
unsafe fn read_element<T: Copy>(ptr: *const u8) -> T {
    if is_aligned::<T>(ptr) {
        ptr::read_volatile(ptr.cast::<T>())
    } else {
        ptr::read_unaligned(ptr.cast::<T>())
    }
}

unsafe fn write_element<T: Copy>(ptr: *mut u8, value: T) {
    if is_aligned::<T>(ptr) {
        ptr::write_volatile(ptr.cast::<T>(), value)
    } else {
        ptr::write_unaligned(ptr.cast::<T>(), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use tempfile::NamedTempFile;

    const SIZES: [ElementSize; 4] = [
        ElementSize::U8,
        ElementSize::U16,
        ElementSize::U32,
        ElementSize::U64,
    ];

    /// A regular file standing in for the memory device, three pages long
    fn scratch_device() -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(3 * WINDOW_SIZE as u64).unwrap();
        file
    }

    fn file_bytes(file: &mut NamedTempFile, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn page_base_contains_address() {
        for address in [1u64, 0xffe, 0x1000, 0x1fff, 0x4321_0abc, u64::MAX] {
            let base = page_base(address);
            assert_eq!(base % WINDOW_SIZE as u64, 0);
            assert!(base <= address);
            assert!(address - base < WINDOW_SIZE as u64);
            assert_eq!(base + page_offset(address) as u64, address);
        }
    }

    #[test]
    fn high_32_bit_addresses_are_mappable() {
        for address in [0x4000_0000u64, 0x8000_0000, 0xf800_0100, 0xffff_f000] {
            assert_eq!(
                map_offset(page_base(address)).map(i64::from),
                Some(page_base(address) as i64)
            );
        }
        assert!(map_offset(0x8000_0000_0000_0000).is_none());
    }

    #[test]
    fn strict_policy_rounds_down() {
        assert_eq!(AlignmentPolicy::Strict.fixup(0xffe, ElementSize::U32), 0xffc);
        assert_eq!(AlignmentPolicy::Strict.fixup(0x007, ElementSize::U64), 0x000);
        assert_eq!(AlignmentPolicy::Strict.fixup(0x003, ElementSize::U16), 0x002);
        assert_eq!(AlignmentPolicy::Strict.fixup(0x003, ElementSize::U8), 0x003);
        assert_eq!(AlignmentPolicy::Native.fixup(0xffe, ElementSize::U32), 0xffe);
    }

    #[test]
    fn store_then_load_round_trips_truncated() {
        let device = scratch_device();
        let window = PageWindow::open(device.path(), 0x1010).unwrap();
        assert_eq!(window.physical_base(), 0x1000);

        let value = 0x1122_3344_5566_7788;
        for size in SIZES {
            window.store(0x1010, size, value).unwrap();
            assert_eq!(window.load(0x1010, size).unwrap(), size.truncate(value));
        }
        window.close().unwrap();
    }

    #[test]
    fn stores_reach_the_device() {
        let mut device = scratch_device();
        let window = PageWindow::open(device.path(), 0x1234).unwrap();
        window.store(0x1234, ElementSize::U32, 0xdead_beef).unwrap();
        window.close().unwrap();

        let bytes = file_bytes(&mut device, 0x1234, 4);
        assert_eq!(u32::from_ne_bytes(bytes.try_into().unwrap()), 0xdead_beef);
    }

    #[test]
    fn loads_see_device_contents() {
        let mut device = scratch_device();
        device.seek(SeekFrom::Start(0x2008)).unwrap();
        device.write_all(&0x0102_0304_0506_0708u64.to_ne_bytes()).unwrap();
        device.flush().unwrap();

        let window = PageWindow::open(device.path(), 0x2008).unwrap();
        assert_eq!(window.load(0x2008, ElementSize::U64).unwrap(), 0x0102_0304_0506_0708);
        window.close().unwrap();
    }

    #[test]
    fn misaligned_native_access_round_trips() {
        let device = scratch_device();
        let window = PageWindow::open(device.path(), 0x1001)
            .unwrap()
            .with_alignment(AlignmentPolicy::Native);
        window.store(0x1001, ElementSize::U32, 0xcafe_f00d).unwrap();
        assert_eq!(window.load(0x1001, ElementSize::U32).unwrap(), 0xcafe_f00d);
    }

    #[test]
    fn strict_access_lands_on_aligned_address() {
        let mut device = scratch_device();
        let window = PageWindow::open(device.path(), 0x1006)
            .unwrap()
            .with_alignment(AlignmentPolicy::Strict);
        window.store(0x1006, ElementSize::U32, 0xa5a5_a5a5).unwrap();
        window.close().unwrap();

        assert_eq!(file_bytes(&mut device, 0x1004, 4), vec![0xa5; 4]);
        assert_eq!(file_bytes(&mut device, 0x1008, 2), vec![0; 2]);
    }

    #[test]
    fn access_straddling_the_page_end_is_refused() {
        let device = scratch_device();
        let window = PageWindow::open(device.path(), 0x1ffe)
            .unwrap()
            .with_alignment(AlignmentPolicy::Native);
        assert!(matches!(
            window.store(0x1ffe, ElementSize::U32, 1),
            Err(DevMemError::OutOfWindow { offset: 0xffe, .. })
        ));
        assert!(window.load(0x1fff, ElementSize::U16).is_err());
        assert_eq!(window.load(0x1fff, ElementSize::U8).unwrap(), 0);

        let window = window.with_alignment(AlignmentPolicy::Strict);
        window.store(0x1ffe, ElementSize::U32, 1).unwrap();
    }

    #[test]
    fn open_reports_missing_device() {
        let err = PageWindow::open(Path::new("/nonexistent/devmem"), 0x1000)
            .err()
            .unwrap();
        assert!(matches!(err, DevMemError::Open { .. }));
        assert!(err.to_string().contains("/nonexistent/devmem"));
    }

    #[test]
    fn dropping_without_close_releases_the_mapping() {
        let device = scratch_device();
        for _ in 0..64 {
            let window = PageWindow::open(device.path(), 0x1000).unwrap();
            window.store(0x1000, ElementSize::U8, 1).unwrap();
        }
    }
}
