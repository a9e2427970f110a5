use std::io::{Error, ErrorKind};
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use plain::Plain;

use crate::events::PerfEventHeader;

/// Kernel ring buffer metadata page, the first page of the mmap'd region.
/// Only the fields up to the data area description are of interest; the
/// reserved block pads data_head out to its fixed offset.
#[repr(C)]
#[allow(non_camel_case_types)]
pub struct perf_event_mmap_page {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub __reserved: [u8; 948],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
}

/// One kernel perf ring buffer mapped into user memory.
///
/// The kernel publishes records by advancing `data_head`; we consume by
/// advancing `data_tail`. A record is visible only once it has been fully
/// written, so `has_new_data` implies a complete record at the read
/// position. Wrap-around across the ring boundary is handled here; callers
/// always see contiguous bytes.
#[derive(Debug)]
pub struct PerfEventRingBuffer {
    base: *mut u8,
    data_size: u64,
    mmap_size: usize,
    position: u64,
    fd: RawFd,
    name: String,
}

// The mmap'd region stays valid wherever the buffer is moved; the
// data_head/data_tail protocol with fences is what synchronizes with the
// kernel, not the owning thread.
unsafe impl Send for PerfEventRingBuffer {}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

impl PerfEventRingBuffer {
    /// Map the ring buffer of `fd` with a data area of `size_kb` KiB. The
    /// data area must come out as a power of two of pages, so `size_kb`
    /// itself must be a power of two not smaller than a page.
    pub fn open(fd: RawFd, size_kb: u32, name: String) -> Result<Self, Error> {
        let page = page_size();
        let data_size = size_kb as usize * 1024;
        if !data_size.is_power_of_two() || data_size < page {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("ring buffer size {size_kb} KiB is not a power-of-two page multiple"),
            ));
        }

        let mmap_size = page + data_size;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(PerfEventRingBuffer {
            base: base as *mut u8,
            data_size: data_size as u64,
            mmap_size,
            position: 0,
            fd,
            name,
        })
    }

    pub fn is_open(&self) -> bool {
        !self.base.is_null()
    }

    pub fn file_descriptor(&self) -> RawFd {
        self.fd
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True iff a full record is available at the read position.
    pub fn has_new_data(&self) -> bool {
        self.read_head() != self.position
    }

    /// Non-destructive peek of the header of the next record.
    pub fn read_header(&self) -> PerfEventHeader {
        let mut header = PerfEventHeader::default();
        self.copy_at(0, unsafe { plain::as_mut_bytes(&mut header) });
        header
    }

    /// Copy the record (header included) into `dst` and advance the read
    /// cursor past it. `dst` may be a prefix of the record; trailing bytes
    /// of longer records are dropped.
    pub fn consume_record<T: Plain>(&mut self, header: &PerfEventHeader, dst: &mut T) {
        let dst_bytes = unsafe { plain::as_mut_bytes(dst) };
        let len = dst_bytes.len().min(header.size as usize);
        self.copy_at(0, &mut dst_bytes[..len]);
        self.advance(header);
    }

    /// Copy the full record (header included) out as raw bytes and advance
    /// the read cursor past it.
    pub fn consume_raw(&mut self, header: &PerfEventHeader) -> Vec<u8> {
        let mut bytes = vec![0u8; header.size as usize];
        self.copy_at(0, &mut bytes);
        self.advance(header);
        bytes
    }

    /// Non-destructive read of a value at `offset` bytes from the start of
    /// the next record.
    pub fn read_value_at<T: Plain + Default>(&self, offset: usize) -> T {
        let mut value = T::default();
        self.copy_at(offset, unsafe { plain::as_mut_bytes(&mut value) });
        value
    }

    /// Advance the read cursor past the record without reading its payload.
    pub fn skip_record(&mut self, header: &PerfEventHeader) {
        self.advance(header);
    }

    fn advance(&mut self, header: &PerfEventHeader) {
        self.position += header.size as u64;
        self.write_tail(self.position);
    }

    fn copy_at(&self, offset: usize, dst: &mut [u8]) {
        let data = self.data_slice();
        let start = ((self.position + offset as u64) % self.data_size) as usize;
        if start + dst.len() <= data.len() {
            dst.copy_from_slice(&data[start..start + dst.len()]);
        } else {
            let first = data.len() - start;
            let dst_len = dst.len();
            dst[..first].copy_from_slice(&data[start..]);
            dst[first..].copy_from_slice(&data[..dst_len - first]);
        }
    }

    fn data_slice(&self) -> &[u8] {
        unsafe {
            let data = self.base.add(page_size());
            std::slice::from_raw_parts(data, self.data_size as usize)
        }
    }

    fn read_head(&self) -> u64 {
        unsafe {
            let page = &*(self.base as *const perf_event_mmap_page);
            let head = ptr::read_volatile(&page.data_head);
            fence(Ordering::Acquire);
            head
        }
    }

    fn write_tail(&self, value: u64) {
        unsafe {
            let page = &mut *(self.base as *mut perf_event_mmap_page);
            fence(Ordering::Release);
            ptr::write_volatile(&mut page.data_tail, value);
        }
    }
}

impl Drop for PerfEventRingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.mmap_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn metadata_page_layout() {
        // data_head sits at offset 1024 in the kernel's layout; the
        // reserved padding must keep it there.
        assert_eq!(mem::offset_of!(perf_event_mmap_page, data_head), 1024);
        assert_eq!(mem::offset_of!(perf_event_mmap_page, data_tail), 1032);
    }

    #[test]
    fn rejects_non_power_of_two_size() {
        let err = PerfEventRingBuffer::open(-1, 24, "bad".to_string());
        assert_eq!(err.unwrap_err().kind(), ErrorKind::InvalidInput);
    }
}
