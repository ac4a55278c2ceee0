//! The backing region: one fixed-size contiguous byte range, either an
//! anonymous mapping or a memory-mapped file, carrying a versioned
//! header at offset 0. Everything stored inside is an offset or an
//! index, never a pointer, so a file can be remapped at any base
//! address on a later run. Integers are host-endian; the file moves
//! between runs on one machine, not between machines.

use memmap2::{MmapMut, MmapOptions};
use relaydns_core::{Error, Result};
use std::fs::OpenOptions;
use std::path::Path;

/// Version tag checked on reload; bump on any layout change.
pub const CACHE_VERSION: u32 = 23;

pub const HEADER_SIZE: usize = 128;

pub const MIN_CACHE_SIZE: i32 = 102_400;

const COMMENT: &[u8] = b"\nDo not edit this file.\n";
const COMMENT_LEN: usize = HEADER_SIZE - 16 - std::mem::size_of::<HtControl>();

/// Hash-table control block embedded in the header: the pieces of
/// table state that must survive a reload. Base addresses are
/// re-derived from `cache_size` on every open.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct HtControl {
    pub slot_count: i32,
    pub node_used: i32,
    /// Spine head of the free 2D list, -1 when empty.
    pub free_head: i32,
    pub reserved: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Header {
    pub ver: u32,
    pub cache_size: i32,
    /// Bump pointer: one past the highest live payload byte.
    pub end: i32,
    pub cache_count: i32,
    pub ht: HtControl,
    pub comment: [u8; COMMENT_LEN],
}

const _: () = assert!(std::mem::size_of::<HtControl>() == 16);
const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE);

impl Header {
    pub fn fresh(cache_size: i32) -> Self {
        let mut comment = [0u8; COMMENT_LEN];
        comment[..COMMENT.len()].copy_from_slice(COMMENT);
        Self {
            ver: CACHE_VERSION,
            cache_size,
            end: HEADER_SIZE as i32,
            cache_count: 0,
            ht: HtControl {
                slot_count: 0,
                node_used: 0,
                free_head: -1,
                reserved: 0,
            },
            comment,
        }
    }
}

pub struct Region {
    map: MmapMut,
    size: usize,
}

impl Region {
    pub fn anonymous(size: usize) -> Result<Self> {
        let map = MmapMut::map_anon(size)?;
        Ok(Self { map, size })
    }

    /// Opens (creating if needed) and maps the cache file at exactly
    /// `size` bytes. The second value reports whether the file already
    /// existed, which decides between reload and re-create.
    pub fn open_file(path: &Path, size: usize) -> Result<(Self, bool)> {
        let existed = path.is_file();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::CacheInit(format!("cannot open {}: {e}", path.display())))?;
        file.set_len(size as u64)
            .map_err(|e| Error::CacheInit(format!("cannot size {}: {e}", path.display())))?;
        let map = unsafe {
            MmapOptions::new()
                .len(size)
                .map_mut(&file)
                .map_err(|e| Error::CacheInit(format!("cannot map {}: {e}", path.display())))?
        };
        Ok((Self { map, size }, existed))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn zero(&mut self) {
        self.map.fill(0);
    }

    /// Unaligned typed read. The node array base is only 4-aligned
    /// whenever the slot count is odd, so nothing here may assume
    /// natural alignment.
    pub fn read<T: Copy>(&self, off: usize) -> T {
        debug_assert!(off + std::mem::size_of::<T>() <= self.size);
        unsafe { std::ptr::read_unaligned(self.map.as_ptr().add(off) as *const T) }
    }

    pub fn write<T: Copy>(&mut self, off: usize, value: T) {
        debug_assert!(off + std::mem::size_of::<T>() <= self.size);
        unsafe { std::ptr::write_unaligned(self.map.as_mut_ptr().add(off) as *mut T, value) }
    }

    /// Byte view; out-of-range requests yield an empty slice so that a
    /// corrupt offset from disk fails a comparison instead of the
    /// process.
    pub fn bytes(&self, off: usize, len: usize) -> &[u8] {
        self.map.get(off..off.saturating_add(len)).unwrap_or(&[])
    }

    pub fn bytes_mut(&mut self, off: usize, len: usize) -> &mut [u8] {
        self.map
            .get_mut(off..off.saturating_add(len))
            .unwrap_or(&mut [])
    }

    pub fn header(&self) -> Header {
        self.read(0)
    }

    pub fn set_header(&mut self, h: Header) {
        self.write(0, h);
    }
}
