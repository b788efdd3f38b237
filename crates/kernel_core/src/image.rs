//! The user init image: a flat binary whose first bytes describe its
//! sections.
//!
//! Header layout, eleven little-endian `u64` words: magic, link base,
//! entry point, then start/end pairs for text, rodata, data and bss. The
//! binary holds everything from the base up to the end of data; bss is
//! zero-filled at load time.

use hal::{Errno, PhysAddr, VirtAddr, PAGE_SIZE};

use crate::pmm::{order_for, FrameSource};
use crate::scheduler::{UserImage, UserSegment};

/// "USRINIT\0" read as a little-endian word.
pub const IMAGE_MAGIC: u64 = u64::from_le_bytes(*b"USRINIT\0");

const HEADER_WORDS: usize = 11;
pub const HEADER_LEN: usize = HEADER_WORDS * 8;

/// Section layout read from an image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub base: VirtAddr,
    pub entry: VirtAddr,
    pub text: (VirtAddr, VirtAddr),
    pub rodata: (VirtAddr, VirtAddr),
    pub data: (VirtAddr, VirtAddr),
    pub bss: (VirtAddr, VirtAddr),
}

impl ImageLayout {
    /// Bytes the loaded image occupies, bss included.
    pub fn mem_size(&self) -> u64 {
        self.bss.1 - self.base
    }

    /// Bytes the binary must provide.
    pub fn file_size(&self) -> u64 {
        self.data.1 - self.base
    }

    /// Describes the image as loaded at physical `load`.
    pub fn at(&self, load: PhysAddr, device: Option<PhysAddr>) -> UserImage {
        let segment = |(start, end): (VirtAddr, VirtAddr)| UserSegment {
            start,
            end,
            load: load + (start - self.base),
        };
        UserImage {
            text: segment(self.text),
            rodata: segment(self.rodata),
            data: segment(self.data),
            bss: segment(self.bss),
            entry: self.entry,
            device,
        }
    }
}

fn read_u64(image: &[u8], word: usize) -> u64 {
    let offset = word * 8;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&image[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Parses and validates the header of `image`.
pub fn parse_image(image: &[u8]) -> Result<ImageLayout, Errno> {
    if image.len() < HEADER_LEN {
        return Err(Errno::InvalidArg);
    }
    if read_u64(image, 0) != IMAGE_MAGIC {
        return Err(Errno::InvalidArg);
    }
    let pair = |word| (read_u64(image, word), read_u64(image, word + 1));
    let layout = ImageLayout {
        base: read_u64(image, 1),
        entry: read_u64(image, 2),
        text: pair(3),
        rodata: pair(5),
        data: pair(7),
        bss: pair(9),
    };
    let bounds = [
        layout.base,
        layout.text.0,
        layout.text.1,
        layout.rodata.0,
        layout.rodata.1,
        layout.data.0,
        layout.data.1,
        layout.bss.0,
        layout.bss.1,
    ];
    if layout.base % PAGE_SIZE != 0 || bounds.windows(2).any(|w| w[0] > w[1]) {
        return Err(Errno::InvalidArg);
    }
    if layout.entry < layout.text.0 || layout.entry >= layout.text.1 {
        return Err(Errno::InvalidArg);
    }
    if (image.len() as u64) < layout.file_size() {
        return Err(Errno::InvalidArg);
    }
    Ok(layout)
}

/// Copies `image` into fresh zeroed pages and describes the result.
pub fn load_image<F: FrameSource>(
    frames: &F,
    image: &[u8],
    device: Option<PhysAddr>,
) -> Result<UserImage, Errno> {
    let layout = parse_image(image)?;
    let load = frames
        .alloc_zeroed(order_for(layout.mem_size()))
        .ok_or(Errno::NoMem)?;
    let len = layout.file_size() as usize;
    // SAFETY: the run covers mem_size >= file_size bytes and is unshared.
    unsafe {
        core::ptr::copy_nonoverlapping(image.as_ptr(), frames.page_ptr(load), len);
    }
    log::info!(
        "image: {} bytes at {:#x}, entry {:#x}",
        layout.mem_size(),
        load,
        layout.entry
    );
    Ok(layout.at(load, device))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HostMemory;
    use alloc::vec::Vec;

    const BASE: u64 = 0x40_0000;

    fn header(words: [u64; HEADER_WORDS]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn sample() -> Vec<u8> {
        let mut image = header([
            IMAGE_MAGIC,
            BASE,
            BASE + 0x100,
            BASE,
            BASE + 0x1800,
            BASE + 0x2000,
            BASE + 0x2400,
            BASE + 0x3000,
            BASE + 0x3010,
            BASE + 0x3010,
            BASE + 0x5000,
        ]);
        image.resize(0x3010, 0);
        image[0x100] = 0xC0;
        image[0x3008] = 0x5A;
        image
    }

    #[test]
    fn parses_section_layout() {
        let layout = parse_image(&sample()).expect("header should parse");
        assert_eq!(layout.entry, BASE + 0x100);
        assert_eq!(layout.data, (BASE + 0x3000, BASE + 0x3010));
        assert_eq!(layout.mem_size(), 0x5000);
        assert_eq!(layout.file_size(), 0x3010);
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let mut image = sample();
        image[0] ^= 1;
        assert_eq!(parse_image(&image), Err(Errno::InvalidArg));
        let mut image = sample();
        image.truncate(0x2000);
        assert_eq!(parse_image(&image), Err(Errno::InvalidArg));
        assert_eq!(parse_image(&[0u8; 16]), Err(Errno::InvalidArg));
    }

    #[test]
    fn rejects_unordered_sections_and_stray_entry() {
        let mut image = sample();
        image[7 * 8..8 * 8].copy_from_slice(&(BASE + 0x1000).to_le_bytes());
        assert_eq!(parse_image(&image), Err(Errno::InvalidArg));
        let mut image = sample();
        image[16..24].copy_from_slice(&(BASE + 0x2000).to_le_bytes());
        assert_eq!(parse_image(&image), Err(Errno::InvalidArg));
    }

    #[test]
    fn load_copies_file_and_zeroes_bss() {
        let mem = HostMemory::new(16);
        let image = sample();
        let user = load_image(&mem.pool, &image, Some(0x0900_0000)).expect("load should succeed");
        assert_eq!(user.text.load % PAGE_SIZE, 0);
        assert_eq!(user.data.load, user.text.load + 0x3000);
        assert_eq!(user.device, Some(0x0900_0000));
        let base = user.text.load as *const u8;
        // SAFETY: host memory is identity mapped.
        unsafe {
            assert_eq!(*base.add(0x100), 0xC0);
            assert_eq!(*base.add(0x3008), 0x5A);
            assert!((0x3010..0x5000).all(|i| *base.add(i) == 0));
        }
        assert_eq!(mem.pool.free_count(), 16 - 8);
    }
}
