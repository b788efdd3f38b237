//! Three-level AArch64 translation tables (4 KiB granule, 39-bit VA).

use hal::{Asid, Errno, PageFlags, PagingOps, PhysAddr, VirtAddr, PAGE_SIZE};

use crate::pmm::{FrameSource, LinearMap};

/// Descriptor bits.
pub mod desc {
    pub const VALID: u64 = 1;
    pub const TYPE_MASK: u64 = 3;
    pub const TYPE_TABLE: u64 = 3;
    pub const TYPE_BLOCK: u64 = 1;
    /// Level-3 page descriptors share the table encoding.
    pub const TYPE_PAGE: u64 = 3;
    pub const USER: u64 = 1 << 6;
    pub const RDONLY: u64 = 1 << 7;
    pub const INNER_SHARE: u64 = 3 << 8;
    pub const AF: u64 = 1 << 10;
    pub const NG: u64 = 1 << 11;
    pub const PXN: u64 = 1 << 53;
    pub const UXN: u64 = 1 << 54;
    pub const ADDR_MASK: u64 = !0xFFF & ((1 << 48) - 1);

    pub const MT_DEVICE_NGNRNE: u64 = 0;
    pub const MT_NORMAL: u64 = 4;

    pub const fn memtype(index: u64) -> u64 {
        index << 2
    }
}

const ENTRIES: usize = 512;
const L1_SHIFT: u32 = 30;
const L2_SHIFT: u32 = 21;
const L3_SHIFT: u32 = 12;

/// Bytes covered by a level-2 block descriptor.
pub const BLOCK_SIZE: u64 = 1 << L2_SHIFT;

const fn index(va: VirtAddr, shift: u32) -> usize {
    ((va >> shift) as usize) & (ENTRIES - 1)
}

/// Descriptor attributes for a leaf with `flags`.
pub fn leaf_attrs(flags: PageFlags) -> u64 {
    let mut attrs = desc::AF;
    if flags.contains(PageFlags::DEVICE) {
        attrs |= desc::memtype(desc::MT_DEVICE_NGNRNE) | desc::PXN | desc::UXN;
    } else {
        attrs |= desc::memtype(desc::MT_NORMAL) | desc::INNER_SHARE;
        if !flags.contains(PageFlags::EXECUTE) {
            attrs |= desc::PXN | desc::UXN;
        } else if flags.contains(PageFlags::USER) {
            attrs |= desc::PXN;
        } else {
            attrs |= desc::UXN;
        }
    }
    if flags.contains(PageFlags::USER) {
        attrs |= desc::USER | desc::PXN;
    }
    if !flags.contains(PageFlags::WRITE) {
        attrs |= desc::RDONLY;
    }
    if !flags.contains(PageFlags::GLOBAL) {
        attrs |= desc::NG;
    }
    attrs
}

/// A resolved leaf: physical page plus the raw descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leaf {
    pub pa: PhysAddr,
    pub desc: u64,
}

impl Leaf {
    pub fn writable(&self) -> bool {
        self.desc & desc::RDONLY == 0
    }

    pub fn user(&self) -> bool {
        self.desc & desc::USER != 0
    }
}

/// Root of one translation tree. Table pages come from a [`FrameSource`]
/// and are reached through its linear map.
#[derive(Debug, PartialEq, Eq)]
pub struct PageTable {
    root: PhysAddr,
}

impl PageTable {
    /// Allocates a zeroed root table.
    pub fn new<F: FrameSource>(frames: &F) -> Result<Self, Errno> {
        let root = frames.alloc_zeroed(0).ok_or(Errno::NoMem)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Maps `[va, va + size)` to `[pa, pa + size)` page by page.
    ///
    /// Leaves that are already populated keep their first mapping.
    pub fn map<F: FrameSource>(
        &mut self,
        frames: &F,
        va: VirtAddr,
        pa: PhysAddr,
        size: u64,
        flags: PageFlags,
    ) -> Result<(), Errno> {
        if va % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 {
            return Err(Errno::InvalidArg);
        }
        let attrs = leaf_attrs(flags) | desc::TYPE_PAGE;
        let linear = frames.linear();
        for offset in (0..size).step_by(PAGE_SIZE as usize) {
            let va = va + offset;
            let l2 = next_level(frames, self.root, index(va, L1_SHIFT))?;
            let l3 = next_level(frames, l2, index(va, L2_SHIFT))?;
            let slot = entry(linear, l3, index(va, L3_SHIFT));
            if read(slot) != 0 {
                continue;
            }
            write(slot, ((pa + offset) & desc::ADDR_MASK) | attrs);
        }
        Ok(())
    }

    /// Maps `[va, va + size)` with 2 MiB block descriptors.
    pub fn map_blocks<F: FrameSource>(
        &mut self,
        frames: &F,
        va: VirtAddr,
        pa: PhysAddr,
        size: u64,
        flags: PageFlags,
    ) -> Result<(), Errno> {
        if va % BLOCK_SIZE != 0 || pa % BLOCK_SIZE != 0 || size % BLOCK_SIZE != 0 {
            return Err(Errno::InvalidArg);
        }
        let attrs = leaf_attrs(flags) | desc::TYPE_BLOCK;
        let linear = frames.linear();
        for offset in (0..size).step_by(BLOCK_SIZE as usize) {
            let va = va + offset;
            let l2 = next_level(frames, self.root, index(va, L1_SHIFT))?;
            let slot = entry(linear, l2, index(va, L2_SHIFT));
            if read(slot) != 0 {
                continue;
            }
            write(slot, ((pa + offset) & desc::ADDR_MASK) | attrs);
        }
        Ok(())
    }

    /// Clears the leaves of `[va, va + size)`.
    ///
    /// Each cleared page is handed to `free` after its TLB entry is
    /// invalidated. A missing intermediate table is an error; an empty leaf
    /// is skipped.
    pub fn unmap<F, P>(
        &mut self,
        frames: &F,
        paging: &P,
        asid: Asid,
        va: VirtAddr,
        size: u64,
        mut free: impl FnMut(PhysAddr),
    ) -> Result<(), Errno>
    where
        F: FrameSource,
        P: PagingOps + ?Sized,
    {
        let linear = frames.linear();
        for offset in (0..size).step_by(PAGE_SIZE as usize) {
            let va = va + offset;
            let l1e = read(entry(linear, self.root, index(va, L1_SHIFT)));
            if l1e & desc::TYPE_MASK != desc::TYPE_TABLE {
                log::error!("page_table: unmap {:#x} without level-2 table", va);
                return Err(Errno::NotFound);
            }
            let l2e = read(entry(linear, l1e & desc::ADDR_MASK, index(va, L2_SHIFT)));
            if l2e & desc::TYPE_MASK != desc::TYPE_TABLE {
                log::error!("page_table: unmap {:#x} without level-3 table", va);
                return Err(Errno::NotFound);
            }
            let slot = entry(linear, l2e & desc::ADDR_MASK, index(va, L3_SHIFT));
            let leaf = read(slot);
            if leaf & desc::VALID == 0 {
                log::debug!("page_table: {:#x} not mapped", va);
                continue;
            }
            write(slot, 0);
            paging.flush_page(asid, va);
            free(leaf & desc::ADDR_MASK);
        }
        Ok(())
    }

    /// Physical page backing `va`.
    pub fn translate(&self, linear: LinearMap, va: VirtAddr) -> Option<PhysAddr> {
        self.leaf(linear, va).map(|leaf| leaf.pa)
    }

    /// Walks to the leaf mapping `va` without modifying the tree.
    pub fn leaf(&self, linear: LinearMap, va: VirtAddr) -> Option<Leaf> {
        let l1e = read(entry(linear, self.root, index(va, L1_SHIFT)));
        if l1e & desc::TYPE_MASK != desc::TYPE_TABLE {
            return None;
        }
        let l2e = read(entry(linear, l1e & desc::ADDR_MASK, index(va, L2_SHIFT)));
        match l2e & desc::TYPE_MASK {
            desc::TYPE_BLOCK => {
                let base = l2e & desc::ADDR_MASK & !(BLOCK_SIZE - 1);
                Some(Leaf {
                    pa: base + ((va & (BLOCK_SIZE - 1)) & !(PAGE_SIZE - 1)),
                    desc: l2e,
                })
            }
            desc::TYPE_TABLE => {
                let l3e = read(entry(linear, l2e & desc::ADDR_MASK, index(va, L3_SHIFT)));
                (l3e & desc::TYPE_MASK == desc::TYPE_PAGE).then_some(Leaf {
                    pa: l3e & desc::ADDR_MASK,
                    desc: l3e,
                })
            }
            _ => None,
        }
    }

    /// Frees every table page of the tree. Mapped pages are not touched.
    pub fn destroy<F: FrameSource>(self, frames: &F) {
        let linear = frames.linear();
        for i in 0..ENTRIES {
            let l1e = read(entry(linear, self.root, i));
            if l1e & desc::TYPE_MASK != desc::TYPE_TABLE {
                continue;
            }
            let l2 = l1e & desc::ADDR_MASK;
            for j in 0..ENTRIES {
                let l2e = read(entry(linear, l2, j));
                if l2e & desc::TYPE_MASK == desc::TYPE_TABLE {
                    frames.free_pages(l2e & desc::ADDR_MASK, 0);
                }
            }
            frames.free_pages(l2, 0);
        }
        frames.free_pages(self.root, 0);
    }
}

/// A physical range mapped into the kernel half.
#[derive(Debug, Clone, Copy)]
pub struct KernelRegion {
    pub base: PhysAddr,
    pub size: u64,
    pub flags: PageFlags,
}

/// Builds the kernel's block-mapped tables.
pub struct KernelMap<'a> {
    regions: &'a [KernelRegion],
}

impl<'a> KernelMap<'a> {
    pub const fn new(regions: &'a [KernelRegion]) -> Self {
        Self { regions }
    }

    /// Tree mapping every region at `offset + base`. Offset 0 gives the
    /// identity map, `PAGE_OFFSET` the linear map.
    pub fn build<F: FrameSource>(&self, frames: &F, offset: u64) -> Result<PageTable, Errno> {
        let mut table = PageTable::new(frames)?;
        for region in self.regions {
            table.map_blocks(
                frames,
                offset.wrapping_add(region.base),
                region.base,
                region.size,
                region.flags,
            )?;
        }
        Ok(table)
    }
}

fn entry(linear: LinearMap, table: PhysAddr, index: usize) -> *mut u64 {
    (linear.to_virt(table) as *mut u64).wrapping_add(index)
}

fn read(slot: *mut u64) -> u64 {
    // SAFETY: table pages stay mapped through the linear map while owned.
    unsafe { slot.read_volatile() }
}

fn write(slot: *mut u64, value: u64) {
    // SAFETY: see `read`.
    unsafe { slot.write_volatile(value) }
}

fn next_level<F: FrameSource>(frames: &F, table: PhysAddr, index: usize) -> Result<PhysAddr, Errno> {
    let slot = entry(frames.linear(), table, index);
    let value = read(slot);
    match value & desc::TYPE_MASK {
        desc::TYPE_TABLE => Ok(value & desc::ADDR_MASK),
        desc::TYPE_BLOCK => {
            log::error!("page_table: table walk hit a block descriptor");
            Err(Errno::InvalidArg)
        }
        _ => {
            let next = frames.alloc_zeroed(0).ok_or(Errno::NoMem)?;
            write(slot, (next & desc::ADDR_MASK) | desc::TYPE_TABLE | desc::AF);
            Ok(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_OFFSET;
    use crate::testing::{HostMemory, MachineEvent, MockMachine};
    use alloc::vec::Vec;

    const USER_RW: PageFlags = PageFlags::READ
        .union(PageFlags::WRITE)
        .union(PageFlags::USER);

    #[test]
    fn map_translate_unmap_round_trip() {
        let mem = HostMemory::new(16);
        let machine = MockMachine::new();
        let mut table = PageTable::new(&mem.pool).expect("root should allocate");
        table
            .map(&mem.pool, 0x40_0000, 0x8000_0000, 2 * PAGE_SIZE, USER_RW)
            .expect("map should succeed");
        let linear = LinearMap::identity();
        assert_eq!(table.translate(linear, 0x40_0000), Some(0x8000_0000));
        assert_eq!(table.translate(linear, 0x40_1abc), Some(0x8000_1000));
        assert_eq!(table.translate(linear, 0x40_2000), None);

        let mut freed = Vec::new();
        table
            .unmap(&mem.pool, &machine, 7, 0x40_0000, 2 * PAGE_SIZE, |pa| freed.push(pa))
            .expect("unmap should succeed");
        assert_eq!(freed, [0x8000_0000, 0x8000_1000]);
        assert_eq!(table.translate(linear, 0x40_0000), None);
        assert_eq!(
            machine.events(),
            [MachineEvent::FlushPage(7, 0x40_0000), MachineEvent::FlushPage(7, 0x40_1000)]
        );
        table.destroy(&mem.pool);
        assert_eq!(mem.pool.free_count(), 16);
    }

    #[test]
    fn first_mapping_wins() {
        let mem = HostMemory::new(8);
        let mut table = PageTable::new(&mem.pool).expect("root should allocate");
        table.map(&mem.pool, 0x1000, 0xA000, PAGE_SIZE, USER_RW).expect("map should succeed");
        table.map(&mem.pool, 0x1000, 0xB000, PAGE_SIZE, USER_RW).expect("map should succeed");
        assert_eq!(table.translate(mem.pool.linear(), 0x1000), Some(0xA000));
        table.destroy(&mem.pool);
    }

    #[test]
    fn unmap_without_tables_is_not_found() {
        let mem = HostMemory::new(4);
        let machine = MockMachine::new();
        let mut table = PageTable::new(&mem.pool).expect("root should allocate");
        let result = table.unmap(&mem.pool, &machine, 1, 0x5000_0000, PAGE_SIZE, |_| {});
        assert_eq!(result, Err(Errno::NotFound));
        table.destroy(&mem.pool);
    }

    #[test]
    fn unmap_skips_empty_leaves() {
        let mem = HostMemory::new(8);
        let machine = MockMachine::new();
        let mut table = PageTable::new(&mem.pool).expect("root should allocate");
        table.map(&mem.pool, 0x2000, 0xC000, PAGE_SIZE, USER_RW).expect("map should succeed");
        let mut freed = Vec::new();
        table
            .unmap(&mem.pool, &machine, 1, 0x1000, 3 * PAGE_SIZE, |pa| freed.push(pa))
            .expect("unmap should succeed");
        assert_eq!(freed, [0xC000]);
        table.destroy(&mem.pool);
    }

    #[test]
    fn map_fails_cleanly_without_table_pages() {
        let mem = HostMemory::new(2);
        let mut table = PageTable::new(&mem.pool).expect("root should allocate");
        let _hog = mem.pool.alloc_pages(0).expect("alloc should succeed");
        assert_eq!(
            table.map(&mem.pool, 0x1000, 0xA000, PAGE_SIZE, USER_RW),
            Err(Errno::NoMem)
        );
    }

    #[test]
    fn destroy_frees_only_tables() {
        let mem = HostMemory::new(16);
        let data = mem.pool.alloc_pages(1).expect("alloc should succeed");
        let mut table = PageTable::new(&mem.pool).expect("root should allocate");
        table.map(&mem.pool, 0x1000, data, 2 * PAGE_SIZE, USER_RW).expect("map should succeed");
        table.map(&mem.pool, 0x4000_0000, data, PAGE_SIZE, USER_RW).expect("map should succeed");
        // root + (L2, L3) for each of the two 1 GiB regions
        assert_eq!(mem.pool.free_count(), 16 - 2 - 5);
        table.destroy(&mem.pool);
        assert_eq!(mem.pool.free_count(), 14);
    }

    #[test]
    fn user_attributes() {
        let rw = leaf_attrs(USER_RW);
        assert_ne!(rw & desc::USER, 0);
        assert_ne!(rw & desc::NG, 0);
        assert_ne!(rw & desc::PXN, 0);
        assert_ne!(rw & desc::UXN, 0);
        assert_eq!(rw & desc::RDONLY, 0);
        assert_eq!(rw & (7 << 2), desc::memtype(desc::MT_NORMAL));

        let text = leaf_attrs(PageFlags::READ | PageFlags::EXECUTE | PageFlags::USER);
        assert_ne!(text & desc::RDONLY, 0);
        assert_eq!(text & desc::UXN, 0);
        assert_ne!(text & desc::PXN, 0);
    }

    #[test]
    fn device_attributes() {
        let dev = leaf_attrs(PageFlags::READ | PageFlags::WRITE | PageFlags::DEVICE | PageFlags::GLOBAL);
        assert_eq!(dev & (7 << 2), desc::memtype(desc::MT_DEVICE_NGNRNE));
        assert_ne!(dev & desc::PXN, 0);
        assert_ne!(dev & desc::UXN, 0);
        assert_eq!(dev & desc::NG, 0);
    }

    #[test]
    fn kernel_map_translates_block_offsets() {
        let mem = HostMemory::new(8);
        let regions = [
            KernelRegion {
                base: 0,
                size: 512 * BLOCK_SIZE,
                flags: PageFlags::READ | PageFlags::WRITE | PageFlags::DEVICE | PageFlags::GLOBAL,
            },
            KernelRegion {
                base: 0x4000_0000,
                size: 2 * BLOCK_SIZE,
                flags: PageFlags::READ | PageFlags::WRITE | PageFlags::EXECUTE | PageFlags::GLOBAL,
            },
        ];
        let table = KernelMap::new(&regions)
            .build(&mem.pool, PAGE_OFFSET)
            .expect("kernel map should build");
        let linear = mem.pool.linear();
        assert_eq!(
            table.translate(linear, PAGE_OFFSET + 0x4020_1234),
            Some(0x4020_1000)
        );
        assert_eq!(table.translate(linear, PAGE_OFFSET + 0x0900_0000), Some(0x0900_0000));
        assert_eq!(table.translate(linear, PAGE_OFFSET + 0x4040_0000), None);
        let leaf = table.leaf(linear, PAGE_OFFSET + 0x4000_0000).expect("leaf should exist");
        assert_eq!(leaf.desc & desc::TYPE_MASK, desc::TYPE_BLOCK);
        table.destroy(&mem.pool);
        assert_eq!(mem.pool.free_count(), 8);
    }

    #[test]
    fn misaligned_block_map_is_rejected() {
        let mem = HostMemory::new(4);
        let mut table = PageTable::new(&mem.pool).expect("root should allocate");
        assert_eq!(
            table.map_blocks(&mem.pool, 0x1000, 0, BLOCK_SIZE, PageFlags::READ),
            Err(Errno::InvalidArg)
        );
    }
}
