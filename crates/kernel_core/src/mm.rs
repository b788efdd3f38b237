//! User address spaces: VMAs, their backing pages, and the page table that
//! maps them.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use bitflags::bitflags;
use hal::{align_down, align_up, Asid, Errno, PageFlags, PagingOps, PhysAddr, VirtAddr, PAGE_SIZE};

use crate::config::MAX_BRK_ADDR;
use crate::page_table::PageTable;
use crate::pmm::{order_for, FrameSource};
use crate::protection::validate_user_buffer;

bitflags! {
    /// Access rights and sharing of a VMA.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Backing is shared with the parent on fork.
        const SHARED = 1 << 3;
        /// Device memory.
        const IO = 1 << 4;
    }
}

impl VmFlags {
    /// Leaf flags for pages of a user VMA.
    pub fn page_flags(self) -> PageFlags {
        let mut flags = PageFlags::USER;
        if self.contains(VmFlags::READ) {
            flags |= PageFlags::READ;
        }
        if self.contains(VmFlags::WRITE) {
            flags |= PageFlags::WRITE;
        }
        if self.contains(VmFlags::EXEC) {
            flags |= PageFlags::EXECUTE;
        }
        if self.contains(VmFlags::IO) {
            flags |= PageFlags::DEVICE;
        }
        flags
    }
}

/// Where the pages of a VMA come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Fixed physical range starting at the given address.
    Linear(PhysAddr),
    /// Pages allocated on demand and recorded as pages blocks.
    Blocks,
}

/// One physical run backing `[user_va, user_va + (PAGE_SIZE << order))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagesBlock {
    pub user_va: VirtAddr,
    pub phys: PhysAddr,
    pub order: u32,
}

impl PagesBlock {
    pub const fn len(&self) -> u64 {
        PAGE_SIZE << self.order
    }

    pub const fn end(&self) -> VirtAddr {
        self.user_va + self.len()
    }
}

/// A contiguous user range with uniform rights.
#[derive(Debug, PartialEq, Eq)]
pub struct Vma {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub flags: VmFlags,
    pub backing: Backing,
    blocks: Vec<PagesBlock>,
}

impl Vma {
    fn new(start: VirtAddr, end: VirtAddr, flags: VmFlags, backing: Backing) -> Self {
        Self {
            start,
            end,
            flags,
            backing,
            blocks: Vec::new(),
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn blocks(&self) -> &[PagesBlock] {
        &self.blocks
    }

    /// Records a run now owned by this VMA.
    pub fn add_pages_block(&mut self, user_va: VirtAddr, phys: PhysAddr, order: u32) -> Result<(), Errno> {
        self.blocks.try_reserve(1).map_err(|_| Errno::NoMem)?;
        self.blocks.push(PagesBlock {
            user_va,
            phys,
            order,
        });
        Ok(())
    }

    /// Removes and returns the blocks lying entirely inside `[start, end)`.
    pub fn take_blocks_in(&mut self, start: VirtAddr, end: VirtAddr) -> Vec<PagesBlock> {
        let mut taken = Vec::new();
        self.blocks.retain(|block| {
            let inside = block.user_va >= start && block.end() <= end;
            if inside {
                taken.push(*block);
            }
            !inside
        });
        taken
    }

    fn free_blocks<F: FrameSource>(&mut self, frames: &F) {
        for block in self.blocks.drain(..) {
            frames.free_pages(block.phys, block.order);
        }
    }
}

/// The VMAs of one task plus its program break.
#[derive(Debug, Default)]
pub struct AddressSpace {
    vmas: VecDeque<Vma>,
    pub start_brk: VirtAddr,
    pub brk: VirtAddr,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `[start, end)` at the head of the VMA list.
    pub fn create_vma(
        &mut self,
        start: VirtAddr,
        end: VirtAddr,
        flags: VmFlags,
        backing: Backing,
    ) -> Result<&mut Vma, Errno> {
        if start >= end || start % PAGE_SIZE != 0 || end % PAGE_SIZE != 0 {
            return Err(Errno::InvalidArg);
        }
        if self.overlaps(start, end, None) {
            log::warn!("mm: vma {:#x}..{:#x} overlaps", start, end);
            return Err(Errno::InvalidArg);
        }
        self.vmas.try_reserve(1).map_err(|_| Errno::NoMem)?;
        log::debug!("mm: vma {:#x}..{:#x} {:?}", start, end, flags);
        self.vmas.push_front(Vma::new(start, end, flags, backing));
        self.vmas.front_mut().ok_or(Errno::NoMem)
    }

    pub fn find_vma(&self, addr: VirtAddr) -> Option<&Vma> {
        self.vmas.iter().find(|vma| vma.contains(addr))
    }

    pub fn find_vma_mut(&mut self, addr: VirtAddr) -> Option<&mut Vma> {
        self.vmas.iter_mut().find(|vma| vma.contains(addr))
    }

    /// VMAs, most recently created first.
    pub fn vmas(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.iter()
    }

    /// The VMA holding the program break, if one was created.
    pub fn heap_vma_mut(&mut self) -> Option<&mut Vma> {
        let start = self.start_brk;
        self.vmas.iter_mut().find(|vma| vma.start == start)
    }

    /// Frees the pages blocks of every private VMA and drops all VMAs.
    pub fn release<F: FrameSource>(&mut self, frames: &F) {
        for mut vma in self.vmas.drain(..) {
            if !vma.flags.contains(VmFlags::SHARED) {
                vma.free_blocks(frames);
            }
        }
    }

    fn overlaps(&self, start: VirtAddr, end: VirtAddr, skip: Option<VirtAddr>) -> bool {
        self.vmas
            .iter()
            .filter(|vma| Some(vma.start) != skip && !vma.is_empty())
            .any(|vma| vma.start < end && start < vma.end)
    }
}

/// An address space together with the page table mapping it.
#[derive(Debug)]
pub struct UserSpace {
    pub mm: AddressSpace,
    table: PageTable,
}

impl UserSpace {
    pub fn new<F: FrameSource>(frames: &F) -> Result<Self, Errno> {
        Ok(Self {
            mm: AddressSpace::new(),
            table: PageTable::new(frames)?,
        })
    }

    pub fn root(&self) -> PhysAddr {
        self.table.root()
    }

    pub fn table(&self) -> &PageTable {
        &self.table
    }

    /// Maps every VMA's existing pages.
    pub fn populate<F: FrameSource>(&mut self, frames: &F) -> Result<(), Errno> {
        for vma in &self.mm.vmas {
            map_vma(&mut self.table, frames, vma)?;
        }
        Ok(())
    }

    /// Resolves a missing translation at `addr`.
    ///
    /// Linear VMAs map their fixed page; block VMAs get a fresh zeroed page
    /// recorded as a pages block. A present translation means the access
    /// violated the page's rights.
    pub fn fault_in<F: FrameSource>(&mut self, frames: &F, addr: VirtAddr) -> Result<PhysAddr, Errno> {
        let page = align_down(addr, PAGE_SIZE);
        if self.table.leaf(frames.linear(), page).is_some() {
            return Err(Errno::NoPerm);
        }
        let vma = self
            .mm
            .vmas
            .iter_mut()
            .find(|vma| vma.contains(addr))
            .ok_or(Errno::Fault)?;
        let flags = vma.flags.page_flags();
        match vma.backing {
            Backing::Linear(phys) => {
                let pa = phys + (page - vma.start);
                self.table.map(frames, page, pa, PAGE_SIZE, flags)?;
                Ok(pa)
            }
            Backing::Blocks => {
                vma.blocks.try_reserve(1).map_err(|_| Errno::NoMem)?;
                let pa = frames.alloc_zeroed(0).ok_or(Errno::NoMem)?;
                if let Err(err) = self.table.map(frames, page, pa, PAGE_SIZE, flags) {
                    frames.free_pages(pa, 0);
                    return Err(err);
                }
                vma.add_pages_block(page, pa, 0)?;
                log::debug!("mm: fault {:#x} -> {:#x}", page, pa);
                Ok(pa)
            }
        }
    }

    /// Copies `src` to user address `dst`, faulting in missing pages.
    pub fn copy_to_user<F: FrameSource>(&mut self, frames: &F, dst: VirtAddr, src: &[u8]) -> Result<(), Errno> {
        if src.is_empty() {
            return Ok(());
        }
        validate_user_buffer(dst, src.len() as u64)?;
        let mut done = 0;
        while done < src.len() {
            let va = dst + done as u64;
            let pa = self.user_page(frames, va, true)?;
            let chunk = ((PAGE_SIZE - va % PAGE_SIZE) as usize).min(src.len() - done);
            let to = frames.page_ptr(pa).wrapping_add((va % PAGE_SIZE) as usize);
            // SAFETY: `pa` is a mapped user page reachable through the linear map.
            unsafe { core::ptr::copy_nonoverlapping(src[done..].as_ptr(), to, chunk) };
            done += chunk;
        }
        Ok(())
    }

    /// Copies user memory at `src` into `dst`, faulting in missing pages.
    pub fn copy_from_user<F: FrameSource>(&mut self, frames: &F, dst: &mut [u8], src: VirtAddr) -> Result<(), Errno> {
        if dst.is_empty() {
            return Ok(());
        }
        validate_user_buffer(src, dst.len() as u64)?;
        let mut done = 0;
        while done < dst.len() {
            let va = src + done as u64;
            let pa = self.user_page(frames, va, false)?;
            let chunk = ((PAGE_SIZE - va % PAGE_SIZE) as usize).min(dst.len() - done);
            let from = frames.page_ptr(pa).wrapping_add((va % PAGE_SIZE) as usize);
            // SAFETY: see `copy_to_user`.
            unsafe { core::ptr::copy_nonoverlapping(from, dst[done..].as_mut_ptr(), chunk) };
            done += chunk;
        }
        Ok(())
    }

    fn user_page<F: FrameSource>(&mut self, frames: &F, va: VirtAddr, write: bool) -> Result<PhysAddr, Errno> {
        let vma = self.mm.find_vma(va).ok_or(Errno::Fault)?;
        if write && !vma.flags.contains(VmFlags::WRITE) {
            return Err(Errno::Fault);
        }
        match self.table.leaf(frames.linear(), va) {
            Some(leaf) => Ok(leaf.pa),
            None => self.fault_in(frames, va).map_err(|_| Errno::Fault),
        }
    }

    /// Moves the program break to `addr` and returns the resulting break.
    ///
    /// Out-of-range requests, including the `0` query, leave the break
    /// unchanged. Shrinking frees the pages blocks that lie wholly above the
    /// new break. Every call leaves the heap VMA covering
    /// `[start_brk, brk)` rounded up to a page.
    pub fn set_brk<F, P>(&mut self, frames: &F, paging: &P, asid: Asid, addr: VirtAddr) -> VirtAddr
    where
        F: FrameSource,
        P: PagingOps + ?Sized,
    {
        if addr != 0 && addr >= self.mm.start_brk && addr <= MAX_BRK_ADDR {
            self.move_brk(frames, paging, asid, addr);
        }
        self.sync_heap_vma();
        self.mm.brk
    }

    fn move_brk<F, P>(&mut self, frames: &F, paging: &P, asid: Asid, addr: VirtAddr)
    where
        F: FrameSource,
        P: PagingOps + ?Sized,
    {
        let new_end = align_up(addr, PAGE_SIZE);
        let old_end = align_up(self.mm.brk, PAGE_SIZE);
        if new_end > old_end
            && self.mm.overlaps(old_end.max(self.mm.start_brk), new_end, Some(self.mm.start_brk))
        {
            log::warn!("mm: brk {:#x} runs into another vma", addr);
            return;
        }
        if new_end < old_end {
            if let Some(heap) = self.mm.heap_vma_mut() {
                let released = heap.take_blocks_in(new_end, old_end);
                for block in released {
                    if let Err(err) = self.table.unmap(frames, paging, asid, block.user_va, block.len(), |_| {}) {
                        log::warn!("mm: brk unmap {:#x}: {:?}", block.user_va, err);
                    }
                    frames.free_pages(block.phys, block.order);
                }
            }
        }
        self.mm.brk = addr;
    }

    fn sync_heap_vma(&mut self) {
        let start = self.mm.start_brk;
        let end = align_up(self.mm.brk, PAGE_SIZE).max(start);
        match self.mm.heap_vma_mut() {
            Some(heap) => heap.end = end,
            None if end > start => {
                log::debug!("mm: creating brk vma {:#x}..{:#x}", start, end);
                if let Err(err) = self.mm.create_vma(start, end, VmFlags::READ | VmFlags::WRITE, Backing::Blocks) {
                    log::warn!("mm: brk vma {:#x}..{:#x}: {:?}", start, end, err);
                }
            }
            None => {}
        }
    }

    /// Builds an independent copy for a forked child.
    ///
    /// Shared VMAs keep their backing; private linear VMAs and every pages
    /// block are copied into fresh pages. On failure everything allocated
    /// for the child is released.
    pub fn duplicate<F: FrameSource>(&self, frames: &F) -> Result<UserSpace, Errno> {
        let mut child = UserSpace::new(frames)?;
        match self.fill_child(frames, &mut child) {
            Ok(()) => Ok(child),
            Err(err) => {
                child.release(frames);
                Err(err)
            }
        }
    }

    fn fill_child<F: FrameSource>(&self, frames: &F, child: &mut UserSpace) -> Result<(), Errno> {
        for vma in self.mm.vmas.iter().rev() {
            child.mm.vmas.try_reserve(1).map_err(|_| Errno::NoMem)?;
            let copy = duplicate_vma(frames, vma)?;
            child.mm.vmas.push_front(copy);
        }
        child.mm.start_brk = self.mm.start_brk;
        child.mm.brk = self.mm.brk;
        child.populate(frames)
    }

    /// Releases VMAs and their pages, then the page table.
    pub fn release<F: FrameSource>(mut self, frames: &F) {
        self.mm.release(frames);
        self.table.destroy(frames);
    }
}

fn map_vma<F: FrameSource>(table: &mut PageTable, frames: &F, vma: &Vma) -> Result<(), Errno> {
    let flags = vma.flags.page_flags();
    match vma.backing {
        Backing::Linear(phys) => table.map(frames, vma.start, phys, vma.len(), flags),
        Backing::Blocks => vma
            .blocks
            .iter()
            .try_for_each(|block| table.map(frames, block.user_va, block.phys, block.len(), flags)),
    }
}

fn duplicate_vma<F: FrameSource>(frames: &F, vma: &Vma) -> Result<Vma, Errno> {
    if vma.flags.contains(VmFlags::SHARED) {
        return Ok(Vma::new(vma.start, vma.end, vma.flags, vma.backing));
    }
    match vma.backing {
        Backing::Linear(phys) => {
            let order = order_for(vma.len());
            let copy = frames.alloc_pages(order).ok_or(Errno::NoMem)?;
            copy_pages(frames, copy, phys, vma.len());
            let mut out = Vma::new(vma.start, vma.end, vma.flags, Backing::Linear(copy));
            if let Err(err) = out.add_pages_block(vma.start, copy, order) {
                frames.free_pages(copy, order);
                return Err(err);
            }
            Ok(out)
        }
        Backing::Blocks => {
            let mut out = Vma::new(vma.start, vma.end, vma.flags, Backing::Blocks);
            if out.blocks.try_reserve(vma.blocks.len()).is_err() {
                return Err(Errno::NoMem);
            }
            for block in &vma.blocks {
                let Some(copy) = frames.alloc_pages(block.order) else {
                    out.free_blocks(frames);
                    return Err(Errno::NoMem);
                };
                copy_pages(frames, copy, block.phys, block.len());
                out.blocks.push(PagesBlock {
                    user_va: block.user_va,
                    phys: copy,
                    order: block.order,
                });
            }
            Ok(out)
        }
    }
}

fn copy_pages<F: FrameSource>(frames: &F, dst: PhysAddr, src: PhysAddr, len: u64) {
    // SAFETY: both runs are owned pages reachable through the linear map and
    // `dst` was just allocated, so they cannot overlap.
    unsafe {
        core::ptr::copy_nonoverlapping(frames.page_ptr(src), frames.page_ptr(dst), len as usize);
    }
}
