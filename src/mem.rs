use crate::{
    param::PGSIZE,
    proc::KernelError,
    sync::SpinMutex,
};
use bitflags::bitflags;
use std::{collections::BTreeMap, sync::Arc};

bitflags! {
    /// Page permission bits.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct PteFlags: u32 {
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        /// User-accessible. Guard pages are mapped without it.
        const U = 1 << 4;
    }
}

/// The page-table handle every thread of one process shares.
pub type Pagetable = Arc<SpinMutex<AddressSpace>>;

pub fn pg_round_up(addr: usize) -> usize {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}

pub fn pg_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

struct Page {
    flags: PteFlags,
    data: Box<[u8]>,
}

impl Page {
    fn new(flags: PteFlags) -> Page {
        Page {
            flags,
            data: vec![0u8; PGSIZE].into_boxed_slice(),
        }
    }
}

/// One user address space: page-aligned mappings of zero-filled pages.
///
/// The allocation policy above this (who grows, who reclaims) lives in the
/// process layer; this type only maps, unmaps, copies and moves bytes.
pub struct AddressSpace {
    pages: BTreeMap<usize, Page>,
}

impl AddressSpace {
    pub fn new() -> AddressSpace {
        AddressSpace {
            pages: BTreeMap::new(),
        }
    }

    /// Grow from `old_size` to `new_size`, mapping fresh pages with `flags`.
    /// Returns `new_size`. No-op when `new_size <= old_size`.
    pub fn alloc_uvm(
        &mut self,
        old_size: usize,
        new_size: usize,
        flags: PteFlags,
    ) -> Result<usize, KernelError> {
        if new_size <= old_size {
            return Ok(old_size);
        }

        let mut va = pg_round_up(old_size);
        while va < new_size {
            if self.pages.contains_key(&va) {
                // Walked into an existing mapping; undo what we added.
                self.dealloc_uvm(va, pg_round_up(old_size));
                return Err(KernelError::NoMemory);
            }
            self.pages.insert(va, Page::new(flags | PteFlags::R));
            va += PGSIZE;
        }
        Ok(new_size)
    }

    /// Shrink from `old_size` to `new_size`, unmapping the pages in between.
    /// Returns `new_size`.
    pub fn dealloc_uvm(&mut self, old_size: usize, new_size: usize) -> usize {
        if new_size >= old_size {
            return old_size;
        }

        let mut va = pg_round_up(new_size);
        while va < pg_round_up(old_size) {
            self.pages.remove(&va);
            va += PGSIZE;
        }
        new_size
    }

    /// Mark the page at `va` inaccessible to user copies. Used for the guard
    /// page below a thread stack.
    pub fn uvm_clear(&mut self, va: usize) {
        let page = self
            .pages
            .get_mut(&pg_round_down(va))
            .expect("uvm_clear");
        page.flags.remove(PteFlags::U);
    }

    /// Deep-copy every mapping below `size` into a new address space,
    /// preserving flags and contents.
    pub fn copy_uvm(&self, size: usize) -> AddressSpace {
        let mut new = AddressSpace::new();
        for (&va, page) in self.pages.range(..pg_round_up(size)) {
            let mut copy = Page::new(page.flags);
            copy.data.copy_from_slice(&page.data);
            new.pages.insert(va, copy);
        }
        new
    }

    pub fn is_mapped(&self, va: usize) -> bool {
        self.pages.contains_key(&pg_round_down(va))
    }

    pub fn flags_of(&self, va: usize) -> Option<PteFlags> {
        self.pages.get(&pg_round_down(va)).map(|p| p.flags)
    }

    fn user_page(&self, va: usize) -> Result<&Page, KernelError> {
        let page = self
            .pages
            .get(&pg_round_down(va))
            .ok_or(KernelError::BadArg)?;
        if !page.flags.contains(PteFlags::U) {
            return Err(KernelError::BadArg);
        }
        Ok(page)
    }

    /// Copy bytes from kernel into user memory.
    pub fn copyout(&mut self, mut va: usize, mut src: &[u8]) -> Result<(), KernelError> {
        while !src.is_empty() {
            self.user_page(va)?;
            let off = va - pg_round_down(va);
            let n = (PGSIZE - off).min(src.len());
            let page = self.pages.get_mut(&pg_round_down(va)).unwrap();
            page.data[off..off + n].copy_from_slice(&src[..n]);
            va += n;
            src = &src[n..];
        }
        Ok(())
    }

    /// Copy bytes from user memory into the kernel.
    pub fn copyin(&self, mut va: usize, mut dst: &mut [u8]) -> Result<(), KernelError> {
        while !dst.is_empty() {
            let page = self.user_page(va)?;
            let off = va - pg_round_down(va);
            let n = (PGSIZE - off).min(dst.len());
            dst[..n].copy_from_slice(&page.data[off..off + n]);
            va += n;
            dst = &mut dst[n..];
        }
        Ok(())
    }

    pub fn write_word(&mut self, va: usize, value: u64) -> Result<(), KernelError> {
        self.copyout(va, &value.to_le_bytes())
    }

    pub fn read_word(&self, va: usize) -> Result<u64, KernelError> {
        let mut buf = [0u8; 8];
        self.copyin(va, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl Default for AddressSpace {
    fn default() -> AddressSpace {
        AddressSpace::new()
    }
}
