//! Page queries, scoped write access and typed slot reads/writes.

use std::{ffi::c_void, mem, ptr};

use winapi::um::{
    memoryapi::{VirtualProtect, VirtualQuery},
    winnt::{
        MEM_COMMIT, MEM_FREE, MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE,
        PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD,
        PAGE_NOACCESS, PAGE_NOCACHE, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOMBINE,
        PAGE_WRITECOPY,
    },
};

#[inline]
pub fn page_class(p: u32) -> u32 {
    p & 0xFF
}

#[inline]
pub fn is_writable_class(base_prot: u32) -> bool {
    matches!(
        base_prot,
        PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY
    )
}

pub fn query(addr: usize) -> Option<MEMORY_BASIC_INFORMATION> {
    let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
    let got = unsafe { VirtualQuery(addr as *const c_void, &mut mbi, mem::size_of_val(&mbi)) };
    (got == mem::size_of::<MEMORY_BASIC_INFORMATION>()).then_some(mbi)
}

pub fn is_committed(addr: usize) -> bool {
    addr != 0 && query(addr).is_some_and(|mbi| mbi.State == MEM_COMMIT)
}

pub fn is_readable(addr: usize) -> bool {
    if addr == 0 {
        return false;
    }
    let Some(mbi) = query(addr) else { return false };
    if mbi.State != MEM_COMMIT {
        return false;
    }
    let p = page_class(mbi.Protect);
    p == PAGE_READWRITE ||
        p == PAGE_READONLY ||
        p == PAGE_WRITECOPY ||
        p == PAGE_EXECUTE_READ ||
        p == PAGE_EXECUTE_READWRITE ||
        p == PAGE_EXECUTE_WRITECOPY
}

/// The protection to request for a region we are about to write: keep the
/// page plain read-write, stripping modifier bits that cannot combine.
pub fn writable_protection(current: u32) -> u32 {
    (current & !(PAGE_GUARD | PAGE_NOCACHE | PAGE_WRITECOMBINE)) | PAGE_READWRITE
}

/// RAII `VirtualProtect`: grants write access on construction when the page
/// is not already writable, restores the previous protection on drop.
/// Writes must not proceed unless `ok()` holds.
pub struct PageGuard {
    base: *mut c_void,
    size: usize,
    old: u32,
    changed: bool,
    ok: bool,
}

impl PageGuard {
    pub fn new(base: *mut c_void, size: usize, want: u32) -> Self {
        let mut guard = Self { base, size, old: 0, changed: false, ok: false };

        let Some(mbi) = query(base as usize) else { return guard };
        if is_writable_class(page_class(mbi.Protect)) && is_writable_class(page_class(want)) {
            guard.ok = true;
            return guard;
        }

        let granted = unsafe {
            VirtualProtect(mbi.BaseAddress, mbi.RegionSize, want, &mut guard.old) != 0
        };
        if granted {
            guard.ok = true;
            guard.changed = true;
        }
        guard
    }

    #[inline]
    pub fn ok(&self) -> bool {
        self.ok
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if self.ok && self.changed {
            let mut tmp = 0;
            unsafe {
                VirtualProtect(self.base, self.size, self.old, &mut tmp);
            }
        }
    }
}

#[inline]
pub unsafe fn read_slot(slot: usize) -> usize {
    unsafe { ptr::read_volatile(slot as *const usize) }
}

#[inline]
pub unsafe fn write_slot(slot: usize, value: usize) {
    unsafe { ptr::write_volatile(slot as *mut usize, value) }
}

pub fn protect_name(p: u32) -> &'static str {
    match page_class(p) {
        PAGE_NOACCESS => "NOACCESS",
        PAGE_READONLY => "READONLY",
        PAGE_READWRITE => "READWRITE",
        PAGE_WRITECOPY => "WRITECOPY",
        PAGE_EXECUTE => "EXECUTE",
        PAGE_EXECUTE_READ => "EXECUTE_READ",
        PAGE_EXECUTE_READWRITE => "EXECUTE_READWRITE",
        PAGE_EXECUTE_WRITECOPY => "EXECUTE_WRITECOPY",
        _ => "UNKNOWN",
    }
}

pub fn state_name(s: u32) -> &'static str {
    match s {
        MEM_COMMIT => "COMMIT",
        MEM_RESERVE => "RESERVE",
        MEM_FREE => "FREE",
        _ => "UNKNOWN",
    }
}
