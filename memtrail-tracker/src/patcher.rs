// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dynamic-linker surgery. For every loaded ELF object we walk the dynamic
//! relocation tables (`DT_REL`, `DT_RELA` and the PLT's `DT_JMPREL`), and
//! every relocation whose symbol names a hooked allocator entry point gets
//! the resolved pointer overwritten: with our interceptor on install, with
//! the saved original on restore.
//!
//! Other threads keep calling allocators while this runs. That is safe
//! because each patch is a single aligned pointer-sized store.

use std::collections::HashSet;
use std::ffi::{c_int, c_void, CStr};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use nix::sys::mman::{mprotect, ProtFlags};

use crate::hooks::{hook_table, own_module_path};

const DT_NULL: i64 = 0;
const DT_PLTRELSZ: i64 = 2;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_RELA: i64 = 7;
const DT_RELASZ: i64 = 8;
const DT_REL: i64 = 17;
const DT_RELSZ: i64 = 18;
const DT_PLTREL: i64 = 20;
const DT_JMPREL: i64 = 23;

#[repr(C)]
struct ElfDyn {
    d_tag: i64,
    d_val: u64,
}

#[repr(C)]
struct ElfRel {
    r_offset: u64,
    r_info: u64,
}

#[repr(C)]
struct ElfRela {
    r_offset: u64,
    r_info: u64,
    #[allow(dead_code)]
    r_addend: i64,
}

#[repr(C)]
#[allow(dead_code)]
struct ElfSym {
    st_name: u32,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
    st_value: u64,
    st_size: u64,
}

#[inline]
fn elf_r_sym(r_info: u64) -> usize {
    (r_info >> 32) as usize
}

/// Some libc versions relocate the `d_ptr` entries of `PT_DYNAMIC` to
/// absolute addresses at load time, others leave them as file-relative
/// offsets. Detected once, from the first object with a non-zero load
/// address, and cached for the process.
fn relocated_dyn_ptr(base: u64, value: u64) -> u64 {
    if base == 0 {
        return value;
    }
    static NEEDS_BASE_ADDEND: OnceLock<bool> = OnceLock::new();
    if *NEEDS_BASE_ADDEND.get_or_init(|| value < base) {
        base.wrapping_add(value)
    } else {
        value
    }
}

struct SymbolTable {
    strtab: *const u8,
    symtab: *const ElfSym,
}

impl SymbolTable {
    /// SAFETY: `dynamic` must point at the live, NULL-terminated dynamic
    /// section of a loaded object with load address `base`.
    unsafe fn new(base: u64, dynamic: *const ElfDyn) -> Option<Self> {
        let strtab = dynamic_entry(dynamic, DT_STRTAB)?;
        let symtab = dynamic_entry(dynamic, DT_SYMTAB)?;
        Some(Self {
            strtab: relocated_dyn_ptr(base, strtab) as *const u8,
            symtab: relocated_dyn_ptr(base, symtab) as *const ElfSym,
        })
    }

    /// SAFETY: `index` must be a symbol index taken from a relocation of
    /// the same object.
    unsafe fn symbol_name(&self, index: usize) -> &CStr {
        let symbol = &*self.symtab.add(index);
        CStr::from_ptr(self.strtab.add(symbol.st_name as usize) as *const i8)
    }
}

/// SAFETY: as for [`SymbolTable::new`].
unsafe fn dynamic_entry(dynamic: *const ElfDyn, tag: i64) -> Option<u64> {
    let mut entry = dynamic;
    while (*entry).d_tag != DT_NULL {
        if (*entry).d_tag == tag {
            return Some((*entry).d_val);
        }
        entry = entry.add(1);
    }
    None
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum PatchMode {
    Install,
    Restore,
}

/// Makes the page holding `addr` writable and stores `value` there. The
/// store is a relaxed atomic on an aligned word, so concurrent callers of
/// the patched function observe either the old or the new pointer, never a
/// mix.
unsafe fn patch_address(symbol: &CStr, addr: u64, value: usize) {
    let page_len = page_size::get();
    let page = (addr as usize) & !(page_len - 1);
    let Some(page_ptr) = NonNull::new(page as *mut c_void) else {
        return;
    };
    if let Err(errno) = mprotect(
        page_ptr,
        page_len,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
    ) {
        // Losing one symbol beats crashing the host program.
        log::warn!(
            "could not make page for symbol {} writable: {errno}",
            symbol.to_string_lossy()
        );
        return;
    }
    (*(addr as *const AtomicUsize)).store(value, Ordering::Relaxed);
    log::debug!("{} intercepted", symbol.to_string_lossy());
}

/// SAFETY: `table`/`count` must describe a live relocation table of the
/// object whose symbols and load address are given.
unsafe fn overwrite_relocations<E>(
    table: *const E,
    count: usize,
    entry_info: impl Fn(&E) -> (u64, u64),
    symbols: &SymbolTable,
    base: u64,
    mode: PatchMode,
) {
    for i in 0..count {
        let (r_offset, r_info) = entry_info(&*table.add(i));
        let name = symbols.symbol_name(elf_r_sym(r_info));
        if name.to_bytes().is_empty() {
            continue;
        }
        for hooked in hook_table() {
            if hooked.symbol == name {
                let replacement = match mode {
                    PatchMode::Install => hooked.interceptor,
                    PatchMode::Restore => hooked.hook.original_ptr() as usize,
                };
                if replacement != 0 {
                    patch_address(name, base.wrapping_add(r_offset), replacement);
                }
                break;
            }
        }
    }
}

/// SAFETY: `dynamic` must be the live dynamic section of the object loaded
/// at `base`.
unsafe fn patch_object(base: u64, dynamic: *const ElfDyn, mode: PatchMode) {
    let Some(symbols) = SymbolTable::new(base, dynamic) else {
        return;
    };

    if let (Some(rel), Some(relsz)) = (
        dynamic_entry(dynamic, DT_REL),
        dynamic_entry(dynamic, DT_RELSZ),
    ) {
        let table = relocated_dyn_ptr(base, rel) as *const ElfRel;
        overwrite_relocations(
            table,
            relsz as usize / std::mem::size_of::<ElfRel>(),
            |e: &ElfRel| (e.r_offset, e.r_info),
            &symbols,
            base,
            mode,
        );
    }

    if let (Some(rela), Some(relasz)) = (
        dynamic_entry(dynamic, DT_RELA),
        dynamic_entry(dynamic, DT_RELASZ),
    ) {
        let table = relocated_dyn_ptr(base, rela) as *const ElfRela;
        overwrite_relocations(
            table,
            relasz as usize / std::mem::size_of::<ElfRela>(),
            |e: &ElfRela| (e.r_offset, e.r_info),
            &symbols,
            base,
            mode,
        );
    }

    // The PLT's relocation table declares its own entry type: normally RELA
    // on 64-bit targets and REL on 32-bit ones, but only DT_PLTREL can say.
    if let (Some(jmprel), Some(pltrelsz), Some(pltrel)) = (
        dynamic_entry(dynamic, DT_JMPREL),
        dynamic_entry(dynamic, DT_PLTRELSZ),
        dynamic_entry(dynamic, DT_PLTREL),
    ) {
        let table = relocated_dyn_ptr(base, jmprel);
        match pltrel as i64 {
            DT_REL => overwrite_relocations(
                table as *const ElfRel,
                pltrelsz as usize / std::mem::size_of::<ElfRel>(),
                |e: &ElfRel| (e.r_offset, e.r_info),
                &symbols,
                base,
                mode,
            ),
            DT_RELA => overwrite_relocations(
                table as *const ElfRela,
                pltrelsz as usize / std::mem::size_of::<ElfRela>(),
                |e: &ElfRela| (e.r_offset, e.r_info),
                &symbols,
                base,
                mode,
            ),
            other => log::debug!("unknown PLT relocation table type {other}"),
        }
    }
}

struct PatcherContext<'a> {
    mode: PatchMode,
    patched: &'a mut HashSet<String>,
}

/// `dladdr` may report a module under its invocation path while the loader
/// reports the canonical one (or the other way around), so falling back to
/// comparing resolved paths keeps the check honest across symlinks.
fn is_same_object(name: &str, own: &str) -> bool {
    if name == own {
        return true;
    }
    match (std::fs::canonicalize(name), std::fs::canonicalize(own)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn should_skip_object(name: &str) -> bool {
    // Overwriting the dynamic linker's own view of these symbols is chaos,
    // and the vdso has nothing to patch.
    if name.contains("/ld-linux") || name.contains("/ld-musl") || name.contains("linux-vdso.so") {
        return true;
    }
    own_module_path().map_or(false, |own| is_same_object(name, own))
}

extern "C" fn patch_phdr_callback(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    // SAFETY: info comes from the loader; data is the PatcherContext passed
    // to dl_iterate_phdr below.
    let (info, context) = unsafe { (&*info, &mut *(data as *mut PatcherContext<'_>)) };
    let raw_name = if info.dlpi_name.is_null() {
        String::new()
    } else {
        // SAFETY: loader-owned NUL-terminated string.
        unsafe { CStr::from_ptr(info.dlpi_name) }
            .to_string_lossy()
            .into_owned()
    };
    // The unnamed entry is the main executable. Resolve it to its real path
    // so the patched-module set and the self-module check both see the same
    // name that dladdr reports; statically linked in, our own module *is*
    // the executable and must be left alone.
    let name = if raw_name.is_empty() {
        crate::maps::executable_path()
    } else {
        raw_name
    };

    if context.mode == PatchMode::Install {
        if context.patched.contains(&name) {
            return 0;
        }
        context.patched.insert(name.clone());
    }

    if should_skip_object(&name) {
        return 0;
    }
    log::debug!("patching symbols for {name}");

    for i in 0..info.dlpi_phnum {
        // SAFETY: dlpi_phdr points at dlpi_phnum program headers.
        let phdr = unsafe { &*info.dlpi_phdr.add(i as usize) };
        if phdr.p_type != libc::PT_DYNAMIC {
            continue;
        }
        let dynamic = info.dlpi_addr.wrapping_add(phdr.p_vaddr) as *const ElfDyn;
        // SAFETY: PT_DYNAMIC of a loaded object is mapped and NULL-terminated.
        unsafe { patch_object(info.dlpi_addr, dynamic, context.mode) };
    }
    0
}

/// Installs and removes the allocator interceptors across every loaded
/// object. The patched-module set makes [`install`](Self::install)
/// idempotent across `dlopen` re-runs; [`restore`](Self::restore) clears it
/// so a later install starts fresh.
#[derive(Default)]
pub struct SymbolPatcher {
    patched: HashSet<String>,
}

impl SymbolPatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self) {
        self.run(PatchMode::Install);
    }

    pub fn restore(&mut self) {
        self.patched.clear();
        self.run(PatchMode::Restore);
    }

    fn run(&mut self, mode: PatchMode) {
        let mut context = PatcherContext {
            mode,
            patched: &mut self.patched,
        };
        // SAFETY: the context outlives the iteration and the callback only
        // touches loader-provided data.
        unsafe {
            libc::dl_iterate_phdr(
                Some(patch_phdr_callback),
                &mut context as *mut PatcherContext<'_> as *mut c_void,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Collects, via our in-memory walk, the names of all symbols referenced
    /// by the given object's PLT relocation table.
    unsafe fn jmprel_symbol_names(base: u64, dynamic: *const ElfDyn) -> Option<Vec<String>> {
        let symbols = SymbolTable::new(base, dynamic)?;
        let jmprel = dynamic_entry(dynamic, DT_JMPREL)?;
        let pltrelsz = dynamic_entry(dynamic, DT_PLTRELSZ)?;
        let pltrel = dynamic_entry(dynamic, DT_PLTREL)?;
        if pltrel as i64 != DT_RELA {
            return None;
        }
        let table = relocated_dyn_ptr(base, jmprel) as *const ElfRela;
        let count = pltrelsz as usize / std::mem::size_of::<ElfRela>();
        let mut names = Vec::new();
        for i in 0..count {
            let entry = &*table.add(i);
            let name = symbols.symbol_name(elf_r_sym(entry.r_info));
            if !name.to_bytes().is_empty() {
                names.push(name.to_string_lossy().into_owned());
            }
        }
        Some(names)
    }

    struct MainObject {
        base: u64,
        dynamic: *const ElfDyn,
        seen: bool,
    }

    extern "C" fn find_main_object(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let (info, out) = unsafe { (&*info, &mut *(data as *mut MainObject)) };
        // The first object reported is always the main executable.
        for i in 0..info.dlpi_phnum {
            let phdr = unsafe { &*info.dlpi_phdr.add(i as usize) };
            if phdr.p_type == libc::PT_DYNAMIC {
                out.base = info.dlpi_addr;
                out.dynamic = info.dlpi_addr.wrapping_add(phdr.p_vaddr) as *const ElfDyn;
                out.seen = true;
            }
        }
        1 // stop after the first object
    }

    #[test]
    fn test_walk_agrees_with_goblin_on_own_binary() {
        let mut main_object = MainObject {
            base: 0,
            dynamic: std::ptr::null(),
            seen: false,
        };
        unsafe {
            libc::dl_iterate_phdr(
                Some(find_main_object),
                &mut main_object as *mut MainObject as *mut c_void,
            );
        }
        assert!(main_object.seen);

        let Some(mut ours) =
            (unsafe { jmprel_symbol_names(main_object.base, main_object.dynamic) })
        else {
            // No PLT relocations (fully bind-now static-ish binary): nothing
            // to compare.
            return;
        };

        let bytes = std::fs::read("/proc/self/exe").unwrap();
        let elf = goblin::elf::Elf::parse(&bytes).unwrap();
        let mut theirs: Vec<String> = elf
            .pltrelocs
            .iter()
            .filter_map(|reloc| {
                let sym = elf.dynsyms.get(reloc.r_sym)?;
                let name = elf.dynstrtab.get_at(sym.st_name)?;
                (!name.is_empty()).then(|| name.to_owned())
            })
            .collect();

        ours.sort();
        theirs.sort();
        assert_eq!(ours, theirs);
    }

    #[test]
    fn test_own_module_is_skipped() {
        if let Some(own) = own_module_path() {
            assert!(should_skip_object(own));
        }
    }

    #[test]
    fn test_main_executable_is_recognized_as_own_module() {
        // Statically linked into the test binary, our code lives in the
        // main executable, which the loader reports under an empty name and
        // dladdr reports under a possibly different spelling of the same
        // path.
        assert!(should_skip_object(&crate::maps::executable_path()));
    }

    #[test]
    fn test_patched_set_records_executable_by_real_path() {
        crate::hooks::ensure_all_hooks_are_valid();
        let mut patcher = SymbolPatcher::new();
        patcher.install();
        assert!(!patcher.patched.contains(""));
        assert!(patcher
            .patched
            .contains(&crate::maps::executable_path()));
        patcher.restore();
    }

    #[test]
    fn test_linker_and_vdso_are_skipped() {
        assert!(should_skip_object("/lib64/ld-linux-x86-64.so.2"));
        assert!(should_skip_object("/lib/ld-musl-x86_64.so.1"));
        assert!(should_skip_object("linux-vdso.so.1"));
        assert!(!should_skip_object("/usr/lib/libc.so.6"));
    }

    #[test]
    fn test_install_is_idempotent_per_module() {
        // Resolve the real allocator entry points first so restore() can
        // put genuine originals back into the tables it rewrites.
        crate::hooks::ensure_all_hooks_are_valid();
        let mut patcher = SymbolPatcher::new();
        patcher.install();
        let after_first = patcher.patched.len();
        assert!(after_first > 0);
        patcher.install();
        assert_eq!(patcher.patched.len(), after_first);
        patcher.restore();
        assert!(patcher.patched.is_empty());
    }
}
