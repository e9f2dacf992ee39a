// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The interceptors installed over the hooked allocator symbols, and the
//! bookkeeping for the saved originals they forward to.
//!
//! Every interceptor has the exact C signature of the symbol it replaces
//! and the same shape: call the saved original under the recursion guard,
//! then report the event to the tracker outside of it. Deallocations are
//! reported *before* the real call so an address can never be recycled
//! before its free record exists.

use std::ffi::{c_char, c_int, c_ulong, c_void, CStr};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::OnceLock;

use memtrail_records::AllocatorType;

use crate::guard::RecursionGuard;
use crate::tracker::Tracker;

/// A hooked symbol and the address the dynamic linker resolved for it
/// before we started rewriting relocation tables.
pub struct SymbolHook {
    symbol: &'static CStr,
    original: AtomicPtr<c_void>,
}

impl SymbolHook {
    const fn new(symbol: &'static CStr) -> Self {
        Self {
            symbol,
            original: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn symbol(&self) -> &'static CStr {
        self.symbol
    }

    pub fn original_ptr(&self) -> *mut c_void {
        self.original.load(Ordering::Acquire)
    }

    /// Resolves the symbol the way the dynamic linker would right now and
    /// adopts that as the original. Our interceptors are not exported
    /// dynamic symbols, so the default lookup can never find them and this
    /// is safe to re-run even while patched.
    fn ensure_valid_original(&self, fallback: *mut c_void) {
        // SAFETY: static NUL-terminated symbol name.
        let resolved = unsafe { libc::dlsym(libc::RTLD_DEFAULT, self.symbol.as_ptr()) };
        let chosen = if resolved.is_null() { fallback } else { resolved };
        let previous = self.original.swap(chosen, Ordering::AcqRel);
        if !previous.is_null() && previous != chosen {
            log::warn!(
                "correcting symbol for {} from {previous:p} to {chosen:p}",
                self.symbol.to_string_lossy()
            );
        }
    }
}

pub static MALLOC: SymbolHook = SymbolHook::new(c"malloc");
pub static FREE: SymbolHook = SymbolHook::new(c"free");
pub static CALLOC: SymbolHook = SymbolHook::new(c"calloc");
pub static REALLOC: SymbolHook = SymbolHook::new(c"realloc");
pub static VALLOC: SymbolHook = SymbolHook::new(c"valloc");
pub static POSIX_MEMALIGN: SymbolHook = SymbolHook::new(c"posix_memalign");
pub static ALIGNED_ALLOC: SymbolHook = SymbolHook::new(c"aligned_alloc");
pub static MEMALIGN: SymbolHook = SymbolHook::new(c"memalign");
#[cfg(target_env = "gnu")]
pub static PVALLOC: SymbolHook = SymbolHook::new(c"pvalloc");
pub static MMAP: SymbolHook = SymbolHook::new(c"mmap");
#[cfg(target_env = "gnu")]
pub static MMAP64: SymbolHook = SymbolHook::new(c"mmap64");
pub static MUNMAP: SymbolHook = SymbolHook::new(c"munmap");
pub static PRCTL: SymbolHook = SymbolHook::new(c"prctl");
pub static DLOPEN: SymbolHook = SymbolHook::new(c"dlopen");
pub static DLCLOSE: SymbolHook = SymbolHook::new(c"dlclose");

#[cfg(target_env = "gnu")]
extern "C" {
    fn pvalloc(size: libc::size_t) -> *mut c_void;
}

#[cfg(target_env = "gnu")]
extern "C" {
    fn dlinfo(handle: *mut c_void, request: c_int, info: *mut c_void) -> c_int;
}

#[cfg(target_env = "gnu")]
const RTLD_DI_SERINFO: c_int = 4;
#[cfg(target_env = "gnu")]
const RTLD_DI_SERINFOSIZE: c_int = 5;

#[cfg(target_env = "gnu")]
#[repr(C)]
struct DlSerpath {
    dls_name: *mut c_char,
    dls_flags: libc::c_uint,
}

#[cfg(target_env = "gnu")]
#[repr(C)]
struct DlSerinfo {
    dls_size: libc::size_t,
    dls_cnt: libc::c_uint,
    dls_serpath: [DlSerpath; 1],
}

/// Validates every saved original against a fresh linker lookup. Run once
/// per process before the first patch install; symbol drift here means some
/// other interposer resolved in between.
pub fn ensure_all_hooks_are_valid() {
    MALLOC.ensure_valid_original(libc::malloc as usize as *mut c_void);
    FREE.ensure_valid_original(libc::free as usize as *mut c_void);
    CALLOC.ensure_valid_original(libc::calloc as usize as *mut c_void);
    REALLOC.ensure_valid_original(libc::realloc as usize as *mut c_void);
    VALLOC.ensure_valid_original(ptr::null_mut());
    POSIX_MEMALIGN.ensure_valid_original(libc::posix_memalign as usize as *mut c_void);
    ALIGNED_ALLOC.ensure_valid_original(libc::aligned_alloc as usize as *mut c_void);
    MEMALIGN.ensure_valid_original(libc::memalign as usize as *mut c_void);
    #[cfg(target_env = "gnu")]
    PVALLOC.ensure_valid_original(pvalloc as usize as *mut c_void);
    MMAP.ensure_valid_original(libc::mmap as usize as *mut c_void);
    #[cfg(target_env = "gnu")]
    MMAP64.ensure_valid_original(libc::mmap64 as usize as *mut c_void);
    MUNMAP.ensure_valid_original(libc::munmap as usize as *mut c_void);
    PRCTL.ensure_valid_original(ptr::null_mut());
    DLOPEN.ensure_valid_original(ptr::null_mut());
    DLCLOSE.ensure_valid_original(ptr::null_mut());
}

/// One row of the patcher's worklist: the symbol name, its saved original,
/// and the interceptor address to write over relocations.
pub struct HookedSymbol {
    pub symbol: &'static CStr,
    pub hook: &'static SymbolHook,
    pub interceptor: usize,
}

pub(crate) fn hook_table() -> &'static [HookedSymbol] {
    static TABLE: OnceLock<Vec<HookedSymbol>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = vec![
            HookedSymbol {
                symbol: MALLOC.symbol(),
                hook: &MALLOC,
                interceptor: intercept::malloc as usize,
            },
            HookedSymbol {
                symbol: FREE.symbol(),
                hook: &FREE,
                interceptor: intercept::free as usize,
            },
            HookedSymbol {
                symbol: CALLOC.symbol(),
                hook: &CALLOC,
                interceptor: intercept::calloc as usize,
            },
            HookedSymbol {
                symbol: REALLOC.symbol(),
                hook: &REALLOC,
                interceptor: intercept::realloc as usize,
            },
            HookedSymbol {
                symbol: VALLOC.symbol(),
                hook: &VALLOC,
                interceptor: intercept::valloc as usize,
            },
            HookedSymbol {
                symbol: POSIX_MEMALIGN.symbol(),
                hook: &POSIX_MEMALIGN,
                interceptor: intercept::posix_memalign as usize,
            },
            HookedSymbol {
                symbol: ALIGNED_ALLOC.symbol(),
                hook: &ALIGNED_ALLOC,
                interceptor: intercept::aligned_alloc as usize,
            },
            HookedSymbol {
                symbol: MEMALIGN.symbol(),
                hook: &MEMALIGN,
                interceptor: intercept::memalign as usize,
            },
            HookedSymbol {
                symbol: MMAP.symbol(),
                hook: &MMAP,
                interceptor: intercept::mmap as usize,
            },
            HookedSymbol {
                symbol: MUNMAP.symbol(),
                hook: &MUNMAP,
                interceptor: intercept::munmap as usize,
            },
            HookedSymbol {
                symbol: PRCTL.symbol(),
                hook: &PRCTL,
                interceptor: intercept::prctl as usize,
            },
            HookedSymbol {
                symbol: DLOPEN.symbol(),
                hook: &DLOPEN,
                interceptor: intercept::dlopen as usize,
            },
            HookedSymbol {
                symbol: DLCLOSE.symbol(),
                hook: &DLCLOSE,
                interceptor: intercept::dlclose as usize,
            },
        ];
        #[cfg(target_env = "gnu")]
        {
            table.push(HookedSymbol {
                symbol: PVALLOC.symbol(),
                hook: &PVALLOC,
                interceptor: intercept::pvalloc as usize,
            });
            table.push(HookedSymbol {
                symbol: MMAP64.symbol(),
                hook: &MMAP64,
                interceptor: intercept::mmap64 as usize,
            });
        }
        table
    })
}

/// Path of the object this code lives in, so the patcher can leave our own
/// relocations alone.
pub(crate) fn own_module_path() -> Option<&'static str> {
    static PATH: OnceLock<Option<String>> = OnceLock::new();
    PATH.get_or_init(|| {
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        let probe = own_module_path as usize as *mut c_void;
        // SAFETY: probing an address inside this module.
        let found = unsafe { libc::dladdr(probe, &mut info) };
        if found == 0 || info.dli_fname.is_null() {
            return None;
        }
        // SAFETY: dladdr filled dli_fname with a NUL-terminated path.
        Some(
            unsafe { CStr::from_ptr(info.dli_fname) }
                .to_string_lossy()
                .into_owned(),
        )
    })
    .as_deref()
}

/// Typed accessors over the saved originals. Until the one-time validation
/// has run these fall back to the addresses this object linked against.
mod real {
    use super::*;

    pub unsafe fn malloc(size: libc::size_t) -> *mut c_void {
        let original = MALLOC.original_ptr();
        if original.is_null() {
            return libc::malloc(size);
        }
        let f: unsafe extern "C" fn(libc::size_t) -> *mut c_void = std::mem::transmute(original);
        f(size)
    }

    pub unsafe fn free(ptr: *mut c_void) {
        let original = FREE.original_ptr();
        if original.is_null() {
            return libc::free(ptr);
        }
        let f: unsafe extern "C" fn(*mut c_void) = std::mem::transmute(original);
        f(ptr)
    }

    pub unsafe fn calloc(nmemb: libc::size_t, size: libc::size_t) -> *mut c_void {
        let original = CALLOC.original_ptr();
        if original.is_null() {
            return libc::calloc(nmemb, size);
        }
        let f: unsafe extern "C" fn(libc::size_t, libc::size_t) -> *mut c_void =
            std::mem::transmute(original);
        f(nmemb, size)
    }

    pub unsafe fn realloc(ptr: *mut c_void, size: libc::size_t) -> *mut c_void {
        let original = REALLOC.original_ptr();
        if original.is_null() {
            return libc::realloc(ptr, size);
        }
        let f: unsafe extern "C" fn(*mut c_void, libc::size_t) -> *mut c_void =
            std::mem::transmute(original);
        f(ptr, size)
    }

    pub unsafe fn valloc(size: libc::size_t) -> *mut c_void {
        let original = VALLOC.original_ptr();
        if original.is_null() {
            // No portable fallback; behave like an allocation failure.
            return ptr::null_mut();
        }
        let f: unsafe extern "C" fn(libc::size_t) -> *mut c_void = std::mem::transmute(original);
        f(size)
    }

    pub unsafe fn posix_memalign(
        memptr: *mut *mut c_void,
        alignment: libc::size_t,
        size: libc::size_t,
    ) -> c_int {
        let original = POSIX_MEMALIGN.original_ptr();
        if original.is_null() {
            return libc::posix_memalign(memptr, alignment, size);
        }
        let f: unsafe extern "C" fn(*mut *mut c_void, libc::size_t, libc::size_t) -> c_int =
            std::mem::transmute(original);
        f(memptr, alignment, size)
    }

    pub unsafe fn aligned_alloc(alignment: libc::size_t, size: libc::size_t) -> *mut c_void {
        let original = ALIGNED_ALLOC.original_ptr();
        if original.is_null() {
            return libc::aligned_alloc(alignment, size);
        }
        let f: unsafe extern "C" fn(libc::size_t, libc::size_t) -> *mut c_void =
            std::mem::transmute(original);
        f(alignment, size)
    }

    pub unsafe fn memalign(alignment: libc::size_t, size: libc::size_t) -> *mut c_void {
        let original = MEMALIGN.original_ptr();
        if original.is_null() {
            return libc::memalign(alignment, size);
        }
        let f: unsafe extern "C" fn(libc::size_t, libc::size_t) -> *mut c_void =
            std::mem::transmute(original);
        f(alignment, size)
    }

    #[cfg(target_env = "gnu")]
    pub unsafe fn pvalloc(size: libc::size_t) -> *mut c_void {
        let original = PVALLOC.original_ptr();
        if original.is_null() {
            return super::pvalloc(size);
        }
        let f: unsafe extern "C" fn(libc::size_t) -> *mut c_void = std::mem::transmute(original);
        f(size)
    }

    pub unsafe fn mmap(
        addr: *mut c_void,
        length: libc::size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off_t,
    ) -> *mut c_void {
        let original = MMAP.original_ptr();
        if original.is_null() {
            return libc::mmap(addr, length, prot, flags, fd, offset);
        }
        let f: unsafe extern "C" fn(
            *mut c_void,
            libc::size_t,
            c_int,
            c_int,
            c_int,
            libc::off_t,
        ) -> *mut c_void = std::mem::transmute(original);
        f(addr, length, prot, flags, fd, offset)
    }

    #[cfg(target_env = "gnu")]
    pub unsafe fn mmap64(
        addr: *mut c_void,
        length: libc::size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off64_t,
    ) -> *mut c_void {
        let original = MMAP64.original_ptr();
        if original.is_null() {
            return libc::mmap64(addr, length, prot, flags, fd, offset);
        }
        let f: unsafe extern "C" fn(
            *mut c_void,
            libc::size_t,
            c_int,
            c_int,
            c_int,
            libc::off64_t,
        ) -> *mut c_void = std::mem::transmute(original);
        f(addr, length, prot, flags, fd, offset)
    }

    pub unsafe fn munmap(addr: *mut c_void, length: libc::size_t) -> c_int {
        let original = MUNMAP.original_ptr();
        if original.is_null() {
            return libc::munmap(addr, length);
        }
        let f: unsafe extern "C" fn(*mut c_void, libc::size_t) -> c_int =
            std::mem::transmute(original);
        f(addr, length)
    }

    pub unsafe fn prctl(
        option: c_int,
        arg2: c_ulong,
        arg3: c_ulong,
        arg4: c_ulong,
        arg5: c_ulong,
    ) -> c_int {
        let original = PRCTL.original_ptr();
        if original.is_null() {
            return libc::prctl(option, arg2, arg3, arg4, arg5);
        }
        let f: unsafe extern "C" fn(c_int, c_ulong, c_ulong, c_ulong, c_ulong) -> c_int =
            std::mem::transmute(original);
        f(option, arg2, arg3, arg4, arg5)
    }

    pub unsafe fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void {
        let original = DLOPEN.original_ptr();
        if original.is_null() {
            return libc::dlopen(filename, flags);
        }
        let f: unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void =
            std::mem::transmute(original);
        f(filename, flags)
    }

    pub unsafe fn dlclose(handle: *mut c_void) -> c_int {
        let original = DLCLOSE.original_ptr();
        if original.is_null() {
            return libc::dlclose(handle);
        }
        let f: unsafe extern "C" fn(*mut c_void) -> c_int = std::mem::transmute(original);
        f(handle)
    }
}

/// Innermost instruction pointer that does not belong to this module: the
/// code that called into one of our interceptors.
#[cfg(target_env = "gnu")]
fn caller_address() -> Option<usize> {
    let own = own_module_path()?;
    let mut result = None;
    // SAFETY: single-threaded walk of our own stack, IPs only.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            let ip = frame.ip() as usize;
            if ip == 0 {
                return true;
            }
            let mut info: libc::Dl_info = std::mem::zeroed();
            if libc::dladdr(ip as *mut c_void, &mut info) != 0 && !info.dli_fname.is_null() {
                if CStr::from_ptr(info.dli_fname).to_string_lossy() != own {
                    result = Some(ip);
                    return false;
                }
            }
            true
        });
    }
    result
}

/// The linker resolves a plain `dlopen("libfoo.so")` against the RUNPATH of
/// the *calling* object. Once we intercept dlopen, the nominal caller is us,
/// so that search would be lost: rebuild it by locating the true caller and
/// walking its search path via `dlinfo`. Returns null when the plain search
/// does not apply or finds nothing; the caller falls back to a direct open.
#[cfg(target_env = "gnu")]
unsafe fn dlopen_respecting_caller_search(filename: *const c_char, flags: c_int) -> *mut c_void {
    let name = CStr::from_ptr(filename);
    if name.to_bytes().is_empty() || name.to_bytes().contains(&b'/') {
        return ptr::null_mut();
    }

    let Some(caller) = caller_address() else {
        return ptr::null_mut();
    };
    let mut caller_info: libc::Dl_info = std::mem::zeroed();
    if libc::dladdr(caller as *mut c_void, &mut caller_info) == 0
        || caller_info.dli_fname.is_null()
    {
        return ptr::null_mut();
    }
    let mut caller_name: *const c_char = caller_info.dli_fname;

    // Calls from the main executable need dlopen(NULL) to address it.
    let self_handle = real::dlopen(ptr::null(), libc::RTLD_LAZY | libc::RTLD_NOLOAD);
    if !self_handle.is_null() {
        let main_symbol = libc::dlsym(self_handle, c"main".as_ptr());
        real::dlclose(self_handle);
        if !main_symbol.is_null() {
            let mut main_info: libc::Dl_info = std::mem::zeroed();
            if libc::dladdr(main_symbol, &mut main_info) != 0
                && !main_info.dli_fname.is_null()
                && CStr::from_ptr(main_info.dli_fname) == CStr::from_ptr(caller_info.dli_fname)
            {
                caller_name = ptr::null();
            }
        }
    }

    let caller_handle = real::dlopen(caller_name, libc::RTLD_LAZY | libc::RTLD_NOLOAD);
    if caller_handle.is_null() {
        return ptr::null_mut();
    }

    let mut result = ptr::null_mut();
    let mut probe = DlSerinfo {
        dls_size: 0,
        dls_cnt: 0,
        dls_serpath: [DlSerpath {
            dls_name: ptr::null_mut(),
            dls_flags: 0,
        }],
    };
    if dlinfo(
        caller_handle,
        RTLD_DI_SERINFOSIZE,
        &mut probe as *mut DlSerinfo as *mut c_void,
    ) == 0
    {
        let words = probe.dls_size.div_ceil(std::mem::size_of::<usize>());
        let mut buffer: Vec<usize> = vec![0; words.max(1)];
        let serinfo = buffer.as_mut_ptr() as *mut DlSerinfo;
        (*serinfo).dls_size = probe.dls_size;
        (*serinfo).dls_cnt = probe.dls_cnt;
        if dlinfo(caller_handle, RTLD_DI_SERINFO, serinfo as *mut c_void) == 0 {
            let paths = std::ptr::addr_of!((*serinfo).dls_serpath) as *const DlSerpath;
            for i in 0..(*serinfo).dls_cnt as usize {
                let entry = &*paths.add(i);
                if entry.dls_name.is_null() {
                    continue;
                }
                let dir = CStr::from_ptr(entry.dls_name);
                if dir.to_bytes().is_empty() {
                    continue;
                }
                let mut candidate = dir.to_bytes().to_vec();
                if candidate.last() != Some(&b'/') {
                    candidate.push(b'/');
                }
                candidate.extend_from_slice(name.to_bytes());
                candidate.push(0);
                result = real::dlopen(candidate.as_ptr() as *const c_char, flags);
                if !result.is_null() {
                    break;
                }
            }
        }
    }
    real::dlclose(caller_handle);
    result
}

pub mod intercept {
    //! The functions whose addresses get written into relocation tables.
    //! They are deliberately *not* exported dynamic symbols: interception
    //! happens purely through table rewriting, never through symbol
    //! shadowing, so `dlsym` keeps resolving the genuine implementations.

    use super::*;

    pub unsafe extern "C" fn malloc(size: libc::size_t) -> *mut c_void {
        let ptr;
        {
            let _guard = RecursionGuard::new();
            ptr = real::malloc(size);
        }
        if !ptr.is_null() {
            Tracker::track_allocation(ptr, size, AllocatorType::Malloc);
        }
        ptr
    }

    pub unsafe extern "C" fn free(ptr: *mut c_void) {
        // Report before the real free so the address cannot be handed out
        // again before the deallocation record is written.
        if !ptr.is_null() {
            Tracker::track_deallocation(ptr, 0, AllocatorType::Free);
        }
        let _guard = RecursionGuard::new();
        real::free(ptr);
    }

    pub unsafe extern "C" fn calloc(nmemb: libc::size_t, size: libc::size_t) -> *mut c_void {
        let ptr;
        {
            let _guard = RecursionGuard::new();
            ptr = real::calloc(nmemb, size);
        }
        if !ptr.is_null() {
            Tracker::track_allocation(ptr, nmemb.saturating_mul(size), AllocatorType::Calloc);
        }
        ptr
    }

    pub unsafe extern "C" fn realloc(old: *mut c_void, size: libc::size_t) -> *mut c_void {
        let ptr;
        {
            let _guard = RecursionGuard::new();
            ptr = real::realloc(old, size);
        }
        if !ptr.is_null() {
            if !old.is_null() {
                Tracker::track_deallocation(old, 0, AllocatorType::Free);
            }
            Tracker::track_allocation(ptr, size, AllocatorType::Realloc);
        }
        ptr
    }

    pub unsafe extern "C" fn valloc(size: libc::size_t) -> *mut c_void {
        let ptr;
        {
            let _guard = RecursionGuard::new();
            ptr = real::valloc(size);
        }
        if !ptr.is_null() {
            Tracker::track_allocation(ptr, size, AllocatorType::Valloc);
        }
        ptr
    }

    pub unsafe extern "C" fn posix_memalign(
        memptr: *mut *mut c_void,
        alignment: libc::size_t,
        size: libc::size_t,
    ) -> c_int {
        let rc;
        {
            let _guard = RecursionGuard::new();
            rc = real::posix_memalign(memptr, alignment, size);
        }
        if rc == 0 {
            Tracker::track_allocation(*memptr, size, AllocatorType::PosixMemalign);
        }
        rc
    }

    pub unsafe extern "C" fn aligned_alloc(
        alignment: libc::size_t,
        size: libc::size_t,
    ) -> *mut c_void {
        let ptr;
        {
            let _guard = RecursionGuard::new();
            ptr = real::aligned_alloc(alignment, size);
        }
        if !ptr.is_null() {
            Tracker::track_allocation(ptr, size, AllocatorType::AlignedAlloc);
        }
        ptr
    }

    pub unsafe extern "C" fn memalign(alignment: libc::size_t, size: libc::size_t) -> *mut c_void {
        let ptr;
        {
            let _guard = RecursionGuard::new();
            ptr = real::memalign(alignment, size);
        }
        if !ptr.is_null() {
            Tracker::track_allocation(ptr, size, AllocatorType::Memalign);
        }
        ptr
    }

    #[cfg(target_env = "gnu")]
    pub unsafe extern "C" fn pvalloc(size: libc::size_t) -> *mut c_void {
        let ptr;
        {
            let _guard = RecursionGuard::new();
            ptr = real::pvalloc(size);
        }
        if !ptr.is_null() {
            Tracker::track_allocation(ptr, size, AllocatorType::Pvalloc);
        }
        ptr
    }

    pub unsafe extern "C" fn mmap(
        addr: *mut c_void,
        length: libc::size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off_t,
    ) -> *mut c_void {
        let ptr;
        {
            let _guard = RecursionGuard::new();
            ptr = real::mmap(addr, length, prot, flags, fd, offset);
        }
        if ptr != libc::MAP_FAILED {
            Tracker::track_allocation(ptr, length, AllocatorType::Mmap);
        }
        ptr
    }

    #[cfg(target_env = "gnu")]
    pub unsafe extern "C" fn mmap64(
        addr: *mut c_void,
        length: libc::size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off64_t,
    ) -> *mut c_void {
        let ptr;
        {
            let _guard = RecursionGuard::new();
            ptr = real::mmap64(addr, length, prot, flags, fd, offset);
        }
        if ptr != libc::MAP_FAILED {
            Tracker::track_allocation(ptr, length, AllocatorType::Mmap);
        }
        ptr
    }

    pub unsafe extern "C" fn munmap(addr: *mut c_void, length: libc::size_t) -> c_int {
        Tracker::track_deallocation(addr, length, AllocatorType::Munmap);
        let _guard = RecursionGuard::new();
        real::munmap(addr, length)
    }

    /// `prctl` is variadic in C; stable Rust cannot define variadic
    /// functions, but the supported ABIs pass the first five integer
    /// arguments identically for fixed and variadic prototypes.
    pub unsafe extern "C" fn prctl(
        option: c_int,
        arg2: c_ulong,
        arg3: c_ulong,
        arg4: c_ulong,
        arg5: c_ulong,
    ) -> c_int {
        if option == libc::PR_SET_NAME {
            Tracker::register_thread_name(arg2 as *const c_char);
        }
        real::prctl(option, arg2, arg3, arg4, arg5)
    }

    pub unsafe extern "C" fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void {
        let mut handle = ptr::null_mut();
        {
            let _guard = RecursionGuard::new();
            #[cfg(target_env = "gnu")]
            if !filename.is_null() {
                handle = dlopen_respecting_caller_search(filename, flags);
            }
            if handle.is_null() {
                handle = real::dlopen(filename, flags);
            }
        }
        if !handle.is_null() {
            // Newly loaded libraries must be patched and appear in the
            // module map before any of their code allocates.
            Tracker::invalidate_module_cache();
        }
        handle
    }

    pub unsafe extern "C" fn dlclose(handle: *mut c_void) -> c_int {
        let rc;
        {
            let _guard = RecursionGuard::new();
            rc = real::dlclose(handle);
        }
        if rc == 0 {
            Tracker::invalidate_module_cache();
        }
        rc
    }
}
