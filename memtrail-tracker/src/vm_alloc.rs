// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wrappers over the interpreter's pluggable allocator domains (raw, mem,
//! object). The embedder registers get/set callbacks that expose the
//! interpreter's allocator table; when tunable-allocator tracing is enabled
//! the tracker swaps in these wrappers, which forward to the saved original
//! table and record each event with the interpreter-allocator kinds.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use memtrail_records::AllocatorType;

use crate::guard::RecursionGuard;
use crate::tracker::Tracker;

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VmAllocatorDomain {
    Raw = 0,
    Mem = 1,
    Object = 2,
}

pub const VM_ALLOCATOR_DOMAINS: [VmAllocatorDomain; 3] = [
    VmAllocatorDomain::Raw,
    VmAllocatorDomain::Mem,
    VmAllocatorDomain::Object,
];

/// Mirror of the interpreter's allocator table: a context pointer and four
/// entry points that receive it.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VmAllocatorTable {
    pub ctx: *mut c_void,
    pub malloc: Option<unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void>,
    pub calloc: Option<unsafe extern "C" fn(*mut c_void, usize, usize) -> *mut c_void>,
    pub realloc: Option<unsafe extern "C" fn(*mut c_void, *mut c_void, usize) -> *mut c_void>,
    pub free: Option<unsafe extern "C" fn(*mut c_void, *mut c_void)>,
}

impl VmAllocatorTable {
    pub const fn empty() -> Self {
        Self {
            ctx: ptr::null_mut(),
            malloc: None,
            calloc: None,
            realloc: None,
            free: None,
        }
    }
}

pub type GetVmAllocatorFn = unsafe extern "C" fn(VmAllocatorDomain, *mut VmAllocatorTable);
pub type SetVmAllocatorFn = unsafe extern "C" fn(VmAllocatorDomain, *const VmAllocatorTable);

struct SavedTables(UnsafeCell<[VmAllocatorTable; 3]>);

// SAFETY: written only while (un)installing under the interpreter's own
// serialization; the wrappers read it immutably afterwards.
unsafe impl Sync for SavedTables {}

static SAVED: SavedTables = SavedTables(UnsafeCell::new([VmAllocatorTable::empty(); 3]));
static GET_ALLOCATOR: AtomicUsize = AtomicUsize::new(0);
static SET_ALLOCATOR: AtomicUsize = AtomicUsize::new(0);

/// Registers the embedder callbacks that read and replace the
/// interpreter's allocator tables. Must be called before a tracker
/// configured with tunable-allocator tracing is created.
pub fn set_domain_callbacks(get: GetVmAllocatorFn, set: SetVmAllocatorFn) {
    GET_ALLOCATOR.store(get as usize, Ordering::SeqCst);
    SET_ALLOCATOR.store(set as usize, Ordering::SeqCst);
}

fn domain_callbacks() -> Option<(GetVmAllocatorFn, SetVmAllocatorFn)> {
    let get = GET_ALLOCATOR.load(Ordering::SeqCst);
    let set = SET_ALLOCATOR.load(Ordering::SeqCst);
    if get == 0 || set == 0 {
        return None;
    }
    // SAFETY: only ever stored from correctly-typed fns in
    // set_domain_callbacks.
    unsafe {
        Some((
            std::mem::transmute::<usize, GetVmAllocatorFn>(get),
            std::mem::transmute::<usize, SetVmAllocatorFn>(set),
        ))
    }
}

/// Saves the current allocator table of every domain and installs the
/// wrappers. Idempotent: if the wrappers are already installed nothing is
/// saved again, so the originals are never clobbered with our own hooks.
///
/// SAFETY: must be called under the interpreter's allocator-swap
/// serialization (the interpreter lock).
pub(crate) unsafe fn install_registered() -> bool {
    let Some((get, set)) = domain_callbacks() else {
        return false;
    };

    let mut probe = VmAllocatorTable::empty();
    get(VmAllocatorDomain::Raw, &mut probe);
    if probe.free == Some(vm_free as unsafe extern "C" fn(*mut c_void, *mut c_void)) {
        return true; // Nothing to do; our hooks are already installed.
    }

    let saved = &mut *SAVED.0.get();
    for domain in VM_ALLOCATOR_DOMAINS {
        let slot = &mut saved[domain as usize];
        get(domain, slot);
        let wrapper = VmAllocatorTable {
            ctx: slot as *mut VmAllocatorTable as *mut c_void,
            malloc: Some(vm_malloc),
            calloc: Some(vm_calloc),
            realloc: Some(vm_realloc),
            free: Some(vm_free),
        };
        set(domain, &wrapper);
    }
    true
}

/// Puts the saved original tables back.
///
/// SAFETY: as for [`install_registered`].
pub(crate) unsafe fn uninstall_registered() {
    let Some((_, set)) = domain_callbacks() else {
        return;
    };
    let saved = &*SAVED.0.get();
    for domain in VM_ALLOCATOR_DOMAINS {
        let slot = &saved[domain as usize];
        if slot.malloc.is_some() {
            set(domain, slot);
        }
    }
}

pub unsafe extern "C" fn vm_malloc(ctx: *mut c_void, size: usize) -> *mut c_void {
    let saved = &*(ctx as *const VmAllocatorTable);
    let ptr;
    {
        let _guard = RecursionGuard::new();
        ptr = match saved.malloc {
            Some(f) => f(saved.ctx, size),
            None => ptr::null_mut(),
        };
    }
    Tracker::track_allocation(ptr, size, AllocatorType::PymallocMalloc);
    ptr
}

pub unsafe extern "C" fn vm_calloc(ctx: *mut c_void, nelem: usize, size: usize) -> *mut c_void {
    let saved = &*(ctx as *const VmAllocatorTable);
    let ptr;
    {
        let _guard = RecursionGuard::new();
        ptr = match saved.calloc {
            Some(f) => f(saved.ctx, nelem, size),
            None => ptr::null_mut(),
        };
    }
    Tracker::track_allocation(ptr, nelem.saturating_mul(size), AllocatorType::PymallocCalloc);
    ptr
}

pub unsafe extern "C" fn vm_realloc(ctx: *mut c_void, old: *mut c_void, size: usize) -> *mut c_void {
    let saved = &*(ctx as *const VmAllocatorTable);
    let ptr;
    {
        let _guard = RecursionGuard::new();
        ptr = match saved.realloc {
            Some(f) => f(saved.ctx, old, size),
            None => ptr::null_mut(),
        };
    }
    if !ptr.is_null() {
        if !old.is_null() {
            Tracker::track_deallocation(old, 0, AllocatorType::PymallocFree);
        }
        Tracker::track_allocation(ptr, size, AllocatorType::PymallocRealloc);
    }
    ptr
}

pub unsafe extern "C" fn vm_free(ctx: *mut c_void, ptr: *mut c_void) {
    let saved = &*(ctx as *const VmAllocatorTable);
    {
        let _guard = RecursionGuard::new();
        if let Some(f) = saved.free {
            f(saved.ctx, ptr);
        }
    }
    if !ptr.is_null() {
        Tracker::track_deallocation(ptr, 0, AllocatorType::PymallocFree);
    }
}
