// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Snapshot of the currently loaded images and their PT_LOAD segments, as
//! the reader needs them to resolve native instruction pointers.

use std::ffi::{c_int, c_void, CStr};

use memtrail_records::records::{ImageSegments, Segment};

/// Real path of the main executable, which `dl_iterate_phdr` reports under
/// an empty name.
pub(crate) fn executable_path() -> String {
    std::fs::read_link("/proc/self/exe")
        .map(|path| path.display().to_string())
        .unwrap_or_default()
}

extern "C" fn phdr_callback(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    // SAFETY: the loader hands us a valid info pointer; data is the Vec we
    // passed to dl_iterate_phdr below.
    let (info, images) = unsafe { (&*info, &mut *(data as *mut Vec<ImageSegments>)) };

    let raw_name = if info.dlpi_name.is_null() {
        String::new()
    } else {
        // SAFETY: dlpi_name is a NUL-terminated string owned by the loader.
        unsafe { CStr::from_ptr(info.dlpi_name) }
            .to_string_lossy()
            .into_owned()
    };
    // The unnamed entry is the main executable.
    let filename = if raw_name.is_empty() {
        executable_path()
    } else {
        raw_name
    };
    if filename.contains("linux-vdso.so") {
        // Cannot be resolved to anything on disk.
        return 0;
    }

    let mut segments = Vec::new();
    for i in 0..info.dlpi_phnum {
        // SAFETY: dlpi_phdr points at dlpi_phnum program headers.
        let phdr = unsafe { &*info.dlpi_phdr.add(i as usize) };
        if phdr.p_type == libc::PT_LOAD {
            segments.push(Segment {
                vaddr: phdr.p_vaddr,
                memsz: phdr.p_memsz,
            });
        }
    }

    images.push(ImageSegments {
        filename,
        addr: info.dlpi_addr,
        segments,
    });
    0
}

/// Walks every loaded object, collecting its load address and PT_LOAD
/// segments. The vdso is skipped; the main executable is reported under its
/// `/proc/self/exe` path.
pub fn collect_image_segments() -> Vec<ImageSegments> {
    let mut images: Vec<ImageSegments> = Vec::new();
    // SAFETY: the callback only dereferences the pointers the loader gives
    // it and the Vec outlives the call.
    unsafe {
        libc::dl_iterate_phdr(
            Some(phdr_callback),
            &mut images as *mut Vec<ImageSegments> as *mut c_void,
        );
    }
    images
}
