// C ABI mirroring shmemq.h:
//
//   shmemq_t* shmemq_new(char const* name, unsigned long max_count, unsigned int element_size);
//   bool shmemq_try_enqueue(shmemq_t* self, void* element, int len);
//   bool shmemq_try_dequeue(shmemq_t* self, void* element, int len);
//   void shmemq_destroy(shmemq_t* self, int unlink);

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_uint, c_ulong, c_void};
use std::ptr;
use std::slice;

use tracing::error;

use crate::Queue::ShmemQueue;

/// Handle to a queue (opaque pointer, `shmemq_t` on the C side)
pub struct ShmemqHandle {
    inner: ShmemQueue,
}

/// Create or attach to the queue `name`.
///
/// # Returns
/// * Pointer to `ShmemqHandle`, or NULL on failure.
///
/// # Safety
/// `name` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn shmemq_new(
    name: *const c_char,
    max_count: c_ulong,
    element_size: c_uint,
) -> *mut ShmemqHandle {
    if name.is_null() {
        return ptr::null_mut();
    }
    let name = match CStr::from_ptr(name).to_str() {
        Ok(name) => name,
        Err(_) => {
            error!("shmemq_new: queue name is not valid UTF-8");
            return ptr::null_mut();
        }
    };

    match ShmemQueue::create_or_attach(name, max_count as usize, element_size as usize) {
        Ok(queue) => Box::into_raw(Box::new(ShmemqHandle { inner: queue })),
        Err(e) => {
            error!(name, error = %e, "shmemq_new failed");
            ptr::null_mut()
        }
    }
}

/// Enqueue `len` bytes from `element`.
///
/// # Returns
/// * true on success, false if full, on a length mismatch, or on a NULL argument.
///
/// # Safety
/// `handle` must come from `shmemq_new` and not be destroyed; `element`
/// must be readable for `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn shmemq_try_enqueue(
    handle: *mut ShmemqHandle,
    element: *const c_void,
    len: c_int,
) -> bool {
    if handle.is_null() || element.is_null() || len < 0 {
        return false;
    }
    let queue = &(*handle).inner;
    let element = slice::from_raw_parts(element as *const u8, len as usize);
    queue.try_enqueue(element)
}

/// Dequeue one element into `element`, which holds `len` bytes.
///
/// # Returns
/// * true on success, false if empty, on a length mismatch, or on a NULL argument.
///
/// # Safety
/// `handle` must come from `shmemq_new` and not be destroyed; `element`
/// must be writable for `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn shmemq_try_dequeue(
    handle: *mut ShmemqHandle,
    element: *mut c_void,
    len: c_int,
) -> bool {
    if handle.is_null() || element.is_null() || len < 0 {
        return false;
    }
    let queue = &(*handle).inner;
    let out = slice::from_raw_parts_mut(element as *mut u8, len as usize);
    queue.try_dequeue(out)
}

/// Free a queue handle, removing the shared object too if `unlink` is non-zero.
///
/// # Safety
/// `handle` must be NULL or come from `shmemq_new`, and must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn shmemq_destroy(handle: *mut ShmemqHandle, unlink: c_int) {
    if handle.is_null() {
        return;
    }
    let handle = Box::from_raw(handle);
    let name = handle.inner.name().to_string();
    if let Err(e) = handle.inner.destroy(unlink != 0) {
        error!(name = %name, error = %e, "shmemq_destroy failed");
    }
}
