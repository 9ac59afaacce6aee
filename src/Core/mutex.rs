// Process-shared, robust pthread mutex living inside a shared mapping

use std::cell::UnsafeCell;
use std::io;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ops::{Deref, DerefMut};
use std::ptr;

use tracing::warn;

#[inline]
fn check(rc: libc::c_int) -> io::Result<()> {
    // pthread functions return the error code instead of setting errno
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

/// A mutex and the value it guards, laid out for shared memory.
///
/// The struct is never constructed by value. The creator of a segment calls
/// [`ProcessMutex::init_in_place`] on raw memory once; every other process
/// uses the same memory through a reference and only calls [`ProcessMutex::lock`].
#[repr(C)]
pub struct ProcessMutex<T> {
    raw: UnsafeCell<libc::pthread_mutex_t>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for ProcessMutex<T> {}
unsafe impl<T: Send> Sync for ProcessMutex<T> {}

/// Owns a `pthread_mutexattr_t` and destroys it on every exit path.
struct MutexAttr(libc::pthread_mutexattr_t);

impl MutexAttr {
    fn new() -> io::Result<Self> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(unsafe { libc::pthread_mutexattr_init(attr.as_mut_ptr()) })?;
        Ok(Self(unsafe { attr.assume_init() }))
    }
}

impl Drop for MutexAttr {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutexattr_destroy(&mut self.0);
        }
    }
}

impl<T> ProcessMutex<T> {
    /// Build the mutex in its process-shared, robust form and store `value`.
    ///
    /// # Safety
    /// `this` must point to writable memory large enough for `Self`, aligned
    /// for it, and not yet in use by any other thread or process.
    pub unsafe fn init_in_place(this: *mut Self, value: T) -> io::Result<()> {
        let mut attr = MutexAttr::new()?;
        check(libc::pthread_mutexattr_setpshared(
            &mut attr.0,
            libc::PTHREAD_PROCESS_SHARED,
        ))?;
        check(libc::pthread_mutexattr_setrobust(
            &mut attr.0,
            libc::PTHREAD_MUTEX_ROBUST,
        ))?;

        let raw = ptr::addr_of_mut!((*this).raw) as *mut libc::pthread_mutex_t;
        check(libc::pthread_mutex_init(raw, &attr.0))?;

        let data = ptr::addr_of_mut!((*this).data) as *mut T;
        ptr::write(data, value);
        Ok(())
    }

    /// Acquire the mutex, blocking until it is free.
    ///
    /// If the previous holder died while holding it, the mutex is marked
    /// consistent again and the guard reports [`ProcessMutexGuard::was_recovered`].
    pub fn lock(&self) -> io::Result<ProcessMutexGuard<'_, T>> {
        let raw = self.raw.get();
        let rc = unsafe { libc::pthread_mutex_lock(raw) };
        let recovered = match rc {
            0 => false,
            libc::EOWNERDEAD => {
                if let Err(e) = check(unsafe { libc::pthread_mutex_consistent(raw) }) {
                    unsafe { libc::pthread_mutex_unlock(raw) };
                    return Err(e);
                }
                warn!("previous holder of a process-shared mutex died; lock recovered");
                true
            }
            code => return Err(io::Error::from_raw_os_error(code)),
        };

        Ok(ProcessMutexGuard {
            mutex: self,
            recovered,
            _not_send: PhantomData,
        })
    }
}

/// Holds a [`ProcessMutex`] until dropped.
///
/// Not `Send`: a pthread mutex must be unlocked by the thread that locked it.
pub struct ProcessMutexGuard<'a, T> {
    mutex: &'a ProcessMutex<T>,
    recovered: bool,
    _not_send: PhantomData<*const ()>,
}

impl<T> ProcessMutexGuard<'_, T> {
    /// True if the previous owner died inside its critical section.
    pub fn was_recovered(&self) -> bool {
        self.recovered
    }
}

impl<T> Deref for ProcessMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for ProcessMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for ProcessMutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.raw.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc, dealloc, Layout};
    use std::sync::Arc;
    use std::thread;

    struct Boxed(*mut ProcessMutex<u64>, Layout);
    unsafe impl Send for Boxed {}
    unsafe impl Sync for Boxed {}

    impl Drop for Boxed {
        fn drop(&mut self) {
            unsafe {
                libc::pthread_mutex_destroy(self.0 as *mut libc::pthread_mutex_t);
                dealloc(self.0 as *mut u8, self.1);
            }
        }
    }

    fn heap_mutex(value: u64) -> Boxed {
        let layout = Layout::new::<ProcessMutex<u64>>();
        let ptr = unsafe { alloc(layout) } as *mut ProcessMutex<u64>;
        assert!(!ptr.is_null());
        unsafe { ProcessMutex::init_in_place(ptr, value).unwrap() };
        Boxed(ptr, layout)
    }

    #[test]
    fn lock_guards_value() {
        let m = heap_mutex(7);
        let mutex = unsafe { &*m.0 };
        {
            let mut guard = mutex.lock().unwrap();
            assert!(!guard.was_recovered());
            *guard += 1;
        }
        assert_eq!(*mutex.lock().unwrap(), 8);
    }

    #[test]
    fn threads_serialize_through_lock() {
        let m = Arc::new(heap_mutex(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    let mutex = unsafe { &*m.0 };
                    for _ in 0..10_000 {
                        *mutex.lock().unwrap() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*unsafe { &*m.0 }.lock().unwrap(), 40_000);
    }

    #[test]
    fn dead_thread_owner_is_recovered() {
        // A robust mutex reports EOWNERDEAD when the owning thread exits too
        let m = Arc::new(heap_mutex(1));
        let m2 = Arc::clone(&m);
        thread::spawn(move || {
            let mutex = unsafe { &*m2.0 };
            let guard = mutex.lock().unwrap();
            std::mem::forget(guard);
        })
        .join()
        .unwrap();

        let mutex = unsafe { &*m.0 };
        let guard = mutex.lock().unwrap();
        assert!(guard.was_recovered());
        assert_eq!(*guard, 1);
        drop(guard);
        assert!(!mutex.lock().unwrap().was_recovered());
    }
}
