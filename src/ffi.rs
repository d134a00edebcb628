//! C ABI entry points of the ownership bridge.
//!
//! ```c
//! int *make_memory(void);
//! int *make_boxed_memory(int value);
//! int take_ownership(int *i, void (*dtor)(int *));
//! void free_memory(int *i);
//! void drop_pointer(int *i);
//! ```
//!
//! Every cell handed out here is tracked by [`CellRegistry::global`]. Both
//! `take_ownership` and the destructors consult it, so a second release or a
//! destructor from the wrong heap is refused instead of freeing.

use std::ffi::c_int;
use std::io::{self, Write};
use std::ptr::{self, NonNull};

use crate::error::InteropStatus;
use crate::ownership::{self, CellRegistry, DEFAULT_CELL_VALUE, Origin, Rejection};

/// Destructor signature accepted by `take_ownership`.
pub type RawDestructor = unsafe extern "C" fn(*mut c_int);

fn hand_out(origin: Origin, value: c_int) -> *mut c_int {
    let Some(cell) = NonNull::new(origin.allocate_raw(value)) else {
        tracing::error!(%origin, "allocation of an integer cell failed");
        return ptr::null_mut();
    };

    let address = cell.as_ptr() as usize;
    let registry = CellRegistry::global();
    let generation = match registry.register(address, origin) {
        Ok(generation) => generation,
        Err(_) => {
            // the previous cell at this address was freed outside the bridge
            tracing::warn!(address, %origin, "replacing stale record for a reused address");
            registry.forget(address);
            match registry.register(address, origin) {
                Ok(generation) => generation,
                Err(err) => {
                    tracing::error!(address, error = %err, "could not register fresh cell");
                    unsafe { origin.free_unchecked(cell) };
                    return ptr::null_mut();
                }
            }
        }
    };

    tracing::debug!(address, %origin, generation, value, "handing cell across the boundary");
    cell.as_ptr()
}

/// Body of the exported destructors: frees `i` only if the global registry
/// still holds it as a live cell of `origin`.
unsafe fn release_checked(origin: Origin, i: *mut c_int) {
    let Some(cell) = NonNull::new(i) else {
        return;
    };
    let address = cell.as_ptr() as usize;

    match CellRegistry::global().claim(address, None, Some(origin)) {
        Ok(_) => unsafe { origin.free_unchecked(cell) },
        Err(Rejection::Mismatched { cell_origin }) => {
            tracing::warn!(address, %cell_origin, %origin, "refusing to free a cell from another heap");
        }
        Err(rejection) => {
            tracing::warn!(address, %origin, ?rejection, "refusing to free a cell that is not live");
        }
    }
}

/// Allocates an `int` on the C heap holding 2. Release it with
/// `take_ownership(i, free_memory)`. Returns null if `malloc` fails.
#[unsafe(no_mangle)]
pub extern "C" fn make_memory() -> *mut c_int {
    hand_out(Origin::C, DEFAULT_CELL_VALUE)
}

/// Allocates an `int` on the Rust heap. Release it with
/// `take_ownership(i, drop_pointer)`.
#[unsafe(no_mangle)]
pub extern "C" fn make_boxed_memory(value: c_int) -> *mut c_int {
    hand_out(Origin::Rust, value)
}

/// Reads and reports the value held by `i`, then releases it through `dtor`.
///
/// The value is written to stdout as `got <value>`. Returns `0` on success
/// or a negative status code; see `ffibridge_status_message`. On a
/// mismatched destructor nothing is freed and the caller still owns `i`.
///
/// # Safety
///
/// `i` must be null or a pointer obtained from `make_memory` or
/// `make_boxed_memory`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn take_ownership(i: *mut c_int, dtor: Option<RawDestructor>) -> c_int {
    match unsafe { ownership::take_raw(CellRegistry::global(), i, dtor) } {
        Ok(value) => {
            report_value(&mut io::stdout().lock(), value);
            InteropStatus::Ok.code()
        }
        Err(err) => {
            tracing::warn!(error = %err, "take_ownership refused");
            err.status().code()
        }
    }
}

fn report_value<W: Write>(out: &mut W, value: c_int) {
    // a closed stdout must not unwind into the host
    if let Err(err) = writeln!(out, "got {value}").and_then(|()| out.flush()) {
        tracing::warn!(error = %err, value, "could not report cell value");
    }
}

/// Destructor for C-heap cells. Cells that are not live C-heap cells are
/// left alone.
///
/// # Safety
///
/// `i` must be null or a pointer obtained from `make_memory`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free_memory(i: *mut c_int) {
    unsafe { release_checked(Origin::C, i) }
}

/// Destructor for Rust-heap cells: rebuilds the `Box` and drops it. Cells
/// that are not live Rust-heap cells are left alone.
///
/// # Safety
///
/// `i` must be null or a pointer obtained from `make_boxed_memory`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn drop_pointer(i: *mut c_int) {
    unsafe { release_checked(Origin::Rust, i) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_make_and_take_through_c_abi() {
        let i = make_memory();
        assert!(!i.is_null());
        assert_eq!(unsafe { *i }, 2);

        let status = unsafe { take_ownership(i, Some(free_memory)) };
        assert_eq!(status, InteropStatus::Ok.code());
        assert!(!CellRegistry::global().is_live(i as usize));
    }

    #[test]
    #[serial]
    fn test_double_take_is_rejected() {
        let i = make_memory();
        assert_eq!(unsafe { take_ownership(i, Some(free_memory)) }, 0);

        let status = unsafe { take_ownership(i, Some(free_memory)) };
        assert_eq!(status, InteropStatus::UseAfterFree.code());
    }

    #[test]
    #[serial]
    fn test_wrong_heap_destructor_is_rejected() {
        let i = make_boxed_memory(7);

        let status = unsafe { take_ownership(i, Some(free_memory)) };
        assert_eq!(status, InteropStatus::MismatchedDeallocator.code());
        assert!(CellRegistry::global().is_live(i as usize));

        assert_eq!(unsafe { take_ownership(i, Some(drop_pointer)) }, 0);
    }

    #[test]
    #[serial]
    fn test_missing_destructor() {
        let i = make_memory();
        assert_eq!(
            unsafe { take_ownership(i, None) },
            InteropStatus::NullDestructor.code()
        );
        assert_eq!(unsafe { take_ownership(i, Some(free_memory)) }, 0);
    }

    #[test]
    #[serial]
    fn test_stale_record_is_replaced() {
        let registry = CellRegistry::global();
        let i = make_memory();
        let stale = registry.lookup(i as usize).unwrap();

        // released behind the bridge's back
        unsafe { libc::free(i.cast()) };

        let j = make_memory();
        if j == i {
            let record = registry.lookup(j as usize).unwrap();
            assert_eq!(record.origin, Origin::C);
            assert_ne!(record.generation, stale.generation);
        } else {
            registry.forget(i as usize);
        }
        assert_eq!(unsafe { take_ownership(j, Some(free_memory)) }, 0);
    }

    #[test]
    #[serial]
    fn test_direct_destructor_call_retires_record() {
        let i = make_boxed_memory(1);
        unsafe { drop_pointer(i) };
        assert!(!CellRegistry::global().is_live(i as usize));

        unsafe {
            free_memory(ptr::null_mut());
            drop_pointer(ptr::null_mut());
        }
    }

    #[test]
    #[serial]
    fn test_second_direct_free_is_refused() {
        let i = make_memory();
        unsafe { free_memory(i) };
        assert!(!CellRegistry::global().is_live(i as usize));

        // no record left, so nothing is freed again
        unsafe { free_memory(i) };
        assert!(!CellRegistry::global().is_live(i as usize));
    }

    #[test]
    #[serial]
    fn test_drop_pointer_refuses_c_heap_cell() {
        let i = make_memory();
        unsafe { drop_pointer(i) };
        assert!(CellRegistry::global().is_live(i as usize));
        assert_eq!(unsafe { *i }, 2);

        unsafe { free_memory(i) };
        assert!(!CellRegistry::global().is_live(i as usize));
    }

    #[test]
    #[serial]
    fn test_free_memory_refuses_rust_heap_cell() {
        let i = make_boxed_memory(3);
        unsafe { free_memory(i) };
        assert!(CellRegistry::global().is_live(i as usize));

        assert_eq!(unsafe { take_ownership(i, Some(drop_pointer)) }, 0);
    }

    #[test]
    fn test_report_value_format() {
        let mut out = Vec::new();
        report_value(&mut out, 2);
        report_value(&mut out, -7);
        assert_eq!(String::from_utf8(out).unwrap(), "got 2\ngot -7\n");
    }
}
