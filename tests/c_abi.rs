//! The exported symbols, called the way a C host calls them.

use std::ffi::{CStr, c_int};
use std::ptr;

use ffibridge::error::ffibridge_status_message;
use ffibridge::ffi::{drop_pointer, free_memory, make_boxed_memory, make_memory, take_ownership};
use ffibridge::{CellRegistry, InteropError, InteropStatus, Origin, OwnedCell, Point, dist};
use serial_test::serial;

fn status_message(code: c_int) -> String {
    unsafe { CStr::from_ptr(ffibridge_status_message(code)) }
        .to_string_lossy()
        .into_owned()
}

#[test]
fn test_host_entry_point_sample() {
    let p1 = Point { x: 1, y: 0 };
    let p2 = Point { x: 0, y: 1 };
    let p1_ptr: *const Point = &p1;
    let p2_ptr: *const Point = &p2;

    let ret = dist(unsafe { p1_ptr.as_ref() }, unsafe { p2_ptr.as_ref() });
    assert_eq!(format!("{ret:.6}"), "1.414214");
}

#[test]
#[serial]
fn test_c_heap_cell_handed_to_rust() {
    let i = make_memory();
    assert!(!i.is_null());
    assert_eq!(unsafe { *i }, 2);

    assert_eq!(unsafe { take_ownership(i, Some(free_memory)) }, InteropStatus::Ok.code());
}

#[test]
#[serial]
fn test_rust_box_handed_to_c_with_drop_pointer() {
    let i = make_boxed_memory(1);
    assert_eq!(unsafe { *i }, 1);

    assert_eq!(unsafe { take_ownership(i, Some(drop_pointer)) }, 0);
    assert!(!CellRegistry::global().is_live(i as usize));
}

#[test]
#[serial]
fn test_double_free_is_reported() {
    let i = make_memory();
    assert_eq!(unsafe { take_ownership(i, Some(free_memory)) }, 0);

    let status = unsafe { take_ownership(i, Some(free_memory)) };
    assert_eq!(status, InteropStatus::UseAfterFree.code());
    assert_eq!(status_message(status), "cell was already released");
}

#[test]
#[serial]
fn test_mismatched_destructor_is_reported() {
    let i = make_memory();

    let status = unsafe { take_ownership(i, Some(drop_pointer)) };
    assert_eq!(status, InteropStatus::MismatchedDeallocator.code());
    assert_eq!(unsafe { *i }, 2, "refused cell must still be readable");

    assert_eq!(unsafe { take_ownership(i, Some(free_memory)) }, 0);
}

#[test]
#[serial]
fn test_unregistered_pointer_is_not_freed() {
    let mut local: c_int = 5;
    let status = unsafe { take_ownership(&mut local, Some(free_memory)) };
    assert_eq!(status, InteropStatus::UseAfterFree.code());
    assert_eq!(local, 5);

    assert_eq!(
        unsafe { take_ownership(ptr::null_mut(), Some(free_memory)) },
        InteropStatus::AllocationFailure.code()
    );
}

#[test]
#[serial]
fn test_foreign_malloc_adopted_by_safe_api() {
    let raw = unsafe { libc::malloc(std::mem::size_of::<c_int>()) }.cast::<c_int>();
    assert!(!raw.is_null());
    unsafe { raw.write(42) };

    let cell = unsafe { OwnedCell::adopt(raw, Origin::C) }.unwrap();
    assert!(matches!(
        unsafe { OwnedCell::adopt(raw, Origin::C) },
        Err(InteropError::AlreadyOwned { .. })
    ));

    assert_eq!(ffibridge::take_ownership(cell, &Origin::C.destructor()).unwrap(), 42);
}

#[test]
#[serial]
fn test_safe_handle_crosses_into_c_abi() {
    let cell = ffibridge::make_memory().unwrap();
    let raw = cell.into_raw();

    assert_eq!(unsafe { take_ownership(raw, Some(free_memory)) }, 0);
    assert!(!CellRegistry::global().is_live(raw as usize));
}
