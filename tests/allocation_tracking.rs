//! Net cell allocations must return to baseline after make -> take.

use std::alloc::{GlobalAlloc, Layout, System};
use std::ffi::c_int;
use std::sync::atomic::{AtomicIsize, Ordering};

use ffibridge::ffi::{drop_pointer, free_memory, make_boxed_memory, make_memory, take_ownership};
use ffibridge::{CellRegistry, Origin, OwnedCell};

/// Counts live allocations with the layout of a single `int`.
struct CellCounter;

static LIVE_CELLS: AtomicIsize = AtomicIsize::new(0);

fn is_cell(layout: Layout) -> bool {
    layout == Layout::new::<c_int>()
}

unsafe impl GlobalAlloc for CellCounter {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() && is_cell(layout) {
            LIVE_CELLS.fetch_add(1, Ordering::SeqCst);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if is_cell(layout) {
            LIVE_CELLS.fetch_sub(1, Ordering::SeqCst);
        }
        unsafe { System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static ALLOCATOR: CellCounter = CellCounter;

fn live_cells() -> isize {
    LIVE_CELLS.load(Ordering::SeqCst)
}

// One test per binary: the counter and the global registry are process-wide.
#[test]
fn test_handoff_returns_to_baseline() {
    let registry = CellRegistry::global();

    // warm up lazily allocated state (registry nodes, log callsites)
    let warm = make_boxed_memory(0);
    assert_eq!(unsafe { take_ownership(warm, Some(drop_pointer)) }, 0);

    let baseline_cells = live_cells();
    let baseline_registry = registry.live_count();

    // Rust heap, through the C ABI
    let boxed = make_boxed_memory(1);
    assert_eq!(live_cells(), baseline_cells + 1);
    assert_eq!(registry.live_count(), baseline_registry + 1);
    assert_eq!(unsafe { take_ownership(boxed, Some(drop_pointer)) }, 0);
    assert_eq!(live_cells(), baseline_cells);
    assert_eq!(registry.live_count(), baseline_registry);

    // C heap, through the C ABI; invisible to the Rust allocator
    let i = make_memory();
    assert_eq!(live_cells(), baseline_cells);
    assert_eq!(registry.live_count(), baseline_registry + 1);
    assert_eq!(unsafe { take_ownership(i, Some(free_memory)) }, 0);
    assert_eq!(registry.live_count(), baseline_registry);

    // safe API, both heaps
    for origin in [Origin::Rust, Origin::C] {
        let cell = OwnedCell::allocate(origin, 2).unwrap();
        assert_eq!(ffibridge::take_ownership(cell, &origin.destructor()).unwrap(), 2);
    }
    assert_eq!(live_cells(), baseline_cells);
    assert_eq!(registry.live_count(), baseline_registry);

    // a refused release leaves the count untouched until the right one runs
    let boxed = make_boxed_memory(3);
    assert!(unsafe { take_ownership(boxed, Some(free_memory)) } < 0);
    assert_eq!(live_cells(), baseline_cells + 1);
    assert_eq!(unsafe { take_ownership(boxed, Some(drop_pointer)) }, 0);
    assert!(unsafe { take_ownership(boxed, Some(drop_pointer)) } < 0);
    assert_eq!(live_cells(), baseline_cells);
    assert_eq!(registry.live_count(), baseline_registry);
}
