//! Ownership hand-off of a single heap `int` across the C boundary.
//!
//! A cell is allocated by one of two heaps: the Rust global allocator or the C
//! allocator (`malloc`). Whoever receives the cell must release it exactly
//! once through the destructor of that same heap. [`CellRegistry`] records
//! every live cell so that a second release, or a release through the wrong
//! destructor, is reported instead of corrupting memory.

use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::ffi::c_int;
use std::fmt;
use std::mem::{self, ManuallyDrop};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::{InteropError, InteropResult};
use crate::ffi::{RawDestructor, drop_pointer, free_memory};

/// Value `make_memory` initialises its cell with.
pub const DEFAULT_CELL_VALUE: c_int = 2;

/// Heap a cell was allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Rust global allocator; released through `drop_pointer`.
    Rust,
    /// C allocator; released through `free_memory`.
    C,
}

impl Origin {
    fn cell_layout() -> Layout {
        Layout::new::<c_int>()
    }

    /// Allocates and initialises a cell. Returns null when the heap is
    /// exhausted.
    pub(crate) fn allocate_raw(self, value: c_int) -> *mut c_int {
        let cell = match self {
            Origin::Rust => unsafe { alloc::alloc(Self::cell_layout()) }.cast::<c_int>(),
            Origin::C => unsafe { libc::malloc(mem::size_of::<c_int>()) }.cast::<c_int>(),
        };
        if !cell.is_null() {
            unsafe { cell.write(value) };
        }
        cell
    }

    /// Returns a cell to the heap it came from without consulting any
    /// registry.
    ///
    /// # Safety
    ///
    /// `cell` must be live, allocated by this heap, and already claimed from
    /// the registry tracking it.
    pub(crate) unsafe fn free_unchecked(self, cell: NonNull<c_int>) {
        match self {
            Origin::Rust => drop(unsafe { Box::from_raw(cell.as_ptr()) }),
            Origin::C => unsafe { libc::free(cell.as_ptr().cast()) },
        }
    }

    /// The exported destructor that matches this heap.
    pub fn destructor(self) -> Destructor {
        Destructor {
            func: self.raw_destructor(),
            origin: Some(self),
        }
    }

    pub fn raw_destructor(self) -> RawDestructor {
        match self {
            Origin::Rust => drop_pointer,
            Origin::C => free_memory,
        }
    }

    /// Identifies one of the exported destructors. Any other function is
    /// unknown and yields `None`.
    pub fn of_destructor(func: RawDestructor) -> Option<Origin> {
        [Origin::Rust, Origin::C]
            .into_iter()
            .find(|origin| ptr::fn_addr_eq(func, origin.raw_destructor()))
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Rust => f.write_str("Rust"),
            Origin::C => f.write_str("C"),
        }
    }
}

/// Releases a cell. Implemented by the allocating side and invoked exactly
/// once by the receiving side.
///
/// # Safety
///
/// [`Release::origin`] is trusted: when it returns `Some(origin)`,
/// [`Release::release`] must free into that heap and nothing else.
///
/// ```compile_fail
/// use std::ffi::c_int;
/// use std::ptr::NonNull;
/// use ffibridge::{Origin, Release};
///
/// struct Liar;
///
/// impl Release for Liar {
///     fn origin(&self) -> Option<Origin> {
///         Some(Origin::C)
///     }
///
///     unsafe fn release(&self, _cell: NonNull<c_int>) {}
/// }
/// ```
pub unsafe trait Release {
    /// Heap this release path frees into, if known.
    fn origin(&self) -> Option<Origin>;

    /// # Safety
    ///
    /// `cell` must be live, allocated by [`Release::origin`], and never used
    /// again after this call.
    unsafe fn release(&self, cell: NonNull<c_int>);
}

/// A C function-pointer destructor together with the heap it frees into.
#[derive(Clone, Copy)]
pub struct Destructor {
    func: RawDestructor,
    origin: Option<Origin>,
}

impl Destructor {
    /// Wraps a raw function pointer. The origin is recognised for the
    /// exported destructors only.
    pub fn from_raw(func: RawDestructor) -> Self {
        Self {
            func,
            origin: Origin::of_destructor(func),
        }
    }

    /// # Safety
    ///
    /// `func` must free memory allocated by `origin`.
    pub unsafe fn with_origin(func: RawDestructor, origin: Origin) -> Self {
        Self {
            func,
            origin: Some(origin),
        }
    }
}

impl fmt::Debug for Destructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destructor")
            .field("func", &(self.func as *const ()))
            .field("origin", &self.origin)
            .finish()
    }
}

// SAFETY: the origin is either recognised from the exported destructors or
// vouched for by the caller of `with_origin`.
unsafe impl Release for Destructor {
    fn origin(&self) -> Option<Origin> {
        self.origin
    }

    /// The exported destructors check the global registry themselves, so a
    /// cell that has already been claimed is freed directly.
    unsafe fn release(&self, cell: NonNull<c_int>) {
        match Origin::of_destructor(self.func) {
            Some(origin) => unsafe { origin.free_unchecked(cell) },
            None => unsafe { (self.func)(cell.as_ptr()) },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRecord {
    pub origin: Origin,
    pub generation: u64,
}

/// Why a release was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    Released,
    Stale { found: u64 },
    Mismatched { cell_origin: Origin },
}

/// Live cells by address.
///
/// A record is removed before the cell is freed, so two concurrent releases
/// of the same address cannot both succeed.
pub struct CellRegistry {
    cells: Mutex<BTreeMap<usize, CellRecord>>,
    next_generation: AtomicU64,
}

static GLOBAL_REGISTRY: CellRegistry = CellRegistry::new();

impl CellRegistry {
    pub const fn new() -> Self {
        Self {
            cells: Mutex::new(BTreeMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Registry behind the C ABI entry points.
    pub fn global() -> &'static CellRegistry {
        &GLOBAL_REGISTRY
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<usize, CellRecord>> {
        match self.cells.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                // every critical section is a single insert or remove
                tracing::warn!("cell registry mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Records a freshly owned cell and returns its generation.
    pub fn register(&self, address: usize, origin: Origin) -> InteropResult<u64> {
        let mut cells = self.lock();
        if cells.contains_key(&address) {
            return Err(InteropError::AlreadyOwned { address });
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        cells.insert(address, CellRecord { origin, generation });
        Ok(generation)
    }

    pub fn lookup(&self, address: usize) -> Option<CellRecord> {
        self.lock().get(&address).copied()
    }

    pub fn is_live(&self, address: usize) -> bool {
        self.lookup(address).is_some()
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    /// Removes the record if the release is acceptable. A mismatched
    /// destructor leaves the record in place.
    pub(crate) fn claim(
        &self,
        address: usize,
        generation: Option<u64>,
        destructor_origin: Option<Origin>,
    ) -> Result<CellRecord, Rejection> {
        let mut cells = self.lock();
        let record = *cells.get(&address).ok_or(Rejection::Released)?;
        if let Some(expected) = generation {
            if record.generation != expected {
                return Err(Rejection::Stale {
                    found: record.generation,
                });
            }
        }
        if destructor_origin != Some(record.origin) {
            return Err(Rejection::Mismatched {
                cell_origin: record.origin,
            });
        }
        cells.remove(&address);
        Ok(record)
    }

    /// Drops the record for `address` if there is one.
    pub(crate) fn forget(&self, address: usize) -> Option<CellRecord> {
        self.lock().remove(&address)
    }
}

impl Default for CellRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Owning handle to one heap `int`.
///
/// Not `Clone`: moving the handle moves ownership. Dropping a handle that was
/// never passed to [`take_ownership`] releases the cell through its own heap.
pub struct OwnedCell {
    cell: NonNull<c_int>,
    origin: Origin,
    generation: u64,
    registry: &'static CellRegistry,
}

// SAFETY: the handle is the sole owner of its allocation, and shared access
// only ever reads the integer.
unsafe impl Send for OwnedCell {}
unsafe impl Sync for OwnedCell {}

impl OwnedCell {
    /// Allocates a cell on `origin`'s heap, tracked by the global registry.
    pub fn allocate(origin: Origin, value: c_int) -> InteropResult<Self> {
        Self::allocate_in(CellRegistry::global(), origin, value)
    }

    pub fn allocate_in(
        registry: &'static CellRegistry,
        origin: Origin,
        value: c_int,
    ) -> InteropResult<Self> {
        let cell = origin.allocate_raw(value);
        let owned = unsafe { Self::adopt_in(registry, cell, origin) }?;
        tracing::debug!(address = owned.address(), %origin, value, "allocated cell");
        Ok(owned)
    }

    /// Rust-heap cell, the counterpart of handing a `Box` to C.
    pub fn boxed(value: c_int) -> InteropResult<Self> {
        Self::allocate(Origin::Rust, value)
    }

    /// Takes ownership of a cell allocated elsewhere. A null pointer is the
    /// allocator's failure signal and is reported as such.
    ///
    /// # Safety
    ///
    /// A non-null `cell` must be a live, initialised `int` allocated by
    /// `origin` with no other owner.
    pub unsafe fn adopt(cell: *mut c_int, origin: Origin) -> InteropResult<Self> {
        unsafe { Self::adopt_in(CellRegistry::global(), cell, origin) }
    }

    /// # Safety
    ///
    /// Same contract as [`OwnedCell::adopt`].
    pub unsafe fn adopt_in(
        registry: &'static CellRegistry,
        cell: *mut c_int,
        origin: Origin,
    ) -> InteropResult<Self> {
        let cell = NonNull::new(cell).ok_or(InteropError::AllocationFailure { origin })?;
        let generation = registry.register(cell.as_ptr() as usize, origin)?;
        Ok(Self {
            cell,
            origin,
            generation,
            registry,
        })
    }

    /// Rebuilds a handle from [`OwnedCell::into_raw_parts`].
    ///
    /// # Safety
    ///
    /// The parts must come from `into_raw_parts` on a handle tracked by
    /// `registry`, and no other handle for them may exist.
    pub unsafe fn from_raw_parts(
        registry: &'static CellRegistry,
        cell: NonNull<c_int>,
        generation: u64,
    ) -> InteropResult<Self> {
        let address = cell.as_ptr() as usize;
        let record = registry
            .lookup(address)
            .ok_or(InteropError::UseAfterFree { address })?;
        if record.generation != generation {
            return Err(InteropError::StaleHandle {
                address,
                expected: generation,
                found: record.generation,
            });
        }
        Ok(Self {
            cell,
            origin: record.origin,
            generation,
            registry,
        })
    }

    /// Gives up the handle without releasing. The registry keeps the record,
    /// so the cell can still be released once through the C ABI.
    pub fn into_raw_parts(self) -> (NonNull<c_int>, u64) {
        let this = ManuallyDrop::new(self);
        (this.cell, this.generation)
    }

    pub fn into_raw(self) -> *mut c_int {
        self.into_raw_parts().0.as_ptr()
    }

    pub fn value(&self) -> c_int {
        unsafe { *self.cell.as_ptr() }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn address(&self) -> usize {
        self.cell.as_ptr() as usize
    }
}

impl fmt::Debug for OwnedCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedCell")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("origin", &self.origin)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for OwnedCell {
    fn drop(&mut self) {
        let address = self.address();
        match self
            .registry
            .claim(address, Some(self.generation), Some(self.origin))
        {
            Ok(_) => {
                tracing::debug!(address, origin = %self.origin, "releasing unclaimed cell on drop");
                unsafe { self.origin.free_unchecked(self.cell) };
            }
            Err(rejection) => {
                tracing::warn!(address, ?rejection, "dropped handle no longer owns its cell");
            }
        }
    }
}

/// Allocates a C-heap cell holding [`DEFAULT_CELL_VALUE`].
pub fn make_memory() -> InteropResult<OwnedCell> {
    OwnedCell::allocate(Origin::C, DEFAULT_CELL_VALUE)
}

/// Reads the cell, reports the value, then frees it through `destructor`.
///
/// The destructor must match the cell's heap. If it does not, nothing is
/// freed and the cell comes back inside
/// [`InteropError::MismatchedDeallocator`].
pub fn take_ownership<D>(cell: OwnedCell, destructor: &D) -> InteropResult<c_int>
where
    D: Release + ?Sized,
{
    let cell = ManuallyDrop::new(cell);
    let address = cell.address();

    match cell
        .registry
        .claim(address, Some(cell.generation), destructor.origin())
    {
        Ok(record) => {
            let value = cell.value();
            tracing::info!(address, origin = %record.origin, value, "took ownership of cell");
            unsafe { destructor.release(cell.cell) };
            Ok(value)
        }
        Err(Rejection::Mismatched { cell_origin }) => {
            tracing::warn!(
                address,
                %cell_origin,
                destructor_origin = ?destructor.origin(),
                "refusing release through a mismatched destructor"
            );
            Err(InteropError::MismatchedDeallocator {
                cell_origin,
                destructor_origin: destructor.origin(),
                cell: Some(Box::new(ManuallyDrop::into_inner(cell))),
            })
        }
        Err(Rejection::Stale { found }) => Err(InteropError::StaleHandle {
            address,
            expected: cell.generation,
            found,
        }),
        Err(Rejection::Released) => Err(InteropError::UseAfterFree { address }),
    }
}

/// Frees a cell through a raw destructor, reporting the value it held.
///
/// This is the checked body of the exported `take_ownership`.
///
/// # Safety
///
/// `cell` must be null or point to memory that is either live or was
/// previously released through this registry.
pub(crate) unsafe fn take_raw(
    registry: &CellRegistry,
    cell: *mut c_int,
    destructor: Option<RawDestructor>,
) -> InteropResult<c_int> {
    let destructor = destructor.map(Destructor::from_raw).ok_or(InteropError::NullDestructor)?;
    let Some(cell) = NonNull::new(cell) else {
        return Err(InteropError::AllocationFailure {
            origin: destructor.origin().unwrap_or(Origin::C),
        });
    };
    let address = cell.as_ptr() as usize;

    match registry.claim(address, None, destructor.origin()) {
        Ok(record) => {
            let value = unsafe { *cell.as_ptr() };
            tracing::info!(address, origin = %record.origin, value, "took ownership of cell");
            unsafe { destructor.release(cell) };
            Ok(value)
        }
        Err(Rejection::Mismatched { cell_origin }) => {
            tracing::warn!(
                address,
                %cell_origin,
                destructor_origin = ?destructor.origin(),
                "refusing release through a mismatched destructor"
            );
            // still registered; the caller keeps ownership of the raw pointer
            Err(InteropError::MismatchedDeallocator {
                cell_origin,
                destructor_origin: destructor.origin(),
                cell: None,
            })
        }
        Err(Rejection::Stale { .. }) | Err(Rejection::Released) => {
            tracing::warn!(address, "refusing release of a cell that is not live");
            Err(InteropError::UseAfterFree { address })
        }
    }
}
