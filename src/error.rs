use std::ffi::{CStr, c_char, c_int};

use thiserror::Error;

use crate::ownership::{Origin, OwnedCell};

/// Errors reported by the checked ownership and layout paths.
#[derive(Debug, Error)]
pub enum InteropError {
    #[error("{origin} allocator could not provide an integer cell")]
    AllocationFailure { origin: Origin },

    #[error("cell at {address:#x} was already released")]
    UseAfterFree { address: usize },

    #[error("cell at {address:#x} is generation {found}, handle expected generation {expected}")]
    StaleHandle {
        address: usize,
        expected: u64,
        found: u64,
    },

    /// The cell is handed back untouched so it can still be released through
    /// its own origin. Raw C ABI callers keep their pointer instead.
    #[error(
        "cell allocated by the {cell_origin} heap cannot be released by {}",
        describe_destructor(.destructor_origin)
    )]
    MismatchedDeallocator {
        cell_origin: Origin,
        destructor_origin: Option<Origin>,
        cell: Option<Box<OwnedCell>>,
    },

    #[error("cell at {address:#x} already has an owner")]
    AlreadyOwned { address: usize },

    #[error("no destructor was supplied for the cell")]
    NullDestructor,

    #[error("layout of `{type_name}` disagrees on {detail}")]
    LayoutMismatch { type_name: String, detail: String },
}

fn describe_destructor(origin: &Option<Origin>) -> String {
    match origin {
        Some(origin) => format!("a {origin} destructor"),
        None => "an unrecognised destructor".to_string(),
    }
}

impl InteropError {
    pub fn status(&self) -> InteropStatus {
        match self {
            InteropError::AllocationFailure { .. } => InteropStatus::AllocationFailure,
            InteropError::UseAfterFree { .. } | InteropError::StaleHandle { .. } => {
                InteropStatus::UseAfterFree
            }
            InteropError::MismatchedDeallocator { .. } => InteropStatus::MismatchedDeallocator,
            InteropError::AlreadyOwned { .. } => InteropStatus::AlreadyOwned,
            InteropError::NullDestructor => InteropStatus::NullDestructor,
            InteropError::LayoutMismatch { .. } => InteropStatus::LayoutMismatch,
        }
    }
}

pub type InteropResult<T> = Result<T, InteropError>;

/// Status codes returned across the C ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteropStatus {
    Ok = 0,
    UseAfterFree = -1,
    MismatchedDeallocator = -2,
    NullDestructor = -3,
    AllocationFailure = -4,
    LayoutMismatch = -5,
    AlreadyOwned = -6,
}

impl InteropStatus {
    pub const ALL: [InteropStatus; 7] = [
        InteropStatus::Ok,
        InteropStatus::UseAfterFree,
        InteropStatus::MismatchedDeallocator,
        InteropStatus::NullDestructor,
        InteropStatus::AllocationFailure,
        InteropStatus::LayoutMismatch,
        InteropStatus::AlreadyOwned,
    ];

    pub fn code(self) -> c_int {
        self as c_int
    }

    pub fn from_code(code: c_int) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            InteropStatus::Ok => "FFIBRIDGE_OK",
            InteropStatus::UseAfterFree => "FFIBRIDGE_USE_AFTER_FREE",
            InteropStatus::MismatchedDeallocator => "FFIBRIDGE_MISMATCHED_DEALLOCATOR",
            InteropStatus::NullDestructor => "FFIBRIDGE_NULL_DESTRUCTOR",
            InteropStatus::AllocationFailure => "FFIBRIDGE_ALLOCATION_FAILURE",
            InteropStatus::LayoutMismatch => "FFIBRIDGE_LAYOUT_MISMATCH",
            InteropStatus::AlreadyOwned => "FFIBRIDGE_ALREADY_OWNED",
        }
    }

    pub fn message(self) -> &'static CStr {
        match self {
            InteropStatus::Ok => c"ok",
            InteropStatus::UseAfterFree => c"cell was already released",
            InteropStatus::MismatchedDeallocator => c"destructor does not match the cell's allocator",
            InteropStatus::NullDestructor => c"no destructor supplied",
            InteropStatus::AllocationFailure => c"allocation failed",
            InteropStatus::LayoutMismatch => c"boundary layout mismatch",
            InteropStatus::AlreadyOwned => c"cell already has an owner",
        }
    }
}

/// Static, NUL-terminated description of a status code returned by
/// `take_ownership`. Unknown codes yield `"unknown status"`.
#[unsafe(no_mangle)]
pub extern "C" fn ffibridge_status_message(code: c_int) -> *const c_char {
    InteropStatus::from_code(code)
        .map(InteropStatus::message)
        .unwrap_or(c"unknown status")
        .as_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for status in InteropStatus::ALL {
            assert_eq!(InteropStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(InteropStatus::from_code(42), None);
    }

    #[test]
    fn test_status_message_for_unknown_code() {
        let message = unsafe { CStr::from_ptr(ffibridge_status_message(42)) };
        assert_eq!(message.to_str().unwrap(), "unknown status");

        let message = unsafe { CStr::from_ptr(ffibridge_status_message(-1)) };
        assert_eq!(message.to_str().unwrap(), "cell was already released");
    }

    #[test]
    fn test_stale_handle_reports_as_use_after_free() {
        let err = InteropError::StaleHandle {
            address: 0x10,
            expected: 1,
            found: 2,
        };
        assert_eq!(err.status(), InteropStatus::UseAfterFree);
        assert!(err.to_string().contains("0x10"));
    }
}
