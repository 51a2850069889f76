//! Status codes reported by kernels and the host-facing error types.
//!
//! Kernels never return `Result`: every lane carries a private [`ErrorCode`]
//! and the group folds it into the shared status word of the result buffer.
//! The host then turns that word into a [`JoinError`].

use thiserror::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum ErrorCode {
    #[default]
    Success = 0,
    /// This combination must be re-validated by the host executor.
    CpuReCheck = 1,
    /// A structural precondition of the layout or store format failed.
    DataStoreCorruption = 100,
    /// The result buffer or destination store is too small.
    DataStoreNoSpace = 101,
}

impl ErrorCode {
    #[inline(always)]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Unknown codes are treated as corruption.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::CpuReCheck,
            101 => Self::DataStoreNoSpace,
            _ => Self::DataStoreCorruption,
        }
    }

    #[inline(always)]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Record `code` unless an error is already recorded. A pending recheck
    /// only gives way to an aggregated error.
    #[inline(always)]
    pub fn set(&mut self, code: ErrorCode) {
        if self.is_success() || (*self == Self::CpuReCheck && code.is_aggregated()) {
            *self = code;
        }
    }

    /// Codes that are folded into the shared status word. A recheck stays
    /// on the affected combination.
    #[inline(always)]
    pub fn is_aggregated(self) -> bool {
        matches!(self, Self::DataStoreCorruption | Self::DataStoreNoSpace)
    }
}

/// Violation of the binary layout detected by a bounds-checked accessor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("range {offset}..{offset}+{len} exceeds region of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("offset {offset} is not aligned to {align}")]
    Misaligned { offset: usize, align: usize },
    #[error("depth {depth} is not a valid inner table (ntables = {ntables})")]
    InvalidDepth { depth: usize, ntables: usize },
    #[error("hash chain in bucket {slot} does not terminate")]
    ChainCycle { slot: usize },
    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },
}

impl LayoutError {
    pub(crate) fn malformed(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            what,
            detail: detail.into(),
        }
    }
}

/// Errors surfaced to the caller of the join engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("data store corruption: {0}")]
    Corruption(String),
    #[error("no space: {required} items required, {capacity} available")]
    NoSpace { required: u64, capacity: u64 },
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

impl JoinError {
    /// A no-space error is resolved by enlarging the buffer and running the
    /// whole count/emit sequence again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoSpace { .. })
    }
}

pub type Result<T, E = JoinError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let mut code = ErrorCode::Success;
        code.set(ErrorCode::DataStoreNoSpace);
        code.set(ErrorCode::DataStoreCorruption);
        assert_eq!(code, ErrorCode::DataStoreNoSpace);
        code.set(ErrorCode::CpuReCheck);
        assert_eq!(code, ErrorCode::DataStoreNoSpace);

        let mut lane = ErrorCode::Success;
        lane.set(ErrorCode::CpuReCheck);
        lane.set(ErrorCode::CpuReCheck);
        assert_eq!(lane, ErrorCode::CpuReCheck);
        lane.set(ErrorCode::DataStoreCorruption);
        assert_eq!(lane, ErrorCode::DataStoreCorruption);
    }

    #[test]
    fn code_round_trip() {
        for code in [
            ErrorCode::Success,
            ErrorCode::CpuReCheck,
            ErrorCode::DataStoreCorruption,
            ErrorCode::DataStoreNoSpace,
        ] {
            assert_eq!(ErrorCode::from_code(code.code()), code);
        }
        assert_eq!(ErrorCode::from_code(-7), ErrorCode::DataStoreCorruption);
    }

    #[test]
    fn recheck_is_not_aggregated() {
        assert!(!ErrorCode::CpuReCheck.is_aggregated());
        assert!(!ErrorCode::Success.is_aggregated());
        assert!(ErrorCode::DataStoreNoSpace.is_aggregated());
    }

    #[test]
    fn only_no_space_is_retryable() {
        let e = JoinError::NoSpace {
            required: 10,
            capacity: 4,
        };
        assert!(e.is_retryable());
        assert!(!JoinError::Corruption("x".into()).is_retryable());
        let layout: JoinError = LayoutError::ChainCycle { slot: 3 }.into();
        assert!(!layout.is_retryable());
    }
}
