//! Error taxonomy for the simulation engine.
//!
//! The variants mirror a flat, frozen, signed-integer error-code ABI:
//! `0` is success (represented by `Ok`), and each variant below owns a
//! stable negative code partitioned into ranges — generic (`-1..-14`),
//! device (`-100..-106`), memory (`-200..-203`), monitor (`-300..-302`),
//! action (`-400..-402`), rule (`-500..-502`). The ABI is additive only:
//! never renumber an existing variant.

use thiserror::Error;

/// Result alias used throughout the crate's public API.
pub type PhyResult<T> = Result<T, PhyError>;

/// A single frozen error code, rendered through `Display` for the stable
/// string table and through [`PhyError::code`] for the stable integer ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PhyError {
    #[error("invalid parameter")]
    InvalidParam,
    #[error("out of memory")]
    OutOfMemory,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("not supported")]
    NotSupported,
    #[error("permission denied")]
    Permission,
    #[error("operation timed out")]
    Timeout,
    #[error("resource busy")]
    Busy,
    #[error("i/o error")]
    Io,
    #[error("internal error")]
    Internal,
    #[error("mutex initialization failed")]
    MutexInitFailed,
    #[error("mutex destroy failed")]
    MutexDestroyFailed,
    #[error("mutex lock failed")]
    MutexLockFailed,
    #[error("mutex unlock failed")]
    MutexUnlockFailed,

    #[error("device type not found")]
    DeviceTypeNotFound,
    #[error("device not found")]
    DeviceNotFound,
    #[error("device create failed")]
    DeviceCreateFailed,
    #[error("device destroy failed")]
    DeviceDestroyFailed,
    #[error("device reset failed")]
    DeviceResetFailed,
    #[error("device save-state failed")]
    DeviceSaveStateFailed,
    #[error("device load-state failed")]
    DeviceLoadStateFailed,

    #[error("memory region not found")]
    MemoryRegionNotFound,
    #[error("memory access out of range")]
    MemoryOutOfRange,
    #[error("memory access permission error")]
    MemoryPermission,
    #[error("memory access alignment error")]
    MemoryAlignment,

    #[error("watchpoint not found")]
    WatchpointNotFound,
    #[error("watchpoint limit exceeded")]
    WatchpointLimit,
    #[error("invalid watchpoint type")]
    WatchpointInvalidType,

    #[error("action not found")]
    ActionNotFound,
    #[error("action execution failed")]
    ActionExecuteFailed,
    #[error("invalid action type")]
    ActionInvalidType,

    #[error("rule not found")]
    RuleNotFound,
    #[error("rule condition evaluation failed")]
    RuleConditionFailed,
    #[error("rule action execution failed")]
    RuleActionFailed,
}

impl PhyError {
    /// The stable, frozen integer ABI value for this error.
    pub const fn code(self) -> i32 {
        match self {
            PhyError::InvalidParam => -1,
            PhyError::OutOfMemory => -2,
            PhyError::NotFound => -3,
            PhyError::AlreadyExists => -4,
            PhyError::NotSupported => -5,
            PhyError::Permission => -6,
            PhyError::Timeout => -7,
            PhyError::Busy => -8,
            PhyError::Io => -9,
            PhyError::Internal => -10,
            PhyError::MutexInitFailed => -11,
            PhyError::MutexDestroyFailed => -12,
            PhyError::MutexLockFailed => -13,
            PhyError::MutexUnlockFailed => -14,

            PhyError::DeviceTypeNotFound => -100,
            PhyError::DeviceNotFound => -101,
            PhyError::DeviceCreateFailed => -102,
            PhyError::DeviceDestroyFailed => -103,
            PhyError::DeviceResetFailed => -104,
            PhyError::DeviceSaveStateFailed => -105,
            PhyError::DeviceLoadStateFailed => -106,

            PhyError::MemoryRegionNotFound => -200,
            PhyError::MemoryOutOfRange => -201,
            PhyError::MemoryPermission => -202,
            PhyError::MemoryAlignment => -203,

            PhyError::WatchpointNotFound => -300,
            PhyError::WatchpointLimit => -301,
            PhyError::WatchpointInvalidType => -302,

            PhyError::ActionNotFound => -400,
            PhyError::ActionExecuteFailed => -401,
            PhyError::ActionInvalidType => -402,

            PhyError::RuleNotFound => -500,
            PhyError::RuleConditionFailed => -501,
            PhyError::RuleActionFailed => -502,
        }
    }
}
