//! Kernel error types
//!
//! Structured replacement for string-literal errors, grouped the way the
//! design notes describe the source taxonomy: argument, resource, state,
//! data, sync and syscall families.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Malformed call arguments.
    Argument(ArgumentError),
    /// Resource exhaustion or lookup failure.
    Resource(ResourceError),
    /// Subsystem or object in the wrong state for the requested operation.
    State(StateError),
    /// Malformed or inconsistent stored data.
    Data(DataError),
    /// Synchronization object misuse.
    Sync(SyncError),
    /// Syscall gateway errors.
    Syscall(SyscallError),
}

/// Argument-family errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentError {
    NullPointer,
    OutOfBound { value: usize, limit: usize },
    Alignment { addr: usize, align: usize },
    IncorrectValue { name: &'static str },
}

/// Resource-family errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    NoMoreFreeMemory { requested: usize },
    Malloc,
    NoSuchId { id: u64 },
    ResourceDestroyed,
}

/// State-family errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    NotInitialized { subsystem: &'static str },
    NotSupported,
    UnauthorizedAction,
    HandlerAlreadyExists,
    MappingAlreadyExists { addr: usize },
    MemoryNotMapped { addr: usize },
    InterruptAlreadyRegistered { irq: u32 },
    InterruptNotRegistered { irq: u32 },
    NoSuchIrq { irq: u32 },
    UnauthorizedInterruptLine { irq: u32 },
    ForbiddenPriority { priority: u8 },
}

/// Data-family errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataError {
    WrongSignature,
    ChecksumFailed,
    NameTooLong,
}

/// Sync-family errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    MutexUninitialized,
    SemUninitialized,
    NoMutexBlocked,
    NoSemBlocked,
}

/// Syscall gateway errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    SyscallUnknown { id: usize },
}

/// Result type alias used pervasively across the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Collapses the family+variant tree into the single negative value the
    /// syscall gateway writes into EAX on failure (§4.J, §6 "Return in
    /// EAX"). Distinct per family, not per variant: a caller that needs the
    /// exact cause reads it back through the syscall's own out-parameter
    /// rather than EAX alone.
    pub fn to_errno(self) -> i32 {
        match self {
            Self::Argument(_) => -1,
            Self::Resource(_) => -2,
            Self::State(_) => -3,
            Self::Data(_) => -4,
            Self::Sync(_) => -5,
            Self::Syscall(_) => -6,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Argument(e) => write!(f, "argument error: {e}"),
            Self::Resource(e) => write!(f, "resource error: {e}"),
            Self::State(e) => write!(f, "state error: {e}"),
            Self::Data(e) => write!(f, "data error: {e}"),
            Self::Sync(e) => write!(f, "sync error: {e}"),
            Self::Syscall(e) => write!(f, "syscall error: {e}"),
        }
    }
}

impl fmt::Display for ArgumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NullPointer => write!(f, "null pointer"),
            Self::OutOfBound { value, limit } => {
                write!(f, "value 0x{value:x} out of bound 0x{limit:x}")
            }
            Self::Alignment { addr, align } => {
                write!(f, "address 0x{addr:x} not aligned to {align}")
            }
            Self::IncorrectValue { name } => write!(f, "incorrect value for '{name}'"),
        }
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMoreFreeMemory { requested } => {
                write!(f, "no more free memory: requested {requested} bytes")
            }
            Self::Malloc => write!(f, "heap allocation failed"),
            Self::NoSuchId { id } => write!(f, "no such id {id}"),
            Self::ResourceDestroyed => write!(f, "resource destroyed while waiting on it"),
        }
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized { subsystem } => write!(f, "{subsystem} not initialized"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::UnauthorizedAction => write!(f, "unauthorized action"),
            Self::HandlerAlreadyExists => write!(f, "handler already exists for this range"),
            Self::MappingAlreadyExists { addr } => {
                write!(f, "mapping already exists at 0x{addr:x}")
            }
            Self::MemoryNotMapped { addr } => write!(f, "memory not mapped at 0x{addr:x}"),
            Self::InterruptAlreadyRegistered { irq } => {
                write!(f, "interrupt {irq} already registered")
            }
            Self::InterruptNotRegistered { irq } => write!(f, "interrupt {irq} not registered"),
            Self::NoSuchIrq { irq } => write!(f, "no such irq {irq}"),
            Self::UnauthorizedInterruptLine { irq } => {
                write!(f, "unauthorized interrupt line {irq}")
            }
            Self::ForbiddenPriority { priority } => write!(f, "forbidden priority {priority}"),
        }
    }
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongSignature => write!(f, "wrong signature"),
            Self::ChecksumFailed => write!(f, "checksum failed"),
            Self::NameTooLong => write!(f, "name too long"),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MutexUninitialized => write!(f, "mutex uninitialized"),
            Self::SemUninitialized => write!(f, "semaphore uninitialized"),
            Self::NoMutexBlocked => write!(f, "no thread blocked on mutex"),
            Self::NoSemBlocked => write!(f, "no thread blocked on semaphore"),
        }
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SyscallUnknown { id } => write!(f, "unknown syscall id {id}"),
        }
    }
}

impl From<ArgumentError> for KernelError {
    fn from(e: ArgumentError) -> Self {
        Self::Argument(e)
    }
}

impl From<ResourceError> for KernelError {
    fn from(e: ResourceError) -> Self {
        Self::Resource(e)
    }
}

impl From<StateError> for KernelError {
    fn from(e: StateError) -> Self {
        Self::State(e)
    }
}

impl From<DataError> for KernelError {
    fn from(e: DataError) -> Self {
        Self::Data(e)
    }
}

impl From<SyncError> for KernelError {
    fn from(e: SyncError) -> Self {
        Self::Sync(e)
    }
}

impl From<SyscallError> for KernelError {
    fn from(e: SyscallError) -> Self {
        Self::Syscall(e)
    }
}

/// Helper macro for building common kernel errors without spelling out the
/// family wrapper at every call site.
#[macro_export]
macro_rules! kernel_error {
    (NoMoreFreeMemory { requested: $req:expr }) => {
        $crate::error::KernelError::Resource($crate::error::ResourceError::NoMoreFreeMemory {
            requested: $req,
        })
    };
    (NoSuchId { id: $id:expr }) => {
        $crate::error::KernelError::Resource($crate::error::ResourceError::NoSuchId { id: $id })
    };
    (Syscall :: SyscallUnknown { id: $id:expr }) => {
        $crate::error::KernelError::Syscall($crate::error::SyscallError::SyscallUnknown { id: $id })
    };
}
