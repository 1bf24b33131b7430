//! Syscall gateway (component J, §4.J).
//!
//! The vector-0x80 entry stub is bare-metal assembly, out of scope here the
//! same way [`crate::irq::InterruptController`] abstracts over the PIC/APIC:
//! it reads EAX (syscall id) and EBX (argument-struct pointer) off the
//! trapped register image, calls [`dispatch`], and writes the return value
//! back into EAX before `iret`. Calling convention and numbering are fixed
//! by §4.J/§6.

use crate::error::{ArgumentError, KernelError, KernelResult, SyscallError};
use crate::mm::VirtAddr;
use crate::process;
use crate::sched::{self, ThreadId};
use crate::sync::{futex, FutexWaitResult};

/// The eight syscalls this gateway recognizes, in the order §4.J lists them.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallNumber {
    Fork = 0,
    Waitpid = 1,
    Exit = 2,
    FutexWait = 3,
    FutexWake = 4,
    SchedGetParams = 5,
    SchedSetParams = 6,
    PageAlloc = 7,
}

impl core::convert::TryFrom<u32> for SyscallNumber {
    type Error = ();

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        match id {
            0 => Ok(Self::Fork),
            1 => Ok(Self::Waitpid),
            2 => Ok(Self::Exit),
            3 => Ok(Self::FutexWait),
            4 => Ok(Self::FutexWake),
            5 => Ok(Self::SchedGetParams),
            6 => Ok(Self::SchedSetParams),
            7 => Ok(Self::PageAlloc),
            _ => Err(()),
        }
    }
}

#[repr(C)]
pub struct ForkArgs {
    pub entry: extern "C" fn() -> !,
    pub priority: u8,
}

#[repr(C)]
pub struct WaitpidArgs {
    pub pid: i64,
    pub status_out: *mut i32,
}

#[repr(C)]
pub struct ExitArgs {
    pub status: i32,
}

#[repr(C)]
pub struct FutexWaitArgs {
    pub addr: u32,
    pub expected: u32,
}

#[repr(C)]
pub struct FutexWakeArgs {
    pub addr: u32,
    pub count: u32,
}

#[repr(C)]
pub struct SchedGetParamsArgs {
    pub tid: u64,
    pub priority_out: *mut u8,
}

#[repr(C)]
pub struct SchedSetParamsArgs {
    pub tid: u64,
    pub priority: u8,
}

#[repr(C)]
pub struct PageAllocArgs {
    pub size: usize,
    pub read_only: bool,
    pub exec: bool,
    pub vaddr_out: *mut u32,
}

/// Entry point the vector-0x80 stub calls with EAX/EBX already extracted.
/// Returns the value to write back into EAX: non-negative on success, one
/// of [`KernelError::to_errno`]'s negative values on failure.
pub fn dispatch(syscall_id: u32, arg_ptr: usize) -> i32 {
    let result = match SyscallNumber::try_from(syscall_id) {
        Ok(number) => handle(number, arg_ptr),
        Err(()) => Err(KernelError::Syscall(SyscallError::SyscallUnknown {
            id: syscall_id as usize,
        })),
    };
    match result {
        Ok(value) => value,
        Err(e) => e.to_errno(),
    }
}

fn handle(number: SyscallNumber, arg_ptr: usize) -> KernelResult<i32> {
    match number {
        SyscallNumber::Fork => {
            let args = read_args::<ForkArgs>(arg_ptr)?;
            let pid = process::fork(args.entry, args.priority)?;
            Ok(pid.0 as i32)
        }
        SyscallNumber::Waitpid => {
            let args = read_args::<WaitpidArgs>(arg_ptr)?;
            let (child_pid, status, _cause) = process::waitpid(args.pid)?;
            if !args.status_out.is_null() {
                // SAFETY: the caller's syscall ABI promises `status_out`
                // points at writable memory in the calling thread's own
                // address space.
                unsafe { args.status_out.write(status) };
            }
            Ok(child_pid.0 as i32)
        }
        SyscallNumber::Exit => {
            let args = read_args::<ExitArgs>(arg_ptr)?;
            process::exit(args.status)
        }
        SyscallNumber::FutexWait => {
            let args = read_args::<FutexWaitArgs>(arg_ptr)?;
            if args.addr == 0 {
                return Err(KernelError::Argument(ArgumentError::NullPointer));
            }
            // SAFETY: same ABI contract as `read_args` above: `addr` must
            // point at a live `u32` in the calling thread's address space.
            let current_value = unsafe { *(args.addr as *const u32) };
            let outcome = futex::wait(VirtAddr::new(args.addr), current_value, args.expected)?;
            Ok(match outcome {
                FutexWaitResult::Woken => 0,
                FutexWaitResult::WouldBlock => 1,
            })
        }
        SyscallNumber::FutexWake => {
            let args = read_args::<FutexWakeArgs>(arg_ptr)?;
            let woken = futex::wake(VirtAddr::new(args.addr), args.count)?;
            Ok(woken as i32)
        }
        SyscallNumber::SchedGetParams => {
            let args = read_args::<SchedGetParamsArgs>(arg_ptr)?;
            let thread = sched::lookup(ThreadId(args.tid))
                .ok_or(KernelError::Resource(crate::error::ResourceError::NoSuchId { id: args.tid }))?;
            if !args.priority_out.is_null() {
                // SAFETY: same ABI contract as `WaitpidArgs::status_out`.
                unsafe { args.priority_out.write(thread.base_priority()) };
            }
            Ok(0)
        }
        SyscallNumber::SchedSetParams => {
            let args = read_args::<SchedSetParamsArgs>(arg_ptr)?;
            let thread = sched::lookup(ThreadId(args.tid))
                .ok_or(KernelError::Resource(crate::error::ResourceError::NoSuchId { id: args.tid }))?;
            if args.priority >= sched::NUM_PRIORITIES as u8 {
                return Err(KernelError::State(crate::error::StateError::ForbiddenPriority {
                    priority: args.priority,
                }));
            }
            thread.set_base_priority(args.priority);
            Ok(0)
        }
        SyscallNumber::PageAlloc => {
            let args = read_args::<PageAllocArgs>(arg_ptr)?;
            let pcb = process::current_pcb()
                .ok_or(KernelError::State(crate::error::StateError::NotInitialized { subsystem: "process" }))?;
            let vaddr = pcb.lock().address_space().lock().mmap(args.size, args.read_only, args.exec)?;
            if !args.vaddr_out.is_null() {
                // SAFETY: same ABI contract as the other out-parameters above.
                unsafe { args.vaddr_out.write(vaddr.as_u32()) };
            }
            Ok(0)
        }
    }
}

fn read_args<T: Copy>(arg_ptr: usize) -> KernelResult<T> {
    if arg_ptr == 0 {
        return Err(KernelError::Argument(ArgumentError::NullPointer));
    }
    // SAFETY: the syscall ABI promises `arg_ptr` points at a live, correctly
    // sized and aligned `T` in the calling thread's address space; the
    // gateway has no way to validate that itself without a full user-space
    // memory model, which this core does not implement (§1 non-goal).
    Ok(unsafe { *(arg_ptr as *const T) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_syscall_id_reports_syscall_unknown() {
        let eax = dispatch(99, 0);
        assert_eq!(eax, KernelError::Syscall(SyscallError::SyscallUnknown { id: 99 }).to_errno());
    }

    #[test]
    fn null_arg_pointer_is_argument_error() {
        let eax = dispatch(SyscallNumber::Exit as u32, 0);
        assert_eq!(eax, KernelError::Argument(ArgumentError::NullPointer).to_errno());
    }

    #[test]
    fn sched_get_params_rejects_unknown_tid() {
        let mut out: u8 = 0;
        let args = SchedGetParamsArgs {
            tid: 0xdead_beef,
            priority_out: &mut out as *mut u8,
        };
        let eax = dispatch(SyscallNumber::SchedGetParams as u32, &args as *const _ as usize);
        assert_eq!(eax, KernelError::Resource(crate::error::ResourceError::NoSuchId { id: 0xdead_beef }).to_errno());
    }
}
