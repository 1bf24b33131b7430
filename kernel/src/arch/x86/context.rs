//! Saved register image and context switch for 32-bit x86 kernel threads.
//!
//! Every thread here runs in kernel mode (no ring-3 execution is modeled by
//! this specification's scheduler), so the saved image is the callee-saved
//! GPRs plus the stack/instruction pointers a cooperative switch needs.

/// Register image saved across a context switch.
///
/// Field order matches the push/pop sequence `switch_context` performs, so
/// the offsets here and the inline asm in that function must be kept in
/// lock-step if either changes.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Context {
    pub ebx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            ebx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
            esp: 0,
            eip: 0,
        }
    }

    /// Builds the initial register image for a brand-new kernel thread:
    /// `entry` is the function the thread starts executing at, and
    /// `kernel_stack_top` is the first address past its allocated kernel
    /// stack (the stack grows down from here).
    ///
    /// `switch_context`'s restore path pops `ebp, edi, esi, ebx` and flags
    /// (5 words) before falling into its own compiler-generated `ret`, so a
    /// freshly built stack must hold exactly that shape with `entry` sitting
    /// in the return-address slot the `ret` consumes.
    pub fn init(entry: usize, kernel_stack_top: usize) -> Self {
        const FRAME_WORDS: usize = 6; // ebp, edi, esi, ebx, eflags, ret_addr
        let base = kernel_stack_top & !0xF;
        let sp = base - FRAME_WORDS * core::mem::size_of::<u32>();
        // SAFETY: `kernel_stack_top` is the caller-allocated top of a live
        // kernel stack at least `FRAME_WORDS` words deep; nothing else owns
        // this stack before the thread's first dispatch.
        #[cfg(target_arch = "x86")]
        unsafe {
            let words = sp as *mut u32;
            words.add(0).write(0); // ebp
            words.add(1).write(0); // edi
            words.add(2).write(0); // esi
            words.add(3).write(0); // ebx
            words.add(4).write(0); // eflags (interrupts disabled until first sti)
            words.add(5).write(entry as u32); // ret_addr -> entry
        }
        Self {
            ebx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
            esp: sp as u32,
            eip: entry as u32,
        }
    }

    pub fn set_return_value(&mut self, value: u32) {
        // The return value register (EAX) is not part of the callee-saved
        // context; it is written directly into the saved syscall frame by
        // the fork path instead. Kept as a no-op hook so callers that mirror
        // the teacher's `set_return_value(...)` shape compile unchanged.
        let _ = value;
    }
}

/// Switches from `from`'s context to `to`'s context.
///
/// # Safety
/// Must be called with interrupts disabled, both contexts must describe live
/// kernel stacks, and `from` must be the context of the CPU's currently
/// running thread.
#[cfg(target_arch = "x86")]
pub unsafe fn switch_context(from: &mut Context, to: &Context) {
    unsafe {
        core::arch::asm!(
            "pushfd",
            "push ebx",
            "push esi",
            "push edi",
            "push ebp",
            "mov [{from_esp}], esp",
            "mov esp, {to_esp}",
            "pop ebp",
            "pop edi",
            "pop esi",
            "pop ebx",
            "popfd",
            from_esp = in(reg) &mut from.esp,
            to_esp = in(reg) to.esp,
            options(nostack),
        );
    }
    let _ = (from, to);
}

#[cfg(not(target_arch = "x86"))]
pub unsafe fn switch_context(_from: &mut Context, _to: &Context) {
    unreachable!("context switch has no meaning on the host test target")
}
