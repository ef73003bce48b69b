//! x86_64 context switch for the fiber-swap adapter: hand-written
//! register-save-and-restore, the same mechanism and calling
//! convention as the teacher's green-thread switch, generalized from
//! "switch between two GVThreads" to "switch between the adapter's
//! main and loop contexts".

use std::arch::naked_asm;

use crate::fiber::loop_finished;

/// Callee-saved registers per the System V AMD64 ABI, plus the
/// instruction pointer to resume at. Same field order and size as the
/// teacher's `VoluntarySavedRegs` (64 bytes).
#[repr(C)]
#[derive(Default)]
pub(crate) struct SavedRegs {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Lay out `regs` so that switching into it for the first time starts
/// execution at `trampoline`, which calls `entry_fn(entry_arg)`.
///
/// # Safety
/// `stack_top` must point one-past-the-end of a valid, writable stack.
pub(crate) unsafe fn init_context(regs: *mut SavedRegs, stack_top: *mut u8, entry_fn: usize, entry_arg: usize) {
    let sp = stack_top as usize;
    let aligned_sp = (sp & !0xF) - 8;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64;
    regs.r13 = entry_arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// First thing that runs on the loop fiber's own stack: calls the
/// entry function with its argument, then the finish hook if it ever
/// returns.
#[unsafe(naked)]
unsafe extern "C" fn trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "mov rdi, r13",
        "call {finished}",
        "ud2",
        finished = sym loop_finished,
    );
}

/// Save callee-saved registers to `old`, load them from `new`, and
/// jump to `new`'s saved instruction pointer. Exactly the teacher's
/// `context_switch_voluntary`, renamed for this crate's two-context
/// (main/loop) use rather than N-way GVThread scheduling.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn context_switch(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        "1:",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_regs_is_64_bytes_like_the_teachers_layout() {
        assert_eq!(std::mem::size_of::<SavedRegs>(), 64);
    }
}
