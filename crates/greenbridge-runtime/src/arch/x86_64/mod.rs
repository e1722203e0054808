//! x86_64 context switching implementation
//!
//! System V AMD64: rsp, rbx, rbp, r12-r15 are callee-saved, plus the
//! MXCSR and x87 control words. Everything else is clobbered by the call
//! into `switch_context` anyway.

use std::arch::naked_asm;

use super::EntryFn;

/// Saved register file (offsets are used by the assembly below)
///
/// ```text
/// 0x00 rsp   0x08 rip   0x10 rbx   0x18 rbp
/// 0x20 r12   0x28 r13   0x30 r14   0x38 r15
/// 0x40 mxcsr (u32) | 0x44 x87 cw (u16)
/// ```
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedRegs {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub fp_control: u64,
}

/// Power-on defaults: MXCSR 0x1F80, x87 CW 0x037F
const DEFAULT_FP_CONTROL: u64 = (0x037F << 32) | 0x1F80;

/// Initialize a fresh context
///
/// The first switch into `regs` jumps to the trampoline with a 16-byte
/// aligned stack, which calls `entry(arg)`.
///
/// # Safety
///
/// `regs` must be valid for writes. `stack_top` must be the exclusive top
/// of a writable stack that stays mapped until the context is dead.
#[inline]
pub unsafe fn init_context(regs: *mut SavedRegs, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    regs.rsp = sp as u64;
    regs.rip = fiber_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry as usize as u64;
    regs.r13 = arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
    regs.fp_control = DEFAULT_FP_CONTROL;
}

/// First frame of every fiber: `entry(arg)`, which never returns
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Save the current context into `old` and resume `new`
///
/// Returns when some other context switches back into `old`.
///
/// # Safety
///
/// Both pointers must be valid; `new` must hold a context produced by
/// `init_context` or by a previous `switch_context`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved state to old (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "stmxcsr dword ptr [rdi + 0x40]",
        "fnstcw word ptr [rdi + 0x44]",
        // Load from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "ldmxcsr dword ptr [rsi + 0x40]",
        "fldcw word ptr [rsi + 0x44]",
        "jmp qword ptr [rsi + 0x08]",
        // Resume point for a saved context
        "2:",
        "ret",
    );
}
