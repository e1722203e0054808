//! aarch64 context switching implementation
//!
//! AAPCS64: sp, x19-x29, lr (x30) and the low halves of v8-v15 are
//! callee-saved.

use std::arch::naked_asm;

use super::EntryFn;

/// Saved register file (offsets are used by the assembly below)
///
/// ```text
/// 0x00 sp    0x08 lr    0x10 x19..x28 (10 words)
/// 0x60 x29   0x68 d8..d15 (8 words)
/// ```
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedRegs {
    pub sp: u64,
    pub lr: u64,
    pub x19_x28: [u64; 10],
    pub fp: u64,
    pub d8_d15: [u64; 8],
}

/// Initialize a fresh context
///
/// # Safety
///
/// `regs` must be valid for writes. `stack_top` must be the exclusive top
/// of a writable stack that stays mapped until the context is dead.
#[inline]
pub unsafe fn init_context(regs: *mut SavedRegs, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    *regs = SavedRegs::default();
    regs.sp = sp as u64;
    regs.lr = fiber_trampoline as usize as u64;
    regs.x19_x28[0] = entry as usize as u64;
    regs.x19_x28[1] = arg as u64;
}

/// First frame of every fiber: `entry(arg)`, which never returns
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "brk #0x1",
    );
}

/// Save the current context into `old` and resume `new`
///
/// # Safety
///
/// Both pointers must be valid; `new` must hold a context produced by
/// `init_context` or by a previous `switch_context`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save to old (x0)
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "str x30, [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "str x29, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Load from new (x1)
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldr x30, [x1, #0x08]",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldr x29, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ret",
    );
}
