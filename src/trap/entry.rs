//! Trap vectors.
//!
//! Two entry points in the xv6 style: `_trap_user_entry` is installed in
//! `stvec` while user code runs, `_trap_kernel_entry` while the kernel
//! runs, and each installs the other on the way through. While in user
//! mode, `sscratch` holds the trap-frame base of the running thread's
//! kernel stack; the anchor word just above the frame recovers `tp`.
//!
//! `_trap_user_exit` doubles as the first-entry path: `exec` and the fork
//! child trampoline call it with `a0` pointing at a prepared trap frame.

core::arch::global_asm!(
    r#"
    .section .text
    .globl _trap_user_entry
    .globl _trap_kernel_entry
    .globl _trap_user_exit
    .align 2
_trap_user_entry:
    # sp <- trap frame base, sscratch <- user sp
    csrrw   sp, sscratch, sp
    sd      x1, 0(sp)
    sd      x3, 16(sp)
    sd      x4, 24(sp)
    sd      x5, 32(sp)
    sd      x6, 40(sp)
    sd      x7, 48(sp)
    sd      x8, 56(sp)
    sd      x9, 64(sp)
    sd      x10, 72(sp)
    sd      x11, 80(sp)
    sd      x12, 88(sp)
    sd      x13, 96(sp)
    sd      x14, 104(sp)
    sd      x15, 112(sp)
    sd      x16, 120(sp)
    sd      x17, 128(sp)
    sd      x18, 136(sp)
    sd      x19, 144(sp)
    sd      x20, 152(sp)
    sd      x21, 160(sp)
    sd      x22, 168(sp)
    sd      x23, 176(sp)
    sd      x24, 184(sp)
    sd      x25, 192(sp)
    sd      x26, 200(sp)
    sd      x27, 208(sp)
    sd      x28, 216(sp)
    sd      x29, 224(sp)
    sd      x30, 232(sp)
    sd      x31, 240(sp)
    csrr    t0, sscratch
    sd      t0, 8(sp)           # user sp into the x2 slot
    csrr    t0, sstatus
    sd      t0, 248(sp)
    csrr    t0, sepc
    sd      t0, 256(sp)
    # recover the current thread from the stack anchor
    ld      tp, 272(sp)
    la      t0, _trap_kernel_entry
    csrw    stvec, t0
    mv      a0, sp
    call    trap_user_dispatch
_trap_user_exit:
    mv      sp, a0
    la      t0, _trap_user_entry
    csrw    stvec, t0
    csrw    sscratch, sp
    ld      t0, 248(sp)
    csrw    sstatus, t0
    ld      t0, 256(sp)
    csrw    sepc, t0
    ld      x1, 0(sp)
    ld      x3, 16(sp)
    ld      x4, 24(sp)
    ld      x5, 32(sp)
    ld      x6, 40(sp)
    ld      x7, 48(sp)
    ld      x8, 56(sp)
    ld      x9, 64(sp)
    ld      x10, 72(sp)
    ld      x11, 80(sp)
    ld      x12, 88(sp)
    ld      x13, 96(sp)
    ld      x14, 104(sp)
    ld      x15, 112(sp)
    ld      x16, 120(sp)
    ld      x17, 128(sp)
    ld      x18, 136(sp)
    ld      x19, 144(sp)
    ld      x20, 152(sp)
    ld      x21, 160(sp)
    ld      x22, 168(sp)
    ld      x23, 176(sp)
    ld      x24, 184(sp)
    ld      x25, 192(sp)
    ld      x26, 200(sp)
    ld      x27, 208(sp)
    ld      x28, 216(sp)
    ld      x29, 224(sp)
    ld      x30, 232(sp)
    ld      x31, 240(sp)
    ld      sp, 8(sp)
    sret

    .align 2
_trap_kernel_entry:
    addi    sp, sp, -272
    sd      x1, 0(sp)
    sd      x3, 16(sp)
    sd      x4, 24(sp)
    sd      x5, 32(sp)
    sd      x6, 40(sp)
    sd      x7, 48(sp)
    sd      x8, 56(sp)
    sd      x9, 64(sp)
    sd      x10, 72(sp)
    sd      x11, 80(sp)
    sd      x12, 88(sp)
    sd      x13, 96(sp)
    sd      x14, 104(sp)
    sd      x15, 112(sp)
    sd      x16, 120(sp)
    sd      x17, 128(sp)
    sd      x18, 136(sp)
    sd      x19, 144(sp)
    sd      x20, 152(sp)
    sd      x21, 160(sp)
    sd      x22, 168(sp)
    sd      x23, 176(sp)
    sd      x24, 184(sp)
    sd      x25, 192(sp)
    sd      x26, 200(sp)
    sd      x27, 208(sp)
    sd      x28, 216(sp)
    sd      x29, 224(sp)
    sd      x30, 232(sp)
    sd      x31, 240(sp)
    addi    t0, sp, 272
    sd      t0, 8(sp)           # interrupted sp
    csrr    t0, sstatus
    sd      t0, 248(sp)
    csrr    t0, sepc
    sd      t0, 256(sp)
    mv      a0, sp
    call    trap_kernel_dispatch
    ld      t0, 248(sp)
    csrw    sstatus, t0
    ld      t0, 256(sp)
    csrw    sepc, t0
    ld      x1, 0(sp)
    ld      x3, 16(sp)
    ld      x4, 24(sp)
    ld      x5, 32(sp)
    ld      x6, 40(sp)
    ld      x7, 48(sp)
    ld      x8, 56(sp)
    ld      x9, 64(sp)
    ld      x10, 72(sp)
    ld      x11, 80(sp)
    ld      x12, 88(sp)
    ld      x13, 96(sp)
    ld      x14, 104(sp)
    ld      x15, 112(sp)
    ld      x16, 120(sp)
    ld      x17, 128(sp)
    ld      x18, 136(sp)
    ld      x19, 144(sp)
    ld      x20, 152(sp)
    ld      x21, 160(sp)
    ld      x22, 168(sp)
    ld      x23, 176(sp)
    ld      x24, 184(sp)
    ld      x25, 192(sp)
    ld      x26, 200(sp)
    ld      x27, 208(sp)
    ld      x28, 216(sp)
    ld      x29, 224(sp)
    ld      x30, 232(sp)
    ld      x31, 240(sp)
    addi    sp, sp, 272
    sret
"#
);
