//! Thumb code stubs staged into target RAM to get the device out of the
//! bootloader again.
//!
//! A plain GO back into flash is not always enough: some parts only reload
//! their option bytes through OBL_LAUNCH, and blank G0/L4 parts boot straight
//! back into system memory unless the PEMPTY status flag is fixed up first.
//! Each stub below is position-independent Thumb-1 machine code ending in an
//! endless loop; the host never executes any of it.
//!
//! On the wire a stub is preceded by an 8-byte header the Cortex-M hardware
//! never sees but the jump setup relies on: the stack pointer to load and the
//! entry address with bit 0 set for Thumb state.

/// Initial stack pointer planted in the staging header.
pub const STACK_POINTER: u32 = 0x2000_2000;

/// Plain system reset: writes VECTKEY | SYSRESETREQ (`0x05FA0004`) to the
/// AIRCR register at `0xE000ED0C`.
#[rustfmt::skip]
pub const RESET: &[u8] = &[
    0x01, 0x49,             // ldr     r1, [pc, #4]  ; AIRCR address
    0x02, 0x4A,             // ldr     r2, [pc, #8]  ; reset request value
    0x0A, 0x60,             // str     r2, [r1]
    0xFE, 0xE7,             // endless: b endless
    0x0C, 0xED, 0x00, 0xE0, // 0xE000ED0C
    0x04, 0x00, 0xFA, 0x05, // 0x05FA0004
];

/// Option-byte reload reset: sets the OBL_LAUNCH bit (`0x00002000`) in
/// FLASH_CR at `0x40022010`, which reloads the option bytes and resets the
/// chip.
#[rustfmt::skip]
pub const OBL_LAUNCH: &[u8] = &[
    0x01, 0x49,             // ldr     r1, [pc, #4]  ; FLASH_CR address
    0x02, 0x4A,             // ldr     r2, [pc, #8]  ; OBL_LAUNCH bit
    0x0A, 0x60,             // str     r2, [r1]
    0xFE, 0xE7,             // endless: b endless
    0x10, 0x20, 0x02, 0x40, // 0x40022010
    0x00, 0x20, 0x00, 0x00, // 0x00002000
];

/// PEMPTY fixup and reset: reads the first flash word, recomputes what the
/// PEMPTY bit (mask `0x00020000` in FLASH_SR at `0x40022010`) should say
/// about it, stores the corrected status and requests an AIRCR reset. After
/// the reset a programmed device boots from main flash instead of system
/// memory.
#[rustfmt::skip]
pub const PEMPTY_LAUNCH: &[u8] = &[
    0x07, 0x48,             // ldr     r0, [pc, #28] ; flash base
    0x00, 0x68,             // ldr     r0, [r0]
    0x07, 0x49,             // ldr     r1, [pc, #28] ; FLASH_SR address
    0x0A, 0x68,             // ldr     r2, [r1]
    0x01, 0x23,             // movs    r3, #1
    0x5B, 0x04,             // lsls    r3, r3, #17   ; PEMPTY mask
    0x9A, 0x43,             // bics    r2, r3
    0x01, 0x30,             // adds    r0, #1        ; Z set iff flash erased
    0x00, 0xD1,             // bne.n   write
    0x1A, 0x43,             // orrs    r2, r3
    0x0A, 0x60,             // write:  str r2, [r1]
    0x04, 0x48,             // ldr     r0, [pc, #16] ; AIRCR address
    0x04, 0x49,             // ldr     r1, [pc, #16] ; reset request value
    0x01, 0x60,             // str     r1, [r0]
    0xFE, 0xE7,             // endless: b endless
    0x00, 0xBF,             // nop                   ; literal pool alignment
    0x00, 0x00, 0x00, 0x08, // 0x08000000
    0x10, 0x20, 0x02, 0x40, // 0x40022010
    0x0C, 0xED, 0x00, 0xE0, // 0xE000ED0C
    0x04, 0x00, 0xFA, 0x05, // 0x05FA0004
];

/// Build the RAM image for `code`: stack pointer, Thumb entry address past
/// the header, then the code itself.
pub(crate) fn staging_image(target_address: u32, code: &[u8]) -> Vec<u8> {
    let mut image = Vec::with_capacity(8 + code.len());
    image.extend_from_slice(&STACK_POINTER.to_le_bytes());
    image.extend_from_slice(&(target_address + 8 + 1).to_le_bytes());
    image.extend_from_slice(code);
    image
}
