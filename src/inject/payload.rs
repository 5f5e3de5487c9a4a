//! Machine-code preamble staged into the target. It calls the target's own
//! library loader on an appended path string, traps if the load fails, and
//! returns to the real entry point the driver pushed on the stack.
//!
//! One byte template per supported instruction set, patched at fixed
//! offsets. No assembly is generated at run time.

/// One architecture's loader stub.
pub(crate) struct Template {
    /// Position-independent code, except for the absolute loader address
    /// at `loader_slot`.
    pub preamble: &'static [u8],
    /// Offset of the loader-address immediate inside `preamble`.
    pub loader_slot: usize,
    /// Width of that immediate: the architecture's pointer size.
    pub pointer_len: usize,
}

/// ```text
/// push rbp                    ; conventional frame, keeps rsp recoverable
/// mov  rbp, rsp
/// sub  rsp, 0x20              ; shadow space for the win64 call
/// and  rsp, -0x10             ; loader entry requires 16-byte alignment
/// lea  rcx, [rip + path]      ; appended path string
/// mov  rax, <loader>          ; patched at LOADER_SLOT
/// call rax
/// test rax, rax
/// jnz  done
/// int3                        ; load failed, fault where a debugger sees it
/// done:
/// leave
/// ret                         ; to the pushed original entry point
/// ```
pub(crate) const X86_64: Template = Template {
    preamble: &[
        0x55, //
        0x48, 0x89, 0xe5, //
        0x48, 0x83, 0xec, 0x20, //
        0x48, 0x83, 0xe4, 0xf0, //
        0x48, 0x8d, 0x0d, 0x14, 0x00, 0x00, 0x00, //
        0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, //
        0xff, 0xd0, //
        0x48, 0x85, 0xc0, //
        0x75, 0x01, //
        0xcc, //
        0xc9, //
        0xc3, //
    ],
    loader_slot: 0x15,
    pointer_len: 8,
};

/// ```text
/// pushad                      ; cdecl scratch registers must survive
/// jmp  short load
/// back:
/// mov  eax, <loader>          ; patched at LOADER_SLOT
/// call eax
/// test eax, eax
/// jnz  done
/// int3
/// done:
/// popad
/// ret                         ; to the pushed original entry point
/// load:
/// call back                   ; pushes the path address as the argument
/// ```
pub(crate) const X86: Template = Template {
    preamble: &[
        0x60, //
        0xeb, 0x0e, //
        0xb8, 0, 0, 0, 0, //
        0xff, 0xd0, //
        0x85, 0xc0, //
        0x75, 0x01, //
        0xcc, //
        0x61, //
        0xc3, //
        0xe8, 0xed, 0xff, 0xff, 0xff, //
    ],
    loader_slot: 0x04,
    pointer_len: 4,
};

#[cfg(target_arch = "x86_64")]
pub(crate) const NATIVE: &Template = &X86_64;
#[cfg(target_arch = "x86")]
pub(crate) const NATIVE: &Template = &X86;

/// Assemble one ready-to-write payload: the patched preamble followed by
/// the NUL-terminated library path it references.
pub(crate) fn build(template: &Template, loader_addr: u64, library: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(template.preamble.len() + library.len() + 1);
    payload.extend_from_slice(template.preamble);
    let slot = template.loader_slot..template.loader_slot + template.pointer_len;
    payload[slot].copy_from_slice(&loader_addr.to_le_bytes()[..template.pointer_len]);
    payload.extend_from_slice(library.as_bytes());
    payload.push(0);
    payload
}
