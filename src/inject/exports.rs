//! Finds an exported function inside another process by walking the export
//! directory of a module image in that process's own address space.
//!
//! Nothing of the image is mapped locally. Every access is a bounded read
//! through [`ProcessMemory`], so a hostile or half-loaded image can at
//! worst produce an error, never an out-of-bounds access here.

use std::mem::size_of;

use bytemuck::{Pod, Zeroable};

use crate::error::InjectError;

/// Bounded reads from a foreign address space. The windows driver backs
/// this with `ReadProcessMemory`; tests back it with a byte buffer.
pub(crate) trait ProcessMemory {
    /// Read exactly `buf.len()` bytes at `addr`. A partial read is an
    /// error, not a truncation.
    fn read_exact_at(&self, addr: u64, buf: &mut [u8]) -> Result<(), InjectError>;
}

fn read_pod<T: Pod, M: ProcessMemory + ?Sized>(memory: &M, addr: u64) -> Result<T, InjectError> {
    let mut value = T::zeroed();
    memory.read_exact_at(addr, bytemuck::bytes_of_mut(&mut value))?;
    Ok(value)
}

const DOS_MAGIC: u16 = 0x5a4d; // "MZ"
const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const OPT_MAGIC_PE32: u16 = 0x10b;
const OPT_MAGIC_PE32_PLUS: u16 = 0x20b;

/// Offset of the export entry inside the data-directory array, in bytes
/// from the start of the optional header.
const EXPORT_DIR_PE32: u64 = 96;
const EXPORT_DIR_PE32_PLUS: u64 = 112;

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct DosHeader {
    e_magic: u16,
    _reserved: [u8; 58],
    e_lfanew: u32,
}

// Wire layouts carry every field whether or not the walk reads it.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
#[allow(dead_code)]
struct FileHeader {
    machine: u16,
    number_of_sections: u16,
    time_date_stamp: u32,
    pointer_to_symbol_table: u32,
    number_of_symbols: u32,
    size_of_optional_header: u16,
    characteristics: u16,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
#[allow(dead_code)]
struct DataDirectory {
    virtual_address: u32,
    size: u32,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
#[allow(dead_code)]
struct ExportDirectory {
    characteristics: u32,
    time_date_stamp: u32,
    major_version: u16,
    minor_version: u16,
    name: u32,
    base: u32,
    number_of_functions: u32,
    number_of_names: u32,
    address_of_functions: u32,
    address_of_names: u32,
    address_of_name_ordinals: u32,
}

/// Resolve `symbol` in the module mapped at `base` inside `memory`.
///
/// Returns the function's absolute address in the target. `module` is only
/// used for diagnostics; the caller already picked the base address.
pub(crate) fn find_export<M: ProcessMemory + ?Sized>(
    memory: &M,
    module: &str,
    base: u64,
    symbol: &str,
) -> Result<u64, InjectError> {
    let not_found = || InjectError::SymbolNotFound {
        module: module.to_owned(),
        symbol: symbol.to_owned(),
    };

    let dos: DosHeader = read_pod(memory, base)?;
    if dos.e_magic != DOS_MAGIC {
        return Err(InjectError::BadImage("no MZ magic"));
    }

    let nt_addr = base + u64::from(dos.e_lfanew);
    let signature: u32 = read_pod(memory, nt_addr)?;
    if signature != PE_SIGNATURE {
        return Err(InjectError::BadImage("no PE signature"));
    }

    let file: FileHeader = read_pod(memory, nt_addr + 4)?;
    let opt_addr = nt_addr + 4 + size_of::<FileHeader>() as u64;
    let opt_magic: u16 = read_pod(memory, opt_addr)?;
    let export_dir_offset = match opt_magic {
        OPT_MAGIC_PE32 => EXPORT_DIR_PE32,
        OPT_MAGIC_PE32_PLUS => EXPORT_DIR_PE32_PLUS,
        _ => return Err(InjectError::BadImage("unknown optional header magic")),
    };
    if u64::from(file.size_of_optional_header) < export_dir_offset + size_of::<DataDirectory>() as u64 {
        return Err(InjectError::BadImage("optional header too short for an export directory"));
    }

    let export_dir: DataDirectory = read_pod(memory, opt_addr + export_dir_offset)?;
    // A module with no exports is well formed; it just cannot satisfy us.
    if export_dir.virtual_address == 0 {
        return Err(not_found());
    }

    let exports: ExportDirectory = read_pod(memory, base + u64::from(export_dir.virtual_address))?;
    let names = base + u64::from(exports.address_of_names);
    let ordinals = base + u64::from(exports.address_of_name_ordinals);
    let functions = base + u64::from(exports.address_of_functions);

    for index in 0..u64::from(exports.number_of_names) {
        let name_rva: u32 = read_pod(memory, names + index * 4)?;
        if name_matches(memory, base + u64::from(name_rva), symbol)? {
            let ordinal: u16 = read_pod(memory, ordinals + index * 2)?;
            let function_rva: u32 = read_pod(memory, functions + u64::from(ordinal) * 4)?;
            return Ok(base + u64::from(function_rva));
        }
    }
    Err(not_found())
}

/// Compare the NUL-terminated name at `addr` against `symbol`, one byte at
/// a time. Stopping at the first mismatch keeps the reads inside the name
/// itself, so a shorter export sitting at the edge of readable memory is a
/// non-match rather than a failed walk.
fn name_matches<M: ProcessMemory + ?Sized>(
    memory: &M,
    addr: u64,
    symbol: &str,
) -> Result<bool, InjectError> {
    let mut byte = [0u8];
    for (offset, expected) in symbol.bytes().chain(std::iter::once(0)).enumerate() {
        memory.read_exact_at(addr + offset as u64, &mut byte)?;
        if byte[0] != expected {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x7ff6_0000_0000;
    const NT_OFFSET: usize = 0x80;
    const OPT_OFFSET: usize = NT_OFFSET + 4 + size_of::<FileHeader>();
    const EXPORT_DIR_RVA: u32 = 0x200;
    const FUNCTIONS_RVA: u32 = 0x300;
    const NAMES_RVA: u32 = 0x400;
    const ORDINALS_RVA: u32 = 0x500;
    const STRINGS_RVA: u32 = 0x600;

    struct FakeImage {
        bytes: Vec<u8>,
    }

    impl ProcessMemory for FakeImage {
        fn read_exact_at(&self, addr: u64, buf: &mut [u8]) -> Result<(), InjectError> {
            let offset = addr.checked_sub(BASE).unwrap() as usize;
            let available = self.bytes.len().saturating_sub(offset);
            if available < buf.len() {
                return Err(InjectError::ShortRead {
                    addr,
                    want: buf.len(),
                    got: available,
                });
            }
            buf.copy_from_slice(&self.bytes[offset..offset + buf.len()]);
            Ok(())
        }
    }

    fn put_u16(bytes: &mut [u8], offset: usize, value: u16) {
        bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
        bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// A minimal PE32+ image exporting `exports`, given as
    /// `(name, ordinal, function rva)`.
    fn image(exports: &[(&str, u16, u32)]) -> FakeImage {
        let mut bytes = vec![0u8; 0x800];
        put_u16(&mut bytes, 0, DOS_MAGIC);
        put_u32(&mut bytes, 0x3c, NT_OFFSET as u32);
        put_u32(&mut bytes, NT_OFFSET, PE_SIGNATURE);
        // file header: only size_of_optional_header matters to the walk
        put_u16(&mut bytes, NT_OFFSET + 4 + 16, 0xf0);
        put_u16(&mut bytes, OPT_OFFSET, OPT_MAGIC_PE32_PLUS);
        put_u32(&mut bytes, OPT_OFFSET + EXPORT_DIR_PE32_PLUS as usize, EXPORT_DIR_RVA);
        put_u32(&mut bytes, OPT_OFFSET + EXPORT_DIR_PE32_PLUS as usize + 4, 0x100);

        let dir = EXPORT_DIR_RVA as usize;
        put_u32(&mut bytes, dir + 24, exports.len() as u32); // number_of_names
        put_u32(&mut bytes, dir + 28, FUNCTIONS_RVA);
        put_u32(&mut bytes, dir + 32, NAMES_RVA);
        put_u32(&mut bytes, dir + 36, ORDINALS_RVA);

        let mut string_rva = STRINGS_RVA;
        for (index, (name, ordinal, function_rva)) in exports.iter().enumerate() {
            put_u32(&mut bytes, NAMES_RVA as usize + index * 4, string_rva);
            put_u16(&mut bytes, ORDINALS_RVA as usize + index * 2, *ordinal);
            put_u32(&mut bytes, FUNCTIONS_RVA as usize + *ordinal as usize * 4, *function_rva);
            let start = string_rva as usize;
            bytes[start..start + name.len()].copy_from_slice(name.as_bytes());
            string_rva += name.len() as u32 + 1;
        }
        FakeImage { bytes }
    }

    fn loader_not_found(err: InjectError) -> bool {
        matches!(
            err,
            InjectError::SymbolNotFound { module, symbol }
                if module == "kernel32.dll" && symbol == "LoadLibraryA"
        )
    }

    #[test]
    fn finds_an_export_by_name() {
        let image = image(&[("AddAtomA", 0, 0x1111), ("LoadLibraryA", 1, 0x2222)]);
        let addr = find_export(&image, "kernel32.dll", BASE, "LoadLibraryA").unwrap();
        assert_eq!(addr, BASE + 0x2222);
    }

    #[test]
    fn honors_the_ordinal_indirection() {
        // names sorted one way, functions stored another
        let image = image(&[("LoadLibraryA", 3, 0x4444), ("ZwClose", 0, 0x1111)]);
        let addr = find_export(&image, "kernel32.dll", BASE, "LoadLibraryA").unwrap();
        assert_eq!(addr, BASE + 0x4444);
    }

    #[test]
    fn name_prefixes_do_not_match() {
        let image = image(&[("LoadLibraryExA", 0, 0x1111)]);
        let err = find_export(&image, "kernel32.dll", BASE, "LoadLibraryA").unwrap_err();
        assert!(loader_not_found(err));
    }

    #[test]
    fn short_name_at_the_edge_of_memory_is_skipped() {
        let mut image = image(&[("Load", 0, 0x1111), ("LoadLibraryA", 1, 0x2222)]);
        // park the short name flush against the end of readable memory,
        // its terminator the very last byte; the scan must move on instead
        // of reporting a failed read
        let tail = image.bytes.len() - "Load\0".len();
        image.bytes[tail..].copy_from_slice(b"Load\0");
        put_u32(&mut image.bytes, NAMES_RVA as usize, tail as u32);
        let addr = find_export(&image, "kernel32.dll", BASE, "LoadLibraryA").unwrap();
        assert_eq!(addr, BASE + 0x2222);
    }

    #[test]
    fn missing_symbol_is_not_found() {
        let image = image(&[("AddAtomA", 0, 0x1111)]);
        let err = find_export(&image, "kernel32.dll", BASE, "LoadLibraryA").unwrap_err();
        assert!(loader_not_found(err));
    }

    #[test]
    fn module_without_export_table_is_not_found() {
        let mut image = image(&[("LoadLibraryA", 0, 0x1111)]);
        // zero the export data directory, as in a resource-only module
        put_u32(&mut image.bytes, OPT_OFFSET + EXPORT_DIR_PE32_PLUS as usize, 0);
        let err = find_export(&image, "kernel32.dll", BASE, "LoadLibraryA").unwrap_err();
        assert!(loader_not_found(err));
    }

    #[test]
    fn rejects_an_image_without_dos_magic() {
        let mut image = image(&[]);
        put_u16(&mut image.bytes, 0, 0x4242);
        let err = find_export(&image, "kernel32.dll", BASE, "LoadLibraryA").unwrap_err();
        assert!(matches!(err, InjectError::BadImage("no MZ magic")));
    }

    #[test]
    fn rejects_a_bad_pe_signature() {
        let mut image = image(&[]);
        put_u32(&mut image.bytes, NT_OFFSET, 0xdead_beef);
        let err = find_export(&image, "kernel32.dll", BASE, "LoadLibraryA").unwrap_err();
        assert!(matches!(err, InjectError::BadImage("no PE signature")));
    }

    #[test]
    fn rejects_an_unknown_optional_header() {
        let mut image = image(&[]);
        put_u16(&mut image.bytes, OPT_OFFSET, 0x777);
        let err = find_export(&image, "kernel32.dll", BASE, "LoadLibraryA").unwrap_err();
        assert!(matches!(err, InjectError::BadImage("unknown optional header magic")));
    }

    #[test]
    fn truncated_image_is_a_short_read() {
        let mut image = image(&[("LoadLibraryA", 0, 0x1111)]);
        image.bytes.truncate(EXPORT_DIR_RVA as usize);
        let err = find_export(&image, "kernel32.dll", BASE, "LoadLibraryA").unwrap_err();
        assert!(matches!(err, InjectError::ShortRead { .. }));
    }

    #[test]
    fn pe32_images_use_the_narrow_directory_offset() {
        let mut image = image(&[("LoadLibraryA", 0, 0x1234)]);
        put_u16(&mut image.bytes, OPT_OFFSET, OPT_MAGIC_PE32);
        let wide = OPT_OFFSET + EXPORT_DIR_PE32_PLUS as usize;
        let narrow = OPT_OFFSET + EXPORT_DIR_PE32 as usize;
        image.bytes.copy_within(wide..wide + 8, narrow);
        put_u32(&mut image.bytes, wide, 0);
        let addr = find_export(&image, "kernel32.dll", BASE, "LoadLibraryA").unwrap();
        assert_eq!(addr, BASE + 0x1234);
    }
}
