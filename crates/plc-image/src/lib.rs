//! Process image tables.
//!
//! The image is a fixed-size bank of typed cell references shared by the
//! control program, the journal, and every plugin. Each table holds
//! `BUFFER_SIZE` nullable raw pointers into the control program's own
//! storage; the program's glue step installs the non-null entries after
//! `setBufferPointers` hands it the table bases, and the pointers never move
//! for the lifetime of the loaded program.
//!
//! Access discipline (see also the crate-level safety comments):
//! - All reads and writes of mapped cells happen with the image mutex held.
//!   Rust callers use [`ImageBank::lock`]; foreign plugins go through the
//!   `extern "C"` take/give shims carried in their runtime args.
//! - [`ImagePointers`] is captured once at startup, before the scan loop
//!   exists, and is only ever dereferenced under the same mutex.

use std::ptr;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

/// Number of cells per image table.
pub const BUFFER_SIZE: usize = 1024;

/// Bit slots per bool cell.
pub const BITS_PER_CELL: usize = 8;

/// Bit index sentinel carried by non-bool journal records.
pub const NO_BIT: u8 = 0xFF;

// IEC 61131-3 elementary types as they appear in the compiled artifact.
pub type IecBool = u8;
pub type IecByte = u8;
pub type IecUint = u16;
pub type IecUdint = u32;
pub type IecUlint = u64;

/// One row of bit cells: eight nullable bool references.
pub type BoolRow = [*mut IecBool; BITS_PER_CELL];

/// Buffer-type tag identifying one of the fourteen image tables.
///
/// The numeric codes are part of the external plugin ABI and must not be
/// reordered. The serde names (`bool_input` .. `lint_memory`) are the
/// strings used in plugin configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BufferTag {
    BoolInput = 0,
    BoolOutput = 1,
    BoolMemory = 2,
    ByteInput = 3,
    ByteOutput = 4,
    IntInput = 5,
    IntOutput = 6,
    IntMemory = 7,
    DintInput = 8,
    DintOutput = 9,
    DintMemory = 10,
    LintInput = 11,
    LintOutput = 12,
    LintMemory = 13,
}

/// Width class of a buffer tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Bool,
    Byte,
    Int,
    Dint,
    Lint,
}

impl BufferTag {
    pub const COUNT: usize = 14;

    /// Decode an ABI tag code. Returns `None` for codes outside 0..14.
    pub fn from_code(code: u8) -> Option<Self> {
        use BufferTag::*;
        Some(match code {
            0 => BoolInput,
            1 => BoolOutput,
            2 => BoolMemory,
            3 => ByteInput,
            4 => ByteOutput,
            5 => IntInput,
            6 => IntOutput,
            7 => IntMemory,
            8 => DintInput,
            9 => DintOutput,
            10 => DintMemory,
            11 => LintInput,
            12 => LintOutput,
            13 => LintMemory,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn width(self) -> Width {
        use BufferTag::*;
        match self {
            BoolInput | BoolOutput | BoolMemory => Width::Bool,
            ByteInput | ByteOutput => Width::Byte,
            IntInput | IntOutput | IntMemory => Width::Int,
            DintInput | DintOutput | DintMemory => Width::Dint,
            LintInput | LintOutput | LintMemory => Width::Lint,
        }
    }

    /// Element width in bytes as seen on the wire and in shadow buffers.
    pub fn element_size(self) -> usize {
        match self.width() {
            Width::Bool | Width::Byte => 1,
            Width::Int => 2,
            Width::Dint => 4,
            Width::Lint => 8,
        }
    }

    /// Input-kind tables are read-only from the field bus side.
    pub fn is_input(self) -> bool {
        use BufferTag::*;
        matches!(self, BoolInput | ByteInput | IntInput | DintInput | LintInput)
    }

    /// Configuration-file spelling of the tag (`int_memory`, ...).
    pub fn name(self) -> &'static str {
        use BufferTag::*;
        match self {
            BoolInput => "bool_input",
            BoolOutput => "bool_output",
            BoolMemory => "bool_memory",
            ByteInput => "byte_input",
            ByteOutput => "byte_output",
            IntInput => "int_input",
            IntOutput => "int_output",
            IntMemory => "int_memory",
            DintInput => "dint_input",
            DintOutput => "dint_output",
            DintMemory => "dint_memory",
            LintInput => "lint_input",
            LintOutput => "lint_output",
            LintMemory => "lint_memory",
        }
    }
}

/// The fourteen image tables.
///
/// Layout is `#[repr(C)]` because the table bases are handed to the compiled
/// control program and to native plugins by pointer.
#[repr(C)]
pub struct ImageTables {
    pub bool_input: [BoolRow; BUFFER_SIZE],
    pub bool_output: [BoolRow; BUFFER_SIZE],
    pub bool_memory: [BoolRow; BUFFER_SIZE],
    pub byte_input: [*mut IecByte; BUFFER_SIZE],
    pub byte_output: [*mut IecByte; BUFFER_SIZE],
    pub int_input: [*mut IecUint; BUFFER_SIZE],
    pub int_output: [*mut IecUint; BUFFER_SIZE],
    pub int_memory: [*mut IecUint; BUFFER_SIZE],
    pub dint_input: [*mut IecUdint; BUFFER_SIZE],
    pub dint_output: [*mut IecUdint; BUFFER_SIZE],
    pub dint_memory: [*mut IecUdint; BUFFER_SIZE],
    pub lint_input: [*mut IecUlint; BUFFER_SIZE],
    pub lint_output: [*mut IecUlint; BUFFER_SIZE],
    pub lint_memory: [*mut IecUlint; BUFFER_SIZE],
}

// Safety: the tables only carry pointers into the control program's storage.
// Every dereference happens with the image mutex held (Rust callers via the
// guard API, foreign callers via the take/give shims), and the pointers are
// stable once installed by the glue step.
unsafe impl Send for ImageTables {}

impl ImageTables {
    fn empty() -> Self {
        Self {
            bool_input: [[ptr::null_mut(); BITS_PER_CELL]; BUFFER_SIZE],
            bool_output: [[ptr::null_mut(); BITS_PER_CELL]; BUFFER_SIZE],
            bool_memory: [[ptr::null_mut(); BITS_PER_CELL]; BUFFER_SIZE],
            byte_input: [ptr::null_mut(); BUFFER_SIZE],
            byte_output: [ptr::null_mut(); BUFFER_SIZE],
            int_input: [ptr::null_mut(); BUFFER_SIZE],
            int_output: [ptr::null_mut(); BUFFER_SIZE],
            int_memory: [ptr::null_mut(); BUFFER_SIZE],
            dint_input: [ptr::null_mut(); BUFFER_SIZE],
            dint_output: [ptr::null_mut(); BUFFER_SIZE],
            dint_memory: [ptr::null_mut(); BUFFER_SIZE],
            lint_input: [ptr::null_mut(); BUFFER_SIZE],
            lint_output: [ptr::null_mut(); BUFFER_SIZE],
            lint_memory: [ptr::null_mut(); BUFFER_SIZE],
        }
    }

    fn bool_table(&self, tag: BufferTag) -> Option<&[BoolRow; BUFFER_SIZE]> {
        match tag {
            BufferTag::BoolInput => Some(&self.bool_input),
            BufferTag::BoolOutput => Some(&self.bool_output),
            BufferTag::BoolMemory => Some(&self.bool_memory),
            _ => None,
        }
    }

    /// Write `value` (truncated to the tag's width) through the mapped cell
    /// reference. Returns `true` when a non-null cell was written.
    ///
    /// Out-of-range indices and unmapped cells are silent no-ops, matching
    /// the journal's apply semantics. The caller must hold the image mutex.
    pub fn store(&self, tag: BufferTag, index: usize, bit: u8, value: u64) -> bool {
        if index >= BUFFER_SIZE {
            return false;
        }
        unsafe {
            match tag.width() {
                Width::Bool => {
                    if bit as usize >= BITS_PER_CELL {
                        return false;
                    }
                    let Some(table) = self.bool_table(tag) else {
                        return false;
                    };
                    let cell = table[index][bit as usize];
                    if cell.is_null() {
                        return false;
                    }
                    *cell = (value & 1) as IecBool;
                }
                Width::Byte => {
                    let cell = match tag {
                        BufferTag::ByteInput => self.byte_input[index],
                        _ => self.byte_output[index],
                    };
                    if cell.is_null() {
                        return false;
                    }
                    *cell = (value & 0xFF) as IecByte;
                }
                Width::Int => {
                    let cell = match tag {
                        BufferTag::IntInput => self.int_input[index],
                        BufferTag::IntOutput => self.int_output[index],
                        _ => self.int_memory[index],
                    };
                    if cell.is_null() {
                        return false;
                    }
                    *cell = (value & 0xFFFF) as IecUint;
                }
                Width::Dint => {
                    let cell = match tag {
                        BufferTag::DintInput => self.dint_input[index],
                        BufferTag::DintOutput => self.dint_output[index],
                        _ => self.dint_memory[index],
                    };
                    if cell.is_null() {
                        return false;
                    }
                    *cell = (value & 0xFFFF_FFFF) as IecUdint;
                }
                Width::Lint => {
                    let cell = match tag {
                        BufferTag::LintInput => self.lint_input[index],
                        BufferTag::LintOutput => self.lint_output[index],
                        _ => self.lint_memory[index],
                    };
                    if cell.is_null() {
                        return false;
                    }
                    *cell = value as IecUlint;
                }
            }
        }
        true
    }

    /// Read a mapped cell, widened to 64 bits. `None` when the cell is
    /// unmapped or the coordinates are out of range. The caller must hold
    /// the image mutex.
    pub fn load(&self, tag: BufferTag, index: usize, bit: u8) -> Option<u64> {
        if index >= BUFFER_SIZE {
            return None;
        }
        unsafe {
            match tag.width() {
                Width::Bool => {
                    if bit as usize >= BITS_PER_CELL {
                        return None;
                    }
                    let cell = self.bool_table(tag)?[index][bit as usize];
                    (!cell.is_null()).then(|| u64::from(*cell & 1))
                }
                Width::Byte => {
                    let cell = match tag {
                        BufferTag::ByteInput => self.byte_input[index],
                        _ => self.byte_output[index],
                    };
                    (!cell.is_null()).then(|| u64::from(*cell))
                }
                Width::Int => {
                    let cell = match tag {
                        BufferTag::IntInput => self.int_input[index],
                        BufferTag::IntOutput => self.int_output[index],
                        _ => self.int_memory[index],
                    };
                    (!cell.is_null()).then(|| u64::from(*cell))
                }
                Width::Dint => {
                    let cell = match tag {
                        BufferTag::DintInput => self.dint_input[index],
                        BufferTag::DintOutput => self.dint_output[index],
                        _ => self.dint_memory[index],
                    };
                    (!cell.is_null()).then(|| u64::from(*cell))
                }
                Width::Lint => {
                    let cell = match tag {
                        BufferTag::LintInput => self.lint_input[index],
                        BufferTag::LintOutput => self.lint_output[index],
                        _ => self.lint_memory[index],
                    };
                    (!cell.is_null()).then(|| *cell)
                }
            }
        }
    }
}

/// Raw base pointers of every table, for `setBufferPointers` and plugin
/// runtime args. Captured once at startup; dereference only under the image
/// mutex.
#[derive(Clone, Copy)]
pub struct ImagePointers {
    pub bool_input: *mut BoolRow,
    pub bool_output: *mut BoolRow,
    pub bool_memory: *mut BoolRow,
    pub byte_input: *mut *mut IecByte,
    pub byte_output: *mut *mut IecByte,
    pub int_input: *mut *mut IecUint,
    pub int_output: *mut *mut IecUint,
    pub int_memory: *mut *mut IecUint,
    pub dint_input: *mut *mut IecUdint,
    pub dint_output: *mut *mut IecUdint,
    pub dint_memory: *mut *mut IecUdint,
    pub lint_input: *mut *mut IecUlint,
    pub lint_output: *mut *mut IecUlint,
    pub lint_memory: *mut *mut IecUlint,
}

// Safety: same discipline as `ImageTables`; the bundle is only a view of the
// bank owned by an `Arc<ImageBank>` which outlives every consumer.
unsafe impl Send for ImagePointers {}
unsafe impl Sync for ImagePointers {}

/// The image bank: the tables plus the image mutex.
pub struct ImageBank {
    tables: Mutex<ImageTables>,
}

impl ImageBank {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(ImageTables::empty()),
        })
    }

    /// Acquire the image mutex.
    pub fn lock(&self) -> MutexGuard<'_, ImageTables> {
        self.tables.lock()
    }

    /// Capture the table base pointers for FFI hand-off.
    pub fn pointers(&self) -> ImagePointers {
        let t = self.tables.data_ptr();
        // Safety: `data_ptr` never dereferences; the resulting field
        // pointers are only dereferenced under the image mutex.
        unsafe {
            ImagePointers {
                bool_input: (&raw mut (*t).bool_input).cast(),
                bool_output: (&raw mut (*t).bool_output).cast(),
                bool_memory: (&raw mut (*t).bool_memory).cast(),
                byte_input: (&raw mut (*t).byte_input).cast(),
                byte_output: (&raw mut (*t).byte_output).cast(),
                int_input: (&raw mut (*t).int_input).cast(),
                int_output: (&raw mut (*t).int_output).cast(),
                int_memory: (&raw mut (*t).int_memory).cast(),
                dint_input: (&raw mut (*t).dint_input).cast(),
                dint_output: (&raw mut (*t).dint_output).cast(),
                dint_memory: (&raw mut (*t).dint_memory).cast(),
                lint_input: (&raw mut (*t).lint_input).cast(),
                lint_output: (&raw mut (*t).lint_output).cast(),
                lint_memory: (&raw mut (*t).lint_memory).cast(),
            }
        }
    }
}

/// `extern "C"` take shim for the plugin ABI. Returns 0 on success, -1 when
/// `bank` is null.
pub extern "C" fn image_mutex_take(bank: *const ImageBank) -> i32 {
    if bank.is_null() {
        return -1;
    }
    // Safety: the bank pointer comes from the runtime args of a live driver
    // and outlives every plugin. Forgetting the guard leaves the mutex held
    // until the matching give.
    unsafe {
        std::mem::forget((*bank).tables.lock());
    }
    0
}

/// `extern "C"` give shim for the plugin ABI. The caller must hold the
/// mutex via a prior successful take.
pub extern "C" fn image_mutex_give(bank: *const ImageBank) -> i32 {
    if bank.is_null() {
        return -1;
    }
    // Safety: contract above; unlocking a mutex taken by the same shim.
    unsafe {
        (*bank).tables.force_unlock();
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_codes_are_abi_stable() {
        let expected = [
            (0u8, BufferTag::BoolInput),
            (1, BufferTag::BoolOutput),
            (2, BufferTag::BoolMemory),
            (3, BufferTag::ByteInput),
            (4, BufferTag::ByteOutput),
            (5, BufferTag::IntInput),
            (6, BufferTag::IntOutput),
            (7, BufferTag::IntMemory),
            (8, BufferTag::DintInput),
            (9, BufferTag::DintOutput),
            (10, BufferTag::DintMemory),
            (11, BufferTag::LintInput),
            (12, BufferTag::LintOutput),
            (13, BufferTag::LintMemory),
        ];
        for (code, tag) in expected {
            assert_eq!(tag.code(), code);
            assert_eq!(BufferTag::from_code(code), Some(tag));
        }
        assert_eq!(BufferTag::from_code(14), None);
        assert_eq!(BufferTag::from_code(0xFF), None);
    }

    #[test]
    fn tag_names_round_trip_through_serde() {
        for code in 0..BufferTag::COUNT as u8 {
            let tag = BufferTag::from_code(code).unwrap();
            let json = serde_json::to_string(&tag).unwrap();
            assert_eq!(json, format!("\"{}\"", tag.name()));
            let back: BufferTag = serde_json::from_str(&json).unwrap();
            assert_eq!(back, tag);
        }
    }

    #[test]
    fn store_skips_unmapped_and_out_of_range() {
        let bank = ImageBank::new();
        let tables = bank.lock();
        assert!(!tables.store(BufferTag::IntMemory, 0, NO_BIT, 7));
        assert!(!tables.store(BufferTag::IntMemory, BUFFER_SIZE, NO_BIT, 7));
        assert_eq!(tables.load(BufferTag::IntMemory, 0, NO_BIT), None);
    }

    #[test]
    fn store_and_load_through_mapped_cells() {
        let bank = ImageBank::new();
        let mut word: IecUint = 0;
        let mut long: IecUlint = 0;
        let mut bit: IecBool = 0;
        {
            let mut tables = bank.lock();
            tables.int_memory[3] = &mut word;
            tables.lint_output[9] = &mut long;
            tables.bool_output[5][2] = &mut bit;
        }
        let tables = bank.lock();
        assert!(tables.store(BufferTag::IntMemory, 3, NO_BIT, 0x12_5678));
        assert_eq!(tables.load(BufferTag::IntMemory, 3, NO_BIT), Some(0x5678));
        assert!(tables.store(BufferTag::LintOutput, 9, NO_BIT, u64::MAX));
        assert_eq!(tables.load(BufferTag::LintOutput, 9, NO_BIT), Some(u64::MAX));
        assert!(tables.store(BufferTag::BoolOutput, 5, 2, 1));
        assert_eq!(tables.load(BufferTag::BoolOutput, 5, 2), Some(1));
        assert!(!tables.store(BufferTag::BoolOutput, 5, 8, 1));
        drop(tables);
        assert_eq!(word, 0x5678);
        assert_eq!(long, u64::MAX);
        assert_eq!(bit, 1);
    }

    #[test]
    fn ffi_take_give_round_trip() {
        let bank = ImageBank::new();
        let raw = Arc::as_ptr(&bank);
        assert_eq!(image_mutex_take(raw), 0);
        assert_eq!(image_mutex_give(raw), 0);
        assert_eq!(image_mutex_take(std::ptr::null()), -1);
        // The guard API still works after a take/give cycle.
        let _guard = bank.lock();
    }
}
