//! Journal buffer: the write channel from plugins into the image tables.
//!
//! Plugins never write image cells directly. Each write is recorded here
//! with a monotonically increasing sequence number and applied at a single
//! well-defined point in the scan cycle (`apply_and_clear`, called by the
//! executive while it holds the image mutex, before plugin `cycle_start`
//! hooks run). Records are applied in sequence order, so the last writer
//! wins within a tick.
//!
//! Lock order invariant: the image mutex is taken strictly before the
//! journal mutex. The one sanctioned exception is the emergency flush in
//! [`Journal::push`], which releases the journal mutex, takes the image
//! mutex, re-takes the journal mutex, applies, and keeps only the journal
//! mutex for the pending append. No other code path may take the image
//! mutex while holding the journal mutex.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

use plc_image::{BufferTag, ImageBank, ImageTables, NO_BIT, Width};

/// Fixed journal capacity. Reaching it triggers an emergency flush.
pub const JOURNAL_CAPACITY: usize = 1024;

/// A single pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalRecord {
    /// Assigned at append time; determines apply order within a generation.
    pub sequence: u32,
    pub tag: BufferTag,
    pub index: u16,
    /// 0..8 for bool records, [`NO_BIT`] otherwise.
    pub bit: u8,
    /// Write payload, wide enough for any cell width.
    pub value: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JournalError {
    #[error("journal is not initialized")]
    NotInitialized,
    #[error("buffer tag {tag:?} is not a {expected} tag")]
    TagWidth {
        tag: BufferTag,
        expected: &'static str,
    },
    #[error("bit index {0} out of range 0..8")]
    BitRange(u8),
}

struct JournalState {
    records: Vec<JournalRecord>,
    next_sequence: u32,
    image: Option<Arc<ImageBank>>,
}

/// The journal buffer. One process-global instance backs the plugin ABI
/// (see [`journal`]); independent instances are constructible for tests.
pub struct Journal {
    state: Mutex<JournalState>,
}

impl Journal {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(JournalState {
                records: Vec::new(),
                next_sequence: 0,
                image: None,
            }),
        }
    }

    /// Bind the journal to the image bank and reset all state. Must run
    /// before any plugin can write.
    pub fn init(&self, image: Arc<ImageBank>) {
        let mut state = self.state.lock();
        state.records = Vec::with_capacity(JOURNAL_CAPACITY);
        state.next_sequence = 0;
        state.image = Some(image);
        debug!(target: "journal", capacity = JOURNAL_CAPACITY, "journal_initialized");
    }

    /// Drop the image binding and all pending records.
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        state.records = Vec::new();
        state.next_sequence = 0;
        state.image = None;
        debug!(target: "journal", "journal_cleaned_up");
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().image.is_some()
    }

    pub fn write_bool(
        &self,
        tag: BufferTag,
        index: u16,
        bit: u8,
        value: bool,
    ) -> Result<(), JournalError> {
        if tag.width() != Width::Bool {
            return Err(JournalError::TagWidth {
                tag,
                expected: "bool",
            });
        }
        if bit > 7 {
            return Err(JournalError::BitRange(bit));
        }
        self.push(tag, index, bit, u64::from(value))
    }

    pub fn write_byte(&self, tag: BufferTag, index: u16, value: u8) -> Result<(), JournalError> {
        if tag.width() != Width::Byte {
            return Err(JournalError::TagWidth {
                tag,
                expected: "byte",
            });
        }
        self.push(tag, index, NO_BIT, u64::from(value))
    }

    pub fn write_int(&self, tag: BufferTag, index: u16, value: u16) -> Result<(), JournalError> {
        if tag.width() != Width::Int {
            return Err(JournalError::TagWidth {
                tag,
                expected: "int",
            });
        }
        self.push(tag, index, NO_BIT, u64::from(value))
    }

    pub fn write_dint(&self, tag: BufferTag, index: u16, value: u32) -> Result<(), JournalError> {
        if tag.width() != Width::Dint {
            return Err(JournalError::TagWidth {
                tag,
                expected: "dint",
            });
        }
        self.push(tag, index, NO_BIT, u64::from(value))
    }

    pub fn write_lint(&self, tag: BufferTag, index: u16, value: u64) -> Result<(), JournalError> {
        if tag.width() != Width::Lint {
            return Err(JournalError::TagWidth {
                tag,
                expected: "lint",
            });
        }
        self.push(tag, index, NO_BIT, value)
    }

    /// Append one validated record, flushing first when the buffer is full.
    fn push(&self, tag: BufferTag, index: u16, bit: u8, value: u64) -> Result<(), JournalError> {
        let mut state = self.state.lock();
        if state.image.is_none() {
            return Err(JournalError::NotInitialized);
        }
        if state.records.len() >= JOURNAL_CAPACITY {
            state = self.emergency_flush(state);
            if state.image.is_none() {
                return Err(JournalError::NotInitialized);
            }
        }
        let sequence = state.next_sequence;
        state.next_sequence = state.next_sequence.wrapping_add(1);
        state.records.push(JournalRecord {
            sequence,
            tag,
            index,
            bit,
            value,
        });
        Ok(())
    }

    /// Drain a full journal so the pending append has room.
    ///
    /// Enters holding the journal mutex and returns still holding it. In
    /// between it re-establishes the image-before-journal lock order by
    /// releasing, taking the image mutex, and re-taking the journal mutex.
    fn emergency_flush<'a>(
        &'a self,
        guard: MutexGuard<'a, JournalState>,
    ) -> MutexGuard<'a, JournalState> {
        let image = guard.image.clone();
        drop(guard);

        let Some(image) = image else {
            // Torn down while we were waiting; drop the backlog.
            let mut state = self.state.lock();
            state.records.clear();
            state.next_sequence = 0;
            return state;
        };

        let tables = image.lock();
        let mut state = self.state.lock();
        let applied = state.records.len();
        Self::apply_locked(&mut state, &tables);
        drop(tables);
        warn!(target: "journal", applied, "emergency_flush");
        state
    }

    /// Apply every pending record to the image tables and reset both the
    /// record count and the sequence counter.
    ///
    /// The caller must hold the image mutex; the `tables` reference is the
    /// proof. A no-op when the journal was never initialized.
    pub fn apply_and_clear(&self, tables: &ImageTables) {
        let mut state = self.state.lock();
        if state.image.is_none() {
            return;
        }
        Self::apply_locked(&mut state, tables);
    }

    fn apply_locked(state: &mut JournalState, tables: &ImageTables) {
        for record in &state.records {
            // Out-of-range indices and unmapped cells are skipped inside
            // `store`; the write simply has no effect.
            tables.store(record.tag, record.index as usize, record.bit, record.value);
        }
        state.records.clear();
        state.next_sequence = 0;
    }

    /// Number of records waiting to be applied.
    pub fn pending_count(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Next sequence number to be assigned; resets to 0 on apply.
    pub fn get_sequence(&self) -> u32 {
        self.state.lock().next_sequence
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: Journal = Journal::new();

/// The process-global journal instance backing the plugin ABI shims.
pub fn journal() -> &'static Journal {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use plc_image::BufferTag::*;

    #[test]
    fn writes_before_init_are_rejected() {
        let journal = Journal::new();
        assert_eq!(
            journal.write_int(IntMemory, 0, 1),
            Err(JournalError::NotInitialized)
        );
        assert_eq!(journal.pending_count(), 0);
    }

    #[test]
    fn width_validation_rejects_wrong_tags() {
        let journal = Journal::new();
        journal.init(ImageBank::new());

        assert!(matches!(
            journal.write_bool(IntMemory, 0, 0, true),
            Err(JournalError::TagWidth { .. })
        ));
        assert!(matches!(
            journal.write_byte(ByteInput, 0, 1),
            Ok(())
        ));
        // Byte has no memory variant anywhere in the tag set.
        assert!(matches!(
            journal.write_byte(IntMemory, 0, 1),
            Err(JournalError::TagWidth { .. })
        ));
        assert!(matches!(
            journal.write_int(DintOutput, 0, 1),
            Err(JournalError::TagWidth { .. })
        ));
        assert!(matches!(
            journal.write_lint(LintMemory, 0, 1),
            Ok(())
        ));
        // Only the two accepted writes made it in.
        assert_eq!(journal.pending_count(), 2);
    }

    #[test]
    fn bool_bit_range_is_validated() {
        let journal = Journal::new();
        journal.init(ImageBank::new());
        assert_eq!(
            journal.write_bool(BoolOutput, 0, 8, true),
            Err(JournalError::BitRange(8))
        );
        assert_eq!(journal.pending_count(), 0);
        assert_eq!(journal.get_sequence(), 0);
        assert!(journal.write_bool(BoolOutput, 0, 7, true).is_ok());
        assert_eq!(journal.get_sequence(), 1);
    }

    #[test]
    fn cleanup_resets_everything() {
        let journal = Journal::new();
        journal.init(ImageBank::new());
        journal.write_int(IntMemory, 1, 2).unwrap();
        assert!(journal.is_initialized());
        journal.cleanup();
        assert!(!journal.is_initialized());
        assert_eq!(journal.pending_count(), 0);
        assert_eq!(journal.get_sequence(), 0);
    }
}
