//! Runtime areas: one per configured data block or system area.
//!
//! In double-buffered mode each area owns three regions: the S7-facing
//! buffer registered with the server (shared, guarded by its own short
//! lock), a private shadow, and the mapped image-table range. In on-demand
//! mode only the mapping matters; no buffers are allocated.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use plc_image::BufferTag;

use crate::config::{DataBlockConfig, SystemAreaConfig};

/// Identity of an area on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AreaId {
    /// Process inputs (I area).
    Pe,
    /// Process outputs (Q area).
    Pa,
    /// Markers (M area).
    Mk,
    /// A numbered data block.
    Db(u16),
}

impl fmt::Display for AreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AreaId::Pe => write!(f, "PE"),
            AreaId::Pa => write!(f, "PA"),
            AreaId::Mk => write!(f, "MK"),
            AreaId::Db(n) => write!(f, "DB{n}"),
        }
    }
}

/// An S7-facing buffer shared between the server's client threads and the
/// plugin's cycle hook. The embedded lock is the "S7 mutex" of the
/// double-buffering policy and is only ever held across a memcpy.
#[derive(Clone)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0u8; len])),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock()
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mapping of an area into the image tables.
#[derive(Debug, Clone, Copy)]
pub struct AreaMapping {
    pub tag: BufferTag,
    pub start: usize,
    pub bit_addressing: bool,
}

/// One live area in double-buffered mode.
pub struct RuntimeArea {
    pub id: AreaId,
    pub mapping: AreaMapping,
    pub size_bytes: usize,
    pub s7: SharedBuffer,
    pub shadow: Vec<u8>,
}

impl RuntimeArea {
    pub fn from_data_block(cfg: &DataBlockConfig) -> Self {
        Self::new(
            AreaId::Db(cfg.db_number),
            AreaMapping {
                tag: cfg.mapping.kind,
                start: cfg.mapping.start_buffer,
                bit_addressing: cfg.mapping.bit_addressing,
            },
            cfg.size_bytes,
        )
    }

    /// `None` when the area is disabled or mapped nowhere.
    pub fn from_system_area(id: AreaId, cfg: &SystemAreaConfig) -> Option<Self> {
        if !cfg.enabled || cfg.size_bytes == 0 {
            return None;
        }
        let mapping = cfg.mapping.as_ref()?;
        Some(Self::new(
            id,
            AreaMapping {
                tag: mapping.kind,
                start: mapping.start_buffer,
                bit_addressing: mapping.bit_addressing,
            },
            cfg.size_bytes,
        ))
    }

    fn new(id: AreaId, mapping: AreaMapping, size_bytes: usize) -> Self {
        Self {
            id,
            mapping,
            size_bytes,
            s7: SharedBuffer::new(size_bytes),
            shadow: vec![0u8; size_bytes],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferMapping;

    #[test]
    fn disabled_or_unmapped_system_areas_produce_nothing() {
        let disabled = SystemAreaConfig {
            enabled: false,
            size_bytes: 64,
            mapping: Some(BufferMapping {
                kind: BufferTag::BoolInput,
                start_buffer: 0,
                bit_addressing: true,
            }),
        };
        assert!(RuntimeArea::from_system_area(AreaId::Pe, &disabled).is_none());

        let unmapped = SystemAreaConfig {
            enabled: true,
            size_bytes: 64,
            mapping: None,
        };
        assert!(RuntimeArea::from_system_area(AreaId::Pe, &unmapped).is_none());
    }

    #[test]
    fn data_block_area_allocates_both_buffers() {
        let area = RuntimeArea::from_data_block(&DataBlockConfig {
            db_number: 5,
            description: String::new(),
            size_bytes: 32,
            mapping: BufferMapping {
                kind: BufferTag::IntMemory,
                start_buffer: 4,
                bit_addressing: false,
            },
        });
        assert_eq!(area.id.to_string(), "DB5");
        assert_eq!(area.s7.len(), 32);
        assert_eq!(area.shadow.len(), 32);
        assert_eq!(area.mapping.start, 4);
    }
}
