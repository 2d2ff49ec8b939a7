//! On-demand synchronisation: the per-operation RW handler.
//!
//! Reads take the image mutex, copy the mapped range into the caller's
//! buffer with wire endianness, release, and accept. Writes never touch
//! the image mutex: each element becomes a journal write with the mapped
//! range's buffer tag, applied by the executive at the next tick. Writes
//! to input-kind mappings are silently dropped; input areas are read-only
//! from the field bus.

use std::collections::HashMap;

use plc_image::Width;
use plc_pluginapi::{ImageView, PluginRuntimeArgs};

use crate::areas::{AreaId, AreaMapping};
use crate::codec::{get_u16_be, get_u32_be, get_u64_be, put_u16_be, put_u32_be, put_u64_be};
use crate::server::{AccessStatus, AreaKey, AreaKind, RwAreaHandler, RwTag};

pub fn area_key(id: AreaId) -> AreaKey {
    match id {
        AreaId::Pe => (AreaKind::Pe, 0),
        AreaId::Pa => (AreaKind::Pa, 0),
        AreaId::Mk => (AreaKind::Mk, 0),
        AreaId::Db(n) => (AreaKind::Db, n),
    }
}

pub struct ImageRwHandler {
    args: PluginRuntimeArgs,
    view: ImageView,
    mappings: HashMap<AreaKey, (AreaMapping, usize)>,
}

impl ImageRwHandler {
    pub fn new(
        args: &PluginRuntimeArgs,
        mappings: impl IntoIterator<Item = (AreaId, AreaMapping, usize)>,
    ) -> Self {
        Self {
            args: *args,
            view: ImageView::new(args),
            mappings: mappings
                .into_iter()
                .map(|(id, mapping, size)| (area_key(id), (mapping, size)))
                .collect(),
        }
    }

    /// Resolve an operation to (mapping, first element index, element
    /// count). `None` when the range is not element-aligned.
    fn locate(&self, tag: &RwTag) -> Option<(AreaMapping, usize, usize)> {
        let (mapping, size) = self.mappings.get(&(tag.kind, tag.db_number))?;
        if tag.start + tag.len > *size {
            return None;
        }
        let elem = mapping.tag.element_size();
        if tag.start % elem != 0 || tag.len % elem != 0 {
            return None;
        }
        Some((*mapping, mapping.start + tag.start / elem, tag.len / elem))
    }
}

impl RwAreaHandler for ImageRwHandler {
    fn area_read(&self, _client: u32, tag: &RwTag, buf: &mut [u8]) -> AccessStatus {
        let Some((mapping, first, count)) = self.locate(tag) else {
            return AccessStatus::Reject;
        };
        let kind = mapping.tag;

        (self.args.mutex_take)(self.args.image_bank);
        // Safety: between take and give the image mutex is held.
        unsafe {
            for i in 0..count {
                let index = first + i;
                if index >= self.view.buffer_size() {
                    break; // clamp: the rest of the buffer stays zero
                }
                match kind.width() {
                    Width::Bool => {
                        buf[i] = self.view.load_bool_bank(kind, index).unwrap_or(0);
                    }
                    Width::Byte => {
                        buf[i] = self.view.load_byte(kind, index).unwrap_or(0);
                    }
                    Width::Int => {
                        put_u16_be(buf, i * 2, self.view.load_int(kind, index).unwrap_or(0));
                    }
                    Width::Dint => {
                        put_u32_be(buf, i * 4, self.view.load_dint(kind, index).unwrap_or(0));
                    }
                    Width::Lint => {
                        put_u64_be(buf, i * 8, self.view.load_lint(kind, index).unwrap_or(0));
                    }
                }
            }
        }
        (self.args.mutex_give)(self.args.image_bank);
        AccessStatus::Accept
    }

    fn area_write(&self, _client: u32, tag: &RwTag, data: &[u8]) -> AccessStatus {
        let Some((mapping, first, count)) = self.locate(tag) else {
            return AccessStatus::Reject;
        };
        let kind = mapping.tag;
        if kind.is_input() {
            // Input mappings are read-only from the wire; accept and drop.
            return AccessStatus::Accept;
        }
        let code = kind.code();
        let args = &self.args;

        // Single-bit write straight to the addressed bool cell.
        if let Some(bit) = tag.bit {
            if kind.width() != Width::Bool {
                return AccessStatus::Reject;
            }
            let value = data.first().map_or(0, |b| b & 1);
            (args.journal_write_bool)(code, first as u16, bit, value);
            return AccessStatus::Accept;
        }

        for i in 0..count {
            let index = (first + i) as u16;
            match kind.width() {
                Width::Bool => {
                    let byte = data[i];
                    for bit in 0..8u8 {
                        (args.journal_write_bool)(code, index, bit, (byte >> bit) & 1);
                    }
                }
                Width::Byte => {
                    (args.journal_write_byte)(code, index, data[i]);
                }
                Width::Int => {
                    (args.journal_write_int)(code, index, get_u16_be(data, i * 2));
                }
                Width::Dint => {
                    (args.journal_write_dint)(code, index, get_u32_be(data, i * 4));
                }
                Width::Lint => {
                    (args.journal_write_lint)(code, index, get_u64_be(data, i * 8));
                }
            }
        }
        AccessStatus::Accept
    }
}
