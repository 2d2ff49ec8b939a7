//! Double-buffered cycle synchronisation (image <-> shadow <-> S7).
//!
//! Runs inside the plugin's `cycle_end` hook, while the executive already
//! holds the image mutex. Per area the sequence is:
//!
//! 1. take the S7 lock briefly, copy S7 -> shadow, release;
//! 2. apply shadow -> image, output and memory mappings only (client
//!    writes to input-kind mappings never reach the image);
//! 3. read image -> shadow for every mapping kind;
//! 4. take the S7 lock briefly, copy shadow -> S7, release.
//!
//! All multi-byte values cross the shadow boundary in wire byte order, so
//! after step 3 a shadow matches its image range bit for bit modulo the
//! big-endian conversion.

use plc_image::{BufferTag, Width};
use plc_pluginapi::ImageView;

use crate::areas::RuntimeArea;
use crate::codec::{get_u16_be, get_u32_be, get_u64_be, put_u16_be, put_u32_be, put_u64_be};

pub struct SyncEngine {
    view: ImageView,
}

impl SyncEngine {
    pub fn new(view: ImageView) -> Self {
        Self { view }
    }

    /// Number of whole elements of `tag` that fit both the area and the
    /// image, starting at image index `start`.
    fn clamp_elements(&self, tag: BufferTag, start: usize, size_bytes: usize) -> usize {
        let in_area = size_bytes / tag.element_size();
        let in_image = self.view.buffer_size().saturating_sub(start);
        in_area.min(in_image)
    }

    /// Full cycle_end synchronisation over every area.
    pub fn cycle_end_sync(&self, areas: &mut [RuntimeArea]) {
        for area in areas.iter_mut() {
            let s7 = area.s7.lock();
            area.shadow.copy_from_slice(&s7);
        }
        for area in areas.iter_mut() {
            self.shadow_to_image(area);
        }
        for area in areas.iter_mut() {
            self.image_to_shadow(area);
        }
        for area in areas.iter_mut() {
            let mut s7 = area.s7.lock();
            s7.copy_from_slice(&area.shadow);
        }
    }

    /// Apply client writes captured in the shadow to the mapped image
    /// range. Input-kind mappings are read-only from the field bus and are
    /// skipped entirely.
    fn shadow_to_image(&self, area: &mut RuntimeArea) {
        let tag = area.mapping.tag;
        if tag.is_input() {
            return;
        }
        let start = area.mapping.start;
        let n = self.clamp_elements(tag, start, area.size_bytes);
        let shadow = &area.shadow;
        // Safety: cycle_end runs under the image mutex held by the executive.
        unsafe {
            match tag.width() {
                Width::Bool => {
                    for i in 0..n {
                        self.view.store_bool_bank(tag, start + i, shadow[i]);
                    }
                }
                Width::Byte => {
                    for i in 0..n {
                        self.view.store_byte(tag, start + i, shadow[i]);
                    }
                }
                Width::Int => {
                    for i in 0..n {
                        self.view.store_int(tag, start + i, get_u16_be(shadow, i * 2));
                    }
                }
                Width::Dint => {
                    for i in 0..n {
                        self.view.store_dint(tag, start + i, get_u32_be(shadow, i * 4));
                    }
                }
                Width::Lint => {
                    for i in 0..n {
                        self.view.store_lint(tag, start + i, get_u64_be(shadow, i * 8));
                    }
                }
            }
        }
    }

    /// Refresh the shadow from the mapped image range, every kind.
    /// Unmapped non-bool cells leave their shadow bytes untouched; bool
    /// banks pack unmapped bits as zero.
    fn image_to_shadow(&self, area: &mut RuntimeArea) {
        let tag = area.mapping.tag;
        let start = area.mapping.start;
        let n = self.clamp_elements(tag, start, area.size_bytes);
        let shadow = &mut area.shadow;
        // Safety: as above, the image mutex is held by the executive.
        unsafe {
            match tag.width() {
                Width::Bool => {
                    for i in 0..n {
                        if let Some(packed) = self.view.load_bool_bank(tag, start + i) {
                            shadow[i] = packed;
                        }
                    }
                }
                Width::Byte => {
                    for i in 0..n {
                        if let Some(v) = self.view.load_byte(tag, start + i) {
                            shadow[i] = v;
                        }
                    }
                }
                Width::Int => {
                    for i in 0..n {
                        if let Some(v) = self.view.load_int(tag, start + i) {
                            put_u16_be(shadow, i * 2, v);
                        }
                    }
                }
                Width::Dint => {
                    for i in 0..n {
                        if let Some(v) = self.view.load_dint(tag, start + i) {
                            put_u32_be(shadow, i * 4, v);
                        }
                    }
                }
                Width::Lint => {
                    for i in 0..n {
                        if let Some(v) = self.view.load_lint(tag, start + i) {
                            put_u64_be(shadow, i * 8, v);
                        }
                    }
                }
            }
        }
    }
}
