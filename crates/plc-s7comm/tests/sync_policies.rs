//! Synchronisation policy tests against a mapped image.

use std::path::PathBuf;
use std::sync::Arc;

use plc_driver::{PluginDriver, PluginKind, PluginSpec};
use plc_image::{BUFFER_SIZE, BufferTag, IecBool, IecUint, ImageBank, NO_BIT};
use plc_journal::journal;
use plc_pluginapi::{ImageView, PluginRuntimeArgs};
use plc_s7comm::areas::{AreaId, AreaMapping, RuntimeArea, SharedBuffer};
use plc_s7comm::ondemand::ImageRwHandler;
use plc_s7comm::server::{AccessStatus, AreaKind, RwAreaHandler, RwTag};
use plc_s7comm::sync::SyncEngine;

/// Backing storage for the image ranges these tests map, standing in for
/// the control program's glue step.
struct Fixture {
    bank: Arc<ImageBank>,
    args: Box<PluginRuntimeArgs>,
    int_memory: Box<[IecUint; 16]>,
    int_input: Box<[IecUint; 16]>,
    bool_output: Box<[[IecBool; 8]; 4]>,
    bool_input: Box<[[IecBool; 8]; 4]>,
}

impl Fixture {
    fn new() -> Self {
        let bank = ImageBank::new();
        let mut int_memory = Box::new([0u16; 16]);
        let mut int_input = Box::new([0u16; 16]);
        let mut bool_output = Box::new([[0u8; 8]; 4]);
        let mut bool_input = Box::new([[0u8; 8]; 4]);
        {
            let mut tables = bank.lock();
            for i in 0..16 {
                tables.int_memory[i] = &mut int_memory[i];
                tables.int_input[i] = &mut int_input[i];
            }
            for i in 0..4 {
                for b in 0..8 {
                    tables.bool_output[i][b] = &mut bool_output[i][b];
                    tables.bool_input[i][b] = &mut bool_input[i][b];
                }
            }
        }
        let driver = PluginDriver::new(bank.clone());
        let args = driver.build_runtime_args(&PluginSpec {
            kind: PluginKind::Native,
            path: PathBuf::from("test.so"),
            enabled: true,
            config: None,
            name: None,
        });
        Self {
            bank,
            args,
            int_memory,
            int_input,
            bool_output,
            bool_input,
        }
    }

    fn area(&self, id: AreaId, tag: BufferTag, start: usize, size_bytes: usize) -> RuntimeArea {
        RuntimeArea {
            id,
            mapping: AreaMapping {
                tag,
                start,
                bit_addressing: tag.element_size() == 1,
            },
            size_bytes,
            s7: SharedBuffer::new(size_bytes),
            shadow: vec![0u8; size_bytes],
        }
    }
}

#[test]
fn cycle_end_publishes_image_values_big_endian() {
    let fx = Fixture::new();
    {
        let tables = fx.bank.lock();
        tables.store(BufferTag::IntMemory, 0, NO_BIT, 0x00FF);
        tables.store(BufferTag::IntMemory, 1, NO_BIT, 0x1234);
        tables.store(BufferTag::IntMemory, 2, NO_BIT, 0xA5A5);
    }

    let mut areas = vec![fx.area(AreaId::Db(1), BufferTag::IntMemory, 0, 6)];
    let engine = SyncEngine::new(ImageView::new(&fx.args));
    {
        // The executive holds the image mutex around cycle hooks.
        let _guard = fx.bank.lock();
        engine.cycle_end_sync(&mut areas);
    }

    // Shadow matches the image range bit for bit, modulo endianness.
    assert_eq!(areas[0].shadow, vec![0x00, 0xFF, 0x12, 0x34, 0xA5, 0xA5]);
    // And the published S7 buffer equals the shadow.
    assert_eq!(*areas[0].s7.lock(), areas[0].shadow);
}

#[test]
fn client_writes_reach_outputs_but_never_inputs() {
    let fx = Fixture::new();
    {
        let tables = fx.bank.lock();
        tables.store(BufferTag::IntInput, 4, NO_BIT, 0x0042);
        tables.store(BufferTag::IntMemory, 4, NO_BIT, 0x0042);
    }

    let mut areas = vec![
        fx.area(AreaId::Db(1), BufferTag::IntInput, 4, 4),
        fx.area(AreaId::Db(2), BufferTag::IntMemory, 4, 4),
    ];
    // An S7 client wrote 0xAAAA into the first word of both blocks.
    for area in &areas {
        let mut s7 = area.s7.lock();
        s7[0] = 0xAA;
        s7[1] = 0xAA;
    }

    let engine = SyncEngine::new(ImageView::new(&fx.args));
    {
        let _guard = fx.bank.lock();
        engine.cycle_end_sync(&mut areas);
    }

    // Input mapping: image unchanged, shadow re-published from the image.
    assert_eq!(fx.int_input[4], 0x0042);
    assert_eq!(&areas[0].shadow[..2], &[0x00, 0x42]);
    assert_eq!(&areas[0].s7.lock()[..2], &[0x00, 0x42]);
    // Memory mapping: the client write took effect.
    assert_eq!(fx.int_memory[4], 0xAAAA);
}

#[test]
fn bool_banks_cross_the_shadow_boundary_bit_for_bit() {
    let fx = Fixture::new();
    {
        let tables = fx.bank.lock();
        // 0b0000_0101 on input cell 0.
        tables.store(BufferTag::BoolInput, 0, 0, 1);
        tables.store(BufferTag::BoolInput, 0, 2, 1);
    }

    let mut areas = vec![
        fx.area(AreaId::Pe, BufferTag::BoolInput, 0, 4),
        fx.area(AreaId::Pa, BufferTag::BoolOutput, 0, 4),
    ];
    {
        let mut s7 = areas[1].s7.lock();
        s7[1] = 0b1010_0001;
    }

    let engine = SyncEngine::new(ImageView::new(&fx.args));
    {
        let _guard = fx.bank.lock();
        engine.cycle_end_sync(&mut areas);
    }

    assert_eq!(areas[0].shadow[0], 0b0000_0101);
    assert_eq!(fx.bool_output[1][0], 1);
    assert_eq!(fx.bool_output[1][5], 1);
    assert_eq!(fx.bool_output[1][7], 1);
    assert_eq!(fx.bool_output[1][1], 0);
    assert_eq!(fx.bool_input[0][0], 1, "input bits untouched by sync");
}

#[test]
fn sync_clamps_areas_larger_than_the_image() {
    let fx = Fixture::new();
    // Start near the end of the image: only BUFFER_SIZE - start elements
    // may be touched even though the area is larger.
    let start = BUFFER_SIZE - 2;
    let mut areas = vec![fx.area(AreaId::Db(9), BufferTag::IntMemory, start, 64)];
    let engine = SyncEngine::new(ImageView::new(&fx.args));
    {
        let _guard = fx.bank.lock();
        engine.cycle_end_sync(&mut areas);
    }
    // Nothing to assert beyond "no out-of-bounds access"; the mapped
    // cells live at low indices and stay zero.
    assert_eq!(fx.int_memory[0], 0);
}

#[test]
fn on_demand_read_returns_wire_order_bytes() {
    let fx = Fixture::new();
    {
        let tables = fx.bank.lock();
        tables.store(BufferTag::IntMemory, 0, NO_BIT, 0x00FF);
    }
    let handler = ImageRwHandler::new(
        &fx.args,
        vec![(
            AreaId::Db(1),
            AreaMapping {
                tag: BufferTag::IntMemory,
                start: 0,
                bit_addressing: false,
            },
            64,
        )],
    );

    let mut buf = [0u8; 2];
    let status = handler.area_read(
        1,
        &RwTag {
            kind: AreaKind::Db,
            db_number: 1,
            start: 0,
            len: 2,
            bit: None,
        },
        &mut buf,
    );
    assert_eq!(status, AccessStatus::Accept);
    assert_eq!(buf, [0x00, 0xFF]);
}

#[test]
fn on_demand_writes_journal_and_input_writes_vanish() {
    let fx = Fixture::new();
    journal().init(fx.bank.clone());
    {
        let tables = fx.bank.lock();
        tables.store(BufferTag::IntInput, 4, NO_BIT, 0x0042);
    }

    let handler = ImageRwHandler::new(
        &fx.args,
        vec![
            (
                AreaId::Db(2),
                AreaMapping {
                    tag: BufferTag::IntInput,
                    start: 4,
                    bit_addressing: false,
                },
                16,
            ),
            (
                AreaId::Db(3),
                AreaMapping {
                    tag: BufferTag::IntMemory,
                    start: 0,
                    bit_addressing: false,
                },
                16,
            ),
        ],
    );

    // Write to the input-mapped block: accepted on the wire, dropped.
    let status = handler.area_write(
        1,
        &RwTag {
            kind: AreaKind::Db,
            db_number: 2,
            start: 0,
            len: 2,
            bit: None,
        },
        &[0xAA, 0xAA],
    );
    assert_eq!(status, AccessStatus::Accept);
    assert_eq!(journal().pending_count(), 0, "input writes are not journaled");

    // Write to the memory-mapped block: journaled and applied next tick.
    handler.area_write(
        1,
        &RwTag {
            kind: AreaKind::Db,
            db_number: 3,
            start: 2,
            len: 2,
            bit: None,
        },
        &[0x12, 0x34],
    );
    assert_eq!(journal().pending_count(), 1);

    {
        let tables = fx.bank.lock();
        journal().apply_and_clear(&tables);
    }
    assert_eq!(fx.int_input[4], 0x0042, "image input cell unchanged");
    assert_eq!(fx.int_memory[1], 0x1234);
    journal().cleanup();
}

#[test]
fn on_demand_rejects_misaligned_ranges() {
    let fx = Fixture::new();
    let handler = ImageRwHandler::new(
        &fx.args,
        vec![(
            AreaId::Db(1),
            AreaMapping {
                tag: BufferTag::IntMemory,
                start: 0,
                bit_addressing: false,
            },
            64,
        )],
    );
    let mut buf = [0u8; 3];
    let status = handler.area_read(
        1,
        &RwTag {
            kind: AreaKind::Db,
            db_number: 1,
            start: 1,
            len: 3,
            bit: None,
        },
        &mut buf,
    );
    assert_eq!(status, AccessStatus::Reject);
}
