//! Exported plugin entry points and lifecycle state.
//!
//! The crate builds as a `cdylib` the plugin driver loads at runtime; the
//! exported symbols below are the native plugin ABI. All state lives in a
//! single process-wide slot, mirroring the one-instance-per-artifact model
//! of the driver.

use std::ffi::c_int;
use std::sync::Arc;

use parking_lot::Mutex;

use plc_pluginapi::{ImageView, PluginLogger, PluginRuntimeArgs};

use crate::areas::{AreaId, AreaMapping, RuntimeArea};
use crate::config::{LoggingFlags, S7Config, SyncMode};
use crate::ondemand::{ImageRwHandler, area_key};
use crate::server::{S7Server, ServerEvent, ServerParams};
use crate::sync::SyncEngine;

struct S7Plugin {
    logger: PluginLogger,
    config: S7Config,
    server: Option<S7Server>,
    areas: Vec<RuntimeArea>,
    sync: Option<SyncEngine>,
    running: bool,
}

static STATE: Mutex<Option<S7Plugin>> = Mutex::new(None);

/// Every configured mapping as (identity, mapping, size in bytes).
fn mapping_entries(config: &S7Config) -> Vec<(AreaId, AreaMapping, usize)> {
    let mut entries = Vec::new();
    for (id, area) in [
        (AreaId::Pe, &config.system_areas.pe_area),
        (AreaId::Pa, &config.system_areas.pa_area),
        (AreaId::Mk, &config.system_areas.mk_area),
    ] {
        if !area.enabled || area.size_bytes == 0 {
            continue;
        }
        if let Some(mapping) = &area.mapping {
            entries.push((
                id,
                AreaMapping {
                    tag: mapping.kind,
                    start: mapping.start_buffer,
                    bit_addressing: mapping.bit_addressing,
                },
                area.size_bytes,
            ));
        }
    }
    for db in &config.data_blocks {
        entries.push((
            AreaId::Db(db.db_number),
            AreaMapping {
                tag: db.mapping.kind,
                start: db.mapping.start_buffer,
                bit_addressing: db.mapping.bit_addressing,
            },
            db.size_bytes,
        ));
    }
    entries
}

fn log_event(logger: &PluginLogger, flags: &LoggingFlags, event: &ServerEvent) {
    match event {
        ServerEvent::Started { port } => logger.info(&format!("server started on port {port}")),
        ServerEvent::Stopped => logger.info("server stopped"),
        ServerEvent::ClientConnected { client, peer } => {
            if flags.log_connections {
                logger.info(&format!("client {client} connected from {peer}"));
            }
        }
        ServerEvent::ClientDisconnected { client } => {
            if flags.log_connections {
                logger.info(&format!("client {client} disconnected"));
            }
        }
        ServerEvent::ClientRejected { peer } => {
            logger.warn(&format!("client rejected from {peer} (client limit)"));
        }
        ServerEvent::DataRead { client } => {
            if flags.log_data_access {
                logger.debug(&format!("data read by client {client}"));
            }
        }
        ServerEvent::DataWrite { client } => {
            if flags.log_data_access {
                logger.debug(&format!("data write by client {client}"));
            }
        }
    }
}

fn build_plugin(args: &PluginRuntimeArgs, logger: PluginLogger, config: S7Config) -> S7Plugin {
    let params = ServerParams::from_settings(&config.server);
    let mut server = S7Server::new(params);

    let sink_logger = logger;
    let sink_flags = config.logging.clone();
    server.set_event_sink(Arc::new(move |event| {
        log_event(&sink_logger, &sink_flags, event);
    }));

    let entries = mapping_entries(&config);
    let mut areas = Vec::new();
    let mut sync = None;

    match config.sync_mode {
        SyncMode::DoubleBuffered => {
            for (id, mapping, size) in &entries {
                let area = RuntimeArea {
                    id: *id,
                    mapping: *mapping,
                    size_bytes: *size,
                    s7: crate::areas::SharedBuffer::new(*size),
                    shadow: vec![0u8; *size],
                };
                let (kind, number) = area_key(*id);
                match server.register_shared_area(kind, number, area.s7.clone()) {
                    Ok(()) => {
                        logger.debug(&format!(
                            "registered {} ({} bytes, double-buffered) -> {}[{}]",
                            id,
                            size,
                            mapping.tag.name(),
                            mapping.start
                        ));
                        areas.push(area);
                    }
                    Err(err) => logger.warn(&format!("failed to register {id}: {err}")),
                }
            }
            sync = Some(SyncEngine::new(ImageView::new(args)));
        }
        SyncMode::OnDemand => {
            for (id, mapping, size) in &entries {
                let (kind, number) = area_key(*id);
                match server.register_callback_area(kind, number, *size) {
                    Ok(()) => logger.debug(&format!(
                        "registered {} ({} bytes, on-demand) -> {}[{}]",
                        id,
                        size,
                        mapping.tag.name(),
                        mapping.start
                    )),
                    Err(err) => logger.warn(&format!("failed to register {id}: {err}")),
                }
            }
            server.set_rw_handler(Arc::new(ImageRwHandler::new(args, entries)));
        }
    }

    S7Plugin {
        logger,
        config,
        server: Some(server),
        areas,
        sync,
        running: false,
    }
}

/// # Safety
/// `args` must be null or point at a live [`PluginRuntimeArgs`]; the
/// driver guarantees the latter for the duration of the call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn init(args: *const PluginRuntimeArgs) -> c_int {
    let mut logger = PluginLogger::new("S7COMM");
    logger.info("initializing S7 front end");
    if args.is_null() {
        logger.error("init args is null");
        return -1;
    }
    // Copy the bundle; the driver's pointer dies when this call returns.
    let args = unsafe { *args };
    logger.bind(&args);

    let config = match args.config_path() {
        None => {
            logger.warn("no config file configured, using defaults");
            S7Config::default()
        }
        Some(path) => match S7Config::load(&path) {
            Ok(config) => {
                logger.info(&format!("configuration loaded from {}", path.display()));
                config
            }
            Err(err) => {
                logger.error(&format!("configuration rejected: {err}"));
                logger.warn("using default configuration");
                S7Config::default()
            }
        },
    };

    if !config.server.enabled {
        logger.info("server disabled in configuration");
        *STATE.lock() = Some(S7Plugin {
            logger,
            config,
            server: None,
            areas: Vec::new(),
            sync: None,
            running: false,
        });
        return 0;
    }

    logger.info(&format!(
        "server config: port={}, max_clients={}, pdu_size={}, mode={:?}",
        config.server.port, config.server.max_clients, config.server.pdu_size, config.sync_mode
    ));
    logger.info(&format!(
        "identity: {} ({})",
        config.plc_identity.name, config.plc_identity.module_type
    ));
    logger.info(&format!("data blocks configured: {}", config.data_blocks.len()));

    let plugin = build_plugin(&args, logger, config);
    *STATE.lock() = Some(plugin);
    0
}

#[unsafe(no_mangle)]
pub extern "C" fn start_loop() {
    let mut state = STATE.lock();
    let Some(plugin) = state.as_mut() else {
        PluginLogger::new("S7COMM").error("cannot start: plugin not initialized");
        return;
    };
    if !plugin.config.server.enabled {
        plugin.logger.info("server disabled; start is a no-op");
        return;
    }
    if plugin.running {
        plugin.logger.warn("server already running");
        return;
    }
    let Some(server) = plugin.server.as_mut() else {
        return;
    };
    plugin.logger.info(&format!(
        "starting server on {}:{}",
        plugin.config.server.bind_address, plugin.config.server.port
    ));
    match server.start() {
        Ok(()) => {
            plugin.running = true;
        }
        Err(err) => {
            plugin.logger.error(&format!("failed to start server: {err}"));
            if plugin.config.server.port < 1024 {
                plugin
                    .logger
                    .error("ports below 1024 require elevated privileges");
            }
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn stop_loop() {
    let mut state = STATE.lock();
    let Some(plugin) = state.as_mut() else {
        return;
    };
    if !plugin.running {
        plugin.logger.debug("server already stopped");
        return;
    }
    plugin.logger.info("stopping server");
    if let Some(server) = plugin.server.as_mut() {
        server.stop();
    }
    plugin.running = false;
}

/// With double buffering all synchronisation happens at `cycle_end`;
/// clients read their own buffer asynchronously in between.
#[unsafe(no_mangle)]
pub extern "C" fn cycle_start() {}

#[unsafe(no_mangle)]
pub extern "C" fn cycle_end() {
    let mut state = STATE.lock();
    let Some(plugin) = state.as_mut() else {
        return;
    };
    if !plugin.running || plugin.config.sync_mode != SyncMode::DoubleBuffered {
        return;
    }
    let Some(server) = plugin.server.as_ref() else {
        return;
    };
    if server.client_count() == 0 {
        // Nobody is looking; skip the whole sync.
        return;
    }
    if let Some(sync) = &plugin.sync {
        sync.cycle_end_sync(&mut plugin.areas);
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cleanup() {
    let mut state = STATE.lock();
    let Some(mut plugin) = state.take() else {
        return;
    };
    plugin.logger.info("cleaning up S7 front end");
    if let Some(server) = plugin.server.as_mut() {
        server.stop();
    }
    plugin.logger.info("cleanup complete");
}
