//! S7-compatible front-end plugin.
//!
//! Exposes the image tables to S7 clients (HMIs, SCADA) as data blocks and
//! PE/PA/MK system areas. Two synchronisation policies are built in and a
//! deployment picks one in its configuration:
//!
//! - **double_buffered** (default): clients operate on S7-facing buffers
//!   registered with the server; the plugin's `cycle_end` hook syncs
//!   S7 <-> shadow <-> image while the executive holds the image mutex.
//!   When no client is connected the sync is skipped entirely.
//! - **on_demand**: every client operation runs through a callback that
//!   reads the image under its mutex and turns writes into journal
//!   records.
//!
//! In both policies writes arriving for input-kind mappings are dropped
//! before they can reach the image.

pub mod areas;
pub mod codec;
pub mod config;
pub mod ondemand;
pub mod plugin;
pub mod server;
pub mod sync;

pub use areas::{AreaId, AreaMapping, RuntimeArea, SharedBuffer};
pub use config::{S7Config, SyncMode};
pub use ondemand::ImageRwHandler;
pub use server::{AccessStatus, AreaKind, RwAreaHandler, RwTag, S7Server, ServerParams};
pub use sync::SyncEngine;
