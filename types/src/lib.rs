//! Data model shared by the wheelspin engine, server and client.
//!
//! Everything here is plain data with serde derives. Field names are
//! serialized in camelCase, which is the JSON convention the wheel UI
//! and third-party rewards systems already speak.

pub mod api;
pub mod wheel;

pub use wheel::*;
