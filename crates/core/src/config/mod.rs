//! 配置管理
//!
//! Typed configuration for every relay component. [`AppConfig::load`] layers
//! built-in defaults, an optional TOML file and `RELAY_*` environment
//! overrides, then validates cross references between routes, handlers and
//! circuit breakers.

pub mod models;

pub use models::*;
