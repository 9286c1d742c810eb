//! Core domain types and configuration for the kopi assistant backend.
//!
//! This crate is deliberately light on I/O (catalog file loading is the one
//! exception): planner decision records, calculator results, session
//! snapshots, and the catalog/outlet entities defined here are shared by the
//! agent runtime and the HTTP boundary without dragging either's
//! dependencies along.

pub mod catalog;
pub mod config;
pub mod domain;
pub mod errors;

pub use catalog::{Catalog, CatalogError};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions};
pub use domain::calc::{CalcErrorKind, CalcResult};
pub use domain::decision::{Action, Decision, EntityFlags};
pub use domain::outlet::Outlet;
pub use domain::product::{Product, ProductId};
pub use domain::session::{metadata_keys, SessionSnapshot, Turn};
pub use errors::{EngineError, RequestError, ServiceError, ToolError};
