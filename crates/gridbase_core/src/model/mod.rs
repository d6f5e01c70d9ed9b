//! Domain model for the metadata-driven table engine.
//!
//! # Responsibility
//! - Define schema, record, view, permission, notification and audit shapes.
//! - Keep value coercion next to the column type it dispatches on.
//!
//! # Invariants
//! - Every entity is identified by a stable `Uuid`.
//! - Positions are 1-based within their sibling set.

pub mod audit;
pub mod notification;
pub mod permission;
pub mod record;
pub mod schema;
pub mod value;
pub mod view;
