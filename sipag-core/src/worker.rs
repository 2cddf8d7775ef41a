//! Worker identity/runtime data model (§3, §4.4).

pub mod model;
