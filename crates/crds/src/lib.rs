//! Config Audit CRD Definitions
//!
//! Kubernetes Custom Resource Definitions and shared reference types for the
//! config audit controller.

pub mod config_audit_report;
pub mod references;

pub use config_audit_report::*;
pub use references::*;

/// API group shared by every CRD in this crate
pub const API_GROUP: &str = "audit.microscaler.io";
