//! natgate - egress NAT reconciliation for BIG-IP AS3
//!
//! natgate watches egress intent declared as Kubernetes custom resources and
//! keeps the matching SNAT and NAT policy objects declared on a BIG-IP
//! appliance through its AS3 declarative endpoint.
//!
//! # Architecture
//!
//! Change notifications land in per-kind work queues. Workers re-read the
//! current state of every rule hierarchy, synthesize the complete fragment
//! an owner declares in its tenant, and PATCH only the difference against
//! what the appliance reports.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (ExternalService, egress rules, ExternalIPRule)
//! - [`queue`] - Deduplicating work queue with per-key backoff
//! - [`resolver`] - Governing-rule and tenant resolution
//! - [`declaration`] - AS3 object model and fragment synthesis
//! - [`appliance`] - Appliance REST client, response classification, license check
//! - [`controller`] - Workers, kube-backed collaborators and wiring
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod appliance;
pub mod config;
pub mod controller;
pub mod crd;
pub mod declaration;
pub mod error;
pub mod events;
pub mod queue;
pub mod resolver;
pub mod retry;
pub mod telemetry;
pub mod tenant;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
