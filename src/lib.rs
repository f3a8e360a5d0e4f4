//! ReDoS Sentinel Library
//!
//! An adaptive defense against regular-expression denial-of-service attacks
//! on HTTP infrastructure. A character-level neural model scores request
//! lines streamed from the proxy; a coordinator retrains it online from
//! labeled replay reports; an adversarial probe generator continually
//! searches the current model for evasive payloads so retraining stays
//! ahead of attackers.
//!
//! # Services
//!
//! - **Detector**: scores request lines over TCP and warns origin servers
//!   about malicious ones ([`detector`]).
//! - **Coordinator**: collects labeled reports, retrains, and publishes
//!   model snapshots ([`coordinator`]).
//! - **Probe generator**: gradient-guided search for payloads the current
//!   model misclassifies ([`adversary`]).
//!
//! # Example
//!
//! ```ignore
//! use redos_sentinel::{DetectorConfig, detector};
//!
//! let config = DetectorConfig::default();
//! detector::run_service(&config)?;
//! ```

pub mod adversary;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod corpus;
pub mod detector;
pub mod model;
pub mod snapshot;
pub mod wire;

// Re-exports for convenience
pub use adversary::{Generator, SearchOutcome};
pub use config::{AdversaryConfig, CoordinatorConfig, DetectorConfig};
pub use corpus::{Corpus, Label};
pub use model::{ModelConfig, ScoringModel};
pub use snapshot::SnapshotDir;
