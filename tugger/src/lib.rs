//! Kubernetes admission webhook that keeps pod images on trusted registries
//!
//! Every container image of an incoming pod is run through an ordered list of
//! pattern rules. The mutating endpoint rewrites images onto a private
//! registry with a JSON patch, the validating endpoint rejects pods whose
//! images no rule trusts. Without a rule file a registry whitelist is used.

pub mod admission;
pub mod config;
pub mod error;
pub mod notify;
pub mod patch;
pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod rule;
pub mod server;

pub use error::{AdmissionError, Error, PolicyError, Result};
pub use pipeline::{Pipeline, Settings, Verdict};
pub use policy::{Decision, ImagePolicy, LegacyPolicy, Policy};
