//! Admission-controlled delegation of analysis tasks to external LLM CLIs.
//!
//! Tasks are routed to provider commands (`gemini`, `qwen`, or anything
//! configured), gated by per-provider request and token quotas, and every
//! attempt is appended to a JSONL usage log from which quota state can be
//! rebuilt.

pub mod budget;
pub mod config;
pub mod delegation;
pub mod error;
pub mod quota;
pub mod registry;
pub mod timeout;
pub mod usage;

pub use config::{ConfigError, ConjureConfig};
pub use delegation::{DelegationExecutor, DelegationRequest, DelegationResult};
pub use error::DelegationError;
pub use registry::{ServiceConfig, ServiceRegistry};
