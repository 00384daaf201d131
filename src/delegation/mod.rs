//! Delegation of tasks to external provider CLIs.
//!
//! # Overview
//!
//! - **DelegationExecutor**: resolves a provider, estimates tokens, reserves
//!   quota, runs the provider command and records the outcome
//! - **ProcessRunner**: subprocess seam; [`TokioProcessRunner`] in production
//! - **Requirement**: routing hint for automatic provider selection
//!
//! # Example
//!
//! ```ignore
//! use conjure::config::ConjureConfig;
//! use conjure::delegation::{DelegationExecutor, DelegationRequest};
//!
//! let config = ConjureConfig::load(None)?;
//! let executor = DelegationExecutor::from_config(&config)?;
//!
//! let request = DelegationRequest::new("Summarize the architecture")
//!     .with_files(vec!["src/**/*.rs".to_string()])
//!     .with_requirement("large_context");
//! let result = executor.dispatch(request).await?;
//! println!("{}", result.status_line());
//! ```

mod command;
mod executor;
mod runner;
mod selection;
mod types;

pub use command::{build_command, expand_file_args, validate_template, TemplateError};
pub use executor::{DelegationExecutor, ExecutorBuilder};
pub use runner::{
    ProcessOutput, ProcessRunner, ProcessSpec, TokioProcessRunner, DEFAULT_MAX_OUTPUT_BYTES,
    TRUNCATION_MARKER,
};
pub use selection::{rank_providers, Requirement};
pub use types::{DelegationRequest, DelegationResult, DryRun, Verification};
