//! # Custom Resource Definitions
//!
//! CRD types for the Stack controller.
//!
//! ## Module Structure
//!
//! - `spec.rs` - Stack spec and resource helpers
//! - `source.rs` - Git and artifact source descriptors, spec validation errors
//! - `resource_ref.rs` - Four-variant value reference
//! - `status.rs` - Status recorded after each run

mod resource_ref;
mod source;
mod spec;
mod status;

pub use resource_ref::{
    EnvSelector, FileSystemSelector, LiteralSelector, ResourceRef, SecretSelector,
};
pub use source::{
    BasicAuth, GitAuthConfig, GitRepo, SourceReference, SpecError, SshAuth, StackSource,
};
pub use spec::{Stack, StackSpec};
pub use status::{Permalink, StackStatus, StackUpdateState, StackUpdateStateMessage};
