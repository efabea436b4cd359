//! Stack Controller Library
//!
//! Kubernetes controller that reconciles `Stack` resources by driving an
//! infrastructure-as-code automation engine: fetch the program, configure the
//! engine stack, run updates, and clean up on deletion.
//!
//! ## Quick Start
//!
//! ```rust
//! use stack_controller::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod runtime;
