//! # Configuration
//!
//! Controller-level settings. Per-Stack settings live on the CRD.

mod controller;

pub use controller::ControllerConfig;
