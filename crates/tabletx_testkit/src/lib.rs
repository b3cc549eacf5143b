//! # tabletx Testkit
//!
//! Test utilities for tabletx.
//!
//! This crate provides:
//! - Sample entities and an in-memory test environment
//! - Property-based test generators using proptest
//! - A call-recording repository decorator
//! - Tracing setup and an event collector for asserting on logs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tabletx_testkit::prelude::*;
//!
//! #[test]
//! fn transfer() {
//!     let env = TestEnv::new();
//!     let accounts = env.seed_accounts(2, 100).unwrap();
//!     env.manager.tx(|| { /* ... */ Ok(()) }).unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod logging;
pub mod recording;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
    pub use crate::recording::*;
}

pub use fixtures::*;
pub use generators::*;
pub use logging::*;
pub use recording::*;
