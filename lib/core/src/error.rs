//! Error handling foundation for flowrun.
//!
//! Crates define their own domain error enums. Outer layers (the CLI) wrap
//! them in a rootcause [`Report`] so context can be layered on as errors
//! propagate.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;
