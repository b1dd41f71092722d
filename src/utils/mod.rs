//! The `utils` module provides shared definitions used across `tidemq`:
//! the error taxonomy every connection and the broker agree on, and the
//! logging initializer used by the binary and tests.

pub mod error;
pub mod logging;
