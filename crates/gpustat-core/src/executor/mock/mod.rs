//! In-memory fake of the device query tool for tests.
//!
//! [`MockExecutor`] answers queries from per-device tables of raw values and
//! counts every invocation, so tests can assert how often the tool was run.
//! [`scenarios`] holds prebuilt device setups.

mod executor;
mod scenarios;

pub use executor::{MockExecutor, RecordedQuery};
