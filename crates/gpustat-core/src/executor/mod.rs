//! Abstraction over the external device query tool.
//!
//! The query engine never runs processes itself. It talks to a
//! [`DeviceQueryExecutor`], which is either the real `nvidia-smi` wrapper
//! ([`NvidiaSmi`]) or an in-memory fake for tests ([`mock::MockExecutor`]).
//!
//! ```text
//!   QueryEngine ──► DeviceCatalog ──┐
//!        │                          │
//!        ├──────► StaticInfoCache ──┤
//!        │                          ▼
//!        └────────────────► DeviceQueryExecutor (trait)
//!                                   │
//!                     ┌─────────────┴─────────────┐
//!                     │                           │
//!               ┌─────▼─────┐              ┌──────▼───────┐
//!               │ NvidiaSmi │              │ MockExecutor │
//!               └───────────┘              └──────────────┘
//! ```

pub mod mock;
mod nvidia_smi;

pub use nvidia_smi::{NvidiaSmi, NvidiaSmiConfig};

use crate::error::ExecError;

/// Query parameter that yields the device index column.
pub const DEVICE_INDEX_PARAMETER: &str = "index";

/// Runs the external device query tool.
pub trait DeviceQueryExecutor: Send + Sync {
    /// Lists device indices, one per output line.
    fn list_device_indices(&self) -> Result<String, ExecError>;

    /// Queries `parameters` and returns comma-delimited text, one line per
    /// device, fields in `parameters` order, no header.
    ///
    /// With `device` set only that device is reported; otherwise every
    /// device is.
    fn query(&self, parameters: &[&str], device: Option<u32>) -> Result<String, ExecError>;
}
