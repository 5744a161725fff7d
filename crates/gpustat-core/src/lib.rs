//! gpustat-core - GPU metrics sampling library.
//!
//! Provides:
//! - `metric`: metric registry (types, staticness, query parameters, derivations)
//! - `executor`: query tool abstraction, `nvidia-smi` runner and mock
//! - `catalog`: cached device discovery
//! - `static_info`: per-device cache of static metrics
//! - `query`: validated one-shot queries with derived metrics
//! - `sampler`: background sampling sessions and bounded collection
//! - `columnar`: column-oriented view of sample buffers
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use gpustat_core::executor::mock::MockExecutor;
//! use gpustat_core::metric::{MetricRegistry, MEMORY_USED, MEMORY_USED_PERCENTAGE};
//! use gpustat_core::query::QueryEngine;
//!
//! let registry = Arc::new(MetricRegistry::nvidia().unwrap());
//! let engine = QueryEngine::with_executor(registry, Arc::new(MockExecutor::two_gpus()));
//! let data = engine
//!     .query_devices(&[1], &[MEMORY_USED, MEMORY_USED_PERCENTAGE])
//!     .unwrap();
//! assert_eq!(data[&1][MEMORY_USED_PERCENTAGE].as_f64(), Some(25.0));
//! ```

pub mod catalog;
pub mod columnar;
pub mod error;
pub mod executor;
pub mod metric;
pub mod parse;
pub mod query;
pub mod sampler;
pub mod static_info;

pub use catalog::DeviceCatalog;
pub use columnar::ColumnarSamples;
pub use error::{ExecError, InvalidInput, LifecycleError, ParseError, QueryError, RegistryError};
pub use executor::{DeviceQueryExecutor, NvidiaSmi, NvidiaSmiConfig};
pub use metric::{MetricDef, MetricRegistry, MetricValue, ValueType};
pub use query::{DeviceData, DeviceMetrics, QueryEngine};
pub use sampler::{Sample, SamplerConfig, SamplingSession, SessionState, collect_for};
pub use static_info::{StaticInfo, StaticInfoCache};
