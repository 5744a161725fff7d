//! Query engine: validated one-shot metric queries across devices.
//!
//! A query validates the request against the registry and the device
//! catalog, runs the tool once for every directly queryable metric plus the
//! device index, parses one row per device and then computes derived
//! metrics. Dynamic dependencies come from the row just parsed; static ones
//! come from the [`StaticInfoCache`].

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::catalog::DeviceCatalog;
use crate::error::{InvalidInput, ParseError, QueryError};
use crate::executor::{DEVICE_INDEX_PARAMETER, DeviceQueryExecutor};
use crate::metric::{MetricDef, MetricRegistry, MetricValue};
use crate::parse::{parse_device_index, parse_value, rows, split_row};
use crate::static_info::{StaticInfo, StaticInfoCache};

/// Metric values of one device, keyed by metric id.
pub type DeviceMetrics = BTreeMap<String, MetricValue>;

/// Metric values keyed by device index.
pub type DeviceData = BTreeMap<u32, DeviceMetrics>;

/// A request that passed validation.
struct QueryPlan<'a> {
    /// Metrics fetched from the tool, in request order.
    queried: Vec<&'a MetricDef>,
    /// Derived metrics, in request order.
    derived: Vec<&'a MetricDef>,
}

impl QueryPlan<'_> {
    /// Tool parameters: every queried metric followed by the device index.
    fn parameters(&self) -> Vec<&'static str> {
        self.queried
            .iter()
            .filter_map(|m| m.query_parameter())
            .chain(std::iter::once(DEVICE_INDEX_PARAMETER))
            .collect()
    }
}

/// Runs metric queries against a set of devices.
///
/// The device catalog and static info cache are shared: several engines or
/// sampling sessions may hold the same instances.
pub struct QueryEngine {
    registry: Arc<MetricRegistry>,
    executor: Arc<dyn DeviceQueryExecutor>,
    catalog: Arc<DeviceCatalog>,
    static_info: Arc<StaticInfoCache>,
}

impl QueryEngine {
    pub fn new(
        registry: Arc<MetricRegistry>,
        executor: Arc<dyn DeviceQueryExecutor>,
        catalog: Arc<DeviceCatalog>,
        static_info: Arc<StaticInfoCache>,
    ) -> Self {
        Self {
            registry,
            executor,
            catalog,
            static_info,
        }
    }

    /// Creates an engine with its own, fresh catalog and static info cache.
    pub fn with_executor(
        registry: Arc<MetricRegistry>,
        executor: Arc<dyn DeviceQueryExecutor>,
    ) -> Self {
        let catalog = Arc::new(DeviceCatalog::new(executor.clone()));
        let static_info = Arc::new(StaticInfoCache::new(executor.clone(), registry.clone()));
        Self::new(registry, executor, catalog, static_info)
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    pub fn list_devices(&self) -> Result<Vec<u32>, QueryError> {
        self.catalog.list_devices()
    }

    pub fn get_static_info(&self, device: u32) -> Result<Arc<StaticInfo>, QueryError> {
        self.static_info.get_static_info(device)
    }

    /// Checks a one-shot request without running it.
    pub fn validate<S: AsRef<str>>(
        &self,
        devices: &[u32],
        metrics: &[S],
    ) -> Result<(), QueryError> {
        self.plan(devices, metrics).map(|_| ())
    }

    /// Checks a continuous monitoring request: a valid query that contains
    /// no static metrics.
    pub fn validate_monitoring<S: AsRef<str>>(
        &self,
        devices: &[u32],
        metrics: &[S],
    ) -> Result<(), QueryError> {
        self.plan(devices, metrics)?;
        if let Some(metric) = metrics
            .iter()
            .map(AsRef::as_ref)
            .find(|id| self.registry.is_static(id))
        {
            return Err(InvalidInput::StaticMetric(metric.to_string()).into());
        }
        Ok(())
    }

    /// Queries `metrics` on `devices`.
    ///
    /// Devices that produce no row in the tool's output are absent from the
    /// result. Rows for devices outside `devices` are discarded.
    pub fn query_devices<S: AsRef<str>>(
        &self,
        devices: &[u32],
        metrics: &[S],
    ) -> Result<DeviceData, QueryError> {
        let plan = self.plan(devices, metrics)?;
        let parameters = plan.parameters();

        let start = Instant::now();
        let output = self.executor.query(&parameters, None)?;
        debug!(
            ?parameters,
            duration_ms = start.elapsed().as_millis() as u64,
            "devices queried"
        );

        let mut data = DeviceData::new();
        for line in rows(&output) {
            let fields = split_row(line);
            if fields.len() != parameters.len() {
                return Err(ParseError::FieldCount {
                    expected: parameters.len(),
                    found: fields.len(),
                    line: line.to_string(),
                }
                .into());
            }
            let Some((index, values)) = fields.split_last() else {
                continue;
            };
            let device = parse_device_index(index)?;
            if !devices.contains(&device) {
                continue;
            }
            let row = self.device_metrics(device, &plan, values)?;
            data.insert(device, row);
        }

        Ok(data)
    }

    fn plan<S: AsRef<str>>(
        &self,
        devices: &[u32],
        metrics: &[S],
    ) -> Result<QueryPlan<'_>, QueryError> {
        // Metrics are checked first: it needs no tool invocation.
        let unknown_metrics: BTreeSet<String> = metrics
            .iter()
            .map(AsRef::as_ref)
            .filter(|id| !self.registry.contains(id))
            .map(str::to_string)
            .collect();
        if !unknown_metrics.is_empty() {
            return Err(InvalidInput::UnknownMetrics(unknown_metrics.into_iter().collect()).into());
        }

        let available = self.catalog.list_devices()?;
        let unknown_devices: BTreeSet<u32> = devices
            .iter()
            .copied()
            .filter(|d| !available.contains(d))
            .collect();
        if !unknown_devices.is_empty() {
            return Err(InvalidInput::UnknownDevices(unknown_devices.into_iter().collect()).into());
        }

        let mut requested: Vec<&MetricDef> = Vec::with_capacity(metrics.len());
        let mut seen = HashSet::new();
        for id in metrics.iter().map(AsRef::as_ref) {
            if let Some(def) = self.registry.get(id)
                && seen.insert(def.id)
            {
                requested.push(def);
            }
        }

        for def in &requested {
            let Some(derivation) = def.derivation() else {
                continue;
            };
            for dep in derivation.dependencies {
                if !self.registry.is_static(dep) && !seen.contains(dep) {
                    return Err(InvalidInput::MissingDependency {
                        metric: def.id.to_string(),
                        dependency: dep.to_string(),
                    }
                    .into());
                }
            }
        }

        let (derived, queried): (Vec<_>, Vec<_>) =
            requested.into_iter().partition(|def| def.is_derived());
        Ok(QueryPlan { queried, derived })
    }

    /// Builds one device's metrics from its row values.
    fn device_metrics(
        &self,
        device: u32,
        plan: &QueryPlan<'_>,
        values: &[&str],
    ) -> Result<DeviceMetrics, QueryError> {
        let mut row = DeviceMetrics::new();
        for (metric, raw) in plan.queried.iter().zip(values) {
            row.insert(metric.id.to_string(), parse_value(raw, metric.value_type)?);
        }

        let mut static_info = None;
        for metric in &plan.derived {
            let Some(derivation) = metric.derivation() else {
                continue;
            };
            let mut args = Vec::with_capacity(derivation.dependencies.len());
            for dep in derivation.dependencies {
                let value = self.dependency_value(device, dep, &row, &mut static_info)?;
                let value = value.ok_or_else(|| InvalidInput::MissingDependency {
                    metric: metric.id.to_string(),
                    dependency: dep.to_string(),
                })?;
                args.push(value);
            }
            let value = (derivation.combine)(&args);
            if !value.is_finite() {
                return Err(ParseError::Undefined(metric.id.to_string()).into());
            }
            row.insert(
                metric.id.to_string(),
                MetricValue::from_f64(value, metric.value_type),
            );
        }

        Ok(row)
    }

    /// Looks a dependency up in the parsed row, then in the static info cache.
    fn dependency_value(
        &self,
        device: u32,
        dep: &str,
        row: &DeviceMetrics,
        static_info: &mut Option<Arc<StaticInfo>>,
    ) -> Result<Option<f64>, QueryError> {
        if let Some(value) = row.get(dep) {
            return Ok(value.as_f64());
        }
        if !self.registry.is_static(dep) {
            return Ok(None);
        }
        if static_info.is_none() {
            *static_info = Some(self.static_info.get_static_info(device)?);
        }
        Ok(static_info
            .as_ref()
            .and_then(|info| info.get(dep))
            .and_then(MetricValue::as_f64))
    }
}
