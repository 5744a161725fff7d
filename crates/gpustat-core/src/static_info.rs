//! Per-device cache of static metric values.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{ParseError, QueryError};
use crate::executor::DeviceQueryExecutor;
use crate::metric::{MetricRegistry, MetricValue};
use crate::parse::{parse_value, rows, split_row};

/// Static metric values of one device, keyed by metric id.
pub type StaticInfo = BTreeMap<String, MetricValue>;

/// Lazily populated cache of [`StaticInfo`] records.
///
/// Each device is queried at most once; records are never invalidated.
/// A single lock guards the whole cache since lookups are rare.
pub struct StaticInfoCache {
    executor: Arc<dyn DeviceQueryExecutor>,
    registry: Arc<MetricRegistry>,
    records: Mutex<HashMap<u32, Arc<StaticInfo>>>,
}

impl StaticInfoCache {
    pub fn new(executor: Arc<dyn DeviceQueryExecutor>, registry: Arc<MetricRegistry>) -> Self {
        Self {
            executor,
            registry,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the static metrics of `device`, querying the tool on first use.
    pub fn get_static_info(&self, device: u32) -> Result<Arc<StaticInfo>, QueryError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(info) = records.get(&device) {
            return Ok(info.clone());
        }

        let info = Arc::new(self.fetch(device)?);
        debug!(device, metrics = info.len(), "static info cached");
        records.insert(device, info.clone());
        Ok(info)
    }

    fn fetch(&self, device: u32) -> Result<StaticInfo, QueryError> {
        let metrics: Vec<_> = self
            .registry
            .static_ids()
            .into_iter()
            .filter_map(|id| self.registry.get(id))
            .collect();
        if metrics.is_empty() {
            return Ok(StaticInfo::new());
        }

        let parameters: Vec<&str> = metrics.iter().filter_map(|m| m.query_parameter()).collect();
        let output = self.executor.query(&parameters, Some(device))?;

        let line = rows(&output).next().unwrap_or_default();
        let fields = split_row(line);
        if fields.len() != metrics.len() {
            return Err(ParseError::FieldCount {
                expected: metrics.len(),
                found: fields.len(),
                line: line.to_string(),
            }
            .into());
        }

        metrics
            .iter()
            .zip(fields)
            .map(|(metric, raw)| {
                parse_value(raw, metric.value_type)
                    .map(|value| (metric.id.to_string(), value))
                    .map_err(QueryError::from)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::MockExecutor;
    use crate::metric::{GPU_NAME, POWER_LIMIT, TOTAL_MEMORY};
    use std::thread;
    use std::time::Duration;

    fn cache(mock: Arc<MockExecutor>) -> StaticInfoCache {
        StaticInfoCache::new(mock, Arc::new(MetricRegistry::nvidia().unwrap()))
    }

    #[test]
    fn test_static_info_typed_values() {
        let mock = Arc::new(MockExecutor::two_gpus());
        let cache = cache(mock.clone());

        let info = cache.get_static_info(1).unwrap();
        assert_eq!(
            info.get(GPU_NAME),
            Some(&MetricValue::Text("NVIDIA GeForce RTX 3070".to_string()))
        );
        // "8192.0" parses as an integer.
        assert_eq!(info.get(TOTAL_MEMORY), Some(&MetricValue::Int(8192)));
        assert_eq!(info.get(POWER_LIMIT), Some(&MetricValue::Float(220.0)));
        assert_eq!(info.len(), 3);

        let queries = mock.recorded_queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(
            queries[0].parameters,
            vec!["name", "memory.total", "power.max_limit"]
        );
        assert_eq!(queries[0].device, Some(1));
    }

    #[test]
    fn test_static_info_fetched_once_per_device() {
        let mock = Arc::new(MockExecutor::two_gpus());
        let cache = cache(mock.clone());

        for _ in 0..5 {
            cache.get_static_info(0).unwrap();
            cache.get_static_info(1).unwrap();
        }
        assert_eq!(mock.queries_for_device(0), 1);
        assert_eq!(mock.queries_for_device(1), 1);
        assert_eq!(mock.query_calls(), 2);
    }

    #[test]
    fn test_concurrent_first_callers_share_one_query() {
        let mock = Arc::new(MockExecutor::two_gpus().with_latency(Duration::from_millis(50)));
        let cache = Arc::new(cache(mock.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || cache.get_static_info(0).unwrap())
            })
            .collect();
        let records: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(records.iter().all(|r| Arc::ptr_eq(r, &records[0])));
        assert_eq!(mock.queries_for_device(0), 1);
        assert_eq!(mock.query_calls(), 1);
    }

    #[test]
    fn test_static_info_field_count_mismatch() {
        let mock = Arc::new(MockExecutor::two_gpus().with_response("Tesla T4, 15360\n"));
        let cache = cache(mock);

        assert!(matches!(
            cache.get_static_info(0),
            Err(QueryError::Parse(ParseError::FieldCount {
                expected: 3,
                found: 2,
                ..
            }))
        ));
    }

    #[test]
    fn test_static_info_failure_not_cached() {
        let mock = Arc::new(MockExecutor::two_gpus().fail_after(0));
        let cache = cache(mock.clone());

        assert!(matches!(
            cache.get_static_info(0),
            Err(QueryError::Execution(_))
        ));
        assert!(cache.get_static_info(0).is_err());
        assert_eq!(mock.query_calls(), 2);
    }
}
