//! Columnar view of a sample buffer.
//!
//! Row form is a list of `(timestamp, device → metric → value)` samples.
//! Column form holds one timestamp list plus, per device and metric, a list
//! of values aligned with it. A cell is `None` when the device or metric was
//! missing from that sample. A device reported with no metric values at all
//! leaves no cell behind, so those rows are listed separately. Expanding the
//! columns back yields exactly the original samples.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metric::MetricValue;
use crate::query::{DeviceData, DeviceMetrics};
use crate::sampler::Sample;

/// Per-metric value columns of one device.
pub type MetricColumns = BTreeMap<String, Vec<Option<MetricValue>>>;

/// Samples converted to columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnarSamples {
    pub timestamps: Vec<DateTime<Utc>>,
    pub data: BTreeMap<u32, MetricColumns>,
    /// Rows in which a device was present without any metric values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub empty_rows: BTreeMap<u32, Vec<usize>>,
}

impl ColumnarSamples {
    pub fn from_samples(samples: &[Sample]) -> Self {
        let rows = samples.len();
        let mut data: BTreeMap<u32, MetricColumns> = BTreeMap::new();
        let mut empty_rows: BTreeMap<u32, Vec<usize>> = BTreeMap::new();

        for (row, sample) in samples.iter().enumerate() {
            for (device, metrics) in &sample.data {
                let columns = data.entry(*device).or_default();
                if metrics.is_empty() {
                    empty_rows.entry(*device).or_default().push(row);
                }
                for (metric, value) in metrics {
                    columns
                        .entry(metric.clone())
                        .or_insert_with(|| vec![None; rows])[row] = Some(value.clone());
                }
            }
        }

        Self {
            timestamps: samples.iter().map(|s| s.timestamp).collect(),
            data,
            empty_rows,
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Re-expands the columns into samples, row by row.
    pub fn into_samples(self) -> Vec<Sample> {
        let mut samples: Vec<Sample> = self
            .timestamps
            .into_iter()
            .map(|timestamp| Sample {
                timestamp,
                data: DeviceData::new(),
            })
            .collect();

        for (device, columns) in self.data {
            for (metric, column) in columns {
                for (sample, cell) in samples.iter_mut().zip(column) {
                    if let Some(value) = cell {
                        sample
                            .data
                            .entry(device)
                            .or_insert_with(DeviceMetrics::new)
                            .insert(metric.clone(), value);
                    }
                }
            }
        }

        for (device, rows) in self.empty_rows {
            for row in rows {
                if let Some(sample) = samples.get_mut(row) {
                    sample.data.entry(device).or_default();
                }
            }
        }

        samples
    }
}

impl From<&[Sample]> for ColumnarSamples {
    fn from(samples: &[Sample]) -> Self {
        Self::from_samples(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::MockExecutor;
    use crate::metric::MetricRegistry;
    use crate::query::QueryEngine;
    use crate::sampler::{SamplerConfig, collect_for};
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::time::Duration;

    fn sample(secs: i64, data: Vec<(u32, Vec<(&str, MetricValue)>)>) -> Sample {
        Sample {
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            data: data
                .into_iter()
                .map(|(device, metrics)| {
                    let metrics = metrics
                        .into_iter()
                        .map(|(id, value)| (id.to_string(), value))
                        .collect();
                    (device, metrics)
                })
                .collect(),
        }
    }

    fn buffer() -> Vec<Sample> {
        let reading = |used: i64, watts: f64| {
            vec![
                ("MEMORY_USED", MetricValue::Int(used)),
                ("WATTAGE", MetricValue::Float(watts)),
            ]
        };
        vec![
            sample(100, vec![(0, reading(10, 70.5)), (1, reading(20, 15.0))]),
            // Device 1 missing from this response.
            sample(101, vec![(0, reading(11, 71.0))]),
            sample(102, vec![(0, reading(12, 72.0)), (1, reading(21, 16.0))]),
        ]
    }

    #[test]
    fn test_columns_aligned_with_timestamps() {
        let columnar = ColumnarSamples::from_samples(&buffer());

        assert_eq!(columnar.len(), 3);
        assert_eq!(
            columnar.data[&0]["MEMORY_USED"],
            vec![
                Some(MetricValue::Int(10)),
                Some(MetricValue::Int(11)),
                Some(MetricValue::Int(12))
            ]
        );
        assert_eq!(
            columnar.data[&1]["WATTAGE"],
            vec![Some(MetricValue::Float(15.0)), None, Some(MetricValue::Float(16.0))]
        );
    }

    #[test]
    fn test_round_trip_reproduces_samples() {
        let samples = buffer();
        let columnar = ColumnarSamples::from_samples(&samples);
        assert_eq!(columnar.into_samples(), samples);
    }

    #[test]
    fn test_round_trip_through_json() {
        let samples = buffer();
        let json = serde_json::to_string(&ColumnarSamples::from(samples.as_slice())).unwrap();
        let columnar: ColumnarSamples = serde_json::from_str(&json).unwrap();
        assert_eq!(columnar.into_samples(), samples);
    }

    #[test]
    fn test_round_trip_keeps_devices_without_metrics() {
        let samples = vec![
            sample(100, vec![(0, vec![]), (1, vec![])]),
            sample(
                101,
                vec![(0, vec![("MEMORY_USED", MetricValue::Int(3))]), (1, vec![])],
            ),
        ];

        let columnar = ColumnarSamples::from_samples(&samples);
        assert_eq!(columnar.empty_rows[&0], vec![0]);
        assert_eq!(columnar.empty_rows[&1], vec![0, 1]);

        let json = serde_json::to_string(&columnar).unwrap();
        let columnar: ColumnarSamples = serde_json::from_str(&json).unwrap();
        assert_eq!(columnar.into_samples(), samples);
    }

    #[test]
    fn test_round_trip_of_metricless_collection() {
        let mock = Arc::new(MockExecutor::two_gpus());
        let registry = Arc::new(MetricRegistry::nvidia().unwrap());
        let engine = QueryEngine::with_executor(registry, mock);
        let config =
            SamplerConfig::new(Duration::from_millis(5), vec![0, 1], Vec::<String>::new());

        let samples = collect_for(&engine, &config, Duration::from_millis(12)).unwrap();
        assert!(!samples.is_empty());
        assert_eq!(samples[0].data.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(ColumnarSamples::from_samples(&samples).into_samples(), samples);
    }

    #[test]
    fn test_empty_rows_omitted_from_json() {
        let json = serde_json::to_string(&ColumnarSamples::from_samples(&buffer())).unwrap();
        assert!(!json.contains("empty_rows"));
    }

    #[test]
    fn test_empty_buffer() {
        let columnar = ColumnarSamples::from_samples(&[]);
        assert!(columnar.is_empty());
        assert!(columnar.data.is_empty());
        assert!(columnar.into_samples().is_empty());
    }
}
