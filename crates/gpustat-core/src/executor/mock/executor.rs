//! Table-driven fake executor.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::ExecError;
use crate::executor::{DEVICE_INDEX_PARAMETER, DeviceQueryExecutor};

/// Raw value reported for parameters a device does not have.
const NOT_AVAILABLE: &str = "[N/A]";

/// A query the executor received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedQuery {
    pub parameters: Vec<String>,
    pub device: Option<u32>,
}

/// Fake query tool backed by in-memory tables.
///
/// Each device maps query parameters to the raw text the real tool would
/// print. The device index parameter is answered automatically.
#[derive(Debug, Default)]
pub struct MockExecutor {
    devices: BTreeMap<u32, HashMap<String, String>>,
    /// Overrides the generated device listing.
    listing: Option<String>,
    listing_fails: bool,
    /// Overrides the generated query output.
    response: Option<String>,
    latency: Duration,
    /// Queries numbered from this one on fail.
    fail_after: Option<usize>,
    list_calls: AtomicUsize,
    query_calls: AtomicUsize,
    recorded: Mutex<Vec<RecordedQuery>>,
}

impl MockExecutor {
    /// Creates an executor with no devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device with raw values keyed by query parameter.
    pub fn with_device(mut self, index: u32, values: &[(&str, &str)]) -> Self {
        let table = values
            .iter()
            .map(|(param, raw)| (param.to_string(), raw.to_string()))
            .collect();
        self.devices.insert(index, table);
        self
    }

    /// Replaces the device listing output.
    pub fn with_listing(mut self, output: impl Into<String>) -> Self {
        self.listing = Some(output.into());
        self
    }

    /// Makes device listing fail with a non-zero exit.
    pub fn with_failing_listing(mut self) -> Self {
        self.listing_fails = true;
        self
    }

    /// Replaces the output of every query.
    pub fn with_response(mut self, output: impl Into<String>) -> Self {
        self.response = Some(output.into());
        self
    }

    /// Delays every query by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Lets the first `n` queries succeed and fails the rest.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Number of device listings performed.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of queries performed, including failed ones.
    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    /// All queries received so far, in order.
    pub fn recorded_queries(&self) -> Vec<RecordedQuery> {
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of queries that targeted `device` specifically.
    pub fn queries_for_device(&self, device: u32) -> usize {
        self.recorded_queries()
            .iter()
            .filter(|q| q.device == Some(device))
            .count()
    }

    fn row(index: u32, table: &HashMap<String, String>, parameters: &[&str]) -> String {
        parameters
            .iter()
            .map(|param| {
                if *param == DEVICE_INDEX_PARAMETER {
                    index.to_string()
                } else {
                    table
                        .get(*param)
                        .cloned()
                        .unwrap_or_else(|| NOT_AVAILABLE.to_string())
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl DeviceQueryExecutor for MockExecutor {
    fn list_device_indices(&self) -> Result<String, ExecError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.listing_fails {
            return Err(ExecError::NonZeroExit {
                status: "exit status: 9".to_string(),
                stderr: "NVIDIA-SMI has failed".to_string(),
            });
        }
        if let Some(listing) = &self.listing {
            return Ok(listing.clone());
        }
        let mut output = String::new();
        for index in self.devices.keys() {
            output.push_str(&format!("{}\n", index));
        }
        Ok(output)
    }

    fn query(&self, parameters: &[&str], device: Option<u32>) -> Result<String, ExecError> {
        let call = self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedQuery {
                parameters: parameters.iter().map(|p| p.to_string()).collect(),
                device,
            });

        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        if self.fail_after.is_some_and(|n| call >= n) {
            return Err(ExecError::NonZeroExit {
                status: "exit status: 15".to_string(),
                stderr: "Unable to determine the device handle".to_string(),
            });
        }

        if let Some(response) = &self.response {
            return Ok(response.clone());
        }

        let mut output = String::new();
        for (index, table) in &self.devices {
            if device.is_some_and(|d| d != *index) {
                continue;
            }
            output.push_str(&Self::row(*index, table, parameters));
            output.push('\n');
        }
        Ok(output)
    }
}
