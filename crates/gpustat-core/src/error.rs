//! Error types for device queries and sampling sessions.
//!
//! Failures fall into four kinds that callers handle differently:
//! - [`InvalidInput`]: the request names unknown devices or metrics, or
//!   violates a dependency/monitoring rule. Raised before any query is issued.
//! - [`ExecError`]: the external query tool could not be run or exited non-zero.
//! - [`ParseError`]: the tool's output does not have the expected shape.
//! - [`LifecycleError`]: `start()`/`stop()` called out of sequence.
//!
//! [`QueryError`] wraps all four. Every type is `Clone` so a failure raised
//! on a background sampling thread can be stored and inspected later.

use std::fmt;
use std::time::Duration;

/// Formats a list of identifiers as `a, b, c`.
fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure to run the external device query tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// The tool could not be started.
    Spawn(String),
    /// The tool exited with a non-zero status.
    NonZeroExit { status: String, stderr: String },
    /// The tool did not finish within the configured timeout and was killed.
    Timeout(Duration),
    /// The tool produced output that is not valid text.
    Output(String),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Spawn(msg) => write!(f, "failed to run query tool: {}", msg),
            ExecError::NonZeroExit { status, stderr } if stderr.is_empty() => {
                write!(f, "query tool exited with {}", status)
            }
            ExecError::NonZeroExit { status, stderr } => {
                write!(f, "query tool exited with {}: {}", status, stderr)
            }
            ExecError::Timeout(timeout) => {
                write!(f, "query tool timed out after {:?}", timeout)
            }
            ExecError::Output(msg) => write!(f, "invalid query tool output: {}", msg),
        }
    }
}

impl std::error::Error for ExecError {}

/// The tool's output could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A row has a different number of fields than were requested.
    FieldCount {
        expected: usize,
        found: usize,
        line: String,
    },
    /// A field cannot be converted to the metric's declared type.
    Value { raw: String, expected: &'static str },
    /// The device index column is not a non-negative integer.
    DeviceIndex(String),
    /// A derived metric is not a finite number for the reported values,
    /// e.g. a memory percentage on a device reporting zero total memory.
    Undefined(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::FieldCount {
                expected,
                found,
                line,
            } => write!(
                f,
                "expected {} fields, found {} in line {:?}",
                expected, found, line
            ),
            ParseError::Value { raw, expected } => {
                write!(f, "cannot parse {:?} as {}", raw, expected)
            }
            ParseError::DeviceIndex(raw) => write!(f, "invalid device index {:?}", raw),
            ParseError::Undefined(metric) => {
                write!(f, "derived metric {} is undefined for the reported values", metric)
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// The request is not valid for the registry and the discovered devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidInput {
    /// Devices not present in the device catalog (sorted).
    UnknownDevices(Vec<u32>),
    /// Metrics not present in the registry (sorted).
    UnknownMetrics(Vec<String>),
    /// A static metric was requested for continuous monitoring.
    StaticMetric(String),
    /// A derived metric was requested without one of its dynamic dependencies.
    MissingDependency { metric: String, dependency: String },
}

impl fmt::Display for InvalidInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidInput::UnknownDevices(devices) => {
                write!(f, "invalid device IDs specified: {}", join(devices))
            }
            InvalidInput::UnknownMetrics(metrics) => {
                write!(f, "invalid metrics requested: {}", join(metrics))
            }
            InvalidInput::StaticMetric(metric) => {
                write!(f, "metric {} is static and cannot be monitored", metric)
            }
            InvalidInput::MissingDependency { metric, dependency } => write!(
                f,
                "derived metric {} requires {} to be included in the query",
                metric, dependency
            ),
        }
    }
}

impl std::error::Error for InvalidInput {}

/// A sampling session method was called in the wrong state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    /// `start()` called on a session that is already running.
    AlreadyStarted,
    /// `stop()` called on a session that was never started.
    NotRunning,
    /// `start()` or `stop()` called on a stopped session.
    AlreadyStopped,
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::AlreadyStarted => {
                write!(f, "session is already running; start can only be called once")
            }
            LifecycleError::NotRunning => write!(f, "session is not running"),
            LifecycleError::AlreadyStopped => write!(f, "session has already been stopped"),
        }
    }
}

impl std::error::Error for LifecycleError {}

/// Any failure raised by the query engine or a sampling session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    InvalidInput(InvalidInput),
    Execution(ExecError),
    Parse(ParseError),
    Lifecycle(LifecycleError),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::InvalidInput(e) => write!(f, "invalid input: {}", e),
            QueryError::Execution(e) => write!(f, "execution failed: {}", e),
            QueryError::Parse(e) => write!(f, "parse error: {}", e),
            QueryError::Lifecycle(e) => write!(f, "lifecycle error: {}", e),
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueryError::InvalidInput(e) => Some(e),
            QueryError::Execution(e) => Some(e),
            QueryError::Parse(e) => Some(e),
            QueryError::Lifecycle(e) => Some(e),
        }
    }
}

impl From<InvalidInput> for QueryError {
    fn from(e: InvalidInput) -> Self {
        QueryError::InvalidInput(e)
    }
}

impl From<ExecError> for QueryError {
    fn from(e: ExecError) -> Self {
        QueryError::Execution(e)
    }
}

impl From<ParseError> for QueryError {
    fn from(e: ParseError) -> Self {
        QueryError::Parse(e)
    }
}

impl From<LifecycleError> for QueryError {
    fn from(e: LifecycleError) -> Self {
        QueryError::Lifecycle(e)
    }
}

/// The metric registry definitions are inconsistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The identifier list and the metric details differ.
    Mismatch {
        missing_details: Vec<String>,
        missing_ids: Vec<String>,
    },
    /// The same identifier is defined more than once.
    Duplicate(String),
    /// A derived metric depends on an unregistered metric.
    UnknownDependency { metric: String, dependency: String },
    /// A derived metric depends on another derived metric.
    NestedDerivation { metric: String, dependency: String },
    /// A derived metric depends on a text metric.
    NonNumericDependency { metric: String, dependency: String },
    /// A derived metric is declared static.
    StaticDerived(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Mismatch {
                missing_details,
                missing_ids,
            } => write!(
                f,
                "metric list and details differ (no details: [{}], not listed: [{}])",
                join(missing_details),
                join(missing_ids)
            ),
            RegistryError::Duplicate(id) => write!(f, "metric {} defined more than once", id),
            RegistryError::UnknownDependency { metric, dependency } => {
                write!(f, "metric {} depends on unknown metric {}", metric, dependency)
            }
            RegistryError::NestedDerivation { metric, dependency } => write!(
                f,
                "metric {} depends on derived metric {}",
                metric, dependency
            ),
            RegistryError::NonNumericDependency { metric, dependency } => write!(
                f,
                "metric {} depends on non-numeric metric {}",
                metric, dependency
            ),
            RegistryError::StaticDerived(id) => {
                write!(f, "derived metric {} cannot be static", id)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_names_identifiers() {
        let err = QueryError::from(InvalidInput::UnknownDevices(vec![3, 7]));
        assert_eq!(err.to_string(), "invalid input: invalid device IDs specified: 3, 7");

        let err = InvalidInput::MissingDependency {
            metric: "MEMORY_USED_PERCENTAGE".to_string(),
            dependency: "MEMORY_USED".to_string(),
        };
        assert!(err.to_string().contains("MEMORY_USED_PERCENTAGE"));
        assert!(err.to_string().contains("requires MEMORY_USED"));
    }

    #[test]
    fn test_exec_error_without_stderr() {
        let err = ExecError::NonZeroExit {
            status: "exit status: 9".to_string(),
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "query tool exited with exit status: 9");
    }

    #[test]
    fn test_query_error_source() {
        use std::error::Error;
        let err = QueryError::from(LifecycleError::NotRunning);
        assert!(err.source().is_some());
    }
}
