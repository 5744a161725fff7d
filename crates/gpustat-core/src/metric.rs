//! Metric registry.
//!
//! A [`MetricRegistry`] is the fixed set of metrics the query engine knows
//! about. Each metric is either fetched directly from the query tool
//! ([`MetricSource::Query`]) or computed from other metrics
//! ([`MetricSource::Derived`]). Static metrics never change for a device and
//! are served from the static info cache; dynamic ones change per sample.
//!
//! The registry checks itself at construction time and refuses to build if
//! the definitions are inconsistent.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Declared type of a metric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Float,
    Text,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Text => "text",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetricValue {
    /// Numeric view of the value. `None` for text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Int(v) => Some(*v as f64),
            MetricValue::Float(v) => Some(*v),
            MetricValue::Text(_) => None,
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            MetricValue::Int(_) => ValueType::Int,
            MetricValue::Float(_) => ValueType::Float,
            MetricValue::Text(_) => ValueType::Text,
        }
    }

    /// Casts a computed number to `value_type`. Integers are truncated.
    pub fn from_f64(value: f64, value_type: ValueType) -> Self {
        match value_type {
            ValueType::Int => MetricValue::Int(value.trunc() as i64),
            ValueType::Float => MetricValue::Float(value),
            ValueType::Text => MetricValue::Text(value.to_string()),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{}", v),
            MetricValue::Text(v) => f.write_str(v),
        }
    }
}

/// Computes a derived metric from its dependency values.
#[derive(Clone, Copy)]
pub struct Derivation {
    /// Dependencies, in the order they are passed to `combine`.
    pub dependencies: &'static [&'static str],
    pub combine: fn(&[f64]) -> f64,
}

impl fmt::Debug for Derivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Derivation")
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Where a metric's value comes from.
#[derive(Debug, Clone, Copy)]
pub enum MetricSource {
    /// Fetched from the query tool using this parameter name.
    Query(&'static str),
    /// Computed from other metrics.
    Derived(Derivation),
}

/// Definition of a single metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub id: &'static str,
    pub value_type: ValueType,
    pub is_static: bool,
    pub description: &'static str,
    pub source: MetricSource,
}

impl MetricDef {
    pub fn is_derived(&self) -> bool {
        matches!(self.source, MetricSource::Derived(_))
    }

    /// Query tool parameter, or `None` for derived metrics.
    pub fn query_parameter(&self) -> Option<&'static str> {
        match self.source {
            MetricSource::Query(param) => Some(param),
            MetricSource::Derived(_) => None,
        }
    }

    pub fn derivation(&self) -> Option<&Derivation> {
        match &self.source {
            MetricSource::Derived(d) => Some(d),
            MetricSource::Query(_) => None,
        }
    }
}

/// The set of known metrics.
#[derive(Debug, Clone)]
pub struct MetricRegistry {
    ids: Vec<&'static str>,
    defs: HashMap<&'static str, MetricDef>,
}

impl MetricRegistry {
    /// Builds a registry from the ordered identifier list and the metric details.
    ///
    /// Fails if the two sets differ, an identifier is repeated, or a derived
    /// metric has an invalid dependency.
    pub fn new(ids: &[&'static str], details: Vec<MetricDef>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(*id) {
                return Err(RegistryError::Duplicate(id.to_string()));
            }
        }

        let mut defs = HashMap::with_capacity(details.len());
        for def in details {
            if defs.insert(def.id, def).is_some() {
                return Err(RegistryError::Duplicate(def.id.to_string()));
            }
        }

        let missing_details: BTreeSet<String> = ids
            .iter()
            .filter(|id| !defs.contains_key(*id))
            .map(|id| id.to_string())
            .collect();
        let missing_ids: BTreeSet<String> = defs
            .keys()
            .filter(|id| !seen.contains(*id))
            .map(|id| id.to_string())
            .collect();
        if !missing_details.is_empty() || !missing_ids.is_empty() {
            return Err(RegistryError::Mismatch {
                missing_details: missing_details.into_iter().collect(),
                missing_ids: missing_ids.into_iter().collect(),
            });
        }

        for id in ids {
            let def = &defs[id];
            let Some(derivation) = def.derivation() else {
                continue;
            };
            if def.is_static {
                return Err(RegistryError::StaticDerived(def.id.to_string()));
            }
            for dep in derivation.dependencies {
                let metric = def.id.to_string();
                let dependency = dep.to_string();
                match defs.get(dep) {
                    None => return Err(RegistryError::UnknownDependency { metric, dependency }),
                    Some(d) if d.is_derived() => {
                        return Err(RegistryError::NestedDerivation { metric, dependency });
                    }
                    Some(d) if d.value_type == ValueType::Text => {
                        return Err(RegistryError::NonNumericDependency { metric, dependency });
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(Self {
            ids: ids.to_vec(),
            defs,
        })
    }

    /// Registry of the metrics exposed by `nvidia-smi --query-gpu`.
    pub fn nvidia() -> Result<Self, RegistryError> {
        Self::new(NVIDIA_METRIC_IDS, nvidia_metric_details())
    }

    /// All metric identifiers in definition order.
    pub fn ids(&self) -> &[&'static str] {
        &self.ids
    }

    pub fn get(&self, id: &str) -> Option<&MetricDef> {
        self.defs.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.defs.contains_key(id)
    }

    /// Whether `id` is a static metric. Unknown metrics are not static.
    pub fn is_static(&self, id: &str) -> bool {
        self.defs.get(id).is_some_and(|d| d.is_static)
    }

    pub fn query_parameter(&self, id: &str) -> Option<&'static str> {
        self.defs.get(id).and_then(MetricDef::query_parameter)
    }

    /// Static metrics in definition order.
    pub fn static_ids(&self) -> Vec<&'static str> {
        self.ids
            .iter()
            .copied()
            .filter(|id| self.is_static(id))
            .collect()
    }

    /// Dynamic metrics in definition order.
    pub fn dynamic_ids(&self) -> Vec<&'static str> {
        self.ids
            .iter()
            .copied()
            .filter(|id| !self.is_static(id))
            .collect()
    }

    /// Definitions in definition order.
    pub fn iter(&self) -> impl Iterator<Item = &MetricDef> {
        self.ids.iter().map(|id| &self.defs[id])
    }
}

pub const GPU_NAME: &str = "GPU_NAME";
pub const TOTAL_MEMORY: &str = "TOTAL_MEMORY";
pub const MEMORY_USED: &str = "MEMORY_USED";
pub const AVAILABLE_MEMORY: &str = "AVAILABLE_MEMORY";
pub const UTILIZATION: &str = "UTILIZATION";
pub const WATTAGE: &str = "WATTAGE";
pub const TEMPERATURE: &str = "TEMPERATURE";
pub const FAN_SPEED: &str = "FAN_SPEED";
pub const MEMORY_USED_PERCENTAGE: &str = "MEMORY_USED_PERCENTAGE";
pub const POWER_LIMIT: &str = "POWER_LIMIT";

const NVIDIA_METRIC_IDS: &[&str] = &[
    GPU_NAME,
    TOTAL_MEMORY,
    MEMORY_USED,
    AVAILABLE_MEMORY,
    UTILIZATION,
    WATTAGE,
    TEMPERATURE,
    FAN_SPEED,
    MEMORY_USED_PERCENTAGE,
    POWER_LIMIT,
];

/// Not finite when total memory is zero; the query engine reports that as
/// [`ParseError::Undefined`](crate::error::ParseError::Undefined).
fn memory_used_percentage(values: &[f64]) -> f64 {
    (values[0] / values[1]) * 100.0
}

fn nvidia_metric_details() -> Vec<MetricDef> {
    fn query(
        id: &'static str,
        value_type: ValueType,
        is_static: bool,
        description: &'static str,
        param: &'static str,
    ) -> MetricDef {
        MetricDef {
            id,
            value_type,
            is_static,
            description,
            source: MetricSource::Query(param),
        }
    }

    vec![
        query(GPU_NAME, ValueType::Text, true, "Name of GPU", "name"),
        query(
            TOTAL_MEMORY,
            ValueType::Int,
            true,
            "Total memory of GPU in MiB",
            "memory.total",
        ),
        query(
            MEMORY_USED,
            ValueType::Int,
            false,
            "Memory used in GPU in MiB",
            "memory.used",
        ),
        query(
            AVAILABLE_MEMORY,
            ValueType::Int,
            false,
            "Available memory in GPU in MiB",
            "memory.free",
        ),
        query(
            UTILIZATION,
            ValueType::Int,
            false,
            "GPU utilization percentage",
            "utilization.gpu",
        ),
        query(
            WATTAGE,
            ValueType::Float,
            false,
            "Current power consumption in watts",
            "power.draw",
        ),
        query(
            TEMPERATURE,
            ValueType::Int,
            false,
            "Current temperature in Celsius",
            "temperature.gpu",
        ),
        query(
            FAN_SPEED,
            ValueType::Int,
            false,
            "Fan speed percentage",
            "fan.speed",
        ),
        MetricDef {
            id: MEMORY_USED_PERCENTAGE,
            value_type: ValueType::Float,
            is_static: false,
            description: "Percentage of memory used",
            source: MetricSource::Derived(Derivation {
                dependencies: &[MEMORY_USED, TOTAL_MEMORY],
                combine: memory_used_percentage,
            }),
        },
        query(
            POWER_LIMIT,
            ValueType::Float,
            true,
            "Power limit in watts",
            "power.max_limit",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(id: &'static str, is_static: bool) -> MetricDef {
        MetricDef {
            id,
            value_type: ValueType::Int,
            is_static,
            description: "",
            source: MetricSource::Query("x"),
        }
    }

    fn sum(values: &[f64]) -> f64 {
        values.iter().sum()
    }

    fn derived(id: &'static str, deps: &'static [&'static str], is_static: bool) -> MetricDef {
        MetricDef {
            id,
            value_type: ValueType::Float,
            is_static,
            description: "",
            source: MetricSource::Derived(Derivation {
                dependencies: deps,
                combine: sum,
            }),
        }
    }

    #[test]
    fn test_nvidia_registry_is_consistent() {
        let registry = MetricRegistry::nvidia().unwrap();
        assert_eq!(registry.ids().len(), 10);
        assert!(registry.is_static(GPU_NAME));
        assert!(registry.is_static(TOTAL_MEMORY));
        assert!(registry.is_static(POWER_LIMIT));
        assert!(!registry.is_static(MEMORY_USED));
        assert!(!registry.is_static("NOT_A_METRIC"));
        assert_eq!(
            registry.static_ids(),
            vec![GPU_NAME, TOTAL_MEMORY, POWER_LIMIT]
        );
        assert_eq!(registry.query_parameter(WATTAGE), Some("power.draw"));
        assert_eq!(registry.query_parameter(MEMORY_USED_PERCENTAGE), None);
    }

    #[test]
    fn test_every_metric_is_queryable_or_derived() {
        let registry = MetricRegistry::nvidia().unwrap();
        for def in registry.iter() {
            assert!(def.query_parameter().is_some() != def.is_derived(), "{}", def.id);
        }
    }

    #[test]
    fn test_memory_used_percentage() {
        let registry = MetricRegistry::nvidia().unwrap();
        let derivation = registry
            .get(MEMORY_USED_PERCENTAGE)
            .and_then(MetricDef::derivation)
            .unwrap();
        let value = (derivation.combine)(&[2048.0, 8192.0]);
        assert!((value - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_mismatch_between_ids_and_details() {
        let err = MetricRegistry::new(&["A", "B"], vec![plain("A", false), plain("C", true)])
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::Mismatch {
                missing_details: vec!["B".to_string()],
                missing_ids: vec!["C".to_string()],
            }
        );
    }

    #[test]
    fn test_duplicate_definition() {
        let err = MetricRegistry::new(&["A"], vec![plain("A", false), plain("A", false)])
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("A".to_string()));

        let err = MetricRegistry::new(&["A", "A"], vec![plain("A", false)]).unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("A".to_string()));
    }

    #[test]
    fn test_invalid_derivations() {
        let err = MetricRegistry::new(&["A", "D"], vec![plain("A", false), derived("D", &["Z"], false)])
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownDependency { .. }));

        let err = MetricRegistry::new(
            &["A", "D", "E"],
            vec![
                plain("A", false),
                derived("D", &["A"], false),
                derived("E", &["D"], false),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::NestedDerivation { .. }));

        let err = MetricRegistry::new(&["A", "D"], vec![plain("A", false), derived("D", &["A"], true)])
            .unwrap_err();
        assert_eq!(err, RegistryError::StaticDerived("D".to_string()));

        let mut text = plain("T", true);
        text.value_type = ValueType::Text;
        let err = MetricRegistry::new(&["T", "D"], vec![text, derived("D", &["T"], false)])
            .unwrap_err();
        assert!(matches!(err, RegistryError::NonNumericDependency { .. }));
    }

    #[test]
    fn test_from_f64_truncates_integers() {
        assert_eq!(MetricValue::from_f64(41.9, ValueType::Int), MetricValue::Int(41));
        assert_eq!(
            MetricValue::from_f64(12.5, ValueType::Float),
            MetricValue::Float(12.5)
        );
    }
}
