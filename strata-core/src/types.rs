//! Core types for Strata

use crate::field::FieldType;
use crate::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Shard index inside one database
pub type ShardId = u32;

/// Cluster node identifier
pub type NodeId = u32;

/// Metric identifier, assigned by the storage node
pub type MetricId = u32;

/// Series identifier, unique inside one metric
pub type SeriesId = u32;

/// Namespace used when a writer does not provide one
pub const DEFAULT_NAMESPACE: &str = "default-ns";

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Aggregation semantics of a simple field as written by clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimpleFieldType {
    DeltaSum,
    CumulativeSum,
    Last,
    First,
    Min,
    Max,
}

impl SimpleFieldType {
    /// Storage field type the value is aggregated as
    pub fn field_type(&self) -> FieldType {
        match self {
            SimpleFieldType::DeltaSum => FieldType::Sum,
            SimpleFieldType::CumulativeSum | SimpleFieldType::Last => FieldType::Last,
            SimpleFieldType::First => FieldType::First,
            SimpleFieldType::Min => FieldType::Min,
            SimpleFieldType::Max => FieldType::Max,
        }
    }
}

/// A single named numeric value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleField {
    pub name: String,
    pub field_type: SimpleFieldType,
    pub value: f64,
}

/// Histogram carried by a metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CompoundField {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: f64,
    /// Upper bounds of the buckets, same length as `values`
    pub explicit_bounds: Vec<f64>,
    /// Bucket counts
    pub values: Vec<f64>,
}

/// A field value flattened for storage
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue {
    pub name: String,
    pub field_type: FieldType,
    pub value: f64,
}

/// Uniform internal metric produced by the ingestion front ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    /// Zero or negative when the writer left it to the receiving node
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub simple_fields: Vec<SimpleField>,
    #[serde(default)]
    pub compound_field: Option<CompoundField>,
}

impl Metric {
    /// Create a metric without fields
    pub fn new(name: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            namespace: default_namespace(),
            name: name.into(),
            timestamp,
            tags: BTreeMap::new(),
            simple_fields: Vec::new(),
            compound_field: None,
        }
    }

    /// Set the namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add a simple field
    pub fn with_field(
        mut self,
        name: impl Into<String>,
        field_type: SimpleFieldType,
        value: f64,
    ) -> Self {
        self.simple_fields.push(SimpleField {
            name: name.into(),
            field_type,
            value,
        });
        self
    }

    /// Attach a histogram
    pub fn with_histogram(mut self, histogram: CompoundField) -> Self {
        self.compound_field = Some(histogram);
        self
    }

    /// Reject metrics that cannot be stored
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StrataError::InvalidMetric("empty metric name".into()));
        }
        if self.simple_fields.is_empty() && self.compound_field.is_none() {
            return Err(StrataError::InvalidMetric(format!(
                "metric {} has no fields",
                self.name
            )));
        }
        for field in &self.simple_fields {
            if field.name.is_empty() {
                return Err(StrataError::InvalidMetric(format!(
                    "metric {} has a field without name",
                    self.name
                )));
            }
            if !field.value.is_finite() {
                return Err(StrataError::InvalidMetric(format!(
                    "field {} of metric {} is not finite",
                    field.name, self.name
                )));
            }
        }
        if let Some(histogram) = &self.compound_field {
            if histogram.explicit_bounds.len() != histogram.values.len() {
                return Err(StrataError::InvalidMetric(format!(
                    "histogram of metric {} has {} bounds but {} buckets",
                    self.name,
                    histogram.explicit_bounds.len(),
                    histogram.values.len()
                )));
            }
        }
        Ok(())
    }

    /// Canonical tag string, used to identify a series inside a metric
    pub fn tags_string(&self) -> String {
        let mut s = String::new();
        for (k, v) in &self.tags {
            if !s.is_empty() {
                s.push(',');
            }
            s.push_str(k);
            s.push('=');
            s.push_str(v);
        }
        s
    }

    /// Stable hash of namespace, name and tags, used for shard routing
    pub fn series_hash(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.namespace.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.name.as_bytes());
        for (k, v) in &self.tags {
            hasher.update(&[0]);
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
        }
        hasher.finalize()
    }

    /// Storage key of the metric
    pub fn qualified_name(&self) -> String {
        format!("{}|{}", self.namespace, self.name)
    }

    /// Flatten simple fields and histogram into storage fields
    pub fn field_values(&self) -> Vec<FieldValue> {
        let mut values: Vec<FieldValue> = self
            .simple_fields
            .iter()
            .map(|f| FieldValue {
                name: f.name.clone(),
                field_type: f.field_type.field_type(),
                value: f.value,
            })
            .collect();

        if let Some(h) = &self.compound_field {
            let summary = [
                ("HistogramSum", FieldType::Sum, h.sum),
                ("HistogramCount", FieldType::Sum, h.count),
                ("HistogramMin", FieldType::Min, h.min),
                ("HistogramMax", FieldType::Max, h.max),
            ];
            for (name, field_type, value) in summary {
                values.push(FieldValue {
                    name: name.to_string(),
                    field_type,
                    value,
                });
            }
            for (bound, count) in h.explicit_bounds.iter().zip(&h.values) {
                values.push(FieldValue {
                    name: format!("__bucket_{}", bound),
                    field_type: FieldType::Histogram,
                    value: *count,
                });
            }
        }

        values
    }

    /// Serialize for the replication path
    pub fn marshal(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a payload produced by [`Metric::marshal`]
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)?;
        if !self.tags.is_empty() {
            write!(f, ",{}", self.tags_string())?;
        }
        Ok(())
    }
}

/// A batch of metrics submitted by one write request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricList {
    pub metrics: Vec<Metric>,
}

impl MetricList {
    pub fn new(metrics: Vec<Metric>) -> Self {
        Self { metrics }
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Stamp metrics without a timestamp with `now`
    pub fn fill_timestamps(&mut self, now: Timestamp) {
        for metric in self.metrics.iter_mut().filter(|m| m.timestamp <= 0) {
            metric.timestamp = now;
        }
    }
}

/// Replica topology of one shard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardState {
    pub id: ShardId,
    /// Node receiving the replication stream, if elected
    pub leader: Option<NodeId>,
    pub replica: Vec<NodeId>,
}

impl ShardState {
    pub fn new(id: ShardId, leader: NodeId, replica: Vec<NodeId>) -> Self {
        Self {
            id,
            leader: Some(leader),
            replica,
        }
    }
}

/// A live cluster node and its replication address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatefulNode {
    pub id: NodeId,
    pub address: String,
}

/// Live nodes keyed by id, as known by the broker
pub type LiveNodes = HashMap<NodeId, StatefulNode>;
