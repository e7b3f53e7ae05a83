//! In-memory write buffer of one shard on the storage node
//!
//! The memory database assigns the ids used by metric blocks (metric, field
//! and series ids) and aggregates incoming values per time family and slot
//! until the shard is flushed.

mod buffer;
mod encoding;

pub use buffer::{FamilyBuffer, MetricBuffer};
pub use encoding::{decode_field, encode_field};

use crate::field::{FieldId, FieldMeta, FieldType};
use crate::timeutil::{family_time, slot_of};
use crate::{Metric, MetricId, Result, SeriesId, StrataError, Timestamp};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Ids assigned to one metric
#[derive(Debug, Serialize, Deserialize)]
struct MetricMeta {
    id: MetricId,
    fields: HashMap<String, FieldMeta>,
    next_field_id: FieldId,
    series: HashMap<String, SeriesId>,
    next_series_id: SeriesId,
}

impl MetricMeta {
    fn new(id: MetricId) -> Self {
        Self {
            id,
            fields: HashMap::new(),
            next_field_id: 1,
            series: HashMap::new(),
            next_series_id: 1,
        }
    }

    fn field(&mut self, metric: &str, name: &str, field_type: FieldType) -> Result<FieldMeta> {
        if let Some(meta) = self.fields.get(name) {
            if meta.field_type != field_type {
                return Err(StrataError::InvalidMetric(format!(
                    "field {} of metric {} is {:?}, got {:?}",
                    name, metric, meta.field_type, field_type
                )));
            }
            return Ok(*meta);
        }
        if self.next_field_id == FieldId::MAX {
            return Err(StrataError::InvalidMetric(format!(
                "metric {} has too many fields",
                metric
            )));
        }
        let meta = FieldMeta::new(self.next_field_id, field_type);
        self.next_field_id += 1;
        self.fields.insert(name.to_string(), meta);
        Ok(meta)
    }

    fn series(&mut self, tags: String) -> SeriesId {
        if let Some(id) = self.series.get(&tags) {
            return *id;
        }
        let id = self.next_series_id;
        self.next_series_id += 1;
        self.series.insert(tags, id);
        id
    }
}

/// Counters of a memory database
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryDatabaseStats {
    pub metrics: usize,
    pub series: usize,
    pub families: usize,
    pub buffered_values: usize,
}

/// Id assignment and family buffers of one shard
#[derive(Debug)]
pub struct MemoryDatabase {
    interval_ms: i64,
    metrics: HashMap<String, MetricMeta>,
    next_metric_id: MetricId,
    families: BTreeMap<Timestamp, FamilyBuffer>,
}

impl MemoryDatabase {
    /// Create a database bucketing values into slots of `interval_ms`
    pub fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms: interval_ms.max(1),
            metrics: HashMap::new(),
            next_metric_id: 1,
            families: BTreeMap::new(),
        }
    }

    /// Buffer every field value of a metric
    ///
    /// Field types are fixed by the first write of a field; a later write
    /// with another type is rejected before anything is buffered.
    pub fn write(&mut self, metric: &Metric) -> Result<()> {
        metric.validate()?;

        let key = metric.qualified_name();
        if !self.metrics.contains_key(&key) {
            let id = self.next_metric_id;
            self.next_metric_id += 1;
            self.metrics.insert(key.clone(), MetricMeta::new(id));
        }
        let meta = self
            .metrics
            .get_mut(&key)
            .ok_or_else(|| StrataError::Internal(format!("metric {} not registered", key)))?;

        let fields = metric
            .field_values()
            .into_iter()
            .map(|f| Ok((meta.field(&key, &f.name, f.field_type)?, f.value)))
            .collect::<Result<Vec<_>>>()?;
        let series_id = meta.series(metric.tags_string());
        let metric_id = meta.id;

        let family = family_time(metric.timestamp);
        let slot = slot_of(metric.timestamp, self.interval_ms);
        let buffer = self
            .families
            .entry(family)
            .or_insert_with(|| FamilyBuffer::new(family));
        for (field, value) in fields {
            buffer.write(metric_id, series_id, field, slot, value);
        }
        Ok(())
    }

    /// Remove and return every family buffered so far, oldest first
    pub fn take_families(&mut self) -> Vec<FamilyBuffer> {
        std::mem::take(&mut self.families).into_values().collect()
    }

    /// Put back a family taken by `take_families`
    ///
    /// Values buffered into the same family since then are merged on top.
    pub fn restore_family(&mut self, mut family: FamilyBuffer) {
        if let Some(newer) = self.families.remove(&family.family_time()) {
            family.merge(newer);
        }
        self.families.insert(family.family_time(), family);
    }

    /// Encode every assigned id
    pub fn encode_ids(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(self.next_metric_id, &self.metrics))?)
    }

    /// Replace the assigned ids with ones encoded by `encode_ids`
    pub fn restore_ids(&mut self, data: &[u8]) -> Result<()> {
        let (next_metric_id, metrics): (MetricId, HashMap<String, MetricMeta>) =
            bincode::deserialize(data)?;
        if let Some(used) = metrics.values().map(|m| m.id).max() {
            if used >= next_metric_id {
                return Err(StrataError::Corruption(format!(
                    "metric id {} assigned past next id {}",
                    used, next_metric_id
                )));
            }
        }
        self.next_metric_id = next_metric_id;
        self.metrics = metrics;
        Ok(())
    }

    /// Never hand out metric ids up to `used` again
    pub fn reserve_metric_ids(&mut self, used: MetricId) {
        self.next_metric_id = self.next_metric_id.max(used.saturating_add(1));
    }

    pub fn family(&self, family_time: Timestamp) -> Option<&FamilyBuffer> {
        self.families.get(&family_time)
    }

    pub fn metric_id(&self, namespace: &str, name: &str) -> Option<MetricId> {
        self.metrics
            .get(&format!("{}|{}", namespace, name))
            .map(|m| m.id)
    }

    /// Field names and metas of a metric, ordered by field id
    pub fn fields(&self, namespace: &str, name: &str) -> Vec<(String, FieldMeta)> {
        let mut fields: Vec<_> = self
            .metrics
            .get(&format!("{}|{}", namespace, name))
            .map(|m| {
                m.fields
                    .iter()
                    .map(|(name, meta)| (name.clone(), *meta))
                    .collect()
            })
            .unwrap_or_default();
        fields.sort_by_key(|(_, meta)| meta.id);
        fields
    }

    /// Id of the series identified by `tags` ("k=v,k=v", sorted by key)
    pub fn series_id(&self, namespace: &str, name: &str, tags: &str) -> Option<SeriesId> {
        self.metrics
            .get(&format!("{}|{}", namespace, name))?
            .series
            .get(tags)
            .copied()
    }

    /// Every series id of a metric
    pub fn series_ids(&self, namespace: &str, name: &str) -> RoaringBitmap {
        self.metrics
            .get(&format!("{}|{}", namespace, name))
            .map(|m| m.series.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> MemoryDatabaseStats {
        MemoryDatabaseStats {
            metrics: self.metrics.len(),
            series: self.metrics.values().map(|m| m.series.len()).sum(),
            families: self.families.len(),
            buffered_values: self.families.values().map(|f| f.value_count()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeutil::FAMILY_MILLIS;
    use crate::{CompoundField, SimpleFieldType};

    fn cpu(host: &str, ts: Timestamp, value: f64) -> Metric {
        Metric::new("cpu", ts)
            .with_tag("host", host)
            .with_field("usage", SimpleFieldType::DeltaSum, value)
    }

    #[test]
    fn test_assign_ids() {
        let mut db = MemoryDatabase::new(10_000);
        db.write(&cpu("a", 0, 1.0)).unwrap();
        db.write(&cpu("b", 0, 1.0)).unwrap();
        db.write(&cpu("a", 5, 1.0)).unwrap();
        db.write(
            &Metric::new("mem", 0).with_field("used", SimpleFieldType::Last, 3.0),
        )
        .unwrap();

        assert_eq!(db.metric_id("default-ns", "cpu"), Some(1));
        assert_eq!(db.metric_id("default-ns", "mem"), Some(2));
        assert_eq!(db.series_id("default-ns", "cpu", "host=a"), Some(1));
        assert_eq!(db.series_id("default-ns", "cpu", "host=b"), Some(2));
        assert_eq!(db.series_ids("default-ns", "cpu").len(), 2);
        assert_eq!(
            db.fields("default-ns", "cpu"),
            vec![("usage".to_string(), FieldMeta::new(1, FieldType::Sum))]
        );

        let stats = db.stats();
        assert_eq!(stats.metrics, 2);
        assert_eq!(stats.series, 3);
        assert_eq!(stats.families, 1);
        assert_eq!(stats.buffered_values, 4);
    }

    #[test]
    fn test_aggregate_into_slots_and_families() {
        let mut db = MemoryDatabase::new(10_000);
        db.write(&cpu("a", 1_000, 1.0)).unwrap();
        db.write(&cpu("a", 9_000, 2.0)).unwrap();
        db.write(&cpu("a", 25_000, 4.0)).unwrap();
        db.write(&cpu("a", FAMILY_MILLIS + 1, 8.0)).unwrap();

        let family = db.family(0).unwrap();
        let values = family.metric(1).unwrap().values(1, 1).unwrap();
        assert_eq!(
            values.iter().map(|(s, v)| (*s, *v)).collect::<Vec<_>>(),
            vec![(0, 3.0), (2, 4.0)]
        );
        assert!(db.family(FAMILY_MILLIS).is_some());

        let families = db.take_families();
        assert_eq!(families.len(), 2);
        assert_eq!(families[0].family_time(), 0);
        assert!(db.family(0).is_none());
        // ids survive the flush
        assert_eq!(db.metric_id("default-ns", "cpu"), Some(1));
    }

    #[test]
    fn test_restore_ids() {
        let mut db = MemoryDatabase::new(10_000);
        db.write(&cpu("a", 0, 1.0)).unwrap();
        db.write(&cpu("b", 0, 1.0)).unwrap();
        let ids = db.encode_ids().unwrap();

        let mut reopened = MemoryDatabase::new(10_000);
        reopened.restore_ids(&ids).unwrap();
        assert_eq!(reopened.metric_id("default-ns", "cpu"), Some(1));
        assert_eq!(reopened.series_id("default-ns", "cpu", "host=b"), Some(2));
        assert_eq!(reopened.stats().buffered_values, 0);

        reopened.write(&cpu("c", 0, 1.0)).unwrap();
        reopened
            .write(&Metric::new("mem", 0).with_field("used", SimpleFieldType::Last, 1.0))
            .unwrap();
        assert_eq!(reopened.series_id("default-ns", "cpu", "host=c"), Some(3));
        assert_eq!(reopened.metric_id("default-ns", "mem"), Some(2));

        assert!(reopened.restore_ids(b"garbage").is_err());
    }

    #[test]
    fn test_reserve_metric_ids() {
        let mut db = MemoryDatabase::new(10_000);
        db.reserve_metric_ids(7);
        db.reserve_metric_ids(3);
        db.write(&cpu("a", 0, 1.0)).unwrap();
        assert_eq!(db.metric_id("default-ns", "cpu"), Some(8));
    }

    #[test]
    fn test_restore_family_merges_newer_values() {
        let mut db = MemoryDatabase::new(10_000);
        db.write(&cpu("a", 0, 1.0)).unwrap();
        db.write(
            &Metric::new("gauge", 0).with_field("v", SimpleFieldType::Last, 1.0),
        )
        .unwrap();
        let mut families = db.take_families();

        db.write(&cpu("a", 0, 2.0)).unwrap();
        db.write(
            &Metric::new("gauge", 0).with_field("v", SimpleFieldType::Last, 5.0),
        )
        .unwrap();
        db.restore_family(families.remove(0));

        let family = db.family(0).unwrap();
        assert_eq!(family.value_count(), 4);
        assert_eq!(family.metric(1).unwrap().values(1, 1).unwrap()[&0], 3.0);
        assert_eq!(family.metric(2).unwrap().values(1, 1).unwrap()[&0], 5.0);
    }

    #[test]
    fn test_reject_type_change() {
        let mut db = MemoryDatabase::new(10_000);
        db.write(&cpu("a", 0, 1.0)).unwrap();
        let changed = Metric::new("cpu", 0)
            .with_tag("host", "a")
            .with_field("usage", SimpleFieldType::Max, 1.0);
        assert!(matches!(db.write(&changed), Err(StrataError::InvalidMetric(_))));
        assert_eq!(db.stats().buffered_values, 1);
    }

    #[test]
    fn test_histogram_fields() {
        let mut db = MemoryDatabase::new(10_000);
        let metric = Metric::new("latency", 0).with_histogram(CompoundField {
            min: 1.0,
            max: 8.0,
            sum: 9.0,
            count: 2.0,
            explicit_bounds: vec![5.0, 10.0],
            values: vec![1.0, 1.0],
        });
        db.write(&metric).unwrap();
        let fields = db.fields("default-ns", "latency");
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[4].0, "__bucket_5");
        assert_eq!(fields[4].1.field_type, FieldType::Histogram);
    }
}
