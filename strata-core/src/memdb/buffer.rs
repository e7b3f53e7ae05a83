//! Write buffers of one time family

use super::encoding::encode_field;
use crate::field::{FieldId, FieldMeta, FieldType, Metas};
use crate::kv::StoreWriter;
use crate::metricsdata::Flusher;
use crate::timeutil::SlotRange;
use crate::{MetricId, Result, SeriesId, Timestamp};
use std::collections::BTreeMap;

/// Aggregated values of one series, per field and slot
type SeriesValues = BTreeMap<FieldId, BTreeMap<u16, f64>>;

/// Buffered values of one metric
#[derive(Debug, Default)]
pub struct MetricBuffer {
    fields: BTreeMap<FieldId, FieldType>,
    series: BTreeMap<SeriesId, SeriesValues>,
    slot_range: Option<SlotRange>,
}

impl MetricBuffer {
    fn write(&mut self, series_id: SeriesId, field: FieldMeta, slot: u16, value: f64) {
        self.fields.insert(field.id, field.field_type);
        self.series
            .entry(series_id)
            .or_default()
            .entry(field.id)
            .or_default()
            .entry(slot)
            .and_modify(|current| *current = field.field_type.aggregate(*current, value))
            .or_insert(value);

        match self.slot_range.as_mut() {
            Some(range) => range.extend(slot),
            None => self.slot_range = Some(SlotRange::new(slot, slot)),
        }
    }

    /// Fields written into this family
    pub fn metas(&self) -> Metas {
        Metas::new(
            self.fields
                .iter()
                .map(|(id, field_type)| FieldMeta::new(*id, *field_type))
                .collect(),
        )
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    pub fn slot_range(&self) -> Option<SlotRange> {
        self.slot_range
    }

    /// Slot values of one series field
    pub fn values(&self, series_id: SeriesId, field_id: FieldId) -> Option<&BTreeMap<u16, f64>> {
        self.series.get(&series_id)?.get(&field_id)
    }
}

/// Buffered values of every metric for one family (hour)
#[derive(Debug)]
pub struct FamilyBuffer {
    family_time: Timestamp,
    metrics: BTreeMap<MetricId, MetricBuffer>,
    values: usize,
}

impl FamilyBuffer {
    pub fn new(family_time: Timestamp) -> Self {
        Self {
            family_time,
            metrics: BTreeMap::new(),
            values: 0,
        }
    }

    pub fn family_time(&self) -> Timestamp {
        self.family_time
    }

    pub(crate) fn write(
        &mut self,
        metric_id: MetricId,
        series_id: SeriesId,
        field: FieldMeta,
        slot: u16,
        value: f64,
    ) {
        self.metrics
            .entry(metric_id)
            .or_default()
            .write(series_id, field, slot, value);
        self.values += 1;
    }

    /// Fold the values of a newer buffer of the same family into this one
    pub(crate) fn merge(&mut self, newer: FamilyBuffer) {
        for (metric_id, buffer) in newer.metrics {
            let target = self.metrics.entry(metric_id).or_default();
            for (series_id, fields) in buffer.series {
                for (field_id, slots) in fields {
                    let Some(field_type) = buffer.fields.get(&field_id).copied() else {
                        continue;
                    };
                    for (slot, value) in slots {
                        target.write(series_id, FieldMeta::new(field_id, field_type), slot, value);
                    }
                }
            }
        }
        self.values += newer.values;
    }

    pub fn metric(&self, metric_id: MetricId) -> Option<&MetricBuffer> {
        self.metrics.get(&metric_id)
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }

    /// Number of values written, before aggregation
    pub fn value_count(&self) -> usize {
        self.values
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Write one block per metric through `flusher`; returns the blocks written
    pub fn flush_to<W: StoreWriter>(&self, flusher: &mut Flusher<W>) -> Result<usize> {
        let mut blocks = 0;
        for (metric_id, buffer) in &self.metrics {
            let slot_range = match buffer.slot_range {
                Some(range) => range,
                None => continue,
            };
            let metas = buffer.metas();
            flusher.prepare_metric(*metric_id, metas.as_slice());

            for (series_id, fields) in &buffer.series {
                for meta in &metas {
                    let data = fields.get(&meta.id).map(encode_field).unwrap_or_default();
                    flusher.flush_field(&data)?;
                }
                flusher.flush_series(*series_id)?;
            }
            flusher.commit_metric(slot_range)?;
            blocks += 1;
        }
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStoreWriter;
    use crate::memdb::decode_field;
    use crate::metricsdata::Reader;
    use roaring::RoaringBitmap;

    #[test]
    fn test_aggregate_per_slot() {
        let mut family = FamilyBuffer::new(0);
        let sum = FieldMeta::new(1, FieldType::Sum);
        let max = FieldMeta::new(2, FieldType::Max);
        family.write(7, 1, sum, 3, 1.0);
        family.write(7, 1, sum, 3, 2.5);
        family.write(7, 1, sum, 4, 1.0);
        family.write(7, 1, max, 3, 5.0);
        family.write(7, 1, max, 3, 4.0);

        let metric = family.metric(7).unwrap();
        assert_eq!(metric.values(1, 1).unwrap()[&3], 3.5);
        assert_eq!(metric.values(1, 2).unwrap()[&3], 5.0);
        assert_eq!(metric.slot_range(), Some(SlotRange::new(3, 4)));
        assert_eq!(family.value_count(), 5);
    }

    #[test]
    fn test_flush_to_blocks() {
        let mut family = FamilyBuffer::new(0);
        let sum = FieldMeta::new(1, FieldType::Sum);
        let last = FieldMeta::new(2, FieldType::Last);
        family.write(1, 10, sum, 0, 1.0);
        family.write(1, 10, last, 2, 9.0);
        family.write(1, 20, last, 5, 3.0);
        family.write(2, 1, sum, 1, 4.0);

        let mut flusher = Flusher::new(MemoryStoreWriter::new());
        assert_eq!(family.flush_to(&mut flusher).unwrap(), 2);
        let writer = flusher.into_writer();

        let reader = Reader::new("metric-1", writer.get(1).unwrap()).unwrap();
        assert_eq!(reader.slot_range(), SlotRange::new(0, 5));
        let all: RoaringBitmap = [10u32, 20].into_iter().collect();
        let rows = reader.load(&all, &family.metric(1).unwrap().metas()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(decode_field(rows[0].fields[0].as_ref().unwrap()).unwrap(), vec![(0, 1.0)]);
        assert_eq!(decode_field(rows[0].fields[1].as_ref().unwrap()).unwrap(), vec![(2, 9.0)]);
        assert!(rows[1].fields[0].is_none());
        assert_eq!(decode_field(rows[1].fields[1].as_ref().unwrap()).unwrap(), vec![(5, 3.0)]);

        assert!(writer.get(2).is_some());
    }
}
