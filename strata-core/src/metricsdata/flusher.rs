//! Metric block flusher

use super::{BLOCK_MAGIC, BLOCK_VERSION, FOOTER_SIZE};
use crate::field::{FieldMeta, Metas};
use crate::kv::StoreWriter;
use crate::timeutil::SlotRange;
use crate::{MetricId, Result, SeriesId, StrataError};
use bytes::{BufMut, BytesMut};
use roaring::RoaringBitmap;
use std::collections::BTreeMap;
use tracing::debug;

/// Location of one series payload inside the block
#[derive(Debug, Clone, Copy)]
struct SeriesEntry {
    offset: u32,
    len: u32,
}

/// Builds one columnar block per metric and hands it to a [`StoreWriter`]
///
/// Calls are sequenced per metric: `prepare_metric`, then for every series
/// one `flush_field` per declared field followed by `flush_series`, then
/// `commit_metric`.
pub struct Flusher<W: StoreWriter> {
    writer: W,
    metric_id: MetricId,
    metas: Metas,
    // column of each field in declaration order
    declared: Vec<usize>,

    // field payloads of the series being assembled, per column
    pending: Vec<Option<(usize, usize)>>,
    flushed_fields: usize,
    field_data: BytesMut,

    // series payloads of the metric being assembled
    series: BTreeMap<SeriesId, SeriesEntry>,
    data: BytesMut,

    closed: bool,
}

impl<W: StoreWriter> Flusher<W> {
    /// Create a flusher writing into `writer`
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            metric_id: 0,
            metas: Metas::default(),
            declared: Vec::new(),
            pending: Vec::new(),
            flushed_fields: 0,
            field_data: BytesMut::new(),
            series: BTreeMap::new(),
            data: BytesMut::new(),
            closed: false,
        }
    }

    /// Start a metric, replacing any state left by a previous one
    ///
    /// `flush_field` follows the order of `fields`; the block stores the
    /// columns ordered by field id. For a repeated field id the first type
    /// is kept and the last payload of a series wins.
    pub fn prepare_metric(&mut self, metric_id: MetricId, fields: &[FieldMeta]) {
        self.reset();
        self.metric_id = metric_id;
        self.metas = Metas::new(fields.to_vec());
        self.declared = fields
            .iter()
            .filter_map(|field| self.metas.find(field.id).map(|(column, _)| column))
            .collect();
        self.pending = vec![None; self.metas.len()];
    }

    /// Append the payload of the next declared field; empty means no data
    pub fn flush_field(&mut self, data: &[u8]) -> Result<()> {
        let Some(column) = self.declared.get(self.flushed_fields).copied() else {
            return Err(StrataError::InvalidFormat(format!(
                "metric {} has {} fields, got one more",
                self.metric_id,
                self.declared.len()
            )));
        };
        self.flushed_fields += 1;

        if data.is_empty() {
            self.pending[column] = None;
            return Ok(());
        }
        if u32::try_from(data.len()).is_err() {
            return Err(StrataError::Encoding(format!(
                "metric {} field payload too large",
                self.metric_id
            )));
        }
        let start = self.field_data.len();
        self.field_data.put_slice(data);
        self.pending[column] = Some((start, data.len()));
        Ok(())
    }

    /// Bind the fields appended since the last series to `series_id`
    pub fn flush_series(&mut self, series_id: SeriesId) -> Result<()> {
        let offset = block_offset(self.metric_id, self.data.len())?;

        if self.pending.iter().any(Option::is_some) {
            for payload in &self.pending {
                let len = payload.map_or(0, |(_, len)| len);
                self.data.put_u32_le(len as u32);
            }
            for (start, len) in self.pending.iter().flatten() {
                self.data.put_slice(&self.field_data[*start..*start + *len]);
            }
        }

        let end = block_offset(self.metric_id, self.data.len())?;
        // a repeated series id points at its latest payload
        self.series.insert(
            series_id,
            SeriesEntry {
                offset,
                len: end - offset,
            },
        );

        self.pending.iter_mut().for_each(|payload| *payload = None);
        self.flushed_fields = 0;
        self.field_data.clear();
        Ok(())
    }

    /// Write the metric block; a metric without series writes nothing
    pub fn commit_metric(&mut self, slot_range: SlotRange) -> Result<()> {
        if self.series.is_empty() {
            debug!(metric_id = self.metric_id, "metric has no series, skip block");
            self.reset();
            return Ok(());
        }

        let result = match self.build_block(slot_range) {
            Ok(block) => {
                debug!(
                    metric_id = self.metric_id,
                    series = self.series.len(),
                    bytes = block.len(),
                    "commit metric block"
                );
                self.writer.add(self.metric_id, &block)
            }
            Err(e) => Err(e),
        };
        self.reset();
        result
    }

    /// Field metas of the metric being flushed
    pub fn get_field_metas(&self) -> &Metas {
        &self.metas
    }

    /// Close the underlying store writer once
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.close()
    }

    /// Underlying store writer
    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Consume the flusher and return the store writer
    pub fn into_writer(self) -> W {
        self.writer
    }

    fn build_block(&self, slot_range: SlotRange) -> Result<BytesMut> {
        let mut block =
            BytesMut::with_capacity(self.data.len() + self.series.len() * 8 + FOOTER_SIZE + 64);
        block.put_slice(&self.data);

        let metas_pos = block.len();
        block.put_u16_le(self.metas.len() as u16);
        for FieldMeta { id, field_type } in self.metas.iter() {
            block.put_u8(*id);
            block.put_u8(*field_type as u8);
        }

        let index_pos = block.len();
        let bitmap: RoaringBitmap = self.series.keys().copied().collect();
        let mut bitmap_data = Vec::with_capacity(bitmap.serialized_size());
        bitmap.serialize_into(&mut bitmap_data)?;
        block.put_u32_le(bitmap_data.len() as u32);
        block.put_slice(&bitmap_data);
        for entry in self.series.values() {
            block.put_u32_le(entry.offset);
            block.put_u32_le(entry.len);
        }

        let metas_pos = block_offset(self.metric_id, metas_pos)?;
        let index_pos = block_offset(self.metric_id, index_pos)?;
        let checksum = crc32fast::hash(&block);
        block.put_u32_le(metas_pos);
        block.put_u32_le(index_pos);
        block.put_u16_le(slot_range.start);
        block.put_u16_le(slot_range.end);
        block.put_u32_le(checksum);
        block.put_u8(BLOCK_VERSION);
        block.put_slice(BLOCK_MAGIC);

        Ok(block)
    }

    fn reset(&mut self) {
        self.metric_id = 0;
        self.metas.clear();
        self.declared.clear();
        self.pending.clear();
        self.flushed_fields = 0;
        self.field_data.clear();
        self.series.clear();
        self.data.clear();
    }
}

/// Offsets inside a block are u32
fn block_offset(metric_id: MetricId, len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| StrataError::Encoding(format!("metric {} block too large", metric_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldType;
    use crate::kv::MemoryStoreWriter;
    use crate::metricsdata::Reader;

    fn sum_fields(ids: &[u8]) -> Vec<FieldMeta> {
        ids.iter().map(|id| FieldMeta::new(*id, FieldType::Sum)).collect()
    }

    #[test]
    fn test_flush_metric() {
        let mut flusher = Flusher::new(MemoryStoreWriter::new());
        flusher.prepare_metric(39, &sum_fields(&[1, 2]));
        // no field for series
        flusher.flush_series(5).unwrap();

        flusher.flush_field(&[1, 2, 3]).unwrap();
        flusher.flush_field(&[10, 20, 30]).unwrap();
        flusher.flush_series(10).unwrap();

        // only the first field has data
        flusher.flush_field(&[10, 20, 30]).unwrap();
        flusher.flush_field(&[]).unwrap();
        flusher.flush_series(100).unwrap();

        assert_eq!(flusher.get_field_metas(), &Metas::new(sum_fields(&[1, 2])));
        flusher.commit_metric(SlotRange::new(10, 13)).unwrap();
        assert!(flusher.get_field_metas().is_empty());
        assert_eq!(flusher.writer().entries().len(), 1);
        assert_eq!(flusher.writer().entries()[0].0, 39);

        // field data without series, nothing written
        flusher.prepare_metric(40, &sum_fields(&[1]));
        flusher.flush_field(&[1, 2, 3]).unwrap();
        flusher.commit_metric(SlotRange::new(10, 13)).unwrap();
        assert!(flusher.get_field_metas().is_empty());

        flusher.prepare_metric(50, &sum_fields(&[1]));
        flusher.flush_field(&[]).unwrap();
        flusher.commit_metric(SlotRange::new(10, 13)).unwrap();
        assert_eq!(flusher.writer().entries().len(), 1);

        flusher.close().unwrap();
        flusher.close().unwrap();
        assert!(flusher.writer().is_closed());
    }

    #[test]
    fn test_fields_follow_declared_order() {
        let mut flusher = Flusher::new(MemoryStoreWriter::new());
        flusher.prepare_metric(39, &sum_fields(&[2, 1]));
        flusher.flush_field(&[2, 2]).unwrap();
        flusher.flush_field(&[1, 1]).unwrap();
        flusher.flush_series(7).unwrap();
        // declared order again, first field empty
        flusher.flush_field(&[]).unwrap();
        flusher.flush_field(&[1]).unwrap();
        flusher.flush_series(8).unwrap();
        assert_eq!(flusher.get_field_metas(), &Metas::new(sum_fields(&[1, 2])));
        flusher.commit_metric(SlotRange::new(0, 1)).unwrap();

        let reader = Reader::new("39", flusher.writer().bytes()).unwrap();
        let filter: RoaringBitmap = [7, 8].into_iter().collect();
        let rows = reader.load(&filter, &Metas::new(sum_fields(&[2]))).unwrap();
        assert_eq!(rows[0].fields[0].as_deref(), Some(&[2u8, 2][..]));
        assert!(rows[1].fields[0].is_none());

        let rows = reader.load(&filter, &Metas::new(sum_fields(&[1, 2]))).unwrap();
        assert_eq!(rows[0].fields[0].as_deref(), Some(&[1u8, 1][..]));
        assert_eq!(rows[0].fields[1].as_deref(), Some(&[2u8, 2][..]));
        assert_eq!(rows[1].fields[0].as_deref(), Some(&[1u8][..]));
    }

    #[test]
    fn test_repeated_field_id() {
        let mut flusher = Flusher::new(MemoryStoreWriter::new());
        flusher.prepare_metric(1, &sum_fields(&[3, 3]));
        assert_eq!(flusher.get_field_metas().len(), 1);
        flusher.flush_field(&[1]).unwrap();
        flusher.flush_field(&[2]).unwrap();
        assert!(flusher.flush_field(&[3]).is_err());
        flusher.flush_series(1).unwrap();
        flusher.commit_metric(SlotRange::new(0, 0)).unwrap();

        let reader = Reader::new("1", flusher.writer().bytes()).unwrap();
        let filter: RoaringBitmap = [1].into_iter().collect();
        let rows = reader.load(&filter, reader.get_field_metas()).unwrap();
        assert_eq!(rows[0].fields[0].as_deref(), Some(&[2u8][..]));
    }

    #[test]
    fn test_block_offset_range() {
        assert_eq!(block_offset(1, 10).unwrap(), 10);
        assert_eq!(block_offset(1, u32::MAX as usize).unwrap(), u32::MAX);
        assert!(matches!(
            block_offset(1, u32::MAX as usize + 1),
            Err(StrataError::Encoding(_))
        ));
    }

    #[test]
    fn test_flush_too_many_fields() {
        let mut flusher = Flusher::new(MemoryStoreWriter::new());
        flusher.prepare_metric(1, &sum_fields(&[1]));
        flusher.flush_field(&[1]).unwrap();
        assert!(flusher.flush_field(&[2]).is_err());

        // nothing prepared
        let mut flusher = Flusher::new(MemoryStoreWriter::new());
        assert!(flusher.flush_field(&[]).is_err());
    }

    #[test]
    fn test_flush_big_series_id() {
        let mut flusher = Flusher::new(MemoryStoreWriter::new());
        flusher.prepare_metric(39, &sum_fields(&[1, 2]));
        flusher.flush_field(&[1, 2, 3]).unwrap();
        flusher.flush_series(10000).unwrap();
        flusher.flush_field(&[4]).unwrap();
        flusher.flush_series(u32::MAX).unwrap();
        flusher.commit_metric(SlotRange::new(10, 13)).unwrap();
        assert!(flusher.get_field_metas().is_empty());

        let reader = Reader::new("1.sst", flusher.writer().bytes()).unwrap();
        let filter: RoaringBitmap = [10000, u32::MAX].into_iter().collect();
        let rows = reader.load(&filter, &Metas::new(sum_fields(&[1, 2]))).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].series_id, 10000);
        assert_eq!(rows[0].fields[0].as_deref(), Some(&[1u8, 2, 3][..]));
        assert!(rows[0].fields[1].is_none());
        assert_eq!(rows[1].series_id, u32::MAX);
        assert_eq!(rows[1].fields[0].as_deref(), Some(&[4u8][..]));
        flusher.close().unwrap();
    }

    #[test]
    fn test_prepare_discards_unfinished_metric() {
        let mut flusher = Flusher::new(MemoryStoreWriter::new());
        flusher.prepare_metric(1, &sum_fields(&[1]));
        flusher.flush_field(&[1]).unwrap();
        flusher.flush_series(1).unwrap();

        flusher.prepare_metric(2, &sum_fields(&[1]));
        flusher.flush_field(&[2]).unwrap();
        flusher.flush_series(2).unwrap();
        flusher.commit_metric(SlotRange::new(0, 0)).unwrap();

        let entries = flusher.writer().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, 2);
        let reader = Reader::new("2", entries[0].1.clone()).unwrap();
        assert_eq!(reader.get_series_ids().len(), 1);
        assert!(reader.get_series_ids().contains(2));
    }

    #[test]
    fn test_commit_error_resets_state() {
        let mut writer = MemoryStoreWriter::new();
        writer.close().unwrap();
        let mut flusher = Flusher::new(writer);
        flusher.prepare_metric(1, &sum_fields(&[1]));
        flusher.flush_field(&[1]).unwrap();
        flusher.flush_series(1).unwrap();
        assert!(flusher.commit_metric(SlotRange::new(0, 0)).is_err());
        assert!(flusher.get_field_metas().is_empty());
    }
}
