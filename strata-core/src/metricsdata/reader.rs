//! Metric block reader

use super::{BLOCK_MAGIC, BLOCK_VERSION, FOOTER_SIZE};
use crate::field::{FieldMeta, FieldType, Metas};
use crate::timeutil::SlotRange;
use crate::{Result, SeriesId, StrataError};
use bytes::{Buf, Bytes};
use roaring::RoaringBitmap;

/// Field payloads of one series, aligned with the requested field metas
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesFieldData {
    pub series_id: SeriesId,
    /// `None` when the series has no data for the field
    pub fields: Vec<Option<Bytes>>,
}

/// Reads a block produced by [`super::Flusher`]
#[derive(Debug)]
pub struct Reader {
    identifier: String,
    data: Bytes,
    metas: Metas,
    series_ids: RoaringBitmap,
    // (offset, length) per series, ascending series id order
    offsets: Vec<(u32, u32)>,
    slot_range: SlotRange,
}

impl Reader {
    /// Parse footer, field metas and series index of a block
    pub fn new(identifier: impl Into<String>, data: Bytes) -> Result<Self> {
        let identifier = identifier.into();
        if data.len() < FOOTER_SIZE {
            return Err(format_err(&identifier, "block too short"));
        }

        let footer_pos = data.len() - FOOTER_SIZE;
        let mut footer = &data[footer_pos..];
        let metas_pos = footer.get_u32_le() as usize;
        let index_pos = footer.get_u32_le() as usize;
        let slot_range = SlotRange::new(footer.get_u16_le(), footer.get_u16_le());
        let expected = footer.get_u32_le();
        let version = footer.get_u8();
        if footer != BLOCK_MAGIC {
            return Err(format_err(&identifier, "invalid block magic"));
        }
        if version != BLOCK_VERSION {
            return Err(format_err(
                &identifier,
                &format!("unsupported version {}", version),
            ));
        }
        let actual = crc32fast::hash(&data[..footer_pos]);
        if expected != actual {
            return Err(StrataError::ChecksumMismatch { expected, actual });
        }
        if metas_pos > index_pos || index_pos > footer_pos {
            return Err(format_err(&identifier, "section offsets out of bounds"));
        }

        let metas = parse_metas(&data[metas_pos..index_pos])
            .map_err(|msg| format_err(&identifier, &msg))?;

        let mut index = &data[index_pos..footer_pos];
        if index.remaining() < 4 {
            return Err(format_err(&identifier, "series index too short"));
        }
        let bitmap_len = index.get_u32_le() as usize;
        if index.remaining() < bitmap_len {
            return Err(format_err(&identifier, "series bitmap truncated"));
        }
        let series_ids = RoaringBitmap::deserialize_from(&index[..bitmap_len])
            .map_err(|e| format_err(&identifier, &format!("series bitmap: {}", e)))?;
        index.advance(bitmap_len);

        if index.remaining() as u64 != series_ids.len() * 8 {
            return Err(format_err(&identifier, "series offsets size mismatch"));
        }
        let mut offsets = Vec::with_capacity(series_ids.len() as usize);
        while index.has_remaining() {
            let offset = index.get_u32_le();
            let len = index.get_u32_le();
            if offset as usize + len as usize > metas_pos {
                return Err(format_err(&identifier, "series payload out of bounds"));
            }
            offsets.push((offset, len));
        }

        Ok(Self {
            identifier,
            data,
            metas,
            series_ids,
            offsets,
            slot_range,
        })
    }

    /// Field payloads of every series in both the block and `series_ids`
    ///
    /// Each result holds one entry per meta in `fields`, in that order. Fields
    /// unknown to the block are reported as absent.
    pub fn load(&self, series_ids: &RoaringBitmap, fields: &Metas) -> Result<Vec<SeriesFieldData>> {
        let matched = &self.series_ids & series_ids;
        if matched.is_empty() || fields.is_empty() {
            return Ok(Vec::new());
        }

        let positions: Vec<Option<usize>> = fields
            .iter()
            .map(|f| self.metas.find(f.id).map(|(idx, _)| idx))
            .collect();

        let mut result = Vec::with_capacity(matched.len() as usize);
        for series_id in matched.iter() {
            // rank counts ids <= series_id, the series is present so rank >= 1
            let rank = self.series_ids.rank(series_id) as usize - 1;
            let (offset, len) = self.offsets[rank];
            let payload = self
                .data
                .slice(offset as usize..offset as usize + len as usize);
            let columns = self.split_fields(series_id, payload)?;

            result.push(SeriesFieldData {
                series_id,
                fields: positions
                    .iter()
                    .map(|pos| pos.and_then(|p| columns.get(p).cloned().flatten()))
                    .collect(),
            });
        }
        Ok(result)
    }

    fn split_fields(&self, series_id: SeriesId, mut payload: Bytes) -> Result<Vec<Option<Bytes>>> {
        let field_count = self.metas.len();
        if payload.is_empty() {
            return Ok(vec![None; field_count]);
        }
        if payload.len() < field_count * 4 {
            return Err(format_err(
                &self.identifier,
                &format!("series {} payload truncated", series_id),
            ));
        }

        let lens: Vec<usize> = (0..field_count)
            .map(|_| payload.get_u32_le() as usize)
            .collect();
        if lens.iter().sum::<usize>() != payload.len() {
            return Err(format_err(
                &self.identifier,
                &format!("series {} field sizes mismatch", series_id),
            ));
        }

        Ok(lens
            .into_iter()
            .map(|len| {
                let field = payload.split_to(len);
                (!field.is_empty()).then_some(field)
            })
            .collect())
    }

    /// Name of the block, used in error messages
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Field metas stored in the block
    pub fn get_field_metas(&self) -> &Metas {
        &self.metas
    }

    /// Series ids stored in the block
    pub fn get_series_ids(&self) -> &RoaringBitmap {
        &self.series_ids
    }

    /// Slot range the block was committed with
    pub fn slot_range(&self) -> SlotRange {
        self.slot_range
    }
}

fn format_err(identifier: &str, msg: &str) -> StrataError {
    StrataError::InvalidFormat(format!("metric block {}: {}", identifier, msg))
}

fn parse_metas(mut data: &[u8]) -> std::result::Result<Metas, String> {
    if data.remaining() < 2 {
        return Err("field metas too short".into());
    }
    let count = data.get_u16_le() as usize;
    if data.remaining() != count * 2 {
        return Err("field metas size mismatch".into());
    }
    let mut metas = Vec::with_capacity(count);
    for _ in 0..count {
        let id = data.get_u8();
        let field_type = FieldType::try_from(data.get_u8()).map_err(|e| e.to_string())?;
        metas.push(FieldMeta::new(id, field_type));
    }
    Ok(Metas::new(metas))
}
