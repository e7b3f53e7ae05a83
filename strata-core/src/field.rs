//! Field metadata shared by the storage write path and the block format

use crate::{Result, StrataError};
use serde::{Deserialize, Serialize};

/// Field identifier, unique inside one metric
pub type FieldId = u8;

/// Storage field type, decides how values in one slot are aggregated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FieldType {
    Sum = 1,
    Min = 2,
    Max = 3,
    Last = 4,
    First = 5,
    /// Histogram bucket count
    Histogram = 6,
}

impl TryFrom<u8> for FieldType {
    type Error = StrataError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FieldType::Sum),
            2 => Ok(FieldType::Min),
            3 => Ok(FieldType::Max),
            4 => Ok(FieldType::Last),
            5 => Ok(FieldType::First),
            6 => Ok(FieldType::Histogram),
            _ => Err(StrataError::InvalidFormat(format!(
                "Invalid field type: {}",
                value
            ))),
        }
    }
}

impl FieldType {
    /// Merge a new value into the value already stored in a slot
    pub fn aggregate(&self, current: f64, value: f64) -> f64 {
        match self {
            FieldType::Sum | FieldType::Histogram => current + value,
            FieldType::Min => current.min(value),
            FieldType::Max => current.max(value),
            FieldType::Last => value,
            FieldType::First => current,
        }
    }
}

/// One column of a metric block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldMeta {
    pub id: FieldId,
    pub field_type: FieldType,
}

impl FieldMeta {
    pub fn new(id: FieldId, field_type: FieldType) -> Self {
        Self { id, field_type }
    }
}

/// Field metas ordered by id, without duplicate ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metas(Vec<FieldMeta>);

impl Metas {
    /// Sort by id; the first meta wins for a duplicated id
    pub fn new(mut metas: Vec<FieldMeta>) -> Self {
        metas.sort_by_key(|m| m.id);
        metas.dedup_by_key(|m| m.id);
        Self(metas)
    }

    /// Position and meta of a field id
    pub fn find(&self, id: FieldId) -> Option<(usize, &FieldMeta)> {
        self.0
            .binary_search_by_key(&id, |m| m.id)
            .ok()
            .map(|idx| (idx, &self.0[idx]))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FieldMeta> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[FieldMeta] {
        &self.0
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl From<Vec<FieldMeta>> for Metas {
    fn from(metas: Vec<FieldMeta>) -> Self {
        Self::new(metas)
    }
}

impl<'a> IntoIterator for &'a Metas {
    type Item = &'a FieldMeta;
    type IntoIter = std::slice::Iter<'a, FieldMeta>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
