//! Columnar per-metric data blocks
//!
//! One block holds the field data of every series of a metric for one time
//! family. Block layout, all integers little endian:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  Series payloads (one per series, in flush order)          │
//! │  - u32 length per prepared field, then the field bytes     │
//! │  - empty payload when the series has no field data         │
//! ├───────────────────────────────────────────────────────────┤
//! │  Field metas                                               │
//! │  - u16 count, then (u8 field id, u8 field type) per field  │
//! ├───────────────────────────────────────────────────────────┤
//! │  Series index                                              │
//! │  - u32 bitmap size, roaring bitmap of series ids           │
//! │  - (u32 offset, u32 length) per series, ascending id order │
//! ├───────────────────────────────────────────────────────────┤
//! │  Footer (21 bytes)                                         │
//! │  - u32 metas position, u32 index position                  │
//! │  - u16 slot start, u16 slot end                            │
//! │  - u32 CRC32 of everything before the footer               │
//! │  - u8 version, magic "MBLK"                                │
//! └───────────────────────────────────────────────────────────┘
//! ```

mod flusher;
mod reader;

pub use flusher::Flusher;
pub use reader::{Reader, SeriesFieldData};

/// Block format version
pub const BLOCK_VERSION: u8 = 1;

/// Footer magic
pub const BLOCK_MAGIC: &[u8; 4] = b"MBLK";

/// Footer size in bytes
pub const FOOTER_SIZE: usize = 21;
