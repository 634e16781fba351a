//! Serialization of persisted object values
//!
//! Every entry marked `persist` is written as a sequence of records, one per sub index holding a
//! value. Array elements are stored individually; array sub 0 is never stored. A record is
//!
//! ```text
//! len: u16 LE | kind: u8 | index: u16 LE | sub: u8 | value bytes
//! ```
//!
//! where `len` counts everything after itself.

use defmt_or_log::{debug, info, warn};

use crate::object_dict::{ObjectDictionary, ObjectEntry};

/// Record kinds
#[derive(Debug, Copy, Clone, PartialEq)]
#[repr(u8)]
pub enum RecordKind {
    /// The saved value of a sub object
    ObjectValue = 1,
    /// An unrecognized record kind
    Unknown,
}

impl RecordKind {
    /// Decode a kind byte
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => Self::ObjectValue,
            _ => Self::Unknown,
        }
    }
}

/// Bytes in a record besides the value: kind, index and sub
const RECORD_HEADER_LEN: usize = 4;

/// The subs of `entry` which hold persisted values
fn persisted_subs(entry: &ObjectEntry<'_>) -> impl Iterator<Item = u8> {
    let (first, last) = match (entry.persist, entry.slot.array_len()) {
        (false, _) => (1, 0),
        (true, Some(len)) => (1, len.min(u8::MAX as usize) as u8),
        (true, None) => (0, 0),
    };
    first..=last
}

/// The number of bytes [`serialize`] will write for `od`
pub fn serialized_size(od: &ObjectDictionary<'_>) -> usize {
    od.entries()
        .iter()
        .flat_map(|entry| {
            persisted_subs(entry).filter_map(move |sub| entry.resolve(sub).ok())
        })
        .map(|resolved| 2 + RECORD_HEADER_LEN + resolved.width())
        .sum()
}

/// Write the values of all persisted objects to `writer`
///
/// Returns the number of bytes written.
pub fn serialize<W: embedded_io::Write>(
    od: &ObjectDictionary<'_>,
    writer: &mut W,
) -> Result<usize, W::Error> {
    let mut total = 0;
    for entry in od.entries() {
        for sub in persisted_subs(entry) {
            let Ok(resolved) = entry.resolve(sub) else {
                continue;
            };
            let width = resolved.width();
            let len = (RECORD_HEADER_LEN + width) as u16;
            writer.write_all(&len.to_le_bytes())?;
            writer.write_all(&[RecordKind::ObjectValue as u8])?;
            writer.write_all(&entry.index.to_le_bytes())?;
            writer.write_all(&[sub])?;

            let mut chunk = [0u8; 32];
            let mut offset = 0;
            while offset < width {
                let n = match resolved.read_at(offset, &mut chunk) {
                    Ok(n) => n.min(width - offset),
                    Err(_) => 0,
                };
                if n == 0 {
                    // The value could not be read, pad the record so the stream stays aligned
                    chunk.fill(0);
                    let pad = (width - offset).min(chunk.len());
                    writer.write_all(&chunk[..pad])?;
                    offset += pad;
                } else {
                    writer.write_all(&chunk[..n])?;
                    offset += n;
                }
            }
            debug!("Serialized {} bytes for 0x{:x}sub{}", width, entry.index, sub);
            total += 2 + len as usize;
        }
    }
    writer.flush()?;
    Ok(total)
}

/// One record read from serialized data
#[derive(Debug, PartialEq)]
pub enum PersistRecord<'a> {
    /// A saved value for a sub object
    ObjectValue {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
        /// The raw value bytes
        data: &'a [u8],
    },
    /// A record of an unrecognized kind. Holds the record bytes, starting with the kind.
    Unknown(&'a [u8]),
}

impl<'a> PersistRecord<'a> {
    fn from_slice(data: &'a [u8]) -> Option<Self> {
        let kind = *data.first()?;
        match RecordKind::from_byte(kind) {
            RecordKind::ObjectValue => {
                if data.len() < RECORD_HEADER_LEN {
                    return None;
                }
                Some(Self::ObjectValue {
                    index: u16::from_le_bytes([data[1], data[2]]),
                    sub: data[3],
                    data: &data[RECORD_HEADER_LEN..],
                })
            }
            RecordKind::Unknown => Some(Self::Unknown(data)),
        }
    }
}

/// Iterates the records in a slice of serialized data
///
/// Iteration ends at the first truncated or malformed record.
#[derive(Debug)]
pub struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    /// Read records from `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { buf: data, pos: 0 }
    }
}

impl<'a> Iterator for RecordReader<'a> {
    type Item = PersistRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.buf.get(self.pos..)?;
        if rest.len() < 2 {
            return None;
        }
        let length = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        let Some(record) = rest.get(2..2 + length) else {
            warn!("Truncated persisted record at offset {}", self.pos);
            self.pos = self.buf.len();
            return None;
        };
        self.pos += 2 + length;
        let parsed = PersistRecord::from_slice(record);
        if parsed.is_none() {
            warn!("Malformed persisted record at offset {}", self.pos);
            self.pos = self.buf.len();
        }
        parsed
    }
}

/// Write previously serialized values back into `od`
///
/// Records for unknown objects, and values the dictionary refuses, are logged and skipped.
/// Returns the number of values restored.
pub fn restore(od: &ObjectDictionary<'_>, stored: &[u8]) -> usize {
    let mut restored = 0;
    for record in RecordReader::new(stored) {
        match record {
            PersistRecord::ObjectValue { index, sub, data } => match od.write(index, sub, data) {
                Ok(()) => {
                    debug!("Restored 0x{:x}sub{} with {:?}", index, sub, data);
                    restored += 1;
                }
                Err(abort_code) => warn!(
                    "Error restoring object 0x{:x}sub{}: {:?}",
                    index, sub, abort_code
                ),
            },
            PersistRecord::Unknown(bytes) => {
                warn!("Unknown persisted record kind {}", bytes[0])
            }
        }
    }
    info!("Restored {} persisted values", restored);
    restored
}
