//! Object Dictionary
//!
//! # Objects Overview
//!
//! The object dictionary is the table of every value a node exposes on the bus. Each
//! [`ObjectEntry`] pairs a 16-bit index with a typed reference ([`SlotRef`]) to storage owned by
//! the application. Objects come in three shapes:
//!
//! - Scalars: a single integer, accessed at any sub index
//! - Strings: a byte string with a fixed capacity, accessed at any sub index
//! - Arrays: a fixed number of integer elements. Sub index 0 is a read-only u8 holding the length,
//!   and sub indices `1..=len` hold the elements.
//!
//! The dictionary is built once, at node construction, from the [`CommonObjects`] and the
//! application's own entries, and sorted by index. Lookups are binary searches.
//!
//! # Object Storage
//!
//! All storage types use `critical_section` protected cells, so the application can read and
//! write its objects from any context while the node owns the dictionary. No component keeps a
//! resolved entry between calls; lookups are repeated on every access.
//!
//! # Example
//!
//! ```rust
//! use tincan_node::object_dict::{CommonObjects, ObjectDictionary, ObjectEntry, ScalarField, SlotRef, StringField};
//! use tincan_node::common::objects::AccessType;
//!
//! static COMMON: CommonObjects = CommonObjects::new();
//! static SPEED: ScalarField<u16> = ScalarField::<u16>::new(0);
//! static NAME: StringField<16> = StringField::new(b"pump");
//!
//! let app = [
//!     ObjectEntry::new(0x2000, AccessType::Rw, SlotRef::U16(&SPEED)),
//!     ObjectEntry::new(0x2001, AccessType::Ro, SlotRef::Str(&NAME)),
//! ];
//! let od = ObjectDictionary::new(&COMMON, &app).unwrap();
//! od.write(0x2000, 0, &500u16.to_le_bytes()).unwrap();
//! assert_eq!(500, SPEED.load());
//! ```

use heapless::Vec;
use snafu::Snafu;
use tincan_common::sdo::AbortCode;

mod common_objects;
mod entry;
mod fields;

pub use common_objects::*;
pub use entry::*;
pub use fields::*;

/// Maximum number of objects in a dictionary
pub const MAX_OBJECTS: usize = 128;

/// Errors in the set of entries used to build a dictionary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum OdError {
    /// Two entries share an index
    #[snafu(display("Multiple definitions for object with index 0x{index:x}"))]
    DuplicateIndex {
        /// The duplicated index
        index: u16,
    },
    /// More entries than the dictionary can hold
    #[snafu(display("Too many objects, at most {MAX_OBJECTS} are supported"))]
    TooManyObjects,
    /// An array with zero elements, or more than 255
    #[snafu(display("Array 0x{index:x} has {len} elements, must be 1..=255"))]
    InvalidArrayLength {
        /// The array's index
        index: u16,
        /// Its element count
        len: usize,
    },
}

/// A sorted table of objects
#[derive(Debug)]
pub struct ObjectDictionary<'a> {
    entries: Vec<ObjectEntry<'a>, MAX_OBJECTS>,
}

impl<'a> ObjectDictionary<'a> {
    /// Build a dictionary from the common objects and the application's entries
    pub fn new(common: &'a CommonObjects, app: &[ObjectEntry<'a>]) -> Result<Self, OdError> {
        Self::from_entries(common.entries().iter().chain(app.iter()).copied())
    }

    /// Build a dictionary from any set of entries
    ///
    /// The entries may come in any order.
    pub fn from_entries(
        entries: impl IntoIterator<Item = ObjectEntry<'a>>,
    ) -> Result<Self, OdError> {
        let mut table: Vec<ObjectEntry<'a>, MAX_OBJECTS> = Vec::new();
        for entry in entries {
            if let Some(len) = entry.slot.array_len() {
                if len == 0 || len > u8::MAX as usize {
                    return InvalidArrayLengthSnafu {
                        index: entry.index,
                        len,
                    }
                    .fail();
                }
            }
            table.push(entry).map_err(|_| OdError::TooManyObjects)?;
        }
        table.sort_unstable_by_key(|e| e.index);
        if let Some(w) = table.windows(2).find(|w| w[0].index == w[1].index) {
            return DuplicateIndexSnafu { index: w[0].index }.fail();
        }
        Ok(Self { entries: table })
    }

    /// All entries, sorted by index
    pub fn entries(&self) -> &[ObjectEntry<'a>] {
        &self.entries
    }

    /// Find the entry for an object index
    pub fn find(&self, index: u16) -> Option<&ObjectEntry<'a>> {
        self.entries
            .binary_search_by_key(&index, |e| e.index)
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Resolve a sub object
    ///
    /// # Errors
    ///
    /// - [`AbortCode::NoSuchObject`] if there is no object at `index`
    /// - [`AbortCode::NoSuchSubIndex`] if `sub` is past the end of an array
    pub fn resolve(&self, index: u16, sub: u8) -> Result<ResolvedEntry<'a>, AbortCode> {
        self.find(index).ok_or(AbortCode::NoSuchObject)?.resolve(sub)
    }

    /// Resolve a sub object, if it exists
    pub fn lookup(&self, index: u16, sub: u8) -> Option<ResolvedEntry<'a>> {
        self.resolve(index, sub).ok()
    }

    /// Read a sub object into `buf`, returning the number of bytes read
    pub fn read(&self, index: u16, sub: u8, buf: &mut [u8]) -> Result<usize, AbortCode> {
        self.resolve(index, sub)?.read(buf)
    }

    /// Write a sub object
    pub fn write(&self, index: u16, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        self.resolve(index, sub)?.write(data)
    }

    /// Read a sub object as a u8
    pub fn read_u8(&self, index: u16, sub: u8) -> Result<u8, AbortCode> {
        let mut buf = [0; 1];
        self.read(index, sub, &mut buf)?;
        Ok(buf[0])
    }

    /// Read a sub object as a u16
    pub fn read_u16(&self, index: u16, sub: u8) -> Result<u16, AbortCode> {
        let mut buf = [0; 2];
        self.read(index, sub, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Read a sub object as a u32
    pub fn read_u32(&self, index: u16, sub: u8) -> Result<u32, AbortCode> {
        let mut buf = [0; 4];
        self.read(index, sub, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}
