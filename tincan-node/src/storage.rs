//! Parameter storage
//!
//! The node does not know the storage medium. The application supplies a [`ParameterStore`],
//! which the node calls when object 0x1010 or 0x1011 receives its command value, and at every
//! (re)start to load saved values.
//!
//! [`MemoryStore`] keeps the serialized values in a RAM buffer. It is useful for tests, and as a
//! staging buffer for stores backed by flash.

use defmt_or_log::info;
use snafu::Snafu;

use crate::{object_dict::ObjectDictionary, persist};

/// Errors reported by a [`ParameterStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    /// The serialized values do not fit the medium
    #[snafu(display("Need {needed} bytes of storage, only {capacity} available"))]
    InsufficientSpace {
        /// Bytes required
        needed: usize,
        /// Bytes available
        capacity: usize,
    },
    /// The medium reported a failure
    #[snafu(display("Storage medium error"))]
    Medium,
}

/// Application storage for persisted object values
pub trait ParameterStore {
    /// Restore saved values into `od`
    ///
    /// Called at every start after the configured defaults are applied. Having nothing saved is
    /// not an error.
    fn load(&mut self, od: &ObjectDictionary<'_>) -> Result<(), StorageError>;

    /// Save the values of all persisted objects in `od`
    fn save(&mut self, od: &ObjectDictionary<'_>) -> Result<(), StorageError>;

    /// Erase saved values, so the defaults apply at the next start
    fn clear(&mut self) -> Result<(), StorageError>;
}

/// Writes into a fixed slice, failing once it is full
struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

#[derive(Debug, Clone, Copy)]
struct SliceFull;

impl embedded_io::Error for SliceFull {
    fn kind(&self) -> embedded_io::ErrorKind {
        embedded_io::ErrorKind::OutOfMemory
    }
}

impl embedded_io::ErrorType for SliceWriter<'_> {
    type Error = SliceFull;
}

impl embedded_io::Write for SliceWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let room = self.buf.len() - self.pos;
        if room == 0 && !buf.is_empty() {
            return Err(SliceFull);
        }
        let n = buf.len().min(room);
        self.buf[self.pos..self.pos + n].copy_from_slice(&buf[..n]);
        self.pos += n;
        Ok(n)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// A [`ParameterStore`] holding up to `N` bytes in RAM
#[derive(Debug)]
pub struct MemoryStore<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> Default for MemoryStore<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> MemoryStore<N> {
    /// Create an empty store
    pub const fn new() -> Self {
        Self { buf: [0; N], len: 0 }
    }

    /// The currently saved bytes
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Replace the saved bytes, e.g. with data read back from flash
    pub fn set_data(&mut self, data: &[u8]) -> Result<(), StorageError> {
        if data.len() > N {
            return InsufficientSpaceSnafu {
                needed: data.len(),
                capacity: N,
            }
            .fail();
        }
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }
}

impl<const N: usize> ParameterStore for MemoryStore<N> {
    fn load(&mut self, od: &ObjectDictionary<'_>) -> Result<(), StorageError> {
        if self.len > 0 {
            persist::restore(od, &self.buf[..self.len]);
        }
        Ok(())
    }

    fn save(&mut self, od: &ObjectDictionary<'_>) -> Result<(), StorageError> {
        let needed = persist::serialized_size(od);
        if needed > N {
            return InsufficientSpaceSnafu {
                needed,
                capacity: N,
            }
            .fail();
        }
        let mut writer = SliceWriter {
            buf: &mut self.buf,
            pos: 0,
        };
        let written = persist::serialize(od, &mut writer).map_err(|_| StorageError::Medium)?;
        self.len = written;
        info!("Saved {} bytes of parameters", written);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.len = 0;
        info!("Cleared saved parameters");
        Ok(())
    }
}
