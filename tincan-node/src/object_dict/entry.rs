//! Dictionary entries and resolved sub objects

use tincan_common::{
    objects::{AccessType, ObjectType},
    sdo::AbortCode,
};

use super::{ScalarAccess, ScalarField, StringAccess};

/// A typed reference to the storage of an object
///
/// The [`ObjectType`] of an entry is derived from the variant, so the type and the storage always
/// agree.
#[derive(Clone, Copy)]
pub enum SlotRef<'a> {
    /// u8 value
    U8(&'a ScalarField<u8>),
    /// u16 value
    U16(&'a ScalarField<u16>),
    /// u32 value
    U32(&'a ScalarField<u32>),
    /// i8 value
    I8(&'a ScalarField<i8>),
    /// i16 value
    I16(&'a ScalarField<i16>),
    /// i32 value
    I32(&'a ScalarField<i32>),
    /// String value
    Str(&'a dyn StringAccess),
    /// Array of u8
    ArrayU8(&'a [ScalarField<u8>]),
    /// Array of u16
    ArrayU16(&'a [ScalarField<u16>]),
    /// Array of u32
    ArrayU32(&'a [ScalarField<u32>]),
}

impl core::fmt::Debug for SlotRef<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.array_len() {
            Some(len) => write!(f, "{:?}[{}]", self.object_type(), len),
            None => write!(f, "{:?}", self.object_type()),
        }
    }
}

impl<'a> SlotRef<'a> {
    /// The type of the referenced storage
    pub fn object_type(&self) -> ObjectType {
        match self {
            SlotRef::U8(_) => ObjectType::Unsigned8,
            SlotRef::U16(_) => ObjectType::Unsigned16,
            SlotRef::U32(_) => ObjectType::Unsigned32,
            SlotRef::I8(_) => ObjectType::Signed8,
            SlotRef::I16(_) => ObjectType::Signed16,
            SlotRef::I32(_) => ObjectType::Signed32,
            SlotRef::Str(_) => ObjectType::String,
            SlotRef::ArrayU8(_) => ObjectType::Array8,
            SlotRef::ArrayU16(_) => ObjectType::Array16,
            SlotRef::ArrayU32(_) => ObjectType::Array32,
        }
    }

    /// The number of elements, for arrays
    pub fn array_len(&self) -> Option<usize> {
        match self {
            SlotRef::ArrayU8(a) => Some(a.len()),
            SlotRef::ArrayU16(a) => Some(a.len()),
            SlotRef::ArrayU32(a) => Some(a.len()),
            _ => None,
        }
    }

    fn scalar(&self) -> Option<&'a dyn ScalarAccess> {
        match *self {
            SlotRef::U8(f) => Some(f),
            SlotRef::U16(f) => Some(f),
            SlotRef::U32(f) => Some(f),
            SlotRef::I8(f) => Some(f),
            SlotRef::I16(f) => Some(f),
            SlotRef::I32(f) => Some(f),
            _ => None,
        }
    }

    fn element(&self, i: usize) -> Option<&'a dyn ScalarAccess> {
        match *self {
            SlotRef::ArrayU8(a) => a.get(i).map(|f| f as &dyn ScalarAccess),
            SlotRef::ArrayU16(a) => a.get(i).map(|f| f as &dyn ScalarAccess),
            SlotRef::ArrayU32(a) => a.get(i).map(|f| f as &dyn ScalarAccess),
            _ => None,
        }
    }
}

/// What sub index 0 of an array reports
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArrayLength {
    /// The number of elements
    Capacity,
    /// The number of leading non-zero elements
    ///
    /// Used by the PDO mapping arrays, where sub 0 is the number of active mappings.
    NonZeroCount,
}

/// One object in the dictionary
#[derive(Clone, Copy, Debug)]
pub struct ObjectEntry<'a> {
    /// The object index
    pub index: u16,
    /// Allowed accesses. For arrays this applies to every element; sub 0 is always read-only.
    pub access: AccessType,
    /// The storage
    pub slot: SlotRef<'a>,
    /// Whether the value is saved by the store parameters command
    pub persist: bool,
    /// What sub 0 of an array reports
    pub length: ArrayLength,
}

impl<'a> ObjectEntry<'a> {
    /// Create an entry which is not persisted
    pub const fn new(index: u16, access: AccessType, slot: SlotRef<'a>) -> Self {
        Self {
            index,
            access,
            slot,
            persist: false,
            length: ArrayLength::Capacity,
        }
    }

    /// Set whether the entry is persisted
    pub const fn persist(mut self, value: bool) -> Self {
        self.persist = value;
        self
    }

    /// Make sub 0 report the number of leading non-zero elements
    pub const fn count_non_zero(mut self) -> Self {
        self.length = ArrayLength::NonZeroCount;
        self
    }

    /// The type of the object
    pub fn object_type(&self) -> ObjectType {
        self.slot.object_type()
    }

    /// The value of sub 0 for arrays
    pub fn sub0(&self) -> Option<u8> {
        let len = self.slot.array_len()?;
        let value = match self.length {
            ArrayLength::Capacity => len,
            ArrayLength::NonZeroCount => (0..len)
                .take_while(|&i| {
                    let mut buf = [0u8; 4];
                    self.slot
                        .element(i)
                        .map(|e| e.read_bytes(&mut buf))
                        .is_some_and(|_| buf != [0; 4])
                })
                .count(),
        };
        Some(value.min(u8::MAX as usize) as u8)
    }

    /// The number of addressable subs, including sub 0 for arrays
    pub fn sub_count(&self) -> usize {
        match self.slot.array_len() {
            Some(len) => len + 1,
            None => 1,
        }
    }

    /// Resolve a sub index of this entry
    ///
    /// Arrays resolve sub 0 to their length and `1..=len` to the elements. Other objects ignore
    /// `sub`.
    ///
    /// # Errors
    ///
    /// - [`AbortCode::NoSuchSubIndex`] for array subs past the end
    pub fn resolve(&self, sub: u8) -> Result<ResolvedEntry<'a>, AbortCode> {
        let object_type = self.object_type();
        let (access, target) = if object_type.is_array() {
            if sub == 0 {
                let len = self.sub0().unwrap_or(0);
                (AccessType::Const, Target::Length(len))
            } else {
                let element = self
                    .slot
                    .element(sub as usize - 1)
                    .ok_or(AbortCode::NoSuchSubIndex)?;
                (self.access, Target::Scalar(element))
            }
        } else if let SlotRef::Str(s) = self.slot {
            (self.access, Target::Str(s))
        } else {
            // Every non-array, non-string slot is a scalar
            let scalar = self.slot.scalar().ok_or(AbortCode::GeneralError)?;
            (self.access, Target::Scalar(scalar))
        };
        Ok(ResolvedEntry {
            index: self.index,
            sub,
            access,
            object_type,
            target,
        })
    }
}

#[derive(Clone, Copy)]
enum Target<'a> {
    Scalar(&'a dyn ScalarAccess),
    Str(&'a dyn StringAccess),
    Length(u8),
}

/// A single addressable value: a whole scalar or string, an array element, or an array's sub 0
#[derive(Clone, Copy)]
pub struct ResolvedEntry<'a> {
    /// Object index
    pub index: u16,
    /// Sub index, as requested
    pub sub: u8,
    /// Access rights of this sub
    pub access: AccessType,
    /// The type of the owning object
    pub object_type: ObjectType,
    target: Target<'a>,
}

impl core::fmt::Debug for ResolvedEntry<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResolvedEntry")
            .field("index", &self.index)
            .field("sub", &self.sub)
            .field("access", &self.access)
            .field("object_type", &self.object_type)
            .finish()
    }
}

impl ResolvedEntry<'_> {
    /// Number of bytes a read currently returns
    ///
    /// For strings this is the current length, not the capacity.
    pub fn width(&self) -> usize {
        match self.target {
            Target::Scalar(s) => s.width(),
            Target::Str(s) => s.len(),
            Target::Length(_) => 1,
        }
    }

    /// The maximum number of bytes a write may carry
    pub fn capacity(&self) -> usize {
        match self.target {
            Target::Str(s) => s.capacity(),
            _ => self.width(),
        }
    }

    /// Returns true if this is a string object
    pub fn is_string(&self) -> bool {
        matches!(self.target, Target::Str(_))
    }

    /// Returns true if this is the length sub of an array
    pub fn is_length(&self) -> bool {
        matches!(self.target, Target::Length(_))
    }

    /// Returns true if the value can be carried in a PDO
    pub fn is_pdo_mappable(&self) -> bool {
        matches!(self.target, Target::Scalar(_))
    }

    /// Read the value into `buf`, returning the number of bytes read
    ///
    /// # Errors
    ///
    /// - [`AbortCode::WriteOnly`] if the sub is not readable
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, AbortCode> {
        self.read_at(0, buf)
    }

    /// Read the value starting at byte `offset`
    ///
    /// Offsets are only meaningful for strings; scalar values ignore them.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        if !self.access.is_readable() {
            return Err(AbortCode::WriteOnly);
        }
        Ok(match self.target {
            Target::Scalar(s) => s.read_bytes(buf),
            Target::Str(s) => s.read(offset, buf),
            Target::Length(len) => match buf.first_mut() {
                Some(b) => {
                    *b = len;
                    1
                }
                None => 0,
            },
        })
    }

    /// Write a new value
    ///
    /// # Errors
    ///
    /// - [`AbortCode::UnsupportedAccess`] for an array's sub 0, a scalar write of the wrong width or
    ///   a string longer than its capacity
    /// - [`AbortCode::ReadOnly`] if the sub is not writable
    pub fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
        if self.is_length() {
            return Err(AbortCode::UnsupportedAccess);
        }
        if !self.access.is_writable() {
            return Err(AbortCode::ReadOnly);
        }
        match self.target {
            Target::Scalar(s) => s.write_bytes(data),
            Target::Str(s) => s.write(data),
            Target::Length(_) => Err(AbortCode::UnsupportedAccess),
        }
    }
}
