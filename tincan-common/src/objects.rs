//! Object Definitions
//!

/// A container for the address of a subobject
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ObjectId {
    /// Object index
    pub index: u16,
    /// Sub index
    pub sub: u8,
}

/// Access type enum
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AccessType {
    /// Read-only
    #[default]
    Ro,
    /// Write-only
    Wo,
    /// Read-write
    Rw,
    /// Read-only, and also will never be changed, even internally by the device
    Const,
}

impl AccessType {
    /// Returns true if an object with this access type can be read
    pub fn is_readable(&self) -> bool {
        matches!(self, AccessType::Ro | AccessType::Rw | AccessType::Const)
    }

    /// Returns true if an object with this access type can be written
    pub fn is_writable(&self) -> bool {
        matches!(self, AccessType::Rw | AccessType::Wo)
    }
}

/// The type of value stored in an object dictionary entry
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ObjectType {
    /// u8
    Unsigned8,
    /// u16
    Unsigned16,
    /// u32
    Unsigned32,
    /// i8
    Signed8,
    /// i16
    Signed16,
    /// i32
    Signed32,
    /// A byte string with a fixed capacity
    String,
    /// An array of u8 elements
    Array8,
    /// An array of u16 elements
    Array16,
    /// An array of u32 elements
    Array32,
}

impl ObjectType {
    /// The size in bytes of one value (or one element, for arrays)
    ///
    /// Strings have no fixed width and return `None`.
    pub const fn width(&self) -> Option<usize> {
        match self {
            ObjectType::Unsigned8 | ObjectType::Signed8 | ObjectType::Array8 => Some(1),
            ObjectType::Unsigned16 | ObjectType::Signed16 | ObjectType::Array16 => Some(2),
            ObjectType::Unsigned32 | ObjectType::Signed32 | ObjectType::Array32 => Some(4),
            ObjectType::String => None,
        }
    }

    /// Returns true for the array types
    pub const fn is_array(&self) -> bool {
        matches!(
            self,
            ObjectType::Array8 | ObjectType::Array16 | ObjectType::Array32
        )
    }

    /// Returns true for the string type
    pub const fn is_str(&self) -> bool {
        matches!(self, ObjectType::String)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widths() {
        assert_eq!(Some(1), ObjectType::Signed8.width());
        assert_eq!(Some(2), ObjectType::Array16.width());
        assert_eq!(Some(4), ObjectType::Unsigned32.width());
        assert_eq!(None, ObjectType::String.width());
        assert!(ObjectType::Array32.is_array());
        assert!(!AccessType::Const.is_writable());
        assert!(!AccessType::Wo.is_readable());
    }
}
