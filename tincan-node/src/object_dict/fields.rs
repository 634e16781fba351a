//! Storage types backing object dictionary entries

use tincan_common::{sdo::AbortCode, AtomicCell};

/// Byte level access to a fixed width value
///
/// Implemented by [`ScalarField`] for every supported integer type. Array elements are scalar
/// fields too, so the same access path serves both.
pub trait ScalarAccess: Sync + Send {
    /// The width of the value in bytes
    fn width(&self) -> usize;

    /// Copy the little endian value into `buf`, returning the number of bytes copied
    ///
    /// A short `buf` receives the low bytes.
    fn read_bytes(&self, buf: &mut [u8]) -> usize;

    /// Store a value from little endian bytes
    ///
    /// # Errors
    ///
    /// - [`AbortCode::UnsupportedAccess`] if `data.len()` differs from the width
    fn write_bytes(&self, data: &[u8]) -> Result<(), AbortCode>;
}

/// A single value of type T, which is a standard rust integer type
#[derive(Debug)]
pub struct ScalarField<T: Copy> {
    value: AtomicCell<T>,
}

impl<T: Send + Copy> ScalarField<T> {
    /// Atomically read the value of the field
    pub fn load(&self) -> T {
        self.value.load()
    }

    /// Atomically store a new value into the field
    pub fn store(&self, value: T) {
        self.value.store(value);
    }
}

impl<T: Send + Copy + Default> Default for ScalarField<T> {
    fn default() -> Self {
        Self {
            value: AtomicCell::default(),
        }
    }
}

macro_rules! impl_scalar_field {
    ($rust_type: ty) => {
        impl ScalarField<$rust_type> {
            /// Create a new ScalarField with the given value
            pub const fn new(value: $rust_type) -> Self {
                Self {
                    value: AtomicCell::new(value),
                }
            }
        }

        impl ScalarAccess for ScalarField<$rust_type> {
            fn width(&self) -> usize {
                core::mem::size_of::<$rust_type>()
            }

            fn read_bytes(&self, buf: &mut [u8]) -> usize {
                let bytes = self.value.load().to_le_bytes();
                let read_len = buf.len().min(bytes.len());
                buf[..read_len].copy_from_slice(&bytes[..read_len]);
                read_len
            }

            fn write_bytes(&self, data: &[u8]) -> Result<(), AbortCode> {
                let bytes = data.try_into().map_err(|_| AbortCode::UnsupportedAccess)?;
                self.value.store(<$rust_type>::from_le_bytes(bytes));
                Ok(())
            }
        }
    };
}

impl_scalar_field!(u8);
impl_scalar_field!(u16);
impl_scalar_field!(u32);
impl_scalar_field!(i8);
impl_scalar_field!(i16);
impl_scalar_field!(i32);

/// Byte level access to a variable length string
pub trait StringAccess: Sync + Send {
    /// The maximum length of the string
    fn capacity(&self) -> usize;

    /// The current length of the string
    fn len(&self) -> usize;

    /// Returns true if the string is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy bytes starting at `offset` into `buf`, returning the number of bytes copied
    fn read(&self, offset: usize, buf: &mut [u8]) -> usize;

    /// Replace the whole string
    ///
    /// # Errors
    ///
    /// - [`AbortCode::UnsupportedAccess`] if `data` is longer than the capacity
    fn write(&self, data: &[u8]) -> Result<(), AbortCode>;
}

/// A byte string of up to N bytes
///
/// The length is stored alongside the bytes, so strings may contain zeros.
#[derive(Debug)]
pub struct StringField<const N: usize> {
    value: AtomicCell<([u8; N], usize)>,
}

impl<const N: usize> StringField<N> {
    /// Create a string field holding `value`, truncated to N bytes
    pub const fn new(value: &[u8]) -> Self {
        let len = if value.len() < N { value.len() } else { N };
        let mut bytes = [0u8; N];
        let mut i = 0;
        while i < len {
            bytes[i] = value[i];
            i += 1;
        }
        Self {
            value: AtomicCell::new((bytes, len)),
        }
    }

    /// Atomically read the string, as the backing array and the valid length
    pub fn load(&self) -> ([u8; N], usize) {
        self.value.load()
    }

    /// Atomically replace the string
    pub fn store(&self, value: &[u8]) -> Result<(), AbortCode> {
        StringAccess::write(self, value)
    }
}

impl<const N: usize> StringAccess for StringField<N> {
    fn capacity(&self) -> usize {
        N
    }

    fn len(&self) -> usize {
        self.value.load().1
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> usize {
        let (bytes, len) = self.value.load();
        if offset >= len {
            return 0;
        }
        let read_len = buf.len().min(len - offset);
        buf[..read_len].copy_from_slice(&bytes[offset..offset + read_len]);
        read_len
    }

    fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
        if data.len() > N {
            return Err(AbortCode::UnsupportedAccess);
        }
        let mut bytes = [0u8; N];
        bytes[..data.len()].copy_from_slice(data);
        self.value.store((bytes, data.len()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_field() {
        let field = ScalarField::<u32>::new(0x1234_5678);
        assert_eq!(4, field.width());

        let mut buf = [0xFF; 6];
        assert_eq!(4, field.read_bytes(&mut buf));
        assert_eq!([0x78, 0x56, 0x34, 0x12, 0xFF, 0xFF], buf);

        let mut short = [0; 2];
        assert_eq!(2, field.read_bytes(&mut short));
        assert_eq!([0x78, 0x56], short);

        field.write_bytes(&7u32.to_le_bytes()).unwrap();
        assert_eq!(7, field.load());
        assert_eq!(Err(AbortCode::UnsupportedAccess), field.write_bytes(&[1, 2]));
        assert_eq!(7, field.load());
    }

    #[test]
    fn test_signed_field() {
        let field = ScalarField::<i16>::new(-2);
        let mut buf = [0; 2];
        field.read_bytes(&mut buf);
        assert_eq!([0xFE, 0xFF], buf);
    }

    #[test]
    fn test_string_field() {
        let field = StringField::<10>::new(b"hello");
        assert_eq!(10, field.capacity());
        assert_eq!(5, field.len());

        let mut buf = [0; 10];
        assert_eq!(3, field.read(2, &mut buf));
        assert_eq!(b"llo", &buf[..3]);
        assert_eq!(0, field.read(5, &mut buf));

        field.write(b"a\0b").unwrap();
        assert_eq!(3, field.len());
        assert_eq!(
            Err(AbortCode::UnsupportedAccess),
            field.write(b"this is too long")
        );
        assert_eq!(3, field.len());

        let truncated = StringField::<2>::new(b"abc");
        assert_eq!(2, truncated.len());
    }
}
