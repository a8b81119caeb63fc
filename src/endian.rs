use std::fmt;

use bytemuck::{Pod, Zeroable};

/// Big-endian integer fields for wire structs.
///
/// Stored as raw bytes so the containing `#[repr(C)]` structs have
/// alignment 1 and no padding, which keeps them `Pod`-safe to cast
/// directly from receive buffers.
macro_rules! be_int {
    ($name:ident, $prim:ty, $len:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
        #[repr(transparent)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const ZERO: Self = Self([0; $len]);

            #[inline]
            pub fn new(value: $prim) -> Self {
                Self(value.to_be_bytes())
            }

            #[inline]
            pub fn get(self) -> $prim {
                <$prim>::from_be_bytes(self.0)
            }
        }

        impl From<$prim> for $name {
            fn from(value: $prim) -> Self {
                Self::new(value)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.get())
            }
        }
    };
}

be_int!(BeU16, u16, 2);
be_int!(BeU32, u32, 4);
be_int!(BeU64, u64, 8);

impl BeU32 {
    /// Wire status fields carry negative errno values as two's complement.
    #[inline]
    pub fn new_signed(value: i32) -> Self {
        Self::new(value as u32)
    }

    #[inline]
    pub fn get_signed(self) -> i32 {
        self.get() as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        assert_eq!(BeU16::new(0x0111).get(), 0x0111);
        assert_eq!(BeU32::new(0xdead_beef).get(), 0xdead_beef);
        assert_eq!(BeU64::new(u64::MAX).get(), u64::MAX);
    }

    #[test]
    fn network_byte_order() {
        assert_eq!(bytemuck::bytes_of(&BeU16::new(0x0111)), &[0x01, 0x11]);
        assert_eq!(
            bytemuck::bytes_of(&BeU32::new(0x8005_0000)),
            &[0x80, 0x05, 0x00, 0x00]
        );
    }

    #[test]
    fn signed_status() {
        let st = BeU32::new_signed(-104);
        assert_eq!(st.get_signed(), -104);
        assert_eq!(bytemuck::bytes_of(&st), &[0xff, 0xff, 0xff, 0x98]);
    }
}
