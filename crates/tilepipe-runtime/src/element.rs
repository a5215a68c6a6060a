use crate::arch::BYTE_PER_C0;
use bytemuck::{Pod, Zeroable};
use core::fmt::Debug;
use half::{bf16, f16};

/// Storage type of a tensor element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DType {
    F16,
    BF16,
    F32,
    I8,
    I32,
    U8,
    /// Two signed 4-bit values packed in one byte.
    Int4,
}

impl DType {
    pub const fn size_bits(self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 16,
            DType::F32 | DType::I32 => 32,
            DType::I8 | DType::U8 => 8,
            DType::Int4 => 4,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32)
    }
}

impl core::fmt::Display for DType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::I8 => "i8",
            DType::I32 => "i32",
            DType::U8 => "u8",
            DType::Int4 => "int4",
        };
        f.write_str(name)
    }
}

/// A scalar that can live in global memory and in any on-chip tier.
pub trait Element: Pod + Default + PartialEq + Debug + Send + Sync + 'static {
    const DTYPE: DType;
    /// Elements held by one 32 byte C0 unit. Fractal granularity follows bytes, not elements.
    const PER_C0: usize = BYTE_PER_C0 / core::mem::size_of::<Self>();

    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;

    fn cast<To: Element>(self) -> To {
        To::from_f64(self.to_f64())
    }
}

impl Element for f16 {
    const DTYPE: DType = DType::F16;

    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }

    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }
}

impl Element for bf16 {
    const DTYPE: DType = DType::BF16;

    fn to_f64(self) -> f64 {
        bf16::to_f64(self)
    }

    fn from_f64(value: f64) -> Self {
        bf16::from_f64(value)
    }
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

macro_rules! impl_int_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(value: f64) -> Self {
                value.round_ties_even() as $ty
            }
        }
    };
}

impl_int_element!(i8, DType::I8);
impl_int_element!(i32, DType::I32);
impl_int_element!(u8, DType::U8);

/// Two signed 4-bit integers packed in a byte: the low nibble holds the even element and the high
/// nibble the odd one.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct Int4x2(pub u8);

impl Int4x2 {
    pub const MIN: i8 = -8;
    pub const MAX: i8 = 7;

    /// Packs two values, truncating each to its low 4 bits.
    pub fn pack(even: i8, odd: i8) -> Self {
        Self(((odd as u8 & 0x0f) << 4) | (even as u8 & 0x0f))
    }

    pub fn even(self) -> i8 {
        ((self.0 << 4) as i8) >> 4
    }

    pub fn odd(self) -> i8 {
        (self.0 as i8) >> 4
    }

    /// Packs a slice of values two by two. An odd trailing value is paired with zero.
    pub fn pack_slice(values: &[i8]) -> Vec<Int4x2> {
        values
            .chunks(2)
            .map(|pair| Int4x2::pack(pair[0], pair.get(1).copied().unwrap_or(0)))
            .collect()
    }

    pub fn unpack_slice(packed: &[Int4x2], len: usize) -> Vec<i8> {
        packed
            .iter()
            .flat_map(|p| [p.even(), p.odd()])
            .take(len)
            .collect()
    }
}

/// Element type the matrix engine accumulates into.
pub trait Accumulator: Element {
    fn widen<E: Element>(value: E) -> Self;
    /// Returns `self + lhs * rhs`.
    fn mac(self, lhs: Self, rhs: Self) -> Self;
    fn accumulate(self, other: Self) -> Self;
}

impl Accumulator for f32 {
    fn widen<E: Element>(value: E) -> Self {
        value.to_f64() as f32
    }

    fn mac(self, lhs: Self, rhs: Self) -> Self {
        lhs * rhs + self
    }

    fn accumulate(self, other: Self) -> Self {
        self + other
    }
}

impl Accumulator for i32 {
    fn widen<E: Element>(value: E) -> Self {
        value.to_f64() as i32
    }

    fn mac(self, lhs: Self, rhs: Self) -> Self {
        self.wrapping_add(lhs.wrapping_mul(rhs))
    }

    fn accumulate(self, other: Self) -> Self {
        self.wrapping_add(other)
    }
}

/// Maps a pair of operand types to the accumulator the matrix engine uses for them.
pub trait AccumulatorSelector<Rhs: Element = Self>: Element {
    type Accumulator: Accumulator;
}

impl AccumulatorSelector for f16 {
    type Accumulator = f32;
}

impl AccumulatorSelector for bf16 {
    type Accumulator = f32;
}

impl AccumulatorSelector for f32 {
    type Accumulator = f32;
}

impl AccumulatorSelector for i8 {
    type Accumulator = i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn fractal_width_is_byte_driven() {
        assert_eq!(<i8 as Element>::PER_C0, 32);
        assert_eq!(<f16 as Element>::PER_C0, 16);
        assert_eq!(<f32 as Element>::PER_C0, 8);
    }

    #[test_log::test]
    fn int4_nibble_order() {
        let packed = Int4x2::pack(-3, 5);

        assert_eq!(packed.0, 0x5d);
        assert_eq!(packed.even(), -3);
        assert_eq!(packed.odd(), 5);
    }

    #[test_log::test]
    fn int4_slice_roundtrip_with_odd_length() {
        let values = [-8, 7, 0, -1, 3];
        let packed = Int4x2::pack_slice(&values);

        assert_eq!(packed.len(), 3);
        assert_eq!(Int4x2::unpack_slice(&packed, values.len()), values.to_vec());
    }

    #[test_log::test]
    fn integer_accumulation_wraps() {
        let acc = i32::MAX.mac(1, 1);
        assert_eq!(acc, i32::MIN);
    }

    #[test_log::test]
    fn float_to_int_cast_rounds_half_even() {
        assert_eq!(2.5f32.cast::<i8>(), 2);
        assert_eq!(3.5f32.cast::<i8>(), 4);
        assert_eq!(300.0f32.cast::<i8>(), i8::MAX);
    }
}
