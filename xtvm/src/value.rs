use serde::Serialize;

/// Size in bytes of one virtual register slot.
pub const SLOT_SIZE: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum ValueType {
    Void = 0,
    I8 = 1,
    I16 = 2,
    I32 = 3,
    I64 = 4,
    F32 = 5,
    F64 = 6,
    Ptr = 7,
    Func = 8,
}

impl ValueType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ValueType::Void),
            1 => Some(ValueType::I8),
            2 => Some(ValueType::I16),
            3 => Some(ValueType::I32),
            4 => Some(ValueType::I64),
            5 => Some(ValueType::F32),
            6 => Some(ValueType::F64),
            7 => Some(ValueType::Ptr),
            8 => Some(ValueType::Func),
            _ => None,
        }
    }

    /// Occupies two native registers (a register pair) when passed natively.
    pub fn is_wide(self) -> bool {
        matches!(self, ValueType::I64 | ValueType::F64)
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Void => "void",
            ValueType::I8 => "i8",
            ValueType::I16 => "i16",
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::Ptr => "ptr",
            ValueType::Func => "func",
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A VM scalar: type tag plus up to eight bytes of payload.
///
/// The tag is informational. Opcodes interpret the payload according to
/// their own operand types, and the truthiness test used by conditional
/// branches only looks at the low 32 bits.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Value {
    pub ty: ValueType,
    pub bits: u64,
}

impl Value {
    pub fn void() -> Self {
        Self {
            ty: ValueType::Void,
            bits: 0,
        }
    }

    pub fn i32(value: i32) -> Self {
        Self {
            ty: ValueType::I32,
            bits: value as u32 as u64,
        }
    }

    pub fn i64(value: i64) -> Self {
        Self {
            ty: ValueType::I64,
            bits: value as u64,
        }
    }

    pub fn f32(value: f32) -> Self {
        Self {
            ty: ValueType::F32,
            bits: value.to_bits() as u64,
        }
    }

    pub fn f64(value: f64) -> Self {
        Self {
            ty: ValueType::F64,
            bits: value.to_bits(),
        }
    }

    pub fn ptr(address: u32) -> Self {
        Self {
            ty: ValueType::Ptr,
            bits: address as u64,
        }
    }

    pub fn func(index: u32) -> Self {
        Self {
            ty: ValueType::Func,
            bits: index as u64,
        }
    }

    /// Rebuilds a value from a raw register slot. Narrow types only own the
    /// low word of the slot, so the stale high word is dropped.
    pub fn from_slot(ty: ValueType, bits: u64) -> Self {
        let bits = match ty {
            ValueType::Void => 0,
            ValueType::I8 => bits & 0xFF,
            ValueType::I16 => bits & 0xFFFF,
            ValueType::I64 | ValueType::F64 => bits,
            _ => bits & 0xFFFF_FFFF,
        };
        Self { ty, bits }
    }

    pub fn lo(&self) -> u32 {
        self.bits as u32
    }

    pub fn hi(&self) -> u32 {
        (self.bits >> 32) as u32
    }

    pub fn as_i32(&self) -> i32 {
        self.bits as u32 as i32
    }

    pub fn as_u32(&self) -> u32 {
        self.bits as u32
    }

    pub fn as_i64(&self) -> i64 {
        self.bits as i64
    }

    pub fn as_f32(&self) -> f32 {
        f32::from_bits(self.bits as u32)
    }

    pub fn as_f64(&self) -> f64 {
        f64::from_bits(self.bits)
    }

    pub fn is_truthy(&self) -> bool {
        self.bits as u32 != 0
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ty {
            ValueType::Void => write!(f, "void"),
            ValueType::I8 => write!(f, "{}i8", self.bits as u8 as i8),
            ValueType::I16 => write!(f, "{}i16", self.bits as u16 as i16),
            ValueType::I32 => write!(f, "{}i32", self.as_i32()),
            ValueType::I64 => write!(f, "{}i64", self.as_i64()),
            ValueType::F32 => write!(f, "{}f32", self.as_f32()),
            ValueType::F64 => write!(f, "{}f64", self.as_f64()),
            ValueType::Ptr => write!(f, "ptr:{:#010x}", self.as_u32()),
            ValueType::Func => write!(f, "func#{}", self.as_u32()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_slots_drop_the_stale_high_word() {
        let value = Value::from_slot(ValueType::I32, 0xDEAD_BEEF_0000_0007);
        assert_eq!(value, Value::i32(7));
        let wide = Value::from_slot(ValueType::I64, 0xDEAD_BEEF_0000_0007);
        assert_eq!(wide.hi(), 0xDEAD_BEEF);
    }

    #[test]
    fn truthiness_ignores_the_high_word() {
        assert!(!Value::i64(1 << 32).is_truthy());
        assert!(Value::i64(1).is_truthy());
        assert!(Value::ptr(0x3FFB_0000).is_truthy());
    }

    #[test]
    fn tags_round_trip_through_from_tag() {
        for tag in 0..=8u8 {
            let ty = ValueType::from_tag(tag).expect("known tag");
            assert_eq!(ty.tag(), tag);
        }
        assert_eq!(ValueType::from_tag(9), None);
    }
}
