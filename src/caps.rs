//! Capability negotiation containers
//!
//! A capability travels as a container tagged with a kind discriminant
//! (one value, enumeration, range, array) and an item-type
//! discriminant, followed by kind-specific payload. This module owns
//! the typed [`Container`] model, its byte codec, and the shared block
//! allocator both ends of the boundary use to exchange container
//! memory.
//!
//! Canonical container layout, little-endian:
//!
//! ```text
//! u16 kind | u16 item type | kind-specific payload
//!   one:         item
//!   range:       min, max, step, default, current
//!   enumeration: u32 count, u32 current index, u32 default index, items
//!   array:       u32 count, items
//! ```
//!
//! Items are packed at their natural protocol sizes (bool is two
//! bytes, fixed-point is four, strings are 34).

use crate::errors::{Result, TwainError};
use bytes::{Buf, BufMut};
use serde::Serialize;
use std::fmt;

/// Capability identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
pub struct CapId(pub u16);

impl CapId {
    pub const XFER_COUNT: CapId = CapId(0x0001);
    pub const SUPPORTED_CAPS: CapId = CapId(0x1005);
    pub const FEEDER_ENABLED: CapId = CapId(0x1002);
    pub const UI_CONTROLLABLE: CapId = CapId(0x100E);
    pub const DEVICE_ONLINE: CapId = CapId(0x100F);
    pub const DUPLEX_ENABLED: CapId = CapId(0x1013);
    pub const PIXEL_TYPE: CapId = CapId(0x0101);
    pub const UNITS: CapId = CapId(0x0102);
    pub const XFER_MECH: CapId = CapId(0x0103);
    pub const BRIGHTNESS: CapId = CapId(0x1101);
    pub const CONTRAST: CapId = CapId(0x1103);
    pub const X_RESOLUTION: CapId = CapId(0x1118);
    pub const Y_RESOLUTION: CapId = CapId(0x1119);
    pub const SUPPORTED_SIZES: CapId = CapId(0x1122);
    pub const BIT_DEPTH: CapId = CapId(0x112B);
}

impl fmt::Display for CapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap 0x{:04X}", self.0)
    }
}

/// Container kind discriminant.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ContainerKind {
    Array = 3,
    Enumeration = 4,
    One = 5,
    Range = 6,
}

impl ContainerKind {
    pub fn from_u16(raw: u16) -> Result<Self> {
        match raw {
            3 => Ok(Self::Array),
            4 => Ok(Self::Enumeration),
            5 => Ok(Self::One),
            6 => Ok(Self::Range),
            other => Err(TwainError::marshal(format!(
                "unknown container kind {other}"
            ))),
        }
    }
}

/// Value-type discriminant for container items.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ItemType {
    I8 = 0,
    I16 = 1,
    I32 = 2,
    U8 = 3,
    U16 = 4,
    U32 = 5,
    Bool = 6,
    Fix32 = 7,
    Str32 = 9,
}

impl ItemType {
    pub fn from_u16(raw: u16) -> Result<Self> {
        match raw {
            0 => Ok(Self::I8),
            1 => Ok(Self::I16),
            2 => Ok(Self::I32),
            3 => Ok(Self::U8),
            4 => Ok(Self::U16),
            5 => Ok(Self::U32),
            6 => Ok(Self::Bool),
            7 => Ok(Self::Fix32),
            9 => Ok(Self::Str32),
            other => Err(TwainError::marshal(format!("unknown item type {other}"))),
        }
    }

    /// Packed size of one item of this type.
    pub fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 | Self::Bool => 2,
            Self::I32 | Self::U32 | Self::Fix32 => 4,
            Self::Str32 => 34,
        }
    }

    /// True for types a range container may carry.
    pub fn is_numeric(self) -> bool {
        !matches!(self, Self::Str32)
    }
}

/// Signed 16.16 fixed-point number used for fractional capability
/// values such as resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
pub struct Fix32 {
    pub whole: i16,
    pub frac: u16,
}

impl Fix32 {
    pub fn from_f32(value: f32) -> Self {
        let bits = (value * 65536.0).round() as i32;
        Self {
            whole: (bits >> 16) as i16,
            frac: (bits & 0xFFFF) as u16,
        }
    }

    pub fn to_f32(self) -> f32 {
        ((self.whole as i32) * 65536 + self.frac as i32) as f32 / 65536.0
    }
}

impl From<f32> for Fix32 {
    fn from(value: f32) -> Self {
        Self::from_f32(value)
    }
}

impl From<Fix32> for f32 {
    fn from(value: Fix32) -> Self {
        value.to_f32()
    }
}

/// One decoded container item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CapValue {
    I8(i8),
    I16(i16),
    I32(i32),
    U8(u8),
    U16(u16),
    U32(u32),
    Bool(bool),
    Fix32(Fix32),
    Str(String),
}

impl CapValue {
    pub fn item_type(&self) -> ItemType {
        match self {
            Self::I8(_) => ItemType::I8,
            Self::I16(_) => ItemType::I16,
            Self::I32(_) => ItemType::I32,
            Self::U8(_) => ItemType::U8,
            Self::U16(_) => ItemType::U16,
            Self::U32(_) => ItemType::U32,
            Self::Bool(_) => ItemType::Bool,
            Self::Fix32(_) => ItemType::Fix32,
            Self::Str(_) => ItemType::Str32,
        }
    }

    /// Widens any numeric item to u32; `None` for strings.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::I8(v) => Some(*v as u32),
            Self::I16(v) => Some(*v as u32),
            Self::I32(v) => Some(*v as u32),
            Self::U8(v) => Some(*v as u32),
            Self::U16(v) => Some(*v as u32),
            Self::U32(v) => Some(*v),
            Self::Bool(v) => Some(*v as u32),
            Self::Fix32(v) => Some(((v.whole as i32) as u32) << 16 | v.frac as u32),
            Self::Str(_) => None,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::I8(v) => buf.put_i8(*v),
            Self::I16(v) => buf.put_i16_le(*v),
            Self::I32(v) => buf.put_i32_le(*v),
            Self::U8(v) => buf.put_u8(*v),
            Self::U16(v) => buf.put_u16_le(*v),
            Self::U32(v) => buf.put_u32_le(*v),
            Self::Bool(v) => buf.put_u16_le(*v as u16),
            Self::Fix32(v) => {
                buf.put_i16_le(v.whole);
                buf.put_u16_le(v.frac);
            }
            Self::Str(v) => {
                let mut bytes = [0u8; 34];
                for (dst, src) in bytes.iter_mut().zip(v.bytes().take(32)) {
                    *dst = src;
                }
                buf.put_slice(&bytes);
            }
        }
    }

    fn decode(item_type: ItemType, buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < item_type.size() {
            return Err(TwainError::marshal(format!(
                "container truncated reading {item_type:?} item"
            )));
        }
        Ok(match item_type {
            ItemType::I8 => Self::I8(buf.get_i8()),
            ItemType::I16 => Self::I16(buf.get_i16_le()),
            ItemType::I32 => Self::I32(buf.get_i32_le()),
            ItemType::U8 => Self::U8(buf.get_u8()),
            ItemType::U16 => Self::U16(buf.get_u16_le()),
            ItemType::U32 => Self::U32(buf.get_u32_le()),
            ItemType::Bool => Self::Bool(buf.get_u16_le() != 0),
            ItemType::Fix32 => Self::Fix32(Fix32 {
                whole: buf.get_i16_le(),
                frac: buf.get_u16_le(),
            }),
            ItemType::Str32 => {
                let mut bytes = [0u8; 34];
                buf.copy_to_slice(&mut bytes);
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(32);
                Self::Str(String::from_utf8_lossy(&bytes[..end]).into_owned())
            }
        })
    }
}

/// A decoded capability container.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Container {
    /// A single value.
    One { value: CapValue },
    /// A closed list of values with current and default indices.
    Enumeration {
        item_type: ItemType,
        current_index: u32,
        default_index: u32,
        items: Vec<CapValue>,
    },
    /// A numeric range with step.
    Range {
        item_type: ItemType,
        min: CapValue,
        max: CapValue,
        step: CapValue,
        default: CapValue,
        current: CapValue,
    },
    /// A flat list with no current/default notion.
    Array {
        item_type: ItemType,
        items: Vec<CapValue>,
    },
}

impl Container {
    /// Convenience constructor for the most common shape.
    pub fn one(value: CapValue) -> Self {
        Self::One { value }
    }

    pub fn kind(&self) -> ContainerKind {
        match self {
            Self::One { .. } => ContainerKind::One,
            Self::Enumeration { .. } => ContainerKind::Enumeration,
            Self::Range { .. } => ContainerKind::Range,
            Self::Array { .. } => ContainerKind::Array,
        }
    }

    pub fn item_type(&self) -> ItemType {
        match self {
            Self::One { value } => value.item_type(),
            Self::Enumeration { item_type, .. } => *item_type,
            Self::Range { item_type, .. } => *item_type,
            Self::Array { item_type, .. } => *item_type,
        }
    }

    /// The container's current value, where the kind has one.
    pub fn current_value(&self) -> Option<&CapValue> {
        match self {
            Self::One { value } => Some(value),
            Self::Enumeration {
                current_index,
                items,
                ..
            } => items.get(*current_index as usize),
            Self::Range { current, .. } => Some(current),
            Self::Array { .. } => None,
        }
    }

    /// The container's default value, where the kind has one.
    pub fn default_value(&self) -> Option<&CapValue> {
        match self {
            Self::One { value } => Some(value),
            Self::Enumeration {
                default_index,
                items,
                ..
            } => items.get(*default_index as usize),
            Self::Range { default, .. } => Some(default),
            Self::Array { .. } => None,
        }
    }

    /// Encodes the container into its canonical byte layout.
    ///
    /// Fails with a marshal error when items disagree with the
    /// declared item type or a range carries a non-numeric type.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(16);
        buf.put_u16_le(self.kind() as u16);
        buf.put_u16_le(self.item_type() as u16);

        match self {
            Self::One { value } => value.encode(&mut buf),
            Self::Range {
                item_type,
                min,
                max,
                step,
                default,
                current,
            } => {
                if !item_type.is_numeric() {
                    return Err(TwainError::marshal(
                        "range containers require a numeric item type",
                    ));
                }
                for value in [min, max, step, default, current] {
                    check_item(*item_type, value)?;
                    value.encode(&mut buf);
                }
            }
            Self::Enumeration {
                item_type,
                current_index,
                default_index,
                items,
            } => {
                buf.put_u32_le(items.len() as u32);
                buf.put_u32_le(*current_index);
                buf.put_u32_le(*default_index);
                for value in items {
                    check_item(*item_type, value)?;
                    value.encode(&mut buf);
                }
            }
            Self::Array { item_type, items } => {
                buf.put_u32_le(items.len() as u32);
                for value in items {
                    check_item(*item_type, value)?;
                    value.encode(&mut buf);
                }
            }
        }
        Ok(buf)
    }

    /// Decodes a container from its canonical byte layout, dispatching
    /// on the kind discriminant.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;
        if buf.remaining() < 4 {
            return Err(TwainError::marshal("container shorter than its header"));
        }
        let kind = ContainerKind::from_u16(buf.get_u16_le())?;
        let item_type = ItemType::from_u16(buf.get_u16_le())?;

        match kind {
            ContainerKind::One => Ok(Self::One {
                value: CapValue::decode(item_type, &mut buf)?,
            }),
            ContainerKind::Range => {
                if !item_type.is_numeric() {
                    return Err(TwainError::marshal(
                        "range containers require a numeric item type",
                    ));
                }
                Ok(Self::Range {
                    item_type,
                    min: CapValue::decode(item_type, &mut buf)?,
                    max: CapValue::decode(item_type, &mut buf)?,
                    step: CapValue::decode(item_type, &mut buf)?,
                    default: CapValue::decode(item_type, &mut buf)?,
                    current: CapValue::decode(item_type, &mut buf)?,
                })
            }
            ContainerKind::Enumeration => {
                if buf.remaining() < 12 {
                    return Err(TwainError::marshal("enumeration header truncated"));
                }
                let count = buf.get_u32_le() as usize;
                let current_index = buf.get_u32_le();
                let default_index = buf.get_u32_le();
                let items = decode_items(item_type, count, &mut buf)?;
                Ok(Self::Enumeration {
                    item_type,
                    current_index,
                    default_index,
                    items,
                })
            }
            ContainerKind::Array => {
                if buf.remaining() < 4 {
                    return Err(TwainError::marshal("array header truncated"));
                }
                let count = buf.get_u32_le() as usize;
                let items = decode_items(item_type, count, &mut buf)?;
                Ok(Self::Array { item_type, items })
            }
        }
    }
}

fn check_item(item_type: ItemType, value: &CapValue) -> Result<()> {
    if value.item_type() != item_type {
        return Err(TwainError::marshal(format!(
            "item {:?} does not match declared item type {item_type:?}",
            value.item_type()
        )));
    }
    Ok(())
}

fn decode_items(item_type: ItemType, count: usize, buf: &mut &[u8]) -> Result<Vec<CapValue>> {
    if buf.remaining() < count.saturating_mul(item_type.size()) {
        return Err(TwainError::marshal(format!(
            "container declares {count} items but payload is short"
        )));
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(CapValue::decode(item_type, buf)?);
    }
    Ok(items)
}

/// Bit set answering which operations a source supports for a
/// capability, produced by the side-effect-free support query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CapSupport(pub u16);

impl CapSupport {
    pub const GET: CapSupport = CapSupport(0x0001);
    pub const SET: CapSupport = CapSupport(0x0002);
    pub const GET_DEFAULT: CapSupport = CapSupport(0x0004);
    pub const GET_CURRENT: CapSupport = CapSupport(0x0008);
    pub const RESET: CapSupport = CapSupport(0x0010);
    pub const SET_CONSTRAINT: CapSupport = CapSupport(0x0020);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: CapSupport) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn supports_get(self) -> bool {
        self.contains(Self::GET)
    }

    pub fn supports_set(self) -> bool {
        self.contains(Self::SET)
    }

    pub fn supports_reset(self) -> bool {
        self.contains(Self::RESET)
    }
}

/// Capability triplet payload crossing the native boundary.
///
/// `container` is a block handle from [`alloc_container_block`]; zero
/// means no container. `con_type` is the kind discriminant, or
/// [`TwCapability::DONT_CARE`] on requests where the source chooses.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TwCapability {
    pub cap: u16,
    pub con_type: u16,
    pub container: usize,
}

impl TwCapability {
    pub const DONT_CARE: u16 = 0xFFFF;

    /// Request payload for get/reset/query operations: the source
    /// allocates and fills the container.
    pub fn request(cap: CapId) -> Self {
        Self {
            cap: cap.0,
            con_type: Self::DONT_CARE,
            container: 0,
        }
    }

    /// Set payload carrying an encoded container owned by the caller.
    pub fn with_container(cap: CapId, container: &Container) -> Result<Self> {
        let bytes = container.encode()?;
        Ok(Self {
            cap: cap.0,
            con_type: container.kind() as u16,
            container: alloc_container_block(bytes),
        })
    }
}

// Container memory exchanged across the boundary is a heap block
// behind a thin pointer. Whichever side allocates, the application
// side frees via `take_container_block`; `read_container_block` is
// the non-consuming peek the manager side uses on SET payloads.
struct ContainerBlock {
    data: Vec<u8>,
}

/// Allocates a container block and returns its handle.
pub fn alloc_container_block(bytes: Vec<u8>) -> usize {
    Box::into_raw(Box::new(ContainerBlock { data: bytes })) as usize
}

/// Copies a container block's payload without freeing it.
///
/// # Safety
/// `handle` must come from [`alloc_container_block`] and must not have
/// been passed to [`take_container_block`] yet.
pub unsafe fn read_container_block(handle: usize) -> Vec<u8> {
    (*(handle as *const ContainerBlock)).data.clone()
}

/// Takes ownership of a container block, returning its payload and
/// freeing the block.
///
/// # Safety
/// `handle` must come from [`alloc_container_block`] and is invalid
/// after this call.
pub unsafe fn take_container_block(handle: usize) -> Vec<u8> {
    Box::from_raw(handle as *mut ContainerBlock).data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix32_round_trips_fractions() {
        for v in [0.0_f32, 1.5, 300.25, -0.5, -12.75] {
            let fixed = Fix32::from_f32(v);
            assert!((fixed.to_f32() - v).abs() < 1.0 / 65536.0, "value {v}");
        }
    }

    #[test]
    fn one_value_codec_round_trip() {
        let container = Container::one(CapValue::U16(42));
        let decoded = Container::decode(&container.encode().unwrap()).unwrap();
        assert_eq!(decoded, container);
    }

    #[test]
    fn enumeration_codec_round_trip() {
        let container = Container::Enumeration {
            item_type: ItemType::U16,
            current_index: 1,
            default_index: 0,
            items: vec![CapValue::U16(0), CapValue::U16(1), CapValue::U16(2)],
        };
        let decoded = Container::decode(&container.encode().unwrap()).unwrap();
        assert_eq!(decoded, container);
        assert_eq!(decoded.current_value(), Some(&CapValue::U16(1)));
    }

    #[test]
    fn range_codec_round_trip() {
        let container = Container::Range {
            item_type: ItemType::Fix32,
            min: CapValue::Fix32(Fix32::from_f32(75.0)),
            max: CapValue::Fix32(Fix32::from_f32(600.0)),
            step: CapValue::Fix32(Fix32::from_f32(75.0)),
            default: CapValue::Fix32(Fix32::from_f32(300.0)),
            current: CapValue::Fix32(Fix32::from_f32(150.0)),
        };
        let decoded = Container::decode(&container.encode().unwrap()).unwrap();
        assert_eq!(decoded, container);
    }

    #[test]
    fn string_items_survive_the_codec() {
        let container = Container::Array {
            item_type: ItemType::Str32,
            items: vec![CapValue::Str("letter".into()), CapValue::Str("a4".into())],
        };
        let decoded = Container::decode(&container.encode().unwrap()).unwrap();
        assert_eq!(decoded, container);
    }

    #[test]
    fn mismatched_item_is_a_marshal_error() {
        let container = Container::Array {
            item_type: ItemType::U16,
            items: vec![CapValue::U16(1), CapValue::Bool(true)],
        };
        assert!(matches!(
            container.encode(),
            Err(TwainError::Marshal(_))
        ));
    }

    #[test]
    fn truncated_payload_is_a_marshal_error() {
        let bytes = Container::one(CapValue::U32(9)).encode().unwrap();
        assert!(matches!(
            Container::decode(&bytes[..bytes.len() - 2]),
            Err(TwainError::Marshal(_))
        ));
    }

    #[test]
    fn range_rejects_string_item_type() {
        let mut bytes = Vec::new();
        bytes.put_u16_le(ContainerKind::Range as u16);
        bytes.put_u16_le(ItemType::Str32 as u16);
        assert!(matches!(
            Container::decode(&bytes),
            Err(TwainError::Marshal(_))
        ));
    }

    #[test]
    fn block_read_then_take() {
        let handle = alloc_container_block(vec![1, 2, 3]);
        unsafe {
            assert_eq!(read_container_block(handle), vec![1, 2, 3]);
            assert_eq!(take_container_block(handle), vec![1, 2, 3]);
        }
    }
}
