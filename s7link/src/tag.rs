//! Textual tag notation.
//!
//! A tag names an area, an offset, an optional type and an optional element
//! count: `DB1.80000,x,1`, `M10.2,w,4`, `I.0,b,8`. Areas `I`/`E`, `M`,
//! `Q`/`A`, `T`, `C`/`Z` and `DBn` are recognized case-insensitively. The
//! byte offset may ride on the area letter (`M10.2` reads flag byte 10, bit
//! 2) or follow the dot (`DB1.80000`). The `x` type selects bit access; its
//! optional digits and the post-dot bit index both count into
//! `bit = byte * 8 + bit_index`.

use crate::error::{Error, Result};
use crate::frame::{PlcArea, ReadItem, VarType};
use std::fmt;

/// Parser progress; failed tags report the state they were rejected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagParseState {
    Area,
    Offset,
    Type,
    NumberOfItems,
    TypeValidation,
    Success,
}

/// A fully parsed tag address.
///
/// `offset` is a byte offset, except for `VarType::Bit` where it is the bit
/// offset `byte * 8 + bit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagAddress {
    pub area: PlcArea,
    pub offset: u32,
    pub var_type: VarType,
    pub count: u16,
}

impl TagAddress {
    #[inline]
    pub fn to_read_item(self) -> ReadItem {
        ReadItem {
            area: self.area,
            offset: self.offset,
            var_type: self.var_type,
            count: self.count,
        }
    }
}

impl fmt::Display for TagAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let area = match self.area {
            PlcArea::InputByte => "I".to_string(),
            PlcArea::FlagByte => "M".to_string(),
            PlcArea::OutputByte => "Q".to_string(),
            PlcArea::Timer => "T".to_string(),
            PlcArea::Counter => "C".to_string(),
            PlcArea::DataBlock(n) => format!("DB{n}"),
        };
        match self.var_type {
            VarType::Bit => write!(
                f,
                "{}.{},x{},{}",
                area,
                self.offset / 8,
                self.offset % 8,
                self.count
            ),
            other => {
                let ty = match other {
                    VarType::Byte => "b",
                    VarType::Char => "c",
                    VarType::Word => "w",
                    VarType::DWord => "dw",
                    VarType::Int16 => "i",
                    VarType::Int32 => "di",
                    VarType::Float32 => "r",
                    VarType::String => "s",
                    VarType::Bit => unreachable!(),
                };
                write!(f, "{}.{},{},{}", area, self.offset, ty, self.count)
            }
        }
    }
}

#[inline]
fn fail(state: TagParseState, fragment: &str, tag: &str) -> Error {
    Error::TagParse {
        state,
        fragment: fragment.to_string(),
        tag: tag.to_string(),
    }
}

/// Parse one tag. Deterministic walk through
/// `Area → Offset → Type → NumberOfItems → TypeValidation → Success`.
pub fn parse_tag(input: &str) -> Result<TagAddress> {
    let tag = input.trim();
    let mut state = TagParseState::Area;

    // Area: everything before the first dot
    let (area_token, rest) = tag
        .split_once('.')
        .ok_or_else(|| fail(state, tag, tag))?;
    let (area, attached_offset) =
        parse_area(area_token).ok_or_else(|| fail(state, area_token, tag))?;

    state = TagParseState::Offset;
    let mut fields = rest.split(',');
    let offset_token = fields.next().unwrap_or("");
    let offset_value: u32 = offset_token
        .parse()
        .map_err(|_| fail(state, offset_token, tag))?;
    // An offset riding on the area letter turns the post-dot number into the
    // bit index; otherwise the post-dot number is the byte offset.
    let (byte_offset, dot_bit) = match attached_offset {
        Some(byte) => (byte, offset_value),
        None => (offset_value, 0),
    };

    state = TagParseState::Type;
    let (var_type, x_bit) = match fields.next() {
        None => (VarType::Byte, 0),
        Some(token) => parse_type(token).ok_or_else(|| fail(state, token, tag))?,
    };

    state = TagParseState::NumberOfItems;
    let count: u16 = match fields.next() {
        None => 1,
        Some(token) => token.parse().map_err(|_| fail(state, token, tag))?,
    };
    if let Some(extra) = fields.next() {
        return Err(fail(state, extra, tag));
    }

    state = TagParseState::TypeValidation;
    if count == 0 {
        return Err(fail(state, "0", tag));
    }
    let bit_index = dot_bit + x_bit;
    if matches!(var_type, VarType::Bit) && bit_index > 7 {
        return Err(fail(state, offset_token, tag));
    }
    if matches!(area, PlcArea::Timer | PlcArea::Counter) && matches!(var_type, VarType::Bit) {
        return Err(fail(state, area_token, tag));
    }

    let offset = match var_type {
        VarType::Bit => byte_offset * 8 + bit_index,
        _ => byte_offset,
    };

    state = TagParseState::Success;
    debug_assert_eq!(state, TagParseState::Success);
    Ok(TagAddress {
        area,
        offset,
        var_type,
        count,
    })
}

/// Resolve the area token; trailing digits on a letter area are the byte
/// offset (`M10` reads flag byte 10).
fn parse_area(token: &str) -> Option<(PlcArea, Option<u32>)> {
    let upper = token.trim().to_uppercase();
    if let Some(digits) = upper.strip_prefix("DB") {
        let number: u16 = digits.parse().ok()?;
        return Some((PlcArea::DataBlock(number), None));
    }
    let mut chars = upper.chars();
    let area = match chars.next()? {
        'I' | 'E' => PlcArea::InputByte,
        'M' => PlcArea::FlagByte,
        'Q' | 'A' => PlcArea::OutputByte,
        'T' => PlcArea::Timer,
        'C' | 'Z' => PlcArea::Counter,
        _ => return None,
    };
    let tail = chars.as_str();
    if tail.is_empty() {
        Some((area, None))
    } else {
        let offset: u32 = tail.parse().ok()?;
        Some((area, Some(offset)))
    }
}

/// Resolve the type token; `x` with optional digits selects bit access and
/// contributes the digits to the bit index.
fn parse_type(token: &str) -> Option<(VarType, u32)> {
    let lower = token.trim().to_lowercase();
    let ty = match lower.as_str() {
        "b" => VarType::Byte,
        "c" => VarType::Char,
        "w" => VarType::Word,
        "dw" => VarType::DWord,
        "i" => VarType::Int16,
        "di" => VarType::Int32,
        "r" => VarType::Float32,
        "s" => VarType::String,
        _ => {
            let digits = lower.strip_prefix('x')?;
            let bit = if digits.is_empty() {
                0
            } else {
                digits.parse().ok()?
            };
            return Some((VarType::Bit, bit));
        }
    };
    Some((ty, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(input: &str) -> TagAddress {
        match parse_tag(input) {
            Ok(t) => t,
            Err(e) => panic!("parse_tag failed for '{input}': {e}"),
        }
    }

    #[test]
    fn db_bit_tag_scales_offset_to_bits() {
        let t = tag("DB1.80000,x,1");
        assert_eq!(t.area, PlcArea::DataBlock(1));
        assert_eq!(t.offset, 640_000);
        assert_eq!(t.var_type, VarType::Bit);
        assert_eq!(t.count, 1);
    }

    #[test]
    fn attached_offset_keeps_bytes_for_word_reads() {
        let t = tag("M10.2,w,4");
        assert_eq!(t.area, PlcArea::FlagByte);
        assert_eq!(t.offset, 10);
        assert_eq!(t.var_type, VarType::Word);
        assert_eq!(t.count, 4);
    }

    #[test]
    fn attached_offset_bit_index_counts_into_bit_offset() {
        let t = tag("M10.2,x");
        assert_eq!(t.offset, 10 * 8 + 2);
        assert_eq!(t.var_type, VarType::Bit);
        assert_eq!(t.count, 1);
    }

    #[test]
    fn x_suffix_digits_add_to_the_bit_offset() {
        let t = tag("DB5.40,x3");
        assert_eq!(t.area, PlcArea::DataBlock(5));
        assert_eq!(t.offset, 40 * 8 + 3);
    }

    #[test]
    fn defaults_type_byte_count_one() {
        let t = tag("DB2.16");
        assert_eq!(t.var_type, VarType::Byte);
        assert_eq!(t.count, 1);
        assert_eq!(t.offset, 16);
    }

    #[test]
    fn area_aliases() {
        assert_eq!(tag("E.0").area, PlcArea::InputByte);
        assert_eq!(tag("A.0").area, PlcArea::OutputByte);
        assert_eq!(tag("Z.3").area, PlcArea::Counter);
        assert_eq!(tag("T.3").area, PlcArea::Timer);
        assert_eq!(tag("i.1").area, PlcArea::InputByte);
    }

    #[test]
    fn failures_carry_state_and_fragment() {
        match parse_tag("XX.0,b,1") {
            Err(Error::TagParse { state, fragment, .. }) => {
                assert_eq!(state, TagParseState::Area);
                assert_eq!(fragment, "XX");
            }
            other => panic!("unexpected {other:?}"),
        }
        match parse_tag("M.abc") {
            Err(Error::TagParse { state, .. }) => assert_eq!(state, TagParseState::Offset),
            other => panic!("unexpected {other:?}"),
        }
        match parse_tag("M.0,q") {
            Err(Error::TagParse { state, .. }) => assert_eq!(state, TagParseState::Type),
            other => panic!("unexpected {other:?}"),
        }
        match parse_tag("M.0,b,zz") {
            Err(Error::TagParse { state, .. }) => {
                assert_eq!(state, TagParseState::NumberOfItems)
            }
            other => panic!("unexpected {other:?}"),
        }
        match parse_tag("M.0,b,0") {
            Err(Error::TagParse { state, .. }) => {
                assert_eq!(state, TagParseState::TypeValidation)
            }
            other => panic!("unexpected {other:?}"),
        }
        match parse_tag("M.0,x9") {
            Err(Error::TagParse { state, .. }) => {
                assert_eq!(state, TagParseState::TypeValidation)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn re_emit_round_trips_semantically() {
        for input in [
            "DB1.80000,x,1",
            "M10.2,w,4",
            "db7.0,s,32",
            "I.4,dw,2",
            "T.5",
            "C.9,w,1",
            "M10.2,x",
            "Q.1,r,8",
            "DB100.42,i,3",
        ] {
            let first = tag(input);
            let emitted = first.to_string();
            let second = tag(&emitted);
            assert_eq!(first, second, "'{input}' re-emitted as '{emitted}'");
        }
    }
}
