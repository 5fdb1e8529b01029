//! Typed G-code parameters.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Value of a single code parameter.
///
/// The variant determines the wire data type byte and whether the value is
/// stored inline in the parameter slot or appended out of line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterValue {
    Int(i32),
    UInt(u32),
    Float(f32),
    IntArray(Vec<i32>),
    UIntArray(Vec<u32>),
    FloatArray(Vec<f32>),
    String(String),
    /// Unevaluated `{...}` expression, forwarded verbatim.
    Expression(String),
}

impl ParameterValue {
    /// Wire data type byte.
    pub fn wire_type(&self) -> u8 {
        match self {
            ParameterValue::Int(_) => 0,
            ParameterValue::UInt(_) => 1,
            ParameterValue::Float(_) => 2,
            ParameterValue::IntArray(_) => 3,
            ParameterValue::UIntArray(_) => 4,
            ParameterValue::FloatArray(_) => 5,
            ParameterValue::String(_) => 6,
            ParameterValue::Expression(_) => 7,
        }
    }

    /// Scalar integer view, coercing unsigned values that fit.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            ParameterValue::Int(value) => Some(*value),
            ParameterValue::UInt(value) => i32::try_from(*value).ok(),
            _ => None,
        }
    }

    /// Scalar unsigned view, coercing non-negative integers.
    pub fn as_uint(&self) -> Option<u32> {
        match self {
            ParameterValue::UInt(value) => Some(*value),
            ParameterValue::Int(value) => u32::try_from(*value).ok(),
            _ => None,
        }
    }

    /// Scalar float view, coercing integers.
    pub fn as_float(&self) -> Option<f32> {
        match self {
            ParameterValue::Float(value) => Some(*value),
            ParameterValue::Int(value) => Some(*value as f32),
            ParameterValue::UInt(value) => Some(*value as f32),
            _ => None,
        }
    }

    /// String view for string and expression parameters.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(value) | ParameterValue::Expression(value) => Some(value),
            _ => None,
        }
    }
}

/// A single `letter=value` code parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeParameter {
    pub letter: char,
    pub value: ParameterValue,
}

impl CodeParameter {
    pub fn new(letter: char, value: ParameterValue) -> Self {
        Self { letter, value }
    }

    /// Wire letter byte; parameter letters are plain ASCII.
    pub fn wire_letter(&self) -> Result<u8> {
        if self.letter.is_ascii() {
            Ok(self.letter as u8)
        } else {
            Err(Error::Codec {
                message: format!("non-ASCII parameter letter {:?}", self.letter),
            })
        }
    }
}

impl std::fmt::Display for CodeParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.letter)?;
        match &self.value {
            ParameterValue::Int(value) => write!(f, "{value}"),
            ParameterValue::UInt(value) => write!(f, "{value}"),
            ParameterValue::Float(value) => write!(f, "{value}"),
            ParameterValue::IntArray(values) => write_array(f, values),
            ParameterValue::UIntArray(values) => write_array(f, values),
            ParameterValue::FloatArray(values) => write_array(f, values),
            ParameterValue::String(value) => write!(f, "\"{value}\""),
            ParameterValue::Expression(value) => write!(f, "{value}"),
        }
    }
}

fn write_array<T: std::fmt::Display>(
    f: &mut std::fmt::Formatter<'_>,
    values: &[T],
) -> std::fmt::Result {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            write!(f, ":")?;
        }
        write!(f, "{value}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_types_are_stable() {
        assert_eq!(ParameterValue::Int(0).wire_type(), 0);
        assert_eq!(ParameterValue::UInt(0).wire_type(), 1);
        assert_eq!(ParameterValue::Float(0.0).wire_type(), 2);
        assert_eq!(ParameterValue::IntArray(vec![]).wire_type(), 3);
        assert_eq!(ParameterValue::UIntArray(vec![]).wire_type(), 4);
        assert_eq!(ParameterValue::FloatArray(vec![]).wire_type(), 5);
        assert_eq!(ParameterValue::String(String::new()).wire_type(), 6);
        assert_eq!(ParameterValue::Expression(String::new()).wire_type(), 7);
    }

    #[test]
    fn int_coercions() {
        assert_eq!(ParameterValue::Int(-5).as_int(), Some(-5));
        assert_eq!(ParameterValue::UInt(5).as_int(), Some(5));
        assert_eq!(ParameterValue::UInt(u32::MAX).as_int(), None);
        assert_eq!(ParameterValue::Int(-1).as_uint(), None);
        assert_eq!(ParameterValue::Int(12).as_float(), Some(12.0));
        assert_eq!(ParameterValue::Float(1.5).as_int(), None);
    }

    #[test]
    fn display_formats() {
        assert_eq!(
            CodeParameter::new('X', ParameterValue::Float(23.5)).to_string(),
            "X23.5"
        );
        assert_eq!(
            CodeParameter::new('E', ParameterValue::FloatArray(vec![12.0, 3.45])).to_string(),
            "E12:3.45"
        );
        assert_eq!(
            CodeParameter::new('J', ParameterValue::String("test".into())).to_string(),
            "J\"test\""
        );
    }

    #[test]
    fn non_ascii_letter_rejected() {
        let param = CodeParameter::new('Ø', ParameterValue::Int(1));
        assert!(param.wire_letter().is_err());
    }
}
