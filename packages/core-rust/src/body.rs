//! Ordered parameter container carried by every `Message`.
//!
//! A [`Body`] is a sequence of `MsgPack` values (`rmpv::Value`). Parameters are
//! encoded and decoded strictly in the order an operation defines. The final
//! parameter may be *abstract*: its concrete type is not known statically and
//! travels as `[short_form, value]` so that the receiver can resolve it (or
//! relay it untouched, as the broker does with update value lists).
//!
//! A `null` parameter is encoded as `Nil` and decodes to `None`.

use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{Blob, Identifier, Uri};

/// Errors raised by the parameter encoding contract.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BodyError {
    #[error("missing parameter {index}: body holds {len} parameters")]
    MissingParameter { index: usize, len: usize },
    #[error("parameter {index} is null but {expected} was required")]
    NullParameter { index: usize, expected: &'static str },
    #[error("unexpected type for parameter {index}: expected {expected}: {reason}")]
    UnexpectedType {
        index: usize,
        expected: &'static str,
        reason: String,
    },
    #[error("unexpected short form for parameter {index}: expected {expected:#x}, found {actual:#x}")]
    UnexpectedShortForm {
        index: usize,
        expected: i64,
        actual: i64,
    },
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Short forms
// ---------------------------------------------------------------------------

/// MAL area number of the MAL standard types.
pub const MAL_AREA: u16 = 1;
/// MAL area version of the MAL standard types.
pub const MAL_AREA_VERSION: u8 = 1;

const TYPE_MASK: i64 = 0x00FF_FFFF;

/// Computes the absolute short form of a type:
/// `area << 48 | service << 32 | version << 24 | type_number`.
#[must_use]
pub const fn short_form(area: u16, service: u16, version: u8, type_number: i32) -> i64 {
    ((area as i64) << 48)
        | ((service as i64) << 32)
        | ((version as i64) << 24)
        | ((type_number as i64) & TYPE_MASK)
}

/// Short form of the list type whose elements have short form `element`.
/// Lists use the negated type number.
#[must_use]
pub const fn list_short_form(element: i64) -> i64 {
    let type_number = element & TYPE_MASK;
    (element & !TYPE_MASK) | ((-type_number) & TYPE_MASK)
}

const fn mal_attribute(type_number: i32) -> i64 {
    short_form(MAL_AREA, 0, MAL_AREA_VERSION, type_number)
}

/// A type that can travel as an abstract (polymorphic) parameter.
pub trait Element: Serialize + DeserializeOwned {
    /// Absolute short form identifying the concrete type on the wire.
    const SHORT_FORM: i64;
}

impl Element for Blob {
    const SHORT_FORM: i64 = mal_attribute(1);
}

impl Element for bool {
    const SHORT_FORM: i64 = mal_attribute(2);
}

impl Element for f64 {
    const SHORT_FORM: i64 = mal_attribute(5);
}

impl Element for Identifier {
    const SHORT_FORM: i64 = mal_attribute(6);
}

impl Element for u32 {
    const SHORT_FORM: i64 = mal_attribute(12);
}

impl Element for i64 {
    const SHORT_FORM: i64 = mal_attribute(13);
}

impl Element for String {
    const SHORT_FORM: i64 = mal_attribute(15);
}

impl Element for Uri {
    const SHORT_FORM: i64 = mal_attribute(18);
}

impl<T: Element> Element for Vec<T> {
    const SHORT_FORM: i64 = list_short_form(T::SHORT_FORM);
}

// ---------------------------------------------------------------------------
// AbstractElement
// ---------------------------------------------------------------------------

/// An abstract parameter whose concrete type is resolved at decode time.
///
/// Holds the short form and the still-encoded value. The broker relays these
/// without ever naming the concrete element type.
#[derive(Debug, Clone, PartialEq)]
pub struct AbstractElement {
    pub short_form: i64,
    pub value: Value,
}

impl AbstractElement {
    /// Wraps a concrete element.
    ///
    /// # Errors
    ///
    /// Returns `BodyError::Encode` if the element cannot be serialized.
    pub fn from_element<T: Element>(element: &T) -> Result<Self, BodyError> {
        let value = rmpv::ext::to_value(element).map_err(|e| BodyError::Encode(e.to_string()))?;
        Ok(Self {
            short_form: T::SHORT_FORM,
            value,
        })
    }

    /// Resolves the concrete type.
    ///
    /// # Errors
    ///
    /// Returns `BodyError::UnexpectedShortForm` if `T` is not the encoded type,
    /// or `BodyError::UnexpectedType` if the value does not deserialize as `T`.
    pub fn decode<T: Element>(&self) -> Result<T, BodyError> {
        if self.short_form != T::SHORT_FORM {
            return Err(BodyError::UnexpectedShortForm {
                index: 0,
                expected: T::SHORT_FORM,
                actual: self.short_form,
            });
        }
        rmpv::ext::from_value(self.value.clone()).map_err(|e| BodyError::UnexpectedType {
            index: 0,
            expected: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }

    /// Number of entries when the element is a list, `None` otherwise.
    #[must_use]
    pub fn list_len(&self) -> Option<usize> {
        match &self.value {
            Value::Array(items) => Some(items.len()),
            _ => None,
        }
    }

    fn into_wire(self) -> Value {
        Value::Array(vec![Value::from(self.short_form), self.value])
    }

    fn from_wire(index: usize, value: Value) -> Result<Self, BodyError> {
        let invalid = |reason: &str| BodyError::UnexpectedType {
            index,
            expected: "abstract element",
            reason: reason.to_string(),
        };
        let Value::Array(mut parts) = value else {
            return Err(invalid("not a [short_form, value] pair"));
        };
        if parts.len() != 2 {
            return Err(invalid("not a [short_form, value] pair"));
        }
        let value = parts.pop().unwrap_or(Value::Nil);
        let short_form = parts
            .pop()
            .and_then(|sf| sf.as_i64())
            .ok_or_else(|| invalid("short form is not an integer"))?;
        Ok(Self { short_form, value })
    }
}

// ---------------------------------------------------------------------------
// Body
// ---------------------------------------------------------------------------

/// The parameter list of a message.
///
/// Writing appends parameters; reading consumes them front to back through an
/// internal cursor. [`Body::reset`] switches between the two.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Body {
    params: Vec<Value>,
    #[serde(skip)]
    cursor: usize,
}

impl PartialEq for Body {
    fn eq(&self, other: &Self) -> bool {
        self.params == other.params
    }
}

impl Body {
    /// Creates an empty, writable body.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a body holding a single parameter.
    ///
    /// # Errors
    ///
    /// Returns `BodyError::Encode` if the value cannot be serialized.
    pub fn single<T: Serialize + ?Sized>(value: &T) -> Result<Self, BodyError> {
        let mut body = Self::new();
        body.encode_parameter(value)?;
        Ok(body)
    }

    /// Total number of encoded parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parameters not yet consumed by the decode cursor.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.params.len().saturating_sub(self.cursor)
    }

    /// Rewinds for reading (`writable == false`) or clears for writing.
    pub fn reset(&mut self, writable: bool) {
        if writable {
            self.params.clear();
        }
        self.cursor = 0;
    }

    /// Appends a parameter. `None` values encode as null.
    ///
    /// # Errors
    ///
    /// Returns `BodyError::Encode` if the value cannot be serialized.
    pub fn encode_parameter<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), BodyError> {
        let value = rmpv::ext::to_value(value).map_err(|e| BodyError::Encode(e.to_string()))?;
        self.params.push(value);
        Ok(())
    }

    /// Appends a parameter that is already a wire value.
    pub fn push_value(&mut self, value: Value) {
        self.params.push(value);
    }

    /// Appends the last parameter of an operation, optionally as an abstract element.
    ///
    /// # Errors
    ///
    /// Returns `BodyError::Encode` if the value cannot be serialized.
    pub fn encode_last_parameter<T: Element>(
        &mut self,
        value: Option<&T>,
        is_abstract: bool,
    ) -> Result<(), BodyError> {
        match (value, is_abstract) {
            (Some(v), true) => {
                let element = AbstractElement::from_element(v)?;
                self.encode_abstract(Some(&element));
                Ok(())
            }
            (value, _) => self.encode_parameter(&value),
        }
    }

    /// Appends an already-abstract element (or null).
    pub fn encode_abstract(&mut self, element: Option<&AbstractElement>) {
        let value = element.map_or(Value::Nil, |e| e.clone().into_wire());
        self.params.push(value);
    }

    /// Decodes the next parameter. Null decodes to `None`.
    ///
    /// # Errors
    ///
    /// Returns `BodyError::MissingParameter` when the body is exhausted and
    /// `BodyError::UnexpectedType` when the value is not a `T`.
    pub fn decode_parameter<T: DeserializeOwned>(&mut self) -> Result<Option<T>, BodyError> {
        let (index, value) = self.next_value()?;
        if value.is_nil() {
            return Ok(None);
        }
        rmpv::ext::from_value(value)
            .map(Some)
            .map_err(|e| BodyError::UnexpectedType {
                index,
                expected: std::any::type_name::<T>(),
                reason: e.to_string(),
            })
    }

    /// Decodes the next parameter, rejecting null.
    ///
    /// # Errors
    ///
    /// As [`Body::decode_parameter`], plus `BodyError::NullParameter`.
    pub fn decode_required<T: DeserializeOwned>(&mut self) -> Result<T, BodyError> {
        let index = self.cursor;
        self.decode_parameter()?.ok_or(BodyError::NullParameter {
            index,
            expected: std::any::type_name::<T>(),
        })
    }

    /// Decodes the last parameter of an operation, resolving an abstract
    /// element to `T` when `is_abstract` is set.
    ///
    /// # Errors
    ///
    /// As [`Body::decode_parameter`], plus `BodyError::UnexpectedShortForm`
    /// when the abstract element is not a `T`.
    pub fn decode_last_parameter<T: Element>(&mut self, is_abstract: bool) -> Result<Option<T>, BodyError> {
        if !is_abstract {
            return self.decode_parameter();
        }
        let index = self.cursor;
        match self.decode_abstract()? {
            None => Ok(None),
            Some(element) => element.decode().map(Some).map_err(|e| reindex(e, index)),
        }
    }

    /// Decodes the next parameter as an abstract element without resolving it.
    ///
    /// # Errors
    ///
    /// Returns `BodyError::MissingParameter` or `BodyError::UnexpectedType`.
    pub fn decode_abstract(&mut self) -> Result<Option<AbstractElement>, BodyError> {
        let (index, value) = self.next_value()?;
        if value.is_nil() {
            return Ok(None);
        }
        AbstractElement::from_wire(index, value).map(Some)
    }

    /// Serializes the parameter list to `MsgPack` bytes.
    ///
    /// # Errors
    ///
    /// Returns `BodyError::Encode` on serialization failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BodyError> {
        rmp_serde::to_vec(&self.params).map_err(|e| BodyError::Encode(e.to_string()))
    }

    /// Parses a parameter list from `MsgPack` bytes, positioned for reading.
    ///
    /// # Errors
    ///
    /// Returns `BodyError::Decode` if the bytes are not a `MsgPack` array.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BodyError> {
        let params: Vec<Value> =
            rmp_serde::from_slice(bytes).map_err(|e| BodyError::Decode(e.to_string()))?;
        Ok(Self { params, cursor: 0 })
    }

    fn next_value(&mut self) -> Result<(usize, Value), BodyError> {
        let index = self.cursor;
        let value = self
            .params
            .get(index)
            .cloned()
            .ok_or(BodyError::MissingParameter {
                index,
                len: self.params.len(),
            })?;
        self.cursor += 1;
        Ok((index, value))
    }
}

fn reindex(error: BodyError, index: usize) -> BodyError {
    match error {
        BodyError::UnexpectedShortForm { expected, actual, .. } => BodyError::UnexpectedShortForm {
            index,
            expected,
            actual,
        },
        BodyError::UnexpectedType { expected, reason, .. } => BodyError::UnexpectedType {
            index,
            expected,
            reason,
        },
        other => other,
    }
}
