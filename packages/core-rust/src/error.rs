//! Protocol errors: a numeric error code plus optional extra information.
//!
//! A `MalError` is the expected failure channel of every interaction pattern.
//! On the wire an error message body is `(code: UInteger, extra_info)`; the
//! type of `extra_info` depends on the code and the operation, so it is kept
//! as a raw `rmpv::Value` and resolved on demand via
//! [`MalError::extra_info_as`].

use std::fmt;

use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::body::{Body, BodyError};

/// MAL standard and COM error codes.
pub mod codes {
    pub const DELIVERY_FAILED: u32 = 65536;
    pub const DELIVERY_TIMEDOUT: u32 = 65537;
    pub const DELIVERY_DELAYED: u32 = 65538;
    pub const DESTINATION_UNKNOWN: u32 = 65539;
    pub const DESTINATION_TRANSIENT: u32 = 65540;
    pub const DESTINATION_LOST: u32 = 65541;
    pub const AUTHENTICATION_FAIL: u32 = 65542;
    pub const AUTHORISATION_FAIL: u32 = 65543;
    pub const ENCRYPTION_FAIL: u32 = 65544;
    pub const UNSUPPORTED_AREA: u32 = 65545;
    pub const UNSUPPORTED_AREA_VERSION: u32 = 65546;
    pub const UNSUPPORTED_SERVICE: u32 = 65547;
    pub const UNSUPPORTED_OPERATION: u32 = 65548;
    pub const BAD_ENCODING: u32 = 65549;
    pub const INTERNAL: u32 = 65550;
    pub const UNKNOWN: u32 = 65551;
    pub const INCORRECT_STATE: u32 = 65552;
    pub const TOO_MANY: u32 = 65553;
    pub const SHUTDOWN: u32 = 65554;

    // COM area
    pub const INVALID: u32 = 70000;
    pub const DUPLICATE: u32 = 70001;

    /// Symbolic name of a standard code, `None` for service-defined codes.
    #[must_use]
    pub fn code_name(code: u32) -> Option<&'static str> {
        let name = match code {
            DELIVERY_FAILED => "DELIVERY_FAILED",
            DELIVERY_TIMEDOUT => "DELIVERY_TIMEDOUT",
            DELIVERY_DELAYED => "DELIVERY_DELAYED",
            DESTINATION_UNKNOWN => "DESTINATION_UNKNOWN",
            DESTINATION_TRANSIENT => "DESTINATION_TRANSIENT",
            DESTINATION_LOST => "DESTINATION_LOST",
            AUTHENTICATION_FAIL => "AUTHENTICATION_FAIL",
            AUTHORISATION_FAIL => "AUTHORISATION_FAIL",
            ENCRYPTION_FAIL => "ENCRYPTION_FAIL",
            UNSUPPORTED_AREA => "UNSUPPORTED_AREA",
            UNSUPPORTED_AREA_VERSION => "UNSUPPORTED_AREA_VERSION",
            UNSUPPORTED_SERVICE => "UNSUPPORTED_SERVICE",
            UNSUPPORTED_OPERATION => "UNSUPPORTED_OPERATION",
            BAD_ENCODING => "BAD_ENCODING",
            INTERNAL => "INTERNAL",
            UNKNOWN => "UNKNOWN",
            INCORRECT_STATE => "INCORRECT_STATE",
            TOO_MANY => "TOO_MANY",
            SHUTDOWN => "SHUTDOWN",
            INVALID => "INVALID",
            DUPLICATE => "DUPLICATE",
            _ => return None,
        };
        Some(name)
    }
}

/// A structured protocol error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MalError {
    pub code: u32,
    pub extra_info: Option<Value>,
}

impl MalError {
    /// Creates an error without extra information.
    #[must_use]
    pub fn new(code: u32) -> Self {
        Self {
            code,
            extra_info: None,
        }
    }

    /// Creates an error carrying a typed extra-information element.
    ///
    /// # Errors
    ///
    /// Returns `BodyError::Encode` if `info` cannot be serialized.
    pub fn with_info<T: Serialize + ?Sized>(code: u32, info: &T) -> Result<Self, BodyError> {
        let value = rmpv::ext::to_value(info).map_err(|e| BodyError::Encode(e.to_string()))?;
        Ok(Self {
            code,
            extra_info: Some(value),
        })
    }

    /// Creates an error whose extra information is a message string.
    #[must_use]
    pub fn with_message(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            extra_info: Some(Value::from(message.into())),
        }
    }

    /// Generic error used when the failure is not a structured protocol error.
    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::with_message(codes::UNKNOWN, message)
    }

    /// The extra information as a string, when it is one.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.extra_info.as_ref().and_then(Value::as_str)
    }

    /// Decodes the extra information as the type the operation documents for
    /// this error code. Absent or null extra information yields `None`.
    ///
    /// # Errors
    ///
    /// Returns `BodyError::UnexpectedType` if the value is not a `T`.
    pub fn extra_info_as<T: DeserializeOwned>(&self) -> Result<Option<T>, BodyError> {
        match &self.extra_info {
            None | Some(Value::Nil) => Ok(None),
            Some(value) => rmpv::ext::from_value(value.clone())
                .map(Some)
                .map_err(|e| BodyError::UnexpectedType {
                    index: 1,
                    expected: std::any::type_name::<T>(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Encodes the error as an error-message body: `(code, extra_info)`.
    #[must_use]
    pub fn to_body(&self) -> Body {
        let mut body = Body::new();
        body.push_value(Value::from(self.code));
        body.push_value(self.extra_info.clone().unwrap_or(Value::Nil));
        body
    }

    /// Decodes an error-message body. Extra information that is absent is
    /// treated as null so that bodies sent by minimal peers still decode.
    ///
    /// # Errors
    ///
    /// Returns a `BodyError` if the code parameter is missing or not an integer.
    pub fn from_body(body: &mut Body) -> Result<Self, BodyError> {
        body.reset(false);
        let code: u32 = body.decode_required()?;
        let extra_info = if body.remaining() > 0 {
            body.decode_parameter::<Value>()?
        } else {
            None
        };
        Ok(Self { code, extra_info })
    }
}

impl fmt::Display for MalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match codes::code_name(self.code) {
            Some(name) => write!(f, "MAL error {name} ({})", self.code)?,
            None => write!(f, "MAL error {}", self.code)?,
        }
        match &self.extra_info {
            None | Some(Value::Nil) => Ok(()),
            Some(Value::String(s)) => write!(f, ": {}", s.as_str().unwrap_or_default()),
            Some(other) => write!(f, ": {other}"),
        }
    }
}

impl std::error::Error for MalError {}

impl From<BodyError> for MalError {
    fn from(error: BodyError) -> Self {
        Self::with_message(codes::BAD_ENCODING, error.to_string())
    }
}
