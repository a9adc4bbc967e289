use std::marker::PhantomData;

use bytes::Bytes;
use http::HeaderValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::headers::parse_charset;
use crate::http::NetworkResponse;

/// Decodes a finished network (or cache-synthesized) response into the
/// caller's type on a dispatcher thread. Failures surface to the error
/// listener as a parse error.
pub trait ResponseConverter<T>: Send + Sync {
    fn convert(&self, response: &NetworkResponse) -> Result<T, ConvertError>;
}

/// Encodes a request body value into bytes plus its content type.
pub trait RequestConverter<U>: Send + Sync {
    fn convert(&self, value: &U) -> Result<EncodedBody, ConvertError>;
}

#[derive(Clone, Debug)]
pub struct EncodedBody {
    pub data: Bytes,
    pub content_type: HeaderValue,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConvertError {
    #[error("response body is empty")]
    EmptyBody,
    #[error("json conversion failed: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("form encoding failed: {source}")]
    Form {
        #[from]
        source: serde_urlencoded::ser::Error,
    },
    #[error("{message}")]
    Other { message: String },
}

/// Hands the body bytes through untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesConverter;

impl ResponseConverter<Bytes> for BytesConverter {
    fn convert(&self, response: &NetworkResponse) -> Result<Bytes, ConvertError> {
        Ok(response.data.clone())
    }
}

/// Decodes text honoring the response charset, `ISO-8859-1` by default.
/// UTF-8 falls back to replacement characters on invalid sequences rather
/// than failing the whole request.
#[derive(Clone, Copy, Debug, Default)]
pub struct StringConverter;

impl ResponseConverter<String> for StringConverter {
    fn convert(&self, response: &NetworkResponse) -> Result<String, ConvertError> {
        let charset = parse_charset(&response.headers);
        if charset.eq_ignore_ascii_case("iso-8859-1") || charset.eq_ignore_ascii_case("latin1") {
            Ok(response.data.iter().map(|&byte| byte as char).collect())
        } else {
            Ok(String::from_utf8_lossy(&response.data).into_owned())
        }
    }
}

/// Deserializes the body as JSON into `T`.
#[derive(Debug)]
pub struct JsonConverter<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonConverter<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonConverter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResponseConverter<T> for JsonConverter<T>
where
    T: DeserializeOwned,
{
    fn convert(&self, response: &NetworkResponse) -> Result<T, ConvertError> {
        if response.data.is_empty() {
            return Err(ConvertError::EmptyBody);
        }
        Ok(serde_json::from_slice(&response.data)?)
    }
}

/// Serializes a request body value as JSON.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonBody;

impl<U> RequestConverter<U> for JsonBody
where
    U: Serialize,
{
    fn convert(&self, value: &U) -> Result<EncodedBody, ConvertError> {
        Ok(EncodedBody {
            data: Bytes::from(serde_json::to_vec(value)?),
            content_type: HeaderValue::from_static("application/json; charset=utf-8"),
        })
    }
}

/// Serializes a request body value as `application/x-www-form-urlencoded`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FormBody;

impl<U> RequestConverter<U> for FormBody
where
    U: Serialize,
{
    fn convert(&self, value: &U) -> Result<EncodedBody, ConvertError> {
        Ok(EncodedBody {
            data: Bytes::from(serde_urlencoded::to_string(value)?),
            content_type: HeaderValue::from_static("application/x-www-form-urlencoded"),
        })
    }
}
