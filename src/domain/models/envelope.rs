//! Wire format of bus messages.
//!
//! A message body is a UTF-8 JSON object `{"context": {...}, "data": "<json>"}`
//! where `data` is itself a JSON-encoded string holding the entity payload.
//! Consumers decode twice: once for the envelope, once for `data`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::dispatch::DispatchError;

/// Entity payload as carried on the bus
pub type Record = Map<String, Value>;

/// Request-scoped metadata travelling with every event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Any other context keys producers attach
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EventContext {
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// The envelope exactly as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(default)]
    pub context: EventContext,
    pub data: String,
}

impl MessageEnvelope {
    /// Wraps a payload, JSON-encoding it into the `data` string.
    ///
    /// # Errors
    /// Returns the serialization error if the payload cannot be encoded
    pub fn wrap<T: Serialize + ?Sized>(
        payload: &T,
        context: EventContext,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            context,
            data: serde_json::to_string(payload)?,
        })
    }

    /// Serializes the envelope into a message body
    ///
    /// # Errors
    /// Returns the serialization error if the context holds unencodable values
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A fully decoded message: context plus the entity payload object
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub context: EventContext,
    pub data: Record,
}

impl DecodedEvent {
    /// Decodes a raw message body.
    ///
    /// `data` must be a JSON string holding an object. A `data` that is
    /// already an object is accepted too, since some producers skip the
    /// inner encoding.
    ///
    /// # Errors
    /// Returns `DispatchError::Decode` for invalid UTF-8/JSON, a missing
    /// `data` field or a `data` value that does not hold an object
    pub fn decode(body: &[u8]) -> Result<Self, DispatchError> {
        let raw: Value = serde_json::from_slice(body)
            .map_err(|err| DispatchError::Decode(format!("invalid envelope json: {}", err)))?;

        let Value::Object(mut envelope) = raw else {
            return Err(DispatchError::Decode("envelope is not a json object".to_owned()));
        };

        let context = match envelope.remove("context") {
            None | Some(Value::Null) => EventContext::default(),
            Some(value) => serde_json::from_value(value)
                .map_err(|err| DispatchError::Decode(format!("invalid context: {}", err)))?,
        };

        let data = match envelope.remove("data") {
            Some(Value::String(encoded)) => serde_json::from_str::<Value>(&encoded)
                .map_err(|err| DispatchError::Decode(format!("invalid data json: {}", err)))?,
            Some(value @ Value::Object(_)) => value,
            Some(_) => {
                return Err(DispatchError::Decode(
                    "data must be a json-encoded string".to_owned(),
                ));
            }
            None => return Err(DispatchError::Decode("envelope has no data".to_owned())),
        };

        match data {
            Value::Object(data) => Ok(Self { context, data }),
            _ => Err(DispatchError::Decode("data does not hold an object".to_owned())),
        }
    }
}
