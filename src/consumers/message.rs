use amq_protocol_types::DeliveryTag;
use serde::de::DeserializeOwned;

/// A message delivered to a [`TopicConsumer`](crate::consumers::TopicConsumer), decoded
/// according to its content type.
///
/// `Message` is the input of [`Callback`](crate::consumers::Callback)s. It carries no way to
/// acknowledge the delivery: the consumer acknowledges every message once the callback is done,
/// whatever the outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// The topic of the consumer that received the message.
    pub topic: String,
    /// The exchange the message was published to.
    pub exchange: String,
    /// The routing key the message was published with.
    pub routing_key: String,
    pub delivery_tag: DeliveryTag,
    /// Whether the broker delivered this message before without getting an acknowledgement.
    pub redelivered: bool,
    /// The decoded body.
    pub payload: Payload,
}

/// The body of a [`Message`], decoded according to its content type.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// `application/json` (or any `+json` type).
    Json(serde_json::Value),
    /// `text/*`.
    Text(String),
    /// Anything else, including messages without a content type.
    Binary(Vec<u8>),
}

/// The body of a message could not be decoded according to its content type.
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("The message body is not valid JSON.")]
    Json(#[from] serde_json::Error),
    #[error("The message body is not valid UTF-8.")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl Payload {
    pub(crate) fn decode(content_type: Option<&str>, data: Vec<u8>) -> Result<Self, DecodeError> {
        // Parameters such as `; charset=utf-8` do not change how we decode.
        let mime = content_type
            .and_then(|c| c.split(';').next())
            .map(|c| c.trim().to_ascii_lowercase());
        match mime.as_deref() {
            Some(mime) if mime == "application/json" || mime.ends_with("+json") => {
                Ok(Self::Json(serde_json::from_slice(&data)?))
            }
            Some(mime) if mime.starts_with("text/") => Ok(Self::Text(String::from_utf8(data)?)),
            _ => Ok(Self::Binary(data)),
        }
    }
}

impl Message {
    /// Deserialize the payload into `T`.
    ///
    /// Works for any payload kind, as long as its bytes are valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.payload {
            Payload::Json(value) => T::deserialize(value),
            Payload::Text(text) => serde_json::from_str(text),
            Payload::Binary(data) => serde_json::from_slice(data),
        }
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn text(&self) -> Option<String> {
        match &self.payload {
            Payload::Text(text) => Some(text.clone()),
            Payload::Json(value) => Some(value.to_string()),
            Payload::Binary(data) => String::from_utf8(data.clone()).ok(),
        }
    }
}
