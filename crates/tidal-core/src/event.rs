//! Named event frames.
//!
//! An event travels as a JSON array whose first element is the event name
//! and whose remaining elements are the arguments, e.g.
//! `["chat", {"text": "hi"}, 3]`. Arguments are opaque JSON values; the
//! server never inspects them.

use serde_json::Value;
use thiserror::Error;

/// A named event with positional arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Event name used for handler lookup.
    pub name: String,
    /// Positional arguments.
    pub args: Vec<Value>,
}

/// Errors from decoding an inbound frame.
#[derive(Debug, Error)]
pub enum EventCodecError {
    /// The frame was not valid JSON.
    #[error("invalid event frame: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame was JSON but not an array.
    #[error("event frame must be a JSON array")]
    NotAnArray,
    /// The array was empty or its first element was not a string.
    #[error("event frame is missing its name")]
    MissingName,
}

impl Event {
    /// Build an event from a name and arguments.
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Encode as a JSON array text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let mut frame = Vec::with_capacity(self.args.len() + 1);
        frame.push(Value::String(self.name.clone()));
        frame.extend(self.args.iter().cloned());
        serde_json::to_string(&frame)
    }

    /// Decode a text frame.
    pub fn decode(frame: &str) -> Result<Self, EventCodecError> {
        let Value::Array(mut items) = serde_json::from_str::<Value>(frame)? else {
            return Err(EventCodecError::NotAnArray);
        };
        if items.is_empty() {
            return Err(EventCodecError::MissingName);
        }
        let Value::String(name) = items.remove(0) else {
            return Err(EventCodecError::MissingName);
        };
        if name.is_empty() {
            return Err(EventCodecError::MissingName);
        }
        Ok(Self { name, args: items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn encode_puts_name_first() {
        let event = Event::new("chat", vec![json!({"text": "hi"}), json!(3)]);
        assert_eq!(event.encode().unwrap(), r#"["chat",{"text":"hi"},3]"#);
    }

    #[test]
    fn encode_without_args() {
        let event = Event::new("ping", vec![]);
        assert_eq!(event.encode().unwrap(), r#"["ping"]"#);
    }

    #[test]
    fn decode_splits_name_and_args() {
        let event = Event::decode(r#"["move", 1, "north", null]"#).unwrap();
        assert_eq!(event.name, "move");
        assert_eq!(event.args, vec![json!(1), json!("north"), Value::Null]);
    }

    #[test]
    fn decode_rejects_object() {
        assert_matches!(
            Event::decode(r#"{"event":"x"}"#),
            Err(EventCodecError::NotAnArray)
        );
    }

    #[test]
    fn decode_rejects_empty_array() {
        assert_matches!(Event::decode("[]"), Err(EventCodecError::MissingName));
    }

    #[test]
    fn decode_rejects_non_string_name() {
        assert_matches!(Event::decode("[42, 1]"), Err(EventCodecError::MissingName));
    }

    #[test]
    fn decode_rejects_empty_name() {
        assert_matches!(Event::decode(r#"[""]"#), Err(EventCodecError::MissingName));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_matches!(Event::decode("not json"), Err(EventCodecError::Json(_)));
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            EventCodecError::NotAnArray.to_string(),
            "event frame must be a JSON array"
        );
        assert_eq!(
            EventCodecError::MissingName.to_string(),
            "event frame is missing its name"
        );
    }

    proptest! {
        #[test]
        fn decode_never_panics(frame in ".*") {
            let _ = Event::decode(&frame);
        }

        #[test]
        fn name_survives_encoding(name in "[a-z][a-z0-9:_.]{0,16}") {
            let encoded = Event::new(name.clone(), vec![json!(true)]).encode().unwrap();
            let decoded = Event::decode(&encoded).unwrap();
            prop_assert_eq!(decoded.name, name);
            prop_assert_eq!(decoded.args, vec![json!(true)]);
        }
    }
}
