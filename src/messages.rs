//! Built-in wire messages.
//!
//! Every frame carries one of the three header messages below; payloads
//! are application-defined `prost` messages registered by id. The only
//! built-in command is [`CreateStream`], which the server facade handles
//! itself.

/// Base of the reserved id range for built-in messages. Application ids
/// are expected to grow upward from 1 and never reach this range.
pub const BUILTIN_MESSAGE_BASE: u32 = 0xFFFF_0000;

/// Registered id of the [`CreateStream`] command.
pub const CREATE_STREAM: u32 = BUILTIN_MESSAGE_BASE | 1;

/// Recipient string addressing the bus server itself.
pub const BUILTIN_RECIPIENT: &str = "$";

/// Logical endpoint name of the command channel.
pub const COMMAND_ENDPOINT: &str = "commands";

/// Header of a command frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandHeader {
    /// Registered id of the command payload type.
    #[prost(uint32, tag = "1")]
    pub command_type: u32,
    /// Opaque recipient string, carried unchanged to the handler.
    #[prost(string, tag = "2")]
    pub recipient: String,
}

/// Header of a command reply frame.
///
/// `status_code` follows HTTP conventions: `[200, 300)` is success,
/// anything else is a failure. `response_type` is `0` when the frame
/// carries no payload, otherwise the registered id of the payload type
/// (the success payload on 2xx, the typed-fault payload otherwise).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandResponse {
    #[prost(uint32, tag = "1")]
    pub status_code: u32,
    #[prost(string, tag = "2")]
    pub error_message: String,
    #[prost(uint32, tag = "3")]
    pub response_type: u32,
}

/// Header of an event frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventHeader {
    /// Registered id of the event payload type.
    #[prost(uint32, tag = "1")]
    pub event_type: u32,
    /// Milliseconds since the Unix epoch at publish time.
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

/// Command creating a named stream on the server.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateStream {
    #[prost(string, tag = "1")]
    pub name: String,
}

/// Whether a `CommandResponse` status code denotes success.
pub fn is_success(status_code: u32) -> bool {
    (200..300).contains(&status_code)
}

impl CommandResponse {
    /// The empty success envelope.
    pub fn ok() -> Self {
        CommandResponse {
            status_code: 200,
            error_message: String::new(),
            response_type: 0,
        }
    }

    /// A success envelope announcing a payload of the given type.
    pub fn ok_with(response_type: u32) -> Self {
        CommandResponse {
            status_code: 200,
            error_message: String::new(),
            response_type,
        }
    }

    /// A failure envelope. `response_type` is `0` for generic faults or
    /// the registered fault payload id for typed ones.
    pub fn failed(status_code: u32, error_message: impl Into<String>, response_type: u32) -> Self {
        CommandResponse {
            status_code,
            error_message: error_message.into(),
            response_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_classification() {
        assert!(is_success(200));
        assert!(is_success(204));
        assert!(is_success(299));
        assert!(!is_success(300));
        assert!(!is_success(400));
        assert!(!is_success(199));
        assert!(!is_success(0));
    }

    #[test]
    fn builtin_ids_are_out_of_application_range() {
        assert!(CREATE_STREAM > u32::from(u16::MAX));
        assert_eq!(CREATE_STREAM & !BUILTIN_MESSAGE_BASE, 1);
    }
}
