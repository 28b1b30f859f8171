//! Wire messages of the `/signin` WebSocket protocol.

use serde::{Deserialize, Serialize};

use crate::cm::WireError;

// --- Client to server messages ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start a credentials-based sign-in.
    Credentials {
        account_name: String,
        password: String,
    },
    /// Start a QR-based sign-in.
    Qr,
    /// Steam Guard code confirmation.
    GuardCode { code: String },
    /// E-mail code confirmation.
    Email { code: String },
}

// --- Server to client messages ---

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// A refreshed QR challenge URL.
    Challenge { url: String },
    /// A second factor is required; lists acceptable confirmation kinds.
    Confirmations { confirmations: Vec<&'static str> },
    /// Sign-in finished; `expires` is present for non-renewable tokens.
    Complete {
        renewable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        expires: Option<u64>,
    },
    /// Sign-in failed.
    Failure { error: WireError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_deserialize() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"credentials","account_name":"u","password":"p"}"#)
                .unwrap();
        assert!(matches!(msg, ClientMessage::Credentials { .. }));
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"qr"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Qr));
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"email","code":"ABCDE"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Email { .. }));
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"guard_code","code":"XYZ"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::GuardCode { .. }));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"sms","code":"1"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("[]").is_err());
    }

    #[test]
    fn server_messages_serialize_flat() {
        let json = serde_json::to_string(&ServerMessage::Complete {
            renewable: true,
            expires: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"renewable":true}"#);
        let json = serde_json::to_string(&ServerMessage::Complete {
            renewable: false,
            expires: Some(42),
        })
        .unwrap();
        assert_eq!(json, r#"{"renewable":false,"expires":42}"#);
        let json = serde_json::to_string(&ServerMessage::Confirmations {
            confirmations: vec!["device", "email"],
        })
        .unwrap();
        assert_eq!(json, r#"{"confirmations":["device","email"]}"#);
    }
}
