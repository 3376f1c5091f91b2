use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, ReactionEntry};

/// Events sent FROM server TO clients. The same JSON travels over the broker
/// between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEvent {
    /// Sent exactly once per connection, right after it opens
    History { messages: Vec<ChatMessage> },

    /// A new message was posted
    Chat { id: i64, message: ChatMessage },

    /// Full current reaction set of a message. Replaces whatever the client
    /// had for that message.
    Reaction {
        #[serde(rename = "messageId")]
        message_id: i64,
        reactions: Vec<ReactionEntry>,
    },
}

impl ServerEvent {
    /// The user a targeted event is meant for. `None` means the event is
    /// delivered to every connection.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            Self::Chat { message, .. } => message.recipient_username(),
            Self::History { .. } | Self::Reaction { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientCommand {
    /// Post a message. Without a recipient it is visible to everyone.
    Chat {
        #[serde(default)]
        sender: Option<String>,
        #[serde(default)]
        recipient: Option<String>,
        message: String,
    },

    /// Toggle the sender's reaction on a message
    Reaction {
        #[serde(rename = "messageId")]
        message_id: MessageIdInput,
        emoji: String,
        #[serde(default)]
        user: Option<String>,
    },
}

/// Clients send message ids either as JSON numbers or as strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageIdInput {
    Number(i64),
    Text(String),
}

impl MessageIdInput {
    pub fn coerce(&self) -> Option<i64> {
        match self {
            Self::Number(id) => Some(*id),
            Self::Text(text) => text.trim().parse().ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::models::{ChatReaction, ChatUser, MessageKind, MessageStatus};

    fn sample_message(recipient: Option<&str>) -> ChatMessage {
        ChatMessage {
            id: 7,
            from: ChatUser::new("alice"),
            recipient: recipient.map(ChatUser::new),
            date: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            message: "hi".to_string(),
            status: MessageStatus::Delivered,
            kind: MessageKind::Text,
            reactions: vec![ChatReaction {
                emoji: "👍".to_string(),
                from: ChatUser::new("bob"),
            }],
        }
    }

    #[test]
    fn chat_event_wire_shape() {
        let event = ServerEvent::Chat {
            id: 7,
            message: sample_message(None),
        };
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "chat",
                "id": 7,
                "message": {
                    "id": 7,
                    "from": { "username": "alice" },
                    "date": "2024-03-01T12:00:00Z",
                    "message": "hi",
                    "status": "delivered",
                    "type": "text",
                    "reactions": [{ "type": "👍", "from": { "username": "bob" } }]
                }
            })
        );
    }

    #[test]
    fn reaction_event_uses_camel_case_id() {
        let event = ServerEvent::Reaction {
            message_id: 3,
            reactions: vec![ReactionEntry {
                emoji: "😂".to_string(),
                user: "bob".to_string(),
            }],
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({ "type": "reaction", "messageId": 3, "reactions": [{ "emoji": "😂", "user": "bob" }] })
        );
    }

    #[test]
    fn recipient_only_for_direct_chat() {
        let direct = ServerEvent::Chat {
            id: 7,
            message: sample_message(Some("carol")),
        };
        assert_eq!(direct.recipient(), Some("carol"));

        let public = ServerEvent::Chat {
            id: 7,
            message: sample_message(None),
        };
        assert_eq!(public.recipient(), None);

        let history = ServerEvent::History { messages: vec![] };
        assert_eq!(history.recipient(), None);
    }

    #[test]
    fn event_survives_broker_hop() {
        let event = ServerEvent::Chat {
            id: 7,
            message: sample_message(Some("carol")),
        };
        let text = serde_json::to_string(&event).unwrap();
        let back: ServerEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn parse_chat_command_with_optional_fields() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"chat","message":"hello"}"#).unwrap();
        assert_eq!(
            cmd,
            ClientCommand::Chat {
                sender: None,
                recipient: None,
                message: "hello".to_string(),
            }
        );

        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"chat","sender":"alice","recipient":"carol","message":"psst"}"#,
        )
        .unwrap();
        assert!(matches!(cmd, ClientCommand::Chat { recipient: Some(ref r), .. } if r == "carol"));
    }

    #[test]
    fn reaction_message_id_accepts_string_or_number() {
        let from_text: ClientCommand = serde_json::from_str(
            r#"{"type":"reaction","messageId":"42","emoji":"👍","user":"bob"}"#,
        )
        .unwrap();
        let from_number: ClientCommand = serde_json::from_str(
            r#"{"type":"reaction","messageId":42,"emoji":"👍","user":"bob"}"#,
        )
        .unwrap();

        for cmd in [from_text, from_number] {
            match cmd {
                ClientCommand::Reaction { message_id, .. } => {
                    assert_eq!(message_id.coerce(), Some(42))
                }
                other => panic!("unexpected command: {other:?}"),
            }
        }
    }

    #[test]
    fn non_numeric_message_id_does_not_coerce() {
        assert_eq!(MessageIdInput::Text("abc".to_string()).coerce(), None);
    }

    #[test]
    fn unknown_command_type_is_rejected() {
        let result = serde_json::from_str::<ClientCommand>(r#"{"type":"typing"}"#);
        assert!(result.is_err());
    }
}
