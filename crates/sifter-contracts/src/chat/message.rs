use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Model => "model",
        }
    }
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn of a region-negotiation conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Model,
            content: content.into(),
        }
    }
}

/// Renders a history as `role: content` lines, oldest first.
pub fn render_transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|message| format!("{}: {}", message.role, message.content.trim()))
        .collect::<Vec<String>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{render_transcript, ChatMessage, ChatRole};

    #[test]
    fn roles_serialize_lowercase() {
        let message = ChatMessage::model("Which logo?");
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"role": "model", "content": "Which logo?"})
        );
        let parsed: ChatMessage =
            serde_json::from_value(json!({"role": "user", "content": "the corner one"})).unwrap();
        assert_eq!(parsed.role, ChatRole::User);
    }

    #[test]
    fn transcript_keeps_order() {
        let history = vec![
            ChatMessage::user("remove the watermark"),
            ChatMessage::model("The one bottom right?"),
            ChatMessage::user(" yes "),
        ];
        assert_eq!(
            render_transcript(&history),
            "user: remove the watermark\nmodel: The one bottom right?\nuser: yes"
        );
    }
}
