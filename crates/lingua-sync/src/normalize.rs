//! Wire payload → canonical record conversion.
//!
//! One function per source. Every field is read through an ordered list of
//! source names; the first entry that is neither null nor an empty string
//! wins. Nothing here touches the store.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use lingua_types::{
    Attachment, ConversationId, ConversationKind, CorrelationToken, Delivery, Message, MessageId,
    MessageType, UserId, UserSummary,
};

// -- Message field fallbacks, canonical name first --

pub const ID_FIELDS: &[&str] = &["messageId", "id"];
pub const CONVERSATION_FIELDS: &[&str] = &["conversationId"];
pub const SENDER_FIELDS: &[&str] = &["userId", "senderId"];
pub const KIND_FIELDS: &[&str] = &["type", "Type"];
pub const BODY_FIELDS: &[&str] = &["messageText", "MessageText", "originalText"];
pub const TRANSLATED_FIELDS: &[&str] = &["messageTextTranslate", "translatedText"];
pub const SENT_AT_FIELDS: &[&str] = &["sentDatetime", "timestamp"];
pub const CORRELATION_FIELDS: &[&str] = &["correlationId", "clientMessageId"];

// -- Conversation summary field fallbacks --

pub const SUMMARY_ID_FIELDS: &[&str] = &["conversationId", "id"];
pub const SUMMARY_KIND_FIELDS: &[&str] = &["conversationType", "isGroup"];
pub const SUMMARY_NAME_FIELDS: &[&str] = &["conversationName", "name"];
pub const SUMMARY_AVATAR_FIELDS: &[&str] = &["conversationAvatar", "avatarUrl"];
pub const SUMMARY_PARTICIPANT_FIELDS: &[&str] = &["userProfiles", "participants", "members"];
pub const SUMMARY_LOCALE_FIELDS: &[&str] = &["locale", "conversationLocale"];

const PARTICIPANT_ID_FIELDS: &[&str] = &["userId", "id"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no message id")]
    MissingId,
    #[error("payload has no sender")]
    MissingSender,
    #[error("payload has no conversation id")]
    MissingConversation,
}

/// A push event as received: only `id` and `conversation_id` are certain.
/// An event for a message the store already holds may carry nothing but the
/// fields being filled in (a late translation, typically).
#[derive(Debug, Clone, PartialEq)]
pub struct MessageUpdate {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: Option<UserId>,
    pub kind: Option<MessageType>,
    pub body: Option<String>,
    pub attachment: Option<Attachment>,
    pub translated_body: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub correlation: Option<CorrelationToken>,
}

impl MessageUpdate {
    /// Completes the update into a full record, defaulting what is absent.
    pub fn into_message(self, now: DateTime<Utc>) -> Result<Message, NormalizeError> {
        let sender_id = self.sender_id.ok_or(NormalizeError::MissingSender)?;
        Ok(Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id,
            kind: self.kind.unwrap_or(MessageType::Text),
            body: self.body.unwrap_or_default(),
            attachment: self.attachment,
            translated_body: self.translated_body,
            sent_at: self.sent_at.unwrap_or(now),
            delivery: Delivery::Confirmed,
        })
    }
}

impl From<Message> for MessageUpdate {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: Some(message.sender_id),
            kind: Some(message.kind),
            body: Some(message.body),
            attachment: message.attachment,
            translated_body: message.translated_body,
            sent_at: Some(message.sent_at),
            correlation: None,
        }
    }
}

/// Content the user typed or picked, before it becomes a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub kind: MessageType,
    /// Text for TEXT drafts, the uploaded media url otherwise.
    pub content: String,
}

impl Draft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Text,
            content: content.into(),
        }
    }

    pub fn attachment(kind: MessageType, url: impl Into<String>) -> Self {
        Self {
            kind,
            content: url.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Conversation as described by a list page or an action result.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub display_name: Option<String>,
    pub avatar_ref: Option<String>,
    pub participants: Vec<UserSummary>,
    pub locale: Option<String>,
    pub last_message: Option<Message>,
}

impl ConversationSummary {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            kind: ConversationKind::Direct,
            display_name: None,
            avatar_ref: None,
            participants: Vec::new(),
            locale: None,
            last_message: None,
        }
    }
}

// -- Sources --

/// A record from a history page. It belongs to the conversation it was
/// requested for, whatever the payload says.
pub fn normalize_history(
    raw: &Value,
    conversation_id: &ConversationId,
    now: DateTime<Utc>,
) -> Result<Message, NormalizeError> {
    let obj = raw.as_object().ok_or(NormalizeError::NotAnObject)?;
    let mut update = read_update(obj, Some(conversation_id))?;
    update.conversation_id = conversation_id.clone();
    update.into_message(now)
}

/// A push event. `topic_conversation` is the conversation of the topic it
/// arrived on, used when the payload names none.
pub fn normalize_push(
    raw: &Value,
    topic_conversation: Option<&ConversationId>,
) -> Result<MessageUpdate, NormalizeError> {
    let obj = raw.as_object().ok_or(NormalizeError::NotAnObject)?;
    read_update(obj, topic_conversation)
}

/// A locally composed message, pending until its echo is reconciled.
pub fn normalize_draft(
    draft: &Draft,
    sender_id: &UserId,
    conversation_id: &ConversationId,
    token: CorrelationToken,
    now: DateTime<Utc>,
) -> Message {
    let content = draft.content.trim().to_string();
    let (body, attachment) = classify(draft.kind, content);
    Message {
        id: MessageId::Pending(token),
        conversation_id: conversation_id.clone(),
        sender_id: sender_id.clone(),
        kind: draft.kind,
        body,
        attachment,
        translated_body: None,
        sent_at: now,
        delivery: Delivery::Pending,
    }
}

pub fn normalize_summary(raw: &Value, now: DateTime<Utc>) -> Result<ConversationSummary, NormalizeError> {
    let obj = raw.as_object().ok_or(NormalizeError::NotAnObject)?;
    let id = text_field(obj, SUMMARY_ID_FIELDS)
        .filter(|id| !id.is_empty())
        .map(ConversationId::new)
        .ok_or(NormalizeError::MissingConversation)?;

    let kind = match field(obj, SUMMARY_KIND_FIELDS) {
        Some(Value::Bool(true)) => ConversationKind::Group,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("group") => ConversationKind::Group,
        _ => ConversationKind::Direct,
    };

    let mut participants: Vec<UserSummary> = Vec::new();
    if let Some(Value::Array(items)) = field(obj, SUMMARY_PARTICIPANT_FIELDS) {
        for item in items.iter().filter_map(Value::as_object) {
            let Some(user) = read_participant(item) else {
                continue;
            };
            if !participants.iter().any(|p| p.user_id == user.user_id) {
                participants.push(user);
            }
        }
    }

    // List items are the conversation's newest message with profile data
    // attached; action results may nest it instead.
    let last_message = match obj.get("lastMessage") {
        Some(nested @ Value::Object(_)) => normalize_history(nested, &id, now).ok(),
        _ if obj.contains_key("messageId") || field(obj, BODY_FIELDS).is_some() => {
            normalize_history(raw, &id, now).ok()
        }
        _ => None,
    };

    Ok(ConversationSummary {
        id,
        kind,
        display_name: non_empty(text_field(obj, SUMMARY_NAME_FIELDS)),
        avatar_ref: non_empty(text_field(obj, SUMMARY_AVATAR_FIELDS)),
        participants,
        locale: non_empty(text_field(obj, SUMMARY_LOCALE_FIELDS)),
        last_message,
    })
}

// -- Field helpers --

fn read_update(
    obj: &Map<String, Value>,
    fallback_conversation: Option<&ConversationId>,
) -> Result<MessageUpdate, NormalizeError> {
    let id = text_field(obj, ID_FIELDS)
        .filter(|id| !id.is_empty())
        .map(MessageId::Server)
        .ok_or(NormalizeError::MissingId)?;

    let conversation_id = text_field(obj, CONVERSATION_FIELDS)
        .filter(|id| !id.is_empty())
        .map(ConversationId::new)
        .or_else(|| fallback_conversation.cloned())
        .ok_or(NormalizeError::MissingConversation)?;

    let kind = field(obj, KIND_FIELDS)
        .and_then(Value::as_str)
        .map(|tag| MessageType::parse(tag).unwrap_or(MessageType::Text));

    let body = text_field(obj, BODY_FIELDS);
    let (body, attachment) = match (kind, body) {
        (Some(kind), Some(body)) => {
            let (body, attachment) = classify(kind, body);
            (Some(body), attachment)
        }
        (_, body) => (body, None),
    };

    Ok(MessageUpdate {
        id,
        conversation_id,
        sender_id: non_empty(text_field(obj, SENDER_FIELDS)).map(UserId::new),
        kind,
        body,
        attachment,
        translated_body: non_empty(text_field(obj, TRANSLATED_FIELDS)),
        sent_at: field(obj, SENT_AT_FIELDS).and_then(parse_timestamp),
        correlation: text_field(obj, CORRELATION_FIELDS)
            .and_then(|s| s.parse().ok())
            .map(CorrelationToken),
    })
}

fn read_participant(obj: &Map<String, Value>) -> Option<UserSummary> {
    let user_id = non_empty(text_field(obj, PARTICIPANT_ID_FIELDS))?;
    Some(UserSummary {
        user_id: UserId::new(user_id),
        username: non_empty(text_field(obj, &["username"])),
        full_name: non_empty(text_field(obj, &["fullName", "displayName"])),
        avatar_url: non_empty(text_field(obj, &["avatarUrl", "avatar"])),
    })
}

/// Moves a URL body of an attachment kind into the attachment.
fn classify(kind: MessageType, body: String) -> (String, Option<Attachment>) {
    if kind.is_attachment() && is_http_url(&body) {
        let attachment = Attachment {
            url: body.trim().to_string(),
            kind,
            format: kind.default_format().to_string(),
        };
        (String::new(), Some(attachment))
    } else {
        (body, None)
    }
}

pub fn is_http_url(s: &str) -> bool {
    url::Url::parse(s.trim())
        .map(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
        .unwrap_or(false)
}

fn field<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| obj.get(*name))
        .find(|v| !v.is_null())
}

fn text_field(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| obj.get(*name))
        .find_map(|value| match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Accepts RFC 3339, naive ISO-8601 (read as UTC), `YYYY-MM-DD HH:MM:SS`,
/// epoch milliseconds (number or numeric string), and Jackson's
/// `[y, m, d, h, min, s, nanos]` arrays.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => parse_timestamp_str(s),
        Value::Array(parts) => {
            let part = |i: usize| parts.get(i).and_then(Value::as_u64).unwrap_or(0) as u32;
            let year = parts.first()?.as_i64()? as i32;
            NaiveDate::from_ymd_opt(year, part(1), part(2))?
                .and_hms_nano_opt(part(3), part(4), part(5), part(6))
                .map(|ndt| ndt.and_utc())
        }
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(ndt.and_utc());
        }
    }
    s.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn conv() -> ConversationId {
        ConversationId::new("c1")
    }

    #[test]
    fn test_history_canonical_fields() {
        let raw = json!({
            "messageId": "m1",
            "id": "ignored",
            "conversationId": "other",
            "userId": "u1",
            "type": "TEXT",
            "messageText": "hello",
            "messageTextTranslate": "hola",
            "sentDatetime": "2025-03-01T10:00:00Z"
        });
        let msg = normalize_history(&raw, &conv(), now()).unwrap();
        assert_eq!(msg.id, MessageId::server("m1"));
        assert_eq!(msg.conversation_id, conv());
        assert_eq!(msg.sender_id, UserId::new("u1"));
        assert_eq!(msg.body, "hello");
        assert_eq!(msg.translated_body.as_deref(), Some("hola"));
        assert_eq!(msg.sent_at, Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap());
        assert!(!msg.translation_pending());
    }

    #[test]
    fn test_history_fallback_fields() {
        let raw = json!({
            "id": 42,
            "senderId": "u2",
            "Type": "video",
            "MessageText": "https://cdn.example.com/v.mp4",
            "timestamp": 1735689600000i64
        });
        let msg = normalize_history(&raw, &conv(), now()).unwrap();
        assert_eq!(msg.id, MessageId::server("42"));
        assert_eq!(msg.kind, MessageType::Video);
        assert_eq!(msg.body, "");
        let attachment = msg.attachment.unwrap();
        assert_eq!(attachment.url, "https://cdn.example.com/v.mp4");
        assert_eq!(attachment.format, "mp4");
        assert_eq!(msg.sent_at, now());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let raw = json!({ "messageId": "m1", "userId": "u1", "type": "STICKER" });
        let msg = normalize_history(&raw, &conv(), now()).unwrap();
        assert_eq!(msg.kind, MessageType::Text);
        assert_eq!(msg.body, "");
        assert_eq!(msg.sent_at, now());
        assert_eq!(msg.translated_body, None);
    }

    #[test]
    fn test_empty_translation_is_absent() {
        let raw = json!({
            "messageId": "m1", "userId": "u1", "messageText": "hi",
            "messageTextTranslate": "", "translatedText": "hola"
        });
        let msg = normalize_history(&raw, &conv(), now()).unwrap();
        assert_eq!(msg.translated_body.as_deref(), Some("hola"));
    }

    #[test]
    fn test_empty_strings_fall_through_to_next_name() {
        let raw = json!({
            "messageId": "", "id": "m1",
            "userId": "", "senderId": "u2",
            "messageText": "", "originalText": "hi"
        });
        let msg = normalize_history(&raw, &conv(), now()).unwrap();
        assert_eq!(msg.id, MessageId::Server("m1".into()));
        assert_eq!(msg.sender_id, UserId::new("u2"));
        assert_eq!(msg.body, "hi");

        let raw = json!({ "messageId": "", "userId": "u1" });
        assert_eq!(normalize_history(&raw, &conv(), now()), Err(NormalizeError::MissingId));
    }

    #[test]
    fn test_attachment_kind_with_plain_text_keeps_body() {
        let raw = json!({ "messageId": "m1", "userId": "u1", "type": "IMAGE", "messageText": "not a url" });
        let msg = normalize_history(&raw, &conv(), now()).unwrap();
        assert_eq!(msg.body, "not a url");
        assert!(msg.attachment.is_none());

        let raw = json!({ "messageId": "m2", "userId": "u1", "type": "TEXT", "messageText": "https://x.io" });
        let msg = normalize_history(&raw, &conv(), now()).unwrap();
        assert_eq!(msg.body, "https://x.io");
        assert!(msg.attachment.is_none());
    }

    #[test]
    fn test_history_errors() {
        assert_eq!(normalize_history(&json!("text"), &conv(), now()), Err(NormalizeError::NotAnObject));
        assert_eq!(
            normalize_history(&json!({ "userId": "u1" }), &conv(), now()),
            Err(NormalizeError::MissingId)
        );
        assert_eq!(
            normalize_history(&json!({ "messageId": "m1" }), &conv(), now()),
            Err(NormalizeError::MissingSender)
        );
    }

    #[test]
    fn test_push_partial_translation() {
        let raw = json!({ "messageId": "m2", "translatedText": "hola" });
        let update = normalize_push(&raw, Some(&conv())).unwrap();
        assert_eq!(update.conversation_id, conv());
        assert_eq!(update.translated_body.as_deref(), Some("hola"));
        assert_eq!(update.sender_id, None);
        assert_eq!(update.kind, None);
        assert_eq!(update.body, None);
    }

    #[test]
    fn test_push_conversation_precedence() {
        let raw = json!({ "messageId": "m1", "conversationId": "c9" });
        assert_eq!(normalize_push(&raw, Some(&conv())).unwrap().conversation_id, ConversationId::new("c9"));

        let raw = json!({ "messageId": "m1" });
        assert_eq!(normalize_push(&raw, None), Err(NormalizeError::MissingConversation));
    }

    #[test]
    fn test_push_correlation() {
        let token = CorrelationToken::generate();
        let raw = json!({ "messageId": "m1", "conversationId": "c1", "correlationId": token.to_string() });
        assert_eq!(normalize_push(&raw, None).unwrap().correlation, Some(token));

        let raw = json!({ "messageId": "m1", "conversationId": "c1", "correlationId": "garbage" });
        assert_eq!(normalize_push(&raw, None).unwrap().correlation, None);
    }

    #[test]
    fn test_draft_is_pending() {
        let token = CorrelationToken::generate();
        let draft = Draft::attachment(MessageType::Image, " https://cdn.example.com/a.png ");
        let msg = normalize_draft(&draft, &UserId::new("me"), &conv(), token, now());
        assert_eq!(msg.id, MessageId::Pending(token));
        assert_eq!(msg.delivery, Delivery::Pending);
        assert_eq!(msg.body, "");
        assert_eq!(msg.attachment.unwrap().url, "https://cdn.example.com/a.png");

        let msg = normalize_draft(&Draft::text("  hi "), &UserId::new("me"), &conv(), token, now());
        assert_eq!(msg.body, "hi");
        assert!(msg.translation_pending());
    }

    #[test]
    fn test_summary_from_list_item() {
        let raw = json!({
            "conversationId": "c1",
            "messageId": "m5",
            "userId": "u2",
            "messageText": "see you",
            "sentDatetime": "2025-02-01 08:30:00",
            "userProfiles": [
                { "userId": "u2", "username": "bob", "fullName": "Bob", "avatarUrl": "https://a/b.png" },
                { "userId": "u2", "username": "bob" },
                { "username": "nobody" }
            ]
        });
        let summary = normalize_summary(&raw, now()).unwrap();
        assert_eq!(summary.id, conv());
        assert_eq!(summary.kind, ConversationKind::Direct);
        assert_eq!(summary.participants.len(), 1);
        assert_eq!(summary.participants[0].display_name(), Some("Bob"));
        let last = summary.last_message.unwrap();
        assert_eq!(last.id, MessageId::server("m5"));
        assert_eq!(last.sent_at, Utc.with_ymd_and_hms(2025, 2, 1, 8, 30, 0).unwrap());
    }

    #[test]
    fn test_summary_from_action_result() {
        let raw = json!({
            "id": "g1",
            "conversationType": "GROUP",
            "conversationName": "Team",
            "locale": "es",
            "participants": [{ "id": "u1" }, { "id": "u2" }]
        });
        let summary = normalize_summary(&raw, now()).unwrap();
        assert_eq!(summary.id, ConversationId::new("g1"));
        assert_eq!(summary.kind, ConversationKind::Group);
        assert_eq!(summary.display_name.as_deref(), Some("Team"));
        assert_eq!(summary.locale.as_deref(), Some("es"));
        assert_eq!(summary.participants.len(), 2);
        assert!(summary.last_message.is_none());

        assert_eq!(
            normalize_summary(&json!({ "userId": "u1" }), now()),
            Err(NormalizeError::MissingConversation)
        );
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(parse_timestamp(&json!("2025-03-01T10:00:00Z")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2025-03-01T12:00:00+02:00")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2025-03-01T10:00:00")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2025-03-01 10:00:00")), Some(expected));
        assert_eq!(parse_timestamp(&json!(expected.timestamp_millis())), Some(expected));
        assert_eq!(parse_timestamp(&json!([2025, 3, 1, 10, 0, 0])), Some(expected));
        assert!(parse_timestamp(&json!("2025-03-01T10:00:00.250")).is_some());
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!(true)), None);
    }

    #[test]
    fn test_is_http_url() {
        assert!(is_http_url("https://cdn.example.com/a.png"));
        assert!(is_http_url("http://x.io"));
        assert!(!is_http_url("ftp://x.io/file"));
        assert!(!is_http_url("hello world"));
        assert!(!is_http_url(""));
    }
}
