use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;

/// A conversation becomes eligible for persistence at this many messages.
pub const MIN_PERSISTABLE_MESSAGES: usize = 4;

const TITLE_CHARS: usize = 50;
const SUMMARY_CHARS: usize = 100;
const UNTITLED: &str = "Nouvelle conversation";
const NO_SUMMARY: &str = "Pas de résumé disponible";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

/// The UI mode a message was sent in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    #[default]
    Discussion,
    Consultation,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMode::Discussion => "discussion",
            ChatMode::Consultation => "consultation",
        }
    }
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discussion" => Ok(ChatMode::Discussion),
            "consultation" => Ok(ChatMode::Consultation),
            other => Err(format!("unknown chat mode '{other}'")),
        }
    }
}

/// What a conversation contains, derived from its bot messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Discussion,
    Consultation,
    #[default]
    Mixed,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::Discussion => "discussion",
            ConversationType::Consultation => "consultation",
            ConversationType::Mixed => "mixed",
        }
    }
}

impl FromStr for ConversationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discussion" => Ok(ConversationType::Discussion),
            "consultation" => Ok(ConversationType::Consultation),
            "mixed" => Ok(ConversationType::Mixed),
            other => Err(format!("unknown conversation type '{other}'")),
        }
    }
}

fn string_or_null<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// A plant remedy as produced by the recommendation backend.
///
/// Field names on the wire are the backend's (French) keys. The first nine
/// fields are required for display; the optional ones are pre-structured
/// sections that only some backend configurations fill in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(default, deserialize_with = "string_or_null")]
    pub plant: String,
    #[serde(default, deserialize_with = "string_or_null")]
    pub dosage: String,
    #[serde(default, rename = "prep", deserialize_with = "string_or_null")]
    pub preparation: String,
    #[serde(default, deserialize_with = "string_or_null")]
    pub image_url: String,
    #[serde(default, deserialize_with = "string_or_null")]
    pub explanation: String,
    #[serde(
        default,
        rename = "contre_indications",
        deserialize_with = "string_or_null"
    )]
    pub contraindications: String,
    #[serde(default, rename = "partie_utilisee", deserialize_with = "string_or_null")]
    pub part_used: String,
    #[serde(default, rename = "composants", deserialize_with = "string_or_null")]
    pub components: String,
    #[serde(default, rename = "nom_local", deserialize_with = "string_or_null")]
    pub local_name: String,

    #[serde(default, rename = "diagnostic", skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<String>,
    #[serde(default, rename = "symptomes", skip_serializing_if = "Option::is_none")]
    pub symptoms: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation: Option<String>,
    #[serde(default, rename = "mode_action", skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<String>,
    #[serde(
        default,
        rename = "traitement_info",
        skip_serializing_if = "Option::is_none"
    )]
    pub treatment_info: Option<String>,
    #[serde(
        default,
        rename = "precautions_info",
        skip_serializing_if = "Option::is_none"
    )]
    pub precautions: Option<String>,
    #[serde(
        default,
        rename = "composants_info",
        skip_serializing_if = "Option::is_none"
    )]
    pub components_info: Option<String>,
    #[serde(
        default,
        rename = "resume_traitement",
        skip_serializing_if = "Option::is_none"
    )]
    pub treatment_summary: Option<String>,
}

/// A recommendation attached to a message.
///
/// `Unreadable` keeps a payload the codec could not turn into a
/// [`Recommendation`] so it can be written back untouched and shown as a
/// placeholder instead of being silently dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecommendationPayload {
    Structured(Recommendation),
    Unreadable(String),
}

impl RecommendationPayload {
    pub fn structured(&self) -> Option<&Recommendation> {
        match self {
            RecommendationPayload::Structured(rec) => Some(rec),
            RecommendationPayload::Unreadable(_) => None,
        }
    }
}

static LOCAL_ID_SEQ: AtomicU64 = AtomicU64::new(1);

/// Client-side message id: creation time in milliseconds plus a process-wide
/// sequence number, so two messages created in the same millisecond differ.
pub fn next_local_id() -> String {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let seq = LOCAL_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{millis}-{seq}")
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: String,
    pub content: String,
    pub sender: Sender,
    pub timestamp: OffsetDateTime,
    pub recommendation: Option<RecommendationPayload>,
    /// Id the repository assigned to this message. `None` until persisted.
    pub remote_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Sender::User, content.into(), None)
    }

    pub fn bot(content: impl Into<String>, recommendation: Option<Recommendation>) -> Self {
        Self::new(
            Sender::Bot,
            content.into(),
            recommendation.map(RecommendationPayload::Structured),
        )
    }

    fn new(sender: Sender, content: String, recommendation: Option<RecommendationPayload>) -> Self {
        Self {
            id: next_local_id(),
            content,
            sender,
            timestamp: OffsetDateTime::now_utc(),
            recommendation,
            remote_id: None,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.remote_id.is_some()
    }

    pub fn recommendation(&self) -> Option<&Recommendation> {
        self.recommendation.as_ref().and_then(|p| p.structured())
    }
}

/// Full repository record, with messages.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationRecord {
    pub id: String,
    pub title: String,
    pub kind: ConversationType,
    pub summary: Option<String>,
    pub messages: Vec<Message>,
    pub messages_count: usize,
    pub chat_mode: ChatMode,
    pub created_at: Option<OffsetDateTime>,
    pub updated_at: Option<OffsetDateTime>,
}

/// Listing form of a record; message bodies are not required.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub kind: ConversationType,
    pub summary: String,
    pub messages_count: usize,
    pub chat_mode: ChatMode,
    pub created_at: Option<OffsetDateTime>,
    pub updated_at: Option<OffsetDateTime>,
    pub last_recommendation: Option<Recommendation>,
}

/// Everything the repository needs to create a record.
#[derive(Clone, Debug, PartialEq)]
pub struct NewConversation {
    pub title: String,
    pub summary: String,
    pub kind: ConversationType,
    pub messages: Vec<Message>,
    pub chat_mode: ChatMode,
    pub last_recommendation: Option<Recommendation>,
}

impl NewConversation {
    pub fn from_messages(messages: &[Message], chat_mode: ChatMode) -> Self {
        Self {
            title: derive_title(messages),
            summary: derive_summary(messages),
            kind: classify(messages),
            messages: messages.to_vec(),
            chat_mode,
            last_recommendation: last_recommendation(messages).cloned(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn messages_count(&self) -> usize {
        self.messages.len()
    }
}

/// Partial update of a record's metadata. Unset fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConversationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ConversationType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_mode: Option<ChatMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages_count: Option<usize>,
}

impl ConversationPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.summary.is_none()
            && self.kind.is_none()
            && self.chat_mode.is_none()
            && self.messages_count.is_none()
    }
}

fn excerpt(text: &str, limit: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(limit).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn first_user_message(messages: &[Message]) -> Option<&Message> {
    messages.iter().find(|m| m.sender == Sender::User)
}

pub fn derive_title(messages: &[Message]) -> String {
    first_user_message(messages)
        .map(|m| excerpt(&m.content, TITLE_CHARS))
        .unwrap_or_else(|| UNTITLED.to_string())
}

pub fn derive_summary(messages: &[Message]) -> String {
    first_user_message(messages)
        .map(|m| excerpt(&m.content, SUMMARY_CHARS))
        .unwrap_or_else(|| NO_SUMMARY.to_string())
}

pub fn classify(messages: &[Message]) -> ConversationType {
    let bots = messages.iter().filter(|m| m.sender == Sender::Bot);
    let (mut with_rec, mut without_rec) = (false, false);
    for message in bots {
        if message.recommendation.is_some() {
            with_rec = true;
        } else {
            without_rec = true;
        }
    }
    match (with_rec, without_rec) {
        (true, true) => ConversationType::Mixed,
        (true, false) => ConversationType::Consultation,
        _ => ConversationType::Discussion,
    }
}

pub fn last_recommendation(messages: &[Message]) -> Option<&Recommendation> {
    messages.iter().rev().find_map(Message::recommendation)
}

/// At least four messages, with both a user and a bot turn.
pub fn is_persistable(messages: &[Message]) -> bool {
    messages.len() >= MIN_PERSISTABLE_MESSAGES
        && messages.iter().any(|m| m.sender == Sender::User)
        && messages.iter().any(|m| m.sender == Sender::Bot)
}

/// Timestamp (de)serialization tolerant of the backend's naive ISO strings.
pub mod timestamp {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::format_description::FormatItem;
    use time::format_description::well_known::Rfc3339;
    use time::macros::format_description;
    use time::{OffsetDateTime, PrimitiveDateTime};

    // Python's `datetime.isoformat()` without an offset; treated as UTC.
    const NAIVE_ISO: &[FormatItem<'static>] = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
    );

    pub fn parse(raw: &str) -> Option<OffsetDateTime> {
        let raw = raw.trim();
        if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
            return Some(parsed);
        }
        PrimitiveDateTime::parse(raw, NAIVE_ISO)
            .ok()
            .map(PrimitiveDateTime::assume_utc)
    }

    pub fn format(value: &OffsetDateTime) -> String {
        value.format(&Rfc3339).unwrap_or_default()
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(value: &Option<OffsetDateTime>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(value) => serializer.serialize_some(&format(value)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = Option::<String>::deserialize(deserializer)?;
            Ok(raw.as_deref().and_then(parse))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bot_with_rec() -> Message {
        Message::bot(
            "voici",
            Some(Recommendation {
                plant: "Moringa".into(),
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_title_truncates_with_ellipsis() {
        let long = "a".repeat(60);
        let messages = vec![Message::bot("bonjour", None), Message::user(long)];
        let title = derive_title(&messages);
        assert_eq!(title, format!("{}...", "a".repeat(50)));

        let short = vec![Message::user("J'ai mal à la tête")];
        assert_eq!(derive_title(&short), "J'ai mal à la tête");
        assert_eq!(derive_title(&[]), "Nouvelle conversation");
    }

    #[test]
    fn test_title_counts_characters_not_bytes() {
        let text = "é".repeat(50);
        let messages = vec![Message::user(text.clone())];
        assert_eq!(derive_title(&messages), text);
    }

    #[test]
    fn test_summary_uses_first_hundred_chars() {
        let messages = vec![Message::user("x".repeat(150))];
        assert_eq!(derive_summary(&messages), format!("{}...", "x".repeat(100)));
    }

    #[test]
    fn test_classify() {
        let mixed = vec![
            Message::user("q"),
            bot_with_rec(),
            Message::user("q2"),
            Message::bot("plain", None),
        ];
        assert_eq!(classify(&mixed), ConversationType::Mixed);

        let consult = vec![Message::user("q"), bot_with_rec(), bot_with_rec()];
        assert_eq!(classify(&consult), ConversationType::Consultation);

        let discussion = vec![Message::user("q"), Message::bot("a", None)];
        assert_eq!(classify(&discussion), ConversationType::Discussion);
        assert_eq!(classify(&[]), ConversationType::Discussion);
    }

    #[test]
    fn test_persistable_threshold() {
        let three = vec![
            Message::user("a"),
            Message::bot("b", None),
            Message::user("c"),
        ];
        assert!(!is_persistable(&three));

        let only_users: Vec<Message> = (0..5).map(|i| Message::user(format!("{i}"))).collect();
        assert!(!is_persistable(&only_users));

        let mut four = three.clone();
        four.push(Message::bot("d", None));
        assert!(is_persistable(&four));
    }

    #[test]
    fn test_local_ids_are_unique() {
        let a = Message::user("a");
        let b = Message::user("a");
        assert_ne!(a.id, b.id);
        assert!(!a.is_persisted());
    }

    #[test]
    fn test_new_conversation_picks_last_recommendation() {
        let mut second = bot_with_rec();
        if let Some(RecommendationPayload::Structured(rec)) = second.recommendation.as_mut() {
            rec.plant = "Kinkeliba".into();
        }
        let messages = vec![Message::user("q"), bot_with_rec(), Message::user("q2"), second];
        let draft = NewConversation::from_messages(&messages, ChatMode::Consultation);
        assert_eq!(draft.kind, ConversationType::Consultation);
        assert_eq!(draft.messages_count(), 4);
        assert_eq!(
            draft.last_recommendation.map(|r| r.plant),
            Some("Kinkeliba".to_string())
        );
    }

    #[test]
    fn test_timestamp_parsing() {
        assert!(timestamp::parse("2024-12-15T10:20:30Z").is_some());
        assert!(timestamp::parse("2024-12-15T10:20:30.123456").is_some());
        assert!(timestamp::parse("2024-12-15T10:20:30+01:00").is_some());
        assert!(timestamp::parse("yesterday").is_none());
    }

    #[test]
    fn test_recommendation_accepts_null_fields() {
        let rec: Recommendation =
            serde_json::from_str(r#"{"plant": "Moringa", "dosage": null}"#).unwrap();
        assert_eq!(rec.plant, "Moringa");
        assert_eq!(rec.dosage, "");
        assert_eq!(rec.diagnosis, None);
    }
}
