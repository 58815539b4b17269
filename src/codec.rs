//! Wire format for messages, records and recommendation payloads.
//!
//! The repository stores recommendations as encoded text. Everything going
//! out is encoded here and everything coming back is decoded here, so the rest
//! of the crate only ever sees [`Recommendation`] values with their required
//! fields filled.

use crate::types::{
    ChatMode, ConversationRecord, ConversationSummary, ConversationType, Message,
    NewConversation, Recommendation, RecommendationPayload, Sender, timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

pub const DEFAULT_PLANT: &str = "Plante non spécifiée";
pub const DEFAULT_DOSAGE: &str = "Dosage non spécifié";
pub const DEFAULT_PREPARATION: &str = "Préparation non spécifiée";
/// Stands in for a missing image; the display layer treats it as "no image".
pub const DEFAULT_IMAGE_URL: &str = "/placeholder.svg";
pub const DEFAULT_EXPLANATION: &str = "Détails non disponibles";
pub const DEFAULT_CONTRAINDICATIONS: &str = "Aucune contre-indication connue";
pub const DEFAULT_UNSPECIFIED: &str = "Non spécifié";

const UNTITLED_RECORD: &str = "Conversation sans titre";
const NO_SUMMARY: &str = "Pas de résumé disponible";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("recommendation could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

fn fill(slot: &mut String, default: &str) -> bool {
    if slot.trim().is_empty() {
        *slot = default.to_string();
        true
    } else {
        false
    }
}

/// Fills every empty required field with its fixed default.
///
/// Returns the number of fields that were filled. Fields that already hold a
/// value are never touched, so applying this twice is the same as once.
pub fn fill_defaults(rec: &mut Recommendation) -> usize {
    [
        fill(&mut rec.plant, DEFAULT_PLANT),
        fill(&mut rec.dosage, DEFAULT_DOSAGE),
        fill(&mut rec.preparation, DEFAULT_PREPARATION),
        fill(&mut rec.image_url, DEFAULT_IMAGE_URL),
        fill(&mut rec.explanation, DEFAULT_EXPLANATION),
        fill(&mut rec.contraindications, DEFAULT_CONTRAINDICATIONS),
        fill(&mut rec.part_used, DEFAULT_UNSPECIFIED),
        fill(&mut rec.components, DEFAULT_UNSPECIFIED),
        fill(&mut rec.local_name, DEFAULT_UNSPECIFIED),
    ]
    .into_iter()
    .filter(|filled| *filled)
    .count()
}

pub fn with_defaults(mut rec: Recommendation) -> Recommendation {
    let filled = fill_defaults(&mut rec);
    if filled > 0 {
        tracing::debug!(plant = %rec.plant, filled, "filled missing recommendation fields");
    }
    rec
}

pub fn encode_recommendation(rec: &Recommendation) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&with_defaults(rec.clone()))?)
}

/// Text form of a payload. Unreadable payloads are written back as received.
pub fn encode_payload(payload: &RecommendationPayload) -> Result<String, CodecError> {
    match payload {
        RecommendationPayload::Structured(rec) => encode_recommendation(rec),
        RecommendationPayload::Unreadable(raw) => Ok(raw.clone()),
    }
}

/// Decodes a payload that may be encoded text or an already-decoded object.
pub fn decode_payload(value: &Value) -> Option<RecommendationPayload> {
    match value {
        Value::Null => None,
        Value::Object(_) => Some(decode_object(value)),
        Value::String(text) => decode_text(text),
        other => {
            tracing::warn!(kind = value_kind(other), "recommendation payload has unexpected type");
            Some(RecommendationPayload::Unreadable(other.to_string()))
        }
    }
}

fn decode_text(text: &str) -> Option<RecommendationPayload> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(inner @ Value::Object(_)) => Some(decode_object(&inner)),
        // Encoded twice by an older client.
        Ok(Value::String(inner)) if inner.trim() != trimmed => decode_text(&inner),
        Ok(_) | Err(_) => {
            tracing::warn!("recommendation text is not a JSON object, keeping it verbatim");
            Some(RecommendationPayload::Unreadable(text.to_string()))
        }
    }
}

fn decode_object(value: &Value) -> RecommendationPayload {
    match serde_json::from_value::<Recommendation>(value.clone()) {
        Ok(rec) => RecommendationPayload::Structured(with_defaults(rec)),
        Err(err) => {
            tracing::warn!(error = %err, "recommendation object does not match the expected shape");
            RecommendationPayload::Unreadable(value.to_string())
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================
// Wire types
// ============================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub content: String,
    pub sender: Sender,
    #[serde(default, with = "timestamp::option")]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consultation_id: Option<String>,
}

impl WireMessage {
    pub fn from_message(message: &Message) -> Result<Self, CodecError> {
        let recommendation = message
            .recommendation
            .as_ref()
            .map(encode_payload)
            .transpose()?
            .map(Value::String);
        Ok(Self {
            id: None,
            content: message.content.clone(),
            sender: message.sender,
            timestamp: Some(message.timestamp),
            recommendation,
            consultation_id: None,
        })
    }

    /// Converts a message read back from the repository. Such a message is
    /// persisted by definition, so it always gets a `remote_id`.
    pub fn into_message(self) -> Message {
        let recommendation = self.recommendation.as_ref().and_then(decode_payload);
        let mut message = match self.sender {
            Sender::User => Message::user(self.content),
            Sender::Bot => Message::bot(self.content, None),
        };
        message.recommendation = recommendation;
        if let Some(ts) = self.timestamp {
            message.timestamp = ts;
        }
        if let Some(id) = self.id {
            message.id = id;
        }
        message.remote_id = Some(message.id.clone());
        message
    }
}

#[derive(Debug, Serialize)]
pub struct WireDraft {
    pub title: String,
    pub summary: String,
    #[serde(rename = "type")]
    pub kind: ConversationType,
    pub messages: Vec<WireMessage>,
    pub messages_count: usize,
    pub chat_mode: ChatMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_recommendation: Option<Value>,
}

impl WireDraft {
    pub fn from_draft(draft: &NewConversation) -> Result<Self, CodecError> {
        let messages = draft
            .messages
            .iter()
            .map(WireMessage::from_message)
            .collect::<Result<Vec<_>, _>>()?;
        let last_recommendation = draft
            .last_recommendation
            .as_ref()
            .map(encode_recommendation)
            .transpose()?
            .map(Value::String);
        Ok(Self {
            title: draft.title.clone(),
            summary: draft.summary.clone(),
            kind: draft.kind,
            messages_count: messages.len(),
            messages,
            chat_mode: draft.chat_mode,
            last_recommendation,
        })
    }
}

/// Record as returned by either resource family. Consultations carry `date`
/// where conversations carry `created_at`; both are accepted.
#[derive(Debug, Deserialize)]
pub struct WireRecord {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<WireMessage>>,
    #[serde(default)]
    pub messages_count: Option<usize>,
    #[serde(default)]
    pub chat_mode: Option<String>,
    #[serde(default, with = "timestamp::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "timestamp::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default, with = "timestamp::option")]
    pub date: Option<OffsetDateTime>,
    #[serde(default)]
    pub last_recommendation: Option<Value>,
}

impl WireRecord {
    fn kind(&self) -> ConversationType {
        self.kind
            .as_deref()
            .and_then(|k| k.parse().ok())
            .unwrap_or_default()
    }

    fn chat_mode(&self) -> ChatMode {
        self.chat_mode
            .as_deref()
            .and_then(|m| m.parse().ok())
            .unwrap_or_default()
    }

    fn count(&self) -> usize {
        match (self.messages_count, &self.messages) {
            (Some(count), _) if count > 0 => count,
            (_, Some(messages)) => messages.len(),
            (count, None) => count.unwrap_or(0),
        }
    }

    fn title(&self) -> String {
        self.title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| UNTITLED_RECORD.to_string())
    }

    pub fn into_record(self) -> ConversationRecord {
        let kind = self.kind();
        let chat_mode = self.chat_mode();
        let title = self.title();
        let created_at = self.created_at.or(self.date);
        let messages: Vec<Message> = self
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(WireMessage::into_message)
            .collect();
        ConversationRecord {
            id: self.id,
            title,
            kind,
            summary: self.summary,
            messages_count: self.messages_count.unwrap_or(messages.len()).max(messages.len()),
            messages,
            chat_mode,
            created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn into_summary(self) -> ConversationSummary {
        let kind = self.kind();
        let chat_mode = self.chat_mode();
        let title = self.title();
        let messages_count = self.count();
        let last_recommendation = self
            .last_recommendation
            .as_ref()
            .and_then(decode_payload)
            .and_then(|p| p.structured().cloned());
        ConversationSummary {
            id: self.id,
            title,
            kind,
            summary: self
                .summary
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| NO_SUMMARY.to_string()),
            messages_count,
            chat_mode,
            created_at: self.created_at.or(self.date),
            updated_at: self.updated_at.or(self.created_at).or(self.date),
            last_recommendation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn complete() -> Recommendation {
        Recommendation {
            plant: "Moringa".into(),
            dosage: "2 tasses par jour".into(),
            preparation: "Infusion".into(),
            image_url: "https://img.example/moringa.jpg".into(),
            explanation: "Diagnostic possible\nFatigue".into(),
            contraindications: "Grossesse".into(),
            part_used: "Feuilles".into(),
            components: "Vitamine C".into(),
            local_name: "Arzantiga".into(),
            diagnosis: Some("Fatigue chronique".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaulting_is_idempotent() {
        let partial = Recommendation {
            plant: "Kinkeliba".into(),
            ..Default::default()
        };
        let once = with_defaults(partial);
        let twice = with_defaults(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once.plant, "Kinkeliba");
        assert_eq!(once.dosage, DEFAULT_DOSAGE);
        assert_eq!(once.local_name, DEFAULT_UNSPECIFIED);

        let mut again = twice.clone();
        assert_eq!(fill_defaults(&mut again), 0);
    }

    #[test]
    fn test_blank_fields_count_as_missing() {
        let mut rec = Recommendation {
            plant: "   ".into(),
            ..Default::default()
        };
        assert_eq!(fill_defaults(&mut rec), 9);
        assert_eq!(rec.plant, DEFAULT_PLANT);
        assert_eq!(rec.image_url, DEFAULT_IMAGE_URL);
    }

    #[test]
    fn test_encode_then_decode_preserves_complete_record() {
        let original = complete();
        let text = encode_recommendation(&original).unwrap();
        let decoded = decode_payload(&Value::String(text));
        assert_eq!(decoded, Some(RecommendationPayload::Structured(original)));
    }

    #[test]
    fn test_decode_accepts_already_decoded_object() {
        let value = json!({"plant": "Neem", "prep": "Décoction"});
        let Some(RecommendationPayload::Structured(rec)) = decode_payload(&value) else {
            panic!("expected structured payload");
        };
        assert_eq!(rec.plant, "Neem");
        assert_eq!(rec.preparation, "Décoction");
        assert_eq!(rec.dosage, DEFAULT_DOSAGE);
    }

    #[test]
    fn test_decode_double_encoded_text() {
        let inner = serde_json::to_string(&json!({"plant": "Neem"})).unwrap();
        let outer = serde_json::to_string(&inner).unwrap();
        let payload = decode_payload(&Value::String(outer));
        assert_eq!(
            payload.and_then(|p| p.structured().map(|r| r.plant.clone())),
            Some("Neem".to_string())
        );
    }

    #[test]
    fn test_decode_garbage_is_kept_verbatim() {
        let payload = decode_payload(&Value::String("not json".into()));
        assert_eq!(
            payload,
            Some(RecommendationPayload::Unreadable("not json".into()))
        );
        let encoded = encode_payload(&payload.unwrap()).unwrap();
        assert_eq!(encoded, "not json");

        assert!(matches!(
            decode_payload(&json!(42)),
            Some(RecommendationPayload::Unreadable(_))
        ));
        assert_eq!(decode_payload(&Value::Null), None);
        assert_eq!(decode_payload(&json!("")), None);
    }

    #[test]
    fn test_wire_message_encodes_recommendation_as_text() {
        let message = Message::bot("voici", Some(complete()));
        let wire = WireMessage::from_message(&message).unwrap();
        assert!(matches!(wire.recommendation, Some(Value::String(_))));

        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["sender"], "bot");
        assert!(json.get("id").is_none());
    }

    #[test]
    fn test_record_message_gets_remote_id_and_default_timestamp() {
        let wire: WireMessage = serde_json::from_value(json!({
            "id": "srv-1",
            "content": "bonjour",
            "sender": "user"
        }))
        .unwrap();
        let message = wire.into_message();
        assert_eq!(message.id, "srv-1");
        assert_eq!(message.remote_id.as_deref(), Some("srv-1"));
        assert_eq!(message.sender, Sender::User);
    }

    #[test]
    fn test_summary_defaults() {
        let wire: WireRecord = serde_json::from_value(json!({
            "id": "c1",
            "title": "",
            "messages": [
                {"content": "a", "sender": "user"},
                {"content": "b", "sender": "bot"}
            ],
            "created_at": "2024-12-10T08:00:00"
        }))
        .unwrap();
        let summary = wire.into_summary();
        assert_eq!(summary.title, UNTITLED_RECORD);
        assert_eq!(summary.summary, NO_SUMMARY);
        assert_eq!(summary.kind, ConversationType::Mixed);
        assert_eq!(summary.chat_mode, ChatMode::Discussion);
        assert_eq!(summary.messages_count, 2);
        assert!(summary.updated_at.is_some());
    }

    #[test]
    fn test_consultation_record_uses_date() {
        let wire: WireRecord = serde_json::from_value(json!({
            "id": "c2",
            "title": "Toux",
            "type": "consultation",
            "date": "2024-12-15T10:00:00Z",
            "messages_count": 8
        }))
        .unwrap();
        let record = wire.into_record();
        assert_eq!(record.kind, ConversationType::Consultation);
        assert!(record.created_at.is_some());
        assert_eq!(record.messages_count, 8);
        assert!(record.messages.is_empty());
    }
}
