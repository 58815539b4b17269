//! Server-side storage of conversation records.

use crate::codec::{WireDraft, WireMessage, WireRecord};
use crate::error::{self, ApiResult};
use crate::session::Credential;
use crate::types::{ConversationPatch, ConversationRecord, ConversationSummary, Message, NewConversation};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// The two REST resource families the backend exposes for the same records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResourceFamily {
    Consultations,
    #[default]
    Conversations,
}

impl ResourceFamily {
    pub fn segment(&self) -> &'static str {
        match self {
            ResourceFamily::Consultations => "consultations",
            ResourceFamily::Conversations => "conversations",
        }
    }
}

impl fmt::Display for ResourceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

impl FromStr for ResourceFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "consultations" => Ok(ResourceFamily::Consultations),
            "conversations" => Ok(ResourceFamily::Conversations),
            other => Err(format!("unknown resource family '{other}'")),
        }
    }
}

/// CRUD over conversation records. Every call is made on behalf of an
/// explicit credential so a flush can run while logout is in progress.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn create(
        &self,
        credential: &Credential,
        draft: &NewConversation,
    ) -> ApiResult<ConversationRecord>;

    async fn list(&self, credential: &Credential) -> ApiResult<Vec<ConversationSummary>>;

    async fn get(&self, credential: &Credential, id: &str) -> ApiResult<ConversationRecord>;

    /// Appends one message and returns the id the server gave it.
    async fn append_message(
        &self,
        credential: &Credential,
        id: &str,
        message: &Message,
    ) -> ApiResult<String>;

    async fn update(
        &self,
        credential: &Credential,
        id: &str,
        patch: &ConversationPatch,
    ) -> ApiResult<()>;

    async fn delete(&self, credential: &Credential, id: &str) -> ApiResult<()>;
}

#[derive(Deserialize)]
struct AppendResponse {
    #[serde(default)]
    id: Option<String>,
}

/// Listing endpoints answer with either a bare array or a wrapped one.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListResponse {
    Bare(Vec<WireRecord>),
    Wrapped {
        #[serde(alias = "consultations", alias = "conversations", alias = "items")]
        records: Vec<WireRecord>,
    },
}

pub struct HttpConversationRepository {
    client: reqwest::Client,
    base_url: String,
    family: ResourceFamily,
}

impl HttpConversationRepository {
    pub fn new(base_url: impl Into<String>, family: ResourceFamily) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            family,
        }
    }

    pub fn family(&self) -> ResourceFamily {
        self.family
    }

    fn collection_url(&self) -> String {
        format!("{}/api/{}", self.base_url, self.family.segment())
    }

    fn record_url(&self, id: &str) -> String {
        format!("{}/{}", self.collection_url(), id)
    }

    fn read_url(&self, id: &str) -> String {
        match self.family {
            ResourceFamily::Conversations => format!("{}/messages", self.record_url(id)),
            ResourceFamily::Consultations => self.record_url(id),
        }
    }
}

#[async_trait]
impl ConversationRepository for HttpConversationRepository {
    async fn create(
        &self,
        credential: &Credential,
        draft: &NewConversation,
    ) -> ApiResult<ConversationRecord> {
        let body = WireDraft::from_draft(draft)?;
        tracing::debug!(
            family = %self.family,
            messages = body.messages_count,
            kind = draft.kind.as_str(),
            "creating record"
        );
        let response = self
            .client
            .post(self.collection_url())
            .bearer_auth(credential.expose())
            .json(&body)
            .send()
            .await?;
        let record: WireRecord = error::read_json(response).await?;
        Ok(record.into_record())
    }

    async fn list(&self, credential: &Credential) -> ApiResult<Vec<ConversationSummary>> {
        let response = self
            .client
            .get(self.collection_url())
            .bearer_auth(credential.expose())
            .send()
            .await?;
        let records = match error::read_json(response).await? {
            ListResponse::Bare(records) | ListResponse::Wrapped { records } => records,
        };
        Ok(records.into_iter().map(WireRecord::into_summary).collect())
    }

    async fn get(&self, credential: &Credential, id: &str) -> ApiResult<ConversationRecord> {
        let response = self
            .client
            .get(self.read_url(id))
            .bearer_auth(credential.expose())
            .send()
            .await?;
        let record: WireRecord = error::read_json(response).await?;
        Ok(record.into_record())
    }

    async fn append_message(
        &self,
        credential: &Credential,
        id: &str,
        message: &Message,
    ) -> ApiResult<String> {
        let mut body = WireMessage::from_message(message)?;
        body.consultation_id = Some(id.to_string());
        let response = self
            .client
            .post(format!("{}/messages", self.record_url(id)))
            .bearer_auth(credential.expose())
            .json(&body)
            .send()
            .await?;
        let text = error::read_body(response).await?;
        // Older servers answer with an empty body or without an id.
        let assigned = serde_json::from_str::<AppendResponse>(&text)
            .ok()
            .and_then(|r| r.id)
            .unwrap_or_else(|| message.id.clone());
        Ok(assigned)
    }

    async fn update(
        &self,
        credential: &Credential,
        id: &str,
        patch: &ConversationPatch,
    ) -> ApiResult<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let response = self
            .client
            .put(self.record_url(id))
            .bearer_auth(credential.expose())
            .json(patch)
            .send()
            .await?;
        error::read_body(response).await?;
        Ok(())
    }

    async fn delete(&self, credential: &Credential, id: &str) -> ApiResult<()> {
        let response = self
            .client
            .delete(self.record_url(id))
            .bearer_auth(credential.expose())
            .send()
            .await?;
        error::read_body(response).await?;
        tracing::info!(family = %self.family, record = id, "deleted record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_per_family() {
        let conversations = HttpConversationRepository::new("http://api/", ResourceFamily::Conversations);
        assert_eq!(conversations.collection_url(), "http://api/api/conversations");
        assert_eq!(conversations.read_url("42"), "http://api/api/conversations/42/messages");

        let consultations = HttpConversationRepository::new("http://api", ResourceFamily::Consultations);
        assert_eq!(consultations.read_url("42"), "http://api/api/consultations/42");
        assert_eq!(consultations.record_url("42"), "http://api/api/consultations/42");
    }

    #[test]
    fn test_family_parsing() {
        assert_eq!("Consultations".parse(), Ok(ResourceFamily::Consultations));
        assert!("notes".parse::<ResourceFamily>().is_err());
    }

    #[test]
    fn test_list_response_shapes() {
        let bare: ListResponse = serde_json::from_str(r#"[{"id": "a"}]"#).unwrap();
        assert!(matches!(bare, ListResponse::Bare(ref r) if r.len() == 1));
        let wrapped: ListResponse =
            serde_json::from_str(r#"{"consultations": [{"id": "a"}, {"id": "b"}]}"#).unwrap();
        assert!(matches!(wrapped, ListResponse::Wrapped { ref records } if records.len() == 2));
    }
}
