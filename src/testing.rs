//! In-memory collaborators for exercising the lifecycle without a server.
//!
//! Each fake records what it was asked to do so tests can assert on call
//! sequences.

use crate::backend::ChatBackend;
use crate::error::{ApiError, ApiResult};
use crate::repository::ConversationRepository;
use crate::session::{AuthError, Credential, SessionEvent, SessionStore, SignupRequest};
use crate::types::{
    ConversationPatch, ConversationRecord, ConversationSummary, Message, NewConversation,
    Recommendation, derive_summary, last_recommendation,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One call made against [`RecordingRepository`].
#[derive(Clone, Debug, PartialEq)]
pub enum RepoCall {
    Create { title: String, messages: usize },
    List,
    Get { id: String },
    Append { id: String, content: String },
    Update { id: String, patch: ConversationPatch },
    Delete { id: String },
}

/// How the next repository calls should fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    Server,
    Unauthorized,
}

impl Failure {
    fn error(self) -> ApiError {
        match self {
            Failure::Server => ApiError::Status {
                status: 500,
                body: "internal error".to_string(),
            },
            Failure::Unauthorized => ApiError::Unauthorized(401),
        }
    }
}

/// Repository that keeps records in memory and logs every call.
#[derive(Default)]
pub struct RecordingRepository {
    calls: Mutex<Vec<RepoCall>>,
    credentials: Mutex<Vec<Credential>>,
    records: Mutex<BTreeMap<String, ConversationRecord>>,
    next_id: AtomicUsize,
    failure: Mutex<Option<Failure>>,
    /// Appends succeed this many times before `failure` kicks in.
    fail_after_appends: Mutex<Option<usize>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(self, record: ConversationRecord) -> Self {
        lock(&self.records).insert(record.id.clone(), record);
        self
    }

    pub fn calls(&self) -> Vec<RepoCall> {
        lock(&self.calls).clone()
    }

    /// Credentials presented with each call, in call order.
    pub fn credentials(&self) -> Vec<Credential> {
        lock(&self.credentials).clone()
    }

    pub fn creates(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, RepoCall::Create { .. }))
            .count()
    }

    pub fn appends(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, RepoCall::Append { .. }))
            .count()
    }

    pub fn record(&self, id: &str) -> Option<ConversationRecord> {
        lock(&self.records).get(id).cloned()
    }

    pub fn fail_with(&self, failure: Option<Failure>) {
        *lock(&self.failure) = failure;
    }

    /// Lets `count` appends through, then fails every call with `failure`.
    pub fn fail_appends_after(&self, count: usize, failure: Failure) {
        *lock(&self.fail_after_appends) = Some(count);
        *lock(&self.failure) = Some(failure);
    }

    /// Makes every call sleep first.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    async fn enter(&self, call: RepoCall, credential: &Credential) -> ApiResult<()> {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let is_append = matches!(call, RepoCall::Append { .. });
        lock(&self.calls).push(call);
        lock(&self.credentials).push(credential.clone());

        if is_append {
            let mut remaining = lock(&self.fail_after_appends);
            if let Some(left) = remaining.as_mut()
                && *left > 0
            {
                *left -= 1;
                return Ok(());
            }
        }
        match *lock(&self.failure) {
            Some(failure) => Err(failure.error()),
            None => Ok(()),
        }
    }

    fn assign_id(&self) -> String {
        format!("rec-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

fn summarize(record: &ConversationRecord) -> ConversationSummary {
    ConversationSummary {
        id: record.id.clone(),
        title: record.title.clone(),
        kind: record.kind,
        summary: record
            .summary
            .clone()
            .unwrap_or_else(|| derive_summary(&record.messages)),
        messages_count: record.messages_count,
        chat_mode: record.chat_mode,
        created_at: record.created_at,
        updated_at: record.updated_at,
        last_recommendation: last_recommendation(&record.messages).cloned(),
    }
}

#[async_trait]
impl ConversationRepository for RecordingRepository {
    async fn create(
        &self,
        credential: &Credential,
        draft: &NewConversation,
    ) -> ApiResult<ConversationRecord> {
        self.enter(
            RepoCall::Create {
                title: draft.title.clone(),
                messages: draft.messages.len(),
            },
            credential,
        )
        .await?;
        let id = self.assign_id();
        let messages = draft
            .messages
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let mut stored = m.clone();
                stored.remote_id = Some(format!("{id}-m{i}"));
                stored.id = format!("{id}-m{i}");
                stored
            })
            .collect::<Vec<_>>();
        let now = time::OffsetDateTime::now_utc();
        let record = ConversationRecord {
            id: id.clone(),
            title: draft.title.clone(),
            kind: draft.kind,
            summary: Some(draft.summary.clone()),
            messages_count: messages.len(),
            messages,
            chat_mode: draft.chat_mode,
            created_at: Some(now),
            updated_at: Some(now),
        };
        lock(&self.records).insert(id, record.clone());
        Ok(record)
    }

    async fn list(&self, credential: &Credential) -> ApiResult<Vec<ConversationSummary>> {
        self.enter(RepoCall::List, credential).await?;
        Ok(lock(&self.records).values().map(summarize).collect())
    }

    async fn get(&self, credential: &Credential, id: &str) -> ApiResult<ConversationRecord> {
        self.enter(RepoCall::Get { id: id.to_string() }, credential)
            .await?;
        lock(&self.records)
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::Status {
                status: 404,
                body: format!("record {id} not found"),
            })
    }

    async fn append_message(
        &self,
        credential: &Credential,
        id: &str,
        message: &Message,
    ) -> ApiResult<String> {
        self.enter(
            RepoCall::Append {
                id: id.to_string(),
                content: message.content.clone(),
            },
            credential,
        )
        .await?;
        let mut records = lock(&self.records);
        let record = records.get_mut(id).ok_or_else(|| ApiError::Status {
            status: 404,
            body: format!("record {id} not found"),
        })?;
        let remote = format!("{id}-m{}", record.messages.len());
        let mut stored = message.clone();
        stored.remote_id = Some(remote.clone());
        record.messages.push(stored);
        record.messages_count = record.messages.len();
        record.updated_at = Some(time::OffsetDateTime::now_utc());
        Ok(remote)
    }

    async fn update(
        &self,
        credential: &Credential,
        id: &str,
        patch: &ConversationPatch,
    ) -> ApiResult<()> {
        self.enter(
            RepoCall::Update {
                id: id.to_string(),
                patch: patch.clone(),
            },
            credential,
        )
        .await?;
        if let Some(record) = lock(&self.records).get_mut(id) {
            if let Some(kind) = patch.kind {
                record.kind = kind;
            }
            if let Some(mode) = patch.chat_mode {
                record.chat_mode = mode;
            }
            if let Some(title) = &patch.title {
                record.title = title.clone();
            }
        }
        Ok(())
    }

    async fn delete(&self, credential: &Credential, id: &str) -> ApiResult<()> {
        self.enter(RepoCall::Delete { id: id.to_string() }, credential)
            .await?;
        lock(&self.records).remove(id);
        Ok(())
    }
}

/// Session whose credential is set directly by the test.
pub struct StaticSession {
    token: Mutex<Option<Credential>>,
    journal: Mutex<Vec<&'static str>>,
    events: broadcast::Sender<SessionEvent>,
}

impl StaticSession {
    pub fn signed_in(token: &str) -> Self {
        let session = Self::anonymous();
        *lock(&session.token) = Some(Credential::new(token));
        session
    }

    pub fn anonymous() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            token: Mutex::new(None),
            journal: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn set_token(&self, token: Option<&str>) {
        *lock(&self.token) = token.map(Credential::new);
    }

    /// Names of the logout-related calls made so far, in order.
    pub fn journal(&self) -> Vec<&'static str> {
        lock(&self.journal).clone()
    }

    fn note(&self, entry: &'static str) {
        lock(&self.journal).push(entry);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl SessionStore for StaticSession {
    fn token(&self) -> Option<Credential> {
        lock(&self.token).clone()
    }

    async fn login(&self, email: &str, password: &str) -> Result<(), AuthError> {
        if email.is_empty() {
            return Err(AuthError::EmptyField("email"));
        }
        if password.is_empty() {
            return Err(AuthError::EmptyField("password"));
        }
        self.set_token(Some(format!("token-{email}").as_str()));
        self.note("login");
        self.emit(SessionEvent::LoggedIn);
        Ok(())
    }

    async fn signup(&self, request: &SignupRequest) -> Result<(), AuthError> {
        if request.password != request.confirm_password {
            return Err(AuthError::PasswordMismatch);
        }
        self.login(&request.email, &request.password).await
    }

    fn begin_logout(&self) -> Option<Credential> {
        self.note("begin_logout");
        self.emit(SessionEvent::LoggingOut);
        self.token()
    }

    fn complete_logout(&self) {
        self.note("complete_logout");
        self.set_token(None);
        self.emit(SessionEvent::LoggedOut);
    }

    fn expire(&self) {
        self.note("expire");
        self.set_token(None);
        self.emit(SessionEvent::Expired);
    }

    async fn validate_token(&self) -> bool {
        self.is_authenticated()
    }

    async fn change_password(&self, _email: &str, new_password: &str) -> bool {
        self.is_authenticated() && !new_password.is_empty()
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// Backend answering every question with fixed content.
pub struct ScriptedBackend {
    answer: String,
    recommendation: Recommendation,
    down: AtomicBool,
    asked: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(answer: impl Into<String>, recommendation: Recommendation) -> Self {
        Self {
            answer: answer.into(),
            recommendation,
            down: AtomicBool::new(false),
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::Relaxed);
    }

    pub fn asked(&self) -> Vec<String> {
        lock(&self.asked).clone()
    }

    fn check(&self, text: &str) -> ApiResult<()> {
        lock(&self.asked).push(text.to_string());
        if self.down.load(Ordering::Relaxed) {
            return Err(ApiError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new(
            "Le moringa est riche en nutriments.",
            Recommendation {
                plant: "Moringa".to_string(),
                dosage: "1 cuillère par jour".to_string(),
                preparation: "Poudre dans de l'eau".to_string(),
                explanation: "Diagnostic possible\nCarence en fer".to_string(),
                ..Default::default()
            },
        )
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn discuss(&self, text: &str) -> ApiResult<String> {
        self.check(text)?;
        Ok(self.answer.clone())
    }

    async fn recommend(&self, symptoms: &str) -> ApiResult<Recommendation> {
        self.check(symptoms)?;
        Ok(self.recommendation.clone())
    }
}
