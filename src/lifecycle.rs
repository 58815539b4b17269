//! Conversation lifecycle.
//!
//! [`ConversationLifecycle`] owns the message list of the active chat session
//! and keeps it reconciled with the repository. Persistence is best-effort:
//! failed saves are logged and the chat carries on. The one exception is
//! [`ConversationLifecycle::restore_from_record`], which reports its failure.
//!
//! A reply is produced in three steps so the caller is free to keep accepting
//! input while the backend thinks:
//!
//! 1. [`ConversationLifecycle::append_user_message`] records the user turn and
//!    hands back a [`PendingReply`].
//! 2. [`PendingReply::resolve`] asks the backend; it borrows nothing from the
//!    lifecycle.
//! 3. [`ConversationLifecycle::accept_reply`] records the bot turn and saves.
//!
//! Replies are tagged with the generation they were issued for. Once the
//! session is reset or replaced, replies from the previous generation are
//! dropped.

use crate::backend::{self, ChatBackend, Reply};
use crate::error::ApiError;
use crate::repository::ConversationRepository;
use crate::session::{Credential, SessionEvent, SessionStore};
use crate::types::{
    ChatMode, ConversationPatch, ConversationType, Message, NewConversation, Recommendation,
    classify, is_persistable,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LOGOUT_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("not signed in")]
    NotAuthenticated,
    #[error("could not load conversation {id}: {source}")]
    Restore {
        id: String,
        #[source]
        source: ApiError,
    },
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Where the active session stands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No messages yet.
    Fresh,
    /// Has messages, no repository record.
    ActiveUnsaved,
    /// The user chose to chat without signing in. Nothing is saved.
    ActiveAnonymous,
    /// Backed by a record created in this session.
    ActiveBound { record_id: String },
    /// Loaded from a saved record. Never re-created, only appended to.
    RestoredFromHistory { record_id: String },
    /// The user tried to send while signed out and has to choose between
    /// signing in and continuing anonymously. `resume` is the state to go
    /// back to once they decide.
    PendingAuthDecision {
        pending_text: String,
        resume: Box<SessionState>,
    },
}

impl SessionState {
    pub fn record_id(&self) -> Option<&str> {
        match self {
            SessionState::ActiveBound { record_id }
            | SessionState::RestoredFromHistory { record_id } => Some(record_id),
            SessionState::PendingAuthDecision { resume, .. } => resume.record_id(),
            _ => None,
        }
    }
}

/// Why a reconcile made no repository call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    BelowThreshold,
    NotAuthenticated,
    Anonymous,
    StaleReply,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Skipped(SkipReason),
    Created {
        record_id: String,
    },
    Appended {
        record_id: String,
        appended: usize,
        failed: usize,
    },
    UpToDate {
        record_id: String,
    },
    /// The repository refused the save. Already logged.
    Failed,
    /// The bounded pre-logout flush ran out of time.
    TimedOut,
}

impl ReconcileOutcome {
    pub fn made_calls(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::Created { .. }
                | ReconcileOutcome::Appended { .. }
                | ReconcileOutcome::Failed
                | ReconcileOutcome::TimedOut
        )
    }
}

/// A user turn waiting for its bot reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingReply {
    generation: u64,
    text: String,
    mode: ChatMode,
}

impl PendingReply {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn mode(&self) -> ChatMode {
        self.mode
    }

    pub async fn resolve(self, backend: &dyn ChatBackend) -> BotReply {
        let reply = backend::ask(backend, self.mode, &self.text).await;
        BotReply {
            generation: self.generation,
            reply,
        }
    }
}

/// A backend reply tagged with the generation it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct BotReply {
    generation: u64,
    pub reply: Reply,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Dispatched(PendingReply),
    /// Nothing was appended; the text waits in
    /// [`SessionState::PendingAuthDecision`].
    AwaitingAuthDecision,
}

/// Result of [`ConversationLifecycle::send`].
#[derive(Clone, Debug, PartialEq)]
pub enum Exchange {
    Answered {
        reply: Reply,
        saved: ReconcileOutcome,
    },
    AwaitingAuthDecision,
}

/// What the lifecycle did in response to an authentication change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Flushed, then reset.
    Flushed(ReconcileOutcome),
    /// Flushed while the credential is still valid; state kept.
    Saved(ReconcileOutcome),
    /// A message held back for sign-in was sent.
    Replayed(PendingReply),
    Reset,
    Unchanged,
}

pub struct ConversationLifecycle {
    session: Arc<dyn SessionStore>,
    repository: Arc<dyn ConversationRepository>,
    backend: Arc<dyn ChatBackend>,
    messages: Vec<Message>,
    state: SessionState,
    chat_mode: ChatMode,
    generation: u64,
    /// Last credential seen while signed in, for flushing after it is gone.
    last_credential: Option<Credential>,
    last_error: Option<String>,
    logout_grace: Duration,
    /// Type and mode the bound record was last saved with.
    persisted_meta: Option<(ConversationType, ChatMode)>,
}

impl ConversationLifecycle {
    pub fn new(
        session: Arc<dyn SessionStore>,
        repository: Arc<dyn ConversationRepository>,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        Self {
            session,
            repository,
            backend,
            messages: Vec::new(),
            state: SessionState::Fresh,
            chat_mode: ChatMode::default(),
            generation: 0,
            last_credential: None,
            last_error: None,
            logout_grace: DEFAULT_LOGOUT_GRACE,
            persisted_meta: None,
        }
    }

    pub fn with_logout_grace(mut self, grace: Duration) -> Self {
        self.logout_grace = grace;
        self
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn chat_mode(&self) -> ChatMode {
        self.chat_mode
    }

    pub fn set_chat_mode(&mut self, mode: ChatMode) {
        if self.chat_mode != mode {
            tracing::debug!(from = %self.chat_mode, to = %mode, "chat mode changed");
            self.chat_mode = mode;
        }
    }

    pub fn bound_record_id(&self) -> Option<&str> {
        self.state.record_id()
    }

    pub fn is_restored_from_history(&self) -> bool {
        matches!(self.state, SessionState::RestoredFromHistory { .. })
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.state, SessionState::ActiveAnonymous)
    }

    /// Set when loading a saved conversation failed.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn backend(&self) -> Arc<dyn ChatBackend> {
        Arc::clone(&self.backend)
    }

    pub fn session(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.session)
    }

    fn remember_credential(&mut self) -> Option<Credential> {
        let credential = self.session.token();
        if credential.is_some() {
            self.last_credential = credential.clone();
        }
        credential
    }

    // ============================================
    // Messages
    // ============================================

    /// Records a user turn.
    ///
    /// Signed-out users who have not chosen to continue anonymously get
    /// [`SendOutcome::AwaitingAuthDecision`] and the text is held back.
    pub fn append_user_message(&mut self, text: &str) -> Result<SendOutcome, LifecycleError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(LifecycleError::EmptyMessage);
        }
        let signed_in = self.remember_credential().is_some();

        if !signed_in && !self.is_anonymous() {
            let resume = match std::mem::replace(&mut self.state, SessionState::Fresh) {
                SessionState::PendingAuthDecision { resume, .. } => resume,
                other => Box::new(other),
            };
            self.state = SessionState::PendingAuthDecision {
                pending_text: text.to_string(),
                resume,
            };
            tracing::info!("message held until the user signs in or continues anonymously");
            return Ok(SendOutcome::AwaitingAuthDecision);
        }

        // Signed in before the transition was reported: the held text goes first.
        if let Some(held) = self.take_held_message() {
            tracing::info!("recording message held before sign-in");
            self.messages.push(Message::user(held));
        }
        self.messages.push(Message::user(text));
        if self.state == SessionState::Fresh {
            self.state = SessionState::ActiveUnsaved;
        }
        Ok(SendOutcome::Dispatched(PendingReply {
            generation: self.generation,
            text: text.to_string(),
            mode: self.chat_mode,
        }))
    }

    /// Records a bot turn and saves the conversation when signed in.
    pub async fn append_bot_message(
        &mut self,
        content: impl Into<String>,
        recommendation: Option<Recommendation>,
    ) -> ReconcileOutcome {
        self.messages.push(Message::bot(content, recommendation));
        if self.state == SessionState::Fresh {
            self.state = SessionState::ActiveUnsaved;
        }
        if self.is_anonymous() {
            return ReconcileOutcome::Skipped(SkipReason::Anonymous);
        }
        if !self.session.is_authenticated() {
            return ReconcileOutcome::Skipped(SkipReason::NotAuthenticated);
        }
        self.reconcile().await
    }

    /// Records a resolved reply unless the session moved on since it was asked.
    pub async fn accept_reply(&mut self, reply: BotReply) -> ReconcileOutcome {
        if reply.generation != self.generation {
            tracing::debug!(
                issued = reply.generation,
                current = self.generation,
                "dropping reply for a conversation that is gone"
            );
            return ReconcileOutcome::Skipped(SkipReason::StaleReply);
        }
        let Reply {
            content,
            recommendation,
            ..
        } = reply.reply;
        self.append_bot_message(content, recommendation).await
    }

    /// Resolves a pending reply with this lifecycle's backend and records it.
    pub async fn answer(&mut self, pending: PendingReply) -> (Reply, ReconcileOutcome) {
        let backend = self.backend();
        let reply = pending.resolve(backend.as_ref()).await;
        let shown = reply.reply.clone();
        (shown, self.accept_reply(reply).await)
    }

    /// One user turn followed by its reply, in sequence.
    pub async fn send(&mut self, text: &str) -> Result<Exchange, LifecycleError> {
        match self.append_user_message(text)? {
            SendOutcome::AwaitingAuthDecision => Ok(Exchange::AwaitingAuthDecision),
            SendOutcome::Dispatched(pending) => {
                let (reply, saved) = self.answer(pending).await;
                Ok(Exchange::Answered { reply, saved })
            }
        }
    }

    /// Leaves `PendingAuthDecision` for its resume state and hands back the
    /// held text.
    fn take_held_message(&mut self) -> Option<String> {
        if !matches!(self.state, SessionState::PendingAuthDecision { .. }) {
            return None;
        }
        match std::mem::replace(&mut self.state, SessionState::Fresh) {
            SessionState::PendingAuthDecision {
                pending_text,
                resume,
            } => {
                self.state = *resume;
                Some(pending_text)
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Switches to anonymous chat and sends any held-back message.
    ///
    /// Only meaningful while signed out or waiting on the sign-in decision;
    /// a signed-in session is left untouched.
    pub fn continue_without_login(&mut self) -> Option<PendingReply> {
        let deciding = matches!(self.state, SessionState::PendingAuthDecision { .. });
        if !deciding && self.session.is_authenticated() {
            tracing::debug!("signed in, staying in saved mode");
            return None;
        }
        let pending = match std::mem::replace(&mut self.state, SessionState::ActiveAnonymous) {
            SessionState::PendingAuthDecision { pending_text, .. } => Some(pending_text),
            _ => None,
        };
        tracing::info!("continuing without login, conversation will not be saved");
        match self.append_user_message(&pending?) {
            Ok(SendOutcome::Dispatched(reply)) => Some(reply),
            _ => None,
        }
    }

    // ============================================
    // Persistence
    // ============================================

    /// Saves the conversation with the current credential.
    pub async fn reconcile(&mut self) -> ReconcileOutcome {
        let credential = self.remember_credential();
        self.reconcile_using(credential).await
    }

    /// Saves the conversation on behalf of `credential`.
    ///
    /// Creates a record the first time the conversation qualifies, then only
    /// appends messages the repository has not acknowledged.
    pub async fn reconcile_using(&mut self, credential: Option<Credential>) -> ReconcileOutcome {
        if self.is_anonymous() {
            return ReconcileOutcome::Skipped(SkipReason::Anonymous);
        }
        if !is_persistable(&self.messages) {
            return ReconcileOutcome::Skipped(SkipReason::BelowThreshold);
        }
        let Some(credential) = credential else {
            return ReconcileOutcome::Skipped(SkipReason::NotAuthenticated);
        };
        match self.bound_record_id().map(str::to_string) {
            None => self.create_record(&credential).await,
            Some(record_id) => self.append_delta(&credential, record_id).await,
        }
    }

    async fn create_record(&mut self, credential: &Credential) -> ReconcileOutcome {
        let draft = NewConversation::from_messages(&self.messages, self.chat_mode);
        let created = self.repository.create(credential, &draft).await;
        match created {
            Ok(record) => {
                // Server ids are authoritative; fall back to ours when the
                // response does not echo the messages.
                let mut echoed = record.messages.iter();
                for message in &mut self.messages[..draft.messages.len()] {
                    let remote = echoed.next().and_then(|m| m.remote_id.clone());
                    message.remote_id = remote.or_else(|| Some(message.id.clone()));
                }
                tracing::info!(
                    record = %record.id,
                    messages = draft.messages.len(),
                    kind = draft.kind.as_str(),
                    "conversation saved"
                );
                self.persisted_meta = Some((draft.kind, draft.chat_mode));
                self.state = SessionState::ActiveBound {
                    record_id: record.id.clone(),
                };
                ReconcileOutcome::Created {
                    record_id: record.id,
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, operation = "create", "conversation not saved");
                self.on_repository_error(&err);
                ReconcileOutcome::Failed
            }
        }
    }

    async fn append_delta(&mut self, credential: &Credential, record_id: String) -> ReconcileOutcome {
        let delta: Vec<usize> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.is_persisted())
            .map(|(i, _)| i)
            .collect();
        if delta.is_empty() {
            return ReconcileOutcome::UpToDate { record_id };
        }

        let (mut appended, mut failed) = (0, 0);
        for (n, &index) in delta.iter().enumerate() {
            let result = self
                .repository
                .append_message(credential, &record_id, &self.messages[index])
                .await;
            match result {
                Ok(remote_id) => {
                    self.messages[index].remote_id = Some(remote_id);
                    appended += 1;
                }
                Err(err) if err.is_auth_failure() => {
                    tracing::warn!(record = %record_id, operation = "append", "credential rejected, abandoning save");
                    self.on_repository_error(&err);
                    failed += delta.len() - n;
                    return ReconcileOutcome::Appended {
                        record_id,
                        appended,
                        failed,
                    };
                }
                Err(err) => {
                    tracing::warn!(record = %record_id, operation = "append", error = %err, "message not saved");
                    failed += 1;
                }
            }
        }

        if appended > 0 {
            self.refresh_metadata(credential, &record_id).await;
        }
        tracing::debug!(record = %record_id, appended, failed, "delta saved");
        ReconcileOutcome::Appended {
            record_id,
            appended,
            failed,
        }
    }

    /// Updates the record's type and mode when the new messages changed them.
    async fn refresh_metadata(&mut self, credential: &Credential, record_id: &str) {
        let meta = (classify(&self.messages), self.chat_mode);
        if self.persisted_meta == Some(meta) {
            return;
        }
        let patch = ConversationPatch {
            kind: Some(meta.0),
            chat_mode: Some(meta.1),
            messages_count: Some(self.messages.len()),
            ..Default::default()
        };
        let updated = self.repository.update(credential, record_id, &patch).await;
        match updated {
            Ok(()) => self.persisted_meta = Some(meta),
            Err(err) => {
                tracing::warn!(record = %record_id, operation = "update", error = %err, "record metadata not updated");
                self.on_repository_error(&err);
            }
        }
    }

    fn on_repository_error(&mut self, err: &ApiError) {
        if err.is_auth_failure() {
            self.session.expire();
        }
    }

    // ============================================
    // Session boundaries
    // ============================================

    /// Replaces the session with a saved conversation.
    ///
    /// Unsaved messages of the current session are flushed first. On failure
    /// the session is left empty and [`Self::last_error`] is set.
    pub async fn restore_from_record(&mut self, record_id: &str) -> Result<(), LifecycleError> {
        let Some(credential) = self.remember_credential() else {
            return Err(LifecycleError::NotAuthenticated);
        };
        if !self.messages.is_empty() {
            let outcome = self.reconcile_using(Some(credential.clone())).await;
            tracing::debug!(?outcome, "flushed current conversation before restore");
        }

        let fetched = self.repository.get(&credential, record_id).await;
        match fetched {
            Ok(record) => {
                self.reset();
                tracing::info!(
                    record = %record_id,
                    messages = record.messages.len(),
                    "conversation restored"
                );
                self.messages = record.messages;
                self.chat_mode = record.chat_mode;
                self.persisted_meta = Some((record.kind, record.chat_mode));
                self.state = SessionState::RestoredFromHistory {
                    record_id: record_id.to_string(),
                };
                Ok(())
            }
            Err(err) => {
                tracing::warn!(record = %record_id, error = %err, "could not restore conversation");
                self.on_repository_error(&err);
                self.reset();
                self.last_error = Some(format!("Impossible de charger la conversation : {err}"));
                Err(LifecycleError::Restore {
                    id: record_id.to_string(),
                    source: err,
                })
            }
        }
    }

    /// One bounded save attempt with a credential that is about to go away.
    pub async fn flush_before_logout(&mut self, credential: Option<Credential>) -> ReconcileOutcome {
        let grace = self.logout_grace;
        match tokio::time::timeout(grace, self.reconcile_using(credential)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(grace_ms = grace.as_millis() as u64, "flush before logout timed out");
                ReconcileOutcome::TimedOut
            }
        }
    }

    /// Two-phase logout: flush while the credential is valid, then drop it.
    pub async fn logout(&mut self) -> ReconcileOutcome {
        let credential = self.session.begin_logout();
        let outcome = self.flush_before_logout(credential).await;
        self.reset();
        self.session.complete_logout();
        outcome
    }

    /// Saves what can be saved and starts over.
    pub async fn start_new_conversation(&mut self) -> ReconcileOutcome {
        let outcome = self.reconcile().await;
        self.reset();
        tracing::debug!(?outcome, "new conversation");
        outcome
    }

    /// Reacts to a sign-in or sign-out observed from outside.
    pub async fn on_authentication_transition(
        &mut self,
        was_authenticated: bool,
        is_authenticated: bool,
    ) -> Transition {
        match (was_authenticated, is_authenticated) {
            (true, false) => {
                let credential = self.session.token().or_else(|| self.last_credential.clone());
                let outcome = self.flush_before_logout(credential).await;
                self.reset();
                Transition::Flushed(outcome)
            }
            (false, true) => {
                self.remember_credential();
                if let Some(held) = self.take_held_message() {
                    return match self.append_user_message(&held) {
                        Ok(SendOutcome::Dispatched(pending)) => Transition::Replayed(pending),
                        _ => Transition::Unchanged,
                    };
                }
                match std::mem::replace(&mut self.state, SessionState::Fresh) {
                    SessionState::ActiveAnonymous => {
                        // Signing in ends anonymous mode; the chat so far can now be saved.
                        self.state = if self.messages.is_empty() {
                            SessionState::Fresh
                        } else {
                            SessionState::ActiveUnsaved
                        };
                        Transition::Unchanged
                    }
                    other => {
                        self.state = other;
                        Transition::Unchanged
                    }
                }
            }
            _ => Transition::Unchanged,
        }
    }

    /// Drives the lifecycle from a session event.
    pub async fn handle_event(&mut self, event: SessionEvent) -> Transition {
        match event {
            SessionEvent::LoggedIn => self.on_authentication_transition(false, true).await,
            SessionEvent::LoggingOut => {
                let credential = self.remember_credential();
                Transition::Saved(self.flush_before_logout(credential).await)
            }
            SessionEvent::LoggedOut => self.on_authentication_transition(true, false).await,
            SessionEvent::Expired => {
                self.reset();
                Transition::Reset
            }
        }
    }

    /// Deletes a saved conversation; the live session is reset if it was it.
    pub async fn delete_record(&mut self, record_id: &str) -> Result<(), LifecycleError> {
        let Some(credential) = self.remember_credential() else {
            return Err(LifecycleError::NotAuthenticated);
        };
        let deleted = self.repository.delete(&credential, record_id).await;
        if let Err(err) = deleted {
            tracing::warn!(record = %record_id, operation = "delete", error = %err, "delete failed");
            self.on_repository_error(&err);
            return Err(err.into());
        }
        if self.bound_record_id() == Some(record_id) {
            self.reset();
        }
        Ok(())
    }

    /// Clears the session. In-flight replies for the old session are dropped.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.state = SessionState::Fresh;
        self.chat_mode = ChatMode::default();
        self.persisted_meta = None;
        self.last_credential = None;
        self.last_error = None;
        self.generation += 1;
    }
}
