//! Client library for the aiBotanik phytotherapy assistant.
//!
//! The centre of the crate is [`lifecycle::ConversationLifecycle`], which owns
//! the active chat session and keeps it saved in the remote repository across
//! sign-in and sign-out. Everything it talks to sits behind a trait so it can
//! be swapped for the in-memory versions in [`testing`].
//!
//! # Architecture
//!
//! - `session` - credential, sign-in/sign-out, two-phase logout
//! - `repository` - saved conversation records over HTTP
//! - `backend` - chat and recommendation requests
//! - `lifecycle` - the active conversation and when to save it
//! - `display` - remedy cards built from recommendations
//! - `history`, `admin` - listing and backend configuration
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use botanik::{Config, ConversationLifecycle, HttpChatBackend, HttpConversationRepository, HttpSessionStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::from_env()?;
//! let mut chat = ConversationLifecycle::new(
//!     Arc::new(HttpSessionStore::new(&config.api_url, config.session_file.clone())),
//!     Arc::new(HttpConversationRepository::new(&config.api_url, config.resource_family)),
//!     Arc::new(HttpChatBackend::new(&config.api_url)),
//! );
//! chat.send("J'ai souvent mal à la tête").await?;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod backend;
pub mod codec;
pub mod config;
pub mod display;
pub mod error;
pub mod history;
pub mod lifecycle;
pub mod repository;
pub mod session;
pub mod testing;
pub mod types;

// Re-export main types
pub use backend::{ChatBackend, HttpChatBackend, Reply};
pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use lifecycle::{ConversationLifecycle, LifecycleError, ReconcileOutcome, SessionState};
pub use repository::{ConversationRepository, HttpConversationRepository, ResourceFamily};
pub use session::{Credential, HttpSessionStore, SessionEvent, SessionStore};
pub use types::{ChatMode, ConversationType, Message, Recommendation, Sender};
