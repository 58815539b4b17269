//! Saved-conversation listing.

use crate::error::{ApiError, ApiResult};
use crate::repository::ConversationRepository;
use crate::session::SessionStore;
use crate::types::{ConversationSummary, MIN_PERSISTABLE_MESSAGES};
use std::cmp::Reverse;

/// Drops abandoned conversations and sorts the rest, most recent first.
pub fn prepare_history(mut entries: Vec<ConversationSummary>) -> Vec<ConversationSummary> {
    entries.retain(|entry| entry.messages_count >= MIN_PERSISTABLE_MESSAGES);
    entries.sort_by_key(|entry| Reverse(entry.updated_at.or(entry.created_at)));
    entries
}

/// One page of a listing. Pages are numbered from 1.
#[derive(Debug, PartialEq)]
pub struct Page<'a, T> {
    pub items: &'a [T],
    pub number: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

impl<T> Page<'_, T> {
    pub fn has_previous(&self) -> bool {
        self.number > 1
    }

    pub fn has_next(&self) -> bool {
        self.number < self.total_pages
    }

    pub fn label(&self) -> String {
        format!(
            "Page {} sur {} ({} conversations)",
            self.number, self.total_pages, self.total_items
        )
    }
}

/// Slices out page `page`. Page 0 is treated as 1 and pages past the end
/// clamp to the last page.
pub fn paginate<T>(items: &[T], page: usize, per_page: usize) -> Page<'_, T> {
    let per_page = per_page.max(1);
    let total_pages = items.len().div_ceil(per_page).max(1);
    let number = page.clamp(1, total_pages);
    let start = (number - 1) * per_page;
    let end = (start + per_page).min(items.len());
    Page {
        items: &items[start.min(end)..end],
        number,
        total_pages,
        total_items: items.len(),
    }
}

/// Fetches the user's saved conversations, ready for display.
///
/// A rejected credential expires the session.
pub async fn load_history(
    session: &dyn SessionStore,
    repository: &dyn ConversationRepository,
) -> ApiResult<Vec<ConversationSummary>> {
    let credential = session.token().ok_or(ApiError::NotAuthenticated)?;
    match repository.list(&credential).await {
        Ok(entries) => {
            let total = entries.len();
            let entries = prepare_history(entries);
            tracing::debug!(total, shown = entries.len(), "history loaded");
            Ok(entries)
        }
        Err(err) => {
            tracing::warn!(error = %err, operation = "list", "could not load history");
            if err.is_auth_failure() {
                session.expire();
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Failure, RecordingRepository, StaticSession};
    use crate::types::{ChatMode, ConversationType};
    use time::macros::datetime;

    fn entry(id: &str, count: usize, updated: time::OffsetDateTime) -> ConversationSummary {
        ConversationSummary {
            id: id.to_string(),
            title: id.to_string(),
            kind: ConversationType::Mixed,
            summary: String::new(),
            messages_count: count,
            chat_mode: ChatMode::Discussion,
            created_at: None,
            updated_at: Some(updated),
            last_recommendation: None,
        }
    }

    #[test]
    fn test_prepare_filters_and_sorts() {
        let entries = vec![
            entry("old", 6, datetime!(2024-12-01 10:00 UTC)),
            entry("short", 2, datetime!(2024-12-20 10:00 UTC)),
            entry("new", 4, datetime!(2024-12-15 10:00 UTC)),
        ];
        let ids: Vec<_> = prepare_history(entries).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[test]
    fn test_paginate() {
        let items: Vec<usize> = (0..13).collect();
        let first = paginate(&items, 1, 6);
        assert_eq!(first.items, &[0, 1, 2, 3, 4, 5]);
        assert!(first.has_next());
        assert!(!first.has_previous());
        assert_eq!(first.label(), "Page 1 sur 3 (13 conversations)");

        let last = paginate(&items, 9, 6);
        assert_eq!(last.number, 3);
        assert_eq!(last.items, &[12]);
        assert!(!last.has_next());

        assert_eq!(paginate(&items, 0, 6).number, 1);
    }

    #[test]
    fn test_paginate_empty() {
        let items: Vec<usize> = Vec::new();
        let page = paginate(&items, 3, 6);
        assert_eq!(page.number, 1);
        assert_eq!(page.total_pages, 1);
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn test_load_history_requires_credential() {
        let session = StaticSession::anonymous();
        let repository = RecordingRepository::new();
        assert!(matches!(
            load_history(&session, &repository).await,
            Err(ApiError::NotAuthenticated)
        ));
        assert!(repository.calls().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_listing_expires_session() {
        let session = StaticSession::signed_in("tok");
        let repository = RecordingRepository::new();
        repository.fail_with(Some(Failure::Unauthorized));
        assert!(load_history(&session, &repository).await.is_err());
        assert_eq!(session.journal(), vec!["expire"]);
    }
}
