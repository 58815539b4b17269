//! End-to-end conversation scenarios against in-memory collaborators.

use botanik::codec;
use botanik::lifecycle::{Exchange, SendOutcome, SkipReason, Transition};
use botanik::testing::{RecordingRepository, RepoCall, ScriptedBackend, StaticSession};
use botanik::types::{ConversationRecord, classify};
use botanik::{
    ChatMode, ConversationLifecycle, ConversationType, Message, Recommendation, ReconcileOutcome,
    SessionState, SessionStore,
};
use std::sync::Arc;

fn lifecycle(
    session: &Arc<StaticSession>,
    repository: &Arc<RecordingRepository>,
) -> ConversationLifecycle {
    ConversationLifecycle::new(
        session.clone(),
        repository.clone(),
        Arc::new(ScriptedBackend::default()),
    )
}

fn remedy(plant: &str) -> Recommendation {
    Recommendation {
        plant: plant.to_string(),
        ..Default::default()
    }
}

fn persisted(mut message: Message, id: &str) -> Message {
    message.id = id.to_string();
    message.remote_id = Some(id.to_string());
    message
}

fn saved_record(id: &str) -> ConversationRecord {
    let messages = vec![
        persisted(Message::user("J'ai de la fièvre"), "m1"),
        persisted(Message::bot("Depuis quand ?", None), "m2"),
        persisted(Message::user("Deux jours"), "m3"),
        persisted(Message::bot("Voici un remède", Some(codec::with_defaults(remedy("Kinkeliba")))), "m4"),
        persisted(Message::user("Merci"), "m5"),
        persisted(Message::bot("Avec plaisir", None), "m6"),
    ];
    ConversationRecord {
        id: id.to_string(),
        title: "J'ai de la fièvre".to_string(),
        kind: classify(&messages),
        summary: None,
        messages_count: messages.len(),
        messages,
        chat_mode: ChatMode::Consultation,
        created_at: None,
        updated_at: None,
    }
}

async fn say(chat: &mut ConversationLifecycle, text: &str) -> ReconcileOutcome {
    match chat.send(text).await.expect("send") {
        Exchange::Answered { saved, .. } => saved,
        Exchange::AwaitingAuthDecision => panic!("unexpected sign-in prompt"),
    }
}

#[tokio::test]
async fn test_no_repository_calls_below_threshold() {
    let session = Arc::new(StaticSession::signed_in("tok"));
    let repository = Arc::new(RecordingRepository::new());
    let mut chat = lifecycle(&session, &repository);

    say(&mut chat, "Bonjour").await;
    chat.append_user_message("Vous êtes là ?").unwrap();
    assert_eq!(
        chat.reconcile().await,
        ReconcileOutcome::Skipped(SkipReason::BelowThreshold)
    );
    assert_eq!(
        chat.start_new_conversation().await,
        ReconcileOutcome::Skipped(SkipReason::BelowThreshold)
    );
    assert!(repository.calls().is_empty());
}

#[tokio::test]
async fn test_bound_session_appends_only_the_new_message() {
    let session = Arc::new(StaticSession::signed_in("tok"));
    let repository = Arc::new(RecordingRepository::new());
    let mut chat = lifecycle(&session, &repository);

    say(&mut chat, "Bonjour").await;
    let ReconcileOutcome::Created { record_id } = say(&mut chat, "J'ai mal au dos").await else {
        panic!("expected the conversation to be created");
    };

    chat.append_user_message("Et en infusion ?").unwrap();
    chat.reconcile().await;

    assert_eq!(repository.creates(), 1);
    assert_eq!(
        repository.calls().last(),
        Some(&RepoCall::Append {
            id: record_id.clone(),
            content: "Et en infusion ?".to_string()
        })
    );
    assert_eq!(repository.appends(), 1);
    let stored = repository.record(&record_id).unwrap();
    assert_eq!(stored.messages.len(), 5);
}

#[tokio::test]
async fn test_restore_populates_session_in_order() {
    let session = Arc::new(StaticSession::signed_in("tok"));
    let repository = Arc::new(RecordingRepository::new().with_record(saved_record("c-42")));
    let mut chat = lifecycle(&session, &repository);

    chat.restore_from_record("c-42").await.unwrap();

    let contents: Vec<_> = chat.messages().iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec![
            "J'ai de la fièvre",
            "Depuis quand ?",
            "Deux jours",
            "Voici un remède",
            "Merci",
            "Avec plaisir"
        ]
    );
    assert_eq!(chat.bound_record_id(), Some("c-42"));
    assert!(chat.is_restored_from_history());
    assert_eq!(chat.chat_mode(), ChatMode::Consultation);
    assert_eq!(
        chat.messages()[3].recommendation().map(|r| r.plant.as_str()),
        Some("Kinkeliba")
    );

    // Continuing a restored conversation appends, never re-creates.
    say(&mut chat, "Et pour les enfants ?").await;
    assert_eq!(repository.creates(), 0);
    assert_eq!(repository.appends(), 2);
}

#[tokio::test]
async fn test_logout_after_four_messages_saves_once_and_clears() {
    let session = Arc::new(StaticSession::signed_in("tok"));
    let repository = Arc::new(RecordingRepository::new());
    let mut chat = lifecycle(&session, &repository);

    say(&mut chat, "Bonjour").await;
    say(&mut chat, "Je dors mal").await;
    chat.logout().await;

    assert_eq!(repository.creates(), 1);
    assert_eq!(repository.appends(), 0);
    assert_eq!(session.journal(), vec!["begin_logout", "complete_logout"]);
    assert!(chat.messages().is_empty());
    assert_eq!(chat.bound_record_id(), None);
    assert_eq!(chat.state(), &SessionState::Fresh);
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn test_logout_flush_saves_what_the_chat_could_not() {
    let session = Arc::new(StaticSession::signed_in("tok"));
    let repository = Arc::new(RecordingRepository::new());
    let mut chat = lifecycle(&session, &repository);

    say(&mut chat, "Bonjour").await;
    repository.fail_with(Some(botanik::testing::Failure::Server));
    assert_eq!(say(&mut chat, "Je dors mal").await, ReconcileOutcome::Failed);
    repository.fail_with(None);

    let outcome = chat.logout().await;
    assert!(matches!(outcome, ReconcileOutcome::Created { .. }));
    // Both attempts carried the credential that was valid before logout.
    assert_eq!(
        repository.credentials(),
        vec![botanik::Credential::new("tok"), botanik::Credential::new("tok")]
    );
    assert_eq!(repository.creates(), 2);
    assert!(chat.messages().is_empty());
    assert!(session.token().is_none());
}

#[tokio::test]
async fn test_sign_in_replays_held_message() {
    let session = Arc::new(StaticSession::anonymous());
    let repository = Arc::new(RecordingRepository::new());
    let mut chat = lifecycle(&session, &repository);

    assert_eq!(chat.send("Bonjour").await.unwrap(), Exchange::AwaitingAuthDecision);
    session.login("awa@example.com", "secret").await.unwrap();

    let Transition::Replayed(pending) = chat.on_authentication_transition(false, true).await else {
        panic!("expected a replay");
    };
    let (reply, _) = chat.answer(pending).await;
    assert!(!reply.failed);
    assert_eq!(chat.messages().len(), 2);
    assert_eq!(chat.messages()[0].content, "Bonjour");
}

#[tokio::test]
async fn test_reply_for_discarded_conversation_is_dropped() {
    let session = Arc::new(StaticSession::signed_in("tok"));
    let repository = Arc::new(RecordingRepository::new());
    let mut chat = lifecycle(&session, &repository);

    let SendOutcome::Dispatched(pending) = chat.append_user_message("Bonjour").unwrap() else {
        panic!("expected dispatch");
    };
    chat.restore_from_record("missing").await.unwrap_err();

    let reply = pending.resolve(chat.backend().as_ref()).await;
    assert_eq!(
        chat.accept_reply(reply).await,
        ReconcileOutcome::Skipped(SkipReason::StaleReply)
    );
    assert!(chat.messages().is_empty());
}

#[tokio::test]
async fn test_backend_outage_still_yields_a_reply() {
    let session = Arc::new(StaticSession::signed_in("tok"));
    let repository = Arc::new(RecordingRepository::new());
    let backend = Arc::new(ScriptedBackend::default());
    backend.set_down(true);
    let mut chat = ConversationLifecycle::new(session.clone(), repository.clone(), backend.clone());
    chat.set_chat_mode(ChatMode::Consultation);

    let Exchange::Answered { reply, .. } = chat.send("toux").await.unwrap() else {
        panic!("expected an answer");
    };
    assert!(reply.failed);
    assert!(reply.recommendation.is_none());
    assert_eq!(chat.messages().len(), 2);
    assert_eq!(backend.asked(), vec!["toux".to_string()]);
}

#[test]
fn test_type_classification() {
    let with = || Message::bot("remède", Some(remedy("Neem")));
    let without = || Message::bot("bonjour", None);

    let mixed = [Message::user("q"), with(), Message::user("q"), without()];
    assert_eq!(classify(&mixed), ConversationType::Mixed);
    let consultation = [Message::user("q"), with(), Message::user("q"), with()];
    assert_eq!(classify(&consultation), ConversationType::Consultation);
    let discussion = [Message::user("q"), without(), Message::user("q"), without()];
    assert_eq!(classify(&discussion), ConversationType::Discussion);
}
