use anyhow::Context;
use botanik::admin::{AdminClient, LlmBackendKind};
use botanik::config::{self, Config};
use botanik::display::{self, RecommendationView};
use botanik::history::{self, paginate};
use botanik::lifecycle::{PendingReply, SendOutcome, Transition};
use botanik::session::SignupRequest;
use botanik::{
    ChatMode, ConversationLifecycle, ConversationRepository, HttpChatBackend,
    HttpConversationRepository, HttpSessionStore, Reply, SessionEvent, SessionStore,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

const HELP: &str = "\
Commandes :
  /mode discussion|consultation   changer de mode
  /login <email> <mot de passe>   se connecter
  /signup <nom> <email> <mot de passe> <confirmation>
  /password <email> <nouveau>     changer de mot de passe
  /logout                         se déconnecter
  /anon                           continuer sans compte
  /new                            nouvelle conversation
  /history [page]                 conversations sauvegardées
  /open <id>                      reprendre une conversation
  /delete <id>                    supprimer une conversation
  /admin status|rebuild|test|use <openai|huggingface> [clé]
  /quit                           quitter
Tout autre texte est envoyé à l'assistant.";

const AUTH_PROMPT: &str = "Connectez-vous avec /login <email> <mot de passe> pour sauvegarder \
vos conversations, ou tapez /anon pour continuer sans compte.";

struct Repl {
    config: Config,
    session: Arc<HttpSessionStore>,
    repository: Arc<dyn ConversationRepository>,
    admin: AdminClient,
    chat: ConversationLifecycle,
    events: broadcast::Receiver<SessionEvent>,
}

impl Repl {
    fn new(config: Config) -> Self {
        let session = Arc::new(HttpSessionStore::new(
            &config.api_url,
            config.session_file.clone(),
        ));
        let repository: Arc<dyn ConversationRepository> = Arc::new(
            HttpConversationRepository::new(&config.api_url, config.resource_family),
        );
        let chat = ConversationLifecycle::new(
            session.clone(),
            repository.clone(),
            Arc::new(HttpChatBackend::new(&config.api_url)),
        )
        .with_logout_grace(config.logout_grace);
        let events = session.subscribe();
        Self {
            admin: AdminClient::new(&config.api_url),
            config,
            session,
            repository,
            chat,
            events,
        }
    }

    /// Returns false when the user asked to quit.
    async fn handle(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return true;
        }
        if !line.starts_with('/') {
            self.send(line).await;
            return true;
        }

        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();
        match (command, args.as_slice()) {
            ("/quit", _) => {
                let outcome = self.chat.start_new_conversation().await;
                if outcome.made_calls() {
                    tracing::info!(?outcome, "final save before exit");
                }
                return false;
            }
            ("/help", _) => println!("{HELP}"),
            ("/mode", [mode]) => match mode.parse::<ChatMode>() {
                Ok(mode) => {
                    self.chat.set_chat_mode(mode);
                    println!("Mode {mode}.");
                }
                Err(err) => println!("{err}"),
            },
            ("/login", [email, password]) => self.login(email, password).await,
            ("/signup", [name, email, password, confirm]) => {
                let request = SignupRequest {
                    name: name.to_string(),
                    email: email.to_string(),
                    password: password.to_string(),
                    confirm_password: confirm.to_string(),
                };
                match self.session.signup(&request).await {
                    Ok(()) => self.after_login().await,
                    Err(err) => println!("{err}"),
                }
            }
            ("/password", [email, new_password]) => {
                if self.session.change_password(email, new_password).await {
                    println!("Mot de passe modifié.");
                } else {
                    println!("Impossible de modifier le mot de passe.");
                }
            }
            ("/logout", _) => {
                let outcome = self.chat.logout().await;
                tracing::debug!(?outcome, "logout flush");
                println!("Vous êtes déconnecté.");
            }
            ("/anon", _) => {
                if let Some(pending) = self.chat.continue_without_login() {
                    self.answer(pending).await;
                } else if self.session.is_authenticated() {
                    println!("Vous êtes connecté : cette conversation reste sauvegardée.");
                } else {
                    println!("Mode invité : vos conversations ne seront pas sauvegardées.");
                }
            }
            ("/new", _) => {
                self.chat.start_new_conversation().await;
                println!("Nouvelle conversation.");
            }
            ("/history", rest) => {
                let page = rest.first().and_then(|p| p.parse().ok()).unwrap_or(1);
                self.history(page).await;
            }
            ("/open", [id]) => match self.chat.restore_from_record(id).await {
                Ok(()) => self.print_transcript(),
                Err(err) => {
                    tracing::debug!(error = %err, "restore failed");
                    println!(
                        "{}",
                        self.chat.last_error().unwrap_or("Conversation introuvable.")
                    );
                }
            },
            ("/delete", [id]) => match self.chat.delete_record(id).await {
                Ok(()) => println!("Conversation supprimée."),
                Err(err) => println!("Suppression impossible : {err}"),
            },
            ("/admin", rest) => self.admin(rest).await,
            _ => println!("{HELP}"),
        }
        true
    }

    async fn send(&mut self, text: &str) {
        match self.chat.append_user_message(text) {
            Ok(SendOutcome::Dispatched(pending)) => self.answer(pending).await,
            Ok(SendOutcome::AwaitingAuthDecision) => println!("{AUTH_PROMPT}"),
            Err(err) => println!("{err}"),
        }
    }

    async fn answer(&mut self, pending: PendingReply) {
        let (reply, saved) = self.chat.answer(pending).await;
        print_reply(&reply);
        tracing::debug!(?saved, "reply recorded");
    }

    async fn login(&mut self, email: &str, password: &str) {
        match self.session.login(email, password).await {
            Ok(()) => self.after_login().await,
            Err(err) => println!("{err}"),
        }
    }

    async fn after_login(&mut self) {
        match self.session.current_user().await {
            Ok(user) => println!("Bienvenue {}.", user.name.as_deref().unwrap_or(&user.email)),
            Err(err) => {
                tracing::debug!(error = %err, "profile unavailable");
                println!("Connecté.");
            }
        }
        let transition = self.chat.on_authentication_transition(false, true).await;
        if let Transition::Replayed(pending) = transition {
            self.answer(pending).await;
        }
    }

    async fn history(&mut self, page: usize) {
        let loaded = history::load_history(self.session.as_ref(), self.repository.as_ref()).await;
        let entries = match loaded {
            Ok(entries) => entries,
            Err(err) => {
                println!("Impossible de charger l'historique : {err}");
                return;
            }
        };
        if entries.is_empty() {
            println!("Aucune conversation sauvegardée.");
            return;
        }
        let page = paginate(&entries, page, self.config.history_page_size);
        for entry in page.items {
            let plant = entry
                .last_recommendation
                .as_ref()
                .map(|r| format!(" · {}", r.plant))
                .unwrap_or_default();
            println!(
                "{}  {}  ({} messages, {}{})\n    {}",
                entry.id,
                entry.title,
                entry.messages_count,
                entry.kind.as_str(),
                plant,
                entry.summary
            );
        }
        println!("{}", page.label());
    }

    async fn admin(&mut self, args: &[&str]) {
        let Some(credential) = self.session.token() else {
            println!("Connexion requise.");
            return;
        };
        let result = match args {
            ["status"] => self.admin.get_llm_config(&credential).await.map(|c| {
                format!(
                    "Backend : {} (clé OpenAI : {}, clé Hugging Face : {})",
                    c.llm_backend, c.has_openai_key, c.has_hf_key
                )
            }),
            ["use", kind, rest @ ..] => match kind.parse::<LlmBackendKind>() {
                Ok(kind) => {
                    self.admin
                        .set_llm_backend(&credential, kind, rest.first().copied())
                        .await
                }
                Err(err) => Ok(err),
            },
            ["rebuild"] => self
                .admin
                .rebuild_index(&credential)
                .await
                .map(|()| "Reconstruction de l'index lancée.".to_string()),
            ["test"] => self.admin.test_llm("Bonjour").await.map(|probe| {
                format!(
                    "{} ({}, {:.2}s)",
                    probe.response,
                    probe.backend.as_deref().unwrap_or("?"),
                    probe.processing_time.unwrap_or_default()
                )
            }),
            _ => Ok(HELP.to_string()),
        };
        match result {
            Ok(text) => println!("{text}"),
            Err(err) => {
                if err.is_auth_failure() {
                    self.session.expire();
                }
                println!("Erreur : {err}");
            }
        }
    }

    /// Applies session changes that did not come from this REPL.
    async fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(SessionEvent::Expired) => {
                    self.chat.handle_event(SessionEvent::Expired).await;
                    println!("Votre session a expiré, veuillez vous reconnecter.");
                }
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "session events lagged");
                }
                Err(_) => break,
            }
        }
    }

    fn print_transcript(&self) {
        for message in self.chat.messages() {
            let who = match message.sender {
                botanik::Sender::User => "vous",
                botanik::Sender::Bot => "botanik",
            };
            println!("[{who}] {}", message.content);
            if let Some(view) = display::view_message(message) {
                println!("{}", view.to_markdown());
            }
        }
    }
}

fn print_reply(reply: &Reply) {
    if let Some(rec) = &reply.recommendation {
        let view = RecommendationView::Card(Box::new(display::RecommendationCard::new(rec)));
        println!("{}", view.to_markdown());
    }
    println!("[botanik] {}", reply.content);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_dotenv();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("botanik=info")),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(api = %config.api_url, family = %config.resource_family, "starting");

    let mut repl = Repl::new(config);
    if repl.session.is_authenticated()
        && !repl.session.validate_token().await
        && !repl.session.is_authenticated()
    {
        println!("Votre session a expiré, veuillez vous reconnecter.");
    }
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !repl.handle(&line).await {
            break;
        }
        repl.drain_events().await;
    }
    Ok(())
}
