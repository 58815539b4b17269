//! Chat and recommendation backend.
//!
//! The backend answers free-form questions in discussion mode and returns a
//! plant recommendation in consultation mode. [`ask`] wraps both and never
//! fails: a failed call becomes an apologetic bot reply.

use crate::codec;
use crate::error::{self, ApiResult};
use crate::types::{ChatMode, Recommendation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const UNNAMED_PLANT: &str = "plante médicinale";

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn discuss(&self, text: &str) -> ApiResult<String>;

    async fn recommend(&self, symptoms: &str) -> ApiResult<Recommendation>;
}

#[derive(Serialize)]
struct SymptomsRequest<'a> {
    symptoms: &'a str,
}

#[derive(Deserialize)]
struct DiscussionResponse {
    #[serde(default)]
    response: Option<String>,
}

pub struct HttpChatBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChatBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post(&self, path: &str, text: &str) -> ApiResult<String> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&SymptomsRequest { symptoms: text })
            .send()
            .await?;
        error::read_body(response).await
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn discuss(&self, text: &str) -> ApiResult<String> {
        let body = self.post("/chat", text).await?;
        let parsed: DiscussionResponse = serde_json::from_str(&body)?;
        Ok(parsed.response.unwrap_or_default())
    }

    async fn recommend(&self, symptoms: &str) -> ApiResult<Recommendation> {
        let body = self.post("/recommend", symptoms).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// A bot turn ready to be appended to the conversation.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub content: String,
    pub recommendation: Option<Recommendation>,
    /// The backend could not be reached or answered with an error.
    pub failed: bool,
}

/// Asks the backend in the given mode, falling back to a canned reply.
pub async fn ask(backend: &dyn ChatBackend, mode: ChatMode, text: &str) -> Reply {
    match mode {
        ChatMode::Discussion => match backend.discuss(text).await {
            Ok(answer) if !answer.trim().is_empty() => Reply {
                content: answer,
                recommendation: None,
                failed: false,
            },
            Ok(_) => Reply {
                content: format!(
                    "Merci pour votre question sur : \"{text}\". Je suis là pour discuter de phytothérapie africaine avec vous."
                ),
                recommendation: None,
                failed: false,
            },
            Err(err) => {
                tracing::warn!(error = %err, mode = %mode, "discussion request failed");
                Reply {
                    content: format!(
                        "Désolé, je n'ai pas pu traiter votre question : \"{text}\". Le serveur est-il bien démarré ? Vous pouvez réessayer ou passer en mode Consultation."
                    ),
                    recommendation: None,
                    failed: true,
                }
            }
        },
        ChatMode::Consultation => match backend.recommend(text).await {
            Ok(rec) => {
                let rec = normalize(rec, text);
                Reply {
                    content: format!(
                        "J'ai analysé vos symptômes et je vous recommande le remède suivant à base de **{}**. Retrouvez ci-dessus la fiche détaillée avec préparation et dosage recommandés.",
                        rec.plant
                    ),
                    recommendation: Some(rec),
                    failed: false,
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, mode = %mode, "recommendation request failed");
                Reply {
                    content: "Je suis désolé, une erreur est survenue lors de la recherche d'un remède adapté. Veuillez vérifier que le serveur backend est bien démarré ou essayez une description différente de vos symptômes.".to_string(),
                    recommendation: None,
                    failed: true,
                }
            }
        },
    }
}

/// Fills a missing plant name and explanation, then the remaining defaults.
fn normalize(mut rec: Recommendation, symptoms: &str) -> Recommendation {
    if rec.plant.trim().is_empty() {
        rec.plant = UNNAMED_PLANT.to_string();
    }
    if rec.explanation.trim().is_empty() {
        rec.explanation = explanation_template(&rec.plant, symptoms);
    }
    codec::with_defaults(rec)
}

fn explanation_template(plant: &str, symptoms: &str) -> String {
    format!(
        "Diagnostic possible\n\
         D'après les symptômes décrits (\"{symptoms}\"), un remède à base de {plant} pourrait vous aider.\n\
         \n\
         Résumé de traitement\n\
         Suivez la préparation et le dosage indiqués et consultez un professionnel de santé si les symptômes persistent."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;

    struct Down;

    #[async_trait]
    impl ChatBackend for Down {
        async fn discuss(&self, _text: &str) -> ApiResult<String> {
            Err(ApiError::Status {
                status: 502,
                body: "bad gateway".into(),
            })
        }

        async fn recommend(&self, _symptoms: &str) -> ApiResult<Recommendation> {
            Err(ApiError::Rejected("down".into()))
        }
    }

    struct Terse;

    #[async_trait]
    impl ChatBackend for Terse {
        async fn discuss(&self, _text: &str) -> ApiResult<String> {
            Ok(String::new())
        }

        async fn recommend(&self, _symptoms: &str) -> ApiResult<Recommendation> {
            Ok(Recommendation::default())
        }
    }

    #[tokio::test]
    async fn test_failures_become_replies() {
        let reply = ask(&Down, ChatMode::Discussion, "tisane ?").await;
        assert!(reply.failed);
        assert!(reply.content.contains("\"tisane ?\""));

        let reply = ask(&Down, ChatMode::Consultation, "toux").await;
        assert!(reply.failed);
        assert!(reply.recommendation.is_none());
    }

    #[tokio::test]
    async fn test_empty_answers_are_filled_in() {
        let reply = ask(&Terse, ChatMode::Discussion, "bonjour").await;
        assert!(!reply.failed);
        assert!(reply.content.starts_with("Merci pour votre question"));

        let reply = ask(&Terse, ChatMode::Consultation, "toux sèche").await;
        let rec = reply.recommendation.expect("recommendation");
        assert_eq!(rec.plant, UNNAMED_PLANT);
        assert!(rec.explanation.starts_with("Diagnostic possible"));
        assert!(rec.explanation.contains("toux sèche"));
        assert_eq!(rec.dosage, codec::DEFAULT_DOSAGE);
        assert!(reply.content.contains("**plante médicinale**"));
    }
}
