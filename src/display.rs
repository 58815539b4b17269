//! Recommendation display.
//!
//! Turns a recommendation into the eight sections of a remedy card. Each
//! section comes from the structured field when the backend filled it, else
//! from the matching header in the free-text explanation, else from a fixed
//! sentence naming the plant.

use crate::codec::{self, DEFAULT_IMAGE_URL};
use crate::types::{Message, Recommendation, RecommendationPayload};
use comrak::plugins::syntect::SyntectAdapter;
use comrak::{ComrakOptions, ComrakPlugins, markdown_to_html_with_plugins};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::fmt::Write;

const UNAVAILABLE: &str = "Impossible d'afficher cette recommandation.";

static MARKDOWN_OPTIONS: Lazy<ComrakOptions> = Lazy::new(|| {
    let mut options = ComrakOptions::default();
    options.extension.table = true;
    options.extension.strikethrough = true;
    options
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionKind {
    Diagnosis,
    Symptoms,
    Presentation,
    Mechanism,
    TreatmentInfo,
    Precautions,
    Components,
    Summary,
}

impl SectionKind {
    pub const ALL: [SectionKind; 8] = [
        SectionKind::Diagnosis,
        SectionKind::Symptoms,
        SectionKind::Presentation,
        SectionKind::Mechanism,
        SectionKind::TreatmentInfo,
        SectionKind::Precautions,
        SectionKind::Components,
        SectionKind::Summary,
    ];

    /// Header line introducing this section in a free-text explanation.
    pub fn header(&self) -> &'static str {
        match self {
            SectionKind::Diagnosis => "Diagnostic possible",
            SectionKind::Symptoms => "Symptômes associés",
            SectionKind::Presentation => "Présentation de",
            SectionKind::Mechanism => "Mode d'action",
            SectionKind::TreatmentInfo => "Informations de traitement",
            SectionKind::Precautions => "Précautions et contre-indications",
            SectionKind::Components => "Composants actifs",
            SectionKind::Summary => "Résumé de traitement",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            SectionKind::Presentation => "Présentation",
            other => other.header(),
        }
    }

    fn structured<'a>(&self, rec: &'a Recommendation) -> Option<&'a str> {
        let field = match self {
            SectionKind::Diagnosis => &rec.diagnosis,
            SectionKind::Symptoms => &rec.symptoms,
            SectionKind::Presentation => &rec.presentation,
            SectionKind::Mechanism => &rec.mechanism,
            SectionKind::TreatmentInfo => &rec.treatment_info,
            SectionKind::Precautions => &rec.precautions,
            SectionKind::Components => &rec.components_info,
            SectionKind::Summary => &rec.treatment_summary,
        };
        field.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    fn fallback(&self, rec: &Recommendation) -> String {
        let plant = &rec.plant;
        match self {
            SectionKind::Diagnosis => format!(
                "Les informations de diagnostic pour {plant} ne sont pas disponibles pour le moment."
            ),
            SectionKind::Symptoms => {
                format!("Les symptômes associés à {plant} ne sont pas détaillés.")
            }
            SectionKind::Presentation => {
                format!("La plante {plant} est utilisée en phytothérapie traditionnelle.")
            }
            SectionKind::Mechanism => {
                format!("Le mode d'action de {plant} n'est pas détaillé.")
            }
            SectionKind::TreatmentInfo => format!(
                "Préparation: {}\nDosage: {}",
                rec.preparation, rec.dosage
            ),
            SectionKind::Precautions => non_empty(&rec.contraindications).unwrap_or_else(|| {
                format!("Aucune contre-indication spécifique mentionnée pour {plant}.")
            }),
            SectionKind::Components => non_empty(&rec.components).unwrap_or_else(|| {
                format!("Les composants actifs de {plant} ne sont pas détaillés.")
            }),
            SectionKind::Summary => format!(
                "Consultez les détails de préparation et de dosage pour ce remède à base de {plant}."
            ),
        }
    }

    fn matches_header(&self, line: &str) -> bool {
        let line = line.trim().trim_start_matches('#').trim().trim_matches('*').trim();
        line.starts_with(self.header())
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Where a section's text came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionSource {
    Structured,
    Explanation,
    Fallback,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub kind: SectionKind,
    pub body: String,
    pub source: SectionSource,
}

/// Collects the lines under `kind`'s header, up to the next known header.
pub fn extract_section(explanation: &str, kind: SectionKind) -> Option<String> {
    let mut lines = explanation.lines();
    lines.by_ref().find(|line| kind.matches_header(line))?;

    // A repeat of the section's own header is skipped, any other header ends it.
    let body: Vec<&str> = lines
        .filter(|line| !kind.matches_header(line))
        .take_while(|line| !SectionKind::ALL.iter().any(|k| k.matches_header(line)))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let body = body.join("\n");
    let body = body.trim();
    (!body.is_empty()).then(|| body.to_string())
}

pub fn build_section(rec: &Recommendation, kind: SectionKind) -> Section {
    if let Some(body) = kind.structured(rec) {
        return Section {
            kind,
            body: body.to_string(),
            source: SectionSource::Structured,
        };
    }
    if let Some(body) = extract_section(&rec.explanation, kind) {
        return Section {
            kind,
            body,
            source: SectionSource::Explanation,
        };
    }
    Section {
        kind,
        body: kind.fallback(rec),
        source: SectionSource::Fallback,
    }
}

pub fn build_sections(rec: &Recommendation) -> Vec<Section> {
    SectionKind::ALL
        .iter()
        .map(|kind| build_section(rec, *kind))
        .collect()
}

/// Everything needed to render a remedy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecommendationCard {
    pub plant: String,
    pub local_name: String,
    pub image_url: Option<String>,
    pub part_used: String,
    pub preparation: String,
    pub dosage: String,
    pub sections: Vec<Section>,
}

impl RecommendationCard {
    pub fn new(rec: &Recommendation) -> Self {
        let rec = codec::with_defaults(rec.clone());
        let image_url = Some(rec.image_url.trim())
            .filter(|url| !url.is_empty() && *url != DEFAULT_IMAGE_URL)
            .map(str::to_string);
        Self {
            sections: build_sections(&rec),
            plant: rec.plant,
            local_name: rec.local_name,
            image_url,
            part_used: rec.part_used,
            preparation: rec.preparation,
            dosage: rec.dosage,
        }
    }

    pub fn section(&self, kind: SectionKind) -> Option<&Section> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "## {} ({})\n", self.plant, self.local_name);
        if let Some(url) = &self.image_url {
            let _ = writeln!(out, "![{}]({})\n", self.plant, url);
        }
        let _ = writeln!(out, "| Fiche | |\n|---|---|");
        let _ = writeln!(out, "| Partie utilisée | {} |", self.part_used);
        let _ = writeln!(out, "| Préparation | {} |", self.preparation);
        let _ = writeln!(out, "| Dosage | {} |\n", self.dosage);
        for section in &self.sections {
            let _ = writeln!(out, "### {}\n\n{}\n", section.kind.title(), section.body);
        }
        out
    }

    pub fn to_html(&self) -> String {
        markdown_to_html(&self.to_markdown())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecommendationView {
    Card(Box<RecommendationCard>),
    /// Shown in place of a payload that cannot be displayed.
    Unavailable { reason: String },
}

impl RecommendationView {
    fn unavailable() -> Self {
        RecommendationView::Unavailable {
            reason: UNAVAILABLE.to_string(),
        }
    }

    pub fn to_markdown(&self) -> String {
        match self {
            RecommendationView::Card(card) => card.to_markdown(),
            RecommendationView::Unavailable { reason } => format!("> {reason}\n"),
        }
    }
}

pub fn view_payload(payload: &RecommendationPayload) -> RecommendationView {
    match payload {
        RecommendationPayload::Structured(rec) => {
            RecommendationView::Card(Box::new(RecommendationCard::new(rec)))
        }
        RecommendationPayload::Unreadable(raw) => {
            tracing::debug!(len = raw.len(), "recommendation payload unreadable");
            RecommendationView::unavailable()
        }
    }
}

/// View for a raw payload straight off the wire. Anything that is not an
/// object naming a plant gets the placeholder.
pub fn view_value(value: &Value) -> RecommendationView {
    let object = match value {
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(inner @ Value::Object(_)) => inner,
            _ => return RecommendationView::unavailable(),
        },
        Value::Object(_) => value.clone(),
        _ => return RecommendationView::unavailable(),
    };
    let has_plant = object
        .get("plant")
        .and_then(Value::as_str)
        .is_some_and(|plant| !plant.trim().is_empty());
    if !has_plant {
        return RecommendationView::unavailable();
    }
    match codec::decode_payload(&object) {
        Some(payload) => view_payload(&payload),
        None => RecommendationView::unavailable(),
    }
}

pub fn view_message(message: &Message) -> Option<RecommendationView> {
    message.recommendation.as_ref().map(view_payload)
}

pub fn markdown_to_html(md: &str) -> String {
    let adapter = SyntectAdapter::new(Some("base16-ocean.dark"));
    let mut plugins = ComrakPlugins::default();
    plugins.render.codefence_syntax_highlighter = Some(&adapter);
    markdown_to_html_with_plugins(md, &MARKDOWN_OPTIONS, &plugins)
}
