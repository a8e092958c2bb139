//! Core data models used throughout the matcher.
//!
//! These types represent the candidate profile, the projects it is ranked
//! against, stored source documents, and the match verdicts that flow
//! through the scoring pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::hashing::{canonical_json, hash_text};

// ============ Candidate ============

/// Structured candidate profile, as produced by the upstream CV analyzer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateProfile {
    pub personal_info: PersonalInfo,
    pub education: Vec<Education>,
    pub experience: Vec<Experience>,
    pub skills: Skills,
    pub projects: Vec<CandidateProject>,
    pub domains_of_interest: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonalInfo {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub linkedin: Option<String>,
    pub github: Option<String>,
    pub portfolio: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Education {
    pub degree: Option<String>,
    pub institution: Option<String>,
    pub year: Option<String>,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Experience {
    pub role: Option<String>,
    pub company: Option<String>,
    pub duration: Option<String>,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Skills {
    pub technical: Vec<String>,
    pub soft: Vec<String>,
    pub languages: Vec<String>,
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateProject {
    pub name: Option<String>,
    pub description: Option<String>,
    pub technologies: Vec<String>,
}

impl CandidateProfile {
    /// SHA-256 of the canonical JSON form. Two profiles with the same
    /// content always share a hash, whatever order their fields were parsed in.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_value(self)
            .map(|v| canonical_json(&v))
            .unwrap_or_default();
        hash_text(&canonical)
    }

    /// Plain-text rendering used as embedding input.
    pub fn embedding_text(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        let skills: Vec<&str> = self
            .skills
            .technical
            .iter()
            .chain(self.skills.tools.iter())
            .map(String::as_str)
            .collect();
        if !skills.is_empty() {
            parts.push(format!("Skills: {}", skills.join(", ")));
        }
        if !self.domains_of_interest.is_empty() {
            parts.push(format!("Domains: {}", self.domains_of_interest.join(", ")));
        }
        for exp in &self.experience {
            let line = [exp.role.as_deref(), exp.company.as_deref(), exp.details.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" - ");
            if !line.is_empty() {
                parts.push(line);
            }
        }
        for edu in &self.education {
            if let Some(degree) = &edu.degree {
                parts.push(degree.clone());
            }
        }
        for project in &self.projects {
            let mut line = project.name.clone().unwrap_or_default();
            if let Some(desc) = &project.description {
                line.push(' ');
                line.push_str(desc);
            }
            if !project.technologies.is_empty() {
                line.push(' ');
                line.push_str(&project.technologies.join(", "));
            }
            let line = line.trim().to_string();
            if !line.is_empty() {
                parts.push(line);
            }
        }

        parts.join("\n")
    }
}

// ============ Projects ============

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationMethod {
    Email,
    Link,
    #[default]
    Other,
}

impl ApplicationMethod {
    /// Lenient parse; anything unrecognised is `Other`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" | "e-mail" | "mail" => ApplicationMethod::Email,
            "link" | "url" | "web" => ApplicationMethod::Link,
            _ => ApplicationMethod::Other,
        }
    }
}

/// A project record as it arrives from extraction: every field optional,
/// strings possibly padded, technologies either a list or a comma string.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawProject {
    #[serde(deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub description: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub company: Option<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub technologies: Vec<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub domain: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub supervisor: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub email: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub reference_id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub application_method: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub application_link: Option<String>,
}

/// A validated, normalized project with a stable identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub technologies: Vec<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub supervisor: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub application_method: ApplicationMethod,
    #[serde(default)]
    pub application_link: Option<String>,
    /// Provenance marker set when a field was back-filled rather than extracted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Prefilter similarity, attached by the embedding index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

impl Project {
    /// Deterministic identifier over normalized title, company and description.
    pub fn derive_id(title: &str, company: Option<&str>, description: &str) -> String {
        let key = format!(
            "{}\u{1f}{}\u{1f}{}",
            title.trim().to_lowercase(),
            company.unwrap_or("").trim().to_lowercase(),
            description.trim().to_lowercase()
        );
        format!("prj_{}", &hash_text(&key)[..16])
    }

    /// Text used for embedding: title, description and technologies.
    pub fn embedding_text(&self) -> String {
        format!(
            "{} {} {}",
            self.title,
            self.description,
            self.technologies.join(", ")
        )
        .trim()
        .to_string()
    }

    pub fn has_link(&self) -> bool {
        self.application_link
            .as_deref()
            .is_some_and(|l| !l.trim().is_empty())
    }
}

// ============ Match results ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation {
    #[serde(rename = "Strong Match")]
    Strong,
    #[serde(rename = "Good Match")]
    Good,
    #[serde(rename = "Potential Match")]
    Potential,
    #[serde(rename = "Low Match")]
    Low,
}

impl Recommendation {
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => Recommendation::Strong,
            65..=79 => Recommendation::Good,
            50..=64 => Recommendation::Potential,
            _ => Recommendation::Low,
        }
    }

    /// Accepts the backend's label in any case, with or without "Match".
    pub fn parse_label(label: &str) -> Option<Self> {
        let lower = label.trim().to_lowercase();
        if lower.starts_with("strong") {
            Some(Recommendation::Strong)
        } else if lower.starts_with("good") {
            Some(Recommendation::Good)
        } else if lower.starts_with("potential") {
            Some(Recommendation::Potential)
        } else if lower.starts_with("low") {
            Some(Recommendation::Low)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Strong => "Strong Match",
            Recommendation::Good => "Good Match",
            Recommendation::Potential => "Potential Match",
            Recommendation::Low => "Low Match",
        }
    }
}

/// Which backend produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreSource {
    Primary,
    Fallback,
    /// Sentinel results produced when every backend failed.
    None,
}

impl ScoreSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreSource::Primary => "primary",
            ScoreSource::Fallback => "fallback",
            ScoreSource::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    #[serde(default, deserialize_with = "lenient_score")]
    pub skills_match: u8,
    #[serde(default, deserialize_with = "lenient_score")]
    pub domain_match: u8,
    #[serde(default, deserialize_with = "lenient_score")]
    pub experience_match: u8,
}

/// The structured verdict a scoring backend returns, before project
/// metadata is attached.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Verdict {
    #[serde(deserialize_with = "lenient_optional_score")]
    pub overall_score: Option<u8>,
    pub breakdown: ScoreBreakdown,
    #[serde(deserialize_with = "lenient_list")]
    pub matching_points: Vec<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub gaps: Vec<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub recommendation: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub reasoning: Option<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub relevant_cv_snippets: Vec<String>,
}

/// A compatibility verdict for one (candidate, project) pair, with the
/// project's identifying metadata attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub project_id: String,
    pub project_title: String,
    pub company: Option<String>,
    pub reference_id: Option<String>,
    pub email: Option<String>,
    pub application_link: Option<String>,
    pub overall_score: u8,
    pub breakdown: ScoreBreakdown,
    pub matching_points: Vec<String>,
    pub gaps: Vec<String>,
    pub recommendation: Recommendation,
    pub reasoning: String,
    pub relevant_cv_snippets: Vec<String>,
    pub source: ScoreSource,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    pub scored_at: DateTime<Utc>,
}

impl MatchResult {
    /// Builds a fresh result from a verdict with a known score.
    pub fn from_verdict(verdict: Verdict, score: u8, project: &Project, source: ScoreSource) -> Self {
        let recommendation = verdict
            .recommendation
            .as_deref()
            .and_then(Recommendation::parse_label)
            .unwrap_or_else(|| Recommendation::from_score(score));

        Self {
            overall_score: score,
            breakdown: verdict.breakdown,
            matching_points: verdict.matching_points,
            gaps: verdict.gaps,
            recommendation,
            reasoning: verdict.reasoning.unwrap_or_default(),
            relevant_cv_snippets: verdict.relevant_cv_snippets,
            source,
            cached: false,
            error: None,
            scored_at: Utc::now(),
            ..Self::blank(project)
        }
    }

    /// Terminal result for a project no backend could score.
    pub fn failed(project: &Project, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::blank(project)
        }
    }

    fn blank(project: &Project) -> Self {
        Self {
            project_id: project.id.clone(),
            project_title: project.title.clone(),
            company: project.company.clone(),
            reference_id: project.reference_id.clone(),
            email: project.email.clone(),
            application_link: project.application_link.clone(),
            overall_score: 0,
            breakdown: ScoreBreakdown::default(),
            matching_points: Vec::new(),
            gaps: Vec::new(),
            recommendation: Recommendation::Low,
            reasoning: String::new(),
            relevant_cv_snippets: Vec::new(),
            source: ScoreSource::None,
            cached: false,
            error: None,
            similarity: project.similarity,
            scored_at: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ============ Stored documents ============

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Cv,
    ProjectBook,
    #[default]
    Other,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Cv => "cv",
            DocumentKind::ProjectBook => "project_book",
            DocumentKind::Other => "other",
        }
    }
}

impl FromStr for DocumentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cv" => Ok(DocumentKind::Cv),
            "project_book" => Ok(DocumentKind::ProjectBook),
            "other" => Ok(DocumentKind::Other),
            other => anyhow::bail!(
                "Unknown document kind: '{}'. Must be cv, project_book, or other.",
                other
            ),
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical record in the content-addressed store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDocument {
    pub id: i64,
    pub hash: String,
    pub original_name: String,
    pub path: String,
    pub size: i64,
    pub mime: Option<String>,
    pub logical_type: DocumentKind,
    pub uploaded_at: i64,
}

// ============ Lenient deserializers ============

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

fn lenient_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        _ => Vec::new(),
    })
}

/// Reads a 0–100 score from an integer, float, or numeric string.
fn score_from_value(value: &Value) -> Option<u8> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if raw.is_nan() {
        return None;
    }
    Some(raw.round().clamp(0.0, 100.0) as u8)
}

fn lenient_optional_score<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(score_from_value(&value))
}

fn lenient_score<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(score_from_value(&value).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn project() -> Project {
        Project {
            id: Project::derive_id("Rust Backend", Some("Acme"), "Build services"),
            title: "Rust Backend".to_string(),
            description: "Build services".to_string(),
            company: Some("Acme".to_string()),
            technologies: vec!["Rust".to_string(), "SQL".to_string()],
            domain: None,
            supervisor: None,
            email: Some("jobs@acme.test".to_string()),
            reference_id: Some("REF-1".to_string()),
            application_method: ApplicationMethod::Email,
            application_link: None,
            note: None,
            similarity: None,
        }
    }

    #[test]
    fn test_derive_id_is_stable_and_normalized() {
        let a = Project::derive_id("Rust Backend", Some("Acme"), "Build services");
        let b = Project::derive_id("  rust backend ", Some("ACME"), "build services\n");
        assert_eq!(a, b);
        assert!(a.starts_with("prj_"));
        assert_eq!(a.len(), 4 + 16);
        assert_ne!(a, Project::derive_id("Rust Backend", None, "Build services"));
    }

    #[test]
    fn test_candidate_hash_ignores_key_order() {
        let a: CandidateProfile =
            serde_json::from_value(json!({"skills": {"technical": ["Rust"]}, "domains_of_interest": ["AI"]}))
                .unwrap();
        let b: CandidateProfile =
            serde_json::from_value(json!({"domains_of_interest": ["AI"], "skills": {"technical": ["Rust"]}}))
                .unwrap();
        assert_eq!(a.content_hash(), b.content_hash());

        let c: CandidateProfile =
            serde_json::from_value(json!({"domains_of_interest": ["Web"]})).unwrap();
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn test_candidate_embedding_text_mentions_skills() {
        let cv: CandidateProfile = serde_json::from_value(json!({
            "skills": {"technical": ["Rust", "Python"], "tools": ["Docker"]},
            "experience": [{"role": "Intern", "company": "Acme"}],
            "domains_of_interest": ["Backend"]
        }))
        .unwrap();
        let text = cv.embedding_text();
        assert!(text.contains("Rust, Python, Docker"));
        assert!(text.contains("Intern - Acme"));
        assert!(text.contains("Backend"));
    }

    #[test]
    fn test_raw_project_accepts_loose_shapes() {
        let raw: RawProject = serde_json::from_value(json!({
            "title": "  API ",
            "description": "desc",
            "technologies": "Rust, Tokio ,",
            "reference_id": 42,
            "application_link": null
        }))
        .unwrap();
        assert_eq!(raw.title.as_deref(), Some("  API "));
        assert_eq!(raw.technologies, vec!["Rust", "Tokio"]);
        assert_eq!(raw.reference_id.as_deref(), Some("42"));
        assert!(raw.application_link.is_none());
    }

    #[test]
    fn test_verdict_scores_are_lenient() {
        let v: Verdict = serde_json::from_value(json!({
            "overall_score": "87.6",
            "breakdown": {"skills_match": 120, "domain_match": "x"}
        }))
        .unwrap();
        assert_eq!(v.overall_score, Some(88));
        assert_eq!(v.breakdown.skills_match, 100);
        assert_eq!(v.breakdown.domain_match, 0);

        let missing: Verdict = serde_json::from_value(json!({"gaps": ["Go"]})).unwrap();
        assert_eq!(missing.overall_score, None);
        assert_eq!(missing.gaps, vec!["Go"]);
    }

    #[test]
    fn test_recommendation_from_label_or_score() {
        assert_eq!(
            Recommendation::parse_label("strong match"),
            Some(Recommendation::Strong)
        );
        assert_eq!(Recommendation::parse_label("maybe"), None);
        assert_eq!(Recommendation::from_score(80), Recommendation::Strong);
        assert_eq!(Recommendation::from_score(65), Recommendation::Good);
        assert_eq!(Recommendation::from_score(50), Recommendation::Potential);
        assert_eq!(Recommendation::from_score(49), Recommendation::Low);

        let json = serde_json::to_value(Recommendation::Potential).unwrap();
        assert_eq!(json, "Potential Match");
    }

    #[test]
    fn test_from_verdict_attaches_project_metadata() {
        let p = project();
        let verdict = Verdict {
            overall_score: Some(72),
            recommendation: Some("nonsense".to_string()),
            ..Verdict::default()
        };
        let r = MatchResult::from_verdict(verdict, 72, &p, ScoreSource::Primary);
        assert_eq!(r.project_id, p.id);
        assert_eq!(r.company.as_deref(), Some("Acme"));
        assert_eq!(r.reference_id.as_deref(), Some("REF-1"));
        assert_eq!(r.email.as_deref(), Some("jobs@acme.test"));
        assert_eq!(r.recommendation, Recommendation::Good);
        assert_eq!(r.source, ScoreSource::Primary);
        assert!(!r.is_error());
    }

    #[test]
    fn test_failed_result_is_zero_with_error() {
        let r = MatchResult::failed(&project(), "both backends down");
        assert_eq!(r.overall_score, 0);
        assert_eq!(r.source, ScoreSource::None);
        assert_eq!(r.error.as_deref(), Some("both backends down"));
        assert_eq!(r.project_title, "Rust Backend");

        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["source"], "none");
        assert_eq!(json["error"], "both backends down");
    }

    #[test]
    fn test_document_kind_parse() {
        assert_eq!("cv".parse::<DocumentKind>().unwrap(), DocumentKind::Cv);
        assert_eq!(
            "project_book".parse::<DocumentKind>().unwrap(),
            DocumentKind::ProjectBook
        );
        assert!("pdf".parse::<DocumentKind>().is_err());
    }
}
