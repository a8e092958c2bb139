//! Validation, cleanup and de-duplication of extracted project lists.
//!
//! Extraction output is noisy: the same listing appears on several pages,
//! titles differ only by punctuation, and most listings omit the
//! application link that one "apply here" page gives for all of them.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use similar::TextDiff;

use crate::models::{ApplicationMethod, Project, RawProject};

/// Titles more similar than this (ratio in `[0, 1]`) are duplicates.
pub const DUPLICATE_TITLE_RATIO: f32 = 0.85;

/// Substrings marking a link as a general application portal.
pub const PORTAL_KEYWORDS: &[&str] = &[
    "stage",
    "career",
    "carriere",
    "job",
    "recrut",
    "apply",
    "candidature",
    "portal",
    "talent",
    "intern",
];

pub const INFERRED_LINK_NOTE: &str = "Inferred from global context";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeStats {
    pub input: usize,
    pub invalid: usize,
    pub duplicates: usize,
    pub kept: usize,
    pub links_found_in_text: usize,
    pub links_propagated: usize,
}

const URL_PATTERN: &str =
    r#"(?i)(https?://[^\s<>"]+|www\.[^\s<>"]+|bit\.ly/[^\s<>"]+|forms\.gle/[^\s<>"]+)"#;

pub struct Normalizer {
    url: Regex,
}

impl Normalizer {
    pub fn new() -> Result<Self> {
        let url = Regex::new(URL_PATTERN).context("failed to compile URL regex")?;
        Ok(Self { url })
    }

    /// First URL-like span in `text`, without trailing sentence punctuation.
    pub fn find_url(&self, text: &str) -> Option<String> {
        self.url
            .find(text)
            .map(|m| {
                m.as_str()
                    .trim_end_matches(['.', ',', ';', ':', ')', ']', '}', '\'', '!', '?'])
                    .to_string()
            })
            .filter(|u| !u.is_empty())
    }

    /// Normalizes a raw list in order: validate, trim, recover links from
    /// descriptions, assign ids, drop near-duplicate titles (first seen wins),
    /// then back-fill a shared portal link into records that still lack one.
    pub fn normalize(&self, raw: Vec<RawProject>) -> (Vec<Project>, NormalizeStats) {
        let mut stats = NormalizeStats {
            input: raw.len(),
            ..NormalizeStats::default()
        };
        let mut accepted: Vec<Project> = Vec::new();

        for record in raw {
            let Some(mut project) = validate(record) else {
                stats.invalid += 1;
                continue;
            };

            if !project.has_link() {
                if let Some(url) = self.find_url(&project.description) {
                    tracing::debug!(title = %project.title, url = %url, "link recovered from description");
                    project.application_link = Some(url);
                    project.application_method = ApplicationMethod::Link;
                    stats.links_found_in_text += 1;
                }
            }

            if accepted
                .iter()
                .any(|seen| title_similarity(&project.title, &seen.title) > DUPLICATE_TITLE_RATIO)
            {
                tracing::debug!(title = %project.title, "duplicate project dropped");
                stats.duplicates += 1;
                continue;
            }

            accepted.push(project);
        }

        stats.links_propagated = propagate_portal_link(&mut accepted);
        stats.kept = accepted.len();

        tracing::info!(
            input = stats.input,
            kept = stats.kept,
            invalid = stats.invalid,
            duplicates = stats.duplicates,
            links_found = stats.links_found_in_text,
            links_propagated = stats.links_propagated,
            "normalized projects"
        );

        (accepted, stats)
    }
}

/// One-shot convenience over [`Normalizer`].
pub fn normalize_projects(raw: Vec<RawProject>) -> Result<(Vec<Project>, NormalizeStats)> {
    Ok(Normalizer::new()?.normalize(raw))
}

/// Case-insensitive similarity ratio, `2·matches / total_chars`.
pub fn title_similarity(a: &str, b: &str) -> f32 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    TextDiff::from_chars(a.as_str(), b.as_str()).ratio()
}

pub fn is_portal_link(link: &str) -> bool {
    let lower = link.to_lowercase();
    PORTAL_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Trims fields and assigns the id; `None` when title or description is missing.
fn validate(raw: RawProject) -> Option<Project> {
    let title = non_empty(raw.title)?;
    let description = non_empty(raw.description)?;
    let company = non_empty(raw.company);
    let application_link = non_empty(raw.application_link);

    let application_method = match raw.application_method.as_deref() {
        Some(m) => ApplicationMethod::parse_lenient(m),
        None if application_link.is_some() => ApplicationMethod::Link,
        None if raw.email.as_deref().is_some_and(|e| !e.trim().is_empty()) => {
            ApplicationMethod::Email
        }
        None => ApplicationMethod::Other,
    };

    Some(Project {
        id: Project::derive_id(&title, company.as_deref(), &description),
        title,
        description,
        company,
        technologies: raw.technologies,
        domain: non_empty(raw.domain),
        supervisor: non_empty(raw.supervisor),
        email: non_empty(raw.email),
        reference_id: non_empty(raw.reference_id),
        application_method,
        application_link,
        note: None,
        similarity: None,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Copies the first portal-looking link into every project without one.
/// Returns how many projects were back-filled.
fn propagate_portal_link(projects: &mut [Project]) -> usize {
    let Some(portal) = projects
        .iter()
        .filter_map(|p| p.application_link.as_deref())
        .find(|link| is_portal_link(link))
        .map(str::to_string)
    else {
        return 0;
    };

    let mut filled = 0;
    for project in projects.iter_mut().filter(|p| !p.has_link()) {
        project.application_link = Some(portal.clone());
        project.application_method = ApplicationMethod::Link;
        project.note = Some(INFERRED_LINK_NOTE.to_string());
        filled += 1;
    }

    if filled > 0 {
        tracing::info!(link = %portal, filled, "propagated portal link");
    }
    filled
}
