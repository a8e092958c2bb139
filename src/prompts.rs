//! Prompt text for the scoring backends.
//!
//! Both contracts ask for the same JSON object so one [`crate::models::Verdict`]
//! parser serves both.

use anyhow::Result;
use serde_json::json;

use crate::models::{CandidateProfile, Project};

const RESPONSE_SHAPE: &str = r#"Return a JSON object with:
- "overall_score": int (0-100)
- "breakdown": {"skills_match": int, "domain_match": int, "experience_match": int}
- "matching_points": [str] (3-5 key strengths)
- "gaps": [str] (missing skills or requirements)
- "recommendation": "Strong Match" | "Good Match" | "Potential Match" | "Low Match"
- "reasoning": str (brief explanation of the score)
- "relevant_cv_snippets": [str] (2-3 sentences or bullet points from the CV most relevant to this project)"#;

/// Single-turn prompt for the primary backend.
pub fn matching_prompt(candidate: &CandidateProfile, project: &Project) -> Result<String> {
    Ok(format!(
        "You are an expert internship matcher. Evaluate the compatibility between a \
         student's CV and a project.\nAnalyze skills, domain knowledge, and experience.\n\n\
         CV DATA:\n{}\n\nPROJECT DATA:\n{}\n\n{}\n\nRespond with the JSON object only.",
        serde_json::to_string_pretty(candidate)?,
        serde_json::to_string_pretty(&project_payload(project))?,
        RESPONSE_SHAPE,
    ))
}

/// System message for the chat-completions fallback.
pub fn fallback_system_prompt() -> String {
    format!(
        "You are a strict evaluator of candidate-to-project fit. \
         Reply with a single JSON object and nothing else.\n\n{}",
        RESPONSE_SHAPE
    )
}

/// User message for the chat-completions fallback.
pub fn fallback_user_prompt(candidate: &CandidateProfile, project: &Project) -> Result<String> {
    Ok(format!(
        "Score this candidate against this project.\n\nCANDIDATE:\n{}\n\nPROJECT:\n{}",
        serde_json::to_string(candidate)?,
        serde_json::to_string(&project_payload(project))?,
    ))
}

/// The project fields a backend needs; transient and provenance fields are left out.
fn project_payload(project: &Project) -> serde_json::Value {
    json!({
        "title": project.title,
        "description": project.description,
        "company": project.company,
        "technologies": project.technologies,
        "domain": project.domain,
        "supervisor": project.supervisor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts_embed_both_sides() {
        let candidate: CandidateProfile = serde_json::from_value(json!({
            "skills": {"technical": ["Kubernetes"]}
        }))
        .unwrap();
        let project: Project = serde_json::from_value(json!({
            "id": "prj_1",
            "title": "Cluster autoscaler",
            "description": "Scale nodes",
            "similarity": 0.9
        }))
        .unwrap();

        let prompt = matching_prompt(&candidate, &project).unwrap();
        assert!(prompt.contains("Kubernetes"));
        assert!(prompt.contains("Cluster autoscaler"));
        assert!(prompt.contains("overall_score"));
        assert!(!prompt.contains("similarity"));

        let user = fallback_user_prompt(&candidate, &project).unwrap();
        assert!(user.contains("Kubernetes") && user.contains("Scale nodes"));
        assert!(fallback_system_prompt().contains("relevant_cv_snippets"));
    }
}
