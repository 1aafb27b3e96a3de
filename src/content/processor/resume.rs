use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{keyword_signal, ChunkAnnotation, DomainProcessor, ProcessedDocument};
use crate::llm::{ChatMessage, ChatModel, GenerationParams};

const RESUME_SIGNALS: &[&str] = &[
    "work experience",
    "professional experience",
    "education",
    "skills",
    "curriculum vitae",
    "objective",
    "certifications",
    "references available",
    "employment history",
];

const SECTION_HEADERS: &[&str] = &[
    "work experience",
    "professional experience",
    "employment history",
    "education",
    "skills",
    "certifications",
    "projects",
];

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("static regex"));
static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\+\d{1,3}[\s.-]?)?(\(\d{2,4}\)[\s.-]?)?\d{3}[\s.-]?\d{3,4}[\s.-]?\d{0,4}")
        .expect("static regex")
});
static YEAR_RANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(19|20)\d{2}\s*[-–]\s*((19|20)\d{2}|present)").expect("static regex"));

const EXTRACTION_PROMPT: &str = "Extract structured data from this resume. \
Respond with a single JSON object and nothing else, with keys: \
name (string), email (string), phone (string), skills (array of strings), \
companies (array of strings), titles (array of strings), \
education (array of strings). Use null for anything absent.";

/// Minimum integrity score for accepting the LLM extraction.
const MIN_INTEGRITY: f32 = 0.3;

#[derive(Debug, Default, Deserialize)]
struct ExtractedResume {
    name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    #[serde(default)]
    skills: Vec<String>,
    #[serde(default)]
    companies: Vec<String>,
    #[serde(default)]
    titles: Vec<String>,
    #[serde(default)]
    education: Vec<String>,
}

/// Resume processor. Prefers LLM extraction; falls back to regex heuristics
/// when the extraction is incoherent (integrity below threshold) or errors.
pub struct ResumeProcessor {
    chat_model: Arc<dyn ChatModel>,
    llm_enabled: bool,
}

impl ResumeProcessor {
    pub fn new(chat_model: Arc<dyn ChatModel>, llm_enabled: bool) -> Self {
        Self {
            chat_model,
            llm_enabled,
        }
    }

    /// Extract the first JSON object from possibly noisy LLM output,
    /// handling nested braces and braces inside strings.
    fn extract_first_json_object(s: &str) -> Option<&str> {
        let mut start: Option<usize> = None;
        let mut depth: i32 = 0;
        let mut in_string = false;
        let mut escaped = false;

        for (i, ch) in s.char_indices() {
            if start.is_none() {
                if ch == '{' {
                    start = Some(i);
                    depth = 1;
                }
                continue;
            }

            if in_string {
                if escaped {
                    escaped = false;
                    continue;
                }
                match ch {
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }

            match ch {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(&s[start?..=i]);
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// How internally consistent the extraction is: fields present, and the
    /// email/phone agreeing with what a regex sees in the raw text.
    fn integrity_score(extracted: &ExtractedResume, content: &str) -> f32 {
        let mut score = 0.0f32;
        let mut checks = 0.0f32;

        checks += 1.0;
        if extracted.name.as_deref().is_some_and(|n| !n.trim().is_empty()) {
            score += 1.0;
        }

        checks += 1.0;
        match (&extracted.email, EMAIL.find(content)) {
            (Some(email), Some(found)) if email.eq_ignore_ascii_case(found.as_str()) => {
                score += 1.0
            }
            (None, None) => score += 1.0,
            (Some(_), Some(_)) => score += 0.5,
            _ => {}
        }

        checks += 1.0;
        if !extracted.skills.is_empty() {
            score += 1.0;
        }

        checks += 1.0;
        if !extracted.companies.is_empty() || !extracted.titles.is_empty() {
            score += 1.0;
        }

        score / checks
    }

    async fn llm_extract(&self, content: &str) -> Result<(ExtractedResume, f32)> {
        // Resumes are short; cap what we send anyway
        let snippet: String = content.chars().take(8000).collect();
        let prompt = format!("{}\n\nResume:\n{}", EXTRACTION_PROMPT, snippet);

        let output = self
            .chat_model
            .complete(vec![ChatMessage::user(prompt)], &GenerationParams::default())
            .await
            .map_err(|e| anyhow::anyhow!("resume extraction call failed: {}", e))?;

        let json_str = Self::extract_first_json_object(&output)
            .ok_or_else(|| anyhow::anyhow!("no JSON object in extraction output"))?;
        let extracted: ExtractedResume = serde_json::from_str(json_str)?;
        let integrity = Self::integrity_score(&extracted, content);
        Ok((extracted, integrity))
    }

    fn regex_extract(content: &str) -> ExtractedResume {
        ExtractedResume {
            name: content
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(String::from),
            email: EMAIL.find(content).map(|m| m.as_str().to_string()),
            phone: PHONE
                .find(content)
                .map(|m| m.as_str().trim().to_string())
                .filter(|p| p.len() >= 7),
            ..Default::default()
        }
    }

    fn apply(
        &self,
        content: &str,
        extracted: ExtractedResume,
        method: &str,
    ) -> ProcessedDocument {
        let mut processed = ProcessedDocument::passthrough(content, self.name(), 0.8);
        let meta = &mut processed.document_metadata;

        meta.insert("document_kind".to_string(), json!("resume"));
        meta.insert("extraction_method".to_string(), json!(method));
        if let Some(name) = extracted.name {
            meta.insert("candidate_name".to_string(), json!(name));
        }
        if let Some(email) = extracted.email {
            meta.insert("email".to_string(), json!(email));
        }
        if let Some(phone) = extracted.phone {
            meta.insert("phone".to_string(), json!(phone));
        }
        if !extracted.skills.is_empty() {
            meta.insert("skills".to_string(), json!(extracted.skills));
        }
        if !extracted.companies.is_empty() {
            meta.insert("companies".to_string(), json!(extracted.companies));
        }
        if !extracted.titles.is_empty() {
            meta.insert("titles".to_string(), json!(extracted.titles));
        }
        if !extracted.education.is_empty() {
            meta.insert("education".to_string(), json!(extracted.education));
        }

        // Keep each resume section whole
        let lower = content.to_lowercase();
        for header in SECTION_HEADERS {
            for (offset, _) in lower.match_indices(header) {
                let at_line_start = offset == 0
                    || content.as_bytes().get(offset.wrapping_sub(1)) == Some(&b'\n');
                if at_line_start && offset > 0 {
                    processed
                        .annotations
                        .push(ChunkAnnotation::boundary("resume_section", offset));
                }
            }
        }

        processed
    }
}

#[async_trait]
impl DomainProcessor for ResumeProcessor {
    fn name(&self) -> &'static str {
        "resume"
    }

    fn can_process(&self, content: &str, _metadata: &Map<String, Value>) -> f32 {
        let lower = content.to_lowercase();
        let mut score = keyword_signal(&lower, RESUME_SIGNALS, 3);
        if EMAIL.is_match(content) && YEAR_RANGE.is_match(&lower) {
            score += 0.2;
        }
        // Resumes are short; a 200-page PDF is not one
        if content.split_whitespace().count() > 5000 {
            score *= 0.3;
        }
        score.min(0.95)
    }

    async fn process(
        &self,
        content: &str,
        _metadata: &Map<String, Value>,
        _filename: Option<&str>,
    ) -> Result<ProcessedDocument> {
        if self.llm_enabled {
            match self.llm_extract(content).await {
                Ok((extracted, integrity)) if integrity >= MIN_INTEGRITY => {
                    debug!(integrity, "resume LLM extraction accepted");
                    return Ok(self.apply(content, extracted, "llm"));
                }
                Ok((_, integrity)) => {
                    warn!(integrity, "resume extraction below integrity threshold, using regex");
                }
                Err(e) => {
                    warn!("resume LLM extraction failed, using regex: {}", e);
                }
            }
        }

        Ok(self.apply(content, Self::regex_extract(content), "regex"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::chat::MockChatModel;
    use crate::utils::ApiError;

    const RESUME: &str = "Jane Doe\njane.doe@example.com | +1 555 123 4567\n\n\
Work Experience\nAcme Corp, Senior Engineer, 2019-2023\n\n\
Education\nBSc Computer Science\n\nSkills\nRust, Postgres, Kubernetes";

    fn processor(model: MockChatModel, llm: bool) -> ResumeProcessor {
        ResumeProcessor::new(Arc::new(model), llm)
    }

    #[test]
    fn resumes_score_above_threshold() {
        let p = processor(MockChatModel::new(), false);
        assert!(p.can_process(RESUME, &Map::new()) >= 0.3);
    }

    #[test]
    fn json_extraction_survives_noise() {
        let noisy = "Sure! Here is the JSON:\n{\"name\": \"Jane {Doe}\", \"email\": null}\nDone.";
        let json = ResumeProcessor::extract_first_json_object(noisy).unwrap();
        assert_eq!(json, "{\"name\": \"Jane {Doe}\", \"email\": null}");
    }

    #[tokio::test]
    async fn accepts_coherent_llm_extraction() {
        let mut model = MockChatModel::new();
        model.expect_complete().returning(|_, _| {
            Ok(r#"{"name": "Jane Doe", "email": "jane.doe@example.com",
                   "phone": "+1 555 123 4567", "skills": ["Rust"],
                   "companies": ["Acme Corp"], "titles": ["Senior Engineer"],
                   "education": ["BSc Computer Science"]}"#
                .to_string())
        });

        let processed = processor(model, true)
            .process(RESUME, &Map::new(), None)
            .await
            .unwrap();
        assert_eq!(processed.document_metadata["extraction_method"], "llm");
        assert_eq!(processed.document_metadata["candidate_name"], "Jane Doe");
    }

    #[tokio::test]
    async fn falls_back_to_regex_on_llm_error() {
        let mut model = MockChatModel::new();
        model
            .expect_complete()
            .returning(|_, _| Err(ApiError::Upstream("provider down".to_string())));

        let processed = processor(model, true)
            .process(RESUME, &Map::new(), None)
            .await
            .unwrap();
        assert_eq!(processed.document_metadata["extraction_method"], "regex");
        assert_eq!(processed.document_metadata["email"], "jane.doe@example.com");
    }

    #[tokio::test]
    async fn falls_back_to_regex_on_low_integrity() {
        let mut model = MockChatModel::new();
        // Wrong email, no name, no skills: integrity below 0.3
        model
            .expect_complete()
            .returning(|_, _| Ok(r#"{"email": "other@example.com"}"#.to_string()));

        let processed = processor(model, true)
            .process(RESUME, &Map::new(), None)
            .await
            .unwrap();
        assert_eq!(processed.document_metadata["extraction_method"], "regex");
    }

    #[tokio::test]
    async fn section_headers_become_boundaries() {
        let processed = processor(MockChatModel::new(), false)
            .process(RESUME, &Map::new(), None)
            .await
            .unwrap();
        // Work Experience, Education, Skills
        assert_eq!(processed.hard_boundaries().len(), 3);
    }
}
