//! Prompt assembly: preset styles, citation formatting, and context layout.

use crate::models::chat::Preset;
use crate::models::retrieval::RetrievalResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CitationStyle {
    Inline,
    Academic,
    AcademicFull,
    Narrative,
}

impl Preset {
    /// Citation style bundled with each preset.
    pub fn citation_style(&self) -> CitationStyle {
        match self {
            Preset::Brief => CitationStyle::Inline,
            Preset::Comprehensive => CitationStyle::Academic,
            Preset::Academic => CitationStyle::AcademicFull,
            Preset::Technical => CitationStyle::Inline,
            Preset::Exploratory => CitationStyle::Narrative,
            Preset::Qna => CitationStyle::Academic,
        }
    }
}

fn style_instructions(preset: Preset) -> &'static str {
    match preset {
        Preset::Brief => {
            "Answer briefly and directly. Two or three sentences unless more is \
             strictly necessary. Cite sources inline with [1], [2] markers."
        }
        Preset::Comprehensive => {
            "Give a thorough, well-organized answer covering the relevant aspects \
             of the question. Use [1], [2] citations for every claim drawn from \
             the context, and note when the context does not cover something."
        }
        Preset::Academic => {
            "Answer in a formal academic register. Attribute every claim to its \
             source with numbered citations, discuss limitations, and close with \
             the reference list."
        }
        Preset::Technical => {
            "Answer with technical precision. Prefer exact terms, include \
             parameter names, commands or values verbatim from the context, and \
             cite sources inline with [1], [2] markers."
        }
        Preset::Exploratory => {
            "Explore the question openly, connecting ideas across the sources in \
             a narrative voice. Name the source documents as you draw on them."
        }
        Preset::Qna => {
            "Answer the question directly first, then add supporting detail. \
             Cite with [1], [2] markers. If the context lacks the answer, say so \
             plainly."
        }
    }
}

/// Chunks + graph context -> system prompt with citations.
pub struct PromptAssembler;

impl PromptAssembler {
    /// Returns `(context_text, references_text)` with citation markers laid
    /// out per the given style.
    pub fn format_context_with_citations(
        results: &[RetrievalResult],
        style: CitationStyle,
    ) -> (String, String) {
        if results.is_empty() {
            return (String::new(), String::new());
        }
        match style {
            CitationStyle::Narrative => Self::format_narrative(results),
            CitationStyle::AcademicFull => Self::format_academic(results, true),
            _ => Self::format_academic(results, false),
        }
    }

    fn result_title(result: &RetrievalResult, ordinal: usize) -> String {
        result
            .document
            .title
            .clone()
            .or_else(|| result.document.filename.clone())
            .unwrap_or_else(|| format!("Document {}", ordinal))
    }

    fn result_text(result: &RetrievalResult) -> &str {
        result
            .expanded_content
            .as_deref()
            .unwrap_or(&result.content)
    }

    fn format_academic(results: &[RetrievalResult], full: bool) -> (String, String) {
        let mut context_parts = Vec::with_capacity(results.len());
        let mut references = Vec::with_capacity(results.len());

        for (i, result) in results.iter().enumerate() {
            let n = i + 1;
            context_parts.push(format!("[{}] {}", n, Self::result_text(result)));

            let mut reference = format!("[{}] {}", n, Self::result_title(result, n));
            if full {
                if let Some(author) = result.document.metadata.get("author").and_then(|a| a.as_str())
                {
                    reference.push_str(&format!(" - {}", author));
                }
                if let Some(date) = result.document.metadata.get("date").and_then(|d| d.as_str()) {
                    reference.push_str(&format!(" ({})", date));
                }
            }
            references.push(reference);
        }

        (context_parts.join("\n\n"), references.join("\n"))
    }

    fn format_narrative(results: &[RetrievalResult]) -> (String, String) {
        let mut context_parts = Vec::with_capacity(results.len());
        let mut references = Vec::with_capacity(results.len());

        for (i, result) in results.iter().enumerate() {
            let title = Self::result_title(result, i + 1);
            context_parts.push(format!("From {}:\n{}", title, Self::result_text(result)));
            references.push(format!("- {}", title));
        }

        (context_parts.join("\n\n---\n\n"), references.join("\n"))
    }

    /// Build the system prompt. Graph context, being already synthesized,
    /// goes before the chunk context. A custom system prompt bypasses the
    /// preset template but still receives the formatted context.
    #[allow(clippy::too_many_arguments)]
    pub fn build_system_prompt(
        results: &[RetrievalResult],
        preset: Preset,
        graph_context: Option<&str>,
        custom_system_prompt: Option<&str>,
        custom_instruction: Option<&str>,
        is_follow_up: bool,
        previous_context: Option<&str>,
    ) -> String {
        let (context, references) =
            Self::format_context_with_citations(results, preset.citation_style());

        if let Some(custom) = custom_system_prompt {
            let mut prompt = custom.to_string();
            if let Some(graph) = graph_context {
                prompt.push_str("\n\nKnowledge graph context:\n");
                prompt.push_str(graph);
            }
            prompt.push_str("\n\nContext:\n");
            prompt.push_str(&context);
            return prompt;
        }

        let mut prompt = String::with_capacity(context.len() + 1024);
        prompt.push_str(
            "You are a knowledgeable assistant answering questions grounded in the \
             provided context.\n\n",
        );
        prompt.push_str(style_instructions(preset));
        prompt.push('\n');

        if let Some(instruction) = custom_instruction {
            prompt.push_str("\nAdditional instruction: ");
            prompt.push_str(instruction);
            prompt.push('\n');
        }

        if let Some(graph) = graph_context {
            prompt.push_str("\n## Knowledge graph context\n");
            prompt.push_str(graph);
            prompt.push('\n');
        }

        if is_follow_up {
            if let Some(previous) = previous_context {
                prompt.push_str("\n## Previous context\n");
                prompt.push_str(previous);
                prompt.push('\n');
            }
        }

        prompt.push_str("\n## Context\n");
        if context.is_empty() {
            prompt.push_str("(no relevant context was retrieved)\n");
        } else {
            prompt.push_str(&context);
            prompt.push('\n');
        }

        if !references.is_empty() {
            prompt.push_str("\n## References\n");
            prompt.push_str(&references);
            prompt.push('\n');
        }

        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::retrieval::DocumentRef;
    use serde_json::json;
    use uuid::Uuid;

    fn result(title: Option<&str>, content: &str, metadata: serde_json::Value) -> RetrievalResult {
        RetrievalResult {
            chunk_id: Uuid::new_v4(),
            content: content.to_string(),
            expanded_content: None,
            chunk_index: 0,
            score: 0.9,
            metadata: json!([]),
            chunk_metadata: json!({}),
            document: DocumentRef {
                id: Uuid::new_v4(),
                title: title.map(String::from),
                filename: Some("file.pdf".to_string()),
                metadata,
            },
            collection_id: Uuid::new_v4(),
            rerank_score: None,
        }
    }

    #[test]
    fn academic_citations_number_chunks_and_references() {
        let results = vec![
            result(Some("Raft Paper"), "Leaders are elected.", json!({})),
            result(None, "Logs replicate.", json!({})),
        ];
        let (context, references) =
            PromptAssembler::format_context_with_citations(&results, CitationStyle::Academic);
        assert!(context.starts_with("[1] Leaders are elected."));
        assert!(context.contains("[2] Logs replicate."));
        assert!(references.contains("[1] Raft Paper"));
        // Falls back to filename when title is missing
        assert!(references.contains("[2] file.pdf"));
    }

    #[test]
    fn academic_full_adds_author_and_date() {
        let results = vec![result(
            Some("Paper"),
            "text",
            json!({"author": "Ongaro", "date": "2014"}),
        )];
        let (_, references) =
            PromptAssembler::format_context_with_citations(&results, CitationStyle::AcademicFull);
        assert!(references.contains("Ongaro"));
        assert!(references.contains("(2014)"));
    }

    #[test]
    fn narrative_names_documents() {
        let results = vec![result(Some("Field Notes"), "It rained.", json!({}))];
        let (context, references) =
            PromptAssembler::format_context_with_citations(&results, CitationStyle::Narrative);
        assert!(context.starts_with("From Field Notes:"));
        assert!(references.contains("- Field Notes"));
    }

    #[test]
    fn graph_context_precedes_chunk_context() {
        let results = vec![result(Some("Doc"), "chunk text", json!({}))];
        let prompt = PromptAssembler::build_system_prompt(
            &results,
            Preset::Comprehensive,
            Some("graph synthesis"),
            None,
            None,
            false,
            None,
        );
        let graph_pos = prompt.find("graph synthesis").unwrap();
        let chunk_pos = prompt.find("chunk text").unwrap();
        assert!(graph_pos < chunk_pos);
    }

    #[test]
    fn custom_system_prompt_bypasses_templates_but_keeps_context() {
        let results = vec![result(Some("Doc"), "chunk text", json!({}))];
        let prompt = PromptAssembler::build_system_prompt(
            &results,
            Preset::Brief,
            None,
            Some("You are a pirate."),
            None,
            false,
            None,
        );
        assert!(prompt.starts_with("You are a pirate."));
        assert!(prompt.contains("chunk text"));
        assert!(!prompt.contains("Answer briefly"));
    }

    #[test]
    fn follow_up_preserves_previous_context_verbatim() {
        let prompt = PromptAssembler::build_system_prompt(
            &[],
            Preset::Qna,
            None,
            None,
            None,
            true,
            Some("[1] previously cited text"),
        );
        assert!(prompt.contains("[1] previously cited text"));
    }
}
