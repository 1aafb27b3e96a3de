//! Cheap token estimation for prompt budgeting.
//!
//! Exact counts come from the tokenizer at chunking time; this word-based
//! heuristic (~1.3 tokens per word) is for places where an approximation is
//! enough, like trimming chat history to a budget.

/// Estimate tokens from text using a word-based heuristic.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let words = text.split_whitespace().count();

    // ~1.3 tokens per word plus a small formatting overhead
    ((words as f64 * 1.3) + 5.0).ceil() as usize
}

/// Check if adding text would exceed a token budget.
pub fn would_exceed_limit(current_tokens: usize, new_text: &str, max_tokens: usize) -> bool {
    current_tokens + estimate_tokens(new_text) > max_tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_scale_with_words() {
        let short = estimate_tokens("retrieval augmented generation");
        let long = estimate_tokens(&"word ".repeat(100));
        assert!(short < long);
        // 100 * 1.3 + 5 = 135
        assert_eq!(long, 135);
    }

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn budget_check() {
        let text = "word ".repeat(500);
        assert!(would_exceed_limit(1000, &text, 1500));
        assert!(!would_exceed_limit(1000, &text, 2000));
    }
}
