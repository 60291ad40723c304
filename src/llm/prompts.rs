//! System prompts for the edge function.
//!
//! Both prompts demand numbered citations and a trailing `Sources:`
//! section; the answer splitter relies on that marker.

/// How much of the parent answer a follow-up prompt carries as context.
pub const PARENT_CONTEXT_CHARS: usize = 200;

/// Prompt for a fresh root query.
pub const INITIAL_SYSTEM_PROMPT: &str = "\
You are an AI search assistant. Answer the user's query accurately and \
concisely in markdown. Cite evidence inline with numbered references like \
[1], and finish your answer with a section that starts with the literal \
line `Sources:` followed by one numbered citation per line. Do not add \
anything after the sources.";

/// Prompt for a follow-up query, carrying a slice of the parent answer.
pub fn follow_up_system_prompt(parent_content: &str) -> String {
    let context: String = parent_content.chars().take(PARENT_CONTEXT_CHARS).collect();
    format!(
        "You are an AI search assistant answering a follow-up question. \
         The previous answer began: \"{context}\". Answer the follow-up in \
         the same style: markdown, numbered inline citations like [1], and \
         a final section starting with the literal line `Sources:` with one \
         numbered citation per line."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_follow_up_prompt_truncates_parent_context() {
        let long = "x".repeat(500);
        let prompt = follow_up_system_prompt(&long);
        assert!(prompt.contains(&"x".repeat(PARENT_CONTEXT_CHARS)));
        assert!(!prompt.contains(&"x".repeat(PARENT_CONTEXT_CHARS + 1)));
    }

    #[test]
    fn test_follow_up_prompt_is_multibyte_safe() {
        let parent = "ü".repeat(300);
        let prompt = follow_up_system_prompt(&parent);
        assert!(prompt.contains(&"ü".repeat(PARENT_CONTEXT_CHARS)));
    }

    #[test]
    fn test_prompts_demand_sources_section() {
        assert!(INITIAL_SYSTEM_PROMPT.contains("Sources:"));
        assert!(follow_up_system_prompt("context").contains("Sources:"));
    }
}
