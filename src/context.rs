//! Prompt assembly for one chat turn.
//!
//! Merges the persona instruction, retrieved document excerpts, and web
//! snippets into a single system prompt, then appends the bounded
//! conversation history and the user's message. Every section respects
//! a character budget; when the assembled prompt still exceeds the total
//! budget, the lowest-priority material goes first: web snippets before
//! document excerpts, tail excerpts before head excerpts.
//!
//! Vision turns do not come through here: an image-bearing turn is a
//! single multimodal user message with no retrieved context.

use crate::completion::ChatMessage;
use crate::config::RetrievalConfig;
use crate::models::{ConversationTurn, RetrievalHit, WebSnippet};

/// Character budgets for the assembled system prompt.
#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub document_chars: usize,
    pub web_chars: usize,
    pub total_chars: usize,
}

impl From<&RetrievalConfig> for ContextBudget {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            document_chars: config.document_chars,
            web_chars: config.web_chars,
            total_chars: config.total_chars,
        }
    }
}

/// Render one retrieved chunk as a tagged excerpt.
fn render_hit(hit: &RetrievalHit) -> String {
    match hit.chunk.page_number {
        Some(page) => format!(
            "[{}, page {}] {}",
            hit.chunk.source_name, page, hit.chunk.text
        ),
        None => format!("[{}] {}", hit.chunk.source_name, hit.chunk.text),
    }
}

fn render_snippet(snippet: &WebSnippet) -> String {
    format!("[{}] {}", snippet.title, snippet.snippet)
}

/// Keep entries in priority order while they fit the section budget.
fn fit_entries(entries: Vec<String>, budget: usize) -> Vec<String> {
    let mut kept = Vec::new();
    let mut used = 0usize;
    for entry in entries {
        let cost = entry.len() + 2; // blank line between entries
        if used + cost > budget {
            break;
        }
        used += cost;
        kept.push(entry);
    }
    kept
}

fn render_prompt(persona: &str, doc_entries: &[String], web_entries: &[String]) -> String {
    let mut prompt = persona.to_string();
    if !doc_entries.is_empty() {
        prompt.push_str("\n\n## Document excerpts\n");
        prompt.push_str(&doc_entries.join("\n\n"));
    }
    if !web_entries.is_empty() {
        prompt.push_str("\n\n## Web results\n");
        prompt.push_str(&web_entries.join("\n\n"));
    }
    prompt
}

fn truncate_to(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Build the system prompt for one turn.
///
/// Retrieved hits must already be rank-ordered (highest similarity
/// first); their order decides what survives truncation.
pub fn build_system_prompt(
    persona: &str,
    hits: &[RetrievalHit],
    snippets: &[WebSnippet],
    budget: &ContextBudget,
) -> String {
    let mut doc_entries = fit_entries(hits.iter().map(render_hit).collect(), budget.document_chars);
    let mut web_entries = fit_entries(
        snippets.iter().map(render_snippet).collect(),
        budget.web_chars,
    );

    let mut prompt = render_prompt(persona, &doc_entries, &web_entries);

    // Over the total budget: web snippets go first, then tail excerpts.
    if prompt.len() > budget.total_chars && !web_entries.is_empty() {
        web_entries.clear();
        prompt = render_prompt(persona, &doc_entries, &web_entries);
    }
    while prompt.len() > budget.total_chars && doc_entries.len() > 1 {
        doc_entries.pop();
        prompt = render_prompt(persona, &doc_entries, &web_entries);
    }
    if prompt.len() > budget.total_chars && doc_entries.len() == 1 {
        let overshoot = prompt.len() - budget.total_chars;
        let keep = doc_entries[0].len().saturating_sub(overshoot);
        let truncated = truncate_to(&doc_entries[0], keep).to_string();
        doc_entries[0] = truncated;
        prompt = render_prompt(persona, &doc_entries, &web_entries);
    }

    prompt
}

/// Sliding window over the conversation history: the last `window`
/// turns, oldest first.
pub fn bounded_history(history: &[ConversationTurn], window: usize) -> &[ConversationTurn] {
    let start = history.len().saturating_sub(window);
    &history[start..]
}

/// Assemble the full message list for a text turn: system prompt,
/// bounded history in arrival order, then the new user message.
pub fn to_messages(
    system: &str,
    history: &[ConversationTurn],
    window: usize,
    user_text: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len().min(window) + 2);
    messages.push(ChatMessage::system(system));
    for turn in bounded_history(history, window) {
        messages.push(ChatMessage::from_turn(turn));
    }
    messages.push(ChatMessage::user(user_text));
    messages
}

/// Assemble the message list for a vision turn: the persona plus one
/// multimodal user message. Retrieval and web context are skipped by
/// design; image analysis takes precedence for the turn.
pub fn to_multimodal_messages(
    persona: &str,
    user_text: &str,
    media_type: &str,
    image: &[u8],
) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(persona),
        ChatMessage::user_with_image(user_text, media_type, image),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Role, TextChunk};

    fn hit(source: &str, page: Option<u32>, text: &str) -> RetrievalHit {
        RetrievalHit {
            chunk: TextChunk {
                chunk_id: "c".to_string(),
                text: text.to_string(),
                source_name: source.to_string(),
                page_number: page,
                char_offset: 0,
                hash: String::new(),
            },
            score: 0.9,
        }
    }

    fn snippet(title: &str, text: &str) -> WebSnippet {
        WebSnippet {
            title: title.to_string(),
            snippet: text.to_string(),
        }
    }

    fn budget(doc: usize, web: usize, total: usize) -> ContextBudget {
        ContextBudget {
            document_chars: doc,
            web_chars: web,
            total_chars: total,
        }
    }

    #[test]
    fn empty_inputs_yield_persona_only() {
        let prompt = build_system_prompt("persona", &[], &[], &budget(6000, 2000, 9000));
        assert_eq!(prompt, "persona");
        assert!(!prompt.contains("Document excerpts"));
        assert!(!prompt.contains("Web results"));
    }

    #[test]
    fn excerpts_are_tagged_with_source_and_page() {
        let hits = vec![
            hit("contract.pdf", Some(2), "Refunds are available within 30 days."),
            hit("memo.docx", None, "Quarterly update."),
        ];
        let prompt = build_system_prompt("persona", &hits, &[], &budget(6000, 2000, 9000));
        assert!(prompt.contains("[contract.pdf, page 2] Refunds are available within 30 days."));
        assert!(prompt.contains("[memo.docx] Quarterly update."));
    }

    #[test]
    fn document_budget_drops_tail_before_head() {
        let hits = vec![
            hit("a.pdf", Some(1), &"head ".repeat(20)),
            hit("a.pdf", Some(2), &"tail ".repeat(20)),
        ];
        let prompt = build_system_prompt("p", &hits, &[], &budget(130, 2000, 9000));
        assert!(prompt.contains("head"));
        assert!(!prompt.contains("tail"));
    }

    #[test]
    fn web_budget_caps_snippets() {
        let snippets = vec![
            snippet("First", &"x".repeat(80)),
            snippet("Second", &"y".repeat(80)),
        ];
        let prompt = build_system_prompt("p", &[], &snippets, &budget(6000, 100, 9000));
        assert!(prompt.contains("First"));
        assert!(!prompt.contains("Second"));
    }

    #[test]
    fn total_budget_drops_web_before_documents() {
        let hits = vec![hit("a.pdf", Some(1), &"doc ".repeat(40))];
        let snippets = vec![snippet("Web", &"web ".repeat(40))];
        // Each section fits its own budget, but not both together.
        let prompt = build_system_prompt("p", &hits, &snippets, &budget(400, 400, 250));
        assert!(prompt.contains("doc"));
        assert!(!prompt.contains("Web results"));
    }

    #[test]
    fn single_oversized_excerpt_is_truncated_not_dropped() {
        let hits = vec![hit("a.pdf", Some(1), &"z".repeat(500))];
        let prompt = build_system_prompt("p", &hits, &[], &budget(600, 100, 200));
        assert!(prompt.len() <= 200);
        assert!(prompt.contains("[a.pdf, page 1]"));
    }

    #[test]
    fn history_window_keeps_most_recent_turns() {
        let history: Vec<ConversationTurn> = (0..10)
            .map(|i| ConversationTurn::new(Role::User, format!("turn {}", i)))
            .collect();
        let window = bounded_history(&history, 3);
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].content, "turn 7");
        assert_eq!(window[2].content, "turn 9");
    }

    #[test]
    fn message_list_orders_system_history_user() {
        let history = vec![
            ConversationTurn::new(Role::User, "first question"),
            ConversationTurn::new(Role::Assistant, "first answer"),
        ];
        let messages = to_messages("sys", &history, 20, "second question");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(messages[3].role, "user");
    }

    #[test]
    fn multimodal_messages_carry_no_retrieved_context() {
        let messages = to_multimodal_messages("persona", "what is this?", "image/png", &[1, 2]);
        assert_eq!(messages.len(), 2);
        assert!(!messages[0].is_multimodal());
        assert!(messages[1].is_multimodal());
        let json = serde_json::to_value(&messages[0]).unwrap();
        assert_eq!(json["content"], "persona");
    }
}
