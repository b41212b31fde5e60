//! Ordered sequential completion pipelines.
//!
//! The "multi-step review" flows are plain pipeline composition: each
//! stage is one completion call whose input is the previous stage's
//! output, with no shared state between stages beyond the text that is
//! explicitly passed along.

use anyhow::{Context, Result};

use crate::completion::{ChatBackend, ChatMessage};

/// One stage of a sequential pipeline.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: String,
    pub instruction: String,
}

impl StageSpec {
    pub fn new(name: &str, instruction: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            instruction: instruction.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageOutput {
    pub name: String,
    pub output: String,
}

/// Run stages in order. Stage N's user message is stage N-1's output
/// (stage 0 receives `input`); every stage's output is returned.
pub async fn run_stages(
    backend: &dyn ChatBackend,
    stages: &[StageSpec],
    input: &str,
) -> Result<Vec<StageOutput>> {
    let mut outputs = Vec::with_capacity(stages.len());
    let mut current = input.to_string();

    for stage in stages {
        let messages = vec![
            ChatMessage::system(stage.instruction.clone()),
            ChatMessage::user(current.clone()),
        ];
        let output = backend
            .complete(&messages)
            .await
            .with_context(|| format!("stage '{}' failed", stage.name))?;
        outputs.push(StageOutput {
            name: stage.name.clone(),
            output: output.clone(),
        });
        current = output;
    }

    Ok(outputs)
}

/// The document-audit pipeline: summarize, spot issues, write the
/// final report. `focus` narrows the review when given.
pub fn audit_stages(focus: Option<&str>) -> Vec<StageSpec> {
    let focus_line = match focus {
        Some(f) => format!(" Pay particular attention to: {}.", f),
        None => String::new(),
    };
    vec![
        StageSpec::new(
            "summary",
            "You are a document analyst. Summarize the document below: its \
             purpose, parties, obligations, and key terms. Be precise and keep \
             every concrete figure.",
        ),
        StageSpec::new(
            "issues",
            format!(
                "You are a reviewer. Given the summary below, list the risks, \
                 ambiguities, and missing provisions, each with a short \
                 explanation of why it matters.{}",
                focus_line
            ),
        ),
        StageSpec::new(
            "report",
            "Write a final review report from the findings below: a one-paragraph \
             overview, then numbered findings ordered by severity, then \
             recommended next steps.",
        ),
    ]
}

/// Per-document char budget for text fed into staged reviews and
/// comparisons, to respect the model's input limits.
pub const STAGE_INPUT_CHARS: usize = 8000;

/// Truncate review input to the stage budget on a char boundary.
pub fn bounded_stage_input(text: &str) -> &str {
    if text.len() <= STAGE_INPUT_CHARS {
        return text;
    }
    let mut end = STAGE_INPUT_CHARS;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Build the single-call redline prompt comparing two documents.
pub fn compare_messages(
    a_name: &str,
    a_text: &str,
    b_name: &str,
    b_text: &str,
) -> Vec<ChatMessage> {
    let user = format!(
        "Compare these two documents. Produce a table of differences, then \
         list what was added, changed, or removed in B relative to A.\n\n\
         DOCUMENT A ({}):\n{}\n\nDOCUMENT B ({}):\n{}",
        a_name,
        bounded_stage_input(a_text),
        b_name,
        bounded_stage_input(b_text),
    );
    vec![
        ChatMessage::system("You are a meticulous document reviewer."),
        ChatMessage::user(user),
    ]
}
