//! Response parsing for LLM outputs.
//!
//! Extracts SQL from replies that may contain markdown code blocks.

/// Result of parsing an LLM response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    /// Explanatory text with the code block removed.
    pub text: String,
    /// Extracted SQL, if a code block was found.
    pub sql: Option<String>,
}

impl ParsedResponse {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sql: None,
        }
    }

    pub fn with_sql(text: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sql: Some(sql.into()),
        }
    }
}

/// A fenced block located in a reply.
struct Fence<'a> {
    lang: &'a str,
    body: &'a str,
    start: usize,
    end: usize,
}

/// Parses a reply, taking the first ```sql block, else the first bare block.
///
/// Blocks in other languages are ignored. An empty block counts as no SQL.
pub fn parse_llm_response(response: &str) -> ParsedResponse {
    let fences = find_fences(response);
    let chosen = fences
        .iter()
        .find(|f| f.lang.eq_ignore_ascii_case("sql"))
        .or_else(|| fences.iter().find(|f| f.lang.is_empty()));

    match chosen {
        Some(fence) if !fence.body.trim().is_empty() => {
            let before = response[..fence.start].trim_end();
            let after = response[fence.end..].trim_start();
            let text = match (before.is_empty(), after.is_empty()) {
                (false, false) => format!("{before}\n{after}"),
                _ => format!("{before}{after}"),
            };
            ParsedResponse::with_sql(text.trim(), fence.body.trim())
        }
        _ => ParsedResponse::text_only(response.trim()),
    }
}

fn find_fences(text: &str) -> Vec<Fence<'_>> {
    let mut fences = Vec::new();
    let mut offset = 0;

    while let Some(open) = text[offset..].find("```").map(|i| offset + i) {
        let after_ticks = open + 3;
        let Some(newline) = text[after_ticks..].find('\n').map(|i| after_ticks + i) else {
            break;
        };
        let body_start = newline + 1;
        let Some(close) = text[body_start..].find("```").map(|i| body_start + i) else {
            break;
        };

        fences.push(Fence {
            lang: text[after_ticks..newline].trim(),
            body: &text[body_start..close],
            start: open,
            end: close + 3,
        });
        offset = close + 3;
    }

    fences
}
