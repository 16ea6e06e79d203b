//! Parsing of streamed assistant output into content blocks
//!
//! Two sources of tool calls are handled here: XML-style markup embedded in
//! the text (`<read_file><path>a.rs</path></read_file>`) and the JSON
//! argument fragments of native tool calls. Both have to cope with input that
//! stops at an arbitrary byte.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::state::{AssistantMessageContent, ToolUse};

/// An opening or closing tag cut off by the end of the buffer
static PARTIAL_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?[A-Za-z_]*$").expect("static regex"));

/// Parameters whose values keep interior whitespace
const VERBATIM_PARAMS: &[&str] = &["content", "diff"];

/// Attempts made by the partial JSON closer before giving up
const MAX_JSON_CUTS: usize = 16;

/// Registered tool names and the parameter tags each accepts.
///
/// Only registered names are recognized as markup; anything else stays text.
#[derive(Debug, Clone, Default)]
pub struct ToolGrammar {
    tools: BTreeMap<String, Vec<String>>,
}

impl ToolGrammar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, params: impl IntoIterator<Item = impl Into<String>>) {
        self.tools
            .insert(name.into(), params.into_iter().map(Into::into).collect());
    }

    pub fn with_tool(
        mut self,
        name: impl Into<String>,
        params: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.add(name, params);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool whose opening tag starts `rest` (which begins with `<`)
    fn tool_at<'a>(&'a self, rest: &str) -> Option<&'a str> {
        self.tools
            .keys()
            .map(String::as_str)
            .find(|name| opens_tag(rest, name))
    }

    fn param_at<'a>(&'a self, tool: &str, rest: &str) -> Option<&'a str> {
        self.tools
            .get(tool)?
            .iter()
            .map(String::as_str)
            .find(|param| opens_tag(rest, param))
    }
}

fn opens_tag(rest: &str, name: &str) -> bool {
    rest.strip_prefix('<')
        .and_then(|r| r.strip_prefix(name))
        .is_some_and(|r| r.starts_with('>'))
}

/// Result of parsing a display buffer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMessage {
    pub blocks: Vec<AssistantMessageContent>,
    /// Byte offset just past the last closed tool tag. Input before this
    /// point parses to `blocks[..stable_blocks]` no matter what follows.
    pub stable_len: usize,
    pub stable_blocks: usize,
}

/// Parse assistant text into ordered text and tool-use blocks.
///
/// With `complete == false` the input is a stream prefix: the trailing text
/// block is partial and a tag fragment at its end is hidden. An unclosed tool
/// or parameter always yields a partial block.
pub fn parse_assistant_message(input: &str, grammar: &ToolGrammar, complete: bool) -> ParsedMessage {
    let mut parsed = ParsedMessage::default();
    let mut text_start = 0;
    let mut pos = 0;

    while let Some(rel) = input[pos..].find('<') {
        let lt = pos + rel;
        let Some(name) = grammar.tool_at(&input[lt..]) else {
            pos = lt + 1;
            continue;
        };

        push_text(&mut parsed.blocks, &input[text_start..lt], false);
        let (tool, end) = parse_tool_body(input, lt + name.len() + 2, name, grammar);
        let closed = !tool.partial;
        parsed.blocks.push(AssistantMessageContent::ToolUse(tool));
        if !closed {
            return parsed;
        }
        pos = end;
        text_start = end;
        parsed.stable_len = end;
        parsed.stable_blocks = parsed.blocks.len();
    }

    let tail = &input[text_start..];
    if complete {
        push_text(&mut parsed.blocks, tail, false);
    } else {
        push_text(&mut parsed.blocks, strip_partial_tag(tail), true);
    }
    parsed
}

/// Parse the parameters of a tool whose opening tag ends at `start`.
/// Returns the tool and the offset just past its closing tag (or the input end).
fn parse_tool_body(input: &str, start: usize, name: &str, grammar: &ToolGrammar) -> (ToolUse, usize) {
    let close = format!("</{name}>");
    let mut params = Map::new();
    let mut pos = start;

    while let Some(rel) = input[pos..].find('<') {
        let lt = pos + rel;
        let rest = &input[lt..];
        if rest.starts_with(&close) {
            return (ToolUse::new(name, params, false), lt + close.len());
        }
        let Some(param) = grammar.param_at(name, rest) else {
            pos = lt + 1;
            continue;
        };

        let value_start = lt + param.len() + 2;
        let close_param = format!("</{param}>");
        match input[value_start..].find(&close_param) {
            Some(vrel) => {
                let raw = &input[value_start..value_start + vrel];
                params.insert(param.to_string(), Value::String(clean_param(param, raw)));
                pos = value_start + vrel + close_param.len();
            }
            None => {
                let raw = strip_partial_tag(&input[value_start..]);
                params.insert(param.to_string(), Value::String(clean_param(param, raw)));
                return (ToolUse::new(name, params, true), input.len());
            }
        }
    }
    (ToolUse::new(name, params, true), input.len())
}

fn push_text(blocks: &mut Vec<AssistantMessageContent>, text: &str, partial: bool) {
    if text.trim().is_empty() {
        return;
    }
    blocks.push(AssistantMessageContent::text(text, partial));
}

fn strip_partial_tag(text: &str) -> &str {
    match PARTIAL_TAG.find(text) {
        Some(m) => &text[..m.start()],
        None => text,
    }
}

fn clean_param(name: &str, raw: &str) -> String {
    if VERBATIM_PARAMS.contains(&name) {
        let raw = raw.strip_prefix('\n').unwrap_or(raw);
        raw.strip_suffix('\n').unwrap_or(raw).to_string()
    } else {
        raw.trim().to_string()
    }
}

/// Best-effort parse of a possibly truncated JSON object.
///
/// Open strings, arrays and objects are closed; when that is not enough
/// (a dangling key, a half-written literal) the input is cut back to an
/// earlier element boundary and retried. Empty input is an empty object.
pub fn parse_partial_json(input: &str) -> Option<Map<String, Value>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Some(Map::new());
    }
    if let Ok(Value::Object(map)) = serde_json::from_str(trimmed) {
        return Some(map);
    }
    cut_points(trimmed)
        .into_iter()
        .take(MAX_JSON_CUTS)
        .find_map(|cut| match serde_json::from_str(&close_json(&trimmed[..cut])) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
}

/// Candidate truncation offsets, longest first: the full input, before each
/// top-level-or-nested comma, and just after each opening bracket.
fn cut_points(input: &str) -> Vec<usize> {
    let mut cuts = vec![input.len()];
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            ',' => cuts.push(i),
            '{' | '[' => cuts.push(i + 1),
            _ => {}
        }
    }
    cuts.sort_unstable_by(|a, b| b.cmp(a));
    cuts.dedup();
    cuts
}

/// Append whatever is needed to balance strings and brackets in `prefix`
fn close_json(prefix: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in prefix.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut out = prefix.to_string();
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    out.extend(stack.iter().rev());
    out
}
