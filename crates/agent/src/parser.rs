//! Stream parser: turns the growing text of a model response into ordered
//! content blocks.
//!
//! The parser is stateless: every call re-parses the whole buffer from the
//! start. That keeps it trivially idempotent (the same final buffer always
//! yields the same blocks) and lets the loop call it after every chunk.
//!
//! Three states are tracked while scanning:
//!
//! 1. plain text, until the tail matches a known tool open tag
//! 2. inside a tool, until the tail matches a parameter open tag or the tool's
//!    close tag
//! 3. inside a parameter value, until the tail matches its close tag
//!
//! A tool's raw-body parameter (file contents) may contain text that looks
//! like its own close tag. For that parameter the value is re-taken, when the
//! tool body ends with the close tag, as everything between the first open tag
//! and the *last* close tag.

use tasklane_core::tool::{ToolParams, ToolRegistry};

/// A parsed tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub name: String,
    pub params: ToolParams,
    pub partial: bool,
}

/// One unit of parsed model output.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text { content: String, partial: bool },
    ToolUse(ToolUse),
}

impl ContentBlock {
    pub fn is_partial(&self) -> bool {
        match self {
            Self::Text { partial, .. } => *partial,
            Self::ToolUse(tool) => tool.partial,
        }
    }
}

/// Tag vocabulary for one tool.
#[derive(Debug, Clone)]
struct ToolTags {
    name: String,
    open: String,
    close: String,
    params: Vec<String>,
    raw_body: Option<String>,
}

/// The set of tags the parser recognizes, derived from the tool registry.
#[derive(Debug, Clone, Default)]
pub struct StreamParser {
    tools: Vec<ToolTags>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the vocabulary from every registered tool.
    pub fn from_registry(registry: &ToolRegistry) -> Self {
        let mut parser = Self::new();
        for tool in registry.tools() {
            let params: Vec<&str> = tool.params().iter().map(|p| p.name).collect();
            parser.add_tool(tool.name(), &params, tool.raw_body_param());
        }
        parser
    }

    /// Register one tool's tags.
    pub fn add_tool(&mut self, name: &str, params: &[&str], raw_body: Option<&str>) {
        self.tools.push(ToolTags {
            name: name.to_string(),
            open: format!("<{name}>"),
            close: format!("</{name}>"),
            params: params.iter().map(|p| p.to_string()).collect(),
            raw_body: raw_body.map(str::to_string),
        });
    }

    /// Parse `buffer` into blocks.
    ///
    /// `complete` means the stream has ended: a trailing text block is then
    /// final, since plain text has no close tag. An unclosed tool block stays
    /// partial either way.
    pub fn parse(&self, buffer: &str, complete: bool) -> Vec<ContentBlock> {
        let mut blocks = Vec::new();

        let mut text_start: Option<usize> = None;
        let mut tool: Option<(&ToolTags, ToolParams, usize)> = None;
        let mut param: Option<(&str, usize)> = None;

        for (i, ch) in buffer.char_indices() {
            let end = i + ch.len_utf8();
            let acc = &buffer[..end];

            if let Some((name, start)) = param {
                let close = format!("</{name}>");
                if acc.ends_with(&close) {
                    let value = &buffer[start..end - close.len()];
                    if let Some((_, params, _)) = tool.as_mut() {
                        params.insert(name.to_string(), value.trim().to_string());
                    }
                    param = None;
                }
                continue;
            }

            if let Some((tags, params, body_start)) = tool.as_mut() {
                let tags: &ToolTags = *tags;
                let body = &buffer[*body_start..end];

                if acc.ends_with(&tags.close) {
                    blocks.push(ContentBlock::ToolUse(ToolUse {
                        name: tags.name.clone(),
                        params: std::mem::take(params),
                        partial: false,
                    }));
                    tool = None;
                    continue;
                }

                if let Some(raw) = &tags.raw_body {
                    let raw_open = format!("<{raw}>");
                    let raw_close = format!("</{raw}>");
                    if body.ends_with(&raw_close) {
                        if let (Some(first), Some(last)) = (body.find(&raw_open), body.rfind(&raw_close)) {
                            let value_start = first + raw_open.len();
                            if value_start <= last {
                                params.insert(raw.clone(), body[value_start..last].trim().to_string());
                            }
                        }
                    }
                }

                if let Some(name) = tags
                    .params
                    .iter()
                    .find(|p| acc.ends_with(&format!("<{p}>")))
                {
                    param = Some((name.as_str(), end));
                }
                continue;
            }

            if let Some(tags) = self.tools.iter().find(|t| acc.ends_with(&t.open)) {
                if let Some(start) = text_start.take() {
                    let text_end = end - tags.open.len();
                    push_text(&mut blocks, &buffer[start.min(text_end)..text_end], false);
                }
                tool = Some((tags, ToolParams::new(), end));
                continue;
            }

            if text_start.is_none() {
                text_start = Some(i);
            }
        }

        if let Some((tags, mut params, _)) = tool {
            if let Some((name, start)) = param {
                params.insert(name.to_string(), buffer[start..].trim().to_string());
            }
            blocks.push(ContentBlock::ToolUse(ToolUse {
                name: tags.name.clone(),
                params,
                partial: true,
            }));
        } else if let Some(start) = text_start {
            push_text(&mut blocks, &buffer[start..], !complete);
        }

        blocks
    }
}

fn push_text(blocks: &mut Vec<ContentBlock>, text: &str, partial: bool) {
    let content = text.trim();
    if content.is_empty() {
        return;
    }
    blocks.push(ContentBlock::Text {
        content: content.to_string(),
        partial,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> StreamParser {
        let mut p = StreamParser::new();
        p.add_tool("read_file", &["path"], None);
        p.add_tool("write_to_file", &["path", "content", "line_count"], Some("content"));
        p.add_tool("tool", &["p"], None);
        p
    }

    fn tool(name: &str, params: &[(&str, &str)], partial: bool) -> ContentBlock {
        ContentBlock::ToolUse(ToolUse {
            name: name.into(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            partial,
        })
    }

    fn text(content: &str, partial: bool) -> ContentBlock {
        ContentBlock::Text { content: content.into(), partial }
    }

    #[test]
    fn text_tool_text_on_complete_stream() {
        let blocks = parser().parse("before<tool><p>a</p></tool>after", true);
        assert_eq!(
            blocks,
            vec![
                text("before", false),
                tool("tool", &[("p", "a")], false),
                text("after", false),
            ]
        );
    }

    #[test]
    fn trailing_text_is_partial_while_streaming() {
        let blocks = parser().parse("Let me look at", false);
        assert_eq!(blocks, vec![text("Let me look at", true)]);
    }

    #[test]
    fn unclosed_tool_is_partial_with_partial_param() {
        let blocks = parser().parse("Reading.\n<read_file>\n<path>src/ma", false);
        assert_eq!(
            blocks,
            vec![
                text("Reading.", false),
                tool("read_file", &[("path", "src/ma")], true),
            ]
        );

        // The stream ending does not close a tool
        let blocks = parser().parse("<read_file>\n<path>src/main.rs</path>\n", true);
        assert_eq!(blocks, vec![tool("read_file", &[("path", "src/main.rs")], true)]);
    }

    #[test]
    fn values_are_trimmed() {
        let blocks = parser().parse("<read_file>\n<path>\n  src/lib.rs \n</path>\n</read_file>", true);
        assert_eq!(blocks, vec![tool("read_file", &[("path", "src/lib.rs")], false)]);
    }

    #[test]
    fn raw_body_takes_last_close_tag() {
        let input = "<write_to_file><path>doc.md</path><content>Use </content> to end.\nDone</content></write_to_file>";
        let blocks = parser().parse(input, true);
        assert_eq!(
            blocks,
            vec![tool(
                "write_to_file",
                &[("path", "doc.md"), ("content", "Use </content> to end.\nDone")],
                false
            )]
        );
    }

    #[test]
    fn unknown_tags_are_text() {
        let blocks = parser().parse("<thinking>hmm</thinking>", true);
        assert_eq!(blocks, vec![text("<thinking>hmm</thinking>", false)]);
    }

    #[test]
    fn reparse_is_idempotent_at_every_prefix() {
        let p = parser();
        let input = "Plan: édit\n<write_to_file>\n<path>a.rs</path>\n<content>fn a() {}</content>\n</write_to_file>\ntrailing";
        let mut last_len = 0;
        for (i, _) in input.char_indices().skip(1) {
            let prefix = &input[..i];
            let first = p.parse(prefix, false);
            assert_eq!(first, p.parse(prefix, false));
            // Blocks already finalized never change as the buffer grows
            let finalized = first.iter().filter(|b| !b.is_partial()).count();
            assert!(finalized >= last_len);
            last_len = finalized;
        }
        assert_eq!(p.parse(input, true), p.parse(input, true));
    }

    #[test]
    fn registry_vocabulary_is_used() {
        let registry = tasklane_tools::default_registry(&tasklane_core::mode::Mode::defaults());
        let p = StreamParser::from_registry(&registry);
        let blocks = p.parse("<list_files><path>.</path><recursive>true</recursive></list_files>", true);
        assert_eq!(
            blocks,
            vec![tool("list_files", &[("path", "."), ("recursive", "true")], false)]
        );
    }
}
