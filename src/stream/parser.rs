//! 输出流解析：两条规则的微型文法
//!
//! 1. 工具调用标记：`<bullet> <ServerName> - <ToolName> (<ProtocolTag>)`，bullet 为 ⏺ / ● / •，仅 stdout 有效
//! 2. 资源标识符：`sys_id` 标签后跟十六进制串；提取宽松，入账严格（恰好 32 位小写十六进制）
//!
//! 输出块与行、消息边界无关。解析器把块追加到缓冲区后整体重扫：
//! 已确定的匹配被消费并从缓冲区删除，可能未完整的尾部保留到下一块再判定。
//! 标识符匹配若触到缓冲区末尾，则视为未定（后面可能还有十六进制字符），等后续字符或 finish()。

use std::sync::OnceLock;

use regex::Regex;

use crate::core::state::{now_millis, ToolInvocation};

/// 文法版本；调整任一规则时递增
pub const GRAMMAR_VERSION: u32 = 1;

/// 标识符严格长度
pub const IDENTIFIER_LEN: usize = 32;

/// 无匹配时保留的尾部窗口（字节），足以容纳一个被截断的标记或标签
const MAX_RETAINED: usize = 1024;

/// 输出流来源
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// 解析产出的事件，按在流中出现的顺序返回
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedEvent {
    Tool(ToolInvocation),
    Identifier(String),
}

struct Grammar {
    tool_marker: Regex,
    identifier: Regex,
}

static GRAMMAR: OnceLock<Grammar> = OnceLock::new();

fn grammar() -> &'static Grammar {
    GRAMMAR.get_or_init(|| Grammar {
        tool_marker: Regex::new(
            r"(?:⏺|●|•)[ \t]+([A-Za-z0-9][\w.\-]*)[ \t]+-[ \t]+([A-Za-z0-9][\w.\-]*)[ \t]*\(([\w\-]+)\)",
        )
        .expect("tool marker grammar"),
        identifier: Regex::new(r#"(?i)\bsys_?id["']?[ \t]*[:=][ \t]*["']?([0-9a-f]+)"#)
            .expect("identifier grammar"),
    })
}

/// 严格格式：恰好 32 位小写十六进制
pub fn is_valid_identifier(candidate: &str) -> bool {
    candidate.len() == IDENTIFIER_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

enum Found {
    Tool(ToolInvocation),
    Identifier(String),
    /// 格式不合法但已确定的匹配：消费掉，不入账
    Rejected,
    /// 触到缓冲区末尾，尚未确定
    Unsettled,
}

/// 单条输出流的增量解析器（每个 Worker 的 stdout / stderr 各一个）
#[derive(Debug)]
pub struct OutputParser {
    kind: StreamKind,
    buffer: String,
}

impl OutputParser {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            buffer: String::new(),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// 当前保留的未消费文本长度（字节）
    pub fn retained_len(&self) -> usize {
        self.buffer.len()
    }

    /// 追加一块输出并返回本次可确定的事件
    pub fn feed(&mut self, chunk: &str) -> Vec<ParsedEvent> {
        if chunk.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(chunk);
        self.scan(false)
    }

    /// 流关闭：尾部不再会有新字符，未定的匹配在此刻判定
    pub fn finish(&mut self) -> Vec<ParsedEvent> {
        let events = self.scan(true);
        self.buffer.clear();
        events
    }

    fn scan(&mut self, finishing: bool) -> Vec<ParsedEvent> {
        let g = grammar();
        let len = self.buffer.len();
        let mut found: Vec<(usize, usize, Found)> = Vec::new();

        if self.kind == StreamKind::Stdout {
            for caps in g.tool_marker.captures_iter(&self.buffer) {
                let (Some(whole), Some(server), Some(tool), Some(tag)) =
                    (caps.get(0), caps.get(1), caps.get(2), caps.get(3))
                else {
                    continue;
                };
                found.push((
                    whole.start(),
                    whole.end(),
                    Found::Tool(ToolInvocation {
                        source_label: server.as_str().to_string(),
                        action_label: tool.as_str().to_string(),
                        protocol_tag: tag.as_str().to_string(),
                        observed_at: now_millis(),
                        raw_excerpt: whole.as_str().to_string(),
                    }),
                ));
            }
        }

        for caps in g.identifier.captures_iter(&self.buffer) {
            let (Some(whole), Some(value)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let item = if whole.end() >= len && !finishing {
                Found::Unsettled
            } else if is_valid_identifier(value.as_str()) {
                Found::Identifier(value.as_str().to_string())
            } else {
                tracing::trace!(candidate = value.as_str(), "rejected malformed identifier");
                Found::Rejected
            };
            found.push((whole.start(), whole.end(), item));
        }

        found.sort_by_key(|(start, _, _)| *start);

        let mut events = Vec::new();
        let mut consumed = 0;
        let mut hold = None;
        for (start, end, item) in found {
            if start < consumed {
                continue;
            }
            match item {
                Found::Unsettled => {
                    hold = Some(start);
                    break;
                }
                Found::Tool(invocation) => events.push(ParsedEvent::Tool(invocation)),
                Found::Identifier(id) => events.push(ParsedEvent::Identifier(id)),
                Found::Rejected => {}
            }
            consumed = end;
        }

        // 保留：未定匹配起点之后的全部，以及末尾窗口内可能是半个标记的文本
        let keep_from = hold.unwrap_or(len).min(len.saturating_sub(MAX_RETAINED));
        let mut cut = consumed.max(keep_from);
        while cut < len && !self.buffer.is_char_boundary(cut) {
            cut += 1;
        }
        self.buffer.drain(..cut);

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &str = "⏺ servicenow-deployment - snow_deploy (MCP)\n";
    const ID: &str = "3f9c2b1a4e5d6f7a8b9c0d1e2f3a4b5c";

    fn tools(events: &[ParsedEvent]) -> Vec<&ToolInvocation> {
        events
            .iter()
            .filter_map(|e| match e {
                ParsedEvent::Tool(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    fn ids(events: &[ParsedEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                ParsedEvent::Identifier(i) => Some(i.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_marker_in_single_chunk() {
        let mut parser = OutputParser::new(StreamKind::Stdout);
        let events = parser.feed(MARKER);
        let found = tools(&events);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].source_label, "servicenow-deployment");
        assert_eq!(found[0].action_label, "snow_deploy");
        assert_eq!(found[0].protocol_tag, "MCP");
    }

    #[test]
    fn test_marker_split_at_every_position_yields_exactly_one() {
        let boundaries: Vec<usize> = MARKER.char_indices().map(|(i, _)| i).skip(1).collect();
        for split in boundaries {
            let mut parser = OutputParser::new(StreamKind::Stdout);
            let mut events = parser.feed(&MARKER[..split]);
            events.extend(parser.feed(&MARKER[split..]));
            events.extend(parser.finish());
            assert_eq!(tools(&events).len(), 1, "split at byte {}", split);
        }
    }

    #[test]
    fn test_identifier_split_across_chunks() {
        let mut parser = OutputParser::new(StreamKind::Stdout);
        let mut events = parser.feed("created widget sys_");
        events.extend(parser.feed(&format!("id: {}", &ID[..10])));
        assert!(ids(&events).is_empty());
        events.extend(parser.feed(&ID[10..]));
        // 仍在末尾，可能还有字符
        assert!(ids(&events).is_empty());
        events.extend(parser.feed(" done\n"));
        assert_eq!(ids(&events), vec![ID]);
    }

    #[test]
    fn test_identifier_at_stream_end_settles_on_finish() {
        let mut parser = OutputParser::new(StreamKind::Stdout);
        assert!(parser.feed(&format!("sys_id: {}", ID)).is_empty());
        assert_eq!(ids(&parser.finish()), vec![ID]);
    }

    #[test]
    fn test_strict_identifier_format() {
        let mut parser = OutputParser::new(StreamKind::Stdout);
        let text = format!(
            "sys_id: {} \nsys_id: {} \nsys_id: {}f \nsys_id: {} \n",
            ID.to_uppercase(),
            &ID[..31],
            ID,
            ID
        );
        let events = parser.feed(&text);
        assert_eq!(ids(&events), vec![ID]);
    }

    #[test]
    fn test_json_style_label() {
        let mut parser = OutputParser::new(StreamKind::Stdout);
        let events = parser.feed(&format!(r#"{{"sys_id":"{}","name":"x"}}"#, ID));
        assert_eq!(ids(&events), vec![ID]);
    }

    #[test]
    fn test_stderr_ignores_markers() {
        let mut parser = OutputParser::new(StreamKind::Stderr);
        let events = parser.feed(&format!("{}warn sys_id={}\n", MARKER, ID));
        assert!(tools(&events).is_empty());
        assert_eq!(ids(&events), vec![ID]);
    }

    #[test]
    fn test_events_keep_stream_order() {
        let mut parser = OutputParser::new(StreamKind::Stdout);
        let text = format!(
            "{}sys_id: {}\n⏺ servicenow-operations - snow_query_table (MCP)\n",
            MARKER, ID
        );
        let events = parser.feed(&text);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ParsedEvent::Tool(_)));
        assert!(matches!(events[1], ParsedEvent::Identifier(_)));
        assert!(matches!(&events[2], ParsedEvent::Tool(t) if t.action_label == "snow_query_table"));
    }

    #[test]
    fn test_consumed_text_is_not_reparsed() {
        let mut parser = OutputParser::new(StreamKind::Stdout);
        assert_eq!(tools(&parser.feed(MARKER)).len(), 1);
        assert!(parser.feed("plain output\n").is_empty());
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn test_noise_buffer_is_bounded() {
        let mut parser = OutputParser::new(StreamKind::Stdout);
        for _ in 0..100 {
            parser.feed("lorem ipsum dolor sit amet, consectetur adipiscing elit ");
        }
        assert!(parser.retained_len() <= MAX_RETAINED + 4);
    }

    #[test]
    fn test_is_valid_identifier() {
        assert!(is_valid_identifier(ID));
        assert!(!is_valid_identifier(&ID.to_uppercase()));
        assert!(!is_valid_identifier("zz9c2b1a4e5d6f7a8b9c0d1e2f3a4b5c"));
    }
}
