//! 输出流层：字节块解码与工具调用 / 标识符解析

pub mod parser;
pub mod utf8;

pub use parser::{is_valid_identifier, OutputParser, ParsedEvent, StreamKind, GRAMMAR_VERSION};
pub use utf8::Utf8ChunkDecoder;
