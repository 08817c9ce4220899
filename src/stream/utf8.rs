//! 增量 UTF-8 解码：子进程输出按字节块到达，多字节字符（如 ⏺）可能被切在两次 read 之间

/// 保留不完整的尾部字节，等下一块补齐后再解码；真正非法的字节替换为 U+FFFD
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            // 尾部不完整，留到下一块
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// 流结束时冲刷剩余字节
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_multibyte_char() {
        let bytes = "⏺ ok".as_bytes();
        let mut decoder = Utf8ChunkDecoder::new();
        let mut out = decoder.decode(&bytes[..1]);
        out.push_str(&decoder.decode(&bytes[1..2]));
        out.push_str(&decoder.decode(&bytes[2..]));
        out.push_str(&decoder.finish());
        assert_eq!(out, "⏺ ok");
    }

    #[test]
    fn test_invalid_bytes_replaced() {
        let mut decoder = Utf8ChunkDecoder::new();
        let out = decoder.decode(&[b'a', 0xff, b'b']);
        assert_eq!(out, "a\u{FFFD}b");
    }

    #[test]
    fn test_finish_flushes_truncated_tail() {
        let mut decoder = Utf8ChunkDecoder::new();
        assert_eq!(decoder.decode(&"é".as_bytes()[..1]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert_eq!(decoder.finish(), "");
    }
}
