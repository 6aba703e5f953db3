//! Incremental UTF-8 decoding for terminal output.
//!
//! Pty reads are cut at arbitrary byte offsets, so a multi-byte character can
//! straddle two reads. The decoder holds back an incomplete trailing sequence
//! (at most three bytes) until the next chunk arrives. Bytes that can never
//! form a valid character are replaced with U+FFFD, the same way
//! [`String::from_utf8_lossy`] does.

#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `input`, prefixed by whatever was held back from the last call.
    pub fn decode(&mut self, input: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(input);

        let mut out = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                        None => {
                            // Incomplete sequence at the very end.
                            self.pending.extend_from_slice(tail);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush anything still held back. Used at end-of-stream.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let tail = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&tail).into_owned()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_through() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"hello\r\n"), "hello\r\n");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn character_split_across_reads_is_reassembled() {
        // "é" is 0xC3 0xA9, "€" is 0xE2 0x82 0xAC
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"caf\xC3"), "caf");
        assert!(decoder.has_pending());
        assert_eq!(decoder.decode(b"\xA9 \xE2"), "é ");
        assert_eq!(decoder.decode(b"\x82"), "");
        assert_eq!(decoder.decode(b"\xAC!"), "€!");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn four_byte_character_split_byte_by_byte() {
        let crab = "🦀".as_bytes();
        let mut decoder = Utf8Decoder::new();
        let mut out = String::new();
        for b in crab {
            out.push_str(&decoder.decode(std::slice::from_ref(b)));
        }
        assert_eq!(out, "🦀");
    }

    #[test]
    fn invalid_bytes_become_replacement_characters() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xFFb\xC3(c"), "a\u{FFFD}b\u{FFFD}(c");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn escape_sequences_are_untouched() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"\x1b[1;32mok\x1b[0m"), "\x1b[1;32mok\x1b[0m");
    }

    #[test]
    fn finish_flushes_a_truncated_sequence() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"x\xE2\x82"), "x");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert!(!decoder.has_pending());
        assert_eq!(decoder.finish(), "");
    }
}
