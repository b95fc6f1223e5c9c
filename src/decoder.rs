//! Incremental UTF-8 decoding for chunked response bodies.

/// A UTF-8 decoder whose state survives across chunks.
///
/// An instance belongs to exactly one stream.  Bytes of a multi-byte
/// character that straddle a chunk boundary are held back until the rest of
/// the character arrives.  Invalid sequences decode to U+FFFD, and a leading
/// byte-order mark is dropped.
#[derive(Debug, Default)]
pub struct IncrementalDecoder {
    pending: Vec<u8>,
    bom_checked: bool,
}

impl IncrementalDecoder {
    /// A decoder at the start of a stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a partial character is buffered.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Decode the next chunk, returning all text that is complete so far.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(chunk);

        let mut out = String::with_capacity(input.len());
        let mut rest = &input[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            // Truncated character at the end of the chunk.
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        self.strip_bom(out)
    }

    /// End of stream: any buffered partial character becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        self.pending.clear();
        self.strip_bom(char::REPLACEMENT_CHARACTER.to_string())
    }

    fn strip_bom(&mut self, out: String) -> String {
        if self.bom_checked || out.is_empty() {
            return out;
        }
        self.bom_checked = true;
        match out.strip_prefix('\u{feff}') {
            Some(stripped) => stripped.to_string(),
            None => out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_through() {
        let mut decoder = IncrementalDecoder::new();
        assert_eq!(decoder.decode(b"Hello"), "Hello");
        assert_eq!(decoder.decode(b" world"), " world");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn split_multibyte_character() {
        // "é" is 0xC3 0xA9; "€" is 0xE2 0x82 0xAC.
        let mut decoder = IncrementalDecoder::new();
        assert_eq!(decoder.decode(&[b'c', b'a', b'f', 0xC3]), "caf");
        assert!(decoder.has_pending());
        assert_eq!(decoder.decode(&[0xA9, b' ', 0xE2]), "é ");
        assert_eq!(decoder.decode(&[0x82]), "");
        assert_eq!(decoder.decode(&[0xAC]), "€");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn four_byte_character_one_byte_at_a_time() {
        let bytes = "🦀".as_bytes();
        let mut decoder = IncrementalDecoder::new();
        let mut out = String::new();
        for b in bytes {
            out.push_str(&decoder.decode(std::slice::from_ref(b)));
        }
        assert_eq!(out, "🦀");
    }

    #[test]
    fn invalid_bytes_become_replacement() {
        let mut decoder = IncrementalDecoder::new();
        assert_eq!(decoder.decode(&[b'a', 0xFF, b'b']), "a\u{fffd}b");
    }

    #[test]
    fn truncated_tail_flushes_as_replacement() {
        let mut decoder = IncrementalDecoder::new();
        assert_eq!(decoder.decode(&[b'x', 0xE2, 0x82]), "x");
        assert_eq!(decoder.finish(), "\u{fffd}");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn leading_bom_is_dropped_once() {
        let mut decoder = IncrementalDecoder::new();
        assert_eq!(decoder.decode(&[0xEF, 0xBB]), "");
        assert_eq!(decoder.decode(&[0xBF, b'h', b'i']), "hi");
        assert_eq!(decoder.decode("\u{feff}x".as_bytes()), "\u{feff}x");
    }
}
