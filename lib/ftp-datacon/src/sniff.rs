/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ftp-datacon authors
 */

/// Fraction of non-whitespace control bytes above which a chunk is treated
/// as binary, in percent.
const CONTROL_BYTE_LIMIT_PCT: usize = 10;

/// Heuristic used to flag an ASCII-mode transfer that is receiving
/// binary-looking data. A chunk is text-like if it contains no NUL byte and
/// control characters (other than the usual text whitespace) stay below a
/// small fraction of the chunk.
pub fn looks_like_text(data: &[u8]) -> bool {
    if data.is_empty() {
        return true;
    }
    if memchr::memchr(0, data).is_some() {
        return false;
    }
    let suspicious = data
        .iter()
        .filter(|&&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0c | 0x1b))
        .count();
    suspicious * 100 / data.len() <= CONTROL_BYTE_LIMIT_PCT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_listing() {
        assert!(looks_like_text(
            b"-rw-r--r--   1 ftp  ftp  1024 Jan 01 12:00 readme.txt\r\n"
        ));
    }

    #[test]
    fn empty() {
        assert!(looks_like_text(b""));
    }

    #[test]
    fn nul_byte_is_binary() {
        assert!(!looks_like_text(b"MZ\x00\x03 some header"));
    }

    #[test]
    fn mostly_control_is_binary() {
        let data: Vec<u8> = (0u8..32).cycle().take(256).collect();
        assert!(!looks_like_text(&data));
    }

    #[test]
    fn utf8_text_with_crlf() {
        assert!(looks_like_text("příliš žluťoučký kůň\r\n".as_bytes()));
    }
}
