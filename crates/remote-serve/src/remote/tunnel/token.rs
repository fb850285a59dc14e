//! Random tokens for message ids and auth challenge nonces.

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
};
use rand::{RngExt, rng};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    Raw,
    #[default]
    Base64Url,
    Base64,
    Hex,
}

/// Returns `n` bytes of output: `n` random bytes rendered in `encoding` and
/// cut back to `n`. Text encodings expand, so the result is always full.
pub fn generate(n: usize, encoding: Encoding) -> Vec<u8> {
    let mut r = rng();
    let raw: Vec<u8> = (0..n).map(|_| r.random::<u8>()).collect();
    let mut out = match encoding {
        Encoding::Raw => raw,
        Encoding::Base64Url => URL_SAFE_NO_PAD.encode(&raw).into_bytes(),
        Encoding::Base64 => STANDARD_NO_PAD.encode(&raw).into_bytes(),
        Encoding::Hex => hex::encode(&raw).into_bytes(),
    };
    out.truncate(n);
    out
}

/// URL-safe token of exactly `n` characters.
pub fn chars(n: usize) -> String {
    // base64url output is ASCII, so the conversion is lossless.
    String::from_utf8_lossy(&generate(n, Encoding::default())).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_encoding_yields_requested_length() {
        for enc in [
            Encoding::Raw,
            Encoding::Base64Url,
            Encoding::Base64,
            Encoding::Hex,
        ] {
            for n in [0, 1, 16, 32, 33] {
                assert_eq!(generate(n, enc).len(), n, "{enc:?} n={n}");
            }
        }
    }

    #[test]
    fn text_encodings_stay_in_alphabet() {
        let hex = generate(64, Encoding::Hex);
        assert!(hex.iter().all(|b| b.is_ascii_hexdigit()));

        let url = chars(64);
        assert_eq!(url.len(), 64);
        assert!(
            url.bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        );
    }

    #[test]
    fn tokens_differ() {
        assert_ne!(chars(32), chars(32));
    }
}
