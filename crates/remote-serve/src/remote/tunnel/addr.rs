use std::{fmt, net::SocketAddr};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use thiserror::Error;

const SEPARATOR: char = '_';

#[derive(Debug, Error)]
pub enum AddrError {
    #[error("no {SEPARATOR} found in encoded address")]
    MissingSeparator,
    #[error("bad base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("address is not utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// A transport address as seen by one end of a tunneled connection.
///
/// `kind` names the network ("tcp"), `text` is the printable address
/// ("203.0.113.7:51234"). Both travel inside `create` messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    kind: String,
    text: String,
}

impl Address {
    pub fn new(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            text: text.into(),
        }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new("tcp", addr.to_string())
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn encode(&self) -> String {
        format!(
            "{}{SEPARATOR}{}",
            STANDARD.encode(self.kind.as_bytes()),
            STANDARD.encode(self.text.as_bytes())
        )
    }

    pub fn decode(s: &str) -> Result<Self, AddrError> {
        let mut parts = s.split(SEPARATOR);
        let (Some(kind), Some(text), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(AddrError::MissingSeparator);
        };
        Ok(Self {
            kind: String::from_utf8(STANDARD.decode(kind)?)?,
            text: String::from_utf8(STANDARD.decode(text)?)?,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_preserves_kind_and_text() {
        let addrs = [
            Address::tcp("127.0.0.1:5000".parse().unwrap()),
            Address::tcp("[::1]:443".parse().unwrap()),
            Address::new("unix", "/run/app_socket"),
            Address::new("", ""),
        ];
        for a in addrs {
            let got = Address::decode(&a.encode()).unwrap();
            assert_eq!(got, a);
        }
    }

    #[test]
    fn encoded_form_is_two_base64_halves() {
        let a = Address::new("tcp", "1.2.3.4:80");
        assert_eq!(a.encode(), "dGNw_MS4yLjMuNDo4MA==");
    }

    #[test]
    fn decode_rejects_missing_or_extra_separator() {
        assert!(matches!(
            Address::decode("dGNw"),
            Err(AddrError::MissingSeparator)
        ));
        assert!(matches!(
            Address::decode("dGNw_dGNw_dGNw"),
            Err(AddrError::MissingSeparator)
        ));
    }

    #[test]
    fn decode_rejects_bad_base64() {
        assert!(matches!(
            Address::decode("not*base64_dGNw"),
            Err(AddrError::Base64(_))
        ));
        assert!(matches!(
            Address::decode("dGNw_???"),
            Err(AddrError::Base64(_))
        ));
    }

    #[test]
    fn display_is_the_textual_address() {
        let a = Address::tcp("10.0.0.1:22".parse().unwrap());
        assert_eq!(a.to_string(), "10.0.0.1:22");
        assert_eq!(a.kind(), "tcp");
    }
}
