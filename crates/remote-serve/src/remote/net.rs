use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Tunnel clients usually ask for `":PORT"` meaning "all interfaces"; Tokio's
/// bind APIs only take full socket addresses, so `":PORT"` and a bare `"PORT"`
/// become `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else if !addr.is_empty() && addr.bytes().all(|b| b.is_ascii_digit()) {
        Cow::Owned(format!("0.0.0.0:{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}
