//! Short human-friendly identifiers.
//!
//! Ids have the shape `x00xx0x`: letters from `a-zA-Z` and decimal digits,
//! derived from 32 random bits. Document ids are bare short ids; session
//! keys carry an `S-` prefix.

/// Prefix that marks a session key.
pub const SESSION_KEY_PREFIX: &str = "S-";

fn letter(n: u32) -> char {
    let n = (n % 52) as u8;
    if n < 26 {
        (b'a' + n) as char
    } else {
        (b'A' + n - 26) as char
    }
}

fn digit(n: u32) -> char {
    (b'0' + (n % 10) as u8) as char
}

/// Render 32 bits as a short id, consuming the value from the last
/// position backwards.
pub fn short_id_from(value: u32) -> String {
    let mut x = value;
    let mut res = ['\0'; 7];
    res[6] = letter(x);
    x /= 52;
    res[5] = digit(x);
    x /= 10;
    res[4] = letter(x);
    x /= 52;
    res[3] = letter(x);
    x /= 52;
    res[2] = digit(x);
    x /= 10;
    res[1] = digit(x);
    x /= 10;
    res[0] = letter(x);
    res.iter().collect()
}

/// A fresh random short id.
pub fn short_id() -> String {
    short_id_from(rand::random())
}

/// A fresh random session key.
pub fn session_key() -> String {
    format!("{SESSION_KEY_PREFIX}{}", short_id())
}

/// True if `s` is safe to use as a file stem: non-empty ASCII
/// alphanumerics and dashes only.
pub fn is_safe_id(s: &str) -> bool {
    !s.is_empty() && s.len() <= 64 && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}
