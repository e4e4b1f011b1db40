//! Percent-escaping of command arguments.
//!
//! Assuan lines are terminated by a linefeed, and the UI server
//! splits `FILE` arguments at spaces, therefore file names have to be
//! escaped before they are put on the wire.

use crate::Error;
use crate::Result;

/// Characters escaped in file names in addition to `%`.
const FILE_EXTRA: &[u8] = b"+= ";

/// Controls how file names are escaped.
///
/// The UI servers disagree on whether a colon must be escaped: some
/// versions of Kleopatra choke on `C:` unless it is sent as `C%3a`,
/// while others do not unescape it at all.  Colons are left alone by
/// default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Escaping {
    colons: bool,
}

impl Escaping {
    /// Returns the default escaping rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether colons are escaped.
    pub fn escape_colons(mut self, yes: bool) -> Self {
        self.colons = yes;
        self
    }

    /// Returns whether colons are escaped.
    pub fn escapes_colons(&self) -> bool {
        self.colons
    }

    /// Escapes a file name for use as an argument of `FILE`.
    pub fn escape(&self, name: &[u8]) -> Vec<u8> {
        if self.colons {
            percent_escape(name, b"+= :")
        } else {
            percent_escape(name, FILE_EXTRA)
        }
    }
}

fn tohex_lower(n: u8) -> u8 {
    if n < 10 { b'0' + n } else { b'a' + n - 10 }
}

/// Percent-escapes `s`.
///
/// `%` and all characters in `extra` are replaced by `%xx`, using
/// lowercase hex digits.
///
/// Line breaks (CR and LF) are always escaped as well, although
/// GpgEX historically passed them through unchanged: a raw line
/// break would end the line and let a file name smuggle in a
/// command.  Apart from these, paths without `%` and `extra`
/// characters come back unchanged.
pub fn percent_escape(s: &[u8], extra: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(s.len());
    for &c in s {
        if c == b'%' || c == b'\n' || c == b'\r' || extra.contains(&c) {
            escaped.push(b'%');
            escaped.push(tohex_lower(c >> 4));
            escaped.push(tohex_lower(c & 15));
        } else {
            escaped.push(c);
        }
    }
    escaped
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Reverses percent-escaping.
///
/// Both upper- and lowercase hex digits are accepted.
pub fn percent_unescape(s: &[u8]) -> Result<Vec<u8>> {
    let mut unescaped = Vec::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        if s[i] == b'%' {
            let hi = s.get(i + 1).cloned().and_then(hex_value);
            let lo = s.get(i + 2).cloned().and_then(hex_value);
            match (hi, lo) {
                (Some(hi), Some(lo)) => unescaped.push(hi << 4 | lo),
                _ => return Err(Error::ProtocolError(format!(
                    "Malformed escape sequence at offset {} in {:?}",
                    i, String::from_utf8_lossy(s))).into()),
            }
            i += 3;
        } else {
            unescaped.push(s[i]);
            i += 1;
        }
    }
    Ok(unescaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::TestResult;

    #[test]
    fn file_names() {
        let e = Escaping::new();
        assert_eq!(e.escape(b"C:\\docs\\a.txt"), b"C:\\docs\\a.txt".to_vec());
        assert_eq!(e.escape(b"C:\\docs\\b+c.txt"),
                   b"C:\\docs\\b%2bc.txt".to_vec());
        assert_eq!(e.escape(b"100% a=b"), b"100%25%20a%3db".to_vec());
        assert_eq!(e.escape(b""), b"".to_vec());
        // Line breaks never make it onto the wire.
        assert_eq!(e.escape(b"a\nBYE\r"), b"a%0aBYE%0d".to_vec());

        let e = Escaping::new().escape_colons(true);
        assert!(e.escapes_colons());
        assert_eq!(e.escape(b"C:\\My Files\\x"),
                   b"C%3a\\My%20Files\\x".to_vec());
    }

    #[test]
    fn unescape() {
        assert_eq!(percent_unescape(b"%25%0D%0a").unwrap(), b"%\r\n".to_vec());
        assert_eq!(percent_unescape(b"plain").unwrap(), b"plain".to_vec());
        assert!(percent_unescape(b"%2").is_err());
        assert!(percent_unescape(b"%zz").is_err());
    }

    quickcheck! {
        fn roundtrip(name: Vec<u8>, colons: bool) -> bool {
            let e = Escaping::new().escape_colons(colons);
            percent_unescape(&e.escape(&name)).unwrap() == name
        }

        fn identity(name: Vec<u8>) -> TestResult {
            if name.iter().any(|c| b"%+= \r\n".contains(c)) {
                return TestResult::discard();
            }
            TestResult::from_bool(Escaping::new().escape(&name) == name)
        }

        fn single_line(name: Vec<u8>) -> bool {
            let escaped = Escaping::new().escape(&name);
            ! escaped.iter().any(|c| b"+= \r\n".contains(c))
        }
    }
}
