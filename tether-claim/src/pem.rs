//! Newline escaping for PEM text embedded in JSON string fields.
//!
//! The claim service expects the CSR as a single line in which every line
//! break is written as the two characters `\` `n`. Certificates come back the
//! same way. [`unescape_newlines`] inverts [`escape_newlines`] for any text
//! that contains no backslash, which includes every well-formed PEM document.

/// Replace each `\n` with the two-character sequence `\\n`.
pub fn escape_newlines(pem: &str) -> String {
    let mut out = String::with_capacity(pem.len() + pem.len() / 32);
    for c in pem.chars() {
        if c == '\n' {
            out.push_str("\\n");
        } else {
            out.push(c);
        }
    }
    out
}

/// Replace each two-character sequence `\\n` with a line break.
///
/// Any other backslash is kept as-is.
pub fn unescape_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&'n') {
            chars.next();
            out.push('\n');
        } else {
            out.push(c);
        }
    }
    out
}
