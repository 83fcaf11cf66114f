//! Recognition of ecash payment tokens inside message text. Redemption is the wallet's job.

const PREFIXES: [&str; 2] = ["cashuA", "cashuB"];

/// Tokens shorter than this are treated as ordinary words.
const MIN_BODY_LEN: usize = 16;

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=')
}

/// First `cashuA…`/`cashuB…` token in `content`, if any.
pub fn find_payment_token(content: &str) -> Option<&str> {
    content
        .split(|c: char| !is_token_char(c))
        .find(|word| {
            PREFIXES
                .iter()
                .any(|p| word.starts_with(p) && word.len() >= p.len() + MIN_BODY_LEN)
        })
}
