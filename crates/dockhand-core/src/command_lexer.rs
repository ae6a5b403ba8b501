//! Tokenizer for operator-supplied command text.
//!
//! The text is never handed to a shell. Anything a shell would interpret
//! (chaining, pipes, redirection, substitution) is refused outright, even
//! inside quotes, so the remaining grammar is only words, quotes and
//! backslash escapes.

use crate::error::CommandRejection;

pub const FORBIDDEN_METACHARACTERS: &[char] =
    &[';', '&', '|', '`', '$', '(', ')', '<', '>', '\n', '\r'];

/// Splits `raw` into an argument vector.
pub fn tokenize(raw: &str) -> Result<Vec<String>, CommandRejection> {
    if raw.trim().is_empty() {
        return Err(CommandRejection::Empty);
    }
    scan(raw)?;
    let tokens = shell_words::split(raw).map_err(|_| CommandRejection::UnterminatedQuote)?;
    if tokens.is_empty() {
        return Err(CommandRejection::Empty);
    }
    Ok(tokens)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
}

/// Rejects forbidden characters and word-leading `#`, which `shell_words`
/// would otherwise treat as a comment and silently drop the rest.
fn scan(raw: &str) -> Result<(), CommandRejection> {
    let mut quote = Quote::None;
    let mut escaped = false;
    let mut word_start = true;

    for (offset, ch) in raw.char_indices() {
        if FORBIDDEN_METACHARACTERS.contains(&ch) {
            return Err(CommandRejection::ForbiddenCharacter {
                character: ch,
                offset,
            });
        }
        if escaped {
            escaped = false;
            word_start = false;
            continue;
        }
        match (quote, ch) {
            (Quote::None, '\\') => escaped = true,
            (Quote::None, '\'') => quote = Quote::Single,
            (Quote::None, '"') => quote = Quote::Double,
            (Quote::None, '#') if word_start => {
                return Err(CommandRejection::CommentMarker { offset });
            }
            (Quote::Single, '\'') => quote = Quote::None,
            (Quote::Double, '\\') => escaped = true,
            (Quote::Double, '"') => quote = Quote::None,
            _ => {}
        }
        word_start = quote == Quote::None && !escaped && ch.is_whitespace();
    }

    if quote != Quote::None || escaped {
        return Err(CommandRejection::UnterminatedQuote);
    }
    Ok(())
}
