//! Attribute splitter
//!
//! Splits the raw byte blob of one include marker (`include src="..."
//! timeout="5ms" ...`) into a flat `[key, value, key, value, ...]` list.
//! Values keep their inner whitespace, quotes balance across single and
//! double quotation marks, and `{{ ... }}` template expressions inside a
//! quoted value pass through verbatim, inner quotes included.

use crate::error::{EsiError, Result};

/// Split a raw attribute blob into an even-length `[k, v, k, v, ...]` list.
///
/// The first token (the `include` word) is consumed and discarded. Keys and
/// values separate on unquoted whitespace and `=`. Each value longer than
/// two characters loses its first and last character (the quotation marks)
/// and is then trimmed. An odd number of remaining tokens means the quoting
/// is unbalanced and yields `NotValid`.
///
/// Empty or whitespace-only input yields an empty list, not an error.
pub fn split_attributes(raw: &str) -> Result<Vec<String>> {
    let mut fields = fields_outside_quotes(raw);
    if fields.is_empty() {
        return Ok(Vec::new());
    }

    // The first field is the `include` word.
    fields.remove(0);
    if fields.len() % 2 == 1 {
        return Err(EsiError::NotValid(format!(
            "imbalanced attributes in {:?}",
            raw
        )));
    }

    for value in fields.iter_mut().skip(1).step_by(2) {
        if value.chars().count() > 2 {
            let mut chars = value.chars();
            chars.next();
            chars.next_back();
            *value = chars.as_str().to_owned();
        }
        *value = value.trim().to_owned();
    }

    Ok(fields)
}

/// Split on whitespace and `=` that lie outside single or double quotes.
/// The quote characters themselves stay part of their field.
fn fields_outside_quotes(raw: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut last_quote: Option<char> = None;

    for c in raw.chars() {
        let is_separator = match last_quote {
            Some(q) if c == q => {
                last_quote = None;
                false
            }
            Some(_) => false,
            None => {
                if c == '"' || c == '\'' {
                    last_quote = Some(c);
                    false
                } else {
                    c.is_whitespace() || c == '='
                }
            }
        };

        if is_separator {
            if !current.is_empty() {
                fields.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        fields.push(current);
    }
    fields
}
