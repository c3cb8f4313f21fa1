//! Pre-compiled value templates
//!
//! `src` and `key` attribute values may reference headers of the incoming
//! request with the `{H<name>}` shorthand, e.g.
//! `redis://host/checkout_cart_{HUser-Agent}`. Templates compile once at
//! entity construction so that per-request rendering is a plain segment
//! walk with no parsing.
//!
//! `{{ ... }}` blocks are not ours: they belong to whatever downstream
//! template engine renders the page and pass through verbatim.

use http::header::HeaderName;
use http::HeaderMap;

use crate::error::{EsiError, Result};

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Header(HeaderName),
}

/// A compiled attribute value. Static values render as themselves without
/// allocation of new segments.
#[derive(Debug, Clone)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
    dynamic: bool,
}

impl Template {
    /// Compile a value. An unterminated or malformed `{H...}` placeholder
    /// is `Fatal`: a broken template would silently corrupt every backend
    /// URL built from it.
    pub fn compile(input: &str) -> Result<Template> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut dynamic = false;

        let chars: Vec<char> = input.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            // Pass `{{ ... }}` through untouched, including any `{H` inside.
            if chars[i] == '{' && i + 1 < chars.len() && chars[i + 1] == '{' {
                let close = find_subsequence(&chars, i + 2, &['}', '}']).ok_or_else(|| {
                    EsiError::Fatal(format!("unterminated {{{{ block in template {:?}", input))
                })?;
                literal.extend(&chars[i..close + 2]);
                i = close + 2;
                continue;
            }

            if chars[i] == '{' && i + 1 < chars.len() && chars[i + 1] == 'H' {
                let close = chars[i + 2..]
                    .iter()
                    .position(|&c| c == '}')
                    .map(|p| i + 2 + p)
                    .ok_or_else(|| {
                        EsiError::Fatal(format!(
                            "unterminated header placeholder in template {:?}",
                            input
                        ))
                    })?;
                let name: String = chars[i + 2..close].iter().collect();
                let header = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
                    .map_err(|_| {
                        EsiError::Fatal(format!(
                            "invalid header name {:?} in template {:?}",
                            name, input
                        ))
                    })?;

                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Header(header));
                dynamic = true;
                i = close + 1;
                continue;
            }

            literal.push(chars[i]);
            i += 1;
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Template {
            raw: input.to_owned(),
            segments,
            dynamic,
        })
    }

    /// True when the template references request headers.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// The source text the template was compiled from.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Render against the incoming request's headers. A referenced header
    /// that is absent or not valid UTF-8 renders as the empty string.
    pub fn render(&self, headers: &HeaderMap) -> String {
        if !self.dynamic {
            return self.raw.clone();
        }
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Header(name) => {
                    if let Some(v) = headers.get(name).and_then(|v| v.to_str().ok()) {
                        out.push_str(v);
                    }
                }
            }
        }
        out
    }
}

fn find_subsequence(chars: &[char], from: usize, needle: &[char]) -> Option<usize> {
    if chars.len() < needle.len() {
        return None;
    }
    (from..=chars.len() - needle.len()).find(|&i| &chars[i..i + needle.len()] == needle)
}
