//! Text transformations applied to candidate field values before comparison.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Normalisation step applied to a request field before matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TextTransform {
    /// Percent-decode; `+` decodes to a space as in form data
    UrlDecode,
    /// Unicode lowercase
    Lowercase,
    /// Collapse every run of whitespace into a single space
    CompressWhitespace,
}

impl TextTransform {
    /// Apply this transformation to `input`.
    ///
    /// Borrowed input is returned untouched when the step is a no-op.
    pub fn apply<'a>(&self, input: Cow<'a, str>) -> Cow<'a, str> {
        match self {
            TextTransform::UrlDecode => {
                if !input.contains(['%', '+']) {
                    return input;
                }
                Cow::Owned(url_decode(&input))
            }
            TextTransform::Lowercase => {
                if !input.chars().any(char::is_uppercase) {
                    return input;
                }
                Cow::Owned(input.to_lowercase())
            }
            TextTransform::CompressWhitespace => {
                if !needs_compression(&input) {
                    return input;
                }
                Cow::Owned(compress_whitespace(&input))
            }
        }
    }
}

/// Apply `transforms` to `input` strictly in the listed order.
pub fn apply_all<'a>(transforms: &[TextTransform], input: &'a str) -> Cow<'a, str> {
    transforms
        .iter()
        .fold(Cow::Borrowed(input), |value, transform| transform.apply(value))
}

fn url_decode(input: &str) -> String {
    let spaced = input.replace('+', " ");
    let decoded = urlencoding::decode_binary(spaced.as_bytes());
    String::from_utf8_lossy(&decoded).into_owned()
}

fn needs_compression(input: &str) -> bool {
    let mut previous_space = false;
    for c in input.chars() {
        if c.is_whitespace() {
            if previous_space || c != ' ' {
                return true;
            }
            previous_space = true;
        } else {
            previous_space = false;
        }
    }
    false
}

fn compress_whitespace(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut in_space = false;

    for c in input.chars() {
        if c.is_whitespace() {
            if !in_space {
                result.push(' ');
                in_space = true;
            }
        } else {
            result.push(c);
            in_space = false;
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use TextTransform::*;

    #[test]
    fn test_url_decode() {
        assert_eq!(apply_all(&[UrlDecode], "%27%20OR%201%3D1--"), "' OR 1=1--");
        assert_eq!(apply_all(&[UrlDecode], "a+b"), "a b");
        assert_eq!(apply_all(&[UrlDecode], "100%"), "100%");
    }

    #[test]
    fn test_lowercase() {
        assert_eq!(apply_all(&[Lowercase], "UNION Select"), "union select");
    }

    #[test]
    fn test_compress_whitespace() {
        assert_eq!(apply_all(&[CompressWhitespace], "a \t\n b   c"), "a b c");
        assert_eq!(apply_all(&[CompressWhitespace], "already fine"), "already fine");
    }

    #[test]
    fn test_order_is_respected() {
        // Decoding first exposes the encoded spaces to compression.
        assert_eq!(apply_all(&[UrlDecode, CompressWhitespace], "a%20%20b"), "a b");
        assert_eq!(apply_all(&[CompressWhitespace, UrlDecode], "a%20%20b"), "a  b");

        // Lowercasing before decoding leaves decoded capitals alone.
        assert_eq!(apply_all(&[Lowercase, UrlDecode], "%4F"), "O");
        assert_eq!(apply_all(&[UrlDecode, Lowercase], "%4F"), "o");
    }

    #[test]
    fn test_no_transforms_borrows() {
        assert!(matches!(apply_all(&[], "Value"), Cow::Borrowed("Value")));
        assert!(matches!(apply_all(&[Lowercase], "value"), Cow::Borrowed(_)));
    }
}
