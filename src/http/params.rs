//! Header value parsing: parameterized values, quality lists, RFC 5987.

use memchr::memchr;

/// A header value split into its base value and its parameters, e.g.
/// `multipart/form-data; boundary=xyz` or
/// `attachment; filename*=UTF-8''na%C3%AFve.txt`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedValue {
    /// The part before the first unquoted `;`, trimmed.
    pub value: String,
    /// Parameters in order of appearance, names lowercased. When both
    /// `name` and `name*` forms were present, only the decoded `name*`
    /// variant is kept.
    pub parameters: Vec<(String, String)>,
}

impl ParsedValue {
    /// First parameter with the given (lowercase) name.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Splits a parameterized header value at unquoted semicolons.
///
/// Quoted-string parameter values lose their quotes; an unmatched opening
/// quote is tolerated and runs to the end of the segment. RFC 5987
/// `name*=charset''percent-encoded` parameters are decoded and take
/// precedence over a plain `name` duplicate.
pub fn parse_parameterized(input: &str) -> ParsedValue {
    let mut segments = split_unquoted(input, b';');
    let value = segments.next().unwrap_or_default().trim().to_string();

    let mut parameters: Vec<(String, String)> = Vec::new();
    let mut extended: Vec<String> = Vec::new();

    for segment in segments {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (raw_name, raw_value) = match memchr(b'=', segment.as_bytes()) {
            Some(eq) => (&segment[..eq], &segment[eq + 1..]),
            // An attribute without a value is kept with an empty value.
            None => (segment, ""),
        };
        let name = raw_name.trim().to_ascii_lowercase();
        let value = unquote(raw_value.trim());

        if let Some(plain) = name.strip_suffix('*') {
            let plain = plain.to_string();
            let decoded = decode_rfc5987(&value).unwrap_or(value);
            // The encoded form wins over a plain duplicate in either order.
            if let Some(entry) = parameters.iter_mut().find(|(n, _)| *n == plain) {
                entry.1 = decoded;
            } else {
                parameters.push((plain.clone(), decoded));
            }
            extended.push(plain);
        } else if !extended.contains(&name) {
            parameters.push((name, value));
        }
    }

    ParsedValue { value, parameters }
}

/// The base value of a `Content-Type` header, lowercased, without
/// parameters: `Text/HTML; charset=utf-8` → `text/html`.
pub(crate) fn content_type_base(value: &str) -> String {
    let end = memchr(b';', value.as_bytes()).unwrap_or(value.len());
    value[..end].trim().to_ascii_lowercase()
}

/// One entry of an `Accept-Encoding` list.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedEncoding {
    /// The coding name, lowercased (`gzip`, `deflate`, `br`, `*`, ...).
    pub name: String,
    /// The quality value, `1.0` when absent. `0.0` means "not acceptable".
    pub q: f32,
}

/// Parses an `Accept-Encoding` header into entries ordered by descending
/// quality, original position breaking ties. Zero-quality entries are kept
/// (they explicitly forbid a coding) but sort last.
pub fn parse_accept_encoding(value: &str) -> Vec<AcceptedEncoding> {
    let mut entries: Vec<(usize, AcceptedEncoding)> = Vec::new();

    for (position, item) in value.split(',').enumerate() {
        let parsed = parse_parameterized(item);
        if parsed.value.is_empty() {
            continue;
        }
        let q = parsed
            .parameter("q")
            .and_then(|q| q.parse::<f32>().ok())
            .map(|q| q.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        entries.push((
            position,
            AcceptedEncoding { name: parsed.value.to_ascii_lowercase(), q },
        ));
    }

    entries.sort_by(|(pos_a, a), (pos_b, b)| {
        b.q.partial_cmp(&a.q)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(pos_a.cmp(pos_b))
    });
    entries.into_iter().map(|(_, e)| e).collect()
}

/// Iterator over `input` split at unquoted occurrences of `delimiter`.
pub(crate) fn split_unquoted(input: &str, delimiter: u8) -> SplitUnquoted<'_> {
    SplitUnquoted { rest: Some(input), delimiter }
}

pub(crate) struct SplitUnquoted<'a> {
    rest: Option<&'a str>,
    delimiter: u8,
}

impl<'a> Iterator for SplitUnquoted<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let rest = self.rest?;
        let bytes = rest.as_bytes();
        let mut in_quotes = false;
        let mut escaped = false;

        for (i, &byte) in bytes.iter().enumerate() {
            if escaped {
                escaped = false;
                continue;
            }
            match byte {
                b'\\' if in_quotes => escaped = true,
                b'"' => in_quotes = !in_quotes,
                b if b == self.delimiter && !in_quotes => {
                    self.rest = Some(&rest[i + 1..]);
                    return Some(&rest[..i]);
                }
                _ => {}
            }
        }
        self.rest = None;
        Some(rest)
    }
}

/// Strips a surrounding quoted-string, tolerating a missing closing quote,
/// and resolves backslash escapes. Values that are not quoted pass through
/// unchanged (base64 `=` padding included).
pub(crate) fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"') else {
        return value.to_string();
    };
    let inner = inner.strip_suffix('"').unwrap_or(inner);

    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for ch in inner.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else {
            out.push(ch);
        }
    }
    if escaped {
        out.push('\\');
    }
    out
}

/// Decodes an RFC 5987 `charset'language'percent-encoded` value. Only the
/// UTF-8 and ISO-8859-1 charsets are recognized; anything else is left to
/// the caller's fallback.
fn decode_rfc5987(value: &str) -> Option<String> {
    let mut parts = value.splitn(3, '\'');
    let charset = parts.next()?;
    let _language = parts.next()?;
    let encoded = parts.next()?;

    let bytes = percent_decode(encoded)?;
    match charset.to_ascii_lowercase().as_str() {
        "utf-8" => Some(crate::http::types::bytes_to_string(&bytes)),
        "iso-8859-1" => Some(bytes.iter().map(|&b| b as char).collect()),
        _ => None,
    }
}

fn percent_decode(input: &str) -> Option<Vec<u8>> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = hex_digit(*bytes.get(i + 1)?)?;
            let lo = hex_digit(*bytes.get(i + 2)?)?;
            out.push(hi << 4 | lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Some(out)
}

#[inline]
fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_value_without_parameters() {
        let parsed = parse_parameterized("text/html");
        assert_eq!(parsed.value, "text/html");
        assert!(parsed.parameters.is_empty());
    }

    #[test]
    fn parameters_split_and_lowercase_names() {
        let parsed = parse_parameterized("multipart/form-data; BOUNDARY=abc123; x=1");
        assert_eq!(parsed.value, "multipart/form-data");
        assert_eq!(parsed.parameter("boundary"), Some("abc123"));
        assert_eq!(parsed.parameter("x"), Some("1"));
    }

    #[test]
    fn quoted_semicolons_do_not_split() {
        let parsed = parse_parameterized(r#"attachment; filename="a;b.txt"; x=y"#);
        assert_eq!(parsed.parameter("filename"), Some("a;b.txt"));
        assert_eq!(parsed.parameter("x"), Some("y"));
    }

    #[test]
    fn unmatched_quote_is_tolerated() {
        let parsed = parse_parameterized(r#"attachment; filename="report.pdf"#);
        assert_eq!(parsed.parameter("filename"), Some("report.pdf"));
    }

    #[test]
    fn empty_attribute_value_is_kept() {
        let parsed = parse_parameterized("form-data; name=; other");
        assert_eq!(parsed.parameter("name"), Some(""));
        assert_eq!(parsed.parameter("other"), Some(""));
    }

    #[test]
    fn base64_padding_survives() {
        let parsed = parse_parameterized("custom; token=YWJjZA==");
        assert_eq!(parsed.parameter("token"), Some("YWJjZA=="));
    }

    #[test]
    fn rfc5987_encoded_parameter_wins() {
        let parsed = parse_parameterized(
            "attachment; filename=\"fallback.txt\"; filename*=UTF-8''na%C3%AFve.txt",
        );
        assert_eq!(parsed.parameter("filename"), Some("naïve.txt"));

        // Same result when the encoded form comes first.
        let parsed = parse_parameterized(
            "attachment; filename*=UTF-8''na%C3%AFve.txt; filename=\"fallback.txt\"",
        );
        assert_eq!(parsed.parameter("filename"), Some("naïve.txt"));
    }

    #[test]
    fn rfc5987_iso_8859_1() {
        let parsed = parse_parameterized("attachment; filename*=ISO-8859-1''f%E9e.txt");
        assert_eq!(parsed.parameter("filename"), Some("fée.txt"));
    }

    #[test]
    fn content_type_base_strips_parameters() {
        assert_eq!(
            content_type_base("Text/HTML; charset=utf-8"),
            "text/html"
        );
        assert_eq!(content_type_base("application/json"), "application/json");
    }

    #[test]
    fn accept_encoding_order() {
        let list = parse_accept_encoding("deflate, gzip;q=0.8");
        let names: Vec<&str> = list.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["deflate", "gzip"]);

        let list = parse_accept_encoding("gzip;q=0.5, deflate;q=0.9, br");
        let names: Vec<&str> = list.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["br", "deflate", "gzip"]);
    }

    #[test]
    fn accept_encoding_zero_quality_sorts_last() {
        let list = parse_accept_encoding("gzip;q=0, deflate");
        assert_eq!(list[0].name, "deflate");
        assert_eq!(list[1].name, "gzip");
        assert_eq!(list[1].q, 0.0);
    }

    #[test]
    fn accept_encoding_empty_items_skipped() {
        let list = parse_accept_encoding(" , gzip, ");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "gzip");
    }
}
