//! RFC 6265 cookie parsing and serialization.
//!
//! Parsing is deliberately forgiving about what real clients and frameworks
//! emit: quoted values with or without a matched closing quote, base64 `=`
//! padding inside values, empty attribute values, and attributes this module
//! does not recognize (kept as plain key/value extensions).

use crate::http::params::unquote;

/// One `name=value` pair from a request `Cookie` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

/// Parses a request `Cookie` header: `a=1; b="hello"; c=YWJjZA==`.
///
/// Pairs without a `=` are skipped; values keep everything after the first
/// `=`, so base64 padding survives.
pub fn parse_cookie_header(header: &str) -> Vec<Cookie> {
    let mut cookies = Vec::new();
    for part in header.split(';') {
        let part = part.trim();
        let Some(eq) = part.find('=') else {
            continue;
        };
        let name = part[..eq].trim();
        if name.is_empty() {
            continue;
        }
        cookies.push(Cookie {
            name: name.to_string(),
            value: unquote(part[eq + 1..].trim()),
        });
    }
    cookies
}

/// `SameSite` attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("strict") {
            Some(SameSite::Strict)
        } else if value.eq_ignore_ascii_case("lax") {
            Some(SameSite::Lax)
        } else if value.eq_ignore_ascii_case("none") {
            Some(SameSite::None)
        } else {
            None
        }
    }
}

/// A response cookie, serialized as one `Set-Cookie` header line.
///
/// `Expires` is carried as an opaque preformatted HTTP-date string; this
/// module does not interpret dates.
///
/// # Examples
///
/// ```
/// use pier_http::SetCookie;
///
/// let cookie = SetCookie::new("session", "abc123")
///     .path("/")
///     .max_age(3600)
///     .http_only(true);
/// assert_eq!(
///     cookie.to_header_value(),
///     "session=abc123; Path=/; Max-Age=3600; HttpOnly"
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub expires: Option<String>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
    /// Attributes that are not part of RFC 6265, kept verbatim.
    pub extensions: Vec<(String, String)>,
}

impl SetCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Self::default()
        }
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// A preformatted HTTP-date, e.g. `Wed, 21 Oct 2026 07:28:00 GMT`.
    pub fn expires(mut self, expires: impl Into<String>) -> Self {
        self.expires = Some(expires.into());
        self
    }

    pub fn max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = Some(same_site);
        self
    }

    /// The `Set-Cookie` header value for this cookie.
    pub fn to_header_value(&self) -> String {
        let mut out = String::with_capacity(64);
        out.push_str(&self.name);
        out.push('=');
        out.push_str(&self.value);

        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(expires) = &self.expires {
            out.push_str("; Expires=");
            out.push_str(expires);
        }
        if let Some(max_age) = self.max_age {
            out.push_str("; Max-Age=");
            out.push_str(&max_age.to_string());
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if let Some(same_site) = self.same_site {
            out.push_str("; SameSite=");
            out.push_str(same_site.as_str());
        }
        for (name, value) in &self.extensions {
            out.push_str("; ");
            out.push_str(name);
            if !value.is_empty() {
                out.push('=');
                out.push_str(value);
            }
        }
        out
    }

    /// Parses a `Set-Cookie` header value. Returns `None` when not even a
    /// `name=value` start is present.
    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.split(';');
        let first = parts.next()?.trim();
        let eq = first.find('=')?;
        let name = first[..eq].trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = SetCookie::new(name, unquote(first[eq + 1..].trim()));

        for part in parts {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (attr_name, attr_value) = match part.find('=') {
                Some(eq) => (part[..eq].trim(), unquote(part[eq + 1..].trim())),
                None => (part, String::new()),
            };

            if attr_name.eq_ignore_ascii_case("domain") {
                cookie.domain = Some(attr_value);
            } else if attr_name.eq_ignore_ascii_case("path") {
                cookie.path = Some(attr_value);
            } else if attr_name.eq_ignore_ascii_case("expires") {
                cookie.expires = Some(attr_value);
            } else if attr_name.eq_ignore_ascii_case("max-age") {
                match attr_value.parse::<i64>() {
                    Ok(age) => cookie.max_age = Some(age),
                    // An unparsable Max-Age is preserved as an extension.
                    Err(_) => cookie
                        .extensions
                        .push((attr_name.to_string(), attr_value)),
                }
            } else if attr_name.eq_ignore_ascii_case("secure") {
                cookie.secure = true;
            } else if attr_name.eq_ignore_ascii_case("httponly") {
                cookie.http_only = true;
            } else if attr_name.eq_ignore_ascii_case("samesite") {
                match SameSite::parse(&attr_value) {
                    Some(s) => cookie.same_site = Some(s),
                    None => cookie
                        .extensions
                        .push((attr_name.to_string(), attr_value)),
                }
            } else {
                cookie
                    .extensions
                    .push((attr_name.to_string(), attr_value));
            }
        }

        Some(cookie)
    }
}
