//! Session credential sources for the feed connection.
//!
//! The token is attached through WebSocket sub-protocol negotiation
//! (`Sec-WebSocket-Protocol: jwt, <token>`), never as a query parameter or
//! message field, so it does not show up in request lines.

use std::borrow::Cow;
use std::fmt;

/// Cookies that may carry the dashboard session token, in lookup order.
pub const SESSION_COOKIE_NAMES: [&str; 2] = ["next-auth.session-token", "authjs.session-token"];

/// Sub-protocol name announced ahead of the token.
pub const TOKEN_SUBPROTOCOL: &str = "jwt";

/// An ambient store the transport reads a bearer token from before each dial.
pub trait CredentialSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// No credentials; the connection is opened anonymously.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoToken;

impl CredentialSource for NoToken {
    fn token(&self) -> Option<String> {
        None
    }
}

/// A fixed token.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticToken(<redacted>)")
    }
}

impl CredentialSource for StaticToken {
    fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Reads the token from an environment variable at dial time, so a token
/// rotated by the environment is picked up on the next reconnect.
#[derive(Clone, Debug)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialSource for EnvToken {
    fn token(&self) -> Option<String> {
        std::env::var(&self.var).ok().filter(|t| !t.is_empty())
    }
}

/// Extracts the session token from a `Cookie:` header value
/// (`name=value; other=value`).
#[derive(Clone)]
pub struct CookieToken {
    cookies: String,
}

impl CookieToken {
    pub fn new(cookies: impl Into<String>) -> Self {
        Self {
            cookies: cookies.into(),
        }
    }
}

impl fmt::Debug for CookieToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CookieToken(<redacted>)")
    }
}

impl CredentialSource for CookieToken {
    fn token(&self) -> Option<String> {
        SESSION_COOKIE_NAMES
            .iter()
            .find_map(|name| cookie_value(&self.cookies, name))
    }
}

/// Look up `name` in a cookie string and percent-decode its value.
pub fn cookie_value(cookies: &str, name: &str) -> Option<String> {
    cookies
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| {
            urlencoding::decode(value)
                .map(Cow::into_owned)
                .unwrap_or_else(|_| value.to_owned())
        })
        .filter(|value| !value.is_empty())
}

/// Explicit token wins over the ambient source.
pub fn resolve_token(explicit: Option<&str>, source: &dyn CredentialSource) -> Option<String> {
    explicit
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .or_else(|| source.token())
}

/// Value for the `Sec-WebSocket-Protocol` request header.
pub fn subprotocol_header(token: &str) -> String {
    format!("{TOKEN_SUBPROTOCOL}, {token}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_token_prefers_next_auth() {
        let source = CookieToken::new("theme=dark; authjs.session-token=new; next-auth.session-token=old");
        assert_eq!(source.token().as_deref(), Some("old"));
    }

    #[test]
    fn test_cookie_token_falls_back_to_authjs() {
        let source = CookieToken::new("theme=dark; authjs.session-token=abc.def");
        assert_eq!(source.token().as_deref(), Some("abc.def"));
    }

    #[test]
    fn test_cookie_token_missing() {
        assert!(CookieToken::new("theme=dark").token().is_none());
        assert!(CookieToken::new("").token().is_none());
        assert!(CookieToken::new("next-auth.session-token=").token().is_none());
    }

    #[test]
    fn test_cookie_value_is_percent_decoded() {
        assert_eq!(
            cookie_value("a=x%2Ey%3D; b=2", "a").as_deref(),
            Some("x.y=")
        );
        // Malformed escapes pass through untouched.
        assert_eq!(cookie_value("a=100%", "a").as_deref(), Some("100%"));
        assert_eq!(cookie_value("a=%zz", "a").as_deref(), Some("%zz"));
    }

    #[test]
    fn test_explicit_token_wins() {
        let ambient = StaticToken::new("ambient");
        assert_eq!(
            resolve_token(Some("explicit"), &ambient).as_deref(),
            Some("explicit")
        );
        assert_eq!(resolve_token(None, &ambient).as_deref(), Some("ambient"));
        assert_eq!(resolve_token(Some(""), &ambient).as_deref(), Some("ambient"));
        assert!(resolve_token(None, &NoToken).is_none());
    }

    #[test]
    fn test_debug_output_redacts_token() {
        let rendered = format!("{:?}", StaticToken::new("secret-value"));
        assert!(!rendered.contains("secret-value"));
    }

    #[test]
    fn test_subprotocol_header() {
        assert_eq!(subprotocol_header("tok"), "jwt, tok");
    }
}
