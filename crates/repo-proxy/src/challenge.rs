//! `WWW-Authenticate` bearer challenge parsing
//!
//! Registries in the wild vary in quoting, parameter order, and whitespace:
//!
//! ```text
//! Bearer realm="https://auth.docker.io/token",service="registry.docker.io"
//! Bearer realm="https://ghcr.io/token", service="ghcr.io",scope="repository:o/r:pull"
//! ```
//!
//! Scopes may contain commas inside the quoted value, so the parameter list
//! cannot be split on commas naively. This parser walks the header with a
//! small state machine instead.

/// A parsed bearer challenge from a 401 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    /// Build the token-endpoint URL for this challenge.
    pub fn token_url(&self) -> String {
        let mut url = self.realm.clone();
        let mut params = Vec::new();
        if let Some(service) = &self.service {
            params.push(format!("service={}", service));
        }
        if let Some(scope) = &self.scope {
            params.push(format!("scope={}", scope));
        }
        if !params.is_empty() {
            url.push('?');
            url.push_str(&params.join("&"));
        }
        url
    }
}

enum State {
    Key,
    Value { quoted: bool },
}

/// Parse a `WWW-Authenticate: Bearer ...` header value.
///
/// Returns `None` for non-bearer schemes or when no realm is present.
pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let trimmed = header.trim();
    if trimmed.len() < 7
        || !trimmed.is_char_boundary(7)
        || !trimmed[..7].eq_ignore_ascii_case("bearer ")
    {
        return None;
    }

    let mut realm = None;
    let mut service = None;
    let mut scope = None;

    let mut state = State::Key;
    let mut key = String::new();
    let mut value = String::new();

    let mut store = |key: &str, value: &str| match key {
        "realm" => realm = Some(value.to_string()),
        "service" => service = Some(value.to_string()),
        "scope" => scope = Some(value.to_string()),
        _ => {}
    };

    for ch in trimmed[7..].chars() {
        match state {
            State::Key => match ch {
                '=' => state = State::Value { quoted: false },
                ',' => key.clear(),
                c if c.is_whitespace() => {}
                c => key.push(c.to_ascii_lowercase()),
            },
            State::Value { quoted } => match ch {
                '"' if value.is_empty() && !quoted => state = State::Value { quoted: true },
                '"' if quoted => {
                    store(&key, &value);
                    key.clear();
                    value.clear();
                    state = State::Key;
                }
                ',' if !quoted => {
                    store(&key, value.trim());
                    key.clear();
                    value.clear();
                    state = State::Key;
                }
                c => value.push(c),
            },
        }
    }

    // Unquoted trailing value
    if let State::Value { quoted: false } = state {
        if !value.trim().is_empty() {
            store(&key, value.trim());
        }
    }

    realm.map(|realm| BearerChallenge {
        realm,
        service,
        scope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_challenge() {
        let c = parse_bearer_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:samalba/my-app:pull,push""#,
        )
        .unwrap();
        assert_eq!(c.realm, "https://auth.docker.io/token");
        assert_eq!(c.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(c.scope.as_deref(), Some("repository:samalba/my-app:pull,push"));
    }

    #[test]
    fn tolerates_spacing_variants() {
        for header in [
            r#"Bearer realm="https://auth.docker.io/token", service="registry.docker.io",scope="repository:samalba/my-app:pull,push""#,
            r#"Bearer realm="https://auth.docker.io/token", service="registry.docker.io", scope="repository:samalba/my-app:pull,push""#,
            r#"bearer  realm="https://auth.docker.io/token" ,service="registry.docker.io" , scope="repository:samalba/my-app:pull,push""#,
        ] {
            let c = parse_bearer_challenge(header).unwrap();
            assert_eq!(c.realm, "https://auth.docker.io/token");
            assert_eq!(c.service.as_deref(), Some("registry.docker.io"));
        }
    }

    #[test]
    fn parses_without_scope() {
        let c = parse_bearer_challenge(r#"Bearer realm="https://r.example/token",service="r.example""#)
            .unwrap();
        assert!(c.scope.is_none());
        assert_eq!(c.token_url(), "https://r.example/token?service=r.example");
    }

    #[test]
    fn parses_unquoted_values() {
        let c = parse_bearer_challenge("Bearer realm=https://r.example/token,service=r.example")
            .unwrap();
        assert_eq!(c.realm, "https://r.example/token");
        assert_eq!(c.service.as_deref(), Some("r.example"));
    }

    #[test]
    fn rejects_basic_scheme() {
        assert!(parse_bearer_challenge(r#"Basic realm="upstream""#).is_none());
    }

    #[test]
    fn rejects_missing_realm() {
        assert!(parse_bearer_challenge(r#"Bearer service="registry""#).is_none());
    }

    #[test]
    fn token_url_includes_scope() {
        let c = BearerChallenge {
            realm: "https://auth.example/token".to_string(),
            service: Some("auth.example".to_string()),
            scope: Some("repository:library/nginx:pull".to_string()),
        };
        assert_eq!(
            c.token_url(),
            "https://auth.example/token?service=auth.example&scope=repository:library/nginx:pull"
        );
    }
}
