//! `WWW-Authenticate` challenge header parsing, and the resulting
//! authentication state machine described in §4.6.

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChallenge {
    pub scheme: ChallengeScheme,
    pub realm: Option<String>,
    pub service: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeScheme {
    Basic,
    Bearer,
    Unknown,
}

/// Parses a `WWW-Authenticate` header value of the form
/// `Scheme key1="value1",key2='value2'`, tolerant of whitespace around
/// commas and the `=`. Only `realm` and `service` are extracted; other
/// parameters (e.g. `scope`, `error`) are ignored.
pub fn parse_challenge(header: &str) -> Option<ParsedChallenge> {
    let header = header.trim();
    let (scheme_tok, rest) = header.split_once(char::is_whitespace)?;
    let scheme = match scheme_tok.to_ascii_lowercase().as_str() {
        "basic" => ChallengeScheme::Basic,
        "bearer" => ChallengeScheme::Bearer,
        _ => ChallengeScheme::Unknown,
    };

    let mut realm = None;
    let mut service = None;
    for pair in rest.split(',') {
        let pair = pair.trim();
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        let unquoted = strip_quotes(value);
        match key {
            "realm" => realm = Some(unquoted.to_string()),
            "service" => service = Some(unquoted.to_string()),
            _ => {}
        }
    }

    Some(ParsedChallenge {
        scheme,
        realm,
        service,
    })
}

fn strip_quotes(s: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = s.strip_prefix(quote).and_then(|s| s.strip_suffix(quote)) {
            return inner;
        }
    }
    s
}

/// Synthesizes the Bearer challenge quay.io is known to omit from its
/// `WWW-Authenticate` header on a bare `GET /v2/` 401 (§4.6 step 3).
pub fn quay_fallback_challenge() -> ParsedChallenge {
    ParsedChallenge {
        scheme: ChallengeScheme::Bearer,
        realm: Some("https://quay.io/v2/auth".to_string()),
        service: Some("quay.io".to_string()),
    }
}

/// The registry client's current authentication state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
}
