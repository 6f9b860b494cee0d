//! Anonymous bearer-token flow for upstream registries.

use serde::Deserialize;

/// Parameters of a `WWW-Authenticate: Bearer …` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (key, value) in split_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }

    pub fn query(&self) -> Vec<(&'static str, &str)> {
        let mut q = Vec::new();
        if let Some(s) = &self.service {
            q.push(("service", s.as_str()));
        }
        if let Some(s) = &self.scope {
            q.push(("scope", s.as_str()));
        }
        q
    }
}

/// Splits `k1="v,1",k2=v2` on commas outside quotes.
fn split_params(params: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    let mut push = |raw: &str| {
        if let Some((k, v)) = raw.split_once('=') {
            out.push((k.trim().to_string(), v.trim().trim_matches('"').to_string()));
        }
    };

    for c in params.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                push(&current);
                current.clear();
            }
            _ => current.push(c),
        }
    }
    push(&current);
    out
}

/// Token endpoint response. Registries disagree on the field name.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl TokenResponse {
    pub fn into_token(self) -> Option<String> {
        self.token
            .filter(|t| !t.is_empty())
            .or(self.access_token.filter(|t| !t.is_empty()))
    }
}
