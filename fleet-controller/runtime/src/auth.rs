use crate::core::{Error, Fingerprint, Identity};
use ahash::AHashMap as HashMap;
use http::{header, Request};
use std::sync::Arc;

/// Maps bearer tokens to the identities they were issued to.
///
/// Tokens are only held as fingerprints.
#[derive(Clone, Default)]
pub struct Identities(Arc<HashMap<Fingerprint, Identity>>);

impl Identities {
    pub fn new(tokens: impl IntoIterator<Item = (String, Identity)>) -> Self {
        let by_token = tokens
            .into_iter()
            .map(|(token, identity)| (Fingerprint::of(&[token.as_bytes()]), identity))
            .collect();
        Self(Arc::new(by_token))
    }

    pub fn verify(&self, token: &str) -> Result<Identity, Error> {
        self.0
            .get(&Fingerprint::of(&[token.as_bytes()]))
            .cloned()
            .ok_or(Error::Unauthorized)
    }

    /// Identifies the caller from its `Authorization: Bearer` header.
    ///
    /// Browsers cannot set headers on WebSocket requests, so when `allow_query` is set the token
    /// may instead be passed as the `access_token` query parameter.
    pub fn authenticate<B>(&self, req: &Request<B>, allow_query: bool) -> Result<Identity, Error> {
        if let Some(token) = bearer(req) {
            return self.verify(token);
        }
        if allow_query {
            if let Some(token) = query_token(req) {
                return self.verify(&token);
            }
        }
        Err(Error::Unauthorized)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Identities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identities")
            .field("tokens", &self.0.len())
            .finish()
    }
}

fn bearer<B>(req: &Request<B>) -> Option<&str> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|t| !t.is_empty())
}

fn query_token<B>(req: &Request<B>) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "access_token")
        .map(|(_, v)| v.into_owned())
        .filter(|t| !t.is_empty())
}
