//! Caller identity.
//!
//! Tokens are verified by the gateway in front of this service; only the
//! claims of the bearer token are read here.

use crate::fetcher::acl::{ROLE_ADMIN, ROLE_GUEST};
use axum::{
    extract::Query,
    http::{header, HeaderMap, Uri},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

pub const ROLE_PREFIX: &str = "ODH_ROLE_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Roles without prefix; `[ADMIN]` alone, or always including `GUEST`.
    pub roles: Vec<String>,
    pub subject: Option<String>,
    pub referer: Option<String>,
}

impl Default for Caller {
    fn default() -> Self {
        Self {
            roles: vec![ROLE_GUEST.to_string()],
            subject: None,
            referer: None,
        }
    }
}

impl Caller {
    pub fn from_request(headers: &HeaderMap, uri: &Uri) -> Self {
        let claims = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")))
            .and_then(decode_claims);

        let (roles, subject) = match claims {
            Some(claims) => (roles_of(&claims), claims.subject()),
            None => (vec![ROLE_GUEST.to_string()], None),
        };

        Self {
            roles,
            subject,
            referer: referer(headers, uri),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|role| role == ROLE_ADMIN)
    }

    /// Bucket owner: the subject, else the referer, else empty.
    pub fn user_or_referer(&self) -> &str {
        self.subject
            .as_deref()
            .or(self.referer.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
struct RoleClaim {
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Claims {
    #[serde(default)]
    realm_access: Option<RoleClaim>,
    #[serde(default)]
    resource_access: BTreeMap<String, RoleClaim>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    sub: Option<String>,
}

impl Claims {
    fn subject(&self) -> Option<String> {
        self.preferred_username
            .clone()
            .or_else(|| self.sub.clone())
            .filter(|subject| !subject.is_empty())
    }
}

fn decode_claims(token: &str) -> Option<Claims> {
    let payload = token.split('.').nth(1)?;
    let bytes = match URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(error = %err, "bearer token payload is not base64");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(claims) => Some(claims),
        Err(err) => {
            debug!(error = %err, "bearer token payload is not a claim set");
            None
        }
    }
}

fn roles_of(claims: &Claims) -> Vec<String> {
    let granted = claims
        .realm_access
        .iter()
        .chain(claims.resource_access.values())
        .flat_map(|claim| claim.roles.iter());

    let mut roles: Vec<String> = Vec::new();
    for role in granted {
        let Some(name) = role.strip_prefix(ROLE_PREFIX) else {
            continue;
        };
        if name == ROLE_ADMIN {
            return vec![ROLE_ADMIN.to_string()];
        }
        if !roles.iter().any(|known| known == name) {
            roles.push(name.to_string());
        }
    }
    if !roles.iter().any(|role| role == ROLE_GUEST) {
        roles.push(ROLE_GUEST.to_string());
    }
    roles
}

/// `referer` or `Referer` query parameter, then the `Referer` header.
fn referer(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let from_query = Query::<HashMap<String, String>>::try_from_uri(uri)
        .ok()
        .and_then(|Query(params)| {
            params
                .get("referer")
                .or_else(|| params.get("Referer"))
                .cloned()
        });
    let from_header = || {
        headers
            .get(header::REFERER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };

    from_query
        .filter(|value| !value.trim().is_empty())
        .or_else(|| from_header().filter(|value| !value.trim().is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn bearer(claims: serde_json::Value) -> HeaderMap {
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer e30.{payload}.sig")).unwrap(),
        );
        headers
    }

    #[test]
    fn anonymous_callers_are_guests() {
        let caller = Caller::from_request(&HeaderMap::new(), &Uri::from_static("/flat"));
        assert_eq!(caller, Caller::default());
        assert_eq!(caller.user_or_referer(), "");
    }

    #[test]
    fn prefixed_roles_are_collected_from_realm_and_clients() {
        let headers = bearer(json!({
            "sub": "1234",
            "preferred_username": "alice",
            "realm_access": {"roles": ["ODH_ROLE_PREMIUM", "offline_access"]},
            "resource_access": {"odh": {"roles": ["ODH_ROLE_PARTNER", "ODH_ROLE_PREMIUM"]}},
        }));
        let caller = Caller::from_request(&headers, &Uri::from_static("/flat"));
        assert_eq!(caller.roles, vec!["PREMIUM", "PARTNER", "GUEST"]);
        assert_eq!(caller.subject.as_deref(), Some("alice"));
        assert!(!caller.is_admin());
    }

    #[test]
    fn admin_collapses_the_role_set() {
        let headers = bearer(json!({
            "sub": "root",
            "realm_access": {"roles": ["ODH_ROLE_GUEST", "ODH_ROLE_ADMIN"]},
        }));
        let caller = Caller::from_request(&headers, &Uri::from_static("/"));
        assert_eq!(caller.roles, vec!["ADMIN"]);
        assert_eq!(caller.subject.as_deref(), Some("root"));
    }

    #[test]
    fn referer_prefers_query_parameter() {
        let mut headers = HeaderMap::new();
        headers.insert(header::REFERER, HeaderValue::from_static("https://header.example"));

        let caller = Caller::from_request(&headers, &Uri::from_static("/flat?referer=my-app"));
        assert_eq!(caller.referer.as_deref(), Some("my-app"));

        let caller = Caller::from_request(&headers, &Uri::from_static("/flat?referer="));
        assert_eq!(caller.referer.as_deref(), Some("https://header.example"));
        assert_eq!(caller.user_or_referer(), "https://header.example");
    }
}
