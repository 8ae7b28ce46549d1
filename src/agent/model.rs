//! Registration state exchanged with the platform and persisted by the agent.

use serde::{Deserialize, Deserializer, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, saturating at zero for clocks set before 1970.
pub fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Credential kinds a boarding key may allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialProfile {
    #[serde(rename = "SHARED_SECRET")]
    SharedSecret,
    #[serde(rename = "RSA_3072")]
    Rsa3072,
}

/// Boarding payload issued by the platform. Never mutated by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationContent {
    pub base_url: String,
    /// Initial access token, valid only for the registration call.
    pub iat: String,
    pub client_credential_profile: Vec<CredentialProfile>,
    pub client_id: String,
    pub tenant: String,
}

impl RegistrationContent {
    pub fn allows(&self, profile: CredentialProfile) -> bool {
        self.client_credential_profile.contains(&profile)
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

/// Boarding key document as downloaded from the platform UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardingKey {
    pub content: RegistrationContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
}

/// Client registration returned by onboarding and by every key rotation.
///
/// `client_id` is stable. `registration_access_token` changes on every
/// rotation and is the only credential that can perform the next one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
    pub registration_access_token: String,
    pub registration_client_uri: String,
    #[serde(default)]
    pub grant_types: Vec<String>,
    #[serde(default)]
    pub token_endpoint_auth_method: String,
}

/// OAuth access token as returned by the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    #[serde(default)]
    pub jti: String,
    #[serde(default, deserialize_with = "scope_list")]
    pub scope: Vec<String>,
}

/// Accepts both the OAuth space-separated form and a JSON list.
fn scope_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scope {
        Joined(String),
        List(Vec<String>),
    }

    Ok(match Scope::deserialize(deserializer)? {
        Scope::Joined(joined) => joined.split_whitespace().map(str::to_owned).collect(),
        Scope::List(list) => list,
    })
}

/// An access token together with the absolute time it stops being usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedToken {
    pub token: AccessToken,
    /// Epoch seconds.
    pub expires_at: u64,
}

impl CachedToken {
    pub fn issued(token: AccessToken, now: u64) -> Self {
        let expires_at = now.saturating_add(token.expires_in);
        Self { token, expires_at }
    }

    /// True once `now + margin` reaches the expiry.
    pub fn is_expired(&self, now: u64, margin: u64) -> bool {
        now.saturating_add(margin) >= self.expires_at
    }
}

/// A single key of the tenant's public key set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonWebKey {
    pub kty: String,
    #[serde(default)]
    pub e: String,
    #[serde(default)]
    pub n: String,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// PEM rendering of the same key, when the platform provides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<JsonWebKey>,
}

impl Jwks {
    pub fn find(&self, kid: &str) -> Option<&JsonWebKey> {
        self.keys.iter().find(|k| k.kid.as_deref() == Some(kid))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnboardingStatus {
    NotOnboarded,
    Onboarding,
    Onboarded,
}

/// Platform URLs derived from the boarding content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub register: String,
    pub token: String,
    pub jwks: String,
    pub upload: String,
}

impl Endpoints {
    pub fn for_content(content: &RegistrationContent, jwks_override: Option<&str>) -> Self {
        let base = content.base_url();
        Self {
            register: format!("{base}/register"),
            token: format!("{base}/oauth/token"),
            jwks: jwks_override
                .map(str::to_owned)
                .unwrap_or_else(|| format!("{base}/{}/token_keys", content.tenant)),
            upload: format!("{base}/files/{}", content.client_id),
        }
    }
}

/// Everything the agent knows about its own registration.
///
/// `endpoints` is derived from `content`; it is dropped together with the
/// registration state whenever the boarding content changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfiguration {
    pub content: RegistrationContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<RegistrationResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<CachedToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Endpoints>,
    /// Previously active registrations, newest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery: Vec<RegistrationResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source_configuration: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_configuration: Option<serde_json::Value>,
}

impl AgentConfiguration {
    pub fn new(content: RegistrationContent) -> Self {
        Self {
            content,
            response: None,
            access_token: None,
            endpoints: None,
            recovery: Vec::new(),
            data_source_configuration: None,
            mapping_configuration: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.content.client_id
    }

    pub fn is_onboarded(&self) -> bool {
        self.response.is_some()
    }

    /// Installs a new registration, keeping the previous one in `recovery`.
    pub fn install_response(&mut self, response: RegistrationResponse, recovery_depth: usize) {
        if let Some(previous) = self.response.replace(response) {
            self.recovery.insert(0, previous);
            self.recovery.truncate(recovery_depth);
        }
        self.access_token = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boarding_key_uses_platform_field_names() {
        let key: BoardingKey = serde_json::from_str(
            r#"{
                "content": {
                    "baseUrl": "https://southgate.example/",
                    "iat": "eyJ...",
                    "clientCredentialProfile": ["SHARED_SECRET"],
                    "clientId": "a1b2",
                    "tenant": "acme"
                },
                "expiration": "2026-10-23T09:00:00.000Z"
            }"#,
        )
        .unwrap();
        assert_eq!(key.content.base_url(), "https://southgate.example");
        assert!(key.content.allows(CredentialProfile::SharedSecret));
        assert!(!key.content.allows(CredentialProfile::Rsa3072));
    }

    #[test]
    fn scope_accepts_string_and_list() {
        let joined: AccessToken = serde_json::from_str(
            r#"{"access_token":"a","token_type":"Bearer","expires_in":3600,"jti":"j","scope":"mdsp:core:Agent mdsp:core:Files"}"#,
        )
        .unwrap();
        let listed: AccessToken = serde_json::from_str(
            r#"{"access_token":"a","token_type":"Bearer","expires_in":3600,"jti":"j","scope":["mdsp:core:Agent","mdsp:core:Files"]}"#,
        )
        .unwrap();
        assert_eq!(joined.scope, listed.scope);
        assert_eq!(joined.scope.len(), 2);
    }

    #[test]
    fn install_response_keeps_bounded_recovery() {
        let content = RegistrationContent {
            base_url: "https://southgate.example".into(),
            iat: "iat".into(),
            client_credential_profile: vec![CredentialProfile::SharedSecret],
            client_id: "a1b2".into(),
            tenant: "acme".into(),
        };
        let mut config = AgentConfiguration::new(content);
        for i in 0..5 {
            config.install_response(
                RegistrationResponse {
                    client_id: "a1b2".into(),
                    client_secret: Some(format!("secret-{i}")),
                    client_secret_expires_at: Some(i),
                    client_id_issued_at: None,
                    registration_access_token: format!("rat-{i}"),
                    registration_client_uri: "https://southgate.example/register/a1b2".into(),
                    grant_types: vec!["client_credentials".into()],
                    token_endpoint_auth_method: "private_key_jwt".into(),
                },
                2,
            );
        }
        assert_eq!(
            config.response.as_ref().unwrap().registration_access_token,
            "rat-4"
        );
        let kept: Vec<_> = config
            .recovery
            .iter()
            .map(|r| r.registration_access_token.as_str())
            .collect();
        assert_eq!(kept, vec!["rat-3", "rat-2"]);
    }

    #[test]
    fn cached_token_expiry_honours_margin() {
        let token = AccessToken {
            access_token: "a".into(),
            token_type: "Bearer".into(),
            expires_in: 3600,
            jti: "j".into(),
            scope: vec![],
        };
        let cached = CachedToken::issued(token, 1_000);
        assert!(!cached.is_expired(1_000, 60));
        assert!(cached.is_expired(4_540, 60));
        assert!(cached.is_expired(4_600, 0));
    }
}
