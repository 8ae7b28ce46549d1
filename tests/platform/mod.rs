#![allow(dead_code)]

use libiot_agent::agent::jwt;
use libiot_agent::agent::model::{
    CredentialProfile, JsonWebKey, Jwks, RegistrationContent, now_epoch_secs,
};
use libiot_agent::network::{Body, Error, Header, Part, Request, Response, Transport};
use rsa::RsaPrivateKey;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

pub const BASE: &str = "https://southgate.test";
pub const TENANT: &str = "acme";
pub const CLIENT_ID: &str = "agent-0001";
pub const IAT: &str = "initial-access-token";
pub const TOKEN_URL: &str = "https://southgate.test/oauth/token";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const SECRET_LIFETIME_SECS: u64 = 30 * 24 * 60 * 60;

pub static PLATFORM_KEY: LazyLock<RsaPrivateKey> = LazyLock::new(|| generate_key(1024));
pub static NEXT_PLATFORM_KEY: LazyLock<RsaPrivateKey> = LazyLock::new(|| generate_key(1024));
pub static ROGUE_KEY: LazyLock<RsaPrivateKey> = LazyLock::new(|| generate_key(1024));
pub static AGENT_KEY: LazyLock<RsaPrivateKey> = LazyLock::new(|| generate_key(1024));

pub fn generate_key(bits: usize) -> RsaPrivateKey {
    RsaPrivateKey::new(&mut rand::thread_rng(), bits).unwrap()
}

pub fn content(profiles: &[CredentialProfile]) -> RegistrationContent {
    RegistrationContent {
        base_url: format!("{BASE}/"),
        iat: IAT.into(),
        client_credential_profile: profiles.to_vec(),
        client_id: CLIENT_ID.into(),
        tenant: TENANT.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Register,
    Rotate,
    Token,
    Jwks,
    Chunk,
    Whole,
    Finalize,
}

#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Refused,
    Status(u16),
}

// -------------------------
// Server-side state
// -------------------------

#[derive(Debug)]
struct Registration {
    secret: Option<String>,
    agent_keys: Option<Jwks>,
    rat: String,
    expires_at: u64,
}

struct State {
    registration: Option<Registration>,
    seq: u64,
    signing_kid: String,
    signing_key: &'static RsaPrivateKey,
    published: Vec<(String, &'static RsaPrivateKey)>,
    issued: HashSet<String>,
    seen_jti: HashSet<String>,
    files: HashMap<String, BTreeMap<usize, Vec<u8>>>,
    range_faults: HashMap<usize, usize>,
    faults: HashMap<Route, VecDeque<Fault>>,
    corrupt_digest: bool,
    if_match: Vec<Option<String>>,
}

/// In-process identity service, key server and file service.
pub struct MockPlatform {
    state: Mutex<State>,
    calls: Mutex<HashMap<Route, usize>>,
    token_delay: Duration,
    in_flight_tokens: AtomicUsize,
    max_in_flight_tokens: AtomicUsize,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::with_token_delay(Duration::ZERO)
    }

    /// Token requests take `delay`, widening the window for concurrent callers.
    pub fn with_token_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                registration: None,
                seq: 0,
                signing_kid: "platform-1".into(),
                signing_key: &*PLATFORM_KEY,
                published: vec![("platform-1".into(), &*PLATFORM_KEY)],
                issued: HashSet::new(),
                seen_jti: HashSet::new(),
                files: HashMap::new(),
                range_faults: HashMap::new(),
                faults: HashMap::new(),
                corrupt_digest: false,
                if_match: Vec::new(),
            }),
            calls: Mutex::new(HashMap::new()),
            token_delay: delay,
            in_flight_tokens: AtomicUsize::new(0),
            max_in_flight_tokens: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self, route: Route) -> usize {
        self.calls.lock().unwrap().get(&route).copied().unwrap_or(0)
    }

    pub fn max_concurrent_token_requests(&self) -> usize {
        self.max_in_flight_tokens.load(Ordering::SeqCst)
    }

    /// The next request on `route` fails with `fault`. Faults queue up.
    pub fn inject(&self, route: Route, fault: Fault) {
        let mut state = self.state.lock().unwrap();
        state.faults.entry(route).or_default().push_back(fault);
    }

    /// The next `times` chunk requests starting at byte `start` get a 503.
    pub fn fail_range(&self, start: usize, times: usize) {
        self.state.lock().unwrap().range_faults.insert(start, times);
    }

    /// Starts signing with a new key. The old key stays published when `keep_old`.
    pub fn rotate_signing_key(&self, keep_old: bool) {
        let mut state = self.state.lock().unwrap();
        if !keep_old {
            state.published.clear();
        }
        state.signing_kid = "platform-2".into();
        state.signing_key = &*NEXT_PLATFORM_KEY;
        state.published.push(("platform-2".into(), &*NEXT_PLATFORM_KEY));
    }

    /// Signs further tokens with a key the key set never contains.
    pub fn sign_with_unpublished_key(&self) {
        let mut state = self.state.lock().unwrap();
        state.signing_kid = "rogue".into();
        state.signing_key = &*ROGUE_KEY;
    }

    /// Every access token issued so far stops being accepted.
    pub fn revoke_tokens(&self) {
        self.state.lock().unwrap().issued.clear();
    }

    pub fn corrupt_digest(&self) {
        self.state.lock().unwrap().corrupt_digest = true;
    }

    pub fn if_match_seen(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().if_match.clone()
    }

    pub fn current_registration_token(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.registration.as_ref().map(|r| r.rat.clone())
    }

    fn route(request: &Request) -> Option<Route> {
        let url = request.url.as_str();
        let files = format!("{BASE}/files/{CLIENT_ID}/");
        if url == format!("{BASE}/register") {
            Some(Route::Register)
        } else if url.starts_with(&format!("{BASE}/register/")) {
            Some(Route::Rotate)
        } else if url == TOKEN_URL {
            Some(Route::Token)
        } else if url == format!("{BASE}/{TENANT}/token_keys") {
            Some(Route::Jwks)
        } else if url.starts_with(&files) && url.ends_with("?upload=complete") {
            Some(Route::Finalize)
        } else if url.starts_with(&files) && request.header("Content-Range").is_some() {
            Some(Route::Chunk)
        } else if url.starts_with(&files) {
            Some(Route::Whole)
        } else {
            None
        }
    }
}

#[async_trait::async_trait]
impl Transport for MockPlatform {
    async fn execute(&self, request: Request) -> Result<Response, Error> {
        let Some(route) = Self::route(&request) else {
            return Ok(reply(404, json!({ "error": "not_found" })));
        };
        *self.calls.lock().unwrap().entry(route).or_default() += 1;

        if route == Route::Token {
            let now = self.in_flight_tokens.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight_tokens.fetch_max(now, Ordering::SeqCst);
            if !self.token_delay.is_zero() {
                tokio::time::sleep(self.token_delay).await;
            }
            self.in_flight_tokens.fetch_sub(1, Ordering::SeqCst);
        } else {
            tokio::task::yield_now().await;
        }

        let fault = {
            let mut state = self.state.lock().unwrap();
            state.faults.get_mut(&route).and_then(VecDeque::pop_front)
        };
        match fault {
            Some(Fault::Refused) => return Err(Error::ConnectionRefused),
            Some(Fault::Status(status)) => {
                return Ok(reply(status, json!({ "error": "injected" })));
            }
            None => {}
        }

        let mut state = self.state.lock().unwrap();
        Ok(match route {
            Route::Register => register(&mut state, &request),
            Route::Rotate => rotate(&mut state, &request),
            Route::Token => token(&mut state, &request),
            Route::Jwks => jwks(&state),
            Route::Chunk => chunk(&mut state, &request),
            Route::Whole => whole(&mut state, &request),
            Route::Finalize => finalize(&mut state, &request),
        })
    }
}

// -------------------------
// Handlers
// -------------------------

fn reply(status: u16, body: serde_json::Value) -> Response {
    Response {
        status_code: status,
        headers: vec![Header::new("Content-Type", "application/json")],
        body: serde_json::to_vec(&body).unwrap(),
    }
}

fn bearer(request: &Request) -> Option<&str> {
    request.header("Authorization")?.strip_prefix("Bearer ")
}

fn json_body(request: &Request) -> serde_json::Value {
    match &request.body {
        Body::Json(value) => value.clone(),
        _ => serde_json::Value::Null,
    }
}

fn issue_registration(state: &mut State, agent_keys: Option<Jwks>) -> serde_json::Value {
    state.seq += 1;
    let seq = state.seq;
    let secret = agent_keys.is_none().then(|| format!("secret-{seq}"));
    let expires_at = now_epoch_secs() + SECRET_LIFETIME_SECS + seq;
    let rat = format!("rat-{seq}");
    let body = json!({
        "client_id": CLIENT_ID,
        "client_secret": secret,
        "client_secret_expires_at": expires_at,
        "client_id_issued_at": now_epoch_secs(),
        "registration_access_token": rat,
        "registration_client_uri": format!("{BASE}/register/{CLIENT_ID}"),
        "grant_types": ["client_credentials", JWT_BEARER_GRANT],
        "token_endpoint_auth_method": if agent_keys.is_some() { "private_key_jwt" } else { "client_secret_jwt" },
    });
    state.registration = Some(Registration {
        secret,
        agent_keys,
        rat,
        expires_at,
    });
    body
}

fn agent_keys(body: &serde_json::Value) -> Option<Jwks> {
    body.get("jwks")
        .and_then(|jwks| serde_json::from_value(jwks.clone()).ok())
}

fn register(state: &mut State, request: &Request) -> Response {
    if bearer(request) != Some(IAT) {
        return reply(400, json!({ "error": "invalid_iat" }));
    }
    let body = json_body(request);
    if body["client_id"] != CLIENT_ID {
        return reply(400, json!({ "error": "unknown_client" }));
    }
    if state.registration.is_some() {
        return reply(409, json!({ "error": "already_registered" }));
    }
    reply(201, issue_registration(state, agent_keys(&body)))
}

fn rotate(state: &mut State, request: &Request) -> Response {
    let live = state.registration.as_ref().map(|r| r.rat.as_str());
    if live.is_none() || bearer(request) != live {
        return reply(401, json!({ "error": "invalid_token" }));
    }
    let body = json_body(request);
    let keys = agent_keys(&body);
    reply(200, issue_registration(state, keys))
}

fn form_field<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    match &request.body {
        Body::Form(pairs) => pairs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str()),
        _ => None,
    }
}

fn token(state: &mut State, request: &Request) -> Response {
    let assertion = match form_field(request, "grant_type") {
        Some(JWT_BEARER_GRANT) => form_field(request, "assertion"),
        Some("client_credentials") => form_field(request, "client_assertion"),
        _ => None,
    };
    let (Some(assertion), Some(registration)) = (assertion, state.registration.as_ref()) else {
        return reply(400, json!({ "error": "invalid_request" }));
    };

    let verified = match (&registration.secret, &registration.agent_keys) {
        (Some(secret), _) => jwt::verify_hs256(assertion, secret.as_bytes()),
        (None, Some(keys)) => jwt::verify_rs256(assertion, keys),
        (None, None) => return reply(401, json!({ "error": "invalid_client" })),
    };
    let Ok(decoded) = verified else {
        return reply(401, json!({ "error": "invalid_client" }));
    };
    let claims = decoded.claims;
    let now = now_epoch_secs();
    let jti = claims["jti"].as_str().unwrap_or_default().to_owned();
    let valid = claims["iss"] == CLIENT_ID
        && claims["sub"] == CLIENT_ID
        && claims["aud"] == TOKEN_URL
        && claims["exp"].as_u64().is_some_and(|exp| exp > now && exp <= now + 600)
        && !jti.is_empty()
        && state.seen_jti.insert(jti);
    if !valid {
        return reply(401, json!({ "error": "invalid_grant" }));
    }

    let token_jti = uuid::Uuid::new_v4().to_string();
    let access_token = jwt::sign_rs256(
        Some(state.signing_kid.as_str()),
        &json!({
            "iss": format!("{BASE}/oauth/token"),
            "sub": CLIENT_ID,
            "ten": TENANT,
            "iat": now,
            "exp": now + 3600,
            "jti": token_jti,
        }),
        state.signing_key,
    )
    .unwrap();
    state.issued.insert(access_token.clone());

    reply(
        200,
        json!({
            "access_token": access_token,
            "token_type": "Bearer",
            "expires_in": 3600,
            "jti": token_jti,
            "scope": "mdsp:core:Agent mdsp:core:Files",
        }),
    )
}

fn jwks(state: &State) -> Response {
    let keys: Vec<JsonWebKey> = state
        .published
        .iter()
        .map(|(kid, key)| jwt::to_jwk(&key.to_public_key(), kid))
        .collect();
    reply(200, json!(Jwks { keys }))
}

fn authorized(state: &State, request: &Request) -> bool {
    bearer(request).is_some_and(|token| state.issued.contains(token))
}

fn file_path(request: &Request) -> String {
    let files = format!("{BASE}/files/{CLIENT_ID}/");
    request
        .url
        .trim_start_matches(&files)
        .trim_end_matches("?upload=complete")
        .to_owned()
}

fn file_content(request: &Request) -> Option<Vec<u8>> {
    match &request.body {
        Body::Multipart(parts) => parts.iter().find_map(|part| match part {
            Part::File { content, .. } => Some(content.clone()),
            Part::Text { .. } => None,
        }),
        _ => None,
    }
}

/// Parses `bytes first-last/total` into `first`.
fn range_start(request: &Request) -> Option<usize> {
    let range = request.header("Content-Range")?.strip_prefix("bytes ")?;
    range.split('-').next()?.parse().ok()
}

fn chunk(state: &mut State, request: &Request) -> Response {
    state
        .if_match
        .push(request.header("If-Match").map(str::to_owned));
    if !authorized(state, request) {
        return reply(401, json!({ "error": "invalid_token" }));
    }
    let (Some(start), Some(content)) = (range_start(request), file_content(request)) else {
        return reply(400, json!({ "error": "bad_chunk" }));
    };
    if let Some(remaining) = state.range_faults.get_mut(&start) {
        if *remaining > 0 {
            *remaining -= 1;
            return reply(503, json!({ "error": "busy" }));
        }
    }
    state
        .files
        .entry(file_path(request))
        .or_default()
        .insert(start, content);
    reply(202, json!({ "status": "accepted" }))
}

fn whole(state: &mut State, request: &Request) -> Response {
    if !authorized(state, request) {
        return reply(401, json!({ "error": "invalid_token" }));
    }
    let Some(content) = file_content(request) else {
        return reply(400, json!({ "error": "no_file" }));
    };
    let md5 = digest(state, &content);
    state
        .files
        .insert(file_path(request), BTreeMap::from([(0, content)]));
    reply(201, json!({ "md5": md5, "etag": "\"1\"" }))
}

fn finalize(state: &mut State, request: &Request) -> Response {
    if !authorized(state, request) {
        return reply(401, json!({ "error": "invalid_token" }));
    }
    let Some(parts) = state.files.get(&file_path(request)) else {
        return reply(404, json!({ "error": "no_such_upload" }));
    };
    let assembled: Vec<u8> = parts.values().flatten().copied().collect();
    let md5 = digest(state, &assembled);
    reply(200, json!({ "md5": md5, "etag": format!("\"{}\"", assembled.len()) }))
}

fn digest(state: &State, bytes: &[u8]) -> String {
    use md5::{Digest, Md5};
    if state.corrupt_digest {
        return "00000000000000000000000000000000".into();
    }
    hex::encode(Md5::digest(bytes))
}
