use crate::auth::{
    self, validate_device_id_format, ChallengeStore, TokenManager, TOKEN_VERSION_DEVICE_TICKET,
    TOKEN_VERSION_SESSION,
};
use crate::config::DEFAULT_DEVICE_TICKET_TTL;
use crate::error::{error_response, json_response, success_response};
use crate::limit::{ConnLimiter, IpRateLimiter};
use crate::realtime::{run_connection, Hub, REQUIRED_PEERS};
use crate::store::{Device, Store, StoreError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use hyper::body::HttpBody as _;
use hyper::header::{HeaderMap, COOKIE, ORIGIN, SET_COOKIE};
use hyper::{Body, Method, Request, Response, StatusCode};
use hyper_tungstenite::tungstenite::protocol::WebSocketConfig;
use ipnet::IpNet;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "ff_session";
pub const DEVICE_TICKET_COOKIE: &str = "device_ticket";

/// Addresses allowed to speak for their clients via forwarding headers.
/// Anything else has its headers ignored outright.
pub struct TrustedProxies {
    networks: Vec<IpNet>,
}

impl TrustedProxies {
    pub fn none() -> Self {
        Self {
            networks: Vec::new(),
        }
    }

    /// Comma-separated CIDRs and bare IPs (`10.0.0.0/8, 127.0.0.1, ::1`).
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut networks = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if part.contains('/') {
                let net: IpNet = part
                    .parse()
                    .map_err(|_| format!("invalid trusted proxy: {part}"))?;
                networks.push(net);
            } else {
                let ip: IpAddr = part
                    .parse()
                    .map_err(|_| format!("invalid trusted proxy: {part}"))?;
                networks.push(IpNet::from(ip));
            }
        }
        Ok(Self { networks })
    }

    pub fn is_trusted(&self, host: &str) -> bool {
        let Ok(ip) = host.parse::<IpAddr>() else {
            return false;
        };
        self.networks.iter().any(|net| net.contains(&ip))
    }
}

/// The immediate remote host is authoritative unless it is a trusted proxy;
/// only then are forwarding headers consulted, scanning `X-Forwarded-For`
/// right to left for the first hop that is not itself trusted.
pub fn resolve_client_ip(
    trusted: &TrustedProxies,
    remote: SocketAddr,
    headers: &HeaderMap,
) -> String {
    let host = remote.ip().to_string();
    if !trusted.is_trusted(&host) {
        return host;
    }

    if let Some(xff) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        for entry in xff.split(',').rev() {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if !trusted.is_trusted(entry) {
                return entry.to_string();
            }
        }
    }

    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let xri = xri.trim();
        if xri.parse::<IpAddr>().is_ok() {
            return xri.to_string();
        }
    }

    host
}

fn origin_allowed(allowed: &str, origin: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match origin {
        Some(origin) => origin == allowed || origin == format!("https://{allowed}"),
        None => false,
    }
}

fn get_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for value in headers.get_all(COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((key, val)) = pair.trim().split_once('=') {
                if key == name {
                    return Some(val.to_string());
                }
            }
        }
    }
    None
}

fn cookie_header(name: &str, value: &str, max_age: Duration, secure: bool) -> String {
    let mut header = format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Strict",
        name,
        value,
        max_age.as_secs()
    );
    if secure {
        header.push_str("; Secure");
    }
    header
}

pub struct GatewayConfig {
    pub store: Store,
    pub token_manager: TokenManager,
    pub hub: Arc<Hub>,
    pub challenge_store: Arc<ChallengeStore>,
    pub login_limiter: Arc<IpRateLimiter>,
    pub request_limiter: Arc<IpRateLimiter>,
    pub conn_limiter: Arc<ConnLimiter>,
    pub secret_hash: String,
    pub bootstrap_token: String,
    pub secure_cookies: bool,
    pub session_ttl: Duration,
    pub device_ticket_ttl: Duration,
    pub max_body_bytes: usize,
    pub max_ws_msg_bytes: usize,
    pub allowed_origin: String,
    pub trusted_proxies: TrustedProxies,
}

/// The HTTP surface: REST handlers, cookie plumbing, and the upgrade
/// pipeline into the realtime hub. One instance per process, shared by every
/// request task.
pub struct Gateway {
    store: Store,
    tokens: TokenManager,
    hub: Arc<Hub>,
    challenges: Arc<ChallengeStore>,
    login_limiter: Arc<IpRateLimiter>,
    request_limiter: Arc<IpRateLimiter>,
    conn_limiter: Arc<ConnLimiter>,
    secret_hash: String,
    bootstrap_token: String,
    secure_cookies: bool,
    session_ttl: Duration,
    device_ticket_ttl: Duration,
    max_body_bytes: usize,
    max_ws_msg_bytes: usize,
    allowed_origin: String,
    trusted_proxies: TrustedProxies,
}

impl Gateway {
    pub fn new(cfg: GatewayConfig) -> Arc<Self> {
        let device_ticket_ttl = if cfg.device_ticket_ttl.is_zero() {
            DEFAULT_DEVICE_TICKET_TTL
        } else {
            cfg.device_ticket_ttl
        };
        Arc::new(Self {
            store: cfg.store,
            tokens: cfg.token_manager,
            hub: cfg.hub,
            challenges: cfg.challenge_store,
            login_limiter: cfg.login_limiter,
            request_limiter: cfg.request_limiter,
            conn_limiter: cfg.conn_limiter,
            secret_hash: cfg.secret_hash,
            bootstrap_token: cfg.bootstrap_token,
            secure_cookies: cfg.secure_cookies,
            session_ttl: cfg.session_ttl,
            device_ticket_ttl,
            max_body_bytes: cfg.max_body_bytes,
            max_ws_msg_bytes: cfg.max_ws_msg_bytes,
            allowed_origin: cfg.allowed_origin,
            trusted_proxies: cfg.trusted_proxies,
        })
    }

    pub fn client_ip(&self, remote: SocketAddr, headers: &HeaderMap) -> String {
        resolve_client_ip(&self.trusted_proxies, remote, headers)
    }

    fn apply_cors(&self, origin: Option<&str>, response: &mut Response<Body>) {
        let Some(origin) = origin else { return };
        if !origin_allowed(&self.allowed_origin, Some(origin)) || self.allowed_origin.is_empty() {
            return;
        }
        let headers = response.headers_mut();
        if let Ok(value) = origin.parse() {
            headers.insert("Access-Control-Allow-Origin", value);
        }
        headers.insert("Access-Control-Allow-Credentials", "true".parse().unwrap());
        headers.insert(
            "Access-Control-Allow-Methods",
            "GET, POST, OPTIONS".parse().unwrap(),
        );
        headers.insert(
            "Access-Control-Allow-Headers",
            "Content-Type, X-Admin-Bootstrap".parse().unwrap(),
        );
    }

    async fn collect_body(&self, body: Body) -> Result<Vec<u8>, Response<Body>> {
        let mut body = body;
        if let Some(declared) = body.size_hint().upper() {
            if declared as usize > self.max_body_bytes {
                return Err(error_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "REQUEST_TOO_LARGE",
                    "Request body too large",
                ));
            }
        }

        let mut data = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk.map_err(|_| {
                error_response(
                    StatusCode::BAD_REQUEST,
                    "INVALID_REQUEST",
                    "Failed to read request body",
                )
            })?;
            if data.len() + chunk.len() > self.max_body_bytes {
                return Err(error_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "REQUEST_TOO_LARGE",
                    "Request body too large",
                ));
            }
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    async fn parse_body<T: for<'de> Deserialize<'de>>(
        &self,
        body: Body,
    ) -> Result<T, Response<Body>> {
        let data = self.collect_body(body).await?;
        serde_json::from_slice(&data).map_err(|_| {
            error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
                "Invalid JSON body",
            )
        })
    }

    fn verify_device_ticket(&self, headers: &HeaderMap) -> Result<String, Response<Body>> {
        let Some(ticket) = get_cookie(headers, DEVICE_TICKET_COOKIE) else {
            return Err(error_response(
                StatusCode::UNAUTHORIZED,
                "MISSING_DEVICE_TICKET",
                "Device ticket required",
            ));
        };

        let claims = self
            .tokens
            .verify_with_version(&ticket, TOKEN_VERSION_DEVICE_TICKET)
            .map_err(|_| {
                error_response(
                    StatusCode::UNAUTHORIZED,
                    "INVALID_DEVICE_TICKET",
                    "Invalid device ticket",
                )
            })?;

        if !validate_device_id_format(&claims.sid) {
            return Err(error_response(
                StatusCode::UNAUTHORIZED,
                "INVALID_DEVICE_TICKET",
                "Invalid device ticket",
            ));
        }
        Ok(claims.sid)
    }

    fn session_claims(&self, headers: &HeaderMap) -> Option<auth::Claims> {
        let token = get_cookie(headers, SESSION_COOKIE)?;
        self.tokens
            .verify_with_version(&token, TOKEN_VERSION_SESSION)
            .ok()
    }

    async fn handle_healthz(&self) -> Response<Body> {
        json_response(StatusCode::OK, &json!({"ok": true}))
    }

    async fn handle_admin_devices(&self, req: Request<Body>) -> Response<Body> {
        let token = req
            .headers()
            .get("x-admin-bootstrap")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if token.is_empty() || token != self.bootstrap_token {
            return error_response(
                StatusCode::UNAUTHORIZED,
                "INVALID_TOKEN",
                "Invalid bootstrap token",
            );
        }

        #[derive(Deserialize)]
        struct EnrollRequest {
            #[serde(default)]
            device_id: String,
            #[serde(default)]
            pub_jwk: Value,
            #[serde(default)]
            label: String,
        }

        let body: EnrollRequest = match self.parse_body(req.into_body()).await {
            Ok(body) => body,
            Err(response) => return response,
        };

        if !validate_device_id_format(&body.device_id) {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_DEVICE_ID",
                "Invalid device ID format",
            );
        }

        let Ok((_, jwk)) = auth::parse_ec_public_jwk(&body.pub_jwk) else {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_PUBLIC_KEY",
                "Invalid public key",
            );
        };

        // The id is defined as the canonical-JSON hash of the key; an
        // enrollment request that disagrees is rejected outright.
        if auth::device_id_from_jwk(&jwk) != body.device_id {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_DEVICE_ID",
                "Device ID does not match public key",
            );
        }

        let device = Device {
            device_id: body.device_id,
            pub_jwk_json: auth::canonical_jwk_json(&jwk),
            label: body.label,
            created_at: Utc::now().timestamp_millis(),
            last_seen: None,
        };

        match self.store.add_device(&device).await {
            Ok(()) => json_response(StatusCode::OK, &json!({"added": true})),
            Err(StoreError::DeviceExists) => error_response(
                StatusCode::CONFLICT,
                "DEVICE_EXISTS",
                "Device already enrolled",
            ),
            Err(_) => {
                error!("device registry insert failed");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Failed to add device",
                )
            }
        }
    }

    async fn handle_device_challenge(&self, req: Request<Body>) -> Response<Body> {
        #[derive(Deserialize)]
        struct ChallengeRequest {
            #[serde(default)]
            device_id: String,
            #[serde(default)]
            pub_jwk: Value,
        }

        let body: ChallengeRequest = match self.parse_body(req.into_body()).await {
            Ok(body) => body,
            Err(response) => return response,
        };

        if !validate_device_id_format(&body.device_id) {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_DEVICE_ID",
                "Invalid device ID format",
            );
        }

        let Ok((_, request_jwk)) = auth::parse_ec_public_jwk(&body.pub_jwk) else {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_PUBLIC_KEY",
                "Invalid public key",
            );
        };

        let device = match self.store.get_device(&body.device_id).await {
            Ok(device) => device,
            Err(StoreError::DeviceNotFound) => {
                return error_response(
                    StatusCode::FORBIDDEN,
                    "DEVICE_NOT_ENROLLED",
                    "Device not enrolled",
                );
            }
            Err(_) => {
                error!("device registry lookup failed");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Failed to load device",
                );
            }
        };

        let stored = auth::parse_ec_public_jwk_str(&device.pub_jwk_json);
        let matches = matches!(stored, Ok((_, ref stored_jwk)) if *stored_jwk == request_jwk);
        if !matches {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_PUBLIC_KEY",
                "Public key does not match enrollment",
            );
        }

        let challenge = self.challenges.create(&body.device_id);
        json_response(
            StatusCode::OK,
            &json!({
                "challenge_id": challenge.id,
                "nonce": URL_SAFE_NO_PAD.encode(challenge.nonce),
            }),
        )
    }

    async fn handle_device_attest(&self, req: Request<Body>) -> Response<Body> {
        #[derive(Deserialize)]
        struct AttestRequest {
            #[serde(default)]
            challenge_id: String,
            #[serde(default)]
            device_id: String,
            #[serde(default)]
            signature: String,
        }

        let body: AttestRequest = match self.parse_body(req.into_body()).await {
            Ok(body) => body,
            Err(response) => return response,
        };

        if body.challenge_id.is_empty() || !validate_device_id_format(&body.device_id) {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_DEVICE_ID",
                "Invalid request",
            );
        }

        let challenge = match self.challenges.consume(&body.challenge_id) {
            Ok(challenge) => challenge,
            Err(_) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "CHALLENGE_EXPIRED",
                    "Challenge expired",
                );
            }
        };

        if challenge.device_id != body.device_id {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_DEVICE_ID",
                "Device mismatch",
            );
        }

        let device = match self.store.get_device(&body.device_id).await {
            Ok(device) => device,
            Err(StoreError::DeviceNotFound) => {
                return error_response(
                    StatusCode::FORBIDDEN,
                    "DEVICE_NOT_ENROLLED",
                    "Device not enrolled",
                );
            }
            Err(_) => {
                error!("device registry lookup failed");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Failed to load device",
                );
            }
        };

        let Ok((key, _)) = auth::parse_ec_public_jwk_str(&device.pub_jwk_json) else {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_PUBLIC_KEY",
                "Invalid enrolled public key",
            );
        };

        let Ok(signature) = URL_SAFE_NO_PAD.decode(&body.signature) else {
            return error_response(
                StatusCode::UNAUTHORIZED,
                "INVALID_SIGNATURE",
                "Invalid signature",
            );
        };

        if !auth::verify_ecdsa_signature(&key, &challenge.nonce, &signature) {
            return error_response(
                StatusCode::UNAUTHORIZED,
                "INVALID_SIGNATURE",
                "Signature verification failed",
            );
        }

        if self
            .store
            .touch_device_last_seen(&body.device_id, Utc::now().timestamp_millis())
            .await
            .is_err()
        {
            warn!("last_seen update failed");
        }

        let ticket = match self.tokens.sign(
            &body.device_id,
            TOKEN_VERSION_DEVICE_TICKET,
            self.device_ticket_ttl,
        ) {
            Ok(ticket) => ticket,
            Err(_) => {
                error!("device ticket signing failed");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Failed to sign ticket",
                );
            }
        };

        let mut response = json_response(StatusCode::OK, &json!({"device_ok": true}));
        if let Ok(value) = cookie_header(
            DEVICE_TICKET_COOKIE,
            &ticket,
            self.device_ticket_ttl,
            self.secure_cookies,
        )
        .parse()
        {
            response.headers_mut().append(SET_COOKIE, value);
        }
        response
    }

    async fn handle_login(&self, req: Request<Body>, ip: &str) -> Response<Body> {
        if !self.login_limiter.allow(ip) {
            return error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "Too many requests",
            );
        }

        #[derive(Deserialize)]
        struct LoginRequest {
            #[serde(default)]
            secret: String,
            #[serde(default)]
            device_id: String,
        }

        let headers = req.headers().clone();
        let body: LoginRequest = match self.parse_body(req.into_body()).await {
            Ok(body) => body,
            Err(response) => return response,
        };

        let ticket_device = match self.verify_device_ticket(&headers) {
            Ok(device_id) => device_id,
            Err(response) => return response,
        };

        if body.device_id.is_empty() {
            return error_response(
                StatusCode::UNAUTHORIZED,
                "DEVICE_REQUIRED",
                "Device ID is required",
            );
        }
        if !validate_device_id_format(&body.device_id) {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_DEVICE_ID",
                "Invalid device ID format",
            );
        }
        if body.device_id != ticket_device {
            return error_response(
                StatusCode::UNAUTHORIZED,
                "DEVICE_TICKET_MISMATCH",
                "Device ticket mismatch",
            );
        }

        match self.store.get_device(&ticket_device).await {
            Ok(_) => {}
            Err(StoreError::DeviceNotFound) => {
                return error_response(
                    StatusCode::FORBIDDEN,
                    "DEVICE_NOT_ENROLLED",
                    "Device not enrolled",
                );
            }
            Err(_) => {
                error!("device registry lookup failed during login");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Internal server error",
                );
            }
        }

        // Wrong secrets share the response shape with successful ones so the
        // status code carries no oracle.
        if !auth::verify_secret(&body.secret, &self.secret_hash) {
            return json_response(StatusCode::OK, &json!({"authed": false}));
        }

        let sid = Uuid::new_v4().to_string();
        let token = match self
            .tokens
            .sign(&sid, TOKEN_VERSION_SESSION, self.session_ttl)
        {
            Ok(token) => token,
            Err(_) => {
                error!("session token signing failed");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Failed to generate token",
                );
            }
        };

        let mut response = json_response(StatusCode::OK, &json!({"authed": true}));
        if let Ok(value) =
            cookie_header(SESSION_COOKIE, &token, self.session_ttl, self.secure_cookies).parse()
        {
            response.headers_mut().append(SET_COOKIE, value);
        }
        response
    }

    async fn handle_session(&self, req: &Request<Body>) -> Response<Body> {
        let authed = self.session_claims(req.headers()).is_some();
        json_response(StatusCode::OK, &json!({"authed": authed}))
    }

    async fn handle_presence(&self, req: &Request<Body>) -> Response<Body> {
        if self.session_claims(req.headers()).is_none() {
            return error_response(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "Session required");
        }
        success_response(json!({
            "online": self.hub.online_count().await,
            "required": REQUIRED_PEERS,
        }))
    }

    /// Upgrade pipeline, strictly ordered: ticket, enrollment, session,
    /// origin, connection counter, and only then the protocol switch.
    async fn handle_ws(&self, mut req: Request<Body>, ip: &str) -> Response<Body> {
        let device_id = match self.verify_device_ticket(req.headers()) {
            Ok(device_id) => device_id,
            Err(response) => return response,
        };

        match self.store.get_device(&device_id).await {
            Ok(_) => {}
            Err(StoreError::DeviceNotFound) => {
                return error_response(
                    StatusCode::FORBIDDEN,
                    "DEVICE_NOT_ENROLLED",
                    "Device not enrolled",
                );
            }
            Err(_) => {
                error!("device registry lookup failed during upgrade");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Internal server error",
                );
            }
        }

        let Some(claims) = self.session_claims(req.headers()) else {
            return error_response(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "Session required");
        };

        let origin = req
            .headers()
            .get(ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if !origin_allowed(&self.allowed_origin, origin.as_deref()) {
            return error_response(
                StatusCode::FORBIDDEN,
                "ORIGIN_NOT_ALLOWED",
                "Origin not allowed",
            );
        }

        if !hyper_tungstenite::is_upgrade_request(&req) {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
                "WebSocket upgrade required",
            );
        }

        if !self.conn_limiter.acquire(ip) {
            info!("connection limit exceeded for {}", ip);
            return error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "CONNECTION_LIMIT",
                "Too many connections",
            );
        }

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.max_ws_msg_bytes);
        ws_config.max_frame_size = Some(self.max_ws_msg_bytes);

        match hyper_tungstenite::upgrade(&mut req, Some(ws_config)) {
            Ok((response, websocket)) => {
                let hub = Arc::clone(&self.hub);
                let conn_limiter = Arc::clone(&self.conn_limiter);
                let client_id = claims.sid;
                let ip = ip.to_string();
                tokio::spawn(async move {
                    match websocket.await {
                        Ok(ws) => run_connection(ws, hub, client_id, ip, conn_limiter).await,
                        Err(e) => {
                            warn!("websocket handshake failed: {}", e);
                            conn_limiter.release(&ip);
                        }
                    }
                });
                response
            }
            Err(e) => {
                self.conn_limiter.release(ip);
                warn!("websocket upgrade rejected: {}", e);
                error_response(
                    StatusCode::BAD_REQUEST,
                    "INVALID_REQUEST",
                    "Invalid WebSocket upgrade request",
                )
            }
        }
    }

    async fn route(&self, req: Request<Body>, ip: &str) -> Response<Body> {
        const POST_ROUTES: [&str; 4] = [
            "/api/device/challenge",
            "/api/device/attest",
            "/api/login",
            "/api/admin/devices",
        ];

        let path = req.uri().path().to_string();
        match (req.method().clone(), path.as_str()) {
            (Method::GET, "/healthz") => self.handle_healthz().await,
            (Method::POST, "/api/device/challenge") => self.handle_device_challenge(req).await,
            (Method::POST, "/api/device/attest") => self.handle_device_attest(req).await,
            (Method::POST, "/api/login") => self.handle_login(req, ip).await,
            (Method::GET, "/api/session") => self.handle_session(&req).await,
            (Method::GET, "/api/presence") => self.handle_presence(&req).await,
            (Method::POST, "/api/admin/devices") => self.handle_admin_devices(req).await,
            (Method::GET, "/ws") => self.handle_ws(req, ip).await,
            (_, path)
                if POST_ROUTES.contains(&path)
                    || path == "/healthz"
                    || path == "/api/session"
                    || path == "/api/presence"
                    || path == "/ws" =>
            {
                error_response(
                    StatusCode::METHOD_NOT_ALLOWED,
                    "METHOD_NOT_ALLOWED",
                    "Method not allowed",
                )
            }
            _ => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "Not found"),
        }
    }
}

fn apply_security_headers(response: &mut Response<Body>) {
    let headers = response.headers_mut();
    headers.insert("X-Content-Type-Options", "nosniff".parse().unwrap());
    headers.insert("X-Frame-Options", "DENY".parse().unwrap());
    headers.insert(
        "Referrer-Policy",
        "strict-origin-when-cross-origin".parse().unwrap(),
    );
}

/// One entry point per request: resolves the client ip, answers preflights,
/// applies the per-ip limiter, dispatches, then stamps CORS and security
/// headers and writes the access-log line. Request bodies and frame payloads
/// never reach the log.
pub async fn handle_request(
    gateway: Arc<Gateway>,
    remote: SocketAddr,
    req: Request<Body>,
) -> Response<Body> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let origin = req
        .headers()
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let ip = gateway.client_ip(remote, req.headers());

    let mut response = if method == Method::OPTIONS {
        Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .unwrap()
    } else if !gateway.request_limiter.allow(&ip) {
        error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "Too many requests",
        )
    } else {
        gateway.route(req, &ip).await
    };

    gateway.apply_cors(origin.as_deref(), &mut response);
    apply_security_headers(&mut response);

    info!(
        "{} {} {} {:?}",
        method,
        path,
        response.status().as_u16(),
        started.elapsed()
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                hyper::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        headers
    }

    #[test]
    fn client_ip_resolution_table() {
        let trusted = TrustedProxies::parse("10.0.0.0/8, 127.0.0.1, ::1").unwrap();

        struct Case {
            name: &'static str,
            remote: &'static str,
            headers: Vec<(&'static str, &'static str)>,
            want: &'static str,
        }

        let cases = [
            Case {
                name: "direct connection, untrusted remote",
                remote: "203.0.113.1:12345",
                headers: vec![],
                want: "203.0.113.1",
            },
            Case {
                name: "trusted proxy with forwarded chain",
                remote: "127.0.0.1:55555",
                headers: vec![("x-forwarded-for", "203.0.113.5, 10.0.0.1")],
                want: "203.0.113.5",
            },
            Case {
                name: "trusted proxy with spoofed leading entry",
                remote: "127.0.0.1:55555",
                headers: vec![("x-forwarded-for", "spoofed-ip, 203.0.113.5, 10.0.0.1")],
                want: "203.0.113.5",
            },
            Case {
                name: "untrusted proxy, headers ignored",
                remote: "192.0.2.1:44444",
                headers: vec![("x-forwarded-for", "203.0.113.5")],
                want: "192.0.2.1",
            },
            Case {
                name: "trusted ipv6 localhost",
                remote: "[::1]:12345",
                headers: vec![("x-forwarded-for", "2001:db8::1")],
                want: "2001:db8::1",
            },
            Case {
                name: "trusted remote falls back to x-real-ip",
                remote: "127.0.0.1:55555",
                headers: vec![("x-real-ip", "198.51.100.7")],
                want: "198.51.100.7",
            },
            Case {
                name: "trusted remote with junk x-real-ip",
                remote: "127.0.0.1:55555",
                headers: vec![("x-real-ip", "not-an-ip")],
                want: "127.0.0.1",
            },
        ];

        for case in cases {
            let remote: SocketAddr = case.remote.parse().unwrap();
            let got = resolve_client_ip(&trusted, remote, &headers_with(&case.headers));
            assert_eq!(got, case.want, "{}", case.name);
        }
    }

    #[test]
    fn untrusted_remote_never_consults_headers() {
        // No trusted proxies configured at all.
        let trusted = TrustedProxies::none();
        let remote: SocketAddr = "203.0.113.9:41000".parse().unwrap();
        let headers = headers_with(&[("x-forwarded-for", "10.0.0.1")]);
        assert_eq!(resolve_client_ip(&trusted, remote, &headers), "203.0.113.9");
    }

    #[test]
    fn trusted_proxy_parse_rejects_garbage() {
        assert!(TrustedProxies::parse("10.0.0.0/8").is_ok());
        assert!(TrustedProxies::parse("10.0.0.0/8, ,127.0.0.1").is_ok());
        assert!(TrustedProxies::parse("not-a-cidr").is_err());
        assert!(TrustedProxies::parse("10.0.0.0/33").is_err());
    }

    #[test]
    fn origin_matching() {
        assert!(origin_allowed("", None));
        assert!(origin_allowed("", Some("https://anything.example")));
        assert!(origin_allowed("relay.example.com", Some("relay.example.com")));
        assert!(origin_allowed(
            "relay.example.com",
            Some("https://relay.example.com")
        ));
        assert!(!origin_allowed(
            "relay.example.com",
            Some("http://relay.example.com")
        ));
        assert!(!origin_allowed("relay.example.com", Some("evil.example")));
        assert!(!origin_allowed("relay.example.com", None));
    }

    #[test]
    fn cookie_parsing_and_formatting() {
        let headers = headers_with(&[("cookie", "a=1; ff_session=tok.sig; device_ticket=t.s")]);
        assert_eq!(get_cookie(&headers, SESSION_COOKIE).as_deref(), Some("tok.sig"));
        assert_eq!(get_cookie(&headers, DEVICE_TICKET_COOKIE).as_deref(), Some("t.s"));
        assert_eq!(get_cookie(&headers, "missing"), None);

        let secure = cookie_header("ff_session", "v", Duration::from_secs(60), true);
        assert_eq!(
            secure,
            "ff_session=v; Path=/; Max-Age=60; HttpOnly; SameSite=Strict; Secure"
        );
        let insecure = cookie_header("ff_session", "v", Duration::from_secs(60), false);
        assert!(!insecure.contains("Secure"));
    }
}
