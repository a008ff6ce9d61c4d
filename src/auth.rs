//! OAuth2 authorization-code and refresh-token handling.
//!
//! The interactive flow binds a one-shot HTTP listener on the configured port,
//! sends the user to the authorization server and waits (bounded) for the
//! redirect carrying the authorization code.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use url::Url;

use crate::api::Session;
use crate::config::ApiConfig;
use crate::error::AuthError;
use crate::token_store::{TokenPair, TokenStore};

const TOKEN_PATH: &str = "api/auth/v1/oauth2/token";
const MAX_CALLBACK_REQUEST: usize = 4096;

/// Opens the authorization URL for the user.
pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str) -> io::Result<()>;
}

/// Launches the platform's default browser.
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> io::Result<()> {
        open::that(url)
    }
}

pub struct Authenticator {
    config: ApiConfig,
    session: Arc<Session>,
    store: TokenStore,
    browser: Box<dyn BrowserLauncher>,
    http: reqwest::Client,
}

impl Authenticator {
    pub fn new(config: ApiConfig, session: Arc<Session>) -> Self {
        let store = TokenStore::new(&config.auth_file_path);
        Self {
            config,
            session,
            store,
            browser: Box::new(SystemBrowser),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_browser(mut self, browser: impl BrowserLauncher + 'static) -> Self {
        self.browser = Box::new(browser);
        self
    }

    /// Uses a preconfigured HTTP client, e.g. one with a request timeout.
    pub fn with_http(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    fn token_url(&self) -> String {
        format!(
            "{}/{}",
            self.config.api_endpoint.trim_end_matches('/'),
            TOKEN_PATH
        )
    }

    /// Reuses the persisted refresh token when possible, otherwise runs the
    /// interactive authorization-code flow.
    pub async fn authenticate(&self) -> Result<(), AuthError> {
        match self.store.load() {
            Ok(Some(tokens)) => {
                info!(
                    "Token file {} found, using refresh token",
                    self.store.path().display()
                );
                self.session.replace(tokens).await;
                match self.refresh().await {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!("Stored refresh token unusable: {}", e),
                }
            }
            Ok(None) => info!("No token file at {}", self.store.path().display()),
            Err(e) => warn!(
                "Ignoring unreadable token file {}: {}",
                self.store.path().display(),
                e
            ),
        }

        info!("Not authenticated, requesting a code from the authorization server");
        let listener = TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .map_err(|source| AuthError::Bind {
                port: self.config.port,
                source,
            })?;
        info!("Listening for the OAuth redirect on port {}", self.config.port);
        self.authorize_interactively(listener).await
    }

    pub fn authorization_url(&self) -> Result<Url, AuthError> {
        let mut url = Url::parse(&format!(
            "{}/authorize",
            self.config.auth_server.trim_end_matches('/')
        ))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("state", &self.config.state)
            .append_pair("redirect_uri", &self.config.redirect_uri());
        Ok(url)
    }

    /// Runs the browser half of the flow against an already bound listener.
    pub async fn authorize_interactively(&self, listener: TcpListener) -> Result<(), AuthError> {
        let url = self.authorization_url()?;
        println!("Follow this link to authorize qvantum2mqtt:");
        println!("{}", url);

        if self.config.open_browser {
            info!("Opening browser for authentication");
            if let Err(e) = self.browser.open(url.as_str()) {
                warn!("Failed to open browser automatically: {}", e);
            }
        }

        let code = receive_callback(
            &listener,
            self.config.callback_timeout(),
            &self.config.state,
        )
        .await?;
        drop(listener);

        self.exchange_code(&code).await
    }

    pub async fn exchange_code(&self, code: &str) -> Result<(), AuthError> {
        info!("Requesting access token, the refresh token renews it from now on");
        let response = self
            .http
            .post(self.token_url())
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("grant_type", "authorization_code"),
                ("code", code),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::Rejected(response.status()));
        }

        let tokens: TokenPair = response.json().await?;
        self.install(tokens).await
    }

    /// Trades the current refresh token for a new pair. The caller decides
    /// what to do when this fails.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        let current = self.session.tokens().await;
        let refresh_token = current
            .refresh_token()
            .ok_or(AuthError::NoRefreshToken)?
            .to_string();

        let response = self
            .http
            .post(self.token_url())
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::Rejected(response.status()));
        }

        let mut tokens: TokenPair = response.json().await?;
        if tokens.refresh_token().is_none() {
            tokens.refresh_token = Some(refresh_token);
        }
        debug!("Access token refreshed");
        self.install(tokens).await
    }

    async fn install(&self, tokens: TokenPair) -> Result<(), AuthError> {
        self.session.replace(tokens.clone()).await;
        self.store.save(&tokens)?;
        Ok(())
    }
}

/// Waits for the redirect on `listener` and extracts the authorization code
/// from its request line. Connections closed without a request, such as
/// browser preconnects, are skipped.
pub async fn receive_callback(
    listener: &TcpListener,
    wait: Duration,
    expected_state: &str,
) -> Result<String, AuthError> {
    timeout(wait, accept_callback(listener, expected_state))
        .await
        .map_err(|_| AuthError::CallbackTimeout(wait))?
}

async fn accept_callback(listener: &TcpListener, expected_state: &str) -> Result<String, AuthError> {
    loop {
        let (mut stream, peer) = listener.accept().await?;
        debug!("OAuth callback connection from {}", peer);

        let request = read_request_line(&mut stream).await?;
        if request.is_empty() {
            debug!("Connection from {} closed without a request", peer);
            continue;
        }

        let result = parse_callback_request(&request, expected_state);
        let body = match &result {
            Ok(_) => "Authorization complete. You can close this window.",
            Err(_) => "Authorization failed. Check the qvantum2mqtt log.",
        };
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        if let Err(e) = stream.write_all(response.as_bytes()).await {
            debug!("Could not answer OAuth callback: {}", e);
        }
        stream.shutdown().await.ok();

        return result;
    }
}

// Reads until the end of the request line, EOF or MAX_CALLBACK_REQUEST bytes.
async fn read_request_line(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut request = Vec::new();
    let mut chunk = [0u8; 1024];
    while request.len() < MAX_CALLBACK_REQUEST && !request.windows(2).any(|w| w == b"\r\n") {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        request.extend_from_slice(&chunk[..read]);
    }
    Ok(request)
}

/// Parses a raw HTTP request for the `code` query parameter.
///
/// A `state` parameter, when present, has to match `expected_state`.
pub fn parse_callback_request(request: &[u8], expected_state: &str) -> Result<String, AuthError> {
    let request = String::from_utf8_lossy(request);
    let target = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .ok_or(AuthError::MissingCode)?;
    let url = Url::parse("http://localhost")?.join(target)?;

    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(error) = error {
        return Err(AuthError::Denied(error));
    }
    if let Some(state) = state {
        if state != expected_state {
            return Err(AuthError::StateMismatch(state));
        }
    }
    code.filter(|c| !c.is_empty()).ok_or(AuthError::MissingCode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server, ServerGuard};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct RecordingBrowser(Arc<Mutex<Vec<String>>>);

    impl RecordingBrowser {
        fn opened(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl BrowserLauncher for RecordingBrowser {
        fn open(&self, url: &str) -> io::Result<()> {
            self.0.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    fn create_test_config(server: &ServerGuard, dir: &TempDir) -> ApiConfig {
        ApiConfig {
            api_endpoint: server.url(),
            auth_server: "https://account.example.com".to_string(),
            auth_file_path: dir.path().join("tokens.json").display().to_string(),
            callback_timeout: 5,
            ..ApiConfig::default()
        }
    }

    fn token_body(access: &str, refresh: &str) -> String {
        format!(
            r#"{{"access_token": "{}", "refresh_token": "{}", "expires_in": 3600, "token_type": "Bearer"}}"#,
            access, refresh
        )
    }

    fn write_token_file(dir: &TempDir, refresh: &str) {
        TokenStore::new(dir.path().join("tokens.json"))
            .save(&TokenPair {
                access_token: Some("stale_access".to_string()),
                refresh_token: Some(refresh.to_string()),
                ..TokenPair::default()
            })
            .unwrap();
    }

    async fn send_callback(port: u16, request: &'static str) {
        for _ in 0..100 {
            if let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)).await {
                stream.write_all(request.as_bytes()).await.unwrap();
                let mut response = Vec::new();
                stream.read_to_end(&mut response).await.ok();
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("callback listener never came up on port {}", port);
    }

    #[tokio::test]
    async fn test_authenticate_with_persisted_token_skips_browser() {
        let mut server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        write_token_file(&dir, "stored_refresh");

        let mock = server
            .mock("POST", "/api/auth/v1/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "stored_refresh".into()),
                Matcher::UrlEncoded("client_id".into(), "qvantum2mqtt".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("fresh_access", "fresh_refresh"))
            .expect(1)
            .create_async()
            .await;

        let browser = RecordingBrowser::default();
        let session = Session::new();
        let auth = Authenticator::new(create_test_config(&server, &dir), session.clone())
            .with_browser(browser.clone());

        auth.authenticate().await.unwrap();

        mock.assert_async().await;
        assert!(browser.opened().is_empty());
        assert_eq!(session.access_token().await.unwrap(), "fresh_access");
        let persisted = TokenStore::new(dir.path().join("tokens.json"))
            .load()
            .unwrap()
            .unwrap();
        assert_eq!(persisted.refresh_token(), Some("fresh_refresh"));
    }

    #[tokio::test]
    async fn test_interactive_flow_exchanges_code_once() {
        let mut server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();

        let mock = server
            .mock("POST", "/api/auth/v1/oauth2/token")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "ABC".into()),
                Matcher::UrlEncoded("client_id".into(), "qvantum2mqtt".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("new_access", "new_refresh"))
            .expect(1)
            .create_async()
            .await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = tokio::spawn(send_callback(
            port,
            "GET /?state=abc123&code=ABC HTTP/1.1\r\nHost: localhost\r\n\r\n",
        ));

        let browser = RecordingBrowser::default();
        let session = Session::new();
        let auth = Authenticator::new(create_test_config(&server, &dir), session.clone())
            .with_browser(browser.clone());

        auth.authorize_interactively(listener).await.unwrap();
        client.await.unwrap();

        mock.assert_async().await;
        assert_eq!(session.access_token().await.unwrap(), "new_access");
        let opened = browser.opened();
        assert_eq!(opened.len(), 1);
        assert!(opened[0].contains("client_id=qvantum2mqtt"));
        assert!(opened[0].contains("state=abc123"));
    }

    #[tokio::test]
    async fn test_rejected_refresh_falls_back_to_interactive_flow() {
        let mut server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        write_token_file(&dir, "revoked_refresh");

        let refresh = server
            .mock("POST", "/api/auth/v1/oauth2/token")
            .match_body(Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let exchange = server
            .mock("POST", "/api/auth/v1/oauth2/token")
            .match_body(Matcher::UrlEncoded("code".into(), "XYZ".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("interactive_access", "interactive_refresh"))
            .expect(1)
            .create_async()
            .await;

        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = ApiConfig {
            port,
            open_browser: false,
            ..create_test_config(&server, &dir)
        };
        let browser = RecordingBrowser::default();
        let session = Session::new();
        let auth = Authenticator::new(config, session.clone()).with_browser(browser.clone());

        let client = tokio::spawn(send_callback(
            port,
            "GET /?code=XYZ HTTP/1.1\r\nHost: localhost\r\n\r\n",
        ));
        auth.authenticate().await.unwrap();
        client.await.unwrap();

        refresh.assert_async().await;
        exchange.assert_async().await;
        assert!(browser.opened().is_empty());
        assert_eq!(session.access_token().await.unwrap(), "interactive_access");
    }

    #[tokio::test]
    async fn test_authenticate_fails_when_port_is_taken() {
        let server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let config = ApiConfig {
            port: occupied.local_addr().unwrap().port(),
            ..create_test_config(&server, &dir)
        };

        let auth = Authenticator::new(config, Session::new()).with_browser(RecordingBrowser::default());
        let result = auth.authenticate().await;

        assert!(matches!(result, Err(AuthError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_rejected_code_exchange_is_an_error() {
        let mut server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let _mock = server
            .mock("POST", "/api/auth/v1/oauth2/token")
            .with_status(400)
            .create_async()
            .await;

        let session = Session::new();
        let auth = Authenticator::new(create_test_config(&server, &dir), session.clone());
        let result = auth.exchange_code("bad").await;

        assert!(matches!(result, Err(AuthError::Rejected(status)) if status.as_u16() == 400));
        assert!(session.access_token().await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token() {
        let server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let auth = Authenticator::new(create_test_config(&server, &dir), Session::new());

        let result = auth.refresh().await;
        assert!(matches!(result, Err(AuthError::NoRefreshToken)));
    }

    #[tokio::test]
    async fn test_rejected_refresh_keeps_session() {
        let mut server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let _mock = server
            .mock("POST", "/api/auth/v1/oauth2/token")
            .with_status(401)
            .create_async()
            .await;

        let session = Session::with_tokens(TokenPair {
            access_token: Some("current".to_string()),
            refresh_token: Some("refresh".to_string()),
            ..TokenPair::default()
        });
        let auth = Authenticator::new(create_test_config(&server, &dir), session.clone());

        assert!(matches!(auth.refresh().await, Err(AuthError::Rejected(_))));
        assert_eq!(session.access_token().await.unwrap(), "current");
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_when_omitted() {
        let mut server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let _mock = server
            .mock("POST", "/api/auth/v1/oauth2/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "rotated", "expires_in": 3600}"#)
            .create_async()
            .await;

        let session = Session::with_tokens(TokenPair {
            access_token: Some("current".to_string()),
            refresh_token: Some("long_lived".to_string()),
            ..TokenPair::default()
        });
        let auth = Authenticator::new(create_test_config(&server, &dir), session.clone());
        auth.refresh().await.unwrap();

        let tokens = session.tokens().await;
        assert_eq!(tokens.access_token(), Some("rotated"));
        assert_eq!(tokens.refresh_token(), Some("long_lived"));
    }

    #[tokio::test]
    async fn test_receive_callback_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let result = receive_callback(&listener, Duration::from_millis(50), "abc123").await;
        assert!(matches!(result, Err(AuthError::CallbackTimeout(_))));
    }

    #[tokio::test]
    async fn test_receive_callback_skips_preconnect_and_split_request_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = tokio::spawn(async move {
            drop(TcpStream::connect(("127.0.0.1", port)).await.unwrap());

            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stream.write_all(b"GET /?code=AB").await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            stream
                .write_all(b"C&state=abc123 HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
                .unwrap();
            let mut response = Vec::new();
            stream.read_to_end(&mut response).await.ok();
            response
        });

        let code = receive_callback(&listener, Duration::from_secs(5), "abc123")
            .await
            .unwrap();
        assert_eq!(code, "ABC");

        let response = String::from_utf8(client.await.unwrap()).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("Authorization complete"));
    }

    #[test]
    fn test_authorization_url() {
        let config = ApiConfig {
            auth_server: "https://account.example.com/".to_string(),
            ..ApiConfig::default()
        };
        let auth = Authenticator::new(config, Session::new());
        let url = auth.authorization_url().unwrap();

        assert_eq!(url.path(), "/authorize");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("response_type".to_string(), "code".to_string())));
        assert!(pairs.contains(&("client_id".to_string(), "qvantum2mqtt".to_string())));
        assert!(pairs.contains(&("state".to_string(), "abc123".to_string())));
        assert!(pairs.contains(&(
            "redirect_uri".to_string(),
            "http://localhost:5173".to_string()
        )));
    }

    #[test]
    fn test_parse_callback_extracts_code() {
        let request = b"GET /?code=ABC HTTP/1.1\r\nHost: localhost:5173\r\n\r\n";
        assert_eq!(parse_callback_request(request, "abc123").unwrap(), "ABC");
    }

    #[test]
    fn test_parse_callback_decodes_code() {
        let request = b"GET /callback?state=abc123&code=A%2FB%3D HTTP/1.1\r\n\r\n";
        assert_eq!(parse_callback_request(request, "abc123").unwrap(), "A/B=");
    }

    #[test]
    fn test_parse_callback_without_code() {
        let request = b"GET /favicon.ico HTTP/1.1\r\n\r\n";
        assert!(matches!(
            parse_callback_request(request, "abc123"),
            Err(AuthError::MissingCode)
        ));
        assert!(matches!(
            parse_callback_request(b"", "abc123"),
            Err(AuthError::MissingCode)
        ));
    }

    #[test]
    fn test_parse_callback_denied() {
        let request = b"GET /?error=access_denied&state=abc123 HTTP/1.1\r\n\r\n";
        assert!(matches!(
            parse_callback_request(request, "abc123"),
            Err(AuthError::Denied(e)) if e == "access_denied"
        ));
    }

    #[test]
    fn test_parse_callback_state_mismatch() {
        let request = b"GET /?code=ABC&state=forged HTTP/1.1\r\n\r\n";
        assert!(matches!(
            parse_callback_request(request, "abc123"),
            Err(AuthError::StateMismatch(s)) if s == "forged"
        ));
    }
}
