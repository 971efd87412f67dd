//! Minimal W3C WebDriver client over plain HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Value, json};
use tracing::debug;

use super::config::{Browser, VerifierConfig};
use super::error::VerifyError;
use super::verify::{RenderEngine, RenderSession};

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "..."
}

pub fn webdriver_capabilities(browser: Browser, headless: bool) -> Value {
    match browser {
        Browser::Firefox => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("-headless".to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "firefox",
                        "acceptInsecureCerts": true,
                        "moz:firefoxOptions": {
                            "args": args,
                            "prefs": {
                                "browser.cache.disk.enable": false,
                                "browser.cache.memory.enable": false,
                                "network.http.use-cache": false
                            }
                        }
                    }
                }
            })
        }
        Browser::Edge => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("--headless=new".to_string());
            }
            args.push("--disable-cache".to_string());
            args.push("--disk-cache-size=0".to_string());
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "MicrosoftEdge",
                        "acceptInsecureCerts": true,
                        "ms:edgeOptions": { "args": args }
                    }
                }
            })
        }
        Browser::Chrome => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("--headless=new".to_string());
            }
            args.push("--window-size=1400,1200".to_string());
            args.push("--disable-gpu".to_string());
            args.push("--disable-dev-shm-usage".to_string());
            args.push("--no-first-run".to_string());
            args.push("--no-default-browser-check".to_string());
            args.push("--disable-cache".to_string());
            args.push("--disk-cache-size=0".to_string());
            if !cfg!(target_os = "macos") {
                args.push("--no-sandbox".to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "chrome",
                        "acceptInsecureCerts": true,
                        "goog:chromeOptions": { "args": args }
                    }
                }
            })
        }
    }
}

#[derive(Clone)]
pub struct WebDriverClient {
    client: reqwest::Client,
    endpoint: String,
}

impl WebDriverClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, VerifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VerifyError::WebDriver(format!("client build failed: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Send one command and unwrap the `value` member of the reply. A
    /// WebDriver `javascript error` becomes `ScriptExecution`; anything
    /// else is a `WebDriver` error.
    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        what: &str,
    ) -> Result<Value, VerifyError> {
        let url = format!("{}{path}", self.endpoint);
        let mut req = self.client.request(method, &url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let res = req
            .send()
            .await
            .map_err(|e| VerifyError::WebDriver(format!("{what} request failed: {e}")))?;
        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| VerifyError::WebDriver(format!("{what} response read failed: {e}")))?;

        let value: Value = serde_json::from_str(&text).unwrap_or_default();
        if let Some(err) = value.pointer("/value/error").and_then(|v| v.as_str()) {
            let message = value
                .pointer("/value/message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown webdriver error");
            if err == "javascript error" {
                return Err(VerifyError::ScriptExecution(message.to_string()));
            }
            return Err(VerifyError::WebDriver(format!("{what}: {err}: {message}")));
        }
        if !status.is_success() {
            return Err(VerifyError::WebDriver(format!(
                "{what} HTTP {}: {}",
                status.as_u16(),
                truncate_for_log(&text, 240)
            )));
        }
        Ok(value.get("value").cloned().unwrap_or(Value::Null))
    }

    pub async fn create_session(&self, browser: Browser, headless: bool) -> Result<String, VerifyError> {
        let caps = webdriver_capabilities(browser, headless);
        let value = self
            .command(Method::POST, "/session", Some(caps), "session create")
            .await?;
        value
            .pointer("/sessionId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| VerifyError::WebDriver("session id missing in response".to_string()))
    }

    pub async fn navigate(&self, session_id: &str, url: &str) -> Result<(), VerifyError> {
        self.command(
            Method::POST,
            &format!("/session/{session_id}/url"),
            Some(json!({ "url": url })),
            "navigate",
        )
        .await?;
        Ok(())
    }

    pub async fn execute(
        &self,
        session_id: &str,
        script: &str,
        args: Vec<Value>,
    ) -> Result<Value, VerifyError> {
        self.command(
            Method::POST,
            &format!("/session/{session_id}/execute/sync"),
            Some(json!({ "script": script, "args": args })),
            "execute script",
        )
        .await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), VerifyError> {
        self.command(
            Method::DELETE,
            &format!("/session/{session_id}"),
            None,
            "delete session",
        )
        .await?;
        Ok(())
    }
}

/// Render engine backed by a running WebDriver server (chromedriver,
/// geckodriver, msedgedriver or a Selenium grid).
pub struct WebDriverEngine {
    client: WebDriverClient,
    browser: Browser,
    headless: bool,
}

impl WebDriverEngine {
    pub fn new(cfg: &VerifierConfig) -> Result<Self, VerifyError> {
        Ok(Self {
            client: WebDriverClient::new(&cfg.webdriver_url, cfg.timeout())?,
            browser: cfg.browser,
            headless: cfg.headless,
        })
    }
}

struct WebDriverSession {
    client: WebDriverClient,
    session_id: String,
}

#[async_trait]
impl RenderEngine for WebDriverEngine {
    async fn open(&self) -> Result<Box<dyn RenderSession>, VerifyError> {
        let session_id = self.client.create_session(self.browser, self.headless).await?;
        debug!(session_id = %session_id, browser = ?self.browser, "webdriver session opened");
        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            session_id,
        }))
    }
}

#[async_trait]
impl RenderSession for WebDriverSession {
    async fn navigate(&mut self, url: &str) -> Result<(), VerifyError> {
        self.client.navigate(&self.session_id, url).await
    }

    async fn execute(&mut self, script: &str) -> Result<Value, VerifyError> {
        self.client.execute(&self.session_id, script, Vec::new()).await
    }

    async fn close(&mut self) -> Result<(), VerifyError> {
        self.client.delete_session(&self.session_id).await?;
        debug!(session_id = %self.session_id, "webdriver session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn capabilities_follow_browser_and_headless_flag() {
        let chrome = webdriver_capabilities(Browser::Chrome, true);
        assert_eq!(chrome.pointer("/capabilities/alwaysMatch/browserName"), Some(&json!("chrome")));
        let args = chrome
            .pointer("/capabilities/alwaysMatch/goog:chromeOptions/args")
            .and_then(|v| v.as_array())
            .unwrap();
        assert!(args.contains(&json!("--headless=new")));

        let firefox = webdriver_capabilities(Browser::Firefox, false);
        let args = firefox
            .pointer("/capabilities/alwaysMatch/moz:firefoxOptions/args")
            .and_then(|v| v.as_array())
            .unwrap();
        assert!(args.is_empty());

        let edge = webdriver_capabilities(Browser::Edge, true);
        assert_eq!(
            edge.pointer("/capabilities/alwaysMatch/browserName"),
            Some(&json!("MicrosoftEdge"))
        );
    }

    /// Scripted WebDriver endpoint: answers each request from a fixed list
    /// and records `METHOD path` lines.
    fn fake_driver(replies: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>, std::thread::JoinHandle<()>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind fake driver");
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .expect("ip listener");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let handle = std::thread::spawn(move || {
            for (status, body) in replies {
                let Ok(request) = server.recv() else {
                    break;
                };
                log.lock()
                    .unwrap()
                    .push(format!("{} {}", request.method(), request.url()));
                let _ = request.respond(tiny_http::Response::from_string(body).with_status_code(status));
            }
        });
        (format!("http://127.0.0.1:{port}"), seen, handle)
    }

    #[tokio::test]
    async fn session_lifecycle_speaks_w3c_paths() {
        let (endpoint, seen, handle) = fake_driver(vec![
            (200, r#"{"value":{"sessionId":"abc","capabilities":{}}}"#),
            (200, r#"{"value":null}"#),
            (200, r#"{"value":{"title":"Home"}}"#),
            (200, r#"{"value":null}"#),
        ]);
        let client = WebDriverClient::new(&endpoint, Duration::from_secs(5)).unwrap();

        let session = client.create_session(Browser::Chrome, true).await.unwrap();
        assert_eq!(session, "abc");
        client.navigate(&session, "https://example.com/").await.unwrap();
        let value = client.execute(&session, "return 1;", Vec::new()).await.unwrap();
        assert_eq!(value, json!({"title": "Home"}));
        client.delete_session(&session).await.unwrap();

        handle.join().unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "POST /session".to_string(),
                "POST /session/abc/url".to_string(),
                "POST /session/abc/execute/sync".to_string(),
                "DELETE /session/abc".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn javascript_errors_map_to_script_execution() {
        let (endpoint, _seen, handle) = fake_driver(vec![(
            500,
            r#"{"value":{"error":"javascript error","message":"boom","stacktrace":""}}"#,
        )]);
        let client = WebDriverClient::new(&endpoint, Duration::from_secs(5)).unwrap();

        let err = client.execute("abc", "throw 1;", Vec::new()).await.unwrap_err();
        assert!(matches!(err, VerifyError::ScriptExecution(ref m) if m == "boom"), "{err}");
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn other_driver_errors_are_webdriver_errors() {
        let (endpoint, _seen, handle) = fake_driver(vec![(
            500,
            r#"{"value":{"error":"session not created","message":"no chrome binary"}}"#,
        )]);
        let client = WebDriverClient::new(&endpoint, Duration::from_secs(5)).unwrap();

        let err = client.create_session(Browser::Chrome, true).await.unwrap_err();
        assert!(matches!(err, VerifyError::WebDriver(ref m) if m.contains("no chrome binary")));
        handle.join().unwrap();
    }
}
