//! Chrome session configuration and remote session creation.
//!
//! [`ChromeSession`] is a fluent builder over the Chrome command-line flags
//! that matter for crawling (headless, sandbox, window size, user agent),
//! plus the lifecycle glue: it starts/stops the shared chromedriver process
//! and opens WebDriver sessions against it carrying the accumulated
//! arguments.
//!
//! Each logical worker owns its own `ChromeSession`; instances share nothing
//! but the process-wide [`ChromeDriver`] singleton.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fantoccini::{Client, ClientBuilder};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::driver::{ChromeDriver, DRIVER_ENDPOINT, DriverLifecycle};
use crate::error::{CrawlerError, Result};

/// Default connect and request timeout, in milliseconds.
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Everything needed to open one remote session: endpoint, capabilities
/// payload, and the two timeouts. Assembled by
/// [`ChromeSession::session_request`] and consumed by [`create_session`].
#[derive(Debug, Clone)]
pub(crate) struct SessionRequest {
    pub endpoint: String,
    pub capabilities: Map<String, Value>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

/// An open remote session as tracked for cleanup.
///
/// `stop()` closes these best-effort; tests substitute failing fakes to
/// exercise that contract.
#[async_trait]
pub(crate) trait RemoteSession: Send {
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Fantoccini-backed session handle with its request timeout attached.
struct TrackedSession {
    client: Client,
    request_timeout: Duration,
}

#[async_trait]
impl RemoteSession for TrackedSession {
    async fn close(self: Box<Self>) -> Result<()> {
        let TrackedSession {
            client,
            request_timeout,
        } = *self;
        match tokio::time::timeout(request_timeout, client.close()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CrawlerError::Session(e)),
            Err(_) => Err(CrawlerError::RequestTimeout {
                timeout: request_timeout,
            }),
        }
    }
}

/// Fluent configurator for one crawler's browser sessions.
///
/// Holds an insertion-ordered, deduplicated list of Chrome command-line
/// arguments and two timeouts, and turns them into remote WebDriver
/// sessions against the managed chromedriver:
///
/// ```no_run
/// use chrome_crawler::ChromeSession;
///
/// # async fn run() -> chrome_crawler::Result<()> {
/// let mut session = ChromeSession::new("price-watcher")
///     .headless()
///     .disable_gpu()
///     .window_size(1920, 1080)
///     .start()
///     .await?;
///
/// let client = session.build_session().await?;
/// client.goto("https://example.com").await?;
///
/// session.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct ChromeSession {
    caller_label: String,
    arguments: Vec<String>,
    connect_timeout_ms: u64,
    request_timeout_ms: u64,
    driver: Arc<dyn DriverLifecycle>,
    sessions: Vec<Box<dyn RemoteSession>>,
}

impl std::fmt::Debug for ChromeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChromeSession")
            .field("caller_label", &self.caller_label)
            .field("arguments", &self.arguments)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl ChromeSession {
    /// Create a configurator with empty arguments and default timeouts,
    /// backed by the global [`ChromeDriver`] singleton.
    pub fn new(caller_label: impl Into<String>) -> Self {
        Self::with_driver(caller_label, ChromeDriver::global())
    }

    /// Like [`ChromeSession::new`], with an explicit driver lifecycle.
    pub fn with_driver(
        caller_label: impl Into<String>,
        driver: Arc<dyn DriverLifecycle>,
    ) -> Self {
        Self {
            caller_label: caller_label.into(),
            arguments: Vec::new(),
            connect_timeout_ms: DEFAULT_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_TIMEOUT_MS,
            driver,
            sessions: Vec::new(),
        }
    }

    /// Start the shared chromedriver process.
    ///
    /// # Errors
    /// Driver-process failures propagate untranslated; see
    /// [`ChromeDriver::start`].
    pub async fn start(self) -> Result<Self> {
        self.driver.start().await?;
        Ok(self)
    }

    /// Stop the crawler: close every session this instance opened, then
    /// stop the chromedriver process.
    ///
    /// Teardown is best-effort and non-propagating. Session-close failures
    /// are logged and swallowed, the process stop runs regardless, and no
    /// error ever escapes this method.
    pub async fn stop(mut self) -> Self {
        for session in self.sessions.drain(..) {
            if let Err(e) = session.close().await {
                warn!(error = %e, "failed to close remote session during stop");
            }
        }
        if let Err(e) = self.driver.stop().await {
            warn!(error = %e, "failed to stop chromedriver during stop");
        }
        self
    }

    /// Set the maximum time to establish the remote connection, in
    /// milliseconds. No range validation.
    pub fn set_connect_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    /// Set the maximum time per request to the remote driver, in
    /// milliseconds. No range validation.
    pub fn set_request_timeout(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    /// Run the browser in headless mode.
    pub fn headless(self) -> Self {
        self.add_argument("--headless")
    }

    /// Disable GPU usage.
    pub fn disable_gpu(self) -> Self {
        self.add_argument("--disable-gpu")
    }

    /// Disable the Chrome sandbox.
    pub fn no_sandbox(self) -> Self {
        self.add_argument("--no-sandbox")
    }

    /// Disable the zygote process Chrome uses to fork children. Implies
    /// [`ChromeSession::no_sandbox`].
    pub fn no_zygote(self) -> Self {
        self.no_sandbox().add_argument("--no-zygote")
    }

    /// Ignore SSL certificate errors.
    pub fn ignore_ssl_errors(self) -> Self {
        self.add_argument("--ignore-certificate-errors")
    }

    /// Set the initial browser window size, in pixels.
    pub fn window_size(self, width: u32, height: u32) -> Self {
        self.add_argument(format!("--window-size={width},{height}"))
    }

    /// Set the user agent string. Passed through verbatim, no escaping.
    pub fn user_agent(self, user_agent: impl AsRef<str>) -> Self {
        self.add_argument(format!("--user-agent={}", user_agent.as_ref()))
    }

    /// Add a raw browser argument.
    ///
    /// Arguments are kept in first-insertion order and passed verbatim to
    /// chromedriver. Adding an argument that is already present is a silent
    /// no-op; the builder chain is preserved either way.
    pub fn add_argument(mut self, argument: impl Into<String>) -> Self {
        let argument = argument.into();
        if self.arguments.iter().any(|existing| *existing == argument) {
            debug!(argument = %argument, "duplicate browser argument ignored");
            return self;
        }
        self.arguments.push(argument);
        self
    }

    /// The accumulated browser arguments, in insertion order.
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Current connect timeout in milliseconds.
    pub fn connect_timeout_ms(&self) -> u64 {
        self.connect_timeout_ms
    }

    /// Current request timeout in milliseconds.
    pub fn request_timeout_ms(&self) -> u64 {
        self.request_timeout_ms
    }

    /// A filesystem/log-safe identifier for this configurator: the fully
    /// qualified type name with `::` replaced by `_`, joined to the caller
    /// label with another `_`.
    pub fn session_id(&self) -> String {
        let type_name = std::any::type_name::<Self>().replace("::", "_");
        format!("{type_name}_{}", self.caller_label)
    }

    /// Open a remote WebDriver session carrying the accumulated arguments.
    ///
    /// The returned [`Client`] is also tracked by this instance so that
    /// [`ChromeSession::stop`] can close it.
    ///
    /// # Errors
    /// Session creation is the one failure path that is never suppressed:
    /// connection refusals, capability rejections, and timeouts all
    /// propagate to the caller.
    pub async fn build_session(&mut self) -> Result<Client> {
        let request = self.session_request();
        info!(
            session_id = %self.session_id(),
            endpoint = %request.endpoint,
            arguments = ?self.arguments,
            "creating remote session"
        );
        let client = create_session(&request).await?;
        self.sessions.push(Box::new(TrackedSession {
            client: client.clone(),
            request_timeout: request.request_timeout,
        }));
        Ok(client)
    }

    /// Open a session, hand it to `callback`, and return the callback's
    /// result. Sugar over [`ChromeSession::build_session`] for one-shot
    /// crawls.
    pub async fn browse<F, Fut, T>(&mut self, callback: F) -> Result<T>
    where
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let client = self.build_session().await?;
        callback(client).await
    }

    /// Assemble the session request: fixed endpoint, capabilities with the
    /// arguments under `goog:chromeOptions`, and both timeouts.
    pub(crate) fn session_request(&self) -> SessionRequest {
        SessionRequest {
            endpoint: DRIVER_ENDPOINT.to_string(),
            capabilities: self.capabilities(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    /// Capabilities payload accepted by chromedriver: the argument list
    /// verbatim under the Chrome-specific capability key.
    fn capabilities(&self) -> Map<String, Value> {
        let mut caps = Map::new();
        caps.insert("browserName".to_string(), Value::from("chrome"));
        caps.insert(
            "goog:chromeOptions".to_string(),
            json!({ "args": self.arguments }),
        );
        caps
    }
}

/// Negotiate a new remote session per `request`.
///
/// The connect phase is bounded by the request's connect timeout; the
/// request timeout travels with the tracked handle and bounds later
/// commands against the session.
pub(crate) async fn create_session(request: &SessionRequest) -> Result<Client> {
    let mut builder = ClientBuilder::rustls()
        .map_err(|e| CrawlerError::Connector(e.to_string()))?;
    builder.capabilities(request.capabilities.clone());

    match tokio::time::timeout(request.connect_timeout, builder.connect(&request.endpoint)).await
    {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(e)) => Err(CrawlerError::NewSession(e)),
        Err(_) => Err(CrawlerError::ConnectTimeout {
            endpoint: request.endpoint.clone(),
            timeout: request.connect_timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingDriver {
        started: AtomicUsize,
        stopped: AtomicUsize,
        fail_start: bool,
    }

    #[async_trait]
    impl DriverLifecycle for RecordingDriver {
        async fn start(&self) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(CrawlerError::DriverNotFound);
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingSession;

    #[async_trait]
    impl RemoteSession for FailingSession {
        async fn close(self: Box<Self>) -> Result<()> {
            Err(CrawlerError::RequestTimeout {
                timeout: Duration::from_millis(1),
            })
        }
    }

    #[test]
    fn arguments_are_deduplicated_in_insertion_order() {
        let session = ChromeSession::new("test")
            .add_argument("--headless")
            .add_argument("--disable-gpu")
            .add_argument("--headless")
            .add_argument("--mute-audio")
            .add_argument("--disable-gpu");
        assert_eq!(
            session.arguments(),
            ["--headless", "--disable-gpu", "--mute-audio"]
        );
    }

    #[test]
    fn no_zygote_composes_with_an_earlier_no_sandbox() {
        let session = ChromeSession::new("test").no_sandbox().no_zygote();
        assert_eq!(session.arguments(), ["--no-sandbox", "--no-zygote"]);
    }

    #[test]
    fn flag_helpers_emit_the_expected_literals() {
        let session = ChromeSession::new("test")
            .headless()
            .disable_gpu()
            .ignore_ssl_errors()
            .window_size(800, 600)
            .user_agent("X");
        assert_eq!(
            session.arguments(),
            [
                "--headless",
                "--disable-gpu",
                "--ignore-certificate-errors",
                "--window-size=800,600",
                "--user-agent=X",
            ]
        );
    }

    #[test]
    fn timeouts_default_to_thirty_seconds() {
        let session = ChromeSession::new("test");
        assert_eq!(session.connect_timeout_ms(), 30_000);
        assert_eq!(session.request_timeout_ms(), 30_000);
    }

    #[test]
    fn configured_timeouts_flow_into_the_session_request() {
        let session = ChromeSession::new("test")
            .set_connect_timeout(5_000)
            .set_request_timeout(12_000);
        let request = session.session_request();
        assert_eq!(request.endpoint, DRIVER_ENDPOINT);
        assert_eq!(request.connect_timeout, Duration::from_millis(5_000));
        assert_eq!(request.request_timeout, Duration::from_millis(12_000));
    }

    #[test]
    fn capabilities_carry_the_arguments_verbatim() {
        let session = ChromeSession::new("test").headless().window_size(800, 600);
        let caps = session.session_request().capabilities;
        assert_eq!(caps["browserName"], "chrome");
        assert_eq!(
            caps["goog:chromeOptions"]["args"],
            json!(["--headless", "--window-size=800,600"])
        );
    }

    #[test]
    fn session_id_is_the_underscored_type_path_plus_label() {
        let id = ChromeSession::new("worker-1").session_id();
        assert!(id.starts_with("chrome_crawler_"));
        assert!(id.ends_with("ChromeSession_worker-1"));
        assert!(!id.contains("::"));
    }

    #[tokio::test]
    async fn start_delegates_to_the_driver_lifecycle() {
        let driver = Arc::new(RecordingDriver::default());
        let _session = ChromeSession::with_driver("test", driver.clone())
            .start()
            .await
            .unwrap();
        assert_eq!(driver.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_propagates_driver_failures() {
        let driver = Arc::new(RecordingDriver {
            fail_start: true,
            ..Default::default()
        });
        let err = ChromeSession::with_driver("test", driver)
            .start()
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlerError::DriverNotFound));
    }

    #[tokio::test]
    async fn stop_always_stops_the_driver_even_when_closing_fails() {
        let driver = Arc::new(RecordingDriver::default());
        let mut session = ChromeSession::with_driver("test", driver.clone());
        session.sessions.push(Box::new(FailingSession));
        session.sessions.push(Box::new(FailingSession));

        let session = session.stop().await;

        assert_eq!(driver.stopped.load(Ordering::SeqCst), 1);
        assert!(session.sessions.is_empty());
    }

    #[tokio::test]
    async fn session_creation_failures_propagate() {
        // Nothing listens on port 1; the connect attempt must surface an
        // error rather than being swallowed.
        let request = SessionRequest {
            endpoint: "http://127.0.0.1:1".to_string(),
            capabilities: Map::new(),
            connect_timeout: Duration::from_millis(2_000),
            request_timeout: Duration::from_millis(2_000),
        };
        let err = create_session(&request).await.unwrap_err();
        assert!(matches!(
            err,
            CrawlerError::NewSession(_) | CrawlerError::ConnectTimeout { .. }
        ));
    }
}
