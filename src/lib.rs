//! Thin configuration and lifecycle wrapper around chromedriver and the
//! WebDriver protocol, for headless Chrome crawling.
//!
//! Two pieces:
//! - [`ChromeDriver`]: process-wide singleton owning the local chromedriver
//!   process (start once, stop after the last session is closed).
//! - [`ChromeSession`]: per-worker fluent builder over Chrome command-line
//!   flags that opens remote sessions against the managed driver.
//!
//! The wire protocol itself belongs to [`fantoccini`]; this crate only
//! decides what capabilities to send and when the driver process runs.

mod driver;
mod error;
mod session;

pub use driver::{ChromeDriver, DRIVER_ENDPOINT, DRIVER_PORT, DriverLifecycle, find_chromedriver};
pub use error::{CrawlerError, Result};
pub use session::ChromeSession;

// Callers drive the session through fantoccini's client API.
pub use fantoccini::Client;
