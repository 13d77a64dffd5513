//! Fire-and-forget tracking beacons

use reqwest::Client;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Macro replaced with the VAST error code in error tracking URLs
pub const ERROR_CODE_MACRO: &str = "[ERRORCODE]";

/// Delivers tracking URLs; never blocks and never reports failure
pub trait BeaconFirer: Send + Sync {
    fn fire(&self, url: &str);

    fn fire_all(&self, urls: &[String]) {
        for url in urls {
            self.fire(url);
        }
    }
}

/// Substitute the error code macro into every URL
pub fn with_error_code(urls: &[String], code: u16) -> Vec<String> {
    urls.iter()
        .map(|u| u.replace(ERROR_CODE_MACRO, &code.to_string()))
        .collect()
}

/// Beacons over HTTP GET
///
/// Requests are spawned on the current tokio runtime. Outside a runtime a
/// detached thread issues a blocking request instead, sharing one lazily
/// built blocking client.
pub struct HttpBeaconFirer {
    client: Client,
    blocking: Arc<OnceLock<reqwest::Result<reqwest::blocking::Client>>>,
    timeout: Duration,
}

impl HttpBeaconFirer {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            blocking: Arc::new(OnceLock::new()),
            timeout: Duration::from_secs(5),
        }
    }
}

impl Default for HttpBeaconFirer {
    fn default() -> Self {
        Self::new()
    }
}

impl BeaconFirer for HttpBeaconFirer {
    fn fire(&self, url: &str) {
        if url.is_empty() {
            return;
        }
        let url = url.to_string();
        let timeout = self.timeout;

        match Handle::try_current() {
            Ok(handle) => {
                let client = self.client.clone();
                handle.spawn(async move {
                    match client.get(&url).timeout(timeout).send().await {
                        Ok(resp) => debug!(url = %url, status = %resp.status(), "Beacon sent"),
                        Err(e) => warn!(url = %url, error = %e, "Beacon failed"),
                    }
                });
            }
            Err(_) => {
                let blocking = self.blocking.clone();
                std::thread::spawn(move || {
                    let Some(client) = blocking_client(&blocking, timeout) else {
                        return;
                    };
                    match client.get(&url).send() {
                        Ok(resp) => debug!(url = %url, status = %resp.status(), "Beacon sent"),
                        Err(e) => warn!(url = %url, error = %e, "Beacon failed"),
                    }
                });
            }
        }
    }
}

fn blocking_client(
    cell: &OnceLock<reqwest::Result<reqwest::blocking::Client>>,
    timeout: Duration,
) -> Option<&reqwest::blocking::Client> {
    let client = cell.get_or_init(|| reqwest::blocking::Client::builder().timeout(timeout).build());
    match client {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %e, "Blocking beacon client unavailable");
            None
        }
    }
}
