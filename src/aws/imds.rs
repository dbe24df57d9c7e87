use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use tokio::runtime::Handle;

use crate::backoff::{Clock, Deadline};
use crate::config::{Config, RetryPolicy};
use crate::constants::{IMDS_HEADER_TOKEN, IMDS_HEADER_TOKEN_TTL};
use crate::error::NetcfgError;
use crate::interface::MacAddr;

// Refresh a token this long before IMDS would expire it.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(5);

/// Read access to instance metadata. Paths are relative to `meta-data/`.
pub trait MetadataSource {
    /// Get `path`, trying up to `max_attempts` times. A `max_attempts` of 1
    /// means no retry.
    fn fetch(&self, path: &str, max_attempts: u32) -> Result<String>;

    fn fetch_for_interface(&self, mac: &MacAddr, key: &str, max_attempts: u32) -> Result<String> {
        self.fetch(
            &format!("network/interfaces/macs/{}/{}", mac, key),
            max_attempts,
        )
    }

    fn fetch_list(&self, mac: &MacAddr, key: &str, max_attempts: u32) -> Result<Vec<String>> {
        let body = self.fetch_for_interface(mac, key, max_attempts)?;
        Ok(split_lines(&body))
    }
}

pub fn split_lines(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[derive(Clone, Debug)]
struct Session {
    endpoint: String,
    token: String,
    acquired: Instant,
}

pub struct MetadataClient {
    rt: Handle,
    client: ImdsClientAsync,
    clock: Arc<dyn Clock>,
    token_policy: RetryPolicy,
    token_ttl: Duration,
    session: Mutex<Option<Session>>,
}

impl MetadataClient {
    pub fn new(rt: Handle, config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            rt,
            client: ImdsClientAsync::new(config)?,
            clock,
            token_policy: config.token,
            token_ttl: config.token_ttl(),
            session: Mutex::new(None),
        })
    }

    // The first endpoint that hands out a token is pinned.
    pub fn acquire_token(&self, initial_setup: bool) -> bool {
        let mut deadline = Deadline::new(self.clock.as_ref(), &self.token_policy);
        loop {
            if let Some(session) = self.sweep() {
                info!("Using IMDS endpoint {}", session.endpoint);
                *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
                return true;
            }
            if !initial_setup || deadline.expired() {
                warn!("Unable to get an IMDS token from any endpoint");
                return false;
            }
            deadline.wait();
        }
    }

    fn sweep(&self) -> Option<Session> {
        for endpoint in self.client.endpoints() {
            if let Some(session) = self.request_session(endpoint) {
                return Some(session);
            }
        }
        None
    }

    fn request_session(&self, endpoint: &str) -> Option<Session> {
        match self.rt.block_on(self.client.get_token(endpoint)) {
            Ok(token) if !token.is_empty() => Some(Session {
                endpoint: endpoint.to_string(),
                token,
                acquired: self.clock.now(),
            }),
            Ok(_) => {
                debug!("Empty token from {}", endpoint);
                None
            }
            Err(e) => {
                debug!("No token from {}: {}", endpoint, e);
                None
            }
        }
    }

    // The pinned session, refreshed from the pinned endpoint when near
    // expiry. Without any session a single sweep is made.
    fn current_session(&self) -> Option<Session> {
        let mut guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let fresh_for = self.token_ttl.saturating_sub(TOKEN_EXPIRY_MARGIN);
        let refreshed = match guard.as_ref() {
            Some(s) if self.clock.now().duration_since(s.acquired) < fresh_for => {
                return Some(s.clone());
            }
            Some(s) => self.request_session(&s.endpoint),
            None => self.sweep(),
        };
        *guard = refreshed.clone();
        refreshed
    }
}

impl MetadataSource for MetadataClient {
    fn fetch(&self, path: &str, max_attempts: u32) -> Result<String> {
        let Some(session) = self.current_session() else {
            return Err(NetcfgError::MetadataUnavailable {
                path: path.to_string(),
                attempts: 0,
            }
            .into());
        };
        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.rt.block_on(self.client.get_metadata(&session, path)) {
                Ok(body) => return Ok(body),
                Err(e) => debug!("Attempt {}/{} to get {}: {}", attempt, attempts, path, e),
            }
        }
        Err(NetcfgError::MetadataUnavailable {
            path: path.to_string(),
            attempts,
        }
        .into())
    }
}

#[derive(Clone, Debug)]
pub struct ImdsClientAsync {
    http: reqwest::Client,
    endpoints: Vec<String>,
    token_ttl_secs: u64,
}

impl ImdsClientAsync {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| anyhow!("unable to build IMDS HTTP client: {}", e))?;
        Ok(Self {
            http,
            endpoints: config.imds_endpoints.clone(),
            token_ttl_secs: config.imds_token_ttl_secs,
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub async fn get_token(&self, endpoint: &str) -> Result<String> {
        let url = format!("{}/api/token", endpoint);
        let resp = self
            .http
            .put(&url)
            .header(IMDS_HEADER_TOKEN_TTL, self.token_ttl_secs.to_string())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| anyhow!("failed to get token from {}: {}", &url, e))?;
        let token = resp
            .text()
            .await
            .map_err(|e| anyhow!("failed to read token from {}: {}", &url, e))?;
        Ok(token.trim().to_string())
    }

    async fn get_metadata(&self, session: &Session, path: &str) -> Result<String> {
        let url = format!("{}/meta-data/{}", session.endpoint, path);
        let resp = self
            .http
            .get(&url)
            .header(IMDS_HEADER_TOKEN, &session.token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| anyhow!("failed to get {} from IMDS: {}", &url, e))?;
        resp.text()
            .await
            .map_err(|e| anyhow!("failed to read {} from IMDS: {}", &url, e))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub(crate) struct FakeMetadata {
        values: HashMap<String, String>,
        calls: Mutex<Vec<(String, u32)>>,
    }

    impl FakeMetadata {
        pub(crate) fn with(mut self, path: &str, value: &str) -> Self {
            self.values.insert(path.to_string(), value.to_string());
            self
        }

        pub(crate) fn with_interface(self, mac: &str, key: &str, value: &str) -> Self {
            self.with(&format!("network/interfaces/macs/{}/{}", mac, key), value)
        }

        pub(crate) fn set(&mut self, path: &str, value: &str) {
            self.values.insert(path.to_string(), value.to_string());
        }

        pub(crate) fn calls(&self) -> Vec<(String, u32)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl MetadataSource for FakeMetadata {
        fn fetch(&self, path: &str, max_attempts: u32) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push((path.to_string(), max_attempts));
            self.values.get(path).cloned().ok_or_else(|| {
                NetcfgError::MetadataUnavailable {
                    path: path.to_string(),
                    attempts: max_attempts,
                }
                .into()
            })
        }
    }
}
