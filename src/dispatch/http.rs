//! HTTP calls to a guest's action-hook server: health probing and hook
//! dispatch. Grounded in the teacher's choice of `reqwest` (json,
//! rustls-tls) as the HTTP client; this is a thin guest-facing client, not
//! the excluded core<->outer-server RPC transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Serialize)]
struct HookRequest<'a> {
    hook: &'a str,
    payload: &'a Value,
}

#[derive(Debug, Clone)]
pub struct GuestClient {
    client: reqwest::Client,
    dispatch_timeout: Duration,
}

impl GuestClient {
    pub fn new(dispatch_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            dispatch_timeout,
        }
    }

    /// `GET http://<ip>:80/health`, retried `retries` times with a fixed
    /// `delay` between attempts. Success iff the body decodes with
    /// `"status":"healthy"`.
    pub async fn wait_healthy(&self, ip: Ipv4Addr, retries: u32, delay: Duration) -> Result<()> {
        let url = format!("http://{ip}:80/health");
        let mut last_err = None;

        for attempt in 0..retries {
            match self.client.get(&url).timeout(Duration::from_secs(5)).send().await {
                Ok(response) => match response.json::<HealthResponse>().await {
                    Ok(body) if body.status == "healthy" => return Ok(()),
                    Ok(body) => last_err = Some(format!("status was {:?}", body.status)),
                    Err(e) => last_err = Some(e.to_string()),
                },
                Err(e) => last_err = Some(e.to_string()),
            }

            if attempt + 1 < retries {
                tokio::time::sleep(delay).await;
            }
        }

        Err(Error::Timeout(format!(
            "guest at {ip} never reported healthy: {}",
            last_err.unwrap_or_default()
        )))
    }

    /// `<method> http://<ip>:80<endpoint>` with `{hook, payload}` as the
    /// body, bounded by the configured dispatch timeout.
    pub async fn call_hook(
        &self,
        ip: Ipv4Addr,
        method: &str,
        endpoint: &str,
        hook: &str,
        payload: &Value,
    ) -> Result<Value> {
        let url = format!("http://{ip}:80{endpoint}");
        let request_method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| Error::Validation(format!("invalid http method {method}: {e}")))?;

        let response = self
            .client
            .request(request_method, &url)
            .json(&HookRequest { hook, payload })
            .timeout(self.dispatch_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Http(format!(
                "hook {hook} at {url} returned {}",
                response.status()
            )));
        }

        response.json::<Value>().await.map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_client_builds() {
        let _client = GuestClient::new(Duration::from_secs(10));
    }
}
