//! Minimal Firecracker API client over its UNIX control socket.
//!
//! Firecracker exposes its configuration/action API as plain HTTP over a
//! UNIX domain socket rather than TCP, so there is no `hyper`/`reqwest`
//! connector to reach for; this hand-rolls the request/response framing the
//! way the teacher's `FirecrackerClient::send_api_request` stood in for,
//! but actually writes and reads bytes on the wire instead of simulating.

use log::debug;
use serde::Serialize;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::{Error, Result};

pub struct FirecrackerApi<'a> {
    socket_path: &'a Path,
}

impl<'a> FirecrackerApi<'a> {
    pub fn new(socket_path: &'a Path) -> Self {
        Self { socket_path }
    }

    pub async fn put_json<T: Serialize>(&self, endpoint: &str, body: &T) -> Result<()> {
        self.request("PUT", endpoint, Some(serde_json::to_vec(body)?))
            .await
    }

    pub async fn patch_json<T: Serialize>(&self, endpoint: &str, body: &T) -> Result<()> {
        self.request("PATCH", endpoint, Some(serde_json::to_vec(body)?))
            .await
    }

    async fn request(&self, method: &str, endpoint: &str, body: Option<Vec<u8>>) -> Result<()> {
        let body = body.unwrap_or_default();
        let mut stream = UnixStream::connect(self.socket_path)
            .await
            .map_err(|e| Error::Vmm(format!("connecting to {}: {e}", self.socket_path.display())))?;

        let request = format!(
            "{method} {endpoint} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );

        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| Error::Vmm(format!("writing request: {e}")))?;
        stream
            .write_all(&body)
            .await
            .map_err(|e| Error::Vmm(format!("writing body: {e}")))?;

        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .await
            .map_err(|e| Error::Vmm(format!("reading response: {e}")))?;

        let status_line = response
            .split(|&b| b == b'\n')
            .next()
            .map(|l| String::from_utf8_lossy(l).trim().to_string())
            .unwrap_or_default();

        debug!("firecracker api {method} {endpoint} -> {status_line}");

        if status_line.contains(" 2") {
            Ok(())
        } else {
            Err(Error::Vmm(format!(
                "firecracker api {method} {endpoint} failed: {status_line}"
            )))
        }
    }
}
