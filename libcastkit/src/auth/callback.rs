//! One-shot loopback HTTP server for OAuth redirects

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::error::{AuthError, Result};

pub const CALLBACK_PATH: &str = "/callback";

const MAX_REQUEST_BYTES: usize = 16 * 1024;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

const SUCCESS_PAGE: &str = "<!doctype html><html><head><title>castkit</title></head>\
<body style=\"font-family:sans-serif\"><h2>Authorization received</h2>\
<p>You can close this window and return to the terminal.</p></body></html>";

const DENIED_PAGE: &str = "<!doctype html><html><head><title>castkit</title></head>\
<body style=\"font-family:sans-serif\"><h2>Authorization was not granted</h2>\
<p>Check the terminal for details.</p></body></html>";

pub struct CallbackServer {
    listener: TcpListener,
}

impl CallbackServer {
    /// Listen on 127.0.0.1; port 0 picks a free port
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| AuthError::Callback(format!("cannot listen on 127.0.0.1:{}: {}", port, e)))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| AuthError::Callback(e.to_string()).into())
    }

    pub fn redirect_uri(&self) -> Result<String> {
        Ok(format!("http://{}{}", self.local_addr()?, CALLBACK_PATH))
    }

    /// Serve until a request for `path` arrives and return its query parameters
    ///
    /// Requests for other paths (browsers like to ask for `/favicon.ico`) get a
    /// 404 and the wait continues.
    pub async fn wait(self, path: &str, timeout: Duration) -> Result<HashMap<String, String>> {
        tracing::debug!(addr = ?self.listener.local_addr().ok(), path, "waiting for OAuth callback");
        match tokio::time::timeout(timeout, self.accept_loop(path)).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::CallbackTimeout(timeout.as_secs()).into()),
        }
    }

    async fn accept_loop(&self, path: &str) -> Result<HashMap<String, String>> {
        let (tx, mut rx) = mpsc::channel::<HashMap<String, String>>(1);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.map_err(|e| AuthError::Callback(e.to_string()))?;
                    tokio::spawn(serve_connection(stream, peer, path.to_string(), tx.clone()));
                }
                Some(params) = rx.recv() => return Ok(params),
            }
        }
    }
}

/// Answer one connection; idle or half-open sockets are dropped after a short read timeout
async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    path: String,
    tx: mpsc::Sender<HashMap<String, String>>,
) {
    let target = match tokio::time::timeout(READ_TIMEOUT, read_request_target(&mut stream)).await {
        Ok(Ok(target)) => target,
        Ok(Err(e)) => {
            tracing::debug!(%peer, "ignoring malformed callback request: {}", e);
            return;
        }
        Err(_) => {
            tracing::debug!(%peer, "closing idle callback connection");
            return;
        }
    };

    let (request_path, query) = target.split_once('?').unwrap_or((target.as_str(), ""));
    if request_path != path {
        let _ = respond(&mut stream, "404 Not Found", "not found").await;
        return;
    }

    let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    let page = if params.contains_key("error") {
        DENIED_PAGE
    } else {
        SUCCESS_PAGE
    };
    if let Err(e) = respond(&mut stream, "200 OK", page).await {
        tracing::debug!("failed to answer callback: {}", e);
    }
    let _ = tx.send(params).await;
}

/// Read the request head and return the request target of the first line
async fn read_request_target(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(target)) => Ok(target.to_string()),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected request line '{}'", request_line),
        )),
    }
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receives_code_and_state() {
        let server = CallbackServer::bind(0).await.unwrap();
        let uri = server.redirect_uri().unwrap();
        assert!(uri.starts_with("http://127.0.0.1:"));
        assert!(uri.ends_with("/callback"));

        let browser = tokio::spawn(async move {
            let client = reqwest::Client::new();
            let favicon = uri.replace("/callback", "/favicon.ico");
            let missing = client.get(favicon).send().await.unwrap();
            assert_eq!(missing.status(), 404);

            let response = client
                .get(format!("{}?code=abc%2F1&state=xyz", uri))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), 200);
            response.text().await.unwrap()
        });

        let params = server
            .wait(CALLBACK_PATH, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(params["code"], "abc/1");
        assert_eq!(params["state"], "xyz");

        let page = browser.await.unwrap();
        assert!(page.contains("Authorization received"));
    }

    #[tokio::test]
    async fn test_error_redirect_is_returned() {
        let server = CallbackServer::bind(0).await.unwrap();
        let uri = server.redirect_uri().unwrap();
        let browser = tokio::spawn(async move {
            reqwest::get(format!("{}?error=access_denied&state=s", uri))
                .await
                .unwrap()
                .text()
                .await
                .unwrap()
        });

        let params = server.wait(CALLBACK_PATH, Duration::from_secs(10)).await.unwrap();
        assert_eq!(params["error"], "access_denied");
        assert!(browser.await.unwrap().contains("not granted"));
    }

    #[tokio::test]
    async fn test_idle_connection_does_not_block_callback() {
        let server = CallbackServer::bind(0).await.unwrap();
        let addr = server.local_addr().unwrap();
        let uri = server.redirect_uri().unwrap();

        let browser = tokio::spawn(async move {
            let idle = TcpStream::connect(addr).await.unwrap();
            let response = reqwest::get(format!("{}?code=abc&state=s", uri)).await.unwrap();
            assert_eq!(response.status(), 200);
            drop(idle);
        });

        let params = server.wait(CALLBACK_PATH, Duration::from_secs(3)).await.unwrap();
        assert_eq!(params["code"], "abc");
        assert_eq!(params["state"], "s");
        browser.await.unwrap();
    }

    #[tokio::test]
    async fn test_times_out() {
        let server = CallbackServer::bind(0).await.unwrap();
        let err = server
            .wait(CALLBACK_PATH, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::CastError::Auth(AuthError::CallbackTimeout(_))
        ));
    }
}
