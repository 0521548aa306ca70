//! Network transport used by the worker when the cache cannot answer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use spin::RwLock;

use crate::service_worker::{Request, Response};

/// Transport-level failure. An HTTP error status is not a `NetworkError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Host unreachable, connection reset, DNS failure, ...
    Unreachable(String),
    /// URL could not be used for a request
    InvalidUrl(String),
    /// Anything else reported by the transport
    Other(String),
}

impl core::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NetworkError::Unreachable(s) => write!(f, "network unreachable: {}", s),
            NetworkError::InvalidUrl(s) => write!(f, "invalid url: {}", s),
            NetworkError::Other(s) => write!(f, "network error: {}", s),
        }
    }
}

impl std::error::Error for NetworkError {}

/// Something that can perform a fetch.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: Request) -> Result<Response, NetworkError>;
}

/// What a `StaticNetwork` route answers with.
#[derive(Debug, Clone)]
pub enum Route {
    Respond(Response),
    Fail(NetworkError),
}

/// Network that serves a fixed route table keyed by URL.
///
/// Unknown URLs fail as unreachable, which is what a disconnected device
/// sees. Every call is counted per URL.
#[derive(Default)]
pub struct StaticNetwork {
    routes: RwLock<BTreeMap<String, Route>>,
    calls: RwLock<BTreeMap<String, usize>>,
    total: AtomicUsize,
}

impl StaticNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `url` with `response`.
    pub fn respond(&self, url: impl Into<String>, response: Response) -> &Self {
        self.routes.write().insert(url.into(), Route::Respond(response));
        self
    }

    /// Fail requests for `url` with `error`.
    pub fn fail(&self, url: impl Into<String>, error: NetworkError) -> &Self {
        self.routes.write().insert(url.into(), Route::Fail(error));
        self
    }

    /// Drop every route, simulating a lost connection.
    pub fn disconnect(&self) {
        self.routes.write().clear();
    }

    /// Number of fetches issued for `url`.
    pub fn calls_to(&self, url: &str) -> usize {
        self.calls.read().get(url).copied().unwrap_or(0)
    }

    /// Number of fetches issued overall.
    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Network for StaticNetwork {
    async fn fetch(&self, request: Request) -> Result<Response, NetworkError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.calls.write().entry(request.url.clone()).or_insert(0) += 1;

        let route = self.routes.read().get(&request.url).cloned();
        match route {
            Some(Route::Respond(response)) => {
                let response = if response.url.is_empty() {
                    response.with_url(request.url)
                } else {
                    response
                };
                Ok(response)
            }
            Some(Route::Fail(error)) => Err(error),
            None => Err(NetworkError::Unreachable(request.url)),
        }
    }
}

#[cfg(feature = "http")]
pub use http::HttpNetwork;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use crate::service_worker::{RequestMethod, ResponseType};

    /// HTTP transport over `reqwest`.
    ///
    /// No timeout or retry is layered on top of the client's own behavior.
    pub struct HttpNetwork {
        client: reqwest::Client,
    }

    impl HttpNetwork {
        pub fn new() -> Result<Self, NetworkError> {
            let client = reqwest::Client::builder()
                .build()
                .map_err(|e| NetworkError::Other(e.to_string()))?;
            Ok(Self { client })
        }

        pub fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    fn to_method(method: RequestMethod) -> reqwest::Method {
        match method {
            RequestMethod::Get => reqwest::Method::GET,
            RequestMethod::Post => reqwest::Method::POST,
            RequestMethod::Put => reqwest::Method::PUT,
            RequestMethod::Delete => reqwest::Method::DELETE,
            RequestMethod::Patch => reqwest::Method::PATCH,
            RequestMethod::Head => reqwest::Method::HEAD,
            RequestMethod::Options => reqwest::Method::OPTIONS,
        }
    }

    #[async_trait]
    impl Network for HttpNetwork {
        async fn fetch(&self, request: Request) -> Result<Response, NetworkError> {
            let url = reqwest::Url::parse(&request.url)
                .map_err(|e| NetworkError::InvalidUrl(format!("{}: {}", request.url, e)))?;

            let mut builder = self.client.request(to_method(request.method), url.clone());
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if request.cache.bypasses_http_cache() {
                builder = builder
                    .header(reqwest::header::CACHE_CONTROL, "no-cache")
                    .header(reqwest::header::PRAGMA, "no-cache");
            }
            if let Some(body) = request.body.clone() {
                builder = builder.body(body);
            }

            let reply = builder.send().await.map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    NetworkError::Unreachable(e.to_string())
                } else {
                    NetworkError::Other(e.to_string())
                }
            })?;

            // Both sides are normalised, so `https://host` and `https://host/` agree.
            let redirected = reply.url() != &url;
            let final_url = reply.url().to_string();
            let mut response = Response::new(reply.status().as_u16());
            response.response_type = ResponseType::Basic;
            response.redirected = redirected;
            for (name, value) in reply.headers() {
                if let Ok(value) = value.to_str() {
                    response.headers.insert(name.as_str().to_string(), value.to_string());
                }
            }
            response.url = final_url;
            response.body = reply
                .bytes()
                .await
                .map_err(|e| NetworkError::Other(e.to_string()))?
                .to_vec();

            Ok(response)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::service_worker::RequestCache;
        use std::sync::Arc;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};

        /// Raw requests seen by the local server, in arrival order.
        type Seen = Arc<spin::Mutex<Vec<String>>>;

        /// Plain HTTP/1.1 server on a random local port. `/missing` is a
        /// 404, `/old` redirects to `/new`, everything else is a 200.
        async fn serve() -> (String, Seen) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let seen: Seen = Arc::default();
            let log = seen.clone();
            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    let log = log.clone();
                    tokio::spawn(async move {
                        let raw = read_request(&mut socket).await;
                        let path = raw.split_whitespace().nth(1).unwrap_or("/").to_string();
                        log.lock().push(raw);
                        let reply = match path.as_str() {
                            "/missing" => canned("404 Not Found", &[], "gone"),
                            "/old" => canned("302 Found", &[("Location", "/new")], ""),
                            _ => canned("200 OK", &[("Content-Type", "text/plain")], "fresh"),
                        };
                        let _ = socket.write_all(reply.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
            });
            (base, seen)
        }

        async fn read_request(socket: &mut TcpStream) -> String {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                    let body_len = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + body_len {
                        break;
                    }
                }
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            String::from_utf8_lossy(&buf).into_owned()
        }

        fn canned(status: &str, headers: &[(&str, &str)], body: &str) -> String {
            let mut reply = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n",
                status,
                body.len()
            );
            for (name, value) in headers {
                reply.push_str(&format!("{}: {}\r\n", name, value));
            }
            reply.push_str("\r\n");
            reply.push_str(body);
            reply
        }

        #[tokio::test]
        async fn no_cache_request_revalidates_with_origin() {
            let (base, seen) = serve().await;
            let network = HttpNetwork::new().unwrap();

            let request =
                Request::new(format!("{}/jspsych.js", base)).with_cache(RequestCache::NoCache);
            let response = network.fetch(request).await.unwrap();

            assert_eq!(response.status, 200);
            assert_eq!(response.body, b"fresh");
            assert!(!response.redirected);
            let raw = seen.lock()[0].to_ascii_lowercase();
            assert!(raw.contains("cache-control: no-cache"), "{}", raw);
            assert!(raw.contains("pragma: no-cache"), "{}", raw);
        }

        #[tokio::test]
        async fn default_request_leaves_cache_headers_alone() {
            let (base, seen) = serve().await;
            let network = HttpNetwork::new().unwrap();

            network.fetch(Request::new(format!("{}/app.css", base))).await.unwrap();

            let raw = seen.lock()[0].to_ascii_lowercase();
            assert!(!raw.contains("pragma:"), "{}", raw);
            assert!(!raw.contains("cache-control:"), "{}", raw);
        }

        #[tokio::test]
        async fn error_status_is_a_response() {
            let (base, _) = serve().await;
            let network = HttpNetwork::new().unwrap();

            let response = network
                .fetch(Request::new(format!("{}/missing", base)))
                .await
                .unwrap();

            assert_eq!(response.status, 404);
            assert_eq!(response.body, b"gone");
            assert!(!response.is_cacheable());
        }

        #[tokio::test]
        async fn redirect_chain_reports_final_url() {
            let (base, seen) = serve().await;
            let network = HttpNetwork::new().unwrap();

            let response = network.fetch(Request::new(format!("{}/old", base))).await.unwrap();

            assert_eq!(response.status, 200);
            assert!(response.redirected);
            assert_eq!(response.url, format!("{}/new", base));
            assert_eq!(seen.lock().len(), 2);
        }

        #[tokio::test]
        async fn normalised_url_is_not_a_redirect() {
            let (base, _) = serve().await;
            let network = HttpNetwork::new().unwrap();

            // no trailing slash; the client sends `/`
            let response = network.fetch(Request::new(base.clone())).await.unwrap();

            assert!(!response.redirected);
            assert_eq!(response.url, format!("{}/", base));
        }

        #[tokio::test]
        async fn method_headers_and_body_are_forwarded() {
            let (base, seen) = serve().await;
            let network = HttpNetwork::new().unwrap();

            let request = Request::new(format!("{}/data", base))
                .with_method(RequestMethod::Post)
                .with_header("x-trial", "7")
                .with_body(b"{\"rt\":512}".to_vec());
            network.fetch(request).await.unwrap();

            let raw = seen.lock()[0].clone();
            assert!(raw.starts_with("POST /data HTTP/1.1\r\n"), "{}", raw);
            assert!(raw.to_ascii_lowercase().contains("x-trial: 7"), "{}", raw);
            assert!(raw.ends_with("\r\n\r\n{\"rt\":512}"), "{}", raw);
        }

        #[tokio::test]
        async fn refused_connection_is_unreachable() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);

            let network = HttpNetwork::new().unwrap();
            let result = network.fetch(Request::new(format!("http://{}/", addr))).await;

            assert!(matches!(result, Err(NetworkError::Unreachable(_))));
        }

        #[tokio::test]
        async fn malformed_url_is_rejected_before_sending() {
            let network = HttpNetwork::new().unwrap();
            let result = network.fetch(Request::new("not a url")).await;
            assert!(matches!(result, Err(NetworkError::InvalidUrl(_))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_network_serves_routes() {
        let network = StaticNetwork::new();
        network.respond("https://example.com/a", Response::new(200).with_body(b"a".to_vec()));

        let resp = network.fetch(Request::new("https://example.com/a")).await.unwrap();
        assert_eq!(resp.body, b"a");
        assert_eq!(resp.url, "https://example.com/a");
        assert_eq!(network.calls_to("https://example.com/a"), 1);
    }

    #[tokio::test]
    async fn static_network_unknown_url_is_unreachable() {
        let network = StaticNetwork::new();
        let result = network.fetch(Request::new("https://example.com/missing")).await;
        assert!(matches!(result, Err(NetworkError::Unreachable(_))));
        assert_eq!(network.total_calls(), 1);
    }

    #[tokio::test]
    async fn static_network_disconnect() {
        let network = StaticNetwork::new();
        network.respond("https://example.com/a", Response::new(200));
        network.disconnect();
        assert!(network.fetch(Request::new("https://example.com/a")).await.is_err());
    }

    #[tokio::test]
    async fn static_network_configured_failure() {
        let network = StaticNetwork::new();
        network.fail(
            "https://example.com/a",
            NetworkError::Other(String::from("connection reset")),
        );
        let result = network.fetch(Request::new("https://example.com/a")).await;
        assert_eq!(
            result,
            Err(NetworkError::Other(String::from("connection reset")))
        );
    }
}
