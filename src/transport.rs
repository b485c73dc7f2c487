//! Outbound transport with a fixed retry schedule.
//!
//! Development servers restart often. Transport-level failures are retried every
//! [`RETRY_DELAY`] for up to [`MAX_ATTEMPTS`] attempts, which rides out roughly a
//! minute of downtime. Any HTTP response, including 4xx and 5xx, ends the loop.

use std::future::Future;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Request, Response, Uri};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tracing::{debug, info};

use crate::error::{BoxError, ProxyError};

/// Maximum number of attempts per request (one minute of 100 ms retries).
pub const MAX_ATTEMPTS: u32 = 60 * 1000 / 100;

/// Delay between two failed attempts.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Executes a single HTTP exchange.
pub trait Executor: Send + Sync {
    fn execute(
        &self,
        request: Request<Body>,
    ) -> impl Future<Output = Result<Response<Body>, BoxError>> + Send;
}

/// [`Executor`] backed by the hyper-util connection-pooling client.
///
/// Origins may be plain `http://` or `https://`. TLS to the origin uses rustls with the
/// webpki root store.
#[derive(Clone)]
pub struct HyperExecutor {
    client: Client<HttpsConnector<HttpConnector>, Body>,
}

impl HyperExecutor {
    pub fn new() -> Self {
        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client }
    }
}

impl Default for HyperExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for HyperExecutor {
    fn execute(
        &self,
        request: Request<Body>,
    ) -> impl Future<Output = Result<Response<Body>, BoxError>> + Send {
        let pending = self.client.request(request);
        async move {
            let response: Response<Incoming> = pending.await?;
            Ok::<_, BoxError>(response.map(Body::new))
        }
    }
}

/// A buffered request that can be replayed on every attempt.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    fn to_request(&self) -> Result<Request<Body>, ProxyError> {
        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone())
            .body(Body::from(self.body.clone()))?;
        *request.headers_mut() = self.headers.clone();
        Ok(request)
    }
}

/// Attempt budget and spacing for [`RetryingTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            delay: RETRY_DELAY,
        }
    }
}

/// Wraps an [`Executor`] and retries transport failures according to a [`RetryPolicy`].
pub struct RetryingTransport<E = HyperExecutor> {
    executor: E,
    policy: RetryPolicy,
}

impl<E: Executor> RetryingTransport<E> {
    pub fn new(executor: E, policy: RetryPolicy) -> Self {
        Self { executor, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Sends `request`, retrying until a response arrives or the budget is spent.
    ///
    /// Only transport-level failures (refused connections, resets, failed TLS handshakes)
    /// are retried. The first HTTP response is returned whatever its status.
    ///
    /// # Arguments
    /// * `request` - The buffered request. It is rebuilt for every attempt.
    ///
    /// # Returns
    /// The origin's response, with its body still streaming.
    ///
    /// # Errors
    /// Returns [`ProxyError::RetryExhausted`] carrying the last transport error once
    /// `max_attempts` attempts have failed, or [`ProxyError::Request`] if the request
    /// cannot be assembled.
    pub async fn execute(&self, request: &OutboundRequest) -> Result<Response<Body>, ProxyError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.executor.execute(request.to_request()?).await {
                Ok(response) => {
                    if attempt > 1 {
                        info!(uri = %request.uri, attempt, "Origin reachable again");
                    }
                    return Ok(response);
                }
                Err(e) => e,
            };

            if attempt >= max_attempts {
                return Err(ProxyError::RetryExhausted {
                    attempts: attempt,
                    source: error,
                });
            }

            debug!(uri = %request.uri, attempt, error = %error, "Origin request failed, retrying");
            tokio::time::sleep(self.policy.delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    /// Fails the first `failures` attempts, then answers with `status`.
    struct FlakyExecutor {
        failures: u32,
        status: StatusCode,
        attempts: AtomicU32,
    }

    impl FlakyExecutor {
        fn new(failures: u32, status: StatusCode) -> Self {
            Self {
                failures,
                status,
                attempts: AtomicU32::new(0),
            }
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Executor for &FlakyExecutor {
        fn execute(
            &self,
            _request: Request<Body>,
        ) -> impl Future<Output = Result<Response<Body>, BoxError>> + Send {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let fail = attempt <= self.failures;
            let status = self.status;
            async move {
                if fail {
                    Err::<Response<Body>, BoxError>("connection refused".into())
                } else {
                    let mut response = Response::new(Body::from("ok"));
                    *response.status_mut() = status;
                    Ok(response)
                }
            }
        }
    }

    fn get(uri: &str) -> OutboundRequest {
        OutboundRequest {
            method: Method::GET,
            uri: uri.parse().unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[test]
    fn default_budget_is_one_minute() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 600);
        assert_eq!(policy.delay, Duration::from_millis(100));
        assert_eq!(policy.delay * policy.max_attempts, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn first_response_is_returned_without_retry() {
        let executor = FlakyExecutor::new(0, StatusCode::OK);
        let transport = RetryingTransport::new(&executor, RetryPolicy::default());

        let response = transport.execute(&get("http://origin/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(executor.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_origin_answers() {
        let executor = FlakyExecutor::new(7, StatusCode::OK);
        let transport = RetryingTransport::new(&executor, RetryPolicy::default());

        let started = Instant::now();
        let response = transport.execute(&get("http://origin/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(executor.attempts(), 8);
        let elapsed = started.elapsed();
        assert!(elapsed >= RETRY_DELAY * 7, "elapsed {:?}", elapsed);
        assert!(elapsed < RETRY_DELAY * 8, "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_are_not_retried() {
        let executor = FlakyExecutor::new(2, StatusCode::INTERNAL_SERVER_ERROR);
        let transport = RetryingTransport::new(&executor, RetryPolicy::default());

        let response = transport.execute(&get("http://origin/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(executor.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_default_budget() {
        let executor = FlakyExecutor::new(u32::MAX, StatusCode::OK);
        let transport = RetryingTransport::new(&executor, RetryPolicy::default());

        let started = Instant::now();
        let err = transport.execute(&get("http://origin/")).await.unwrap_err();

        assert!(matches!(
            err,
            ProxyError::RetryExhausted { attempts, .. } if attempts == MAX_ATTEMPTS
        ));
        assert_eq!(executor.attempts(), MAX_ATTEMPTS);
        let elapsed = started.elapsed();
        assert!(elapsed >= RETRY_DELAY * (MAX_ATTEMPTS - 1), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(61), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_policy_is_honoured() {
        let executor = FlakyExecutor::new(u32::MAX, StatusCode::OK);
        let policy = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(10),
        };
        let transport = RetryingTransport::new(&executor, policy);

        let err = transport.execute(&get("http://origin/")).await.unwrap_err();
        assert!(matches!(err, ProxyError::RetryExhausted { attempts: 3, .. }));
        assert_eq!(executor.attempts(), 3);
        assert_eq!(transport.policy(), policy);
    }

    #[tokio::test]
    async fn hyper_executor_opens_tls_to_https_origins() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let first_byte = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut first = [0u8; 1];
            stream.read_exact(&mut first).await.unwrap();
            first[0]
        });

        let request = Request::get(format!("https://{}/", addr))
            .body(Body::empty())
            .unwrap();
        // The origin hangs up after one byte, so the exchange itself fails.
        assert!(HyperExecutor::new().execute(request).await.is_err());

        // 0x16 opens a TLS handshake record.
        assert_eq!(first_byte.await.unwrap(), 0x16);
    }
}
