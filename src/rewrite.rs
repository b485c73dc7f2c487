//! Live-reload script injection.
//!
//! The body transformation is a pure `bytes -> bytes` function. The matching
//! `Content-Length` fix-up lives in [`set_content_length`] so the proxy can apply
//! both without this module knowing about responses.

use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderValue};

/// Path on the proxy listener that upgrades to the live-reload WebSocket.
pub const WS_PATH: &str = "/dev-html-proxy-ws";

/// Message that tells connected pages to reload.
pub const REFRESH_MESSAGE: &str = "refresh";

const CLOSING_BODY_TAG: &[u8] = b"</body>";

/// Client script injected before `</body>`. Reconnects 5 seconds after the socket closes.
pub const LIVE_RELOAD_SCRIPT: &str = r#"
<script>
    (function () {
        function connect() {
            var ws = new WebSocket('ws://' + window.location.host + '/dev-html-proxy-ws');

            ws.onmessage = function (event) {
                if (event.data === "refresh") {
                    window.location.reload();
                }
            };

            ws.onclose = function () {
                console.log("Live reload connection closed. Reconnecting in 5 seconds...");
                setTimeout(connect, 5000);
            };

            ws.onerror = function (err) {
                console.error("Live reload connection error:", err);
                ws.close();
            };
        }

        connect();
    })();
</script>
"#;

/// Injects [`LIVE_RELOAD_SCRIPT`] before the first `</body>`.
///
/// Bodies without a closing body tag are returned untouched.
pub fn rewrite(body: Bytes) -> Bytes {
    inject(body, LIVE_RELOAD_SCRIPT.as_bytes())
}

/// Inserts `snippet` immediately before the first `</body>` in `body`.
pub fn inject(body: Bytes, snippet: &[u8]) -> Bytes {
    let Some(at) = find(&body, CLOSING_BODY_TAG) else {
        return body;
    };

    let mut rewritten = Vec::with_capacity(body.len() + snippet.len());
    rewritten.extend_from_slice(&body[..at]);
    rewritten.extend_from_slice(snippet);
    rewritten.extend_from_slice(&body[at..]);
    Bytes::from(rewritten)
}

/// Overwrites `Content-Length` with `len` and drops any chunked framing.
pub fn set_content_length(headers: &mut HeaderMap, len: usize) {
    headers.remove(header::TRANSFER_ENCODING);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
}

/// Whether a response with these headers may have its body rewritten.
///
/// Encoded bodies are never touched. With `html_only`, the content type must be `text/html`.
pub fn is_rewritable(headers: &HeaderMap, html_only: bool) -> bool {
    let encoded = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.trim().eq_ignore_ascii_case("identity"))
        .unwrap_or(false);
    if encoded {
        return false;
    }
    if !html_only {
        return true;
    }
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .eq_ignore_ascii_case("text/html")
        })
        .unwrap_or(false)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNIPPET: &[u8] = b"<script>reload()</script>";

    #[test]
    fn injects_before_closing_body_tag() {
        let body = Bytes::from_static(b"<html><body>Hi</body></html>");
        let rewritten = inject(body, SNIPPET);
        assert_eq!(
            &rewritten[..],
            b"<html><body>Hi<script>reload()</script></body></html>"
        );
    }

    #[test]
    fn body_without_closing_tag_is_unchanged() {
        let cases: [&[u8]; 5] = [
            b"",
            b"{\"json\": true}",
            b"<html><body>unterminated",
            b"</bod",
            b"</BODY>",
        ];
        for raw in cases {
            let body = Bytes::copy_from_slice(raw);
            assert_eq!(inject(body.clone(), SNIPPET), body);
        }
    }

    #[test]
    fn only_first_closing_tag_is_rewritten() {
        let body = Bytes::from_static(b"<body>a</body><body>b</body>");
        let rewritten = inject(body, SNIPPET);
        assert_eq!(
            &rewritten[..],
            b"<body>a<script>reload()</script></body><body>b</body>"
        );
        let count = rewritten
            .windows(SNIPPET.len())
            .filter(|w| *w == SNIPPET)
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn surrounding_bytes_are_preserved() {
        let prefix = "<html><head><title>ünïcödé</title></head><body>\u{1F600}";
        let suffix = "</body>\n</html>\n";
        let body = Bytes::from(format!("{}{}", prefix, suffix));
        let rewritten = rewrite(body);

        let expected_len = prefix.len() + LIVE_RELOAD_SCRIPT.len() + suffix.len();
        assert_eq!(rewritten.len(), expected_len);
        assert_eq!(&rewritten[..prefix.len()], prefix.as_bytes());
        assert_eq!(
            &rewritten[prefix.len()..prefix.len() + LIVE_RELOAD_SCRIPT.len()],
            LIVE_RELOAD_SCRIPT.as_bytes()
        );
        assert_eq!(
            &rewritten[prefix.len() + LIVE_RELOAD_SCRIPT.len()..],
            suffix.as_bytes()
        );
    }

    #[test]
    fn content_length_is_overwritten() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("28"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        let rewritten = rewrite(Bytes::from_static(b"<html><body>Hi</body></html>"));
        set_content_length(&mut headers, rewritten.len());

        assert_eq!(
            headers.get(header::CONTENT_LENGTH).unwrap(),
            &rewritten.len().to_string()
        );
        assert_eq!(headers.get_all(header::CONTENT_LENGTH).iter().count(), 1);
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
    }

    #[test]
    fn script_targets_the_websocket_path() {
        assert!(LIVE_RELOAD_SCRIPT.contains(WS_PATH));
        assert!(LIVE_RELOAD_SCRIPT.contains(REFRESH_MESSAGE));
    }

    #[test]
    fn rewritable_respects_encoding_and_html_only() {
        let mut headers = HeaderMap::new();
        assert!(is_rewritable(&headers, false));
        assert!(!is_rewritable(&headers, true));

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        assert!(is_rewritable(&headers, true));

        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert!(is_rewritable(&headers, false));
        assert!(!is_rewritable(&headers, true));

        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert!(!is_rewritable(&headers, false));

        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("identity"));
        assert!(is_rewritable(&headers, false));
    }
}
