// src/lib.rs

#![doc = r#"
# dev-html-proxy

A development reverse proxy that injects a live-reload script into proxied pages and
refreshes every connected browser when its trigger endpoint is hit.

## Modules

- [`config`]: Configuration loading and merging from CLI, file, and environment.
- [`error`]: Error types for configuration, proxying, and listener startup.
- [`hub`]: Registry of live-reload WebSocket connections and message fan-out.
- [`proxy`]: Request forwarding to the target origin.
- [`rewrite`]: Script injection and `Content-Length` recomputation.
- [`transport`]: Outbound HTTP execution with a fixed retry schedule.
- [`web`]: Proxy and trigger routers, WebSocket handling, and server loops.
"#]

pub mod config;
pub mod error;
pub mod hub;
pub mod proxy;
pub mod rewrite;
pub mod transport;
pub mod web;
