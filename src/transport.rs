//! Long-lived background worker owning one in-flight HTTP streaming request.
//! Waits on the generation signal, tears down any stale request, issues a
//! new one, and pumps the stream in slices until completion or cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;

use crate::config::Config;
use crate::controller::{Controller, RequestMode};
use crate::sse::SseDecoder;

const PRIME_MAX_TOKENS: u64 = 0;
const COMPLETION_MAX_TOKENS: u64 = 256;

/// How often the worker checks whether its current generation has gone
/// stale while pumping a streaming response body.
const POLL_SLICE: Duration = Duration::from_millis(100);

pub struct Transport {
    controller: Arc<Controller>,
    config: Config,
    client: Client,
    shutdown: Arc<AtomicBool>,
}

impl Transport {
    /// Spawn the single background worker thread. Only one instance should
    /// ever run per process — there is no request queue, only "the current
    /// generation".
    pub fn spawn(controller: Arc<Controller>, config: Config) -> Arc<AtomicBool> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_shutdown = shutdown.clone();
        std::thread::Builder::new()
            .name("sqlcopilot-worker".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!("failed to start worker runtime: {e}");
                        return;
                    }
                };
                let transport = Transport {
                    controller,
                    config,
                    client: Client::new(),
                    shutdown: worker_shutdown,
                };
                runtime.block_on(transport.run());
            })
            .expect("failed to spawn transport worker thread");
        shutdown
    }

    async fn run(&self) {
        let mut last_acted_on: u64 = 0;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            let observed = self.controller.wait_for_generation(last_acted_on);
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            if observed == last_acted_on {
                continue;
            }
            last_acted_on = observed;

            let snapshot = self.controller.get_request();
            if snapshot.generation != observed {
                // Superseded again before we could even build the request.
                continue;
            }
            if snapshot.mode == RequestMode::Cancel {
                // Cancel-only bump: any in-flight request already noticed
                // the generation change via its own polling. No new
                // request for a trivial prefix.
                continue;
            }
            if !self.config.auth.is_authenticated() {
                continue;
            }

            let max_tokens = match snapshot.mode {
                RequestMode::Prime => PRIME_MAX_TOKENS,
                RequestMode::Completion => COMPLETION_MAX_TOKENS,
                RequestMode::Cancel => unreachable!("handled above"),
            };

            if let Err(e) = self
                .stream_completion(&snapshot.session_id, &snapshot.prompt, max_tokens, observed)
                .await
            {
                tracing::warn!("completion request failed: {}", e.user_message());
            }
        }
    }

    /// Issue one completion request and pump its SSE body, feeding decoded
    /// tokens back to the controller until the stream ends or the
    /// generation moves on. Public so it is directly testable against a
    /// mock server without spinning a real worker thread.
    pub async fn stream_completion(
        &self,
        session_id: &str,
        prompt: &str,
        max_tokens: u64,
        generation: u64,
    ) -> Result<(), crate::error::CopilotError> {
        let body = serde_json::json!({
            "sessionId": session_id,
            "requestId": generation,
            "prompt": prompt,
            "maxTokens": max_tokens,
        });

        let mut builder = self
            .client
            .post(self.config.completion_url())
            .header("Content-Type", "application/json");
        if let Some((name, value)) = self.config.auth.header() {
            builder = builder.header(name, value);
        }

        let response = builder.json(&body).send().await?;
        if !response.status().is_success() {
            return Err(crate::error::CopilotError::Upstream(format!(
                "status {}",
                response.status()
            )));
        }

        let mut decoder = SseDecoder::new();
        let mut stream = response.bytes_stream();

        loop {
            if self.controller.current_generation() != generation {
                return Ok(()); // proactive cancellation
            }

            let next = tokio::time::timeout(POLL_SLICE, stream.next()).await;
            let chunk = match next {
                Ok(Some(Ok(bytes))) => bytes,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => return Ok(()), // stream ended
                Err(_) => continue,        // 100ms slice elapsed, re-check generation
            };

            if self.controller.current_generation() != generation {
                return Ok(()); // cooperative cancel: stop consuming this chunk's events
            }

            let controller = &self.controller;
            decoder.feed(&chunk, |event| {
                if event.stop || event.error || event.cancel {
                    return;
                }
                controller.on_token(generation, event.token.as_deref());
            })?;
        }
    }

    /// Push the current session's schema to the server once, independent of
    /// the keystroke-driven prime/completion cycle — a single blocking
    /// request with no streaming.
    pub async fn push_session(
        &self,
        session_id: &str,
        schema_digest: &str,
    ) -> Result<(), crate::error::CopilotError> {
        if !self.config.auth.is_authenticated() {
            return Err(crate::error::CopilotError::AuthMissing);
        }

        let body = serde_json::json!({
            "sessionId": session_id,
            "schema": schema_digest,
        });

        let mut builder = self
            .client
            .post(self.config.session_url())
            .header("Content-Type", "application/json");
        if let Some((name, value)) = self.config.auth.header() {
            builder = builder.header(name, value);
        }

        let response = builder.json(&body).send().await?;
        if !response.status().is_success() {
            return Err(crate::error::CopilotError::Upstream(format!(
                "status {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Blocking (non-streaming-to-caller) chat call. Shares the SSE wire
    /// format and decoder with completion, but runs to completion on the
    /// caller's own task rather than through the generation/condvar
    /// machinery — it owns no ghost-text state and is not cancellable.
    pub async fn chat(
        &self,
        session_id: &str,
        query: &str,
    ) -> Result<String, crate::error::CopilotError> {
        if !self.config.auth.is_authenticated() {
            return Err(crate::error::CopilotError::AuthMissing);
        }

        let body = serde_json::json!({
            "sessionId": session_id,
            "requestId": 0,
            "prompt": query,
        });

        let mut builder = self
            .client
            .post(self.config.chat_url())
            .header("Content-Type", "application/json");
        if let Some((name, value)) = self.config.auth.header() {
            builder = builder.header(name, value);
        }

        let response = builder.json(&body).send().await?;
        if !response.status().is_success() {
            return Err(crate::error::CopilotError::Upstream(format!(
                "status {}",
                response.status()
            )));
        }

        let mut decoder = SseDecoder::new();
        let mut stream = response.bytes_stream();
        let mut accumulated = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let mut done = false;
            decoder.feed(&chunk, |event| {
                if let Some(token) = event.token {
                    accumulated.push_str(&token);
                }
                if event.stop || event.error || event.cancel {
                    done = true;
                }
            })?;
            if done {
                break;
            }
        }

        Ok(accumulated)
    }

    /// Build a `Transport` bound to an existing controller and config,
    /// without spawning a worker thread. Used for the blocking chat path and
    /// for tests.
    pub fn new_unattached(controller: Arc<Controller>, config: Config) -> Self {
        Transport {
            controller,
            config,
            client: Client::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthState;
    use crate::session::Session;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn mock_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn transport_for(port: u16, controller: Arc<Controller>) -> Transport {
        Transport {
            controller,
            config: Config {
                api_url: format!("http://127.0.0.1:{port}"),
                auth: AuthState::Bearer("test-token".to_string()),
            },
            client: Client::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    #[tokio::test]
    async fn streams_tokens_into_controller() {
        let (listener, port) = mock_listener().await;
        let controller = Controller::new(Session::new("schema"));
        controller.on_event("SELECT", 6, crate::controller::DEFAULT_PRIME_THRESHOLD);
        let generation = controller.current_generation();
        let transport = transport_for(port, controller.clone());

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n\
                      data: {\"token\":\" FROM\"}\r\n\
                      data: {\"token\":\" users\"}\r\n\
                      data: {\"stop\":true}\r\n",
                )
                .await
                .unwrap();
        });

        transport
            .stream_completion("sid", "SELECT", 256, generation)
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(controller.suggestion(), " FROM users");
    }

    #[tokio::test]
    async fn stale_generation_stops_consuming_events() {
        let (listener, port) = mock_listener().await;
        let controller = Controller::new(Session::new("schema"));
        controller.on_event("SELECT", 6, crate::controller::DEFAULT_PRIME_THRESHOLD);
        let generation = controller.current_generation();
        let transport = transport_for(port, controller.clone());

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n\
                      data: {\"token\":\"first\"}\r\n",
                )
                .await
                .unwrap();
            // Advance the generation mid-stream before sending more data.
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = socket
                .write_all(b"data: {\"token\":\"second\"}\r\n")
                .await;
        });

        // Race: bump generation right away so by the time the worker
        // observes the first chunk, it is already stale.
        controller.on_event("SELECT ", 7, crate::controller::DEFAULT_PRIME_THRESHOLD);

        transport
            .stream_completion("sid", "SELECT", 256, generation)
            .await
            .unwrap();
        let _ = server.await;

        assert_eq!(controller.suggestion(), "");
    }

    #[tokio::test]
    async fn http_error_status_yields_upstream_error() {
        let (listener, port) = mock_listener().await;
        let controller = Controller::new(Session::new("schema"));
        let transport = transport_for(port, controller);

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let err = transport
            .stream_completion("sid", "SELECT", 256, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::CopilotError::Upstream(_)));
        server.await.unwrap();
    }
}
