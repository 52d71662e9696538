pub mod config;
pub mod controller;
pub mod error;
pub mod renderer;
pub mod session;
pub mod sse;
pub mod transport;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use controller::Controller;
use session::Session;
use transport::Transport;

/// Ties the Controller, Worker, and Renderer together for a single
/// completion session. This is the facade a line-editor integration drives:
/// feed it keystrokes via [`Engine::on_event`], paint via
/// [`Engine::redraw`], and splice via [`Engine::accept`].
pub struct Engine {
    controller: Arc<Controller>,
    transport: Arc<Transport>,
    renderer: renderer::GhostRenderer,
    worker_shutdown: Arc<AtomicBool>,
    prime_threshold: usize,
}

impl Engine {
    /// Build the engine and spawn its background Transport Worker thread.
    pub fn start(config: config::Config, schema_digest: impl Into<String>) -> Self {
        let controller = Controller::new(Session::new(schema_digest));
        let worker_shutdown = Transport::spawn(controller.clone(), config.clone());
        let transport = Arc::new(Transport::new_unattached(controller.clone(), config));
        Self {
            controller,
            transport,
            renderer: renderer::GhostRenderer::new(),
            worker_shutdown,
            prime_threshold: controller::DEFAULT_PRIME_THRESHOLD,
        }
    }

    /// Override the default prime threshold (5 characters).
    pub fn with_prime_threshold(mut self, threshold: usize) -> Self {
        self.prime_threshold = threshold;
        self
    }

    /// Drive the Completion Controller's `on_event`. Returns `true` if the
    /// caller should now invoke [`Engine::redraw`].
    pub fn on_event(&self, current_line: &str, cursor_end: usize) -> bool {
        self.controller
            .on_event(current_line, cursor_end, self.prime_threshold)
    }

    /// Paint the ghost-text overlay. `native_redisplay` is the editor's own,
    /// unmodified redraw routine.
    pub fn redraw(&mut self, native_redisplay: impl FnMut()) -> Result<(), error::CopilotError> {
        let suggestion = self.controller.suggestion();
        self.renderer.redraw(&suggestion, native_redisplay)
    }

    /// Splice the current suggestion into the input line at `cursor`,
    /// returning the resulting line.
    pub fn accept(&self, cursor: usize) -> String {
        self.controller.accept(cursor)
    }

    /// Rebuild the session for a freshly fetched schema and push it to the
    /// server via the dedicated session endpoint, independent of the
    /// keystroke-driven prime cycle.
    pub async fn refresh_schema(
        &self,
        schema_digest: impl Into<String>,
    ) -> Result<(), error::CopilotError> {
        let digest = schema_digest.into();
        self.controller.refresh_schema(digest.clone());
        let session_id = self.controller.get_request().session_id;
        self.transport.push_session(&session_id, &digest).await
    }

    /// Blocking chat call, sharing transport code with completion but with
    /// no scheduling or rendering of its own.
    pub async fn chat(&self, query: &str) -> Result<String, error::CopilotError> {
        let session_id = self.controller.get_request().session_id;
        self.transport.chat(&session_id, query).await
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.worker_shutdown
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}
