//! Per-keystroke state machine. All state here is guarded by one mutex, with
//! the generation counter as the only other cross-thread primitive (an
//! atomic, plus the condvar the worker sleeps on).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::session::Session;

/// Kept as a parameter rather than a literal so it can be tuned without
/// touching the state machine; callers that don't care can use the default.
pub const DEFAULT_PRIME_THRESHOLD: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Prime,
    Completion,
    /// The input changed but the line is already primed and still at or
    /// below the prime threshold: the generation bumps to tear down any
    /// in-flight request, but no new request is issued.
    Cancel,
}

/// Bounded input buffer size (40 KiB). Lines longer than this are truncated
/// rather than rejected — a pathological single line is not worth failing
/// the keystroke handler for.
pub const MAX_INPUT_BYTES: usize = 40 * 1024;

struct Inner {
    input: String,
    text: String,
    written_marker: usize,
    mode: RequestMode,
    session: Session,
}

/// Shared, mutex-guarded controller state plus the cross-thread primitives
/// the Transport Worker waits on.
pub struct Controller {
    inner: Mutex<Inner>,
    generation: AtomicU64,
    condvar: Condvar,
    /// Serializes access to `condvar.wait` against `inner`; parking_lot's
    /// `Condvar::wait` takes the same `Mutex` guard it sleeps under, so the
    /// worker parks on this lock, not `inner`.
    wake_lock: Mutex<()>,
}

/// A snapshot of the request the Worker should issue, taken atomically under
/// the controller mutex.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub session_id: String,
    pub prompt: String,
    pub mode: RequestMode,
    pub generation: u64,
}

impl Controller {
    pub fn new(session: Session) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                input: String::new(),
                text: String::new(),
                written_marker: 0,
                mode: RequestMode::Prime,
                session,
            }),
            generation: AtomicU64::new(0),
            condvar: Condvar::new(),
            wake_lock: Mutex::new(()),
        })
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump_generation(&self) -> u64 {
        let g = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = self.wake_lock.lock();
        self.condvar.notify_one();
        g
    }

    /// Block the calling (worker) thread until the generation changes from
    /// `last_seen`, or return immediately if it already has.
    pub fn wait_for_generation(&self, last_seen: u64) -> u64 {
        let mut guard = self.wake_lock.lock();
        loop {
            let current = self.current_generation();
            if current != last_seen {
                return current;
            }
            self.condvar.wait(&mut guard);
        }
    }

    /// `on_event(current_line, cursor_end)` — invoked by the editor on every
    /// input event. Returns `true` if the editor should force a redraw.
    pub fn on_event(&self, current_line: &str, cursor_end: usize, prime_threshold: usize) -> bool {
        if is_slash_command(current_line) {
            return false;
        }

        let current_line = if current_line.len() > MAX_INPUT_BYTES {
            &current_line[..floor_char_boundary(current_line, MAX_INPUT_BYTES)]
        } else {
            current_line
        };

        let mut needs_bump = false;
        {
            let mut inner = self.inner.lock();

            if inner.input != current_line {
                inner.input = current_line.to_string();
                inner.text.clear();
                inner.written_marker = 0;

                let should_prime = !inner.session.is_primed() || cursor_end > prime_threshold;
                if should_prime {
                    inner.session.mark_primed();
                    inner.mode = RequestMode::Prime;
                } else {
                    // Already primed, still within the threshold: tear down
                    // any in-flight request without issuing a new one.
                    inner.mode = RequestMode::Cancel;
                }
                needs_bump = true;
            } else if inner.mode == RequestMode::Prime && cursor_end > prime_threshold {
                inner.mode = RequestMode::Completion;
                needs_bump = true;
            }
        }
        if needs_bump {
            self.bump_generation();
        }

        let mut inner = self.inner.lock();
        if inner.text.len() != inner.written_marker {
            inner.written_marker = inner.text.len();
            true
        } else {
            false
        }
    }

    /// `on_token(token, stop, error, cancel)` — called by the Worker via the
    /// SSE decoder's callback. `generation` is the generation the token was
    /// produced under; tokens from a stale generation are silently dropped.
    pub fn on_token(&self, generation: u64, token: Option<&str>) {
        if generation != self.current_generation() {
            return;
        }
        if let Some(token) = token {
            let mut inner = self.inner.lock();
            if inner.text.len() + token.len() <= MAX_INPUT_BYTES {
                inner.text.push_str(token);
            }
        }
    }

    /// `get_request()` — consistent snapshot for the Worker, with the prompt
    /// JSON-escaped on the way out.
    pub fn get_request(&self) -> RequestSnapshot {
        let inner = self.inner.lock();
        RequestSnapshot {
            session_id: inner.session.session_id().to_string(),
            prompt: json_escape(&inner.input),
            mode: inner.mode,
            generation: self.current_generation(),
        }
    }

    /// `accept()` — splice the suggestion into the input at the cursor and
    /// clear it. Does not bump the generation: acceptance is a local edit,
    /// not a new server intent.
    pub fn accept(&self, cursor: usize) -> String {
        let mut inner = self.inner.lock();
        let suggestion = std::mem::take(&mut inner.text);
        inner.written_marker = 0;
        let at = cursor.min(inner.input.len());
        inner.input.insert_str(at, &suggestion);
        inner.input.clone()
    }

    pub fn suggestion(&self) -> String {
        self.inner.lock().text.clone()
    }

    pub fn schema_digest(&self) -> String {
        self.inner.lock().session.schema_digest().to_string()
    }

    /// Rebuild the session on schema refresh (new session id, un-primed).
    pub fn refresh_schema(&self, schema_digest: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.session.refresh(schema_digest);
        inner.input.clear();
        inner.text.clear();
        inner.written_marker = 0;
        inner.mode = RequestMode::Prime;
    }
}

fn is_slash_command(line: &str) -> bool {
    line.trim_start().starts_with('\\')
}

/// Largest byte index `<= index` that lands on a UTF-8 char boundary, so
/// truncating a `&str` there can never panic. `str::floor_char_boundary` is
/// nightly-only, so this is hand-rolled.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut idx = index;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Standard JSON-string escaping (`\b \f \n \r \t \" \\` and `\u00XX` for
/// other controls below space). The surrounding quotes `serde_json` adds
/// are stripped since callers splice this into a larger hand-built JSON body.
fn json_escape(s: &str) -> String {
    let quoted = serde_json::to_string(s).expect("string serialization cannot fail");
    quoted[1..quoted.len() - 1].to_string()
}
