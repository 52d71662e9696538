use rand::RngCore;

/// A per-process entity created at prompt start and rebuilt on schema refresh.
///
/// `session_id` and `schema_digest` are stable for the life of a session; a
/// new `session_id` implies `primed = false`.
#[derive(Clone, Debug)]
pub struct Session {
    session_id: String,
    schema_digest: String,
    /// True iff the server has been told about this session's schema via the
    /// keystroke-driven prime cycle and a completion has been attempted once.
    primed: bool,
    /// True iff the dedicated `/v1/sql/session` prime call has already been
    /// made for the current `schema_digest`.
    schema_pushed: bool,
}

impl Session {
    /// Build a new session for a freshly fetched schema. Generates a new
    /// 128-bit session id from a cryptographic RNG, hex-encoded.
    pub fn new(schema_digest: impl Into<String>) -> Self {
        Self {
            session_id: generate_session_id(),
            schema_digest: schema_digest.into(),
            primed: false,
            schema_pushed: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn schema_digest(&self) -> &str {
        &self.schema_digest
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }

    pub fn mark_primed(&mut self) {
        self.primed = true;
    }

    pub fn schema_pushed(&self) -> bool {
        self.schema_pushed
    }

    pub fn mark_schema_pushed(&mut self) {
        self.schema_pushed = true;
    }

    /// Rebuild this session in place for a new schema snapshot: new session
    /// id, `primed` reset to false, and the schema-push flag cleared so the
    /// dedicated session-priming call fires again.
    pub fn refresh(&mut self, schema_digest: impl Into<String>) {
        self.session_id = generate_session_id();
        self.schema_digest = schema_digest.into();
        self.primed = false;
        self.schema_pushed = false;
    }
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_unprimed() {
        let s = Session::new("CREATE TABLE t (id int);");
        assert!(!s.is_primed());
        assert!(!s.schema_pushed());
        assert_eq!(s.session_id().len(), 32);
        assert!(s.session_id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn refresh_resets_primed_and_changes_id() {
        let mut s = Session::new("schema a");
        s.mark_primed();
        s.mark_schema_pushed();
        let old_id = s.session_id().to_string();

        s.refresh("schema b");

        assert!(!s.is_primed());
        assert!(!s.schema_pushed());
        assert_eq!(s.schema_digest(), "schema b");
        assert_ne!(s.session_id(), old_id);
    }

    #[test]
    fn session_ids_are_unique() {
        let a = Session::new("x");
        let b = Session::new("x");
        assert_ne!(a.session_id(), b.session_id());
    }
}
