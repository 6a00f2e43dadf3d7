//! Commit context: the commit id plus cross-cutting commit headers.

use uuid::Uuid;

use crate::event::Headers;

/// Metadata for one commit of a unit of work.
///
/// The `commit_id` seeds every event id written by the commit (see
/// [`event_id`](crate::event_id)); reusing the same context to retry a
/// commit reproduces the same ids, which the store reports as a duplicate.
///
/// # Examples
///
/// ```
/// use eventfold_uow::CommitContext;
///
/// let ctx = CommitContext::new()
///     .with_actor("user-42")
///     .with_correlation_id("req-abc-123")
///     .with_header("Source", "api");
///
/// let headers = ctx.commit_headers();
/// assert_eq!(headers["Actor"], "user-42");
/// assert_eq!(headers["CorrelationId"], "req-abc-123");
/// assert_eq!(headers["Source"], "api");
/// ```
#[derive(Debug, Clone)]
pub struct CommitContext {
    /// Seed for the event ids of this commit.
    pub commit_id: Uuid,
    /// Identity of whoever issued the unit of work.
    pub actor: Option<String>,
    /// Correlation id for tracing a request across entities.
    pub correlation_id: Option<String>,
    /// Arbitrary commit headers.
    pub headers: Headers,
}

impl Default for CommitContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitContext {
    /// Fresh context with a random commit id.
    pub fn new() -> Self {
        Self::with_commit_id(Uuid::new_v4())
    }

    /// Context with a caller-chosen commit id, e.g. the id of the inbound
    /// message so redelivery is detected as a duplicate commit.
    pub fn with_commit_id(commit_id: Uuid) -> Self {
        Self {
            commit_id,
            actor: None,
            correlation_id: None,
            headers: Headers::new(),
        }
    }

    /// Set the actor identity.
    ///
    /// # Arguments
    ///
    /// * `actor` - Any value convertible to `String` identifying who issued
    ///   the unit of work (e.g. a user ID or service name).
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Add one commit header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// All commit headers, including the commit id, actor and correlation id.
    pub fn commit_headers(&self) -> Headers {
        let mut out = self.headers.clone();
        out.insert("CommitId".into(), self.commit_id.to_string());
        if let Some(actor) = &self.actor {
            out.insert("Actor".into(), actor.clone());
        }
        if let Some(id) = &self.correlation_id {
            out.insert("CorrelationId".into(), id.clone());
        }
        out
    }
}
