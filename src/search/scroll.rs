use anyhow::Result;
use tracing::warn;

use super::{SearchBackend, SearchResponse};

/// Scoped scroll cursor.
///
/// Tracks the server-side cursor id across pages and releases it exactly
/// once. Callers must invoke `close` on every exit path; sessions are never
/// reused across days.
pub struct ScrollSession<'a, S: SearchBackend> {
    backend: &'a S,
    scroll_id: Option<String>,
}

impl<'a, S: SearchBackend> ScrollSession<'a, S> {
    pub fn new(backend: &'a S) -> Self {
        ScrollSession {
            backend,
            scroll_id: None,
        }
    }

    /// Records the cursor id carried by a response page.
    pub fn track(&mut self, response: &SearchResponse) {
        if let Some(id) = &response.scroll_id {
            self.scroll_id = Some(id.clone());
        }
    }

    /// Fetches the next page. Returns an empty page when no cursor is open.
    pub async fn next_page(&mut self) -> Result<SearchResponse> {
        let Some(id) = &self.scroll_id else {
            return Ok(SearchResponse::default());
        };
        let response = self.backend.scroll_continue(id).await?;
        self.track(&response);
        Ok(response)
    }

    /// Releases the cursor. Best-effort: a failure is logged, not surfaced,
    /// since the server expires cursors on its own after the keep-alive.
    pub async fn close(mut self) {
        if let Some(id) = self.scroll_id.take() {
            if let Err(err) = self.backend.scroll_close(&id).await {
                warn!(error = %err, "failed to close scroll cursor");
            }
        }
    }
}
