use chrono::Utc;

use crate::backend::Generation;
use crate::errors::Result;
use crate::storage::RequestStore;

use super::types::{Complete, Failed, Processing, Queued, Request};

impl Request<Queued> {
    /// Move a popped request into `Processing`.
    ///
    /// Only the store calls this, while it holds the queue lock, so the pop and the transition are
    /// observed together.
    pub(crate) fn start(self) -> Request<Processing> {
        Request {
            data: self.data,
            state: Processing {
                started_at: Utc::now(),
            },
        }
    }
}

impl Request<Processing> {
    pub fn complete(self, generation: Generation, store: &RequestStore) -> Result<Request<Complete>> {
        let request = Request {
            data: self.data,
            state: Complete {
                started_at: self.state.started_at,
                completed_at: Utc::now(),
                result: generation.text,
                usage: generation.usage,
            },
        };
        store.persist(&request)?;
        Ok(request)
    }

    pub fn fail(self, error: impl Into<String>, store: &RequestStore) -> Result<Request<Failed>> {
        let request = Request {
            data: self.data,
            state: Failed {
                started_at: self.state.started_at,
                completed_at: Utc::now(),
                error: error.into(),
            },
        };
        store.persist(&request)?;
        Ok(request)
    }
}
