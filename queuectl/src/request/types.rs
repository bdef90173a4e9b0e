//! Core types for the request lifecycle.
//!
//! This module defines the type-safe request lifecycle using the typestate pattern.
//! Each request progresses through distinct states, enforced at compile time:
//!
//! ```text
//! Queued ──start──▶ Processing ──complete──▶ Complete
//!                              └──fail─────▶ Failed
//! ```
//!
//! `Complete` and `Failed` are terminal. There is no way back out of them, and a terminal request
//! carries exactly one of a result or an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::TokenUsage;
use crate::request::GenerationRequest;
use crate::types::{ClientTag, RequestId};

/// Marker trait for valid request states.
pub trait RequestState: Send + Sync {}

/// A request admitted into the queue, parameterised by its current lifecycle state.
#[derive(Debug, Clone)]
pub struct Request<T: RequestState> {
    /// The current state of the request.
    pub state: T,
    /// Admission data, immutable for the lifetime of the request.
    pub data: RequestData,
}

/// Everything fixed at admission time.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestData {
    pub id: RequestId,
    pub client_tag: ClientTag,
    pub payload: GenerationRequest,
    /// 1-based position among queued requests at the moment of admission
    pub entry_position: usize,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Request States
// ============================================================================

/// Waiting in the admission queue. The initial state of every request.
#[derive(Debug, Clone)]
pub struct Queued {}

impl RequestState for Queued {}

/// Popped by the worker; the backend generation is in flight.
#[derive(Debug, Clone)]
pub struct Processing {
    pub started_at: DateTime<Utc>,
}

impl RequestState for Processing {}

/// The backend produced a full answer.
#[derive(Debug, Clone)]
pub struct Complete {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub result: String,
    pub usage: Option<TokenUsage>,
}

impl RequestState for Complete {}

/// The generation failed. Partial output already streamed is not retained here.
#[derive(Debug, Clone)]
pub struct Failed {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error: String,
}

impl RequestState for Failed {}

// ============================================================================
// Unified Request Representation
// ============================================================================

/// Enum that can hold a request in any state.
///
/// This is what the store keeps; typed requests are taken out of it for transitions and put back.
#[derive(Debug, Clone)]
pub enum AnyRequest {
    Queued(Request<Queued>),
    Processing(Request<Processing>),
    Complete(Request<Complete>),
    Failed(Request<Failed>),
}

impl AnyRequest {
    pub fn data(&self) -> &RequestData {
        match self {
            AnyRequest::Queued(r) => &r.data,
            AnyRequest::Processing(r) => &r.data,
            AnyRequest::Complete(r) => &r.data,
            AnyRequest::Failed(r) => &r.data,
        }
    }

    pub fn status(&self) -> RequestStatus {
        match self {
            AnyRequest::Queued(_) => RequestStatus::Queued,
            AnyRequest::Processing(_) => RequestStatus::Processing,
            AnyRequest::Complete(_) => RequestStatus::Complete,
            AnyRequest::Failed(_) => RequestStatus::Error,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, AnyRequest::Queued(_))
    }

    /// Check if this request is in a terminal state (Complete or Failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnyRequest::Complete(_) | AnyRequest::Failed(_))
    }

    /// Try to take as a Queued request, consuming self.
    pub fn into_queued(self) -> Option<Request<Queued>> {
        match self {
            AnyRequest::Queued(r) => Some(r),
            _ => None,
        }
    }
}

impl From<Request<Queued>> for AnyRequest {
    fn from(r: Request<Queued>) -> Self {
        AnyRequest::Queued(r)
    }
}

impl From<Request<Processing>> for AnyRequest {
    fn from(r: Request<Processing>) -> Self {
        AnyRequest::Processing(r)
    }
}

impl From<Request<Complete>> for AnyRequest {
    fn from(r: Request<Complete>) -> Self {
        AnyRequest::Complete(r)
    }
}

impl From<Request<Failed>> for AnyRequest {
    fn from(r: Request<Failed>) -> Self {
        AnyRequest::Failed(r)
    }
}

/// Lifecycle status as exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Processing,
    Complete,
    Error,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Complete | RequestStatus::Error)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Processing => "processing",
            RequestStatus::Complete => "complete",
            RequestStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A point-in-time, immutable copy of a request's lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestRecord {
    pub id: RequestId,
    pub status: RequestStatus,
    pub client_tag: ClientTag,
    pub payload: GenerationRequest,
    pub entry_position: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl From<&AnyRequest> for RequestRecord {
    fn from(request: &AnyRequest) -> Self {
        let data = request.data().clone();
        let mut record = RequestRecord {
            id: data.id,
            status: request.status(),
            client_tag: data.client_tag,
            payload: data.payload,
            entry_position: data.entry_position,
            created_at: data.created_at,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            usage: None,
        };

        match request {
            AnyRequest::Queued(_) => {}
            AnyRequest::Processing(r) => {
                record.started_at = Some(r.state.started_at);
            }
            AnyRequest::Complete(r) => {
                record.started_at = Some(r.state.started_at);
                record.completed_at = Some(r.state.completed_at);
                record.result = Some(r.state.result.clone());
                record.usage = r.state.usage;
            }
            AnyRequest::Failed(r) => {
                record.started_at = Some(r.state.started_at);
                record.completed_at = Some(r.state.completed_at);
                record.error = Some(r.state.error.clone());
            }
        }

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ChatMessage;

    fn sample_data() -> RequestData {
        RequestData {
            id: RequestId::new(),
            client_tag: ClientTag::new("tests"),
            payload: GenerationRequest::new("test-model", vec![ChatMessage::new("user", "hi")]),
            entry_position: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_terminal() {
        let data = sample_data();
        let now = Utc::now();

        let queued: AnyRequest = Request { state: Queued {}, data: data.clone() }.into();
        let processing: AnyRequest = Request {
            state: Processing { started_at: now },
            data: data.clone(),
        }
        .into();
        let complete: AnyRequest = Request {
            state: Complete {
                started_at: now,
                completed_at: now,
                result: "hello".into(),
                usage: None,
            },
            data: data.clone(),
        }
        .into();
        let failed: AnyRequest = Request {
            state: Failed {
                started_at: now,
                completed_at: now,
                error: "boom".into(),
            },
            data,
        }
        .into();

        assert!(!queued.is_terminal());
        assert!(!processing.is_terminal());
        assert!(complete.is_terminal());
        assert!(failed.is_terminal());
        assert_eq!(failed.status(), RequestStatus::Error);
    }

    #[test]
    fn test_record_exclusivity() {
        let data = sample_data();
        let now = Utc::now();

        let queued = RequestRecord::from(&AnyRequest::from(Request { state: Queued {}, data: data.clone() }));
        assert!(queued.result.is_none() && queued.error.is_none() && queued.started_at.is_none());

        let complete = RequestRecord::from(&AnyRequest::from(Request {
            state: Complete {
                started_at: now,
                completed_at: now,
                result: "hello".into(),
                usage: None,
            },
            data: data.clone(),
        }));
        assert_eq!(complete.result.as_deref(), Some("hello"));
        assert!(complete.error.is_none());

        let failed = RequestRecord::from(&AnyRequest::from(Request {
            state: Failed {
                started_at: now,
                completed_at: now,
                error: "boom".into(),
            },
            data,
        }));
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.result.is_none());
        assert!(failed.completed_at.is_some());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_value(RequestStatus::Queued).unwrap(), "queued");
        assert_eq!(serde_json::to_value(RequestStatus::Error).unwrap(), "error");
        assert_eq!(RequestStatus::Processing.to_string(), "processing");
    }
}
