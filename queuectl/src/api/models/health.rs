use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::storage::QueueStats;

/// Capabilities advertised by `/health`.
pub const FEATURES: &[&str] = &["sse_queue_position_comments"];

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RootResponse {
    pub name: String,
    pub status: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    /// Where generations are sent
    pub backend_url: String,
    pub queue_size: usize,
    pub stats: QueueStats,
    pub version: String,
    pub features: Vec<String>,
}
