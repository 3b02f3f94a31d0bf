//! Request context passed through every driver call

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub project_id: String,
    pub request_id: String,
    #[serde(default)]
    pub is_admin: bool,
}

impl RequestContext {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            request_id: format!("req-{}", Uuid::new_v4()),
            is_admin: false,
        }
    }

    /// Context used by background workers acting on behalf of the service.
    pub fn admin() -> Self {
        Self {
            project_id: String::new(),
            request_id: format!("req-{}", Uuid::new_v4()),
            is_admin: true,
        }
    }
}
