//! In-process reference to a live sandbox.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::provider::{RemoteSandbox, VolumeRef};
use crate::provisioner::Language;

/// A ready sandbox bound to a session's volume.
///
/// Cloning is cheap; every clone refers to the same provider sandbox.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub session_id: String,
    pub sandbox: Arc<dyn RemoteSandbox>,
    pub volume: VolumeRef,
    pub image: String,
    pub language: Language,
    pub created_at: DateTime<Utc>,
    pub terminal_url: Option<String>,
}

impl SandboxHandle {
    pub fn id(&self) -> &str {
        self.sandbox.id()
    }

    pub fn workspace_root(&self) -> &str {
        self.sandbox.workspace_root()
    }

    pub fn summary(&self) -> HandleSummary {
        HandleSummary {
            session_id: self.session_id.clone(),
            sandbox_id: self.id().to_string(),
            volume: self.volume.name.clone(),
            image: self.image.clone(),
            language: self.language,
            workspace_root: self.workspace_root().to_string(),
            created_at: self.created_at,
            terminal_url: self.terminal_url.clone(),
            status: "ready",
        }
    }
}

/// Serializable view of a handle.
#[derive(Debug, Clone, Serialize)]
pub struct HandleSummary {
    pub session_id: String,
    pub sandbox_id: String,
    pub volume: String,
    pub image: String,
    pub language: Language,
    pub workspace_root: String,
    pub created_at: DateTime<Utc>,
    pub terminal_url: Option<String>,
    pub status: &'static str,
}
