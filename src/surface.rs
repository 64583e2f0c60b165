//! Contract for the interactive page the agent drives.

use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Readiness signals reported by a page surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Readiness {
    pub width: f64,
    pub height: f64,
    pub is_loading: bool,
    pub ready_state: String,
    pub url: String,
}

impl Readiness {
    pub fn is_laid_out(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }

    pub fn is_ready(&self) -> bool {
        self.is_laid_out()
            && !self.is_loading
            && matches!(self.ready_state.as_str(), "complete" | "interactive")
    }
}

#[async_trait]
pub trait PageSurface: Send + Sync {
    async fn load(&self, url: &str) -> Result<()>;

    /// Run a script in the page and return its JSON-compatible value.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;

    /// Rasterize the visible page as PNG bytes.
    async fn capture(&self) -> Result<Vec<u8>>;

    async fn readiness(&self) -> Result<Readiness>;
}

/// Handle to whichever page surface is currently active.
///
/// Built once by the caller and shared with the controller; the embedding
/// application swaps the surface in and out as tabs come and go.
#[derive(Clone, Default)]
pub struct ActiveSurface {
    inner: Arc<RwLock<Option<Arc<dyn PageSurface>>>>,
}

impl ActiveSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(surface: Arc<dyn PageSurface>) -> Self {
        let active = Self::new();
        active.attach(surface);
        active
    }

    pub fn attach(&self, surface: Arc<dyn PageSurface>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Some(surface);
    }

    pub fn detach(&self) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn current(&self) -> Option<Arc<dyn PageSurface>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_attached(&self) -> bool {
        self.current().is_some()
    }
}
