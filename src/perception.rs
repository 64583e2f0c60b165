//! Readiness wait, capture and hashing of the active page.

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::{AgentError, PerceptionError};
use crate::surface::{ActiveSurface, PageSurface, Readiness};
use crate::types::{Snapshot, Viewport};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a. Only used to tell whether two captures differ.
pub fn content_hash(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

pub struct PerceptionSource {
    surfaces: ActiveSurface,
    poll_interval: Duration,
    timeout: Duration,
}

impl PerceptionSource {
    pub fn new(surfaces: ActiveSurface, config: &AgentConfig) -> Self {
        Self {
            surfaces,
            poll_interval: config.readiness_poll(),
            timeout: config.readiness_timeout(),
        }
    }

    pub fn surfaces(&self) -> &ActiveSurface {
        &self.surfaces
    }

    /// Wait for the active surface to settle, then rasterize and hash it.
    pub async fn capture(&self, cancel: &CancellationToken) -> Result<Snapshot, AgentError> {
        let surface = self
            .surfaces
            .current()
            .ok_or(PerceptionError::SurfaceUnavailable)?;

        let readiness = self.wait_until_ready(surface.as_ref(), cancel).await?;

        let bytes = surface
            .capture()
            .await
            .map_err(|e| PerceptionError::Capture(format!("{e:#}")))?;
        if bytes.is_empty() {
            return Err(PerceptionError::Encode("capture produced no image data".to_string()).into());
        }

        Ok(Snapshot {
            encoded_image: BASE64.encode(&bytes),
            viewport: Viewport::new(readiness.width, readiness.height),
            content_hash: content_hash(&bytes),
        })
    }

    async fn wait_until_ready(
        &self,
        surface: &dyn PageSurface,
        cancel: &CancellationToken,
    ) -> Result<Readiness, AgentError> {
        let deadline = Instant::now() + self.timeout;
        let mut last: Option<Readiness> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            match surface.readiness().await {
                Ok(state) if state.is_ready() => return Ok(state),
                Ok(state) => {
                    tracing::debug!(
                        "surface not ready: {}x{} loading={} state={}",
                        state.width,
                        state.height,
                        state.is_loading,
                        state.ready_state
                    );
                    last = Some(state);
                }
                Err(e) => tracing::debug!("readiness probe failed: {e:#}"),
            }

            if Instant::now() >= deadline {
                return Err(not_ready_error(last).into());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

fn not_ready_error(last: Option<Readiness>) -> PerceptionError {
    match last {
        Some(state) if !state.is_laid_out() => PerceptionError::NotLaidOut {
            width: state.width,
            height: state.height,
        },
        Some(state) if state.is_loading => PerceptionError::StillLoading { url: state.url },
        Some(state) => PerceptionError::NotReady {
            url: state.url,
            ready_state: state.ready_state,
        },
        None => PerceptionError::NotReady {
            url: "unknown".to_string(),
            ready_state: "unreported".to_string(),
        },
    }
}
