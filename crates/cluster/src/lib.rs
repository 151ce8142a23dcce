//! Cluster identity: which cloud the agent runs on and the stable id of the
//! cluster it watches. Providers are probed in order; the first one that
//! detects its environment resolves the id.
#![forbid(unsafe_code)]

mod gcp;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

pub use gcp::{region_from_zone, GcpProvider, GCP_METADATA_BASE};

/// Default timeout for a single metadata request.
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Unknown,
    Gcp,
}

impl CloudProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::Unknown => "unknown",
            CloudProvider::Gcp => "gcp",
        }
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterInfo {
    pub cluster_id: String,
    pub cluster_name: String,
    pub provider: CloudProvider,
    pub region: String,
    pub project_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("no cloud provider detected")]
    NoProviderDetected,
    #[error("building metadata client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("metadata request for {path} failed: {source}")]
    Request { path: String, source: reqwest::Error },
    #[error("metadata request for {path} returned {status}")]
    Status { path: String, status: u16 },
    #[error("metadata value {path} is empty")]
    Empty { path: String },
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> CloudProvider;
    /// Cheap probe: is the agent running on this provider?
    async fn detect(&self) -> bool;
    async fn resolve(&self) -> Result<ClusterInfo, IdentityError>;
}

pub struct Resolver {
    providers: Vec<Arc<dyn Provider>>,
}

impl Resolver {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self { Self { providers } }

    /// All built-in providers with the default metadata timeout.
    pub fn with_defaults() -> Result<Self, IdentityError> {
        let gcp = GcpProvider::new(METADATA_TIMEOUT)?;
        Ok(Self::new(vec![Arc::new(gcp)]))
    }

    pub async fn resolve(&self) -> Result<ClusterInfo, IdentityError> {
        for provider in &self.providers {
            if provider.detect().await {
                let info = provider.resolve().await?;
                info!(provider = %info.provider, cluster_id = %info.cluster_id, region = %info.region, "cluster identity resolved");
                return Ok(info);
            }
            debug!(provider = %provider.name(), "provider not detected");
        }
        Err(IdentityError::NoProviderDetected)
    }

    pub async fn detect_provider(&self) -> CloudProvider {
        for provider in &self.providers {
            if provider.detect().await {
                return provider.name();
            }
        }
        CloudProvider::Unknown
    }
}
