use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::{CloudProvider, ClusterInfo, IdentityError, Provider};

pub const GCP_METADATA_BASE: &str = "http://metadata.google.internal/computeMetadata/v1";
const FLAVOR_HEADER: &str = "Metadata-Flavor";
const FLAVOR: &str = "Google";

/// GKE identity from the instance metadata server.
pub struct GcpProvider {
    http: reqwest::Client,
    base: String,
}

impl GcpProvider {
    pub fn new(timeout: Duration) -> Result<Self, IdentityError> {
        let http = reqwest::Client::builder().timeout(timeout).build().map_err(IdentityError::Client)?;
        Ok(Self { http, base: GCP_METADATA_BASE.to_string() })
    }

    /// Point at a different metadata server.
    pub fn with_base_url(mut self, base: &str) -> Self {
        self.base = base.trim_end_matches('/').to_string();
        self
    }

    async fn metadata(&self, path: &str) -> Result<String, IdentityError> {
        let resp = self
            .http
            .get(format!("{}{path}", self.base))
            .header(FLAVOR_HEADER, FLAVOR)
            .send()
            .await
            .map_err(|source| IdentityError::Request { path: path.to_string(), source })?;
        if !resp.status().is_success() {
            return Err(IdentityError::Status { path: path.to_string(), status: resp.status().as_u16() });
        }
        let body = resp.text().await.map_err(|source| IdentityError::Request { path: path.to_string(), source })?;
        let value = body.trim();
        if value.is_empty() {
            return Err(IdentityError::Empty { path: path.to_string() });
        }
        Ok(value.to_string())
    }
}

#[async_trait]
impl Provider for GcpProvider {
    fn name(&self) -> CloudProvider { CloudProvider::Gcp }

    async fn detect(&self) -> bool {
        let resp = self.http.get(format!("{}/", self.base)).header(FLAVOR_HEADER, FLAVOR).send().await;
        match resp {
            Ok(r) => {
                r.status().is_success()
                    && r.headers().get(FLAVOR_HEADER).and_then(|v| v.to_str().ok()) == Some(FLAVOR)
            }
            Err(e) => {
                debug!(error = %e, "gcp metadata server unreachable");
                false
            }
        }
    }

    async fn resolve(&self) -> Result<ClusterInfo, IdentityError> {
        let cluster_name = self.metadata("/instance/attributes/cluster-name").await?;
        let project_id = self.metadata("/project/project-id").await?;
        // projects/<number>/zones/<zone>
        let zone = self.metadata("/instance/zone").await?;
        let zone = zone.rsplit('/').next().unwrap_or(&zone);
        let region = region_from_zone(zone).to_string();
        Ok(ClusterInfo {
            cluster_id: format!("gcp/{project_id}/{region}/{cluster_name}"),
            cluster_name,
            provider: CloudProvider::Gcp,
            region,
            project_id,
        })
    }
}

/// `us-central1-a` -> `us-central1`; a zone without a dash is returned as is.
pub fn region_from_zone(zone: &str) -> &str {
    match zone.rfind('-') {
        Some(i) => &zone[..i],
        None => zone,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions() {
        assert_eq!(region_from_zone("us-central1-a"), "us-central1");
        assert_eq!(region_from_zone("europe-west4-b"), "europe-west4");
        assert_eq!(region_from_zone("local"), "local");
    }
}
