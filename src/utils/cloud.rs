//! Cloud metadata probe for the local availability zone.
//!
//! Every supported provider exposes a link-local metadata endpoint that
//! returns the zone identifier as a plain string. The probe is best-effort
//! with a very tight timeout: on a developer laptop the address is
//! unroutable and the resolver should not stall startup waiting on it.

use std::time::Duration;
use tracing::warn;

pub const API_AWS_META_DATA: &str =
    "http://169.254.169.254/latest/meta-data/placement/availability-zone";
pub const API_ALIYUN_META_DATA: &str = "http://100.100.100.200/latest/meta-data/zone-id";
pub const API_HUAWEI_META_DATA: &str =
    "http://169.254.169.254/latest/meta-data/placement/availability-zone";

pub const UNKNOWN_ZONE: &str = "unknown";

const PROBE_TIMEOUT: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudProvider {
    Aws,
    Aliyun,
    Huawei,
}

impl CloudProvider {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aws" => Some(Self::Aws),
            "aliyun" => Some(Self::Aliyun),
            "huawei" => Some(Self::Huawei),
            _ => None,
        }
    }

    pub fn metadata_url(self) -> &'static str {
        match self {
            Self::Aws => API_AWS_META_DATA,
            Self::Aliyun => API_ALIYUN_META_DATA,
            Self::Huawei => API_HUAWEI_META_DATA,
        }
    }
}

/// Fetches the local availability zone from the provider's metadata service.
/// Falls back to [`UNKNOWN_ZONE`] on any failure.
pub async fn probe_zone(provider: CloudProvider) -> String {
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "metadata probe client build failed");
            return UNKNOWN_ZONE.to_string();
        }
    };

    match client.get(provider.metadata_url()).send().await {
        Ok(resp) if resp.status().is_success() => match resp.text().await {
            Ok(zone) if !zone.trim().is_empty() => zone.trim().to_string(),
            _ => UNKNOWN_ZONE.to_string(),
        },
        Ok(resp) => {
            warn!(status = %resp.status(), "metadata probe returned non-success status");
            UNKNOWN_ZONE.to_string()
        }
        Err(e) => {
            warn!(error = %e, "metadata probe failed");
            UNKNOWN_ZONE.to_string()
        }
    }
}
