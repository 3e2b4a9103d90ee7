//! Read-only readiness report for operators.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bootstrap::CredentialProvider;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub elevated_configured: bool,
    pub profile_count: Option<i64>,
    pub procedures_installed: Option<bool>,
    pub errors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl StatusReport {
    pub fn is_ready(&self) -> bool {
        self.elevated_configured && self.errors.is_empty() && self.procedures_installed == Some(true)
    }
}

/// Probe the store through the elevated credential. Never writes.
pub async fn collect_status(provider: &CredentialProvider) -> StatusReport {
    let mut report = StatusReport {
        elevated_configured: false,
        profile_count: None,
        procedures_installed: None,
        errors: Vec::new(),
        timestamp: Utc::now(),
    };

    let Some(elevated) = provider.elevated() else {
        return report;
    };
    report.elevated_configured = true;

    match elevated.profiles().count_profiles().await {
        Ok(count) => report.profile_count = Some(count),
        Err(e) => report.errors.push(format!("profiles: {}", e)),
    }
    match elevated.procedures().installed().await {
        Ok(installed) => report.procedures_installed = Some(installed),
        Err(e) => report.errors.push(format!("procedures: {}", e)),
    }

    report
}
