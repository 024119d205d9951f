use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ControllerError;

/// Request body for running a new job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(rename = "releaseID")]
    pub release_id: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub tty: bool,
    /// Terminal rows for interactive sessions.
    #[serde(default)]
    pub lines: u16,
    /// Terminal columns for interactive sessions.
    #[serde(default)]
    pub columns: u16,
}

/// Job as reported to API clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    #[serde(rename = "releaseID")]
    pub release_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
}

/// Cluster-wide job identity: `<hostID>-<localJobID>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeJobId {
    pub host_id: String,
    pub job_id: String,
}

impl CompositeJobId {
    pub fn new(host_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            job_id: job_id.into(),
        }
    }

    /// Split on the first `-`. Both halves must be non-empty.
    pub fn parse(id: &str) -> Result<Self, ControllerError> {
        match id.split_once('-') {
            Some((host_id, job_id)) if !host_id.is_empty() && !job_id.is_empty() => {
                Ok(Self::new(host_id, job_id))
            }
            _ => {
                tracing::info!(id, "Unable to parse host ID from job ID");
                Err(ControllerError::NotFound(format!("job {}", id)))
            }
        }
    }
}

impl std::fmt::Display for CompositeJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.host_id, self.job_id)
    }
}

/// Fresh host-local job ID. Hex only, so it never contains the separator.
pub fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Overlay `overrides` on `base` and render as sorted `KEY=value` pairs.
pub fn format_env(
    base: &BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut merged = base.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_first_separator() {
        let id = CompositeJobId::parse("host1-abc").unwrap();
        assert_eq!(id.host_id, "host1");
        assert_eq!(id.job_id, "abc");

        let id = CompositeJobId::parse("h-job-with-dashes").unwrap();
        assert_eq!(id.host_id, "h");
        assert_eq!(id.job_id, "job-with-dashes");
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        for bad in ["badid", "", "-", "-job", "host-"] {
            let err = CompositeJobId::parse(bad).unwrap_err();
            assert!(matches!(err, ControllerError::NotFound(_)), "{bad}");
        }
    }

    #[test]
    fn display_round_trips() {
        let id = CompositeJobId::new("h1", "0123abcd");
        assert_eq!(id.to_string(), "h1-0123abcd");
        assert_eq!(CompositeJobId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn job_ids_are_unique_and_dashless() {
        let a = new_job_id();
        let b = new_job_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(!a.contains('-'));
    }

    #[test]
    fn env_overrides_win() {
        let base = BTreeMap::from([
            ("PORT".to_string(), "80".to_string()),
            ("MODE".to_string(), "prod".to_string()),
        ]);
        let overrides = BTreeMap::from([("PORT".to_string(), "8080".to_string())]);
        assert_eq!(format_env(&base, &overrides), vec!["MODE=prod", "PORT=8080"]);
    }

    #[test]
    fn summary_json_shape() {
        let summary = JobSummary {
            id: "h1-abc".into(),
            job_type: Some("web".into()),
            release_id: "rel".into(),
            cmd: None,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "h1-abc", "type": "web", "releaseID": "rel"})
        );
    }

    #[test]
    fn new_job_defaults() {
        let job: NewJob = serde_json::from_str(r#"{"releaseID": "r1"}"#).unwrap();
        assert_eq!(job.release_id, "r1");
        assert!(job.cmd.is_empty());
        assert!(job.env.is_empty());
        assert!(!job.tty);
        assert_eq!((job.lines, job.columns), (0, 0));
    }
}
