//! Typed job payloads.
//!
//! Each [`JobType`] owns exactly one parameter struct. Handlers match on
//! [`JobPayload`] instead of digging through an untyped metadata map; the
//! opaque JSON form only exists at the transport edge
//! ([`JobPayload::from_metadata`] / [`JobPayload::to_metadata`]).

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{JobError, JobResult};

/// Closed set of job kinds known to the handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    StudyCreation,
    DataExport,
    NotificationDispatch,
    /// Diagnostic job: returns its message, optionally after a delay.
    Echo,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::StudyCreation,
        JobType::DataExport,
        JobType::NotificationDispatch,
        JobType::Echo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::StudyCreation => "study_creation",
            JobType::DataExport => "data_export",
            JobType::NotificationDispatch => "notification_dispatch",
            JobType::Echo => "echo",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| JobError::unknown_type(s))
    }
}

/// Parameters for creating a study.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyCreationParams {
    pub study_name: String,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub participant_count: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    Json,
    Xlsx,
}

/// Parameters for exporting study data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataExportParams {
    pub study_id: String,
    pub format: ExportFormat,
    #[serde(default)]
    pub include_responses: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    #[default]
    Email,
    InApp,
}

/// Parameters for dispatching a notification to one or more recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationParams {
    pub recipients: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub channel: NotificationChannel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoParams {
    #[serde(default)]
    pub message: String,
    /// Simulated work time in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
}

impl EchoParams {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            delay_ms: 0,
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

/// Typed payload of a job, one variant per [`JobType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum JobPayload {
    StudyCreation(StudyCreationParams),
    DataExport(DataExportParams),
    NotificationDispatch(NotificationParams),
    Echo(EchoParams),
}

impl JobPayload {
    pub fn echo(message: impl Into<String>) -> Self {
        Self::Echo(EchoParams::new(message))
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::StudyCreation(_) => JobType::StudyCreation,
            JobPayload::DataExport(_) => JobType::DataExport,
            JobPayload::NotificationDispatch(_) => JobType::NotificationDispatch,
            JobPayload::Echo(_) => JobType::Echo,
        }
    }

    /// Structural checks that hold regardless of which handler is registered.
    pub fn validate(&self) -> JobResult<()> {
        match self {
            JobPayload::StudyCreation(p) => {
                let name = p.study_name.trim();
                if name.is_empty() {
                    return Err(JobError::validation("study_name must not be empty"));
                }
                if name.chars().count() > 200 {
                    return Err(JobError::validation("study_name exceeds 200 characters"));
                }
            }
            JobPayload::DataExport(p) => {
                if p.study_id.trim().is_empty() {
                    return Err(JobError::validation("study_id must not be empty"));
                }
            }
            JobPayload::NotificationDispatch(p) => {
                if p.recipients.is_empty() {
                    return Err(JobError::validation("at least one recipient is required"));
                }
                if p.recipients.iter().any(|r| r.trim().is_empty()) {
                    return Err(JobError::validation("recipients must not be blank"));
                }
                if p.subject.trim().is_empty() {
                    return Err(JobError::validation("subject must not be empty"));
                }
            }
            JobPayload::Echo(_) => {}
        }
        Ok(())
    }

    /// Parse the open metadata bag received at the transport edge.
    ///
    /// `null` is treated as an empty object so parameterless jobs can be
    /// created without metadata.
    pub fn from_metadata(job_type: JobType, metadata: JsonValue) -> JobResult<Self> {
        let metadata = match metadata {
            JsonValue::Null => JsonValue::Object(Default::default()),
            other => other,
        };

        let invalid =
            |e: serde_json::Error| JobError::validation(format!("invalid {job_type} metadata: {e}"));

        let payload = match job_type {
            JobType::StudyCreation => {
                JobPayload::StudyCreation(serde_json::from_value(metadata).map_err(invalid)?)
            }
            JobType::DataExport => {
                JobPayload::DataExport(serde_json::from_value(metadata).map_err(invalid)?)
            }
            JobType::NotificationDispatch => {
                JobPayload::NotificationDispatch(serde_json::from_value(metadata).map_err(invalid)?)
            }
            JobType::Echo => JobPayload::Echo(serde_json::from_value(metadata).map_err(invalid)?),
        };
        Ok(payload)
    }

    /// Render the parameters as an open JSON object.
    pub fn to_metadata(&self) -> JsonValue {
        let rendered = match self {
            JobPayload::StudyCreation(p) => serde_json::to_value(p),
            JobPayload::DataExport(p) => serde_json::to_value(p),
            JobPayload::NotificationDispatch(p) => serde_json::to_value(p),
            JobPayload::Echo(p) => serde_json::to_value(p),
        };
        rendered.unwrap_or(JsonValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_type_names_parse_back() {
        for t in JobType::ALL {
            assert_eq!(t.as_str().parse::<JobType>().unwrap(), t);
        }
        assert_eq!(
            "reindex".parse::<JobType>().unwrap_err(),
            JobError::UnknownJobType("reindex".to_string())
        );
    }

    #[test]
    fn metadata_is_parsed_into_the_matching_variant() {
        let payload = JobPayload::from_metadata(
            JobType::DataExport,
            json!({"study_id": "s-1", "format": "csv"}),
        )
        .unwrap();

        assert_eq!(payload.job_type(), JobType::DataExport);
        match payload {
            JobPayload::DataExport(p) => {
                assert_eq!(p.format, ExportFormat::Csv);
                assert!(!p.include_responses);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn malformed_metadata_is_a_validation_error() {
        let err = JobPayload::from_metadata(JobType::DataExport, json!({"format": "pdf"}))
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(msg) if msg.contains("data_export")));
    }

    #[test]
    fn null_metadata_is_accepted_for_echo() {
        let payload = JobPayload::from_metadata(JobType::Echo, JsonValue::Null).unwrap();
        assert_eq!(payload, JobPayload::Echo(EchoParams::default()));
    }

    #[test]
    fn notification_requires_recipients_and_subject() {
        let mut params = NotificationParams {
            recipients: vec![],
            subject: "Study ready".to_string(),
            body: String::new(),
            channel: NotificationChannel::Email,
        };
        assert!(JobPayload::NotificationDispatch(params.clone()).validate().is_err());

        params.recipients = vec!["a@example.com".to_string(), " ".to_string()];
        assert!(JobPayload::NotificationDispatch(params.clone()).validate().is_err());

        params.recipients = vec!["a@example.com".to_string()];
        assert!(JobPayload::NotificationDispatch(params.clone()).validate().is_ok());

        params.subject = "  ".to_string();
        assert!(JobPayload::NotificationDispatch(params).validate().is_err());
    }

    #[test]
    fn blank_study_name_is_rejected() {
        let payload = JobPayload::StudyCreation(StudyCreationParams {
            study_name: "   ".to_string(),
            template_id: None,
            participant_count: 10,
            tags: vec![],
        });
        assert!(matches!(payload.validate(), Err(JobError::Validation(_))));
    }

    #[test]
    fn tagged_serialization_names_the_type() {
        let value = serde_json::to_value(JobPayload::echo("hi")).unwrap();
        assert_eq!(value["type"], "echo");
        assert_eq!(value["params"]["message"], "hi");
        assert_eq!(JobPayload::echo("hi").to_metadata(), json!({"message": "hi", "delay_ms": 0}));
    }
}
