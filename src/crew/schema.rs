//! Payload shapes each crew kind must return on success.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crew::CrewKind;
use crate::error::CrewError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchReport {
    pub findings: String,
    #[serde(default)]
    pub files_to_modify: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationReport {
    pub summary: String,
    #[serde(default)]
    pub commit_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Pass,
    NeedsChanges,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewReport {
    pub verdict: ReviewVerdict,
    #[serde(default)]
    pub summary: String,
}

fn parse<T: DeserializeOwned>(kind: CrewKind, payload: &serde_json::Value) -> Result<T, CrewError> {
    serde_json::from_value(payload.clone()).map_err(|e| CrewError::InvalidOutput {
        kind,
        message: e.to_string(),
    })
}

fn require_text(kind: CrewKind, field: &str, value: &str) -> Result<(), CrewError> {
    if value.trim().is_empty() {
        return Err(CrewError::InvalidOutput {
            kind,
            message: format!("'{field}' is empty"),
        });
    }
    Ok(())
}

pub fn research(payload: &serde_json::Value) -> Result<ResearchReport, CrewError> {
    let report: ResearchReport = parse(CrewKind::Research, payload)?;
    require_text(CrewKind::Research, "findings", &report.findings)?;
    Ok(report)
}

pub fn implementation(payload: &serde_json::Value) -> Result<ImplementationReport, CrewError> {
    let report: ImplementationReport = parse(CrewKind::Implementation, payload)?;
    require_text(CrewKind::Implementation, "summary", &report.summary)?;
    Ok(report)
}

pub fn review(payload: &serde_json::Value) -> Result<ReviewReport, CrewError> {
    parse(CrewKind::Review, payload)
}

/// Check a successful payload against the schema for `kind`.
pub fn validate(kind: CrewKind, payload: &serde_json::Value) -> Result<(), CrewError> {
    match kind {
        CrewKind::Research => research(payload).map(|_| ()),
        CrewKind::Implementation => implementation(payload).map(|_| ()),
        CrewKind::Review => review(payload).map(|_| ()),
    }
}
