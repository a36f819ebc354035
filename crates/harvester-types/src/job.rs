//! Job descriptions and persisted job records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::spec::Specification;
use crate::state::{ConnectionName, JobId, JobStatus};

/// Default job priority; lower numbers are scheduled first.
pub const DEFAULT_JOB_PRIORITY: u32 = 5;

/// One transformation or output stage of a job's pipeline.
///
/// Stages are identified by their position in the pipeline. A stage whose
/// `prerequisite` is `None` consumes the document as fetched from the
/// source; otherwise it consumes the output of the named earlier stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub connection: ConnectionName,
    #[serde(default)]
    pub is_output: bool,
    #[serde(default)]
    pub spec: Specification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prerequisite: Option<usize>,
}

impl PipelineStage {
    #[must_use]
    pub fn output(connection: impl Into<ConnectionName>) -> Self {
        Self {
            connection: connection.into(),
            is_output: true,
            spec: Specification::new(),
            prerequisite: None,
        }
    }

    #[must_use]
    pub fn transformation(connection: impl Into<ConnectionName>) -> Self {
        Self {
            connection: connection.into(),
            is_output: false,
            spec: Specification::new(),
            prerequisite: None,
        }
    }

    #[must_use]
    pub fn after(mut self, prerequisite: usize) -> Self {
        self.prerequisite = Some(prerequisite);
        self
    }

    #[must_use]
    pub fn with_spec(mut self, spec: Specification) -> Self {
        self.spec = spec;
        self
    }
}

/// When a job is (re)started without operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum Schedule {
    /// Only an operator starts the job.
    #[default]
    Manual,
    /// Restart once the job has been inactive for `every_secs`.
    Interval { every_secs: u64 },
}

impl Schedule {
    /// Whether an inactive job that ended at `ended` is due at `now`.
    #[must_use]
    pub fn is_due(&self, ended: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match self {
            Self::Manual => false,
            Self::Interval { every_secs } => {
                let Some(ended) = ended else {
                    return true;
                };
                i64::try_from(*every_secs)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .and_then(|every| ended.checked_add_signed(every))
                    .is_some_and(|due| due <= now)
            }
        }
    }
}

/// Whether a job finishes after one seeding pass or keeps re-seeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum JobType {
    /// Seed once, process everything, complete.
    #[default]
    RunOnce,
    /// Re-seed every `reseed_interval_secs`; never completes on its own.
    Continuous { reseed_interval_secs: u64 },
}

impl JobType {
    #[must_use]
    pub fn reseed_interval(&self) -> Option<Duration> {
        match self {
            Self::RunOnce => None,
            Self::Continuous {
                reseed_interval_secs,
            } => Some(Duration::from_secs(*reseed_interval_secs)),
        }
    }
}

/// How link-hop distance affects document retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HopcountMode {
    #[default]
    Accurate,
    NoDelete,
    NeverDelete,
}

impl HopcountMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accurate => "accurate",
            Self::NoDelete => "no_delete",
            Self::NeverDelete => "never_delete",
        }
    }
}

fn default_priority() -> u32 {
    DEFAULT_JOB_PRIORITY
}

/// Everything an operator declares about a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescription {
    pub name: String,
    pub source: ConnectionName,
    #[serde(default)]
    pub pipeline: Vec<PipelineStage>,
    #[serde(default)]
    pub document_spec: Specification,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub job_type: JobType,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub hopcount_mode: HopcountMode,
}

impl JobDescription {
    #[must_use]
    pub fn new(name: impl Into<String>, source: impl Into<ConnectionName>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            pipeline: Vec::new(),
            document_spec: Specification::new(),
            schedule: Schedule::default(),
            job_type: JobType::default(),
            priority: DEFAULT_JOB_PRIORITY,
            hopcount_mode: HopcountMode::default(),
        }
    }

    #[must_use]
    pub fn with_stage(mut self, stage: PipelineStage) -> Self {
        self.pipeline.push(stage);
        self
    }

    #[must_use]
    pub fn with_document_spec(mut self, spec: Specification) -> Self {
        self.document_spec = spec;
        self
    }

    /// Output connections in pipeline order, without duplicates.
    #[must_use]
    pub fn output_connections(&self) -> Vec<ConnectionName> {
        let mut out: Vec<ConnectionName> = Vec::new();
        for stage in self.pipeline.iter().filter(|s| s.is_output) {
            if !out.contains(&stage.connection) {
                out.push(stage.connection.clone());
            }
        }
        out
    }

    /// Every connection the job references, source first.
    #[must_use]
    pub fn referenced_connections(&self) -> Vec<ConnectionName> {
        let mut out = vec![self.source.clone()];
        for stage in &self.pipeline {
            if !out.contains(&stage.connection) {
                out.push(stage.connection.clone());
            }
        }
        out
    }

    /// Structural problems with the pipeline, one message per problem.
    #[must_use]
    pub fn pipeline_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.pipeline.iter().any(|s| s.is_output) {
            problems.push(format!("job '{}': pipeline has no output stage", self.name));
        }
        for (index, stage) in self.pipeline.iter().enumerate() {
            if let Some(pre) = stage.prerequisite {
                if pre >= index {
                    problems.push(format!(
                        "job '{}': stage {index} ({}) has prerequisite {pre}, which is not an earlier stage",
                        self.name, stage.connection
                    ));
                } else if self.pipeline[pre].is_output {
                    problems.push(format!(
                        "job '{}': stage {index} ({}) has output stage {pre} as prerequisite",
                        self.name, stage.connection
                    ));
                }
            }
        }
        problems
    }
}

/// A persisted job: description plus lifecycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub description: JobDescription,
    pub status: JobStatus,
    pub seeding_complete: bool,
    /// Start time of the last finished seeding pass; handed to the next pass.
    pub last_seed_time: Option<DateTime<Utc>>,
    /// Earliest time the next seeding pass may run.
    pub next_seed_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobDescription {
        JobDescription::new("crawl", "files")
            .with_stage(PipelineStage::transformation("strip"))
            .with_stage(PipelineStage::output("index").after(0))
            .with_stage(PipelineStage::output("archive"))
    }

    #[test]
    fn well_formed_pipeline_has_no_problems() {
        assert!(job().pipeline_problems().is_empty());
    }

    #[test]
    fn forward_and_output_prerequisites_are_problems() {
        let desc = JobDescription::new("bad", "files")
            .with_stage(PipelineStage::output("index").after(1))
            .with_stage(PipelineStage::transformation("strip").after(0));
        let problems = desc.pipeline_problems();
        assert_eq!(problems.len(), 2, "{problems:?}");
    }

    #[test]
    fn missing_output_is_a_problem() {
        let desc = JobDescription::new("bad", "files")
            .with_stage(PipelineStage::transformation("strip"));
        assert!(desc.pipeline_problems()[0].contains("no output stage"));
    }

    #[test]
    fn output_connections_dedupe_in_order() {
        let desc = job().with_stage(PipelineStage::output("index"));
        assert_eq!(
            desc.output_connections(),
            [ConnectionName::new("index"), ConnectionName::new("archive")]
        );
        assert_eq!(desc.referenced_connections().len(), 4);
    }

    #[test]
    fn interval_schedule_due_after_elapsed() {
        let schedule = Schedule::Interval { every_secs: 60 };
        let now = Utc::now();
        assert!(schedule.is_due(None, now));
        assert!(!schedule.is_due(Some(now), now));
        assert!(schedule.is_due(Some(now - chrono::Duration::seconds(61)), now));
        assert!(!Schedule::Manual.is_due(None, now));
    }

    #[test]
    fn description_from_yaml_uses_defaults() {
        let desc: JobDescription = serde_yaml::from_str(
            "name: crawl\nsource: files\npipeline:\n  - connection: index\n    is_output: true\n",
        )
        .unwrap();
        assert_eq!(desc.priority, DEFAULT_JOB_PRIORITY);
        assert_eq!(desc.schedule, Schedule::Manual);
        assert_eq!(desc.job_type, JobType::RunOnce);
        assert!(desc.document_spec.is_empty());
    }
}
