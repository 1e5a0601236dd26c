// ABOUTME: Submitter - enrich, validate, transform and send one queued record to the target
// ABOUTME: Classifies the result and writes failures to the error sink before reporting them

pub mod client;
pub mod payload;
pub mod validation;

use anyhow::Context;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error_sink::ErrorSink;
use crate::errors::{PipelineError, PipelineResult};
use crate::hierarchy::{EntityGroup, Enrichment};
use crate::queue::QueueMessage;
use crate::record::Record;

pub use client::{HttpTargetClient, LookupResult, SendResult, TargetClient};
pub use validation::{AcceptAll, AddressRules, RecordValidator, Validation};

/// Lookup response fields read during enrichment.
const INACTIVE_FIELD: &str = "Inactive";
const TIME_PROFILE_FIELD: &str = "Time_Profile_ID";
const ACTIVE_FIELD: &str = "Organization_Active";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Success,
    /// Not sent and not a failure, e.g. an inactive site.
    Skipped(String),
    PermanentFailure(String),
    TransientFailure(String),
}

impl SubmitOutcome {
    /// Whether the message can be acknowledged without a failure.
    pub fn is_done(&self) -> bool {
        matches!(self, SubmitOutcome::Success | SubmitOutcome::Skipped(_))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Success => None,
            SubmitOutcome::Skipped(r)
            | SubmitOutcome::PermanentFailure(r)
            | SubmitOutcome::TransientFailure(r) => Some(r),
        }
    }
}

fn is_true(value: Option<&String>) -> bool {
    value.map(|v| v.eq_ignore_ascii_case("true") || v == "1").unwrap_or(false)
}

pub struct Submitter {
    target: Arc<dyn TargetClient>,
    validator: Arc<dyn RecordValidator>,
    errors: ErrorSink,
    default_time_profile: String,
    today: String,
}

impl Submitter {
    pub fn new(
        target: Arc<dyn TargetClient>,
        validator: Arc<dyn RecordValidator>,
        errors: ErrorSink,
        default_time_profile: impl Into<String>,
    ) -> Self {
        Self {
            target,
            validator,
            errors,
            default_time_profile: default_time_profile.into(),
            today: chrono::Local::now().format("%Y-%m-%d").to_string(),
        }
    }

    /// Override the availability date stamped on organization payloads.
    pub fn with_today(mut self, today: impl Into<String>) -> Self {
        self.today = today.into();
        self
    }

    /// Submit one message. Failures are written to the error sink before the
    /// outcome is returned. An `Err` means the invocation itself could not
    /// complete (lookup fault, sink unavailable) and nothing was sent.
    pub async fn submit(
        &self,
        group: EntityGroup,
        run_date: &str,
        message: &QueueMessage,
    ) -> PipelineResult<SubmitOutcome> {
        let mut record = message.record.clone();
        let profile = group.profile();

        if profile.requires_active_status && record.get("status") != "A" {
            let reason = format!("{} {} has status '{}'", group, record.id, record.get("status"));
            tracing::info!("Skipping {}", reason);
            return Ok(SubmitOutcome::Skipped(reason));
        }

        if let Validation::Fail(reason) = self.validator.validate(group, &mut record) {
            tracing::warn!(group = %group, item = %record.id, "Validation failed: {}", reason);
            self.record_failure(group, run_date, message, &reason).await?;
            return Ok(SubmitOutcome::PermanentFailure(reason));
        }

        if let Some(reason) = self.enrich(group, &mut record).await? {
            tracing::info!("Skipping {}", reason);
            return Ok(SubmitOutcome::Skipped(reason));
        }

        let (operation, body) = payload::build(group, &record, &self.today);
        match self.target.send(operation, &body).await {
            SendResult::Accepted => {
                tracing::debug!(group = %group, item = %record.id, "{} accepted", operation);
                Ok(SubmitOutcome::Success)
            }
            SendResult::Rejected(fault) => {
                tracing::error!(group = %group, item = %record.id, "{} rejected: {}", operation, fault);
                self.record_failure(group, run_date, message, &fault).await?;
                Ok(SubmitOutcome::PermanentFailure(fault))
            }
            SendResult::Unreachable(reason) => {
                tracing::error!(group = %group, item = %record.id, "{} unreachable: {}", operation, reason);
                self.record_failure(group, run_date, message, &reason).await?;
                Ok(SubmitOutcome::TransientFailure(reason))
            }
        }
    }

    /// Fill in attributes read from the target. Returns a skip reason when the
    /// record must not be sent.
    async fn enrich(&self, group: EntityGroup, record: &mut Record) -> PipelineResult<Option<String>> {
        match group.profile().enrichment {
            Enrichment::None => Ok(None),
            Enrichment::SiteTimeProfile => {
                let (op, request) = payload::location_lookup(&record.id);
                let profile = match self.lookup(op, &request, &record.id).await? {
                    None => {
                        tracing::info!(
                            "Location {} not in target yet, using time profile {}",
                            record.id,
                            self.default_time_profile
                        );
                        self.default_time_profile.clone()
                    }
                    Some(found) => {
                        if is_true(found.get(INACTIVE_FIELD)) {
                            return Ok(Some(format!("location {} is inactive in target", record.id)));
                        }
                        found
                            .get(TIME_PROFILE_FIELD)
                            .filter(|p| !p.is_empty())
                            .cloned()
                            .unwrap_or_else(|| self.default_time_profile.clone())
                    }
                };
                record.set("time_profile_id", profile);
                Ok(None)
            }
            Enrichment::BuildingInactive => {
                let (op, request) = payload::location_lookup(&record.id);
                let inactive = match self.lookup(op, &request, &record.id).await? {
                    None => false,
                    Some(found) => is_true(found.get(INACTIVE_FIELD)),
                };
                record.set("inactive_in_target", inactive.to_string());
                Ok(None)
            }
            Enrichment::CostCenterActive => {
                let (op, request) = payload::cost_center_lookup(&record.id);
                let active = match self.lookup(op, &request, &record.id).await? {
                    None => true,
                    Some(found) => is_true(found.get(ACTIVE_FIELD)),
                };
                record.set("active_in_target", active.to_string());
                Ok(None)
            }
        }
    }

    async fn lookup(
        &self,
        operation: payload::Operation,
        request: &serde_json::Value,
        item: &str,
    ) -> PipelineResult<Option<BTreeMap<String, String>>> {
        match self.target.lookup(operation, request).await {
            LookupResult::Found(fields) => Ok(Some(fields)),
            LookupResult::NotFound => Ok(None),
            LookupResult::Fault(reason) => {
                tracing::error!(item = %item, "{} failed: {}", operation, reason);
                Err(PipelineError::Lookup {
                    item: item.to_string(),
                    reason,
                })
            }
        }
    }

    async fn record_failure(
        &self,
        group: EntityGroup,
        run_date: &str,
        message: &QueueMessage,
        fault: &str,
    ) -> PipelineResult<()> {
        let data = serde_json::to_value(&message.record)
            .with_context(|| format!("Failed to serialize record {}", message.record.id))?;
        self.errors
            .record_item(run_date, group, &message.record.id, fault, &data)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsBlobStore;
    use async_trait::async_trait;
    use payload::Operation;
    use serde_json::Value;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeTarget {
        lookups: Mutex<Vec<Operation>>,
        sent: Mutex<Vec<Value>>,
        lookup_result: Option<LookupResult>,
        send_result: Option<SendResult>,
    }

    #[async_trait]
    impl TargetClient for FakeTarget {
        async fn send(&self, _operation: Operation, payload: &Value) -> SendResult {
            self.sent.lock().unwrap().push(payload.clone());
            self.send_result.clone().unwrap_or(SendResult::Accepted)
        }

        async fn lookup(&self, operation: Operation, _request: &Value) -> LookupResult {
            self.lookups.lock().unwrap().push(operation);
            self.lookup_result.clone().unwrap_or(LookupResult::NotFound)
        }
    }

    fn submitter(target: Arc<FakeTarget>, dir: &std::path::Path) -> (Submitter, ErrorSink) {
        let sink = ErrorSink::new(Arc::new(FsBlobStore::new(dir)), "errors");
        let submitter = Submitter::new(target, Arc::new(AcceptAll), sink.clone(), "Standard_Hours_40")
            .with_today("2024-05-01");
        (submitter, sink)
    }

    fn message(record: Record) -> QueueMessage {
        QueueMessage {
            message_id: "000000-000001_q".into(),
            receipt_handle: "r".into(),
            record,
            receive_count: 1,
        }
    }

    #[tokio::test]
    async fn site_not_found_gets_default_time_profile() {
        let dir = tempdir().unwrap();
        let target = Arc::new(FakeTarget::default());
        let (submitter, sink) = submitter(target.clone(), dir.path());
        let outcome = submitter
            .submit(
                EntityGroup::Site,
                "2024-05-01",
                &message(Record::new("S1").with("status", "A").with("country", "US")),
            )
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Success);
        let sent = target.sent.lock().unwrap();
        assert_eq!(sent[0]["Time_Profile_Reference"]["ID"]["value"], "Standard_Hours_40");
        assert!(sink.entries("2024-05-01", EntityGroup::Site).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inactive_site_is_skipped_without_send() {
        let dir = tempdir().unwrap();
        let found = BTreeMap::from([(INACTIVE_FIELD.to_string(), "true".to_string())]);
        let target = Arc::new(FakeTarget {
            lookup_result: Some(LookupResult::Found(found)),
            ..FakeTarget::default()
        });
        let (submitter, _) = submitter(target.clone(), dir.path());
        let outcome = submitter
            .submit(EntityGroup::Site, "2024-05-01", &message(Record::new("S1").with("status", "A")))
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Skipped(_)));
        assert!(target.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_active_status_skips_before_lookup() {
        let dir = tempdir().unwrap();
        let target = Arc::new(FakeTarget::default());
        let (submitter, _) = submitter(target.clone(), dir.path());
        let outcome = submitter
            .submit(EntityGroup::Site, "2024-05-01", &message(Record::new("S1").with("status", "I")))
            .await
            .unwrap();
        assert!(outcome.is_done());
        assert!(target.lookups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cost_center_lookup_fault_aborts() {
        let dir = tempdir().unwrap();
        let target = Arc::new(FakeTarget {
            lookup_result: Some(LookupResult::Fault("Processing error".into())),
            ..FakeTarget::default()
        });
        let (submitter, _) = submitter(target.clone(), dir.path());
        let err = submitter
            .submit(EntityGroup::CostCenter, "2024-05-01", &message(Record::new("CC1")))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Lookup { .. }));
        assert!(target.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cost_center_not_found_defaults_active() {
        let dir = tempdir().unwrap();
        let target = Arc::new(FakeTarget::default());
        let (submitter, _) = submitter(target.clone(), dir.path());
        submitter
            .submit(EntityGroup::CostCenter, "2024-05-01", &message(Record::new("CC1")))
            .await
            .unwrap();
        let sent = target.sent.lock().unwrap();
        assert_eq!(sent[0]["Organization_Data"]["Organization_Active"], "true");
    }

    #[tokio::test]
    async fn rejection_and_unreachable_are_recorded() {
        let dir = tempdir().unwrap();
        let target = Arc::new(FakeTarget {
            send_result: Some(SendResult::Rejected("Invalid Organization".into())),
            ..FakeTarget::default()
        });
        let (submitter, sink) = submitter(target, dir.path());
        let outcome = submitter
            .submit(EntityGroup::Company, "2024-05-01", &message(Record::new("C1")))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::PermanentFailure("Invalid Organization".into())
        );

        let target = Arc::new(FakeTarget {
            send_result: Some(SendResult::Unreachable("connection refused".into())),
            ..FakeTarget::default()
        });
        let (submitter, _) = self::submitter(target, dir.path());
        let outcome = submitter
            .submit(EntityGroup::Company, "2024-05-01", &message(Record::new("C2")))
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::TransientFailure(_)));
        assert_eq!(
            sink.entries("2024-05-01", EntityGroup::Company).await.unwrap().len(),
            2
        );
    }
}
