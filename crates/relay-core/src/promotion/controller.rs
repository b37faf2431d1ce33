//! Promotion controller
//!
//! Drives a [`PromotionRequest`] through its plan one environment at a time:
//! fetch overrides, gate on approval, merge, import. Environments never run
//! out of order and a halted stage never lets the chain advance.
//!
//! Approval is not waited on in-process. A stage that needs approval is
//! persisted as `AwaitingApproval` and the call returns; `approve` or
//! `resume` picks it up later, re-fetching the override data first.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, ArtifactRegistry};
use crate::error::{ExportError, ImportError, NotFoundError, PromotionError};
use crate::fs::LockFile;
use crate::overrides::{OverrideSet, OverrideStore};
use crate::template::{self, IcfTemplate};
use crate::tracking::{EnvironmentNotice, IssueContext, IssueTracker, NoticeState, TrackingIssue};
use crate::types::{ChainKey, Environment, Plan};

use super::approval::{ApprovalDecision, Decision, RejectionPolicy};
use super::guard::PromotionLocks;
use super::importer::{ImportRequest, Importer};
use super::ledger::{ImportLedger, ImportRecord};
use super::state::{PromotionRequest, PromotionStatus, StageFailure, StageRecord};
use super::store::RequestStore;

/// Collaborators for [`PromotionController::new`].
pub struct ControllerParts {
    pub plans: BTreeMap<String, Plan>,
    pub registry: ArtifactRegistry,
    pub overrides: Arc<dyn OverrideStore>,
    pub importer: Arc<dyn Importer>,
    pub tracker: IssueTracker,
    pub requests: RequestStore,
    pub imports: ImportLedger,
    pub locks: PromotionLocks,
    pub policy: RejectionPolicy,
    /// Link to the pipeline run driving this process.
    pub run_url: String,
}

pub struct PromotionController {
    plans: BTreeMap<String, Plan>,
    registry: ArtifactRegistry,
    overrides: Arc<dyn OverrideStore>,
    importer: Arc<dyn Importer>,
    tracker: IssueTracker,
    requests: RequestStore,
    imports: ImportLedger,
    locks: PromotionLocks,
    policy: RejectionPolicy,
    run_url: String,
}

/// Outcome of one controller call.
///
/// Stage failures are reported here with `error` set; `Err` from the
/// controller means the call itself could not run (concurrent promotion,
/// blocking tracking failure, state I/O).
#[derive(Debug)]
pub struct PromotionReport {
    pub request_id: String,
    pub chain: ChainKey,
    pub status: PromotionStatus,
    /// Environment the chain stopped at, unless it finished.
    pub environment: Option<String>,
    /// Environments imported during this call.
    pub imported: Vec<String>,
    /// Environments satisfied by an earlier import of the same artifact.
    pub skipped: Vec<String>,
    pub issue: Option<TrackingIssue>,
    pub error: Option<PromotionError>,
    pub warnings: Vec<String>,
}

impl PromotionReport {
    fn new(request: &PromotionRequest) -> Self {
        Self {
            request_id: request.id.clone(),
            chain: request.chain.clone(),
            status: request.status,
            environment: None,
            imported: Vec::new(),
            skipped: Vec::new(),
            issue: None,
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == PromotionStatus::Succeeded && self.error.is_none()
    }

    /// Waiting on a reviewer; not a failure.
    pub fn is_awaiting_approval(&self) -> bool {
        self.status == PromotionStatus::AwaitingApproval
    }
}

enum StageOutcome {
    Advanced,
    Halted,
}

impl PromotionController {
    pub fn new(parts: ControllerParts) -> Self {
        Self {
            plans: parts.plans,
            registry: parts.registry,
            overrides: parts.overrides,
            importer: parts.importer,
            tracker: parts.tracker,
            requests: parts.requests,
            imports: parts.imports,
            locks: parts.locks,
            policy: parts.policy,
            run_url: parts.run_url,
        }
    }

    pub fn policy(&self) -> RejectionPolicy {
        self.policy
    }

    pub fn tracker(&self) -> &IssueTracker {
        &self.tracker
    }

    /// Promote `artifact_name` along `plan_name`.
    ///
    /// Continues the chain's active request if there is one; otherwise starts
    /// a new generation. Environments already holding this artifact are
    /// skipped unless `force` is set.
    pub fn start(
        &self,
        plan_name: &str,
        artifact_name: &str,
        force: bool,
    ) -> Result<PromotionReport, PromotionError> {
        let plan = self.plan(plan_name)?;
        let artifact = self.registry.get(artifact_name)?;
        let chain = ChainKey::new(&plan.name, &artifact.artifact_name);

        let request_id = {
            let _chain_lock = self.locks.chain(&chain)?;
            let mut existing = self.requests.for_chain(&chain)?;
            match existing.pop() {
                Some(active) if !active.is_terminal() => {
                    if force && !active.force {
                        warn!(request = %active.id, "--force ignored for a request already in progress");
                    }
                    info!(request = %active.id, chain = %chain, status = %active.status, "Continuing promotion request");
                    active.id
                }
                latest => {
                    let generation = latest.map_or(1, |r| r.generation + 1);
                    let request =
                        PromotionRequest::new(plan, &artifact, generation, force, &self.run_url);
                    self.requests.save(&request)?;
                    info!(request = %request.id, chain = %chain, generation, "Started promotion request");
                    request.id
                }
            }
        };

        self.drive(&request_id)
    }

    /// Continue a suspended or interrupted request.
    pub fn resume(&self, request_id: &str) -> Result<PromotionReport, PromotionError> {
        self.drive(request_id)
    }

    /// Record an approval for the stage awaiting it, then continue.
    pub fn approve(
        &self,
        request_id: &str,
        environment: &str,
        reviewer: &str,
    ) -> Result<PromotionReport, PromotionError> {
        {
            let (_guard, mut request) = self.lock_request(request_id)?;
            let stage = awaiting_stage(&mut request, environment)?;
            stage.approval = Some(ApprovalDecision::approved(
                reviewer,
                stage.override_fingerprint.clone(),
            ));
            stage.updated_at = Utc::now();
            self.requests.save(&request)?;
            info!(request = %request_id, environment, reviewer, "Approval recorded");
        }

        self.drive(request_id)
    }

    /// Record a rejection. The stage and the request fail.
    pub fn reject(
        &self,
        request_id: &str,
        environment: &str,
        reason: Option<String>,
        reviewer: &str,
    ) -> Result<PromotionReport, PromotionError> {
        let (_guard, mut request) = self.lock_request(request_id)?;
        let stage = awaiting_stage(&mut request, environment)?;
        stage.approval = Some(ApprovalDecision::rejected(
            reviewer,
            reason.clone(),
            stage.override_fingerprint.clone(),
        ));
        stage.fail(StageFailure::Rejected {
            reviewer: reviewer.to_string(),
            reason,
        })?;
        request.sync_status();
        self.requests.save(&request)?;
        info!(request = %request_id, environment, reviewer, policy = %self.policy, "Promotion rejected");

        Ok(self.finish(&request, PromotionReport::new(&request)))
    }

    /// Put a rejected stage back into approval. Requires `allow-reentry`.
    pub fn retry(&self, request_id: &str) -> Result<PromotionReport, PromotionError> {
        if self.policy != RejectionPolicy::AllowReentry {
            return Err(PromotionError::InvalidState(format!(
                "rejection policy is {}; promote the artifact again to start a new chain",
                self.policy
            )));
        }

        {
            let (_guard, mut request) = self.lock_request(request_id)?;
            let stage = request.current_stage_mut().ok_or_else(|| no_stage(request_id))?;
            if !matches!(stage.failure, Some(StageFailure::Rejected { .. })) {
                return Err(PromotionError::InvalidState(format!(
                    "request '{request_id}' was not stopped by a rejection"
                )));
            }
            stage.transition(PromotionStatus::AwaitingApproval)?;
            stage.failure = None;
            stage.approval = None;
            let environment = stage.environment.clone();
            request.sync_status();
            self.requests.save(&request)?;
            info!(request = %request_id, environment = %environment, "Rejected stage re-entered approval");
        }

        self.drive(request_id)
    }

    /// Give up on a request waiting for overrides or approval.
    pub fn abandon(&self, request_id: &str, reason: &str) -> Result<PromotionReport, PromotionError> {
        let (_guard, mut request) = self.lock_request(request_id)?;
        if request.is_terminal() {
            return Err(PromotionError::InvalidState(format!(
                "request '{request_id}' is already {}",
                request.status
            )));
        }

        let stage = request.current_stage_mut().ok_or_else(|| no_stage(request_id))?;
        if !stage.status.is_abandonable() {
            return Err(PromotionError::InvalidState(format!(
                "request '{request_id}' cannot be abandoned while {}",
                stage.status
            )));
        }
        stage.fail(StageFailure::Abandoned {
            reason: reason.to_string(),
        })?;
        let environment = stage.environment.clone();
        request.sync_status();
        self.requests.save(&request)?;
        info!(request = %request_id, environment = %environment, reason, "Promotion abandoned");

        Ok(self.finish(&request, PromotionReport::new(&request)))
    }

    pub fn request(&self, request_id: &str) -> Result<PromotionRequest, PromotionError> {
        self.requests
            .load(request_id)?
            .ok_or_else(|| PromotionError::InvalidState(format!("unknown request '{request_id}'")))
    }

    /// All requests, newest first.
    pub fn requests(&self) -> Result<Vec<PromotionRequest>, PromotionError> {
        Ok(self.requests.list()?)
    }

    fn plan(&self, name: &str) -> Result<&Plan, PromotionError> {
        self.plans
            .get(name)
            .ok_or_else(|| PromotionError::InvalidState(format!("unknown plan '{name}'")))
    }

    fn lock_request(&self, request_id: &str) -> Result<(LockFile, PromotionRequest), PromotionError> {
        let request = self.request(request_id)?;
        let guard = self.locks.request(&request.artifact_name, &request.id)?;
        // Re-read under the guard
        let request = self.request(request_id)?;
        Ok((guard, request))
    }

    fn drive(&self, request_id: &str) -> Result<PromotionReport, PromotionError> {
        let (_guard, mut request) = self.lock_request(request_id)?;
        let mut report = PromotionReport::new(&request);
        if request.is_terminal() {
            return Ok(self.finish(&request, report));
        }
        request.run_url = self.run_url.clone();

        let artifact = self.registry.get(&request.artifact_name)?;
        if let Err(err) = self.verify(&request, &artifact) {
            warn!(request = %request.id, artifact = %artifact.artifact_name, error = %err, "Published artifact failed verification");
            self.fail_current(
                &mut request,
                StageFailure::ArtifactUnusable {
                    reason: err.to_string(),
                },
            )?;
            report.error = Some(err.into());
            return Ok(self.finish(&request, report));
        }

        // Operators learn which secrets to set before the first stage needs them
        if request.issue_id.is_none() && !artifact.required_keys.is_empty() {
            let issue = self
                .tracker
                .ensure_open(&request.chain, &issue_context(&request, &artifact))?;
            request.issue_id = Some(issue.id.clone());
            report.issue = Some(issue);
            self.requests.save(&request)?;
        }

        while let Some(environment) = request.current_environment().cloned() {
            match self.run_stage(&mut request, &artifact, &environment, &mut report)? {
                StageOutcome::Advanced if request.current_index + 1 < request.stages.len() => {
                    request.current_index += 1;
                    request.sync_status();
                    self.requests.save(&request)?;
                }
                StageOutcome::Advanced => {
                    // Final confirmation trail before the chain is marked done
                    self.notify(&mut request, &artifact, &mut report)?;
                    request.sync_status();
                    self.requests.save(&request)?;
                    info!(request = %request.id, chain = %request.chain, "Promotion chain succeeded");
                    break;
                }
                StageOutcome::Halted => break,
            }
        }

        Ok(self.finish(&request, report))
    }

    fn run_stage(
        &self,
        request: &mut PromotionRequest,
        artifact: &Artifact,
        environment: &Environment,
        report: &mut PromotionReport,
    ) -> Result<StageOutcome, PromotionError> {
        let artifact_name = artifact.artifact_name.as_str();
        let env_name = environment.name.as_str();

        let entry_status = current(request)?.status;
        match entry_status {
            PromotionStatus::Succeeded => return Ok(StageOutcome::Advanced),
            PromotionStatus::Failed => {
                request.sync_status();
                return Ok(StageOutcome::Halted);
            }
            _ => {}
        }

        let _import_guard = self.locks.import(artifact_name, env_name)?;

        if entry_status == PromotionStatus::Pending
            && !request.force
            && self
                .imports
                .contains(artifact_name, env_name, &artifact.content_hash)?
        {
            let stage = current(request)?;
            stage.skipped = true;
            stage.transition(PromotionStatus::Succeeded)?;
            self.save(request)?;
            info!(artifact = artifact_name, environment = env_name, "Already imported; skipping");
            report.skipped.push(environment.name.clone());
            return Ok(StageOutcome::Advanced);
        }

        if entry_status == PromotionStatus::Importing {
            return self.recover_interrupted_import(request, artifact, environment, report);
        }

        if entry_status == PromotionStatus::Pending {
            current(request)?.transition(PromotionStatus::AwaitingOverrides)?;
            self.save(request)?;
            debug!(request = %request.id, environment = env_name, "Fetching overrides");
        }

        let (overrides, template) = self.gather(artifact, environment)?;

        let template = match template {
            Ok(template) => template,
            Err(err) => {
                warn!(artifact = artifact_name, error = %err, "Template unreadable");
                self.fail_current(
                    request,
                    StageFailure::ArtifactUnusable {
                        reason: err.to_string(),
                    },
                )?;
                report.error = Some(err.into());
                return Ok(StageOutcome::Halted);
            }
        };

        let overrides = match overrides {
            Ok(overrides) => overrides,
            Err(err) => {
                warn!(artifact = artifact_name, environment = env_name, error = %err, "Override set unavailable");
                self.fail_current(
                    request,
                    StageFailure::MissingOverrides {
                        reason: err.failure.to_string(),
                    },
                )?;
                self.notify(request, artifact, report)?;
                report.error = Some(err.into());
                return Ok(StageOutcome::Halted);
            }
        };
        let fingerprint = overrides.fingerprint();

        if environment.requires_approval {
            let stage = current(request)?;
            let approved = match &stage.approval {
                Some(approval) if approval.approves(&fingerprint) => true,
                Some(approval) if approval.decision == Decision::Approved => {
                    warn!(environment = env_name, reviewer = %approval.reviewer, "Override data changed after approval; approval discarded");
                    report.warnings.push(format!(
                        "override data for '{env_name}' changed after {} approved; approval is needed again",
                        approval.reviewer
                    ));
                    false
                }
                _ => false,
            };

            if !approved {
                stage.approval = None;
                stage.override_fingerprint = Some(fingerprint);
                stage.enter(PromotionStatus::AwaitingApproval)?;
                self.save(request)?;
                info!(request = %request.id, environment = env_name, "Awaiting approval");
                self.notify(request, artifact, report)?;
                return Ok(StageOutcome::Halted);
            }
        }

        let stage = current(request)?;
        stage.override_fingerprint = Some(fingerprint);
        stage.enter(PromotionStatus::Merging)?;
        self.save(request)?;

        let resolved = match template::merge(&template, &overrides) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(environment = env_name, missing = ?err.missing_keys, "Required override keys missing");
                self.fail_current(
                    request,
                    StageFailure::MissingKeys {
                        keys: err.missing_keys.clone(),
                    },
                )?;
                self.notify(request, artifact, report)?;
                report.error = Some(err.into());
                return Ok(StageOutcome::Halted);
            }
        };

        let stage = current(request)?;
        stage.config_fingerprint = Some(resolved.fingerprint().to_string());
        stage.transition(PromotionStatus::Importing)?;
        self.save(request)?;
        info!(artifact = artifact_name, environment = env_name, "Importing");

        let outcome = self.importer.import(&ImportRequest {
            artifact,
            environment,
            config: &resolved,
        });

        match outcome {
            Ok(receipt) => {
                self.imports.record(&ImportRecord {
                    artifact_name: artifact.artifact_name.clone(),
                    environment: environment.name.clone(),
                    content_hash: artifact.content_hash.clone(),
                    config_fingerprint: resolved.fingerprint().to_string(),
                    request_id: request.id.clone(),
                    receipt: receipt.detail.clone(),
                    imported_at: Utc::now(),
                })?;
                let stage = current(request)?;
                stage.receipt = Some(receipt.detail);
                stage.transition(PromotionStatus::Succeeded)?;
                self.save(request)?;
                info!(artifact = artifact_name, environment = env_name, "Import succeeded");
                report.imported.push(environment.name.clone());
                Ok(StageOutcome::Advanced)
            }
            Err(err) => {
                warn!(artifact = artifact_name, environment = env_name, reason = %err.reason, "Import failed");
                self.fail_current(
                    request,
                    StageFailure::ImportFailed {
                        reason: err.reason.clone(),
                    },
                )?;
                report.error = Some(err.into());
                Ok(StageOutcome::Halted)
            }
        }
    }

    // A persisted `Importing` stage means a process died mid-import.
    fn recover_interrupted_import(
        &self,
        request: &mut PromotionRequest,
        artifact: &Artifact,
        environment: &Environment,
        report: &mut PromotionReport,
    ) -> Result<StageOutcome, PromotionError> {
        let record = self
            .imports
            .get(&artifact.artifact_name, &environment.name)?
            .filter(|r| r.content_hash == artifact.content_hash && r.request_id == request.id);

        if let Some(record) = record {
            let stage = current(request)?;
            stage.receipt = Some(record.receipt);
            stage.transition(PromotionStatus::Succeeded)?;
            self.save(request)?;
            info!(environment = %environment.name, "Interrupted import had completed");
            report.imported.push(environment.name.clone());
            return Ok(StageOutcome::Advanced);
        }

        let reason = "import was interrupted and its outcome is unknown".to_string();
        warn!(environment = %environment.name, "Interrupted import is not retried automatically");
        self.fail_current(
            request,
            StageFailure::ImportFailed {
                reason: reason.clone(),
            },
        )?;
        report.error = Some(
            ImportError {
                artifact_name: artifact.artifact_name.clone(),
                environment: environment.name.clone(),
                reason,
            }
            .into(),
        );
        Ok(StageOutcome::Halted)
    }

    /// Fetch the override set and re-read the template side by side.
    #[allow(clippy::type_complexity)]
    fn gather(
        &self,
        artifact: &Artifact,
        environment: &Environment,
    ) -> Result<
        (
            Result<OverrideSet, NotFoundError>,
            Result<IcfTemplate, ExportError>,
        ),
        PromotionError,
    > {
        std::thread::scope(|scope| {
            let overrides = scope.spawn(|| self.overrides.get(environment));
            let template = artifact.load_template();
            let overrides = overrides.join().map_err(|_| {
                PromotionError::Other(anyhow::anyhow!(
                    "override lookup for '{}' panicked",
                    environment.name
                ))
            })?;
            Ok((overrides, template))
        })
    }

    fn verify(&self, request: &PromotionRequest, artifact: &Artifact) -> Result<(), ExportError> {
        if artifact.content_hash != request.content_hash {
            return Err(ExportError::ContentMismatch {
                name: artifact.artifact_name.clone(),
            });
        }
        self.registry.verify(artifact)
    }

    /// Open or refresh the chain's issue. Failures become warnings.
    fn notify(
        &self,
        request: &mut PromotionRequest,
        artifact: &Artifact,
        report: &mut PromotionReport,
    ) -> Result<(), PromotionError> {
        match self
            .tracker
            .ensure_open(&request.chain, &issue_context(request, artifact))
        {
            Ok(issue) => {
                request.issue_id = Some(issue.id.clone());
                report.issue = Some(issue);
                self.requests.save(request)?;
            }
            Err(err) => {
                warn!(chain = %request.chain, error = %err, "Tracking issue not updated");
                report
                    .warnings
                    .push(format!("tracking issue not updated: {err}"));
            }
        }
        Ok(())
    }

    fn fail_current(
        &self,
        request: &mut PromotionRequest,
        failure: StageFailure,
    ) -> Result<(), PromotionError> {
        current(request)?.fail(failure)?;
        self.save(request)
    }

    fn save(&self, request: &mut PromotionRequest) -> Result<(), PromotionError> {
        request.sync_status();
        Ok(self.requests.save(request)?)
    }

    fn finish(&self, request: &PromotionRequest, mut report: PromotionReport) -> PromotionReport {
        report.status = request.status;
        report.environment = match request.status {
            PromotionStatus::Succeeded => None,
            _ => request.current_stage().map(|s| s.environment.clone()),
        };
        if report.issue.is_none() {
            report.issue = self.tracker.open_issue(&request.chain).ok().flatten();
        }
        report
    }
}

fn current(request: &mut PromotionRequest) -> Result<&mut StageRecord, PromotionError> {
    let id = request.id.clone();
    request.current_stage_mut().ok_or_else(|| no_stage(&id))
}

fn no_stage(request_id: &str) -> PromotionError {
    PromotionError::InvalidState(format!("request '{request_id}' has no current stage"))
}

/// The current stage, provided it is `environment` and awaits approval.
fn awaiting_stage<'a>(
    request: &'a mut PromotionRequest,
    environment: &str,
) -> Result<&'a mut StageRecord, PromotionError> {
    if request.is_terminal() {
        return Err(PromotionError::InvalidState(format!(
            "request '{}' is already {}",
            request.id, request.status
        )));
    }
    let id = request.id.clone();
    let stage = request.current_stage_mut().ok_or_else(|| no_stage(&id))?;
    if stage.environment != environment {
        return Err(PromotionError::InvalidState(format!(
            "request '{id}' is at '{}', not '{environment}'",
            stage.environment
        )));
    }
    if stage.status != PromotionStatus::AwaitingApproval {
        return Err(PromotionError::InvalidState(format!(
            "environment '{environment}' is {}, not awaiting approval",
            stage.status
        )));
    }
    Ok(stage)
}

fn issue_context(request: &PromotionRequest, artifact: &Artifact) -> IssueContext {
    IssueContext {
        plan: request.plan_name().to_string(),
        artifact_name: artifact.artifact_name.clone(),
        artifact_dir: artifact.artifact_dir.clone(),
        metadata_path: artifact.metadata_path.clone(),
        run_url: request.run_url.clone(),
        required_keys: artifact.required_keys.clone(),
        template_status: artifact.template_status,
        template_source: artifact.template_source.clone(),
        template_excerpt: artifact
            .load_template()
            .ok()
            .and_then(|template| template.excerpt()),
        environments: request
            .environments
            .iter()
            .zip(&request.stages)
            .map(|(environment, stage)| EnvironmentNotice {
                name: environment.name.clone(),
                override_secret_key: environment.override_secret_key.clone(),
                requires_approval: environment.requires_approval,
                state: notice_state(stage),
                suggested_overrides: template::suggest_overrides(
                    &artifact.required_keys,
                    &environment.name,
                ),
            })
            .collect(),
    }
}

fn notice_state(stage: &StageRecord) -> NoticeState {
    match (stage.status, &stage.failure) {
        (PromotionStatus::Succeeded, _) => NoticeState::Imported,
        (PromotionStatus::Failed, Some(StageFailure::MissingOverrides { reason })) => {
            NoticeState::OverridesMissing(reason.clone())
        }
        (PromotionStatus::Failed, Some(StageFailure::MissingKeys { keys })) => {
            NoticeState::KeysMissing(keys.clone())
        }
        (PromotionStatus::Failed, Some(other)) => NoticeState::Failed(other.to_string()),
        (PromotionStatus::Failed, None) => NoticeState::Failed("failed".to_string()),
        (PromotionStatus::AwaitingApproval, _) => NoticeState::AwaitingApproval,
        _ => NoticeState::Pending,
    }
}
