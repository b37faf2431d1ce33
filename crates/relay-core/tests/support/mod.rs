#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use tempfile::TempDir;

use relay_core::artifact::{Artifact, ArtifactExporter, ArtifactRegistry, SourceRef};
use relay_core::error::{ImportError, TrackingError};
use relay_core::fs::LockHolder;
use relay_core::overrides::MemoryOverrideStore;
use relay_core::promotion::{
    ControllerParts, ImportLedger, ImportReceipt, ImportRequest, Importer, PromotionController,
    PromotionLocks, RejectionPolicy, RequestStore,
};
use relay_core::tracking::{IssueBackend, IssueDraft, IssueHandle, IssueLedger, IssueTracker};
use relay_core::types::{Environment, Plan};

pub const NIGHTLY_TEMPLATE: &str = r#"{"database": "${DB_URL}", "auth": {"key": "${API_KEY}"}}"#;

/// A `[qa, prod]` plan; only prod needs approval when `gated` is set.
pub fn qa_to_prod(gated: bool) -> Plan {
    Plan::new(
        "qa-to-prod",
        vec![
            Environment::new("qa", false, "QA_OVERRIDES"),
            Environment::new("prod", gated, "PROD_OVERRIDES"),
        ],
    )
}

/// One import as seen by the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportCall {
    pub artifact: String,
    pub environment: String,
    pub content: String,
}

/// Records every import; environments in `failing` are rejected.
#[derive(Default)]
pub struct RecordingImporter {
    calls: Mutex<Vec<ImportCall>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingImporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, environment: &str) {
        self.failing.lock().unwrap().insert(environment.to_string());
    }

    pub fn calls(&self) -> Vec<ImportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn environments(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.environment).collect()
    }
}

impl Importer for RecordingImporter {
    fn import(&self, request: &ImportRequest<'_>) -> Result<ImportReceipt, ImportError> {
        let env = request.environment.name.clone();
        self.calls.lock().unwrap().push(ImportCall {
            artifact: request.artifact.artifact_name.clone(),
            environment: env.clone(),
            content: request.config.content().to_string(),
        });

        if self.failing.lock().unwrap().contains(&env) {
            return Err(ImportError {
                artifact_name: request.artifact.artifact_name.clone(),
                environment: env,
                reason: "target rejected the configuration".to_string(),
            });
        }
        Ok(ImportReceipt {
            detail: format!("deployment-{}", self.calls.lock().unwrap().len()),
        })
    }
}

/// Holds the first import open until the test lets it go.
pub struct GateImporter {
    pub inner: RecordingImporter,
    armed: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl GateImporter {
    pub fn new() -> Self {
        Self {
            inner: RecordingImporter::new(),
            armed: AtomicBool::new(true),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }

    /// Block until the gated import is in flight.
    pub fn wait_entered(&self) {
        self.entered.wait();
    }

    pub fn release(&self) {
        self.release.wait();
    }
}

impl Importer for GateImporter {
    fn import(&self, request: &ImportRequest<'_>) -> Result<ImportReceipt, ImportError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.wait();
            self.release.wait();
        }
        self.inner.import(request)
    }
}

#[derive(Debug, Clone)]
pub struct FakeIssue {
    pub draft: IssueDraft,
    pub open: bool,
    pub updates: usize,
}

/// Issue system kept in memory. `set_down(true)` makes every call fail.
#[derive(Default)]
pub struct MemoryIssueBackend {
    issues: Mutex<BTreeMap<u64, FakeIssue>>,
    next: AtomicU64,
    down: AtomicBool,
}

impl MemoryIssueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn issues(&self) -> BTreeMap<u64, FakeIssue> {
        self.issues.lock().unwrap().clone()
    }

    pub fn issue(&self, id: &str) -> FakeIssue {
        self.issues()[&id.parse::<u64>().unwrap()].clone()
    }

    pub fn open_count(&self) -> usize {
        self.issues().values().filter(|i| i.open).count()
    }

    /// Close an issue behind the tracker's back, as a user would.
    pub fn close_externally(&self, id: &str) {
        let id: u64 = id.parse().unwrap();
        if let Some(issue) = self.issues.lock().unwrap().get_mut(&id) {
            issue.open = false;
        }
    }

    fn check(&self) -> Result<(), TrackingError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TrackingError::Unavailable("issue system is down".to_string()));
        }
        Ok(())
    }

    fn with_issue<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut FakeIssue) -> T,
    ) -> Result<T, TrackingError> {
        self.check()?;
        let key: u64 = id
            .parse()
            .map_err(|_| TrackingError::UnknownIssue(id.to_string()))?;
        let mut issues = self.issues.lock().unwrap();
        let issue = issues
            .get_mut(&key)
            .ok_or_else(|| TrackingError::UnknownIssue(id.to_string()))?;
        Ok(f(issue))
    }
}

impl IssueBackend for MemoryIssueBackend {
    fn create(&self, draft: &IssueDraft) -> Result<IssueHandle, TrackingError> {
        self.check()?;
        let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.issues.lock().unwrap().insert(
            id,
            FakeIssue {
                draft: draft.clone(),
                open: true,
                updates: 0,
            },
        );
        Ok(IssueHandle {
            id: id.to_string(),
            url: Some(format!("https://issues.example.com/{id}")),
        })
    }

    fn update(&self, id: &str, draft: &IssueDraft) -> Result<(), TrackingError> {
        self.with_issue(id, |issue| {
            issue.draft = draft.clone();
            issue.updates += 1;
        })
    }

    fn is_open(&self, id: &str) -> Result<bool, TrackingError> {
        self.with_issue(id, |issue| issue.open)
    }

    fn close(&self, id: &str) -> Result<(), TrackingError> {
        self.with_issue(id, |issue| issue.open = false)
    }

    fn find_open(&self, title: &str) -> Result<Option<IssueHandle>, TrackingError> {
        self.check()?;
        Ok(self
            .issues
            .lock()
            .unwrap()
            .iter()
            .find(|(_, issue)| issue.open && issue.draft.title == title)
            .map(|(id, _)| IssueHandle {
                id: id.to_string(),
                url: Some(format!("https://issues.example.com/{id}")),
            }))
    }
}

/// A state directory plus fakes for every external seam.
pub struct Harness {
    pub temp: TempDir,
    pub overrides: Arc<MemoryOverrideStore>,
    pub backend: Arc<MemoryIssueBackend>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            temp: TempDir::new().unwrap(),
            overrides: Arc::new(MemoryOverrideStore::new()),
            backend: Arc::new(MemoryIssueBackend::new()),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.temp.path().join("state")
    }

    pub fn registry(&self) -> ArtifactRegistry {
        ArtifactRegistry::new(self.state_dir().join("artifacts"))
    }

    pub fn exporter(&self) -> ArtifactExporter {
        ArtifactExporter::new(self.registry(), "metadata.json", "icf.json")
    }

    /// Write an export output directory containing metadata and a template.
    pub fn write_output(&self, dir_name: &str, template: &str) -> PathBuf {
        let output = self.temp.path().join("outputs").join(dir_name);
        write_output(&output, template);
        output
    }

    /// Export `template` and publish it as `name`.
    pub fn export(&self, name: &str, template: &str) -> Artifact {
        let output = self.write_output(name, template);
        self.exporter()
            .export(&SourceRef::new("qa-to-prod", output, "42").with_artifact_name(name))
            .unwrap()
    }

    pub fn tracker(&self) -> IssueTracker {
        let state = self.state_dir();
        IssueTracker::new(
            self.backend.clone(),
            IssueLedger::new(state.join("issues"), state.join("locks")),
        )
    }

    pub fn controller(
        &self,
        plans: Vec<Plan>,
        importer: Arc<dyn Importer>,
        policy: RejectionPolicy,
    ) -> PromotionController {
        let state = self.state_dir();
        PromotionController::new(ControllerParts {
            plans: plans.into_iter().map(|p| (p.name.clone(), p)).collect(),
            registry: self.registry(),
            overrides: self.overrides.clone(),
            importer,
            tracker: self.tracker(),
            requests: RequestStore::new(state.join("requests")),
            imports: ImportLedger::new(state.join("imports")),
            locks: PromotionLocks::new(state.join("locks")),
            policy,
            run_url: "https://ci.example.com/runs/42".to_string(),
        })
    }

    pub fn requests(&self) -> RequestStore {
        RequestStore::new(self.state_dir().join("requests"))
    }

    pub fn locks(&self) -> PromotionLocks {
        PromotionLocks::new(self.state_dir().join("locks"))
    }

    pub fn set_overrides(&self, secret_key: &str, values: &[(&str, &str)]) {
        self.overrides
            .insert(secret_key, values.iter().map(|(k, v)| (*k, *v)));
    }
}

// Above the kernel's pid_max, so never a live process
pub const DEAD_PID: u32 = u32::MAX - 1;

/// Leave a lock file behind as a killed relay process would.
pub fn leak_lock(path: &Path, holder: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let record = LockHolder {
        holder: holder.to_string(),
        pid: DEAD_PID,
        acquired_at: chrono::Utc::now(),
    };
    std::fs::write(path, serde_json::to_vec(&record).unwrap()).unwrap();
}

pub fn write_output(output: &Path, template: &str) {
    std::fs::create_dir_all(output).unwrap();
    std::fs::write(
        output.join("metadata.json"),
        r#"{"package": "widgets", "version": "1.4.2"}"#,
    )
    .unwrap();
    std::fs::write(output.join("icf.json"), template).unwrap();
    std::fs::write(output.join("flow.bin"), b"\x00\x01flow").unwrap();
}
