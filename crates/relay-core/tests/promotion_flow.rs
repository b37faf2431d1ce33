mod support;

use std::sync::Arc;

use relay_core::error::{ExportError, PromotionError};
use relay_core::promotion::{PromotionStatus, RejectionPolicy, StageFailure};
use relay_core::types::{Environment, Plan};

use support::{Harness, NIGHTLY_TEMPLATE, RecordingImporter, qa_to_prod};

fn full_overrides(h: &Harness) {
    h.set_overrides(
        "QA_OVERRIDES",
        &[("DB_URL", "postgres://qa"), ("API_KEY", "qa-key")],
    );
    h.set_overrides(
        "PROD_OVERRIDES",
        &[("DB_URL", "postgres://prod"), ("API_KEY", "prod-key")],
    );
}

#[test]
fn nightly_042_missing_prod_key_stops_before_prod_import() {
    let h = Harness::new();
    h.export("nightly-042", NIGHTLY_TEMPLATE);
    h.set_overrides("QA_OVERRIDES", &[("DB_URL", "x"), ("API_KEY", "y")]);
    h.set_overrides("PROD_OVERRIDES", &[("DB_URL", "x")]);

    let importer = Arc::new(RecordingImporter::new());
    let controller = h.controller(
        vec![qa_to_prod(false)],
        importer.clone(),
        RejectionPolicy::FreshChain,
    );

    let report = controller.start("qa-to-prod", "nightly-042", false).unwrap();

    assert_eq!(report.status, PromotionStatus::Failed);
    assert_eq!(report.environment.as_deref(), Some("prod"));
    assert_eq!(report.imported, vec!["qa".to_string()]);
    match report.error {
        Some(PromotionError::Merge(ref err)) => {
            assert_eq!(err.environment, "prod");
            assert_eq!(err.missing_keys, vec!["API_KEY".to_string()]);
        }
        ref other => panic!("expected merge error, got {other:?}"),
    }

    // qa was imported with its values; prod never reached the target
    let calls = importer.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].environment, "qa");
    assert!(calls[0].content.contains("\"database\": \"x\""));

    let issue = report.issue.expect("tracking issue");
    let issues = h.backend.issues();
    assert_eq!(issues.len(), 1);
    let body = &h.backend.issue(&issue.id).draft.body;
    assert!(body.contains("**missing keys** `API_KEY`"));
    assert!(body.contains("https://ci.example.com/runs/42"));

    let request = controller.request(&report.request_id).unwrap();
    assert_eq!(request.stages[0].status, PromotionStatus::Succeeded);
    assert_eq!(
        request.stages[1].failure,
        Some(StageFailure::MissingKeys {
            keys: vec!["API_KEY".to_string()]
        })
    );
}

#[test]
fn qa_is_imported_before_prod() {
    let h = Harness::new();
    h.export("nightly-042", NIGHTLY_TEMPLATE);
    full_overrides(&h);

    let importer = Arc::new(RecordingImporter::new());
    let controller = h.controller(
        vec![qa_to_prod(false)],
        importer.clone(),
        RejectionPolicy::FreshChain,
    );

    let report = controller.start("qa-to-prod", "nightly-042", false).unwrap();

    assert!(report.succeeded());
    assert_eq!(report.environment, None);
    assert_eq!(importer.environments(), vec!["qa", "prod"]);
    assert!(importer.calls()[1].content.contains("prod-key"));
}

#[test]
fn failed_qa_import_never_reaches_prod() {
    let h = Harness::new();
    h.export("nightly-042", NIGHTLY_TEMPLATE);
    full_overrides(&h);

    let importer = Arc::new(RecordingImporter::new());
    importer.fail_for("qa");
    let controller = h.controller(
        vec![qa_to_prod(false)],
        importer.clone(),
        RejectionPolicy::FreshChain,
    );

    let report = controller.start("qa-to-prod", "nightly-042", false).unwrap();

    assert_eq!(report.status, PromotionStatus::Failed);
    assert_eq!(report.environment.as_deref(), Some("qa"));
    assert!(matches!(report.error, Some(PromotionError::Import(_))));
    assert_eq!(importer.environments(), vec!["qa"]);

    let request = controller.request(&report.request_id).unwrap();
    assert_eq!(request.stages[1].status, PromotionStatus::Pending);
    assert!(matches!(
        request.stages[0].failure,
        Some(StageFailure::ImportFailed { ref reason }) if reason.contains("rejected")
    ));
}

#[test]
fn missing_override_set_fails_the_chain_and_is_reported() {
    let h = Harness::new();
    h.export("nightly-042", NIGHTLY_TEMPLATE);
    h.set_overrides("QA_OVERRIDES", &[("DB_URL", "x"), ("API_KEY", "y")]);

    let importer = Arc::new(RecordingImporter::new());
    let controller = h.controller(
        vec![qa_to_prod(false)],
        importer.clone(),
        RejectionPolicy::FreshChain,
    );

    let report = controller.start("qa-to-prod", "nightly-042", false).unwrap();

    assert_eq!(report.status, PromotionStatus::Failed);
    match report.error {
        Some(PromotionError::NotFound(ref err)) => {
            assert_eq!(err.environment, "prod");
            assert_eq!(err.secret_key, "PROD_OVERRIDES");
        }
        ref other => panic!("expected not-found error, got {other:?}"),
    }
    assert_eq!(importer.environments(), vec!["qa"]);

    let issue = report.issue.expect("tracking issue");
    let body = &h.backend.issue(&issue.id).draft.body;
    assert!(body.contains("**override set missing**"));
    assert!(body.contains("PROD_OVERRIDES"));
}

#[test]
fn rerun_skips_imported_environments_and_keeps_one_issue() {
    let h = Harness::new();
    h.export("nightly-042", NIGHTLY_TEMPLATE);
    full_overrides(&h);

    let importer = Arc::new(RecordingImporter::new());
    let controller = h.controller(
        vec![qa_to_prod(false)],
        importer.clone(),
        RejectionPolicy::FreshChain,
    );

    let first = controller.start("qa-to-prod", "nightly-042", false).unwrap();
    assert!(first.succeeded());

    let second = controller.start("qa-to-prod", "nightly-042", false).unwrap();

    assert!(second.succeeded());
    assert_ne!(first.request_id, second.request_id);
    assert_eq!(second.skipped, vec!["qa".to_string(), "prod".to_string()]);
    assert!(second.imported.is_empty());
    assert_eq!(importer.calls().len(), 2);

    assert_eq!(h.backend.issues().len(), 1);
    assert_eq!(
        first.issue.map(|i| i.id),
        second.issue.map(|i| i.id),
        "rerun must reuse the open issue"
    );
}

#[test]
fn forced_rerun_imports_again() {
    let h = Harness::new();
    h.export("nightly-042", NIGHTLY_TEMPLATE);
    full_overrides(&h);

    let importer = Arc::new(RecordingImporter::new());
    let controller = h.controller(
        vec![qa_to_prod(false)],
        importer.clone(),
        RejectionPolicy::FreshChain,
    );

    controller.start("qa-to-prod", "nightly-042", false).unwrap();
    let forced = controller.start("qa-to-prod", "nightly-042", true).unwrap();

    assert!(forced.succeeded());
    assert!(forced.skipped.is_empty());
    assert_eq!(importer.environments(), vec!["qa", "prod", "qa", "prod"]);
}

#[test]
fn rerun_after_fixing_overrides_recomputes_the_merge() {
    let h = Harness::new();
    h.export("nightly-042", NIGHTLY_TEMPLATE);
    h.set_overrides("QA_OVERRIDES", &[("DB_URL", "x"), ("API_KEY", "y")]);
    h.set_overrides("PROD_OVERRIDES", &[("DB_URL", "x")]);

    let importer = Arc::new(RecordingImporter::new());
    let controller = h.controller(
        vec![qa_to_prod(false)],
        importer.clone(),
        RejectionPolicy::FreshChain,
    );

    let failed = controller.start("qa-to-prod", "nightly-042", false).unwrap();
    assert_eq!(failed.status, PromotionStatus::Failed);

    h.set_overrides("PROD_OVERRIDES", &[("DB_URL", "x"), ("API_KEY", "fixed")]);
    let rerun = controller.start("qa-to-prod", "nightly-042", false).unwrap();

    assert!(rerun.succeeded());
    assert_eq!(rerun.skipped, vec!["qa".to_string()]);
    assert_eq!(rerun.imported, vec!["prod".to_string()]);
    assert!(importer.calls()[1].content.contains("fixed"));

    // The remediation issue is refreshed, not duplicated
    assert_eq!(h.backend.issues().len(), 1);
    let issue = rerun.issue.expect("tracking issue");
    let body = &h.backend.issue(&issue.id).draft.body;
    assert!(!body.contains("**missing keys**"));
}

#[test]
fn extra_override_keys_are_ignored() {
    let h = Harness::new();
    h.export("nightly-042", NIGHTLY_TEMPLATE);
    h.set_overrides(
        "QA_OVERRIDES",
        &[("DB_URL", "x"), ("API_KEY", "y"), ("UNUSED", "z")],
    );

    let importer = Arc::new(RecordingImporter::new());
    let plan = Plan::new("qa-only", vec![Environment::new("qa", false, "QA_OVERRIDES")]);
    let controller = h.controller(vec![plan], importer.clone(), RejectionPolicy::FreshChain);

    let report = controller.start("qa-only", "nightly-042", false).unwrap();

    assert!(report.succeeded());
    assert!(!importer.calls()[0].content.contains("UNUSED"));
}

#[test]
fn unknown_plan_and_artifact_are_errors() {
    let h = Harness::new();
    h.export("nightly-042", NIGHTLY_TEMPLATE);
    let controller = h.controller(
        vec![qa_to_prod(false)],
        Arc::new(RecordingImporter::new()),
        RejectionPolicy::FreshChain,
    );

    assert!(matches!(
        controller.start("dev-to-qa", "nightly-042", false),
        Err(PromotionError::InvalidState(_))
    ));
    assert!(matches!(
        controller.start("qa-to-prod", "nightly-999", false),
        Err(PromotionError::Export(ExportError::UnknownArtifact { .. }))
    ));

    // A path must not reach records outside the artifact store
    std::fs::write(h.state_dir().join("escaped.json"), "{}").unwrap();
    assert!(matches!(
        controller.start("qa-to-prod", "../escaped", false),
        Err(PromotionError::Export(ExportError::InvalidName { .. }))
    ));
}

#[test]
fn tampered_artifact_is_not_promoted() {
    let h = Harness::new();
    let artifact = h.export("nightly-042", NIGHTLY_TEMPLATE);
    full_overrides(&h);

    let importer = Arc::new(RecordingImporter::new());
    let controller = h.controller(
        vec![qa_to_prod(true)],
        importer.clone(),
        RejectionPolicy::FreshChain,
    );

    let waiting = controller.start("qa-to-prod", "nightly-042", false).unwrap();
    assert!(waiting.is_awaiting_approval());

    std::fs::write(artifact.artifact_dir.join("flow.bin"), b"patched").unwrap();
    let report = controller
        .approve(&waiting.request_id, "prod", "alice")
        .unwrap();

    assert_eq!(report.status, PromotionStatus::Failed);
    assert!(matches!(report.error, Some(PromotionError::Export(_))));
    assert_eq!(importer.environments(), vec!["qa"]);
}

#[test]
fn properties_template_is_filled_per_environment() {
    let h = Harness::new();
    let output = h.temp.path().join("outputs").join("billing");
    std::fs::create_dir_all(output.join("customization")).unwrap();
    std::fs::write(output.join("metadata.json"), r#"{"package": "billing"}"#).unwrap();
    std::fs::write(
        output.join("customization").join("icf-template.properties"),
        "## ----------------\ndb.url=jdbc:h2:mem\n#api.key=\n",
    )
    .unwrap();
    h.exporter()
        .export(
            &relay_core::artifact::SourceRef::new("qa-only", output, "7")
                .with_artifact_name("billing-7"),
        )
        .unwrap();
    h.set_overrides(
        "QA_OVERRIDES",
        &[("db.url", "jdbc:postgresql://qa"), ("api.key", "qa-key")],
    );

    let importer = Arc::new(RecordingImporter::new());
    let controller = h.controller(
        vec![Plan::new(
            "qa-only",
            vec![Environment::new("qa", false, "QA_OVERRIDES")],
        )],
        importer.clone(),
        RejectionPolicy::FreshChain,
    );

    let report = controller.start("qa-only", "billing-7", false).unwrap();

    assert!(report.succeeded());
    assert_eq!(
        importer.calls()[0].content,
        "## ----------------\ndb.url=jdbc:postgresql://qa\napi.key=qa-key\n"
    );
}

#[test]
fn artifact_without_a_template_promotes_without_keys() {
    let h = Harness::new();
    let output = h.temp.path().join("outputs").join("bare");
    std::fs::create_dir_all(&output).unwrap();
    std::fs::write(output.join("metadata.json"), r#"{"package": "bare"}"#).unwrap();
    std::fs::write(output.join("app.zip"), b"opaque package").unwrap();
    h.exporter()
        .export(
            &relay_core::artifact::SourceRef::new("qa-only", output, "8")
                .with_artifact_name("bare-8"),
        )
        .unwrap();
    h.set_overrides("QA_OVERRIDES", &[]);

    let importer = Arc::new(RecordingImporter::new());
    let controller = h.controller(
        vec![Plan::new(
            "qa-only",
            vec![Environment::new("qa", false, "QA_OVERRIDES")],
        )],
        importer.clone(),
        RejectionPolicy::FreshChain,
    );

    let report = controller.start("qa-only", "bare-8", false).unwrap();

    assert!(report.succeeded());
    assert!(report.issue.is_none());
    assert_eq!(importer.calls()[0].content, "");
    assert!(h.backend.issues().is_empty());
}
