mod support;

use std::sync::Arc;

use relay_core::error::PromotionError;
use relay_core::promotion::{Decision, PromotionStatus, RejectionPolicy, StageFailure};

use support::{Harness, NIGHTLY_TEMPLATE, RecordingImporter, qa_to_prod};

fn setup() -> (Harness, Arc<RecordingImporter>) {
    let h = Harness::new();
    h.export("nightly-042", NIGHTLY_TEMPLATE);
    h.set_overrides(
        "QA_OVERRIDES",
        &[("DB_URL", "postgres://qa"), ("API_KEY", "qa-key")],
    );
    h.set_overrides(
        "PROD_OVERRIDES",
        &[("DB_URL", "postgres://prod"), ("API_KEY", "prod-key")],
    );
    (h, Arc::new(RecordingImporter::new()))
}

#[test]
fn approval_suspends_and_resumes_the_chain() {
    let (h, importer) = setup();
    let controller = h.controller(
        vec![qa_to_prod(true)],
        importer.clone(),
        RejectionPolicy::FreshChain,
    );

    let waiting = controller.start("qa-to-prod", "nightly-042", false).unwrap();

    assert!(waiting.is_awaiting_approval());
    assert!(!waiting.succeeded());
    assert!(waiting.error.is_none());
    assert_eq!(waiting.environment.as_deref(), Some("prod"));
    assert_eq!(waiting.imported, vec!["qa".to_string()]);
    assert_eq!(importer.environments(), vec!["qa"]);

    // A fresh controller stands in for a later process picking the request up
    let later = h.controller(
        vec![qa_to_prod(true)],
        importer.clone(),
        RejectionPolicy::FreshChain,
    );
    let done = later.approve(&waiting.request_id, "prod", "alice").unwrap();

    assert!(done.succeeded());
    assert_eq!(done.imported, vec!["prod".to_string()]);
    assert_eq!(importer.environments(), vec!["qa", "prod"]);

    let request = later.request(&waiting.request_id).unwrap();
    let approval = request.stages[1].approval.as_ref().expect("approval kept");
    assert_eq!(approval.decision, Decision::Approved);
    assert_eq!(approval.reviewer, "alice");
}

#[test]
fn resume_without_approval_keeps_waiting() {
    let (h, importer) = setup();
    let controller = h.controller(
        vec![qa_to_prod(true)],
        importer.clone(),
        RejectionPolicy::FreshChain,
    );

    let waiting = controller.start("qa-to-prod", "nightly-042", false).unwrap();
    let resumed = controller.resume(&waiting.request_id).unwrap();

    assert!(resumed.is_awaiting_approval());
    assert_eq!(importer.environments(), vec!["qa"]);

    // Promoting again continues the same request instead of starting over
    let again = controller.start("qa-to-prod", "nightly-042", false).unwrap();
    assert_eq!(again.request_id, waiting.request_id);
    assert!(again.is_awaiting_approval());
}

#[test]
fn changed_overrides_discard_an_earlier_approval() {
    let (h, importer) = setup();
    let controller = h.controller(
        vec![qa_to_prod(true)],
        importer.clone(),
        RejectionPolicy::FreshChain,
    );

    let waiting = controller.start("qa-to-prod", "nightly-042", false).unwrap();

    h.set_overrides(
        "PROD_OVERRIDES",
        &[("DB_URL", "postgres://prod-2"), ("API_KEY", "rotated")],
    );
    let stale = controller
        .approve(&waiting.request_id, "prod", "alice")
        .unwrap();

    assert!(stale.is_awaiting_approval());
    assert!(stale.warnings.iter().any(|w| w.contains("changed")));
    assert_eq!(importer.environments(), vec!["qa"]);

    let approved = controller
        .approve(&waiting.request_id, "prod", "alice")
        .unwrap();
    assert!(approved.succeeded());
    assert!(importer.calls()[1].content.contains("rotated"));
}

#[test]
fn approving_the_wrong_environment_is_refused() {
    let (h, importer) = setup();
    let controller = h.controller(
        vec![qa_to_prod(true)],
        importer.clone(),
        RejectionPolicy::FreshChain,
    );

    let waiting = controller.start("qa-to-prod", "nightly-042", false).unwrap();

    assert!(matches!(
        controller.approve(&waiting.request_id, "qa", "alice"),
        Err(PromotionError::InvalidState(_))
    ));
    assert!(matches!(
        controller.approve("nightly-042.qa-to-prod.9", "prod", "alice"),
        Err(PromotionError::InvalidState(_))
    ));
}

#[test]
fn rejection_under_fresh_chain_ends_the_chain() {
    let (h, importer) = setup();
    let controller = h.controller(
        vec![qa_to_prod(true)],
        importer.clone(),
        RejectionPolicy::FreshChain,
    );

    let waiting = controller.start("qa-to-prod", "nightly-042", false).unwrap();
    let rejected = controller
        .reject(
            &waiting.request_id,
            "prod",
            Some("wrong endpoint".to_string()),
            "bob",
        )
        .unwrap();

    assert_eq!(rejected.status, PromotionStatus::Failed);
    assert_eq!(rejected.environment.as_deref(), Some("prod"));
    assert!(matches!(
        controller.retry(&waiting.request_id),
        Err(PromotionError::InvalidState(_))
    ));

    let request = controller.request(&waiting.request_id).unwrap();
    assert_eq!(
        request.stages[1].failure,
        Some(StageFailure::Rejected {
            reviewer: "bob".to_string(),
            reason: Some("wrong endpoint".to_string()),
        })
    );

    // A fresh chain starts from a new request; qa is not imported twice
    let fresh = controller.start("qa-to-prod", "nightly-042", false).unwrap();
    assert_ne!(fresh.request_id, waiting.request_id);
    assert_eq!(fresh.skipped, vec!["qa".to_string()]);
    assert!(fresh.is_awaiting_approval());
    assert_eq!(importer.environments(), vec!["qa"]);
}

#[test]
fn rejection_under_allow_reentry_can_be_retried() {
    let (h, importer) = setup();
    let controller = h.controller(
        vec![qa_to_prod(true)],
        importer.clone(),
        RejectionPolicy::AllowReentry,
    );

    let waiting = controller.start("qa-to-prod", "nightly-042", false).unwrap();
    controller
        .reject(&waiting.request_id, "prod", None, "bob")
        .unwrap();

    let retried = controller.retry(&waiting.request_id).unwrap();
    assert_eq!(retried.request_id, waiting.request_id);
    assert!(retried.is_awaiting_approval());

    let done = controller
        .approve(&waiting.request_id, "prod", "alice")
        .unwrap();
    assert!(done.succeeded());
    assert_eq!(importer.environments(), vec!["qa", "prod"]);
}

#[test]
fn retry_needs_a_rejected_stage() {
    let (h, importer) = setup();
    let controller = h.controller(
        vec![qa_to_prod(true)],
        importer,
        RejectionPolicy::AllowReentry,
    );

    let waiting = controller.start("qa-to-prod", "nightly-042", false).unwrap();

    assert!(matches!(
        controller.retry(&waiting.request_id),
        Err(PromotionError::InvalidState(_))
    ));
}

#[test]
fn abandoned_chain_does_not_block_a_fresh_one() {
    let (h, importer) = setup();
    let controller = h.controller(
        vec![qa_to_prod(true)],
        importer.clone(),
        RejectionPolicy::FreshChain,
    );

    let waiting = controller.start("qa-to-prod", "nightly-042", false).unwrap();
    let abandoned = controller
        .abandon(&waiting.request_id, "release cancelled")
        .unwrap();

    assert_eq!(abandoned.status, PromotionStatus::Failed);
    let request = controller.request(&waiting.request_id).unwrap();
    assert!(matches!(
        request.stages[1].failure,
        Some(StageFailure::Abandoned { ref reason }) if reason == "release cancelled"
    ));

    // Already terminal
    assert!(matches!(
        controller.abandon(&waiting.request_id, "again"),
        Err(PromotionError::InvalidState(_))
    ));

    let fresh = controller.start("qa-to-prod", "nightly-042", false).unwrap();
    assert_ne!(fresh.request_id, waiting.request_id);
    assert!(fresh.is_awaiting_approval());
}

#[test]
fn finished_requests_cannot_be_approved() {
    let (h, importer) = setup();
    let controller = h.controller(
        vec![qa_to_prod(true)],
        importer,
        RejectionPolicy::FreshChain,
    );

    let waiting = controller.start("qa-to-prod", "nightly-042", false).unwrap();
    controller
        .approve(&waiting.request_id, "prod", "alice")
        .unwrap();

    assert!(matches!(
        controller.approve(&waiting.request_id, "prod", "alice"),
        Err(PromotionError::InvalidState(_))
    ));
    assert!(matches!(
        controller.abandon(&waiting.request_id, "late"),
        Err(PromotionError::InvalidState(_))
    ));
}
