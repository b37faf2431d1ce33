mod support;

use std::sync::Arc;
use std::thread;

use relay_core::error::PromotionError;
use relay_core::promotion::{PromotionStatus, RejectionPolicy};
use relay_core::types::{Environment, Plan};

use support::{GateImporter, Harness, NIGHTLY_TEMPLATE, qa_to_prod};

fn setup() -> Harness {
    let h = Harness::new();
    h.export("nightly-042", NIGHTLY_TEMPLATE);
    h.set_overrides("QA_OVERRIDES", &[("DB_URL", "x"), ("API_KEY", "y")]);
    h.set_overrides("PROD_OVERRIDES", &[("DB_URL", "x"), ("API_KEY", "z")]);
    h
}

#[test]
fn second_run_of_the_same_request_is_refused_while_importing() {
    let h = setup();
    let gate = Arc::new(GateImporter::new());
    let first = h.controller(
        vec![qa_to_prod(false)],
        gate.clone(),
        RejectionPolicy::FreshChain,
    );
    let second = h.controller(
        vec![qa_to_prod(false)],
        gate.clone(),
        RejectionPolicy::FreshChain,
    );

    thread::scope(|s| {
        let running = s.spawn(|| first.start("qa-to-prod", "nightly-042", false));
        gate.wait_entered();

        let err = second
            .start("qa-to-prod", "nightly-042", false)
            .unwrap_err();
        match err {
            PromotionError::Concurrent(ref concurrent) => {
                assert_eq!(concurrent.artifact_name, "nightly-042");
                assert!(concurrent.scope.starts_with("request"));
            }
            ref other => panic!("expected concurrent promotion error, got {other:?}"),
        }
        assert!(err.is_retryable());

        gate.release();
        let report = running.join().unwrap().unwrap();
        assert!(report.succeeded());
    });

    assert_eq!(gate.inner.environments(), vec!["qa", "prod"]);
}

#[test]
fn two_plans_never_import_the_same_pair_at_once() {
    let h = setup();
    let qa_only = Plan::new("qa-only", vec![Environment::new("qa", false, "QA_OVERRIDES")]);
    let gate = Arc::new(GateImporter::new());
    let long = h.controller(
        vec![qa_to_prod(false), qa_only.clone()],
        gate.clone(),
        RejectionPolicy::FreshChain,
    );
    let short = h.controller(
        vec![qa_to_prod(false), qa_only],
        gate.clone(),
        RejectionPolicy::FreshChain,
    );

    thread::scope(|s| {
        let running = s.spawn(|| long.start("qa-to-prod", "nightly-042", false));
        gate.wait_entered();

        let err = short.start("qa-only", "nightly-042", false).unwrap_err();
        match err {
            PromotionError::Concurrent(ref concurrent) => {
                assert_eq!(concurrent.scope, "environment 'qa'");
            }
            ref other => panic!("expected concurrent promotion error, got {other:?}"),
        }

        gate.release();
        assert!(running.join().unwrap().unwrap().succeeded());
    });

    // Exactly one import reached qa; the retried plan finds it done
    let retried = short.start("qa-only", "nightly-042", false).unwrap();
    assert_eq!(retried.status, PromotionStatus::Succeeded);
    assert_eq!(retried.skipped, vec!["qa".to_string()]);
    assert_eq!(gate.inner.environments(), vec!["qa", "prod"]);
}

#[test]
fn concurrent_chains_share_one_tracking_issue() {
    let h = setup();
    let controllers: Vec<_> = (0..4)
        .map(|_| {
            h.controller(
                vec![qa_to_prod(true)],
                Arc::new(support::RecordingImporter::new()),
                RejectionPolicy::FreshChain,
            )
        })
        .collect();

    // Only one of these creates the request; every caller sees the same issue
    let reports: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = controllers
            .iter()
            .map(|c| s.spawn(move || c.start("qa-to-prod", "nightly-042", false)))
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert!(reports.iter().any(|r| r.is_ok()));
    for report in &reports {
        if let Err(err) = report {
            assert!(matches!(err, PromotionError::Concurrent(_)), "{err}");
        }
    }
    assert_eq!(h.backend.issues().len(), 1);
}
