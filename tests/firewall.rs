//! Security group reconciliation against the in-memory cloud.

use std::time::Duration;

use hostwright::poller::{ReadinessWait, WaitContext};
use hostwright::security::{self, ReconcileReport};
use hostwright::test_support::{FakeCall, FakeCloud};
use hostwright::{BackoffPolicy, FirewallIntent, FirewallMode, Protocol, SecurityRule};
use rstest::{fixture, rstest};
use tokio_util::sync::CancellationToken;

const GROUP: &str = "hostwright";

#[fixture]
fn policy() -> BackoffPolicy {
    BackoffPolicy {
        initial_interval: Duration::from_secs(1),
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: Duration::from_secs(4),
        max_elapsed_time: Duration::from_secs(30),
    }
}

fn tcp(port: u16) -> SecurityRule {
    SecurityRule::open(Protocol::Tcp, port)
}

fn intent(rules: Vec<SecurityRule>, mode: FirewallMode) -> FirewallIntent {
    FirewallIntent {
        group: String::from(GROUP),
        network: None,
        target_tag: String::from(GROUP),
        rules,
        mode,
    }
}

async fn reconcile(
    cloud: &FakeCloud,
    policy: &BackoffPolicy,
    intent: &FirewallIntent,
) -> ReconcileReport {
    let cancel = CancellationToken::new();
    let context = WaitContext {
        policy: Some(policy),
        readiness: ReadinessWait::default(),
        cancel: &cancel,
    };
    security::reconcile(cloud, intent, &context)
        .await
        .unwrap_or_else(|err| panic!("reconcile: {err}"))
}

#[rstest]
#[tokio::test]
async fn one_missing_port_is_opened_once(policy: BackoffPolicy) {
    let cloud = FakeCloud::new();
    cloud.with_security_group(GROUP, Vec::new());
    let wanted = intent(vec![tcp(8080)], FirewallMode::Managed);

    let first = reconcile(&cloud, &policy, &wanted).await;
    let calls_after_first = cloud.count(FakeCall::AddSecurityRules);
    let second = reconcile(&cloud, &policy, &wanted).await;

    assert_eq!(first.added, vec![tcp(8080)]);
    assert_eq!(calls_after_first, 1);
    assert!(second.added.is_empty());
    assert_eq!(cloud.count(FakeCall::AddSecurityRules), 1);
}

#[rstest]
#[case::empty_group(vec![], vec![tcp(2376), tcp(3376)])]
#[case::partially_open(vec![tcp(2376)], vec![tcp(2376), tcp(3376)])]
#[case::already_open(vec![tcp(2376), tcp(3376)], vec![tcp(2376)])]
#[case::foreign_rules(
    vec![SecurityRule::open(Protocol::Udp, 53), tcp(9000)],
    vec![tcp(2376)]
)]
#[tokio::test]
async fn reconciliation_never_removes_existing_rules(
    policy: BackoffPolicy,
    #[case] existing: Vec<SecurityRule>,
    #[case] desired: Vec<SecurityRule>,
) {
    let cloud = FakeCloud::new();
    cloud.with_security_group(GROUP, existing.clone());

    let _report = reconcile(&cloud, &policy, &intent(desired.clone(), FirewallMode::Managed)).await;

    let after = cloud.group_rules(GROUP);
    for rule in existing.iter().chain(&desired) {
        assert!(after.contains(rule), "{rule} missing from {after:?}");
    }
    assert!(cloud.count(FakeCall::AddSecurityRules) <= 1);
}

#[rstest]
#[tokio::test]
async fn absent_group_is_created_before_rules_are_added(policy: BackoffPolicy) {
    let cloud = FakeCloud::new();

    let report = reconcile(&cloud, &policy, &intent(vec![tcp(2376)], FirewallMode::Managed)).await;

    assert!(report.group_id.is_some());
    assert_eq!(cloud.count(FakeCall::CreateSecurityGroup), 1);
    assert_eq!(cloud.group_rules(GROUP), vec![tcp(2376)]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn lagging_group_visibility_is_awaited(policy: BackoffPolicy) {
    let cloud = FakeCloud::new();
    cloud.set_group_visibility_lag(2);

    let report = reconcile(&cloud, &policy, &intent(vec![tcp(2376)], FirewallMode::Managed)).await;

    assert_eq!(report.added, vec![tcp(2376)]);
    assert_eq!(cloud.count(FakeCall::CreateSecurityGroup), 1);
}

#[rstest]
#[case::group_present(true)]
#[case::group_absent(false)]
#[tokio::test]
async fn read_only_mode_reports_without_mutating(policy: BackoffPolicy, #[case] present: bool) {
    let cloud = FakeCloud::new();
    if present {
        cloud.with_security_group(GROUP, vec![tcp(2376)]);
    }

    let report = reconcile(
        &cloud,
        &policy,
        &intent(vec![tcp(2376), tcp(8080)], FirewallMode::ReadOnly),
    )
    .await;

    assert!(report.missing.contains(&tcp(8080)));
    assert!(report.added.is_empty());
    assert!(cloud.mutations().is_empty(), "mutations: {:?}", cloud.mutations());
}

#[rstest]
#[tokio::test]
async fn skip_mode_touches_nothing(policy: BackoffPolicy) {
    let cloud = FakeCloud::new();

    let report = reconcile(&cloud, &policy, &intent(vec![tcp(2376)], FirewallMode::Skip)).await;

    assert_eq!(report, ReconcileReport::default());
    assert!(cloud.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn narrower_source_ranges_still_count_as_open(policy: BackoffPolicy) {
    let cloud = FakeCloud::new();
    cloud.with_security_group(
        GROUP,
        vec![SecurityRule {
            protocol: Protocol::Tcp,
            port: 2376,
            source_range: String::from("10.0.0.0/8"),
        }],
    );

    let report = reconcile(&cloud, &policy, &intent(vec![tcp(2376)], FirewallMode::Managed)).await;

    assert!(report.added.is_empty());
    assert_eq!(cloud.count(FakeCall::AddSecurityRules), 0);
}
