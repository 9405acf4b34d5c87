//! Unit tests for BackendRecord registration and deregistration

use std::time::Duration;

use kube::ResourceExt;

use lbcf_operator::controller::backends::{
    AttachTarget, BackendSettings, RecordOwner, build_record,
};
use lbcf_operator::controller::conditions::{condition_types, find_condition, is_condition_true};
use lbcf_operator::controller::{OwnerKind, SyncResult, reconcile_backend_record};
use lbcf_operator::crd::{
    BackendDescriptor, BackendRecord, BackendRecordStatus, ConditionStatus, EnsurePolicy,
    FINALIZER_DEREGISTER, PortSelector,
};
use lbcf_operator::driver::TransportError;
use lbcf_operator::store::has_finalizer;

use crate::common::*;

fn owner(name: &str) -> RecordOwner {
    RecordOwner {
        kind: OwnerKind::BackendGroup,
        namespace: NAMESPACE.to_string(),
        name: name.to_string(),
        reference: None,
    }
}

fn attach(lb_name: &str) -> AttachTarget {
    AttachTarget {
        lb_name: lb_name.to_string(),
        lb_driver: DRIVER.to_string(),
        lb_info: string_map(&[("lbID", "lb-123")]),
        lb_attributes: string_map(&[("tier", "web")]),
    }
}

fn static_record(group: &str, addr: &str) -> BackendRecord {
    build_record(
        &owner(group),
        &attach("lb-a"),
        BackendDescriptor::Static {
            addr: addr.to_string(),
        },
        &BackendSettings {
            parameters: string_map(&[("weight", "10")]),
            ensure_policy: None,
        },
    )
}

fn pod_record(group: &str, pod: &str, port: i32) -> BackendRecord {
    build_record(
        &owner(group),
        &attach("lb-a"),
        BackendDescriptor::Pod {
            name: pod.to_string(),
            port: PortSelector::tcp(port),
        },
        &BackendSettings::default(),
    )
}

fn registered(addr: &str) -> BackendRecordStatus {
    BackendRecordStatus {
        backend_addr: Some(addr.to_string()),
        conditions: vec![lbcf_operator::controller::conditions::new_condition(
            condition_types::REGISTERED,
            ConditionStatus::True,
            "Succeeded",
            "",
        )],
        observed_generation: Some(1),
    }
}

async fn reconcile(env: &TestEnv, name: &str) -> SyncResult {
    reconcile_backend_record(&env.ctx, NAMESPACE, name)
        .await
        .unwrap()
}

mod register_tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_then_ensure_in_one_pass() {
        let env = TestEnv::new();
        let record = env.seed_record(static_record("g", "1.1.1.1:80"));

        let result = reconcile(&env, &record.name_any()).await;
        assert!(result.is_finished());

        let record = env.record(&record.name_any()).unwrap();
        let status = record.status.clone().unwrap();
        assert_eq!(status.backend_addr.as_deref(), Some("1.1.1.1:80"));
        assert!(is_condition_true(&status.conditions, condition_types::ADDR_GENERATED));
        assert!(is_condition_true(&status.conditions, condition_types::REGISTERED));
        assert_eq!(status.observed_generation, Some(1));

        let generate = env.driver.calls("generateBackendAddr");
        assert_eq!(generate.len(), 1);
        assert_eq!(generate[0].body["static"], "1.1.1.1:80");
        assert_eq!(generate[0].body["lbInfo"]["lbID"], "lb-123");

        let ensure = env.driver.calls("ensureBackend");
        assert_eq!(ensure.len(), 1);
        assert_eq!(ensure[0].body["backendAddr"], "1.1.1.1:80");
        assert_eq!(ensure[0].body["parameters"]["weight"], "10");
        assert_eq!(ensure[0].body["lbAttributes"]["tier"], "web");
        assert_eq!(
            ensure[0].body["recordID"],
            format!("{}/{}", NAMESPACE, record.name_any())
        );
        assert!(env.events.reasons().contains(&"BackendRegistered".to_string()));
    }

    #[tokio::test]
    async fn test_retry_ids_change_per_attempt() {
        let env = TestEnv::new();
        let record = env.seed_record(static_record("g", "1.1.1.1:80"));
        env.driver
            .push("ensureBackend", Reply::json(fail("not yet", 5)));

        reconcile(&env, &record.name_any()).await;
        reconcile(&env, &record.name_any()).await;

        let calls = env.driver.calls("ensureBackend");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].body["recordID"], calls[1].body["recordID"]);
        assert_ne!(calls[0].body["retryID"], calls[1].body["retryID"]);
    }

    #[tokio::test]
    async fn test_pod_address_comes_from_pod() {
        let env = TestEnv::new();
        env.seed_pod(pod("web-1", &[("app", "web")], Some("10.1.0.7")));
        let record = env.seed_record(pod_record("g", "web-1", 8080));

        reconcile(&env, &record.name_any()).await;

        let generate = env.driver.calls("generateBackendAddr");
        assert_eq!(generate[0].body["pod"]["metadata"]["name"], "web-1");
        let status = env.record(&record.name_any()).unwrap().status.unwrap();
        assert_eq!(status.backend_addr.as_deref(), Some("10.1.0.7"));
    }

    #[tokio::test]
    async fn test_service_request_carries_node_and_port() {
        let env = TestEnv::new();
        env.seed_service(service("frontend"));
        env.seed_node(node("node-1", &[]));
        let record = env.seed_record(build_record(
            &owner("g"),
            &attach("lb-a"),
            BackendDescriptor::Service {
                name: "frontend".to_string(),
                node_name: "node-1".to_string(),
                port: PortSelector::tcp(80),
            },
            &BackendSettings::default(),
        ));

        reconcile(&env, &record.name_any()).await;

        let body = &env.driver.calls("generateBackendAddr")[0].body;
        assert_eq!(body["service"]["service"]["metadata"]["name"], "frontend");
        assert_eq!(body["service"]["node"]["metadata"]["name"], "node-1");
        assert_eq!(body["service"]["port"], 80);
        assert_eq!(body["service"]["protocol"], "TCP");
    }

    #[tokio::test]
    async fn test_missing_pod_is_an_error() {
        let env = TestEnv::new();
        let record = env.seed_record(pod_record("g", "gone", 80));

        let err = reconcile_backend_record(&env.ctx, NAMESPACE, &record.name_any())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(env.driver.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_generate_running_skips_ensure() {
        let env = TestEnv::new();
        let record = env.seed_record(static_record("g", "1.1.1.1:80"));
        env.driver
            .push("generateBackendAddr", Reply::json(running("allocating", 3)));

        let result = reconcile(&env, &record.name_any()).await;
        assert_eq!(result, SyncResult::running(Duration::from_secs(3)));
        assert_eq!(env.driver.call_count("ensureBackend"), 0);

        let status = env.record(&record.name_any()).unwrap().status.unwrap();
        assert!(status.backend_addr.is_none());
        let registered = find_condition(&status.conditions, condition_types::REGISTERED).unwrap();
        assert_eq!(registered.status, ConditionStatus::False);
        assert_eq!(registered.reason.as_deref(), Some("InProgress"));
    }

    #[tokio::test]
    async fn test_succ_without_address_is_malformed() {
        let env = TestEnv::new();
        let record = env.seed_record(static_record("g", "1.1.1.1:80"));
        env.driver.push("generateBackendAddr", Reply::json(succ()));

        let result = reconcile(&env, &record.name_any()).await;
        assert!(matches!(
            result,
            SyncResult::Failed {
                retry_after: None,
                ..
            }
        ));
        assert_eq!(env.driver.call_count("ensureBackend"), 0);
    }

    #[tokio::test]
    async fn test_ensure_fail_sets_registered_false() {
        let env = TestEnv::new();
        let record = env.seed_record(static_record("g", "1.1.1.1:80"));
        env.driver
            .push("ensureBackend", Reply::json(fail("port conflict", 45)));

        let result = reconcile(&env, &record.name_any()).await;
        assert_eq!(
            result,
            SyncResult::failed_after("port conflict", Duration::from_secs(45))
        );

        let status = env.record(&record.name_any()).unwrap().status.unwrap();
        assert_eq!(status.backend_addr.as_deref(), Some("1.1.1.1:80"));
        let registered = find_condition(&status.conditions, condition_types::REGISTERED).unwrap();
        assert_eq!(registered.status, ConditionStatus::False);
        assert_eq!(registered.reason.as_deref(), Some("RegisterFailed"));
        assert_eq!(registered.message.as_deref(), Some("port conflict"));

        // the next pass only retries the ensure
        let result = reconcile(&env, &record.name_any()).await;
        assert!(result.is_finished());
        assert_eq!(env.driver.call_count("generateBackendAddr"), 1);
        assert_eq!(env.driver.call_count("ensureBackend"), 2);
    }

    #[tokio::test]
    async fn test_late_transport_error_keeps_generated_address() {
        let env = TestEnv::new();
        let record = env.seed_record(static_record("g", "1.1.1.1:80"));
        env.driver.push(
            "ensureBackend",
            Reply::Error(TransportError::Timeout(Duration::from_secs(10))),
        );

        let result = reconcile(&env, &record.name_any()).await;
        assert!(result.is_failed());

        let status = env.record(&record.name_any()).unwrap().status.unwrap();
        assert_eq!(status.backend_addr.as_deref(), Some("1.1.1.1:80"));
        assert!(is_condition_true(&status.conditions, condition_types::ADDR_GENERATED));
        assert!(find_condition(&status.conditions, condition_types::REGISTERED).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_driver_times_out() {
        let env = TestEnv::new();
        let record = env.seed_record(static_record("g", "1.1.1.1:80"));
        env.driver.push("ensureBackend", Reply::Hang);

        let result = reconcile(&env, &record.name_any()).await;
        match result {
            SyncResult::Failed {
                reason,
                retry_after,
            } => {
                assert!(reason.contains("timed out"), "unexpected reason: {reason}");
                assert_eq!(retry_after, None);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_registered_record_is_not_ensured_again() {
        let env = TestEnv::new();
        let record = env.seed_record(static_record("g", "1.1.1.1:80"));
        reconcile(&env, &record.name_any()).await;
        reconcile(&env, &record.name_any()).await;

        assert_eq!(env.driver.call_count("ensureBackend"), 1);
    }

    #[tokio::test]
    async fn test_always_policy_ensures_every_pass() {
        let env = TestEnv::new();
        let mut record = static_record("g", "1.1.1.1:80");
        record.spec.ensure_policy = Some(EnsurePolicy::always(45));
        let record = env.seed_record(record);

        for _ in 0..3 {
            let result = reconcile(&env, &record.name_any()).await;
            assert_eq!(result, SyncResult::periodic(Duration::from_secs(45)));
        }
        assert_eq!(env.driver.call_count("ensureBackend"), 3);
        // registration is announced once
        let registered_events = env
            .events
            .reasons()
            .into_iter()
            .filter(|r| r == "BackendRegistered")
            .count();
        assert_eq!(registered_events, 1);
    }
}

mod deregister_tests {
    use super::*;

    #[tokio::test]
    async fn test_record_without_address_is_released_silently() {
        let env = TestEnv::new();
        let record = env.seed_record(static_record("g", "1.1.1.1:80"));
        env.delete_record(&record.name_any()).await;

        let result = reconcile(&env, &record.name_any()).await;
        assert!(result.is_finished());
        assert!(env.record(&record.name_any()).is_none());
        assert_eq!(env.driver.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_deregister_succ_releases_record() {
        let env = TestEnv::new();
        let record = env.seed_record(static_record("g", "1.1.1.1:80"));
        reconcile(&env, &record.name_any()).await;
        env.delete_record(&record.name_any()).await;

        let result = reconcile(&env, &record.name_any()).await;
        assert!(result.is_finished());
        assert!(env.record(&record.name_any()).is_none());

        let calls = env.driver.calls("deregisterBackend");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].body["backendAddr"], "1.1.1.1:80");
        assert!(env.events.reasons().contains(&"BackendDeregistered".to_string()));
    }

    #[tokio::test]
    async fn test_deregister_fail_keeps_guard() {
        let env = TestEnv::new();
        let record = env.seed_record(static_record("g", "1.1.1.1:80"));
        reconcile(&env, &record.name_any()).await;
        env.delete_record(&record.name_any()).await;
        env.driver
            .push("deregisterBackend", Reply::json(fail("busy", 12)));

        let result = reconcile(&env, &record.name_any()).await;
        assert_eq!(
            result,
            SyncResult::failed_after("busy", Duration::from_secs(12))
        );

        let record = env.record(&record.name_any()).unwrap();
        assert!(has_finalizer(&record, FINALIZER_DEREGISTER));
        let status = record.status.unwrap();
        let registered = find_condition(&status.conditions, condition_types::REGISTERED).unwrap();
        assert_eq!(registered.status, ConditionStatus::Unknown);
        assert_eq!(registered.reason.as_deref(), Some("DeregisterFailed"));
    }

    #[tokio::test]
    async fn test_deregister_running_keeps_guard() {
        let env = TestEnv::new();
        let record = env.seed_record(static_record("g", "1.1.1.1:80"));
        reconcile(&env, &record.name_any()).await;
        env.delete_record(&record.name_any()).await;
        env.driver
            .push("deregisterBackend", Reply::json(running("draining", 7)));

        let result = reconcile(&env, &record.name_any()).await;
        assert_eq!(result, SyncResult::running(Duration::from_secs(7)));
        assert!(env.record(&record.name_any()).is_some());
    }

    #[tokio::test]
    async fn test_ensure_waits_for_predecessor_with_same_address() {
        let env = TestEnv::new();
        let mut old = static_record("g-old", "10.0.0.5:80");
        old.status = Some(registered("10.0.0.5:80"));
        let old = env.seed_record(old);
        env.delete_record(&old.name_any()).await;
        let new = env.seed_record(static_record("g-new", "10.0.0.5:80"));

        let result = reconcile(&env, &new.name_any()).await;
        assert_eq!(result, SyncResult::running(Duration::from_secs(5)));
        assert_eq!(env.driver.call_count("ensureBackend"), 0);
        let status = env.record(&new.name_any()).unwrap().status.unwrap();
        let registered_cond =
            find_condition(&status.conditions, condition_types::REGISTERED).unwrap();
        assert_eq!(registered_cond.status, ConditionStatus::False);
        assert_eq!(registered_cond.reason.as_deref(), Some("DelayedEnsure"));

        // predecessor goes away, then the new record registers
        reconcile(&env, &old.name_any()).await;
        assert!(env.record(&old.name_any()).is_none());
        let result = reconcile(&env, &new.name_any()).await;
        assert!(result.is_finished());
        assert_eq!(env.driver.call_count("ensureBackend"), 1);
        let status = env.record(&new.name_any()).unwrap().status.unwrap();
        assert!(is_condition_true(&status.conditions, condition_types::REGISTERED));
    }

    #[tokio::test]
    async fn test_predecessor_on_another_load_balancer_does_not_block() {
        let env = TestEnv::new();
        let mut old = build_record(
            &owner("g-old"),
            &attach("lb-b"),
            BackendDescriptor::Static {
                addr: "10.0.0.5:80".to_string(),
            },
            &BackendSettings::default(),
        );
        old.status = Some(registered("10.0.0.5:80"));
        let old = env.seed_record(old);
        env.delete_record(&old.name_any()).await;
        let new = env.seed_record(static_record("g-new", "10.0.0.5:80"));

        let result = reconcile(&env, &new.name_any()).await;
        assert!(result.is_finished());
        assert_eq!(env.driver.call_count("ensureBackend"), 1);
    }
}
