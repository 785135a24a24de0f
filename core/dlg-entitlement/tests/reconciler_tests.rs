mod common;

use common::{
    FINGERPRINT, SECRET, ScriptedGateway, license_grant, open_store, reconciler, session_path,
    trial_grant,
};
use dlg_entitlement::session::checksum;
use dlg_entitlement::{
    AccessDecision, AccessMode, ActivityEvent, DenialReason, EntitlementError, LogoutOutcome,
    Operation, SessionDraft, TransportError, TrialPhase,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::fs;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn save_session(dir: &TempDir, fingerprint: &str) {
    open_store(dir)
        .save(SessionDraft {
            user_id: "u1".into(),
            email: "a@b.com".into(),
            device_fingerprint: fingerprint.into(),
            plan_name: "Pro".into(),
            expires_at: "2030-01-01".into(),
            ..SessionDraft::default()
        })
        .unwrap();
}

fn no_license_denial() -> Value {
    json!({
        "success": true,
        "access": false,
        "reason": "no_license",
        "should_clear_session": true,
        "trial_eligible": true,
        "user": {"id": "u1", "email": "a@b.com"}
    })
}

// ── login ────────────────────────────────────────────────────────

#[test]
fn login_grants_license_and_persists_session() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(&dir, ScriptedGateway::new().reply(license_grant()));

    let decision = r.login("a@b.com", "hunter2", None);

    let AccessDecision::Granted {
        mode, plan_name, expires_at, ..
    } = decision
    else {
        panic!("expected grant");
    };
    assert_eq!(mode, AccessMode::License);
    assert_eq!(plan_name.as_deref(), Some("Pro"));
    assert_eq!(expires_at.as_deref(), Some("2030-01-01"));
    assert!(r.is_authenticated());
    assert_eq!(r.access_type(), AccessMode::License);
    assert_eq!(r.display_name(), Some("Ana"));

    let store = open_store(&dir);
    let session = store.session().unwrap();
    assert_eq!(session.user_id, "u1");
    assert_eq!(session.device_fingerprint, FINGERPRINT);
    assert_eq!(session.plan_name, "Pro");
    assert!(!session.is_trial);
    assert_eq!(
        session.checksum,
        checksum("u1", "a@b.com", FINGERPRINT, SECRET)
    );
    assert!(store.verify_integrity(FINGERPRINT));
}

#[test]
fn login_sends_one_combined_request() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(&dir, ScriptedGateway::new().reply(license_grant()));
    r.login(" a@b.com ", "hunter2", Some("03AGdBq-token"));

    let calls = r.gateway().calls();
    assert_eq!(calls.len(), 1);
    let payload = &calls[0].payload;
    assert_eq!(calls[0].action, "full_login_check");
    assert_eq!(payload["email"], json!("a@b.com"));
    assert_eq!(payload["password"], json!("hunter2"));
    assert_eq!(payload["recaptcha_token"], json!("03AGdBq-token"));
    assert_eq!(payload["device_fingerprint"], json!(FINGERPRINT));
    assert_eq!(payload["device_name"], json!("test-host"));
}

#[test]
fn login_without_captcha_omits_token() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(&dir, ScriptedGateway::new().reply(license_grant()));
    r.login("a@b.com", "hunter2", Some(""));
    assert!(!r.gateway().calls()[0].payload.contains_key("recaptcha_token"));
}

#[test]
fn login_trial_grant_reports_trial_mode() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(&dir, ScriptedGateway::new().reply(trial_grant()));

    let decision = r.login("a@b.com", "pw", None);
    assert_eq!(decision.mode(), AccessMode::Trial);
    assert_eq!(r.plan_name(), Some("Trial"));
    assert!(r.license().is_none());

    let session = open_store(&dir).session().cloned().unwrap();
    assert!(session.is_trial);
    assert_eq!(session.plan_name, "Trial");
    assert_eq!(session.expires_at, "2030-01-01T12:00:00Z");
}

#[test]
fn login_device_limit_is_classified_and_not_persisted() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new().reply(json!({
            "success": false,
            "reason": "device_limit",
            "active_devices": 2,
            "max_devices": 1
        })),
    );

    let decision = r.login("a@b.com", "pw", None);
    assert_eq!(
        decision.denial_reason(),
        Some(&DenialReason::DeviceLimitExceeded {
            active_count: 2,
            max_allowed: 1,
            devices: Vec::new(),
        })
    );
    assert!(!r.is_authenticated());
    assert!(!session_path(&dir).exists());
}

#[test]
fn login_without_literal_access_fails_closed() {
    for access in [Value::Null, json!("true"), json!(1)] {
        let dir = TempDir::new().unwrap();
        let mut body = license_grant();
        body["access"] = access;
        let mut r = reconciler(&dir, ScriptedGateway::new().reply(body));

        let decision = r.login("a@b.com", "pw", None);
        assert!(!decision.is_granted());
        assert!(!r.validate_access().is_granted());
        assert!(!r.is_authenticated());
        assert!(!session_path(&dir).exists());
    }
}

#[test]
fn login_ban_after_grant_leaves_no_access() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new().reply(license_grant()).reply(json!({
            "success": false,
            "code": "BANNED",
            "reason": "Fraude detectada"
        })),
    );
    assert!(r.login("a@b.com", "pw", None).is_granted());

    let decision = r.login("a@b.com", "pw", None);
    assert_eq!(decision.denial_reason().map(DenialReason::code), Some("banned"));
    assert!(r.user().is_none());
    assert!(r.license().is_none());
    assert_eq!(r.ban().unwrap().reason.as_deref(), Some("Fraude detectada"));
    assert_eq!(
        r.validate_access().denial_reason().map(DenialReason::code),
        Some("banned")
    );
}

#[test]
fn login_transport_failure_is_not_a_denial() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new().fail(TransportError::Connection("refused".into())),
    );

    let decision = r.login("a@b.com", "pw", None);
    assert_eq!(
        decision,
        AccessDecision::TransportFailed {
            error: TransportError::Connection("refused".into())
        }
    );
    assert!(!r.is_authenticated());
    assert_eq!(r.gateway().call_count(), 1);
}

#[test]
fn login_server_error_is_not_a_denial() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new().reply_with_status(500, json!({"success": false, "error": "boom"})),
    );

    let decision = r.login("a@b.com", "pw", None);
    assert!(
        matches!(decision, AccessDecision::TransportFailed { .. }),
        "{decision:?}"
    );
    assert!(decision.denial_reason().is_none());
    assert!(!session_path(&dir).exists());
}

#[test]
fn login_succeeds_when_session_cannot_be_saved() {
    let dir = TempDir::new().unwrap();
    // A directory where the session file should be makes the rename fail.
    fs::create_dir_all(session_path(&dir).join("blocker")).unwrap();
    let mut r = reconciler(&dir, ScriptedGateway::new().reply(license_grant()));

    assert!(r.login("a@b.com", "pw", None).is_granted());
    assert!(r.is_authenticated());
}

// ── verify session ───────────────────────────────────────────────

#[test]
fn verify_without_session_makes_no_network_call() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(&dir, ScriptedGateway::new());

    assert_eq!(r.verify_session(), AccessDecision::NoSession);
    assert_eq!(r.gateway().call_count(), 0);
}

#[test]
fn verify_with_foreign_fingerprint_deletes_session() {
    let dir = TempDir::new().unwrap();
    save_session(&dir, "another-device");
    let mut r = reconciler(&dir, ScriptedGateway::new());

    assert_eq!(r.verify_session(), AccessDecision::NoSession);
    assert_eq!(r.gateway().call_count(), 0);
    assert!(!session_path(&dir).exists());
}

#[test]
fn verify_with_tampered_checksum_deletes_session() {
    let dir = TempDir::new().unwrap();
    save_session(&dir, FINGERPRINT);
    let path = session_path(&dir);
    let mut record: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    record["user_id"] = json!("u2");
    fs::write(&path, record.to_string()).unwrap();

    let mut r = reconciler(&dir, ScriptedGateway::new());
    assert_eq!(r.verify_session(), AccessDecision::NoSession);
    assert_eq!(r.gateway().call_count(), 0);
    assert!(!path.exists());
}

#[test]
fn verify_timeout_keeps_session_untouched() {
    let dir = TempDir::new().unwrap();
    save_session(&dir, FINGERPRINT);
    let before = fs::read_to_string(session_path(&dir)).unwrap();
    let mut r = reconciler(&dir, ScriptedGateway::new().fail(TransportError::Timeout));

    let decision = r.verify_session();
    assert_eq!(
        decision,
        AccessDecision::TransportFailed {
            error: TransportError::Timeout
        }
    );
    assert_eq!(fs::read_to_string(session_path(&dir)).unwrap(), before);
    assert!(!r.is_authenticated());
}

#[test]
fn verify_server_error_keeps_session() {
    let dir = TempDir::new().unwrap();
    save_session(&dir, FINGERPRINT);
    let before = fs::read_to_string(session_path(&dir)).unwrap();
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new().reply_with_status(
            500,
            json!({"success": false, "error": "connection pool exhausted"}),
        ),
    );

    let decision = r.verify_session();
    assert!(
        matches!(
            decision,
            AccessDecision::TransportFailed {
                error: TransportError::Other(_)
            }
        ),
        "{decision:?}"
    );
    assert_eq!(fs::read_to_string(session_path(&dir)).unwrap(), before);
    assert!(!r.is_authenticated());
}

#[test]
fn verify_rejected_api_key_keeps_session() {
    let dir = TempDir::new().unwrap();
    save_session(&dir, FINGERPRINT);
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new()
            .reply_with_status(401, json!({"success": false, "error": "API key inválida"})),
    );

    let decision = r.verify_session();
    assert!(
        matches!(decision, AccessDecision::TransportFailed { .. }),
        "{decision:?}"
    );
    assert!(session_path(&dir).exists());
    assert!(open_store(&dir).verify_integrity(FINGERPRINT));
}

#[test]
fn verify_device_limit_keeps_session_and_lists_devices() {
    let dir = TempDir::new().unwrap();
    save_session(&dir, FINGERPRINT);
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new().reply(json!({
            "success": true,
            "access": false,
            "reason": "device_limit",
            "should_clear_session": false,
            "max_devices": 1,
            "active_devices": 1,
            "devices": [{"device_id": "d-office", "device_name": "OFFICE-PC"}]
        })),
    );

    let decision = r.verify_session();
    let Some(DenialReason::DeviceLimitExceeded { devices, .. }) = decision.denial_reason() else {
        panic!("expected device limit, got {decision:?}");
    };
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_id, "d-office");
    assert!(session_path(&dir).exists());
}

#[test]
fn verify_grant_renews_session() {
    let dir = TempDir::new().unwrap();
    save_session(&dir, FINGERPRINT);
    let mut body = license_grant();
    body["plan_name"] = json!("Premium");
    let mut r = reconciler(&dir, ScriptedGateway::new().reply(body));

    assert!(r.verify_session().is_granted());
    let calls = r.gateway().calls();
    assert_eq!(calls[0].action, "verify_session");
    assert_eq!(calls[0].payload["user_id"], json!("u1"));
    assert_eq!(calls[0].payload["device_id"], json!(FINGERPRINT));

    let store = open_store(&dir);
    assert_eq!(store.session().unwrap().plan_name, "Premium");
    assert!(store.verify_integrity(FINGERPRINT));
}

#[test]
fn verify_grant_with_clear_flag_drops_session() {
    let dir = TempDir::new().unwrap();
    save_session(&dir, FINGERPRINT);
    let mut body = license_grant();
    body["should_clear_session"] = json!(true);
    let mut r = reconciler(&dir, ScriptedGateway::new().reply(body));

    assert!(r.verify_session().is_granted());
    assert!(!session_path(&dir).exists());
}

#[test]
fn verify_denial_clears_session_unless_told_otherwise() {
    let dir = TempDir::new().unwrap();
    save_session(&dir, FINGERPRINT);
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new().reply(json!({
            "success": false,
            "access": false,
            "reason": "banned",
            "ban_reason": "chargeback"
        })),
    );

    assert_eq!(
        r.verify_session().denial_reason().map(DenialReason::code),
        Some("banned")
    );
    assert!(!session_path(&dir).exists());
}

#[test]
fn verify_maintenance_keeps_session() {
    let dir = TempDir::new().unwrap();
    save_session(&dir, FINGERPRINT);
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new().reply(json!({
            "success": false,
            "access": false,
            "reason": "maintenance",
            "should_clear_session": false
        })),
    );

    assert_eq!(
        r.verify_session().denial_reason(),
        Some(&DenialReason::Maintenance)
    );
    assert!(session_path(&dir).exists());
}

#[test]
fn verify_no_license_then_register_trial() {
    let dir = TempDir::new().unwrap();
    save_session(&dir, FINGERPRINT);
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new().reply(no_license_denial()).reply(json!({
            "success": true,
            "trial": {"active": true, "expires_at": "2030-01-04T00:00:00Z", "duration_days": 3}
        })),
    );

    assert_eq!(
        r.verify_session().denial_reason(),
        Some(&DenialReason::NoLicenseOrTrial {
            trial_eligible: true
        })
    );
    assert!(!session_path(&dir).exists());
    assert!(r.is_authenticated());
    assert!(!r.validate_access().is_granted());

    let trial = r.register_trial().unwrap();
    assert_eq!(trial.phase(), TrialPhase::Active);
    assert_eq!(r.access_type(), AccessMode::Trial);
    assert_eq!(r.validate_access().mode(), AccessMode::Trial);

    let calls = r.gateway().calls();
    assert_eq!(calls[1].action, "register_trial");
    assert_eq!(calls[1].payload["user_id"], json!("u1"));
    assert_eq!(calls[1].payload["device_fingerprint"], json!(FINGERPRINT));
}

// ── logout ───────────────────────────────────────────────────────

#[test]
fn logout_twice_succeeds_and_leaves_no_session() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new()
            .reply(license_grant())
            .reply(json!({"success": true, "message": "Logout realizado"})),
    );
    r.login("a@b.com", "pw", None);

    assert_eq!(
        r.logout(),
        LogoutOutcome::LoggedOut {
            remote_notified: true
        }
    );
    assert_eq!(r.logout(), LogoutOutcome::AlreadyLoggedOut);
    assert!(!session_path(&dir).exists());
    assert!(!r.is_authenticated());
    assert_eq!(r.access_type(), AccessMode::None);

    let calls = r.gateway().calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].action, "logout");
    assert_eq!(calls[1].payload["user_id"], json!("u1"));
    assert_eq!(calls[1].payload["device_id"], json!(FINGERPRINT));
    assert_eq!(calls[1].payload["device_fingerprint"], json!(FINGERPRINT));
}

#[test]
fn logout_clears_locally_when_server_unreachable() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new()
            .reply(license_grant())
            .fail(TransportError::Timeout),
    );
    r.login("a@b.com", "pw", None);
    assert!(session_path(&dir).exists());

    assert_eq!(
        r.logout(),
        LogoutOutcome::LoggedOut {
            remote_notified: false
        }
    );
    assert!(!session_path(&dir).exists());
    assert!(r.user().is_none());
}

#[test]
fn logout_uses_saved_session_user() {
    let dir = TempDir::new().unwrap();
    save_session(&dir, FINGERPRINT);
    let mut r = reconciler(&dir, ScriptedGateway::new().reply(json!({"success": true})));

    assert_eq!(
        r.logout(),
        LogoutOutcome::LoggedOut {
            remote_notified: true
        }
    );
    assert_eq!(r.gateway().calls()[0].payload["user_id"], json!("u1"));
    assert!(!session_path(&dir).exists());
}

#[test]
fn logout_without_user_makes_no_call() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(&dir, ScriptedGateway::new());
    assert_eq!(r.logout(), LogoutOutcome::AlreadyLoggedOut);
    assert_eq!(r.gateway().call_count(), 0);
}

// ── refreshes ────────────────────────────────────────────────────

#[test]
fn check_license_requires_login() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(&dir, ScriptedGateway::new());
    assert!(matches!(
        r.check_license(),
        Err(EntitlementError::NotAuthenticated)
    ));
    assert!(matches!(
        r.register_trial(),
        Err(EntitlementError::NotAuthenticated)
    ));
    assert_eq!(r.gateway().call_count(), 0);
}

#[test]
fn check_license_updates_only_license() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new()
            .reply(license_grant())
            .reply(json!({
                "success": true,
                "trial": {"exists": true, "active": true, "expires_at": "2030-01-01T00:00:00Z"}
            }))
            .reply(json!({"success": true, "hasLicense": false, "license": null})),
    );
    r.login("a@b.com", "pw", None);
    r.check_trial().unwrap();
    let trial_before = r.trial().cloned();

    assert_eq!(r.check_license().unwrap(), None);
    assert!(r.license().is_none());
    assert_eq!(r.trial().cloned(), trial_before);
    assert_eq!(r.access_type(), AccessMode::Trial);
    assert_eq!(r.gateway().calls()[2].payload["user_id"], json!("u1"));
}

#[test]
fn check_trial_updates_only_trial() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new().reply(license_grant()).reply(json!({
            "success": true,
            "trial": {"exists": true, "active": false, "eligible": false, "expired": true}
        })),
    );
    r.login("a@b.com", "pw", None);
    let license_before = r.license().cloned();

    let trial = r.check_trial().unwrap();
    assert_eq!(trial.phase(), TrialPhase::Expired);
    assert_eq!(r.license().cloned(), license_before);
    assert_eq!(r.access_type(), AccessMode::License);
    assert_eq!(
        r.gateway().calls()[1].payload["device_fingerprint"],
        json!(FINGERPRINT)
    );
}

#[test]
fn failed_refresh_keeps_state() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new()
            .reply(license_grant())
            .fail(TransportError::Timeout),
    );
    r.login("a@b.com", "pw", None);

    assert!(matches!(
        r.check_license(),
        Err(EntitlementError::Transport(TransportError::Timeout))
    ));
    assert_eq!(r.license().map(|l| l.plan_name.as_str()), Some("Pro"));
}

#[test]
fn register_trial_refused() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new()
            .reply(no_license_denial())
            .reply(json!({"success": false, "code": "TRIAL_ALREADY_USED"})),
    );
    r.login("a@b.com", "pw", None);

    let err = r.register_trial().unwrap_err();
    assert!(matches!(err, EntitlementError::Rejected { code: Some(ref c), .. } if c == "TRIAL_ALREADY_USED"));
    assert_eq!(r.access_type(), AccessMode::None);
}

#[test]
fn check_credentials_adopts_nothing() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new().reply(json!({
            "success": true,
            "user": {"id": "u1", "email": "a@b.com"}
        })),
    );

    let user = r.check_credentials("a@b.com", "pw").unwrap();
    assert_eq!(user.id, "u1");
    assert!(!r.is_authenticated());
    assert!(!session_path(&dir).exists());
    assert_eq!(r.gateway().actions(), vec!["login"]);
}

#[test]
fn captcha_settings_are_fetched() {
    let dir = TempDir::new().unwrap();
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new().reply(json!({
            "success": true,
            "enabled": true,
            "site_key": "6Lc-site"
        })),
    );

    let settings = r.captcha_settings().unwrap();
    assert!(settings.enabled);
    assert_eq!(r.gateway().actions(), vec!["get_recaptcha_settings"]);
}

// ── activity ─────────────────────────────────────────────────────

#[test]
fn every_operation_reports_start_and_finish() {
    let dir = TempDir::new().unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let mut r = reconciler(
        &dir,
        ScriptedGateway::new().fail(TransportError::Timeout),
    );
    r.add_observer(move |event: ActivityEvent| sink.lock().unwrap().push(event));

    r.login("a@b.com", "pw", None);
    r.verify_session();
    let _ = r.check_license();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            ActivityEvent::Started(Operation::Login),
            ActivityEvent::Finished(Operation::Login),
            ActivityEvent::Started(Operation::VerifySession),
            ActivityEvent::Finished(Operation::VerifySession),
            ActivityEvent::Started(Operation::CheckLicense),
            ActivityEvent::Finished(Operation::CheckLicense),
        ]
    );
}
