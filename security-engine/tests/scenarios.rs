//! End-to-end scenarios through the composed engine

use chrono::Duration;
use rust_decimal_macros::dec;
use security_engine::{
    audit::SearchCriteria,
    incidents::{IncidentStatus, IncidentType, NewIncident},
    keys::KeyStatus,
    mfa::MfaMethod,
    rbac::{AccessContext, Permission, PermissionConditions, ResourceRef, Role},
    totp, Clock, Config, Error, ManualClock, RequestContext, SecretRecord, SecurityEngine, Severity,
};
use std::sync::Arc;

const MASTER: &str = "scenario-master-secret-0123456789abcdefghij";
const A: &str = "11111111-aaaa-4bbb-8ccc-222222222222";
const B: &str = "33333333-dddd-4eee-8fff-444444444444";

struct Harness {
    _dir: tempfile::TempDir,
    clock: Arc<ManualClock>,
    engine: SecurityEngine,
}

fn harness_with(configure: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.environment = "scenario".into();
    config.keys.rsa_bits = 1024;
    config.vault.storage_dir = dir.path().join("vault");
    config.audit.archive_dir = dir.path().join("archive");
    config.mfa.backup_hash_memory_kib = 8;
    config.mfa.backup_hash_iterations = 1;
    configure(&mut config);

    let clock = ManualClock::starting_now();
    let engine = SecurityEngine::build(config, MASTER, clock.clone()).unwrap();
    Harness {
        _dir: dir,
        clock,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn client() -> RequestContext {
    RequestContext::client(
        "203.0.113.10".parse().unwrap(),
        "Mozilla/5.0 (X11; Linux x86_64) Firefox/121.0",
    )
}

#[test]
fn test_credential_rotation() {
    let h = harness();
    let vault = h.engine.vault();

    vault.store(A, None, "ops@example.com").unwrap();
    vault.rotate(B, Some("scheduled"), "ops@example.com").unwrap();

    assert_eq!(vault.get_guid().unwrap(), B);
    assert_eq!(vault.get_backup_guid().unwrap().as_deref(), Some(A));

    let history = vault.rotation_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].old_preview, "11111111****");
    assert_eq!(history[0].new_preview, "33333333****");

    let rotated = h
        .engine
        .audit()
        .search(&SearchCriteria::new().event_type("credential_rotated"))
        .unwrap();
    assert_eq!(rotated.total, 1);
    let raw = serde_json::to_string(&rotated.items).unwrap();
    assert!(!raw.contains(B));
}

#[test]
fn test_tampered_vault_file_falls_back_to_environment() {
    const FALLBACK_ENV: &str = "SCENARIO_TAMPER_REGISTRY_GUID";
    std::env::set_var(FALLBACK_ENV, B);
    let h = harness_with(|config| config.vault.fallback_env = FALLBACK_ENV.into());
    let vault = h.engine.vault();

    vault.store(A, None, "ops").unwrap();
    assert_eq!(vault.get_guid().unwrap(), A);

    let path = h.engine.config().vault.storage_dir.join("credentials.encrypted");
    let mut record = SecretRecord::from_envelope(std::fs::read_to_string(&path).unwrap().trim()).unwrap();
    record.ciphertext[0] ^= 0x01;
    std::fs::write(&path, record.to_envelope()).unwrap();
    vault.clear_cache();

    assert_eq!(vault.get_guid().unwrap(), B);
    let fallbacks = h
        .engine
        .audit()
        .search(&SearchCriteria::new().event_type("credential_fallback_used"))
        .unwrap();
    assert_eq!(fallbacks.total, 1);
    assert!(h
        .engine
        .metrics()
        .gather_text()
        .unwrap()
        .contains("security_credential_fallbacks_total 1"));
}

#[test]
fn test_audit_search_and_timeline() {
    let h = harness();
    let audit = h.engine.audit();
    let ctx = client();

    for _ in 0..3 {
        audit.log_authentication("login", Some("u42"), &ctx, serde_json::json!({}));
        h.clock.advance(Duration::minutes(10));
    }
    audit.log_security_incident("Credential stuffing detected", Some("u42"), &ctx, serde_json::json!({}));

    let critical = audit
        .search(&SearchCriteria::new().severity(Severity::Critical))
        .unwrap();
    assert_eq!(critical.total, 1);
    assert_eq!(critical.items[0].event_type, "security_incident");

    let timeline = audit.activity_timeline("u42", 1).unwrap();
    let today = h.clock.now().date_naive();
    let start = (h.clock.now() - Duration::minutes(30)).date_naive();
    let bucketed: usize = timeline.values().map(Vec::len).sum();
    assert_eq!(bucketed, 4);
    assert!(timeline.keys().all(|day| *day == today || *day == start));
}

#[test]
fn test_refresh_is_single_use() {
    let h = harness();
    let tokens = h.engine.tokens();
    let ctx = client();

    let pair = tokens.issue_tokens("u1", ["orders:read"], &ctx).unwrap();
    assert!(tokens.validate(&pair.access_token, &ctx).is_ok());

    let next = tokens.refresh(&pair.refresh_token, &ctx).unwrap();
    assert!(tokens.validate(&next.access_token, &ctx).is_ok());
    assert!(matches!(
        tokens.refresh(&pair.refresh_token, &ctx),
        Err(Error::TokenBlacklisted(_))
    ));

    // the access token paired with the spent refresh token is gone too
    assert!(tokens.validate(&pair.access_token, &ctx).is_err());
}

#[test]
fn test_mfa_lockout_and_single_reset() {
    let h = harness();
    let mfa = h.engine.mfa();
    let ctx = client();

    let payload = mfa.enroll("u7", "u7@example.com", MfaMethod::Totp, None).unwrap();
    let secret = payload.secret.clone().unwrap();
    let code = totp::code_at(&secret, h.clock.now()).unwrap();
    mfa.confirm_enrollment("u7", &code, &ctx).unwrap();

    for _ in 0..5 {
        assert!(!mfa.verify("u7", "not-a-code", &ctx).unwrap());
    }
    assert!(matches!(mfa.verify("u7", "not-a-code", &ctx), Err(Error::Locked { .. })));

    h.clock.advance(Duration::minutes(31));
    assert!(!mfa.verify("u7", "not-a-code", &ctx).unwrap());
    assert!(!mfa.verify("u7", "not-a-code", &ctx).unwrap());

    let code = totp::code_at(&secret, h.clock.now()).unwrap();
    assert!(mfa.verify("u7", &code, &ctx).unwrap());
}

#[test]
fn test_permission_conditions_are_conjunctive() {
    let h = harness();
    let rbac = h.engine.rbac();

    rbac.create_role(Role::new("support", "Support")).unwrap();
    rbac.create_permission(Permission::new("refunds.issue", "Issue refunds", "payments"))
        .unwrap();
    let conditions = PermissionConditions {
        owner_only: true,
        max_amount: Some(dec!(100)),
        ..PermissionConditions::default()
    };
    rbac.grant_permission("support", "refunds.issue", Some(conditions)).unwrap();
    rbac.assign_role("agent", "support", Some("admin"), None).unwrap();

    let allowed = AccessContext::for_user("agent").with_owner("agent").with_amount(dec!(80));
    let not_owner = AccessContext::for_user("agent").with_owner("someone").with_amount(dec!(80));
    let over_limit = AccessContext::for_user("agent").with_owner("agent").with_amount(dec!(120));

    assert!(rbac.has_permission("agent", "refunds.issue", Some(&allowed)).unwrap());
    assert!(!rbac.has_permission("agent", "refunds.issue", Some(&not_owner)).unwrap());
    assert!(!rbac.has_permission("agent", "refunds.issue", Some(&over_limit)).unwrap());

    let own = ResourceRef {
        id: Some("r-1".into()),
        owner_id: Some("agent".into()),
        amount: Some(dec!(20)),
    };
    assert!(rbac.can("agent", "issue", "refunds", Some(&own)).unwrap());

    assert!(matches!(
        rbac.authorize("agent", "refunds.issue", Some(&over_limit)),
        Err(Error::PermissionDenied(_))
    ));
    let denied = h
        .engine
        .audit()
        .search(&SearchCriteria::new().event_type("access_denied"))
        .unwrap();
    assert_eq!(denied.total, 1);
}

#[test]
fn test_concurrent_rotation_leaves_one_active_key() {
    let h = harness();
    let keys = h.engine.keys();
    keys.active_key("reports").unwrap();

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| keys.rotate_key("reports").unwrap());
        }
    });

    let all = keys.list_keys(Some("reports")).unwrap();
    assert_eq!(all.len(), 9);
    assert_eq!(all.iter().filter(|k| k.status == KeyStatus::Active).count(), 1);
}

#[test]
fn test_critical_incident_lifecycle() {
    let h = harness();
    let incidents = h.engine.incidents();

    let report = NewIncident::new(
        IncidentType::UnauthorizedAccess,
        Severity::Critical,
        "Admin console reached from unknown network",
    )
    .affecting("admin-console");
    let incident = incidents.create_incident(report, Some("soc"), &client()).unwrap();
    assert!(incident.incident_id.starts_with("INC-"));

    incidents
        .update_status(&incident.incident_id, IncidentStatus::Investigating, "soc", None)
        .unwrap();
    let resolved = incidents
        .resolve(&incident.incident_id, "Access revoked", "soc", Some("Leaked VPN credentials"))
        .unwrap();
    assert_eq!(resolved.status, IncidentStatus::Resolved);

    let text = h.engine.metrics().gather_text().unwrap();
    assert!(text.contains("security_critical_alerts_total 1"));
}
