//! Signing-flow integration tests: pipeline composition, readiness gating,
//! principal filtering, seal semantics and sign idempotency, exercised
//! without the HTTP layer.

use std::sync::Arc;

use inscribe::auth::{AuthPipeline, Credentials, PasswordBackend, PipelineEntry};
use inscribe::auth::password::hash_password;
use inscribe::config::RealmConfig;
use inscribe::identity::{AuthContext, SessionState, SessionStore};
use inscribe::signer::{LocalSigner, SerializedSigner, SignerBackend};
use inscribe::signflow::{get_cert, SignRequest};
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, HashAlg, LineEnding, PrivateKey};

fn password_entry(
    id: &str,
    required: bool,
    order: i64,
    users: Vec<(&str, &str, Vec<&str>)>,
) -> PipelineEntry {
    let backend = PasswordBackend::from_users(
        id,
        id,
        users.into_iter().map(|(user, password, principals)| {
            (
                user.to_string(),
                hash_password(password).unwrap(),
                principals.into_iter().map(str::to_string).collect(),
            )
        }),
    );
    PipelineEntry {
        backend: Arc::new(backend),
        required,
        order,
        principals_allow: vec![],
        claims_filter: vec![],
    }
}

/// Two required factors, as in a password + IdP deployment.
fn two_factor_pipeline() -> AuthPipeline {
    AuthPipeline::new(vec![
        password_entry("pw", true, 1, vec![("alice", "wonderland", vec!["alice", "dev"])]),
        password_entry("idp", true, 2, vec![("alice", "0tp", vec!["alice", "ops", "dev"])]),
    ])
    .unwrap()
}

fn context_for(pipeline: &AuthPipeline, subject_key: &PrivateKey) -> AuthContext {
    let mut ctx = AuthContext::new("default", pipeline.all_ids(), pipeline.required_ids(), 300);
    ctx.set_pubkey(subject_key.public_key().clone()).unwrap();
    ctx
}

fn test_signer(ca: PrivateKey) -> SerializedSigner {
    SerializedSigner::new(Arc::new(LocalSigner::from_key("test", ca)))
}

fn pw(username: &str, password: &str) -> Credentials {
    Credentials::Password { username: username.into(), password: password.into() }
}

async fn complete_both_factors(pipeline: &AuthPipeline, ctx: &mut AuthContext) {
    pipeline.step(ctx, None, &pw("alice", "wonderland")).await.unwrap();
    pipeline.step(ctx, None, &pw("alice", "0tp")).await.unwrap();
    assert_eq!(ctx.state(), SessionState::Ready);
}

#[tokio::test]
async fn include_glob_narrows_merged_principals() {
    let pipeline = two_factor_pipeline();
    let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let ca_fp = ca.public_key().fingerprint(HashAlg::Sha256);
    let signer = test_signer(ca);
    let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let mut ctx = context_for(&pipeline, &subject);
    complete_both_factors(&pipeline, &mut ctx).await;

    let realm = RealmConfig::default();
    let request = SignRequest {
        lifetime_secs: Some(600),
        include: Some("d*".to_string()),
        exclude: None,
    };
    let signed = get_cert(&mut ctx, &pipeline, &realm, &signer, &request).await.unwrap();

    // {alice, dev} ∪ {alice, ops, dev} filtered by d* leaves exactly dev.
    assert_eq!(signed.principals, vec!["dev".to_string()]);
    assert!(signed.key_id.starts_with("alice/"));
    assert!(signed.key_id.contains("idp+pw"));
    assert!(signed.key_id.ends_with("@default"));

    // Requested ten minutes, minus the 30s backdated start.
    let window = signed.valid_before - signed.valid_after;
    assert!((600..=660).contains(&window), "window was {}s", window);

    let cert = ssh_key::Certificate::from_openssh(&signed.certificate).unwrap();
    cert.validate([&ca_fp].into_iter()).unwrap();
    assert_eq!(cert.valid_principals(), &["dev".to_string()]);
}

#[tokio::test]
async fn exclude_glob_drops_principals_and_empty_result_denied() {
    let pipeline = two_factor_pipeline();
    let signer = test_signer(PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap());
    let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let mut ctx = context_for(&pipeline, &subject);
    complete_both_factors(&pipeline, &mut ctx).await;

    let realm = RealmConfig::default();
    let request = SignRequest {
        lifetime_secs: Some(600),
        include: None,
        exclude: Some("*".to_string()),
    };
    let err = get_cert(&mut ctx, &pipeline, &realm, &signer, &request).await.unwrap_err();
    assert_eq!(err.kind(), "policy_denied");
    // The failed sign left the session unsigned and still Ready.
    assert_eq!(ctx.state(), SessionState::Ready);
}

#[tokio::test]
async fn sign_before_all_required_factors_is_not_ready() {
    let pipeline = two_factor_pipeline();
    let signer = test_signer(PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap());
    let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let mut ctx = context_for(&pipeline, &subject);
    pipeline.step(&mut ctx, None, &pw("alice", "wonderland")).await.unwrap();
    assert_eq!(ctx.state(), SessionState::AwaitAuth);

    let err = get_cert(&mut ctx, &pipeline, &RealmConfig::default(), &signer, &SignRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_ready");
}

#[tokio::test]
async fn sealed_signer_keeps_session_ready_and_key_id_stable() {
    let pipeline = two_factor_pipeline();
    let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let passphrase = "hunter2";
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("ca_key");
    let encrypted = ca.encrypt(&mut OsRng, passphrase).unwrap();
    std::fs::write(&key_path, encrypted.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();
    let signer =
        SerializedSigner::new(Arc::new(LocalSigner::from_file("test", &key_path, None).unwrap()));
    assert!(signer.is_sealed());

    let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let mut ctx = context_for(&pipeline, &subject);
    complete_both_factors(&pipeline, &mut ctx).await;

    let realm = RealmConfig::default();
    let request = SignRequest { lifetime_secs: Some(600), include: None, exclude: None };
    let err = get_cert(&mut ctx, &pipeline, &realm, &signer, &request).await.unwrap_err();
    assert_eq!(err.kind(), "signer_sealed");
    assert_eq!(ctx.state(), SessionState::Ready);

    signer.unseal(passphrase).await.unwrap();
    let signed = get_cert(&mut ctx, &pipeline, &realm, &signer, &request).await.unwrap();
    assert!(signed.key_id.starts_with("alice/"));
}

#[tokio::test]
async fn repeated_sign_returns_identical_certificate_bytes() {
    let pipeline = two_factor_pipeline();
    let signer = test_signer(PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap());
    let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let mut ctx = context_for(&pipeline, &subject);
    complete_both_factors(&pipeline, &mut ctx).await;

    let realm = RealmConfig::default();
    let first = get_cert(&mut ctx, &pipeline, &realm, &signer, &SignRequest::default())
        .await
        .unwrap();
    assert_eq!(ctx.state(), SessionState::Signed);

    // A different request body cannot change the recorded certificate.
    let second = get_cert(
        &mut ctx,
        &pipeline,
        &realm,
        &signer,
        &SignRequest { lifetime_secs: Some(60), include: Some("nothing*".into()), exclude: None },
    )
    .await
    .unwrap();
    assert_eq!(first.certificate, second.certificate);
}

#[tokio::test]
async fn expired_session_is_unreachable_through_the_store() {
    let pipeline = two_factor_pipeline();
    let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let store = SessionStore::new();
    let mut ctx = context_for(&pipeline, &subject);
    ctx.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
    let (sid, _) = store.insert(ctx).unwrap();
    assert!(store.get(&sid).is_none());
}

#[tokio::test]
async fn concurrent_sessions_sign_through_one_signer() {
    let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let signer = Arc::new(test_signer(ca));
    let pipeline = Arc::new(two_factor_pipeline());

    let mut handles = Vec::new();
    for _ in 0..6 {
        let signer = Arc::clone(&signer);
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
            let mut ctx = context_for(&pipeline, &subject);
            complete_both_factors(&pipeline, &mut ctx).await;
            get_cert(
                &mut ctx,
                &pipeline,
                &RealmConfig::default(),
                signer.as_ref(),
                &SignRequest::default(),
            )
            .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    // The FIFO gate admitted one sign at a time.
    assert_eq!(signer.peak_concurrency(), 1);
}
