//! Client-library flow against a live server: password + public-key
//! challenge factors, challenge replay, and principal filtering through the
//! client API.

use std::net::SocketAddr;

use inscribe::auth::password::hash_password;
use inscribe::client::{
    answer_nonce_challenge, session_id_from_token, ClientConfig, InscribeClient,
};
use inscribe::config::Config;
use inscribe::server::{build_router, AppState};
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};

struct TestServer {
    addr: SocketAddr,
    #[allow(dead_code)]
    dir: tempfile::TempDir,
}

/// Server with two required factors: password and public-key challenge. The
/// challenge trust root is the user's own key.
async fn spawn_two_factor_server(user_key: &PrivateKey) -> TestServer {
    let dir = tempfile::tempdir().unwrap();

    let auth_path = dir.path().join("users");
    let phc = hash_password("wonderland").unwrap();
    std::fs::write(&auth_path, format!("alice:{}:alice,dev\n", phc)).unwrap();

    let roots_path = dir.path().join("trust_roots");
    let mut trusted = user_key.public_key().clone();
    trusted.set_comment("alice@laptop");
    std::fs::write(&roots_path, format!("{}\n", trusted.to_openssh().unwrap())).unwrap();

    let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let key_path = dir.path().join("ca_key");
    std::fs::write(&key_path, ca.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();

    let yaml = format!(
        r#"
admin_secret: "adm1n"
realm:
  session_ttl_secs: 60
  min_lifetime_secs: 60
  max_lifetime_secs: 3600
authenticators:
  - id: pw
    type: password
    required: true
    order: 1
    auth_file: {auth}
  - id: pk
    type: pubkey
    required: true
    order: 2
    trust_roots_file: {roots}
signer:
  id: main
  type: local
  key_file: {key}
"#,
        auth = auth_path.display(),
        roots = roots_path.display(),
        key = key_path.display(),
    );
    let config = Config::from_yaml(&yaml).unwrap();
    let state = AppState::from_config(&config).unwrap();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer { addr, dir }
}

fn client_for(addr: SocketAddr) -> InscribeClient {
    let config = ClientConfig {
        url: format!("http://{}", addr),
        ..ClientConfig::default()
    };
    InscribeClient::new(&config).unwrap()
}

#[tokio::test]
async fn two_factor_flow_through_the_client() {
    let user_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let server = spawn_two_factor_server(&user_key).await;
    let client = client_for(server.addr);

    let session = client
        .create_session(&user_key.public_key().to_openssh().unwrap())
        .await
        .unwrap();
    assert_eq!(session.authenticators.len(), 2);

    // Factor one: password.
    let step = client
        .auth_step(
            &session.token,
            "pw",
            serde_json::json!({ "username": "alice", "password": "wonderland" }),
        )
        .await
        .unwrap();
    assert_eq!(step.status, "ok");
    assert!(!step.ready);

    // Factor two: nonce challenge answered with the trusted key.
    let opened = client.auth_step(&session.token, "pk", serde_json::json!({})).await.unwrap();
    assert_eq!(opened.status, "continue");
    let challenge = opened.challenge.unwrap();
    let nonce = challenge["nonce"].as_str().unwrap();
    let audience = challenge["audience"].as_str().unwrap();
    let sid = session_id_from_token(&session.token).unwrap();
    let pem = answer_nonce_challenge(&user_key, &sid, nonce, audience).unwrap();

    let step = client
        .auth_step(&session.token, "pk", serde_json::json!({ "signature": pem.clone() }))
        .await
        .unwrap();
    assert_eq!(step.status, "ok");
    assert!(step.ready);

    // Replay of the consumed signature fails.
    let replay = client
        .auth_step(&session.token, "pk", serde_json::json!({ "signature": pem }))
        .await;
    assert!(replay.is_err());

    let signed = client
        .sign(&session.token, Some("10m"), Some("{alice,alice@laptop}"), None)
        .await
        .unwrap();
    assert_eq!(
        signed.principals,
        vec!["alice".to_string(), "alice@laptop".to_string()]
    );
    assert!(signed.key_id.starts_with("alice/"));

    client.logout(&session.token).await.unwrap();
    let after = client.sign(&session.token, None, None, None).await;
    assert!(after.is_err());
}

#[tokio::test]
async fn stale_signature_against_a_fresh_nonce_fails() {
    let user_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let server = spawn_two_factor_server(&user_key).await;
    let client = client_for(server.addr);

    let session = client
        .create_session(&user_key.public_key().to_openssh().unwrap())
        .await
        .unwrap();
    let sid = session_id_from_token(&session.token).unwrap();

    let opened = client.auth_step(&session.token, "pk", serde_json::json!({})).await.unwrap();
    let first = opened.challenge.unwrap();
    let stale = answer_nonce_challenge(
        &user_key,
        &sid,
        first["nonce"].as_str().unwrap(),
        first["audience"].as_str().unwrap(),
    )
    .unwrap();

    // Open a fresh challenge; the stale signature no longer matches.
    let _ = client.auth_step(&session.token, "pk", serde_json::json!({})).await.unwrap();
    let replay = client
        .auth_step(&session.token, "pk", serde_json::json!({ "signature": stale }))
        .await;
    assert!(replay.is_err());
}
