//!
//! sshi client binary
//! ------------------
//! Obtains a short-lived SSH user certificate from an inscribed server:
//! creates a session with a public key, walks the authenticators, requests
//! the signature and loads the result into the local SSH agent.
//!
//! Configuration comes from SSH_INSCRIBE_* environment variables with CLI
//! flags taking precedence.

use std::path::PathBuf;
use std::process::exit;

use anyhow::{anyhow, Context, Result};
use inscribe::client::{
    add_to_agent, answer_nonce_challenge, generate_keypair, load_private_key,
    session_id_from_token, AuthenticatorInfo, ClientConfig, ClientError, InscribeClient,
    EXIT_AUTH_OR_CONFIG, EXIT_OK, EXIT_SERVER,
};

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        i += 1;
    }
    None
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn usage() {
    println!(
        "sshi - obtain SSH certificates from an inscribed server\n\n\
         USAGE:\n  sshi [req] [OPTIONS]\n\n\
         OPTIONS:\n  \
         --url URL        Server URL ($SSH_INSCRIBE_URL)\n  \
         --login a,b      Authenticate against specific endpoints ($SSH_INSCRIBE_LOGIN_AUTH_ENDPOINTS)\n  \
         --include GLOB   Keep only matching principals ($SSH_INSCRIBE_INCLUDE_PRINCIPALS)\n  \
         --exclude GLOB   Drop matching principals ($SSH_INSCRIBE_EXCLUDE_PRINCIPALS)\n  \
         --expire DUR     Requested lifetime, e.g. 10m ($SSH_INSCRIBE_EXPIRE)\n  \
         --identity FILE  Use this private key instead of an ad-hoc keypair\n  \
         --keytype T      Ad-hoc keypair type ($SSH_INSCRIBE_GENKEY_TYPE)\n  \
         --out FILE       Write the certificate here instead of the agent\n  \
         --timeout DUR    Client timeout ($SSH_INSCRIBE_TIMEOUT)\n  \
         --retries N      Retries on transport failure ($SSH_INSCRIBE_RETRIES)\n  \
         --insecure       Skip TLS validation ($SSH_INSCRIBE_INSECURE)\n  \
         --debug          Request-level debugging ($SSH_INSCRIBE_DEBUG)\n  \
         -q, --quiet      Quiet mode ($SSH_INSCRIBE_QUIET)\n\n\
         EXIT CODES: 0 ok, 1 auth/config error, 2 server error, 3 signer sealed\n"
    );
}

fn apply_flags(config: &mut ClientConfig, args: &[String]) {
    if let Some(url) = parse_arg(args, "--url") {
        config.url = url;
    }
    if let Some(raw) = parse_arg(args, "--timeout") {
        if let Ok(secs) = inscribe::duration::parse_duration_secs(&raw) {
            config.timeout = std::time::Duration::from_secs(secs.max(1) as u64);
        }
    }
    if let Some(raw) = parse_arg(args, "--retries") {
        if let Ok(n) = raw.parse() {
            config.retries = n;
        }
    }
    if let Some(login) = parse_arg(args, "--login") {
        config.login_endpoints = login.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(include) = parse_arg(args, "--include") {
        config.include_principals = Some(include);
    }
    if let Some(exclude) = parse_arg(args, "--exclude") {
        config.exclude_principals = Some(exclude);
    }
    if let Some(expire) = parse_arg(args, "--expire") {
        config.expire = Some(expire);
    }
    if let Some(keytype) = parse_arg(args, "--keytype") {
        config.genkey_type = keytype;
    }
    if has_flag(args, "--insecure") {
        config.insecure = true;
    }
    if has_flag(args, "--debug") {
        config.debug = true;
    }
    if has_flag(args, "--quiet") || has_flag(args, "-q") {
        config.quiet = true;
    }
}

fn prompt_text(label: &str) -> Result<String> {
    dialoguer::Input::<String>::new()
        .with_prompt(label)
        .interact_text()
        .context("reading input")
}

fn prompt_password(label: &str) -> Result<String> {
    dialoguer::Password::new().with_prompt(label).interact().context("reading password")
}

struct Run {
    config: ClientConfig,
    identity: Option<PathBuf>,
    out: Option<PathBuf>,
}

async fn authenticate_one(
    client: &InscribeClient,
    token: &str,
    info: &AuthenticatorInfo,
    key: &ssh_key::PrivateKey,
    quiet: bool,
) -> Result<bool, ClientError> {
    // Password-shaped backends go straight to a credential post.
    if info.supports_password {
        let username = prompt_text(&format!("{} username", info.name))
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let password = prompt_password(&format!("{} password", info.name))
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let response = client
            .auth_step(
                token,
                &info.id,
                serde_json::json!({ "username": username, "password": password }),
            )
            .await?;
        return Ok(response.status == "ok");
    }

    // Everything else starts with an empty post to open the challenge.
    let opened = client.auth_step(token, &info.id, serde_json::json!({})).await?;
    if opened.status == "ok" {
        return Ok(true);
    }
    let challenge = opened.challenge.unwrap_or_default();
    match challenge.get("kind").and_then(|k| k.as_str()) {
        Some("nonce") => {
            let nonce = challenge.get("nonce").and_then(|v| v.as_str()).unwrap_or_default();
            let audience = challenge.get("audience").and_then(|v| v.as_str()).unwrap_or_default();
            let sid = session_id_from_token(token)
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            let pem = answer_nonce_challenge(key, &sid, nonce, audience)
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            let response = client
                .auth_step(token, &info.id, serde_json::json!({ "signature": pem }))
                .await?;
            Ok(response.status == "ok")
        }
        Some("redirect") => {
            let url = challenge.get("url").and_then(|v| v.as_str()).unwrap_or_default();
            if !quiet {
                eprintln!("Open the following URL and authenticate:\n  {}", url);
            }
            let code = prompt_text("authorization code")
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            let response =
                client.auth_step(token, &info.id, serde_json::json!({ "code": code })).await?;
            Ok(response.status == "ok")
        }
        other => Err(ClientError::Transport(format!(
            "server sent an unsupported challenge kind {:?}",
            other
        ))),
    }
}

async fn run_req(run: Run) -> Result<i32> {
    let config = run.config;
    let client = match InscribeClient::new(&config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("sshi: {}", e);
            return Ok(EXIT_AUTH_OR_CONFIG);
        }
    };

    let (key, generated) = match &run.identity {
        Some(path) => match load_private_key(path) {
            Ok(key) => (key, false),
            Err(e) => {
                eprintln!("sshi: {}", e);
                return Ok(EXIT_AUTH_OR_CONFIG);
            }
        },
        None => match generate_keypair(&config.genkey_type) {
            Ok(key) => (key, true),
            Err(e) => {
                eprintln!("sshi: {}", e);
                return Ok(EXIT_AUTH_OR_CONFIG);
            }
        },
    };
    let pubkey = key.public_key().to_openssh().context("encoding public key")?;

    let session = match client.create_session(&pubkey).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("sshi: {}", e);
            return Ok(e.exit_code());
        }
    };
    if !config.quiet {
        eprintln!("session open, expires {}", session.expires_at);
    }

    // Which endpoints to walk: explicit selection, or every required one in
    // configured order.
    let mut endpoints: Vec<AuthenticatorInfo> = if config.login_endpoints.is_empty() {
        let mut required: Vec<AuthenticatorInfo> =
            session.authenticators.iter().filter(|a| a.required).cloned().collect();
        required.sort_by_key(|a| a.order);
        required
    } else {
        let mut picked = Vec::new();
        for id in &config.login_endpoints {
            let info = session
                .authenticators
                .iter()
                .find(|a| &a.id == id)
                .ok_or_else(|| anyhow!("server has no authenticator {:?}", id))?;
            picked.push(info.clone());
        }
        picked
    };

    while let Some(info) = endpoints.first().cloned() {
        match authenticate_one(&client, &session.token, &info, &key, config.quiet).await {
            Ok(true) => {
                if !config.quiet {
                    eprintln!("{}: ok", info.id);
                }
                endpoints.remove(0);
            }
            Ok(false) => {
                // Challenge still outstanding; loop and retry the same one.
            }
            Err(e) => {
                eprintln!("sshi: {}", e);
                return Ok(e.exit_code());
            }
        }
    }

    let signed = match client
        .sign(
            &session.token,
            config.expire.as_deref(),
            config.include_principals.as_deref(),
            config.exclude_principals.as_deref(),
        )
        .await
    {
        Ok(s) => s,
        Err(e) => {
            eprintln!("sshi: {}", e);
            return Ok(e.exit_code());
        }
    };
    if !config.quiet {
        eprintln!(
            "certificate {} for principals [{}], valid until {}",
            signed.key_id,
            signed.principals.join(", "),
            signed.valid_before
        );
    }

    if let Some(out) = &run.out {
        std::fs::write(out, format!("{}\n", signed.certificate))
            .with_context(|| format!("writing {}", out.display()))?;
        if generated {
            let key_path = out.with_extension("key");
            let pem = key.to_openssh(ssh_key::LineEnding::LF).context("encoding private key")?;
            std::fs::write(&key_path, pem.as_bytes())
                .with_context(|| format!("writing {}", key_path.display()))?;
        }
        return Ok(EXIT_OK);
    }

    // Default destination: the local agent, for the certificate's lifetime.
    let socket = match std::env::var("SSH_AUTH_SOCK") {
        Ok(path) => PathBuf::from(path),
        Err(_) => {
            eprintln!("sshi: SSH_AUTH_SOCK not set; use --out to write the certificate");
            return Ok(EXIT_AUTH_OR_CONFIG);
        }
    };
    let certificate = ssh_key::Certificate::from_openssh(&signed.certificate)
        .context("parsing issued certificate")?;
    let now = chrono::Utc::now().timestamp();
    let lifetime = (certificate.valid_before() as i64 - now).max(60) as u32;
    add_to_agent(&socket, &key, &certificate, lifetime, &signed.key_id).await?;
    if !config.quiet {
        eprintln!("loaded into agent for {}s", lifetime);
    }
    Ok(EXIT_OK)
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        usage();
        exit(EXIT_OK);
    }

    let mut config = ClientConfig::from_env();
    apply_flags(&mut config, &args);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(if config.debug {
                "debug"
            } else {
                config.loglevel.as_str()
            })
            .unwrap_or_default(),
        )
        .try_init();

    let run = Run {
        identity: parse_arg(&args, "--identity").map(PathBuf::from),
        out: parse_arg(&args, "--out").map(PathBuf::from),
        config,
    };

    match run_req(run).await {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("sshi: {}", e);
            exit(EXIT_SERVER);
        }
    }
}
