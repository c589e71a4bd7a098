//! `sentra-broker` command line.
//!
//! `serve` runs the broker daemon; the other subcommands are operator tools
//! over the same configuration file.

#![deny(unsafe_code)]

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sentra_broker::{
    BrokerClient, BrokerConfig, BrokerServer, CredentialBroker, HttpUpstream, OperatorClient,
    PolicyDocument, PolicyStore,
    ipc::{CredentialRequestFrame, ResponseStatus},
    secrets::HostSecretStore,
};
use sentra_common_authn::{RequestAuthenticator, SignedEnvelope, validation::decode_public_key};
use sentra_common_storage::{
    AuditLog, KeyRecord, KeyRegistry, PrincipalId,
    audit::{AuditSummary, FileAuditLog, TracingAuditLog, export, read_entries, verify_chain},
    keys::{AuditedKeyRegistry, FileKeyRegistry},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired approvals and idle rate-limit windows are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Credential broker for sandboxed agent workers.
#[derive(Parser, Debug)]
#[command(name = "sentra-broker", version, about)]
struct Cli {
    /// Path to the broker configuration file.
    #[arg(
        short,
        long,
        global = true,
        env = "SENTRA_CONFIG",
        default_value = "/etc/sentra/broker.yaml"
    )]
    config: PathBuf,

    /// Log filter (e.g. `info`, `sentra_broker=debug`).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the broker daemon.
    Serve,

    /// Inspect the audit log.
    #[command(subcommand)]
    Audit(AuditCommands),

    /// Manage enrolled device keys.
    #[command(subcommand)]
    Keys(KeyCommands),

    /// List and resolve requests awaiting approval.
    #[command(subcommand)]
    Approvals(ApprovalCommands),

    /// Validate a policy file and optionally evaluate a request against it.
    Policy(PolicyCheckArgs),

    /// Verify a signed request envelope against the key registry.
    Verify(VerifyArgs),

    /// Send a credential request to a running broker.
    Request(RequestArgs),
}

#[derive(Subcommand, Debug)]
enum AuditCommands {
    /// Copy the raw audit log to stdout.
    Export,
    /// Verify the audit log's hash chain.
    Verify,
    /// Print per-service and per-actor statistics as JSON.
    Summary {
        /// Flag actors with at least this many denials.
        #[arg(long)]
        threshold: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum KeyCommands {
    /// Enroll a device key.
    Register {
        /// Base64url Ed25519 public key.
        #[arg(long)]
        public_key: String,
        /// Owning principal.
        #[arg(long)]
        principal: String,
        /// Device label.
        #[arg(long)]
        device: String,
    },
    /// Revoke a key.
    Revoke {
        /// Key to revoke.
        public_key: String,
        /// Recorded with the revocation.
        #[arg(long)]
        reason: Option<String>,
    },
    /// Replace a key with a new one for the same principal.
    Rotate {
        /// Key being replaced.
        #[arg(long)]
        old: String,
        /// Replacement key.
        #[arg(long)]
        new: String,
        /// Label for the new key; defaults to the old key's label.
        #[arg(long)]
        device: Option<String>,
    },
    /// List a principal's keys as JSON lines.
    List {
        /// Owning principal.
        principal: String,
    },
}

#[derive(Subcommand, Debug)]
enum ApprovalCommands {
    /// List pending requests, oldest first.
    List,
    /// Approve a pending request.
    Approve {
        /// Approval id shown by `approvals list`.
        approval_id: String,
        /// Name recorded as the deciding operator.
        #[arg(long, env = "USER")]
        operator: String,
    },
    /// Deny a pending request.
    Deny {
        /// Approval id shown by `approvals list`.
        approval_id: String,
        /// Recorded with the denial.
        #[arg(long)]
        reason: Option<String>,
        /// Name recorded as the deciding operator.
        #[arg(long, env = "USER")]
        operator: String,
    },
}

#[derive(Args, Debug)]
struct PolicyCheckArgs {
    /// Policy file; defaults to the configured policy path.
    file: Option<PathBuf>,
    /// Role to evaluate.
    #[arg(long, requires_all = ["service", "operation"])]
    role: Option<String>,
    /// Service to evaluate.
    #[arg(long)]
    service: Option<String>,
    /// Operation to evaluate.
    #[arg(long)]
    operation: Option<String>,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// Envelope JSON file, or `-` for stdin.
    envelope: PathBuf,
}

#[derive(Args, Debug)]
struct RequestArgs {
    /// Requesting worker.
    #[arg(long, env = "SENTRA_WORKER_ID")]
    worker: String,
    /// Task to charge.
    #[arg(long)]
    task: Option<String>,
    /// Target service.
    #[arg(long)]
    service: String,
    /// Operation within the service.
    #[arg(long)]
    operation: String,
    /// Operation target.
    #[arg(long, default_value = "")]
    target: String,
    /// Operation parameters as JSON.
    #[arg(long)]
    params: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format);

    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Audit(command) => audit(&config, command).await,
        Commands::Keys(command) => keys(&config, command).await,
        Commands::Approvals(command) => approvals(&config, command).await,
        Commands::Policy(args) => policy_check(&config, args).await,
        Commands::Verify(args) => verify(&config, &args).await,
        Commands::Request(args) => request(&config, args).await,
    }
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(std::io::stderr)).init(),
    }
}

async fn load_config(path: &Path) -> Result<BrokerConfig> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        return BrokerConfig::load(path)
            .await
            .with_context(|| format!("failed to load config from {}", path.display()));
    }

    tracing::debug!(path = %path.display(), "config file not found, using defaults");
    let mut config = BrokerConfig::default();
    config.apply_env_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

async fn open_audit(config: &BrokerConfig) -> Result<TracingAuditLog<FileAuditLog>> {
    let log = FileAuditLog::open(&config.audit_path)
        .await
        .with_context(|| format!("failed to open audit log {}", config.audit_path.display()))?;
    Ok(TracingAuditLog::new(log))
}

async fn serve(config: BrokerConfig) -> Result<()> {
    let audit: Arc<dyn AuditLog> = Arc::new(open_audit(&config).await?);

    let policy = Arc::new(
        PolicyStore::load(&config.policy_path)
            .await
            .with_context(|| format!("failed to load policy {}", config.policy_path.display()))?
            .with_audit(Arc::clone(&audit)),
    );
    let secrets = Arc::new(HostSecretStore::new(config.secret_specs()));
    let upstream = Arc::new(HttpUpstream::new(&config.services)?);

    let broker = Arc::new(
        CredentialBroker::builder()
            .policy(Arc::clone(&policy))
            .secrets(secrets)
            .upstream(upstream)
            .audit(audit)
            .task_budget(config.task_budget)
            .maybe_worker_budget(config.worker_budget)
            .approval_timeout(config.approval_timeout)
            .upstream_timeout(config.upstream_timeout)
            .retry(config.retry.clone())
            .build()?,
    );

    let server = BrokerServer::bind(&config, Arc::clone(&broker))?;
    let shutdown = CancellationToken::new();
    let signals = shutdown_on_signal(shutdown.clone())?;
    let watcher = policy.spawn_watcher(config.policy_reload_interval, shutdown.child_token());
    let sweeper = spawn_sweeper(broker, shutdown.child_token());

    tracing::info!(
        worker_socket = %server.worker_socket_path().display(),
        operator_socket = %server.operator_socket_path().display(),
        services = config.services.len(),
        "broker started"
    );

    let served = server.serve(shutdown.clone()).await;
    shutdown.cancel();
    signals.abort();
    let _ = tokio::join!(watcher, sweeper);

    tracing::info!("broker stopped");
    Ok(served?)
}

#[cfg(unix)]
fn shutdown_on_signal(shutdown: CancellationToken) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
        shutdown.cancel();
    }))
}

#[cfg(not(unix))]
fn shutdown_on_signal(shutdown: CancellationToken) -> Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl-C, shutting down");
        }
        shutdown.cancel();
    }))
}

fn spawn_sweeper(broker: Arc<CredentialBroker>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => broker.sweep(),
            }
        }
    })
}

async fn audit(config: &BrokerConfig, command: AuditCommands) -> Result<()> {
    let path = &config.audit_path;
    match command {
        AuditCommands::Export => {
            let mut stdout = tokio::io::stdout();
            let bytes = export(path, &mut stdout)
                .await
                .with_context(|| format!("failed to export {}", path.display()))?;
            tracing::debug!(bytes, "audit log exported");
        },
        AuditCommands::Verify => {
            let entries = read_entries(path).await?;
            match verify_chain(&entries) {
                Ok(head) => {
                    println!("ok: {} entries, head {}", head.last_id, head.last_hash);
                },
                Err(e) => bail!("audit chain verification failed: {e}"),
            }
        },
        AuditCommands::Summary { threshold } => {
            let entries = read_entries(path).await?;
            let summary = match threshold {
                Some(threshold) => AuditSummary::with_threshold(&entries, threshold),
                None => AuditSummary::from_entries(&entries),
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        },
    }
    Ok(())
}

async fn keys(config: &BrokerConfig, command: KeyCommands) -> Result<()> {
    let inner = FileKeyRegistry::open(&config.key_registry_path).await.with_context(|| {
        format!("failed to open key registry {}", config.key_registry_path.display())
    })?;
    let registry = AuditedKeyRegistry::new(inner, open_audit(config).await?, "cli");

    match command {
        KeyCommands::Register { public_key, principal, device } => {
            decode_public_key(&public_key)?;
            let record = KeyRecord::builder()
                .public_key(public_key.as_str())
                .principal_id(principal.as_str())
                .device_label(device)
                .build();
            registry.register(&record).await?;
            println!("registered {public_key} for {principal}");
        },
        KeyCommands::Revoke { public_key, reason } => {
            registry.revoke(&public_key, reason.as_deref()).await?;
            println!("revoked {public_key}");
        },
        KeyCommands::Rotate { old, new, device } => {
            decode_public_key(&new)?;
            let Some(current) = registry.lookup(&old).await? else {
                bail!("key {old} is not registered");
            };
            let record = KeyRecord::builder()
                .public_key(new.as_str())
                .principal_id(current.principal_id.clone())
                .device_label(device.unwrap_or(current.device_label))
                .build();
            registry.rotate(&old, &record).await?;
            println!("rotated {old} -> {new} for {}", current.principal_id);
        },
        KeyCommands::List { principal } => {
            let records = registry.list_for_principal(&PrincipalId::from(principal)).await?;
            for record in records {
                println!("{}", serde_json::to_string(&record)?);
            }
        },
    }
    Ok(())
}

async fn approvals(config: &BrokerConfig, command: ApprovalCommands) -> Result<()> {
    let mut client = OperatorClient::connect(&config.operator_socket).await?;
    match command {
        ApprovalCommands::List => {
            for pending in client.list_pending().await? {
                println!("{}", serde_json::to_string(&pending)?);
            }
        },
        ApprovalCommands::Approve { approval_id, operator } => {
            client.resolve(&approval_id, true, None, &operator).await?;
            println!("approved {approval_id}");
        },
        ApprovalCommands::Deny { approval_id, reason, operator } => {
            client.resolve(&approval_id, false, reason, &operator).await?;
            println!("denied {approval_id}");
        },
    }
    Ok(())
}

async fn policy_check(config: &BrokerConfig, args: PolicyCheckArgs) -> Result<()> {
    let path = args.file.unwrap_or_else(|| config.policy_path.clone());
    let yaml = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let document = PolicyDocument::from_yaml(&yaml)?;
    println!("valid: version {}, {} rules", document.version, document.rules.len());

    if let (Some(role), Some(service), Some(operation)) = (args.role, args.service, args.operation)
    {
        let decision = document.decide(&role, &service, &operation);
        let rule = decision.rule.map_or_else(|| "default deny".to_owned(), |rule| rule.key());
        println!("{role} {service} {operation}: {} ({rule})", decision.effect.as_str());
    }
    Ok(())
}

/// Reads `path`, or all of `stdin` when `path` is `-`.
async fn read_input<R>(path: &Path, mut stdin: R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if path.as_os_str() == "-" {
        let mut buf = Vec::new();
        stdin.read_to_end(&mut buf).await?;
        return Ok(buf);
    }
    tokio::fs::read(path).await.with_context(|| format!("failed to read {}", path.display()))
}

async fn verify(config: &BrokerConfig, args: &VerifyArgs) -> Result<()> {
    let raw = read_input(&args.envelope, tokio::io::stdin()).await?;
    let envelope = SignedEnvelope::from_json(&raw)?;

    let registry = FileKeyRegistry::open(&config.key_registry_path).await?;
    let authenticator = RequestAuthenticator::builder()
        .registry(Arc::new(registry))
        .audit(Arc::new(open_audit(config).await?))
        .config(config.authn.clone())
        .build()?;

    let principal = authenticator.authenticate(&envelope).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "principal_id": principal.principal_id.as_str(),
            "public_key": principal.public_key,
            "device_label": principal.device_label,
            "payload": principal.payload,
        }))?
    );
    Ok(())
}

async fn request(config: &BrokerConfig, args: RequestArgs) -> Result<()> {
    let params = args
        .params
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("--params must be valid JSON")?;
    let frame = CredentialRequestFrame {
        request_id: uuid::Uuid::new_v4().to_string(),
        worker_id: args.worker,
        task_id: args.task,
        service: args.service,
        operation: args.operation,
        target: args.target,
        params,
    };

    let mut client = BrokerClient::connect(&config.worker_socket).await?;
    let response = client.request(&frame).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    if response.status != ResponseStatus::Approved {
        bail!(
            "request {} {}",
            serde_json::to_string(&response.status)?.trim_matches('"'),
            response.code.unwrap_or_default()
        );
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_approval_commands() {
        let cli = Cli::try_parse_from([
            "sentra-broker",
            "--config",
            "/tmp/broker.yaml",
            "approvals",
            "deny",
            "a-1",
            "--reason",
            "freeze",
            "--operator",
            "ops",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/broker.yaml"));
        assert!(matches!(
            cli.command,
            Commands::Approvals(ApprovalCommands::Deny { ref approval_id, .. }) if approval_id == "a-1"
        ));
    }

    #[tokio::test]
    async fn test_read_input_from_stdin_and_file() {
        let from_stdin = read_input(Path::new("-"), &b"{\"v\":1}"[..]).await.unwrap();
        assert_eq!(from_stdin, b"{\"v\":1}");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("envelope.json");
        tokio::fs::write(&path, b"file body").await.unwrap();
        assert_eq!(read_input(&path, tokio::io::empty()).await.unwrap(), b"file body");

        assert!(read_input(&dir.path().join("missing"), tokio::io::stdin()).await.is_err());
    }
}
