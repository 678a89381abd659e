//! natgate operator - egress NAT reconciliation for BIG-IP AS3

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use kube::Client;

use natgate::appliance::license::{self, LicenseStatus};
use natgate::appliance::{ensure_tenants, Appliance, ApplianceClient};
use natgate::config::{ApplianceConfig, OperatorConfig};
use natgate::controller::runner;
use natgate::crd::all_crds;
use natgate::retry::{retry_with_backoff, RetryConfig};
use natgate::telemetry::{init_tracing, LogFormat};
use natgate::tenant::TenantResolver;

/// natgate - keeps BIG-IP egress NAT in step with Kubernetes
#[derive(Parser, Debug)]
#[command(name = "natgate", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers (default mode)
    Controller(ControllerArgs),

    /// Check a license token against the appliance registration key and exit
    VerifyLicense(ApplianceArgs),
}

/// Appliance connection and license settings
#[derive(Args, Debug, Clone)]
struct ApplianceArgs {
    /// Appliance host or URL
    #[arg(long, env = "BIGIP_URL")]
    bigip_url: String,

    /// Basic-auth user
    #[arg(long, env = "BIGIP_USERNAME", default_value = "admin")]
    bigip_username: String,

    /// Basic-auth password
    #[arg(long, env = "BIGIP_PASSWORD", hide_env_values = true)]
    bigip_password: String,

    /// Skip TLS certificate verification
    #[arg(long, env = "BIGIP_INSECURE")]
    bigip_insecure: bool,

    /// Encrypted license token
    #[arg(long, env = "NATGATE_LICENSE", hide_env_values = true)]
    license: Option<String>,

    /// Key the license token was encrypted with (16, 24 or 32 bytes)
    #[arg(long, env = "NATGATE_LICENSE_KEY", hide_env_values = true)]
    license_key: Option<String>,
}

impl ApplianceArgs {
    fn appliance_config(&self) -> ApplianceConfig {
        ApplianceConfig::new(
            &self.bigip_url,
            &self.bigip_username,
            &self.bigip_password,
            self.bigip_insecure,
        )
    }
}

/// Controller mode arguments
#[derive(Args, Debug)]
struct ControllerArgs {
    #[command(flatten)]
    appliance: ApplianceArgs,

    /// Path to the operator configuration YAML
    #[arg(short = 'c', long = "config", env = "NATGATE_CONFIG")]
    config_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        for crd in all_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_tracing(cli.log_format)?;

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        Some(Commands::VerifyLicense(args)) => run_verify_license(args).await,
        None => Err(anyhow::anyhow!(
            "no command given; run `natgate controller` or `natgate verify-license`"
        )),
    }
}

/// Verify the license, bootstrap tenants and run the controllers
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let config = OperatorConfig::load(args.config_file.as_deref())?;
    let appliance: Arc<dyn Appliance> =
        Arc::new(ApplianceClient::new(args.appliance.appliance_config())?);
    let startup = RetryConfig::with_max_attempts(10);

    match (&args.appliance.license, &args.appliance.license_key) {
        (Some(token), Some(key)) => {
            let status = retry_with_backoff(&startup, "license check", || {
                license::verify_with(appliance.as_ref(), token, key)
            })
            .await?;
            if status == LicenseStatus::Mismatch {
                anyhow::bail!("license token does not match the appliance registration key");
            }
        }
        (None, None) => tracing::warn!("no license token configured, skipping license check"),
        _ => anyhow::bail!("NATGATE_LICENSE and NATGATE_LICENSE_KEY must be set together"),
    }

    let tenants = TenantResolver::from_config(&config).all();
    retry_with_backoff(&startup, "tenant bootstrap", || {
        ensure_tenants(appliance.as_ref(), &tenants)
    })
    .await?;
    tracing::info!(tenants = tenants.len(), "appliance tenants ready");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    runner::run(client, &config, appliance).await?;
    Ok(())
}

/// One-shot license check
async fn run_verify_license(args: ApplianceArgs) -> anyhow::Result<()> {
    let (Some(token), Some(key)) = (&args.license, &args.license_key) else {
        anyhow::bail!("--license and --license-key are required");
    };
    let appliance = ApplianceClient::new(args.appliance_config())?;
    match license::verify_with(&appliance, token, key).await? {
        LicenseStatus::Match => {
            println!("license valid");
            Ok(())
        }
        LicenseStatus::Mismatch => {
            anyhow::bail!("license token does not match the appliance registration key")
        }
    }
}
