//! Celery operator - Celery worker pools and Flower on Kubernetes

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use celery_operator::controller::{
    error_policy, reconcile, Context, ControllerConfig, CONTROLLER_NAME,
};
use celery_operator::crd::{CeleryApp, CeleryAppSpec};

/// Celery operator - Celery worker pools and Flower on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "celery-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the CeleryApp CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller(ControllerArgs),

    /// Normalize a CeleryApp manifest and print the resulting spec
    ///
    /// Accepts either a full manifest with a `spec` key or a bare spec.
    Validate(ValidateArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Only watch CeleryApps in this namespace (all namespaces when unset)
    #[arg(long, env = "CELERY_OPERATOR_NAMESPACE")]
    namespace: Option<String>,

    /// Minimum seconds between flower samples
    #[arg(long, default_value = "10")]
    sample_interval_secs: u64,

    /// Timeout in seconds for a flower request
    #[arg(long, default_value = "5")]
    flower_timeout_secs: u64,

    /// Seconds to wait before retrying a transient failure
    #[arg(long, default_value = "5")]
    error_backoff_secs: u64,
}

impl ControllerArgs {
    fn config(&self) -> ControllerConfig {
        ControllerConfig {
            sample_interval: Duration::from_secs(self.sample_interval_secs),
            flower_timeout: Duration::from_secs(self.flower_timeout_secs),
            error_backoff: Duration::from_secs(self.error_backoff_secs),
        }
    }
}

/// Validate mode arguments
#[derive(Args, Debug)]
struct ValidateArgs {
    /// Path to a CeleryApp YAML or JSON file
    #[arg(short = 'f', long = "file")]
    file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&CeleryApp::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Validate(args)) => run_validate(args),
        Some(Commands::Controller(args)) => run_controller(args).await,
        // No subcommand: controller defaults, still honoring the environment
        None => run_controller(ControllerArgs::parse_from(["celery-operator"])).await,
    }
}

fn run_validate(args: ValidateArgs) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&args.file)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", args.file.display(), e))?;
    let document: serde_json::Value = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", args.file.display(), e))?;
    let spec_value = document.get("spec").unwrap_or(&document);

    let spec = CeleryAppSpec::from_value(spec_value)?;
    println!("{}", serde_json::to_string_pretty(&spec)?);
    Ok(())
}

/// Install or update the CeleryApp CRD with server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_NAME).force();

    tracing::info!("Installing CeleryApp CRD...");
    crds.patch(
        "celeryapps.celeryproject.org",
        &params,
        &Patch::Apply(&CeleryApp::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install CeleryApp CRD: {}", e))?;

    tracing::info!("CeleryApp CRD installed/updated");
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("Celery operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let ctx = Arc::new(
        Context::builder(client.clone())
            .config(args.config())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create controller context: {}", e))?,
    );

    let (apps, deployments, services): (Api<CeleryApp>, Api<Deployment>, Api<Service>) =
        match &args.namespace {
            Some(ns) => {
                tracing::info!(namespace = %ns, "Watching a single namespace");
                (
                    Api::namespaced(client.clone(), ns),
                    Api::namespaced(client.clone(), ns),
                    Api::namespaced(client, ns),
                )
            }
            None => (
                Api::all(client.clone()),
                Api::all(client.clone()),
                Api::all(client),
            ),
        };

    tracing::info!("Starting CeleryApp controller...");
    Controller::new(apps, WatcherConfig::default())
        .owns(deployments, WatcherConfig::default())
        .owns(services, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "CeleryApp reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "CeleryApp reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Celery operator shutting down");
    Ok(())
}
