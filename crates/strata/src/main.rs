use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use strata_controller::{
    discover_instances, BackoffConfig, ControllerConfig, KindRegistry, VersionedInstance,
    WorkloadController, ANNOTATION_CONFIG_SHA, ANNOTATION_TEMPLATE_SHA,
};
use strata_core::{ConfigMap, Resource, Secret, WorkloadTemplate};
use strata_storage::{
    create_resource, get_resource, update_resource, KvResourceStore, RedbBackend, ResourceStore,
    StorageError,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "strata", about = "Strata versioned workload controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply manifests, then run the controller until interrupted
    Run {
        /// Path to the redb database file
        #[arg(long, env = "STRATA_DATA_DIR", default_value = "./strata.redb")]
        data_dir: String,
        /// Manifests to apply before starting
        #[arg(short = 'f', long = "filename")]
        files: Vec<PathBuf>,
        /// Number of concurrent reconcile workers
        #[arg(long, env = "STRATA_WORKERS", default_value_t = 2)]
        workers: usize,
        /// Deadline for a single reconcile
        #[arg(long, env = "STRATA_RECONCILE_TIMEOUT_SECS", default_value_t = 30)]
        reconcile_timeout_secs: u64,
        /// Delay before the first retry of a failed reconcile
        #[arg(long, env = "STRATA_BACKOFF_BASE_MS", default_value_t = 100)]
        backoff_base_ms: u64,
        /// Upper bound on the retry delay
        #[arg(long, env = "STRATA_BACKOFF_MAX_SECS", default_value_t = 60)]
        backoff_max_secs: u64,
    },
    /// Create or update WorkloadTemplates, ConfigMaps and Secrets from YAML
    Apply {
        #[arg(long, env = "STRATA_DATA_DIR", default_value = "./strata.redb")]
        data_dir: String,
        #[arg(short = 'f', long = "filename", required = true)]
        files: Vec<PathBuf>,
    },
    /// List the versioned instances of a template
    Versions {
        #[arg(long, env = "STRATA_DATA_DIR", default_value = "./strata.redb")]
        data_dir: String,
        #[arg(long, short = 'n', default_value = "default")]
        namespace: String,
        /// Template name
        template: String,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            data_dir,
            files,
            workers,
            reconcile_timeout_secs,
            backoff_base_ms,
            backoff_max_secs,
        } => {
            let config = ControllerConfig {
                workers,
                reconcile_timeout: Duration::from_secs(reconcile_timeout_secs),
                backoff: BackoffConfig {
                    base: Duration::from_millis(backoff_base_ms),
                    max: Duration::from_secs(backoff_max_secs),
                },
                ..Default::default()
            };
            run_controller(&data_dir, &files, config).await
        }
        Commands::Apply { data_dir, files } => {
            let store = open_store(&data_dir)?;
            for path in &files {
                apply_file(store.as_ref(), path).await?;
            }
            Ok(())
        }
        Commands::Versions {
            data_dir,
            namespace,
            template,
        } => list_versions(&data_dir, &namespace, &template).await,
    }
}

/// Run the workload controller until ctrl-c
async fn run_controller(
    data_dir: &str,
    files: &[PathBuf],
    config: ControllerConfig,
) -> miette::Result<()> {
    info!("Starting strata controller");

    let store = open_store(data_dir)?;
    for path in files {
        apply_file(store.as_ref(), path).await?;
    }

    let token = CancellationToken::new();
    let controller = WorkloadController::new(store, KindRegistry::default(), config);
    let controller_token = token.clone();
    let controller_handle = tokio::spawn(async move {
        if let Err(e) = controller.run(controller_token).await {
            error!("Workload controller error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    let shutdown_timeout = Duration::from_secs(5);
    let _ = tokio::time::timeout(shutdown_timeout, controller_handle).await;

    info!("Shutdown complete");

    Ok(())
}

/// Print one line per versioned instance of `namespace/template`
async fn list_versions(data_dir: &str, namespace: &str, name: &str) -> miette::Result<()> {
    let store = open_store(data_dir)?;

    let template: WorkloadTemplate = get_resource(store.as_ref(), namespace, name)
        .await
        .map_err(|e| miette::miette!("Failed to read template {}/{}: {}", namespace, name, e))?
        .ok_or_else(|| miette::miette!("Template {}/{} not found", namespace, name))?;

    let instances = discover_instances(store.as_ref(), &template)
        .await
        .map_err(|e| miette::miette!("Failed to list instances: {}", e))?;

    if instances.is_empty() {
        println!("No versions of {}/{}", namespace, name);
    }
    for instance in &instances {
        println!("{}", describe_instance(instance));
    }

    Ok(())
}

fn describe_instance(instance: &VersionedInstance) -> String {
    let zone = instance
        .zone_index
        .map(|i| i.to_string())
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{}\tv{}\tzone={}\ttemplate-sha256={}\tconfig-sha256={}",
        instance.statefulset.name(),
        instance.version,
        zone,
        instance.annotation(ANNOTATION_TEMPLATE_SHA).unwrap_or("-"),
        instance.annotation(ANNOTATION_CONFIG_SHA).unwrap_or("-"),
    )
}

/// Open (or create) the store at `data_dir`
fn open_store(data_dir: &str) -> miette::Result<Arc<dyn ResourceStore>> {
    let backend = Arc::new(
        RedbBackend::new(Path::new(data_dir))
            .map_err(|e| miette::miette!("Failed to open storage at '{}': {}", data_dir, e))?,
    );
    Ok(Arc::new(KvResourceStore::new(backend)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Applied {
    Created(String),
    Updated(String),
}

async fn apply_file(store: &dyn ResourceStore, path: &Path) -> miette::Result<Vec<Applied>> {
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| miette::miette!("Failed to read {}: {}", path.display(), e))?;
    let applied = apply_manifest(store, &data)
        .await
        .map_err(|e| miette::miette!("{}: {}", path.display(), e))?;

    for result in &applied {
        match result {
            Applied::Created(key) => info!("Created {}", key),
            Applied::Updated(key) => info!("Updated {}", key),
        }
    }
    Ok(applied)
}

/// Apply every document of a YAML stream, in order
async fn apply_manifest(store: &dyn ResourceStore, data: &str) -> miette::Result<Vec<Applied>> {
    let documents = strata_core::from_yaml_documents(data)
        .map_err(|e| miette::miette!("Invalid manifest: {}", e))?;

    let mut applied = Vec::with_capacity(documents.len());
    for document in documents {
        applied.push(apply_document(store, document).await?);
    }
    Ok(applied)
}

async fn apply_document(store: &dyn ResourceStore, document: Value) -> miette::Result<Applied> {
    let kind = document
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if kind == WorkloadTemplate::KIND {
        apply_resource::<WorkloadTemplate>(store, document).await
    } else if kind == ConfigMap::KIND {
        apply_resource::<ConfigMap>(store, document).await
    } else if kind == Secret::KIND {
        apply_resource::<Secret>(store, document).await
    } else if kind.is_empty() {
        Err(miette::miette!("Manifest document has no kind"))
    } else {
        Err(miette::miette!("Unsupported kind '{}'", kind))
    }
}

/// Create `document` as a `T`, or replace the stored object of the same name
async fn apply_resource<T: Resource>(
    store: &dyn ResourceStore,
    document: Value,
) -> miette::Result<Applied> {
    let mut resource: T = strata_core::from_json_value(document)
        .map_err(|e| miette::miette!("Invalid {}: {}", T::KIND, e))?;
    if resource.metadata().namespace.is_none() {
        resource.metadata_mut().namespace = Some("default".to_string());
    }
    resource
        .validate()
        .map_err(|e| miette::miette!("Invalid {}: {}", T::KIND, e))?;

    let key = format!("{} {}/{}", T::KIND, resource.namespace(), resource.name());

    match create_resource(store, resource.clone()).await {
        Ok(_) => Ok(Applied::Created(key)),
        Err(StorageError::AlreadyExists { .. }) => {
            let current: Option<T> = get_resource(store, resource.namespace(), resource.name())
                .await
                .map_err(|e| miette::miette!("Failed to read {}: {}", key, e))?;
            resource.metadata_mut().resource_version =
                current.and_then(|c| c.metadata().resource_version.clone());

            update_resource(store, resource)
                .await
                .map_err(|e| miette::miette!("Failed to update {}: {}", key, e))?;
            Ok(Applied::Updated(key))
        }
        Err(e) => Err(miette::miette!("Failed to create {}: {}", key, e)),
    }
}
