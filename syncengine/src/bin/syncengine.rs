//! Main entry point for the sync engine daemon.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{info, warn};

use cloud_api::{CloudApiConfig, ConnectionPool};
use syncengine::catalog::{self, Catalog, SyncFolder, SyncType};
use syncengine::config::SyncConfig;
use syncengine::ignore::IgnoreFilter;
use syncengine::scanner::{walk, Scanner};
use syncengine::speed::{SpeedCap, SpeedGovernor};
use syncengine::status::SyncStatus;
use syncengine::taskqueue::{RootPaths, TaskQueue};
use utils::id::SyncId;
use utils::logging::{self, LogFormat};
use utils::signals::{self, Signal};

utils::project_version!(VERSION);

const PID_FILE_NAME: &str = "syncengine.pid";

#[derive(Parser)]
#[command(name = "syncengine", version = VERSION, about = "Client-side file sync daemon")]
struct Cli {
    /// Working directory holding the shadow catalog and the pid file.
    #[arg(short = 'D', long, default_value = ".syncengine")]
    workdir: String,

    /// Optional TOML file with the `[sync]` settings and `[[sync_root]]` entries.
    #[arg(short, long)]
    config: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,
}

/// One statically-configured sync-root, read once at startup. Adding or
/// removing roots at runtime is a management-surface concern the spec
/// leaves to the (out-of-scope) GUI/CLI layer; this binary only has to
/// make sure every root named here has a matching `syncfolder` row.
#[derive(Debug, Clone, Deserialize)]
struct SyncRootSpec {
    local_path: String,
    remote_folder_id: u64,
    #[serde(default = "default_synctype")]
    synctype: SyncType,
}

fn default_synctype() -> SyncType {
    SyncType::Full
}

#[derive(Debug, Default, Deserialize)]
struct DaemonConfig {
    #[serde(flatten)]
    sync: SyncConfig,
    #[serde(default)]
    sync_root: Vec<SyncRootSpec>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format)?;
    info!(version = VERSION, "starting syncengine");

    let workdir = Path::new(&cli.workdir);
    std::fs::create_dir_all(workdir)
        .with_context(|| format!("failed to create workdir '{}'", workdir.display()))?;
    let workdir = workdir
        .canonicalize()
        .with_context(|| format!("failed to resolve workdir '{}'", workdir.display()))?;
    let workdir = Utf8PathBuf::try_from(workdir).context("workdir path is not valid UTF-8")?;

    let lock_file_path = workdir.join(PID_FILE_NAME);
    let lock_file = match utils::lock_file::create_lock_file(&lock_file_path, Pid::this().to_string()) {
        utils::lock_file::LockCreationResult::Created { file, .. } => file,
        utils::lock_file::LockCreationResult::AlreadyLocked { existing_lock_contents } => {
            anyhow::bail!("syncengine is already running in '{workdir}' with pid {existing_lock_contents}");
        }
        utils::lock_file::LockCreationResult::CreationFailed(e) => {
            return Err(e.context(format!("failed to create lock file at '{lock_file_path}'")));
        }
    };
    // Held for the life of the process; dropping it releases the flock.
    let _lock_file = Box::leak(Box::new(lock_file));

    let daemon_cfg = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("failed to read config '{path}'"))?;
            toml::from_str::<DaemonConfig>(&text).with_context(|| format!("failed to parse config '{path}'"))?
        }
        None => DaemonConfig {
            sync: SyncConfig::default(),
            sync_root: Vec::new(),
        },
    };

    let catalog_path = workdir.join("syncengine.db");
    let catalog = Catalog::open(catalog_path.as_std_path())?;

    let mut cfg = SyncConfig::load_from_catalog(&catalog)?;
    if cli.config.is_some() {
        // CLI-supplied config takes precedence over whatever was already
        // persisted, the same override order `PageServerConf` uses between
        // its toml file and prior on-disk state.
        cfg = daemon_cfg.sync;
    }
    cfg.catalog_path = catalog_path;
    cfg.persist_to_catalog(&catalog)?;

    for root in &daemon_cfg.sync_root {
        register_sync_root(&catalog, root)?;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("syncengine-rt")
        .build()
        .context("failed to build the tokio runtime")?;

    let pool = Arc::new(ConnectionPool::new(CloudApiConfig {
        api_server: cfg.api_server.clone(),
        use_ssl: cfg.usessl,
        ..CloudApiConfig::default()
    })?);
    rt.block_on(pool.set_server(cfg.api_server.clone()));
    if let Err(e) = rt.block_on(pool.prepare()) {
        warn!(error = %e, "failed to pre-warm a connection to the api server, continuing anyway");
    }

    let status = Arc::new(SyncStatus::default());
    let upload_speed = Arc::new(SpeedGovernor::new(SpeedCap::from(cfg.maxuploadspeed), 3));

    let ignore = Arc::new(Mutex::new(IgnoreFilter::empty()));
    ignore.lock().reload(&cfg.ignorepatterns, &cfg.ignorepaths, |p| {
        walk::stat_device_inode(p).map(|(device_id, inode)| syncengine::ignore::DeviceInode { device_id, inode })
    });

    let roots = Arc::new(CatalogRoots(catalog.clone()));
    let queue = TaskQueue::new(catalog.clone(), pool.clone(), rt.handle().clone(), status.clone(), upload_speed, roots, cfg.clone());

    let worker_count = cfg.max_parallel_uploads.max(1) + 2;
    let mut worker_threads = Vec::with_capacity(worker_count);
    for i in 0..worker_count {
        let queue = queue.clone();
        worker_threads.push(
            std::thread::Builder::new()
                .name(format!("task-worker-{i}"))
                .spawn(move || queue.run_worker())
                .context("failed to spawn a task-queue worker thread")?,
        );
    }

    let scanner = Scanner::new();
    let mut scanner_thread = Some({
        let scanner = scanner.clone();
        let catalog = catalog.clone();
        let status = status.clone();
        let ignore = ignore.clone();
        std::thread::Builder::new()
            .name("scanner".to_owned())
            .spawn(move || {
                scanner.run(catalog.clone(), status, ignore, move || {
                    catalog::list_sync_folders(&catalog.read_lock().expect("catalog read lock")).unwrap_or_default()
                })
            })
            .context("failed to spawn the scanner thread")?
    });

    metrics::set_build_info_metric(VERSION);
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
    info!("syncengine is up, watching {} configured sync-root(s)", daemon_cfg.sync_root.len());

    let signals = signals::install_shutdown_handlers()?;
    signals.handle(move |signal| {
        info!(signal = signal.name(), "received shutdown signal, stopping");
        scanner.stop();
        queue.stop();
        if let Some(handle) = scanner_thread.take() {
            let _ = handle.join();
        }
        for handle in worker_threads.drain(..) {
            let _ = handle.join();
        }
        std::process::exit(0);
    })?;
    Ok(())
}

/// Ensures a `syncfolder` row exists for each statically-configured root,
/// resolving its `(device-id, root-inode)` pair at startup per §3's
/// sync-root invariant.
fn register_sync_root(catalog: &Catalog, spec: &SyncRootSpec) -> anyhow::Result<()> {
    let path = Utf8Path::new(&spec.local_path);
    std::fs::create_dir_all(path.as_std_path())
        .with_context(|| format!("failed to create sync-root directory '{}'", spec.local_path))?;
    let (device_id, inode) =
        walk::stat_device_inode(path).with_context(|| format!("failed to stat sync-root '{}'", spec.local_path))?;

    let existing = {
        let conn = catalog.read_lock()?;
        catalog::list_sync_folders(&conn)?
            .into_iter()
            .find(|f| f.local_path == spec.local_path)
    };
    if existing.is_some() {
        return Ok(());
    }

    let txn = catalog.begin()?;
    catalog::insert_sync_folder(
        txn.conn(),
        &SyncFolder {
            id: SyncId(0),
            folder_id: utils::id::RemoteFolderId(spec.remote_folder_id),
            local_path: spec.local_path.clone(),
            synctype: spec.synctype,
            device_id,
            inode,
        },
    )?;
    txn.commit()?;
    info!(path = %spec.local_path, "registered sync-root");
    Ok(())
}

struct CatalogRoots(Catalog);

impl RootPaths for CatalogRoots {
    fn local_path(&self, syncid: SyncId) -> Option<Utf8PathBuf> {
        let conn = self.0.read_lock().ok()?;
        let folder = catalog::get_sync_folder(&conn, syncid).ok()??;
        Some(Utf8PathBuf::from(folder.local_path))
    }
}
