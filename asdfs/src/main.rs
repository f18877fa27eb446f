use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::info;

use asdfs::cli::{Cli, MountOpt};
use asdfs::config::Settings;
use asdfs::fs::Asdfs;
use asdfs::store::memory::MemoryStore;
use asdfs::store::RecordStore;
use asdfs::{logging, mount};

/// Resolve the configured store backend.
///
/// The wire client for a remote cluster implements [`RecordStore`] out of
/// tree and plugs in here; this build bundles the in-process backend,
/// selected with `host: memory`.
fn connect(settings: &Settings) -> anyhow::Result<Arc<dyn RecordStore>> {
    match settings.aerospike.host.as_str() {
        "" => bail!("aerospike.host is not set"),
        "memory" => Ok(Arc::new(MemoryStore::new())),
        host => bail!(
            "no transport for {host}:{} in this build; the remote client adapter \
             provides it (the bundled backend is selected with host: memory)",
            settings.aerospike.port
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();
    let mut settings =
        Settings::from_file(&cli.config).context("loading configuration")?;
    for opt in &cli.options {
        match opt {
            MountOpt::Rw => settings.set_read_write(),
            MountOpt::Ro => settings.set_read_only(),
            MountOpt::Debug => settings.set_debug(),
        }
    }
    if settings.mount_params.debug && settings.log.level < 4 {
        settings.log.level = 4;
    }
    logging::init(&settings.log)?;

    let mountpoint = cli
        .mountpoint
        .clone()
        .unwrap_or_else(|| PathBuf::from(&settings.mount_dir));
    if mountpoint.as_os_str().is_empty() {
        bail!("no mount point: pass one on the command line or set mountDir");
    }

    let store = connect(&settings)?;
    let fs = Arc::new(Asdfs::new(store, settings.clone()));
    fs.initialize().await.context("initializing filesystem")?;

    info!("mounting on {}", mountpoint.display());
    let rt = tokio::runtime::Handle::current();
    let serve_fs = Arc::clone(&fs);
    tokio::task::spawn_blocking(move || mount::serve(serve_fs, &settings, &mountpoint, rt))
        .await
        .context("fuse session thread")??;

    // The session ended (unmount or signal); drain whatever is still in
    // flight before the store client goes away.
    fs.shutdown().await;
    Ok(())
}
