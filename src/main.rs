use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use basalt::config::{AppCache, AppHandles, AppSettings};
use basalt::scripts::load_triggers_from_dir;
use basalt::server::{run_with_port, AppState};
use basalt::storage::MemoryDatabase;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("building log filter")?;
    fmt().with_env_filter(filter).init();

    let rust_log = env_or("RUST_LOG", "<unset>");
    let http_port: u16 = env_or("BASALT_HTTP_PORT", "1337").parse().context("BASALT_HTTP_PORT must be a port number")?;
    let mount = env_or("BASALT_MOUNT", &format!("http://localhost:{}/1", http_port));
    let cloud_dir = std::env::var("BASALT_CLOUD_DIR").ok().map(PathBuf::from);

    let settings = match std::env::var("BASALT_APP_CONFIG") {
        Ok(path) => AppSettings::load_from_file(&PathBuf::from(path))?,
        Err(_) => {
            let mut s = AppSettings::new(env_or("BASALT_APP_ID", "basalt"), env_or("BASALT_MASTER_KEY", "master"));
            s.server_url = mount.clone();
            s
        }
    };
    info!(
        target: "basalt",
        "basalt starting: RUST_LOG='{}', http_port={}, mount='{}', app_id='{}', cloud_dir={:?}",
        rust_log, http_port, mount, settings.app_id, cloud_dir
    );

    let handles = AppHandles::for_settings(&settings, Arc::new(MemoryDatabase::new()));
    if let Some(dir) = cloud_dir.as_deref() {
        let loaded = load_triggers_from_dir(&handles.triggers, &settings.app_id, dir)?;
        info!(target: "basalt", "loaded {} cloud code trigger(s) from {}", loaded, dir.display());
    }
    let cache = AppCache::new();
    cache.register(settings, handles)?;

    run_with_port(http_port, AppState { cache, mount }).await
}
