//! Configuration hot reload.
//!
//! A [`notify`] watcher observes the configuration file's directory. When the
//! file changes, it is re-read and:
//!
//! - the admin password hash and token lifetime are replaced in the
//!   [`AuthGate`] (the signing key is kept, so issued tokens stay valid)
//! - the `[ui]` section is swapped into the shared UI config
//!
//! Rate limiter constants and hub sizing are fixed at startup. A file that
//! fails to load leaves the running configuration untouched.
//!
//! The notify callback only forwards a signal over a channel; loading and
//! password hashing happen on a blocking thread spawned by the reload task.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use anyhow::Context;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::auth::AuthGate;
use crate::config::{Config, SharedUiConfig};

/// Quiet period after a change before reloading. Editors often write a file
/// in several steps.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Watches the configuration file and applies changes.
///
/// Dropping the watcher stops both the file subscription and the reload
/// task.
#[derive(Debug)]
pub struct ConfigWatcher {
    /// Kept alive to maintain the watch subscription.
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
    path: PathBuf,
}

impl ConfigWatcher {
    /// Starts watching `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file system watcher cannot be created or the
    /// file's directory cannot be watched.
    pub fn spawn(path: PathBuf, auth: Arc<AuthGate>, ui: SharedUiConfig) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel::<()>(16);
        let file_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .context("configuration path has no file name")?;

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let relevant = (event.kind.is_modify() || event.kind.is_create())
                        && event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == Some(file_name.as_os_str()));
                    if relevant {
                        trace!(kind = ?event.kind, "Configuration file changed");
                        // A full channel already has a reload pending.
                        let _ = tx.try_send(());
                    }
                }
                Err(err) => error!(error = %err, "Configuration watcher error"),
            },
            notify::Config::default(),
        )
        .context("failed to create configuration watcher")?;

        let dir = watch_dir(&path);
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;

        let task = tokio::spawn(run_reloads(rx, path.clone(), auth, ui));
        info!(path = %path.display(), "Watching configuration for changes");

        Ok(Self {
            _watcher: watcher,
            task,
            path,
        })
    }

    /// The watched configuration file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

async fn run_reloads(
    mut changes: mpsc::Receiver<()>,
    path: PathBuf,
    auth: Arc<AuthGate>,
    ui: SharedUiConfig,
) {
    while changes.recv().await.is_some() {
        tokio::time::sleep(DEBOUNCE).await;
        while changes.try_recv().is_ok() {}

        if let Err(err) = reload_from(&path, &auth, &ui).await {
            warn!(
                path = %path.display(),
                error = %format!("{err:#}"),
                "Configuration reload failed, keeping previous configuration"
            );
        }
    }

    debug!("Configuration reload task stopped");
}

/// Reloads `path` and applies the reloadable settings.
///
/// Nothing is changed unless the file loads and validates.
pub async fn reload_from(
    path: &Path,
    auth: &Arc<AuthGate>,
    ui: &SharedUiConfig,
) -> anyhow::Result<()> {
    let path = path.to_path_buf();
    let gate = Arc::clone(auth);

    let config = tokio::task::spawn_blocking(move || -> anyhow::Result<Config> {
        let config = Config::load_from(&path)?;
        gate.set_admin_credentials(&config.admin.password, &config.admin.token_duration)?;
        Ok(config)
    })
    .await
    .context("configuration reload task failed")??;

    *ui.write().unwrap_or_else(PoisonError::into_inner) = config.ui;
    info!("Configuration reloaded");
    Ok(())
}
