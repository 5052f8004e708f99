//! Contains the system configuration.
//!
//! Provides access to the system configuration which is loaded from a YAML file (most probably
//! **config/settings.yml**). Note that the file is observed for changes and reloaded once a
//! change is detected. Therefore each user of the config should attach itself to the
//! [Config::notifier](Config::notifier) and re-process its settings once a change message is
//! received. Being an in-memory cache we want to prevent restarts / downtimes as much as
//! possible - even when the node set or the bind address changes.
//!
//! Note that the **Config** struct is kind of constant and can be kept around. However, when
//! using [Config::current](Config::current) to obtain the current config handle, this should
//! not be stored, as it will not be updated once a new config has been loaded.
//!
//! # Examples
//!
//! ```
//! # use callisto::config::Config;
//! let config = Config::new("somefile.yml");
//! config.load_from_string("
//! peer:
//!     port: 12345
//! ", None).unwrap();
//!
//! assert_eq!(config.current().config()["peer"]["port"].as_i64().unwrap(), 12345);
//! ```
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use arc_swap::ArcSwap;
use yaml_rust::{Yaml, YamlLoader};

/// Provides access to the system configuration.
///
/// An instance is usually created via [install](install), which also starts the change monitor.
/// Components which have to react to updates register a change listener by calling
/// [Config::notifier](Config::notifier), as we expect them to pick up config changes without
/// restarting the application.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<(Yaml, Option<SystemTime>)>,
}

/// Represents the change listener.
///
/// Internally this is simply the receiver of a broadcast. The actual message being broadcast
/// can and should be ignored. All that matters is, once a message has been received, the config
/// was changed and needs to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a handle to the currently loaded configuration.
///
/// Note that this handle should not be stored or kept around for long, as it will not be
/// updated if the underlying config changed.
pub struct Handle {
    config: Arc<(Yaml, Option<SystemTime>)>,
}

impl Handle {
    /// Provides access to the currently loaded configuration.
    ///
    /// Missing sections simply yield a **BadValue** when indexed, so readers can drill into
    /// the document and supply their fallbacks at the very end:
    /// `handle.config()["peer"]["port"].as_i64().unwrap_or(2420)`.
    pub fn config(&self) -> &Yaml {
        &self.config.0
    }
}

impl Config {
    /// Creates a new config reading the given file.
    ///
    /// Note that this will not install a change listener. This is only done by the
    /// [install](install) function.
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new((Yaml::Null, None))),
            tx,
        }
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a handle to the currently loaded configuration.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Determines the last modified date of the config file on disk.
    ///
    /// As within docker, the file is presented as volume, we check that it is a file, as an
    /// unmounted docker volume is always presented as directory.
    #[cfg(not(test))]
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Forces the config to read the underlying file.
    ///
    /// Note that this is normally called by the framework and should not be invoked manually.
    pub async fn load(&self) -> anyhow::Result<()> {
        log::info!("Loading config file {}...", &self.filename);

        if let Ok(metadata) = tokio::fs::metadata(&self.filename).await {
            if !metadata.is_file() {
                log::info!(
                    "Config file doesn't exist or is an unmounted docker volume - skipping config load."
                );
                return Ok(());
            }
        }

        let config_data = match tokio::fs::read_to_string(&self.filename).await {
            Ok(data) => data,
            Err(error) => {
                return Err(anyhow::anyhow!(
                    "Cannot load config file {}: {}",
                    &self.filename,
                    error
                ));
            }
        };

        let last_modified = tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .and_then(|metadata| metadata.modified().ok());

        self.load_from_string(config_data.as_str(), last_modified)
    }

    /// Writes the given data into the config file after verifying that it is valid YAML.
    ///
    /// There is no need to trigger a reload manually, the change monitor will detect the
    /// modification and broadcast an update.
    pub async fn store(&self, config: &str) -> anyhow::Result<()> {
        log::info!(
            "Programmatically updating the config file {}...",
            &self.filename
        );

        if let Err(error) = YamlLoader::load_from_str(config) {
            Err(anyhow::anyhow!("Cannot parse config data: {}", error))
        } else {
            tokio::fs::write(&self.filename, config)
                .await
                .context("Failed to write to config file!")?;
            log::info!("Config has been updated successfully!");

            Ok(())
        }
    }

    /// Loads a configuration from the given string instead of a file.
    ///
    /// This is intended to be used in test environments where we cannot / do not want to load
    /// a config file from disk.
    ///
    /// # Example
    ///
    /// ```
    /// # use callisto::config::Config;
    /// let config = Config::new("somefile.yml");
    /// config.load_from_string("
    /// peer:
    ///     port: 12345
    /// ", None).unwrap();
    ///
    /// assert_eq!(config.current().config()["peer"]["port"].as_i64().unwrap(), 12345);
    /// ```
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let docs = match YamlLoader::load_from_str(data) {
            Ok(docs) => docs,
            Err(error) => {
                return Err(anyhow::anyhow!(
                    "Cannot parse config file {}: {}",
                    &self.filename,
                    error
                ));
            }
        };

        let doc = docs.into_iter().next().unwrap_or(Yaml::Null);

        // Store the updated config...
        self.config.store(Arc::new((doc, last_modified)));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.clone().send(());

        Ok(())
    }
}

/// Creates a **Config** for the given file and starts its change monitor.
///
/// This will immediately try to read the file. A missing file is not an error (the node then
/// runs on its fallback settings), a malformed one is reported and ignored.
pub async fn install(filename: &str) -> Arc<Config> {
    let config = Arc::new(Config::new(filename));

    if let Err(error) = config.load().await {
        log::error!("{:#}", error);
    }

    run_config_change_monitor(config.clone());

    config
}

#[cfg(test)]
fn run_config_change_monitor(_config: Arc<Config>) {
    // No automatic updates during testing...
}

#[cfg(not(test))]
fn run_config_change_monitor(config: Arc<Config>) {
    crate::spawn!(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;

            // This will contain the last modified date of the file on disk or be None if the
            // file is absent...
            let last_modified = config.last_modified().await;

            // Contains the timestamp when the file was loaded the last time or None if no
            // data has been loaded yet...
            let last_loaded = config.config.load().1;

            // If a file is present and newer than the one previously loaded (or if none has
            // been loaded so far) -> perform a reload and broadcast an update if the file has
            // been successfully loaded...
            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => {
                        log::info!("System configuration was re-loaded.");
                    }
                    Err(error) => log::error!("Failed to re-load system config: {}", error),
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use crate::config::Config;
    use crate::testing::test_async;

    #[test]
    fn config_updates_are_broadcast() {
        test_async(async {
            let config = Config::new("callisto_test_config.yml");

            // Load an initial config...
            config
                .load_from_string("test: 42", Some(SystemTime::now()))
                .unwrap();

            // Setup a task which notifies our oneshot channel once the config changes...
            let mut change_notifier = config.notifier();
            let (tx, rx) = tokio::sync::oneshot::channel();
            crate::spawn!(async move {
                if change_notifier.recv().await.is_ok() {
                    tx.send(()).unwrap();
                }
            });

            // Ensure that the initial config is present...
            assert_eq!(config.current().config()["test"].as_i64().unwrap(), 42);

            // Ensure that a malformed config is simply ignored...
            assert_eq!(
                config
                    .load_from_string("test: 'invalid", Some(SystemTime::now()))
                    .is_err(),
                true
            );
            assert_eq!(config.current().config()["test"].as_i64().unwrap(), 42);

            // Change the config...
            config
                .load_from_string("test: 4242", Some(SystemTime::now()))
                .unwrap();

            // Await the change notification...
            rx.await.unwrap();

            // Ensure that the new config is now present...
            assert_eq!(config.current().config()["test"].as_i64().unwrap(), 4242);
        });
    }

    #[test]
    fn a_config_file_survives_a_round_trip() {
        test_async(async {
            let directory = tempfile::tempdir().unwrap();
            let file = directory.path().join("settings.yml");
            let config = Config::new(file.to_str().unwrap());

            config
                .store(
                    "
peer:
    port: 14812
",
                )
                .await
                .unwrap();
            config.load().await.unwrap();

            assert_eq!(
                config.current().config()["peer"]["port"].as_i64().unwrap(),
                14812
            );

            // Writing an invalid config file is prevented...
            assert_eq!(config.store("peer: \"test").await.is_err(), true);
        });
    }
}
