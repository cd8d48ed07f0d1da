use log::{error, info, warn};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::catalog::SubscriptionCatalog;
use crate::error::{Error, Result};
use crate::profile::{now_secs, remove_files, ProxyDescriptor, ProxyFile, Subscription};
use crate::proxy_config::{ListenPorts, ProxyConfigFactory, ProxyProtocol};
use crate::remote::RemoteFetcher;
use crate::settings::{GlobalSettings, SettingReader};
use crate::store::Store;

const CONFIG_FILENAME: &str = "config.yaml";
const SUBSCRIPTION_FILENAME: &str = "subscription.yaml";

/// Owns the config directory: global settings, the subscription catalog and the
/// generated proxy files.
///
/// Construct it once at startup and hand it to collaborators. Methods are not
/// synchronised; callers that share it across tasks wrap it in a mutex.
pub struct GlobalConfig {
    config_dir: PathBuf,
    settings: Store<GlobalSettings>,
    catalog: SubscriptionCatalog,
    factory: ProxyConfigFactory,
    fetcher: RemoteFetcher,
}

impl GlobalConfig {
    /// Opens (or seeds) `config.yaml` and `subscription.yaml` under `config_dir`.
    ///
    /// Listen ports for generated configs come from `reader`, falling back to the
    /// values in `config.yaml`.
    pub fn init(config_dir: impl Into<PathBuf>, reader: &SettingReader) -> Result<Self> {
        let config_dir = config_dir.into();
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).map_err(|e| Error::io(&config_dir, e))?;
        }

        let config_path = config_dir.join(CONFIG_FILENAME);
        let first_run = fs::metadata(&config_path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);
        let mut settings = Store::<GlobalSettings>::open(&config_path)?;
        if first_run {
            info!("seeding {:?} with defaults", config_path);
            settings.save()?;
        }

        let catalog = SubscriptionCatalog::open(config_dir.join(SUBSCRIPTION_FILENAME))?;
        let ports = ListenPorts {
            http: reader.http_port().unwrap_or(settings.get().http_port),
            socks: reader.socks_port().unwrap_or(settings.get().socks_port),
        };
        let factory = ProxyConfigFactory::new(&config_dir, ports);

        Ok(Self {
            config_dir,
            settings,
            catalog,
            factory,
            fetcher: RemoteFetcher::default(),
        })
    }

    pub fn with_fetcher(mut self, fetcher: RemoteFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn get_config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILENAME)
    }

    pub fn get_subscription_path(&self) -> PathBuf {
        self.config_dir.join(SUBSCRIPTION_FILENAME)
    }

    pub fn settings(&self) -> &GlobalSettings {
        self.settings.get()
    }

    pub fn catalog(&self) -> &SubscriptionCatalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut SubscriptionCatalog {
        &mut self.catalog
    }

    pub fn new_proxy_config(&self, desc: &ProxyDescriptor) -> Result<ProxyFile> {
        self.factory.materialize(desc)
    }

    /// Fetches `url` and writes one config file per usable proxy.
    ///
    /// The result is not added to the catalog. Fails if `name` is already taken,
    /// the fetch fails, or the document has no `proxies` list; bad entries are
    /// skipped individually.
    pub async fn new_subscription(
        &self,
        name: &str,
        url: &str,
        update_interval: &str,
    ) -> Result<Subscription> {
        if self.catalog.exists(name) {
            error!("subscription '{}' already exists", name);
            return Err(Error::AlreadyExists(name.to_string()));
        }
        self.build_subscription(name, url, update_interval).await
    }

    /// [`GlobalConfig::new_subscription`] followed by adding it to the catalog.
    pub async fn add_subscription(
        &mut self,
        name: &str,
        url: &str,
        update_interval: &str,
    ) -> Result<Subscription> {
        let sub = self.new_subscription(name, url, update_interval).await?;
        let paths: Vec<PathBuf> = sub.files.iter().map(|f| f.path.clone()).collect();
        if let Err(e) = self.catalog.add(sub.clone()) {
            self.discard_unreferenced(&paths);
            return Err(e);
        }
        Ok(sub)
    }

    async fn build_subscription(
        &self,
        name: &str,
        url: &str,
        update_interval: &str,
    ) -> Result<Subscription> {
        let doc = self.fetcher.fetch(url).await.ok_or_else(|| Error::Remote {
            url: url.to_string(),
            reason: "fetch failed".to_string(),
        })?;
        let descriptors = ProxyDescriptor::list_from(&doc).ok_or_else(|| {
            error!("subscription '{}' at {} has no proxies list", name, url);
            Error::Remote {
                url: url.to_string(),
                reason: "document has no 'proxies' list".to_string(),
            }
        })?;

        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for desc in &descriptors {
            let (Some(proxy_name), Some(tag)) = (desc.name(), desc.protocol_tag()) else {
                warn!("{}: skipping proxy without name or type", name);
                continue;
            };
            if let Err(e) = tag.parse::<ProxyProtocol>() {
                warn!("{}: skipping '{}': {}", name, proxy_name, e);
                continue;
            }
            if !seen.insert(proxy_name.to_string()) {
                warn!("{}: skipping duplicate proxy name '{}'", name, proxy_name);
                continue;
            }
            match self.factory.materialize(desc) {
                Ok(file) => files.push(file),
                Err(e) => warn!("{}: skipping '{}': {}", name, proxy_name, e),
            }
        }

        info!(
            "subscription '{}': {} of {} proxies usable",
            name,
            files.len(),
            descriptors.len()
        );
        Ok(Subscription::new(name, url, update_interval, files))
    }

    /// Re-fetches an existing subscription and swaps in the fresh file set.
    ///
    /// The old files are deleted only after the replacement entry is persisted.
    pub async fn sync_proxy_config(
        &mut self,
        name: &str,
        url: &str,
        update_interval: &str,
    ) -> Result<()> {
        let Some(current) = self.catalog.get(name) else {
            error!("subscription '{}' not found", name);
            return Err(Error::NotFound(name.to_string()));
        };
        let old_paths = current.existing_paths();

        let fresh = self.build_subscription(name, url, update_interval).await?;
        let new_paths: Vec<PathBuf> = fresh.files.iter().map(|f| f.path.clone()).collect();
        if new_paths.is_empty() && !old_paths.is_empty() {
            error!("sync of '{}' produced no usable proxies", name);
            return Err(Error::EmptyReplacement(name.to_string()));
        }

        if let Err(e) = self.catalog.update(name, fresh) {
            error!("failed to persist synced subscription '{}': {}", name, e);
            self.discard_unreferenced(&new_paths);
            return Err(e);
        }

        remove_files(&old_paths);
        info!("subscription '{}' synced", name);
        Ok(())
    }

    /// Re-syncs `name` from its stored URL and interval.
    pub async fn sync_subscription(&mut self, name: &str) -> Result<()> {
        let (url, interval) = match self.catalog.get(name) {
            Some(sub) => (sub.url.clone(), sub.update_interval.clone()),
            None => return Err(Error::NotFound(name.to_string())),
        };
        self.sync_proxy_config(name, &url, &interval).await
    }

    /// Re-syncs every subscription whose numeric interval has elapsed.
    pub async fn sync_due(&mut self) -> Result<Vec<(String, Result<()>)>> {
        let now = now_secs();
        let due: Vec<String> = self
            .catalog
            .get_all()?
            .into_iter()
            .filter(|s| s.is_due(now))
            .map(|s| s.name)
            .collect();

        let mut outcomes = Vec::with_capacity(due.len());
        for name in due {
            let outcome = self.sync_subscription(&name).await;
            outcomes.push((name, outcome));
        }
        Ok(outcomes)
    }

    // A failed catalog write leaves the fresh entry in memory; only delete its files
    // once a reload has dropped that entry again.
    fn discard_unreferenced(&mut self, paths: &[PathBuf]) {
        match self.catalog.reload() {
            Ok(()) => remove_files(paths),
            Err(e) => warn!(
                "catalog reload failed ({}), keeping {} new files",
                e,
                paths.len()
            ),
        }
    }

    /// The subscription named as default in `config.yaml`, if any.
    pub fn get_default_subscription(&self) -> Option<&Subscription> {
        let Some(name) = self.settings.get().default.as_deref() else {
            info!("no default subscription configured");
            return None;
        };
        let sub = self.catalog.get(name);
        if sub.is_none() {
            warn!("default subscription '{}' is not in the catalog", name);
        }
        sub
    }

    pub fn set_default_subscription(&mut self, name: &str) -> Result<()> {
        if !self.catalog.exists(name) {
            return Err(Error::NotFound(name.to_string()));
        }
        self.settings.get_mut().default = Some(name.to_string());
        self.settings.save()
    }

    pub fn clear_default_subscription(&mut self) -> Result<()> {
        self.settings.get_mut().default = None;
        self.settings.save()
    }

    /// Removes `name` from the catalog, clears it as default and deletes its files.
    pub fn remove_subscription(&mut self, name: &str) -> Result<Subscription> {
        let removed = self
            .catalog
            .remove(name)?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        if self.settings.get().default.as_deref() == Some(name) {
            self.clear_default_subscription()?;
        }
        remove_files(&removed.existing_paths());
        info!("removed subscription '{}'", name);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init(dir: &TempDir) -> GlobalConfig {
        GlobalConfig::init(dir.path().join("config"), &SettingReader::default()).unwrap()
    }

    fn local_subscription(config: &GlobalConfig, name: &str) -> Subscription {
        let desc = ProxyDescriptor::new(
            serde_yaml::from_str("{name: HK, type: hysteria2, server: '1.2.3.4:443', auth: s}")
                .unwrap(),
        );
        let file = config.new_proxy_config(&desc).unwrap();
        Subscription::new(name, "http://127.0.0.1:9/sub", "3600", vec![file])
    }

    #[test]
    fn first_run_seeds_global_settings() {
        let dir = TempDir::new().unwrap();
        let config = init(&dir);
        assert_eq!(config.settings(), &GlobalSettings::default());
        let raw = fs::read_to_string(config.get_config_path()).unwrap();
        assert!(raw.contains("httpPort: 7899"), "{}", raw);
        assert!(raw.contains("socksPort: 7900"), "{}", raw);
        assert!(config.get_subscription_path().exists());
    }

    #[test]
    fn reader_ports_take_precedence() {
        let dir = TempDir::new().unwrap();
        let reader = SettingReader::from_yaml("httpPort: 1080\n").unwrap();
        let config = GlobalConfig::init(dir.path(), &reader).unwrap();
        assert_eq!(
            config.factory.ports(),
            ListenPorts {
                http: 1080,
                socks: 7900
            }
        );
    }

    #[test]
    fn default_subscription_lifecycle() {
        let dir = TempDir::new().unwrap();
        let mut config = init(&dir);
        assert!(config.get_default_subscription().is_none());
        assert!(matches!(
            config.set_default_subscription("work"),
            Err(Error::NotFound(_))
        ));

        let sub = local_subscription(&config, "work");
        config.catalog_mut().add(sub).unwrap();
        config.set_default_subscription("work").unwrap();
        assert_eq!(config.get_default_subscription().unwrap().name, "work");

        let reopened = init(&dir);
        assert_eq!(reopened.settings().default.as_deref(), Some("work"));
        assert_eq!(reopened.get_default_subscription().unwrap().files.len(), 1);
    }

    #[test]
    fn default_naming_a_missing_subscription_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join("config");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join(CONFIG_FILENAME), "default: gone\n").unwrap();
        let config = init(&dir);
        assert_eq!(config.settings().default.as_deref(), Some("gone"));
        assert!(config.get_default_subscription().is_none());
    }

    #[test]
    fn remove_subscription_cascades() {
        let dir = TempDir::new().unwrap();
        let mut config = init(&dir);
        let sub = local_subscription(&config, "work");
        let path = sub.files[0].path.clone();
        config.catalog_mut().add(sub).unwrap();
        config.set_default_subscription("work").unwrap();

        let removed = config.remove_subscription("work").unwrap();
        assert_eq!(removed.name, "work");
        assert!(!path.exists());
        assert!(config.settings().default.is_none());
        assert!(!config.catalog().exists("work"));
        assert!(matches!(
            config.remove_subscription("work"),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn sync_of_unknown_subscription_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let mut config = init(&dir);
        let before = fs::read_dir(config.config_dir()).unwrap().count();
        let err = config
            .sync_proxy_config("test", "http://127.0.0.1:9/sub", "10")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(ref n) if n == "test"));
        assert_eq!(fs::read_dir(config.config_dir()).unwrap().count(), before);
    }
}
