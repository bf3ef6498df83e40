//! Per-network cache of the resolved host-local configuration.
//!
//! The cache spares an API server round trip on every invocation. It is
//! not locked: a partially written or stale file fails validation and is
//! treated like a missing one, after which the ranges are resolved again
//! from the node object.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::types::HostLocalIpam;

/// The cache file of one network
#[derive(Debug, Clone)]
pub struct ResolutionCache {
    path: PathBuf,
}

impl ResolutionCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Cache for `network`, inside `data_dir` if given and the default
    /// data directory of the network otherwise
    pub fn for_network(settings: &Settings, network: &str, data_dir: Option<&str>) -> Self {
        let dir = match data_dir {
            Some(dir) => PathBuf::from(dir),
            None => settings.default_data_dir(network),
        };
        Self::new(dir.join(&settings.cache_file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and validate the cached config. Every failure is reported as
    /// `Error::CacheInvalid`.
    pub fn read(&self) -> Result<HostLocalIpam> {
        let data = fs::read(&self.path).map_err(|e| Error::cache(&self.path, e))?;
        let ipam: HostLocalIpam =
            serde_json::from_slice(&data).map_err(|e| Error::cache(&self.path, e))?;
        ipam.validate().map_err(|e| Error::cache(&self.path, e))?;
        trace!(path = %self.path.display(), ?ipam, "Cache read");
        Ok(ipam)
    }

    /// Create a validated config from resolved subnets
    pub fn build<S: AsRef<str>>(subnets: &[S], data_dir: Option<String>) -> Result<HostLocalIpam> {
        HostLocalIpam::from_subnets(subnets, data_dir)
    }

    /// Store the config. Failures are only logged, the next invocation
    /// will then resolve the ranges again.
    pub fn write(&self, ipam: &HostLocalIpam) {
        if let Err(err) = self.try_write(ipam) {
            debug!(path = %self.path.display(), error = %err, "Write cache");
        }
    }

    fn try_write(&self, ipam: &HostLocalIpam) -> std::io::Result<()> {
        let data = serde_json::to_vec(ipam)?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, data)
    }

    /// Remove the cache file, ignoring failures
    pub fn invalidate(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_cache_path() {
        let settings = Settings::default();
        let cache = ResolutionCache::for_network(&settings, "net1", None);
        assert_eq!(cache.path(), Path::new("/var/lib/cni/networks/net1/kube-node.json"));

        let cache = ResolutionCache::for_network(&settings, "net1", Some("/run/ipam"));
        assert_eq!(cache.path(), Path::new("/run/ipam/kube-node.json"));
    }

    #[test]
    fn test_write_read_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResolutionCache::new(dir.path().join("nested/kube-node.json"));
        let ipam = ResolutionCache::build(&["10.0.0.0/24", "fd00::/120"], None).unwrap();

        assert_eq!(cache.read().unwrap_err().kind(), ErrorKind::CacheInvalid);
        cache.write(&ipam);
        assert_eq!(cache.read().unwrap(), ipam);

        cache.invalidate();
        assert!(!cache.path().exists());
        cache.invalidate();
    }

    #[test]
    fn test_invalid_content_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResolutionCache::new(dir.path().join("kube-node.json"));

        for content in [
            "",
            "{\"type\":\"host-local\",\"ranges\":[[{\"subn",
            r#"{"type":"dhcp","ranges":[[{"subnet":"10.0.0.0/24"}]]}"#,
            r#"{"type":"host-local","ranges":[[{"subnet":"10.0.0.0/24"}],[{"subnet":"11.0.0.0/24"}]]}"#,
        ] {
            fs::write(cache.path(), content).unwrap();
            let err = cache.read().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::CacheInvalid, "{content}");
        }
    }

    #[test]
    fn test_write_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let cache = ResolutionCache::new(blocker.join("kube-node.json"));
        let ipam = ResolutionCache::build(&["10.0.0.0/24"], None).unwrap();
        cache.write(&ipam);
        assert!(cache.read().is_err());
    }
}
