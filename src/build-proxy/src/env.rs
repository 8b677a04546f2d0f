//! Collaborator interfaces used while rewriting a build context.
//!
//! The build proxy does not decide which environment variables a container
//! needs, how a container reaches the host, or which override files exist.
//! Those are supplied through the traits here; simple reference
//! implementations are provided for the common Docker setup.

use std::io::Write;
use std::path::PathBuf;

use a3s_box_core::error::{BoxError, Result};

/// Ordered environment variable mapping with unique keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvVars(Vec<(String, String)>);

impl EnvVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a variable. Replacing keeps the original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    /// Remove a variable, returning its value if it was present.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(pos).1)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_pairs(self) -> Vec<(String, String)> {
        self.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvVars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut vars = EnvVars::new();
        for (key, value) in iter {
            vars.insert(key, value);
        }
        vars
    }
}

/// Operating system of the host or of the build target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    /// Platform this process runs on.
    pub fn current() -> Self {
        match std::env::consts::OS {
            "macos" => Self::MacOs,
            "windows" => Self::Windows,
            _ => Self::Linux,
        }
    }
}

/// How injected variables relate to the runtime's own environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeInheritance {
    /// POSIX runtime; values replace any existing variables.
    Posix,
    /// POSIX runtime; values may extend inherited variables.
    PosixInherit,
}

/// Inputs for computing proxy environment variables.
#[derive(Debug, Clone)]
pub struct ProxyEnvRequest<'a> {
    pub proxy_port: u16,
    /// In-container path of the injected CA certificate
    pub cert_path: &'a str,
    /// Address under which the container reaches the host
    pub host_address: &'a str,
    pub runtime: RuntimeInheritance,
    pub target_platform: Platform,
}

/// Computes the variables that route a container's traffic via the proxy.
pub trait ProxyEnvGenerator {
    fn proxy_env(&self, request: &ProxyEnvRequest<'_>) -> Result<EnvVars>;
}

/// Resolves the address a container uses to reach the host.
pub trait HostAddressResolver {
    fn host_address(&self, host_platform: Platform) -> Result<String>;
}

/// Writes override files into the rewritten build context.
pub trait OverridePacker {
    fn pack_overrides<W: Write>(&self, archive: &mut tar::Builder<W>, base_path: &str)
        -> Result<()>;
}

/// Standard proxy variables understood by most HTTP clients and TLS stacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardProxyEnv;

impl ProxyEnvGenerator for StandardProxyEnv {
    fn proxy_env(&self, request: &ProxyEnvRequest<'_>) -> Result<EnvVars> {
        let proxy_url = format!("http://{}:{}", request.host_address, request.proxy_port);
        let mut vars = EnvVars::new();
        vars.insert("HTTP_PROXY", proxy_url.as_str());
        vars.insert("HTTPS_PROXY", proxy_url.as_str());
        vars.insert("http_proxy", proxy_url.as_str());
        vars.insert("https_proxy", proxy_url.as_str());

        vars.insert("SSL_CERT_FILE", request.cert_path);
        vars.insert("NODE_EXTRA_CA_CERTS", request.cert_path);
        vars.insert("REQUESTS_CA_BUNDLE", request.cert_path);
        vars.insert("GIT_SSL_CAINFO", request.cert_path);
        vars.insert("CURL_CA_BUNDLE", request.cert_path);
        Ok(vars)
    }
}

/// Resolves the host through Docker's default networking.
#[derive(Debug, Clone, Copy, Default)]
pub struct DockerHostResolver;

/// Gateway of Docker's default bridge network.
pub const DOCKER_BRIDGE_GATEWAY: &str = "172.17.0.1";

impl HostAddressResolver for DockerHostResolver {
    fn host_address(&self, host_platform: Platform) -> Result<String> {
        Ok(match host_platform {
            Platform::Linux => DOCKER_BRIDGE_GATEWAY.to_string(),
            // Docker Desktop runs the engine in a VM and exposes the host by name
            Platform::MacOs | Platform::Windows => "host.docker.internal".to_string(),
        })
    }
}

/// Writes no override files.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOverrides;

impl OverridePacker for NoOverrides {
    fn pack_overrides<W: Write>(
        &self,
        _archive: &mut tar::Builder<W>,
        _base_path: &str,
    ) -> Result<()> {
        Ok(())
    }
}

/// Packs every file below a host directory under the override base path.
#[derive(Debug, Clone)]
pub struct DirectoryOverrides {
    root: PathBuf,
}

impl DirectoryOverrides {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl OverridePacker for DirectoryOverrides {
    fn pack_overrides<W: Write>(&self, archive: &mut tar::Builder<W>, base_path: &str) -> Result<()> {
        if !self.root.is_dir() {
            return Err(BoxError::BuildError(format!(
                "Override directory {} does not exist",
                self.root.display()
            )));
        }

        archive.append_dir_all(base_path, &self.root).map_err(|e| {
            BoxError::BuildError(format!(
                "Failed to add overrides from {}: {}",
                self.root.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_vars_insert_replaces_in_place() {
        let mut vars = EnvVars::new();
        vars.insert("A", "1");
        vars.insert("B", "2");
        vars.insert("A", "3");
        let pairs: Vec<(&str, &str)> = vars.iter().collect();
        assert_eq!(pairs, vec![("A", "3"), ("B", "2")]);
    }

    #[test]
    fn test_env_vars_remove() {
        let mut vars: EnvVars = [("A", "1"), ("DOCKER_HOST", "tcp://x")].into_iter().collect();
        assert_eq!(vars.remove("DOCKER_HOST").as_deref(), Some("tcp://x"));
        assert_eq!(vars.remove("DOCKER_HOST"), None);
        assert_eq!(vars.len(), 1);
        assert_eq!(vars.get("A"), Some("1"));
    }

    #[test]
    fn test_standard_proxy_env() {
        let request = ProxyEnvRequest {
            proxy_port: 8000,
            cert_path: "/.a3s-box-injections/ca.pem",
            host_address: "172.17.0.1",
            runtime: RuntimeInheritance::PosixInherit,
            target_platform: Platform::Linux,
        };
        let vars = StandardProxyEnv.proxy_env(&request).unwrap();
        assert_eq!(vars.get("HTTP_PROXY"), Some("http://172.17.0.1:8000"));
        assert_eq!(vars.get("https_proxy"), Some("http://172.17.0.1:8000"));
        assert_eq!(vars.get("SSL_CERT_FILE"), Some("/.a3s-box-injections/ca.pem"));
        assert!(vars.get("DOCKER_HOST").is_none());
    }

    #[test]
    fn test_docker_host_resolver() {
        let resolver = DockerHostResolver;
        assert_eq!(resolver.host_address(Platform::Linux).unwrap(), "172.17.0.1");
        assert_eq!(
            resolver.host_address(Platform::MacOs).unwrap(),
            "host.docker.internal"
        );
        assert_eq!(
            resolver.host_address(Platform::Windows).unwrap(),
            "host.docker.internal"
        );
    }

    #[test]
    fn test_no_overrides_writes_nothing() {
        let mut builder = tar::Builder::new(Vec::new());
        NoOverrides.pack_overrides(&mut builder, "x/overrides").unwrap();
        let data = builder.into_inner().unwrap();
        let mut archive = tar::Archive::new(data.as_slice());
        assert_eq!(archive.entries().unwrap().count(), 0);
    }

    #[test]
    fn test_directory_overrides() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("js")).unwrap();
        std::fs::write(dir.path().join("js/prepend.js"), "// hook").unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        DirectoryOverrides::new(dir.path())
            .pack_overrides(&mut builder, ".a3s-box-injections/overrides")
            .unwrap();
        let data = builder.into_inner().unwrap();

        let mut archive = tar::Archive::new(data.as_slice());
        let paths: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(paths.contains(&".a3s-box-injections/overrides/js/prepend.js".to_string()));
    }

    #[test]
    fn test_directory_overrides_missing_dir() {
        let mut builder = tar::Builder::new(Vec::new());
        let result = DirectoryOverrides::new("/nonexistent/overrides")
            .pack_overrides(&mut builder, "overrides");
        assert!(result.is_err());
    }
}
