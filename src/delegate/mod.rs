use std::env;
use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, enabled, trace, Level};

use crate::error::{Error, Result};
use crate::types::{DelegateConf, ErrorResult};

/// Locate executable `name` in a CNI_PATH style directory list
pub fn find_in_path(name: &str, cni_path: &str) -> Result<PathBuf> {
    env::split_paths(cni_path)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| Error::DelegateNotFound {
            name: name.to_string(),
            path: cni_path.to_string(),
        })
}

/// The chained IPAM plugin
#[derive(Debug, Clone)]
pub struct Delegate {
    path: PathBuf,
    env: Vec<(String, String)>,
    check: bool,
}

impl Delegate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            env: Vec::new(),
            check: false,
        }
    }

    /// Find `name` in `cni_path`
    pub fn locate(name: &str, cni_path: &str) -> Result<Self> {
        Ok(Self::new(find_in_path(name, cni_path)?))
    }

    /// Set a variable on top of the inherited environment
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Mark the invocation as CHECK, which may legitimately print nothing
    pub fn for_check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    /// Run the plugin with `conf` on stdin and return its stdout as is.
    /// The child inherits the environment and stderr, and is killed if
    /// the returned future is dropped.
    pub async fn invoke(&self, conf: &DelegateConf) -> Result<Vec<u8>> {
        let launch = |source: std::io::Error| Error::DelegateLaunch {
            path: self.path.clone(),
            source,
        };
        let stdin = serde_json::to_vec(conf).map_err(|e| launch(e.into()))?;
        trace!(path = %self.path.display(), config = %String::from_utf8_lossy(&stdin), "To host-local");

        let mut child = Command::new(&self.path)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(launch)?;

        if let Some(mut input) = child.stdin.take() {
            if let Err(e) = input.write_all(&stdin).await {
                // The plugin may exit without reading its config
                if e.kind() != IoErrorKind::BrokenPipe {
                    return Err(launch(e));
                }
            }
        }

        let output = child.wait_with_output().await.map_err(launch)?;
        if !output.status.success() {
            let msg = match serde_json::from_slice::<ErrorResult>(&output.stdout) {
                Ok(res) if res.details.is_empty() => res.msg,
                Ok(res) => format!("{}; {}", res.msg, res.details),
                Err(_) => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    format!("{} {}", output.status, stdout.trim())
                        .trim_end()
                        .to_string()
                }
            };
            debug!(path = %self.path.display(), %msg, "host-local failed");
            return Err(Error::DelegateFailed {
                path: self.path.clone(),
                msg,
            });
        }

        self.log_result(&output.stdout);
        Ok(output.stdout)
    }

    fn log_result(&self, stdout: &[u8]) {
        if !enabled!(Level::TRACE) {
            return;
        }
        match serde_json::from_slice::<serde_json::Value>(stdout) {
            Ok(result) => trace!(%result, "host-local result"),
            Err(error) if !self.check => trace!(%error, "host-local result not json"),
            Err(_) => {}
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::types::HostLocalIpam;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn conf() -> DelegateConf {
        DelegateConf {
            name: "net1".into(),
            cni_version: "1.0.0".into(),
            is_default_gateway: true,
            ipam: Some(HostLocalIpam::from_subnets(&["10.0.0.0/24"], None).unwrap()),
        }
    }

    #[test]
    fn test_find_in_path() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let expected = script(b.path(), "host-local", "exit 0");
        fs::create_dir(a.path().join("host-local")).unwrap();

        let cni_path = env::join_paths([a.path(), b.path()]).unwrap();
        let found = find_in_path("host-local", cni_path.to_str().unwrap()).unwrap();
        assert_eq!(found, expected);

        let err = find_in_path("host-local", a.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::DelegateNotFound { .. }));
        assert!(find_in_path("host-local", "").is_err());
    }

    #[tokio::test]
    async fn test_invoke_forwards_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let seen = dir.path().join("stdin.json");
        let body = format!(
            "cat > {}\nprintf '%s' \"$EXTRA\"\nprintf ' {{\"cniVersion\": \"1.0.0\"}}'",
            seen.display()
        );
        let delegate = Delegate::new(script(dir.path(), "host-local", &body)).with_env("EXTRA", "x");

        let out = delegate.invoke(&conf()).await.unwrap();
        assert_eq!(out, b"x {\"cniVersion\": \"1.0.0\"}");

        let stdin: DelegateConf = serde_json::from_slice(&fs::read(seen).unwrap()).unwrap();
        assert_eq!(stdin, conf());
    }

    #[tokio::test]
    async fn test_invoke_non_json_output_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let delegate = Delegate::new(script(dir.path(), "host-local", "printf 'not json'")).for_check(true);
        assert_eq!(delegate.invoke(&conf()).await.unwrap(), b"not json");
    }

    #[tokio::test]
    async fn test_invoke_failure() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"cat >/dev/null
echo '{"cniVersion":"1.0.0","code":11,"msg":"no addresses","details":"range full"}'
exit 1"#;
        let delegate = Delegate::new(script(dir.path(), "host-local", body));

        let err = delegate.invoke(&conf()).await.unwrap_err();
        match err {
            Error::DelegateFailed { msg, .. } => assert_eq!(msg, "no addresses; range full"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let delegate = Delegate::new(dir.path().join("missing"));
        let err = delegate.invoke(&conf()).await.unwrap_err();
        assert!(matches!(err, Error::DelegateLaunch { .. }));
    }
}
