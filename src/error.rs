use std::path::PathBuf;

use thiserror::Error;

/// CNI error code for a request that could not be decoded.
pub const ERR_DECODING_FAILURE: u32 = 6;

/// CNI error code used for every other fatal failure of this plugin.
pub const ERR_PLUGIN: u32 = 100;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while serving one CNI invocation
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed network configuration: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to read stdin: {0}")]
    Stdin(#[source] std::io::Error),

    #[error("no IPAM found")]
    MissingIpam,

    #[error("{0}")]
    Config(String),

    #[error("invalid CIDR {cidr:?}: {reason}")]
    InvalidCidr { cidr: String, reason: String },

    #[error("cache {path}: {reason}")]
    CacheInvalid { path: PathBuf, reason: String },

    #[error("node {0:?} not found")]
    NodeNotFound(String),

    #[error("own node object not found")]
    OwnNodeNotFound,

    #[error("failed to read machine-id from {path}: {source}")]
    MachineId {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("kubernetes client configuration: {0}")]
    ClientConfig(String),

    #[error("kubernetes API: {0}")]
    Kube(#[from] kube::Error),

    #[error("{name} not found in CNI_PATH {path:?}")]
    DelegateNotFound { name: String, path: String },

    #[error("failed to launch {path}: {source}")]
    DelegateLaunch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} failed: {msg}")]
    DelegateFailed { path: PathBuf, msg: String },

    #[error("invocation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("failed to create tokio runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

/// Coarse classification deciding how a failure is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Decode,
    Config,
    CacheInvalid,
    NodeLookup,
    Delegation,
    Runtime,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Decode(_) | Error::Stdin(_) => ErrorKind::Decode,
            Error::MissingIpam | Error::Config(_) | Error::InvalidCidr { .. } => ErrorKind::Config,
            Error::CacheInvalid { .. } => ErrorKind::CacheInvalid,
            Error::NodeNotFound(_)
            | Error::OwnNodeNotFound
            | Error::MachineId { .. }
            | Error::ClientConfig(_)
            | Error::Kube(_) => ErrorKind::NodeLookup,
            Error::DelegateNotFound { .. }
            | Error::DelegateLaunch { .. }
            | Error::DelegateFailed { .. } => ErrorKind::Delegation,
            Error::Timeout(_) | Error::Runtime(_) => ErrorKind::Runtime,
        }
    }

    /// Cache failures only mean the ranges must be resolved again
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::CacheInvalid
    }

    /// CNI error code reported on stdout. A config without an "ipam"
    /// section is reported like a request that could not be decoded.
    pub fn code(&self) -> u32 {
        match (self, self.kind()) {
            (Error::MissingIpam, _) | (_, ErrorKind::Decode) => ERR_DECODING_FAILURE,
            _ => ERR_PLUGIN,
        }
    }

    /// Short description of the step that failed
    pub fn msg(&self) -> &'static str {
        match self {
            Error::Timeout(_) => return "Deadline exceeded",
            Error::MissingIpam => return "Decode stdin",
            _ => {}
        }
        match self.kind() {
            ErrorKind::Decode => "Decode stdin",
            ErrorKind::Config => "CIDR config",
            ErrorKind::CacheInvalid => "Read cache",
            ErrorKind::NodeLookup => "Get the own node object",
            ErrorKind::Delegation => "Invoke host-local ipam",
            ErrorKind::Runtime => "Create runtime",
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub(crate) fn cache(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::CacheInvalid {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_failures_use_decoding_code() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = Error::from(err);
        assert_eq!(err.code(), ERR_DECODING_FAILURE);
        assert_eq!(Error::MissingIpam.code(), ERR_DECODING_FAILURE);
        assert_eq!(err.msg(), "Decode stdin");
    }

    #[test]
    fn missing_ipam_is_config_reported_as_decode() {
        let err = Error::MissingIpam;
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(err.code(), ERR_DECODING_FAILURE);
        assert_eq!(err.msg(), "Decode stdin");
    }

    #[test]
    fn delegation_failures_are_grouped() {
        let err = Error::DelegateNotFound {
            name: "host-local".into(),
            path: "/opt/cni/bin".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Delegation);
        assert_eq!(err.code(), ERR_PLUGIN);
        assert_eq!(err.msg(), "Invoke host-local ipam");
    }

    #[test]
    fn node_lookup_failures_are_grouped() {
        assert_eq!(Error::OwnNodeNotFound.kind(), ErrorKind::NodeLookup);
        assert_eq!(Error::NodeNotFound("n1".into()).kind(), ErrorKind::NodeLookup);
        assert_eq!(Error::config("x").kind(), ErrorKind::Config);
    }

    #[test]
    fn cache_failures_are_not_fatal() {
        let err = Error::cache("/tmp/kube-node.json", "no such file");
        assert!(!err.is_fatal());
        assert!(Error::OwnNodeNotFound.is_fatal());
        assert_eq!(Error::Timeout(std::time::Duration::from_secs(15)).msg(), "Deadline exceeded");
    }
}
