//! Errors of platform construction and lookup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("unknown host {0}")]
    UnknownHost(String),

    #[error("unknown link {0}")]
    UnknownLink(String),

    #[error("unknown disk {0}")]
    UnknownDisk(String),

    #[error("unknown topology node {0}")]
    UnknownNode(String),

    #[error("name {0} is used more than once")]
    DuplicateName(String),

    #[error("no route from {src} to {dst}")]
    NoRoute { src: String, dst: String },

    #[error("host {host} has no pstate {pstate} (pstate count is {count})")]
    InvalidPstate { host: String, pstate: usize, count: usize },

    #[error("invalid {what}: {value}")]
    InvalidValue { what: String, value: f64 },

    #[error("can't read file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("can't parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("can't parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}
