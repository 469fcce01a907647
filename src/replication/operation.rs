//! Cluster operation descriptor

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Request method of a cluster operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Options,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Whether the method changes cluster state
    pub fn is_mutable(&self) -> bool {
        !matches!(self, Self::Get | Self::Head | Self::Options)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unknown request method '{}'", other)),
        }
    }
}

/// One logical client operation to run on every connected node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOperation {
    pub request_id: Uuid,
    pub method: Method,
    /// Target resource path, e.g. `/process-groups/root`
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Per-node bound overriding the replicator's default
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl ClusterOperation {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            method,
            path: path.into(),
            payload: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_mutable(&self) -> bool {
        self.method.is_mutable()
    }

    /// Non-empty path segments, ignoring any query string
    pub fn path_segments(&self) -> Vec<&str> {
        let path = self.path.split('?').next().unwrap_or_default();
        path.split('/').filter(|segment| !segment.is_empty()).collect()
    }
}

impl fmt::Display for ClusterOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.method, self.path, self.request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutability() {
        assert!(!ClusterOperation::get("/counters").is_mutable());
        assert!(ClusterOperation::new(Method::Put, "/processors/p1").is_mutable());
        assert!(ClusterOperation::new(Method::Delete, "/connections/c1").is_mutable());
        assert!(!Method::Options.is_mutable());
    }

    #[test]
    fn test_path_segments_ignore_query_and_slashes() {
        let op = ClusterOperation::get("/flow/process-groups/root/?recursive=true");
        assert_eq!(op.path_segments(), vec!["flow", "process-groups", "root"]);
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("patch".parse::<Method>().unwrap(), Method::Patch);
        assert!("FETCH".parse::<Method>().is_err());
    }
}
