use anyhow::{Context, Result};
use regex::Regex;

pub const DEFAULT_GATEWAY_BASE: &str = "https://gateway.pinata.cloud/ipfs/";

const IPFS_SCHEME: &str = "ipfs://";

/// Rewrites content-addressed token references onto a fetchable HTTP gateway.
#[derive(Debug, Clone)]
pub struct UriNormalizer {
    gateway_base: String,
    embedded_path: Regex,
}

impl UriNormalizer {
    pub fn new(gateway_base: &str) -> Result<Self> {
        let embedded_path =
            Regex::new(r"ipfs/([\w\d]+.*)").context("failed to compile ipfs path regex")?;
        let gateway_base = if gateway_base.ends_with('/') {
            gateway_base.to_string()
        } else {
            format!("{gateway_base}/")
        };

        Ok(Self {
            gateway_base,
            embedded_path,
        })
    }

    pub fn gateway_base(&self) -> &str {
        &self.gateway_base
    }

    /// Returns `None` when the reference is absent or cannot be turned into an HTTP address.
    pub fn normalize(&self, uri: Option<&str>) -> Option<String> {
        let uri = uri.filter(|value| !value.is_empty())?;

        if let Some(path) = uri.strip_prefix(IPFS_SCHEME) {
            return Some(format!("{}{}", self.gateway_base, path));
        }

        if let Some(segment) = self.embedded_path.captures(uri).and_then(|caps| caps.get(1)) {
            return Some(format!("{}{}", self.gateway_base, segment.as_str()));
        }

        if uri.starts_with("http") {
            return Some(uri.to_string());
        }

        None
    }
}
