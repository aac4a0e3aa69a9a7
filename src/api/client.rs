//! Thin JSON client for the swap server's HTTP API, mirroring the shape of
//! `BoltzLightning` in `ark-lightning/src/boltz.rs`: one method per
//! endpoint over a shared `reqwest::Client`.

use std::path::Path;

use crate::api::types::{CreateReverseSwapResponse, CreateSubmarineSwapResponse, CreateSwapRequest, PairsResponse};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub async fn create_submarine_swap(&self, req: &CreateSwapRequest) -> Result<CreateSubmarineSwapResponse> {
        let url = format!("{}/createswap", self.base_url);
        let resp = self.http.post(&url).json(req).send().await?;
        if !resp.status().is_success() {
            return Err(Error::SwapServerUnreachable(format!(
                "createswap (submarine) returned {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    pub async fn create_reverse_swap(&self, req: &CreateSwapRequest) -> Result<CreateReverseSwapResponse> {
        let url = format!("{}/createswap", self.base_url);
        let resp = self.http.post(&url).json(req).send().await?;
        if !resp.status().is_success() {
            return Err(Error::SwapServerUnreachable(format!(
                "createswap (reverse) returned {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    pub async fn get_pairs(&self) -> Result<PairsResponse> {
        let url = format!("{}/getpairs", self.base_url);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::SwapServerUnreachable(format!(
                "getpairs returned {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    /// Fetch `GET /getpairs`, writing the raw response JSON to `cache_path`
    /// (the "cached to disk as `swap_pairs`" of the wire contract) so a
    /// restart can fall back to the last known pairs if the server is
    /// briefly unreachable.
    pub async fn get_pairs_cached(&self, cache_path: &Path) -> Result<PairsResponse> {
        let url = format!("{}/getpairs", self.base_url);
        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body = resp.text().await?;
                let pairs: PairsResponse = serde_json::from_str(&body)?;
                if let Some(parent) = cache_path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                let _ = std::fs::write(cache_path, &body);
                Ok(pairs)
            }
            other => {
                let fallback_err = match other {
                    Ok(resp) => Error::SwapServerUnreachable(format!("getpairs returned {}", resp.status())),
                    Err(e) => Error::from(e),
                };
                let contents = std::fs::read_to_string(cache_path).map_err(|_| fallback_err)?;
                serde_json::from_str(&contents).map_err(Error::from)
            }
        }
    }
}
