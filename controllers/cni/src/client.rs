//! Node agent RPC client
//!
//! Implements [`AddressAllocator`] over the agent's HTTP surface. Error
//! bodies are turned back into the [`IpamError`] the agent produced, so the
//! plugin reports the same failure the agent saw.

use crate::error::PluginError;
use async_trait::async_trait;
use attach::AddressAllocator;
use attach::orchestrator::parse_address;
use ipam::api::{
    ALLOCATE_PATH, AllocateRequest, AllocateResponse, ErrorBody, GATEWAY_PATH, GatewayResponse, HEALTH_PATH,
    HealthResponse, RELEASE_PATH, ReleaseRequest, ReleaseResponse,
};
use ipam::{IpamError, StoreError};
use reqwest::{Client, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::debug;

/// Client of the node agent
#[derive(Debug, Clone)]
pub struct AgentClient {
    client: Client,
    base_url: String,
}

fn unavailable(err: reqwest::Error) -> IpamError {
    IpamError::Store(StoreError::Unavailable(format!("node agent: {}", err)))
}

impl AgentClient {
    /// Create a new agent client
    ///
    /// # Arguments
    /// * `base_url` - agent base URL (e.g., "http://127.0.0.1:50051")
    /// * `timeout` - limit on each call
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PluginError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, IpamError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);
        let response = self.client.get(&url).send().await.map_err(unavailable)?;
        decode(response).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, IpamError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(unavailable)?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, IpamError> {
    let status = response.status();
    let body = response.text().await.map_err(unavailable)?;

    if status.is_success() {
        return serde_json::from_str(&body).map_err(|e| {
            IpamError::Store(StoreError::Unavailable(format!(
                "unexpected agent response: {} - {}",
                e,
                body.chars().take(200).collect::<String>()
            )))
        });
    }

    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(err) => Err(IpamError::from_wire(err.code, err.message)),
        Err(_) => Err(IpamError::Store(StoreError::Unavailable(format!(
            "node agent returned {}: {}",
            status, body
        )))),
    }
}

#[async_trait]
impl AddressAllocator for AgentClient {
    async fn health(&self) -> Result<(), IpamError> {
        let health: HealthResponse = self.get(HEALTH_PATH).await?;
        if health.status != "OK" {
            return Err(IpamError::Store(StoreError::Unavailable(format!(
                "node agent reports {}",
                health.status
            ))));
        }
        Ok(())
    }

    async fn allocate(&self, request: &AllocateRequest) -> Result<Ipv4Addr, IpamError> {
        let response: AllocateResponse = self.post(ALLOCATE_PATH, request).await?;
        parse_address(&response.address)
    }

    async fn release(&self, request: &ReleaseRequest) -> Result<(), IpamError> {
        let _: ReleaseResponse = self.post(RELEASE_PATH, request).await?;
        Ok(())
    }

    async fn gateway(&self, node: &str) -> Result<Ipv4Addr, IpamError> {
        let response: GatewayResponse = self.get(&format!("{}/{}", GATEWAY_PATH, node)).await?;
        parse_address(&response.gateway_address)
    }
}
