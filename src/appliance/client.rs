//! HTTP client for the appliance REST API

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde_json::{json, Value};
use tracing::{debug, instrument, trace};

use super::response::{classify, classify_get};
use super::Appliance;
use crate::config::ApplianceConfig;
use crate::declaration::PatchItem;
use crate::Error;

const DECLARE_PATH: &str = "/mgmt/shared/appsvcs/declare";
const LICENSE_PATH: &str = "/mgmt/tm/sys/license";
const SYS_CONFIG_PATH: &str = "/mgmt/tm/sys/config";

/// Basic-auth client for the declarative and system endpoints
pub struct ApplianceClient {
    http: reqwest::Client,
    config: ApplianceConfig,
}

impl ApplianceClient {
    /// Build a client; TLS verification follows `config.insecure`
    pub fn new(config: ApplianceConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.config.url, path))
            .basic_auth(&self.config.username, Some(&self.config.password))
    }

    async fn send(&self, req: RequestBuilder) -> Result<(u16, Vec<u8>), Error> {
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?.to_vec();
        trace!(status, body = %String::from_utf8_lossy(&body), "appliance response");
        Ok((status, body))
    }
}

#[async_trait]
impl Appliance for ApplianceClient {
    #[instrument(skip(self))]
    async fn get_declaration(&self, partition: &str) -> Result<Value, Error> {
        let (status, body) = self
            .send(self.request(Method::GET, &format!("{DECLARE_PATH}/{partition}")))
            .await?;
        classify_get(status, &body)
    }

    #[instrument(skip(self, items), fields(items = items.len()))]
    async fn patch(&self, items: &[PatchItem]) -> Result<(), Error> {
        if items.is_empty() {
            debug!("nothing to patch");
            return Ok(());
        }
        let (status, body) = self
            .send(self.request(Method::PATCH, DECLARE_PATH).json(items))
            .await?;
        classify(status, &body)
    }

    #[instrument(skip(self, declaration))]
    async fn declare(&self, declaration: &Value, tenants: &[String]) -> Result<(), Error> {
        let (status, body) = self
            .send(
                self.request(Method::POST, &format!("{DECLARE_PATH}/{}", tenants.join(",")))
                    .json(declaration),
            )
            .await?;
        classify(status, &body)
    }

    async fn save_config(&self) -> Result<(), Error> {
        let (status, body) = self
            .send(
                self.request(Method::POST, SYS_CONFIG_PATH)
                    .json(&json!({"command": "save"})),
            )
            .await?;
        classify(status, &body)
    }

    async fn license(&self) -> Result<Value, Error> {
        let (status, body) = self.send(self.request(Method::GET, LICENSE_PATH)).await?;
        if status != 200 {
            classify(status, &body)?;
        }
        Ok(serde_json::from_slice(&body)?)
    }
}
