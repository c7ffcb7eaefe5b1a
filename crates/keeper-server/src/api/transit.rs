//! Signed HTTP client for keeper-to-keeper admin forwarding.
//!
//! Sign parameters always travel in the query string; operation parameters
//! go into the query for GETs and into the form body for POSTs.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use keeper_api::{NodeInfo, NodeSnapshot};
use keeper_common::error::{KeeperError, Result};
use keeper_common::sign::{GuidParams, server_guid};

use crate::api::handler::INNER_SECRET_KEY;

const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PARTNER: &str = "server";

#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error: String,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T> {
        if self.error_code != 0 {
            return Err(KeeperError::Backend(format!(
                "remote keeper error {}: {}",
                self.error_code, self.error
            )));
        }
        self.data
            .ok_or_else(|| KeeperError::Backend("remote keeper returned no data".to_string()))
    }
}

#[derive(Clone)]
pub struct TransitClient {
    http: reqwest::Client,
}

impl Default for TransitClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TransitClient {
    pub fn new() -> TransitClient {
        TransitClient {
            http: reqwest::Client::new(),
        }
    }

    fn sign_params() -> BTreeMap<String, String> {
        let guid_params = GuidParams {
            partner: DEFAULT_PARTNER.to_string(),
            rand: rand::rng().random::<u64>().to_string(),
            time: chrono::Utc::now().timestamp().to_string(),
        };
        BTreeMap::from([
            (
                "guid".to_string(),
                server_guid(&guid_params, INNER_SECRET_KEY),
            ),
            ("partner".to_string(), guid_params.partner),
            ("rand".to_string(), guid_params.rand),
            ("time".to_string(), guid_params.time),
        ])
    }

    async fn get<T: DeserializeOwned>(
        &self,
        host: &str,
        path: &str,
        params: BTreeMap<String, String>,
    ) -> Result<Envelope<T>> {
        let mut query = Self::sign_params();
        query.extend(params);
        let resp = self
            .http
            .get(format!("http://{host}{path}"))
            .timeout(DEFAULT_CLIENT_TIMEOUT)
            .query(&query)
            .send()
            .await
            .map_err(|e| KeeperError::Backend(format!("transit {host}{path}: {e}")))?;
        resp.json()
            .await
            .map_err(|e| KeeperError::Backend(format!("transit {host}{path}: {e}")))
    }

    async fn post<T: DeserializeOwned>(
        &self,
        host: &str,
        path: &str,
        params: BTreeMap<String, String>,
    ) -> Result<Envelope<T>> {
        let resp = self
            .http
            .post(format!("http://{host}{path}"))
            .timeout(DEFAULT_CLIENT_TIMEOUT)
            .query(&Self::sign_params())
            .form(&params)
            .send()
            .await
            .map_err(|e| KeeperError::Backend(format!("transit {host}{path}: {e}")))?;
        resp.json()
            .await
            .map_err(|e| KeeperError::Backend(format!("transit {host}{path}: {e}")))
    }

    fn transit_params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        let mut params: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        params.insert("transit".to_string(), "true".to_string());
        params
    }

    pub async fn conf_status(&self, host: &str, domain: &str) -> Result<Vec<NodeInfo>> {
        self.get(host, "/conf/status", Self::transit_params(&[("domain", domain)]))
            .await?
            .into_data()
    }

    pub async fn conf_reload(&self, host: &str, domain: &str) -> Result<BTreeMap<String, bool>> {
        self.post(host, "/conf/reload", Self::transit_params(&[("domain", domain)]))
            .await?
            .into_data()
    }

    pub async fn node_list(
        &self,
        host: &str,
        domain: &str,
        component: &str,
    ) -> Result<Vec<NodeSnapshot>> {
        self.get(
            host,
            "/node/list",
            Self::transit_params(&[("domain", domain), ("component", component)]),
        )
        .await?
        .into_data()
    }

    /// Returned verbatim so the caller can relay the remote envelope.
    pub async fn node_info(
        &self,
        host: &str,
        domain: &str,
        node_id: &str,
    ) -> Result<Envelope<serde_json::Value>> {
        self.get(
            host,
            "/node/info",
            Self::transit_params(&[("domain", domain), ("nodeid", node_id)]),
        )
        .await
    }

    pub async fn node_manage(
        &self,
        host: &str,
        domain: &str,
        operate: &str,
        node_id: &str,
        component: &str,
    ) -> Result<()> {
        let envelope: Envelope<serde_json::Value> = self
            .post(
                host,
                "/node/manage",
                Self::transit_params(&[
                    ("domain", domain),
                    ("operate", operate),
                    ("nodeid", node_id),
                    ("component", component),
                ]),
            )
            .await?;
        if envelope.error_code != 0 {
            return Err(KeeperError::Backend(format!(
                "remote keeper error {}: {}",
                envelope.error_code, envelope.error
            )));
        }
        Ok(())
    }
}
