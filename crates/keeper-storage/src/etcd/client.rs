//! etcd v3 client over the HTTP/JSON gRPC-gateway.
//!
//! Uses the gateway endpoints (`/v3/kv/*`, `/v3/watch`, `/v3/lease/*`,
//! `/v3/lock/*`, `/v3/auth/authenticate`) so no second protobuf toolchain
//! is needed for the backend. Keys and values are base64 on the wire.
//!
//! Cheaply cloneable; the underlying `reqwest::Client` is an `Arc`.

use base64::Engine;
use bytes::BytesMut;
use futures::StreamExt;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{error, warn};

use keeper_common::error::{KeeperError, Result};

use super::{READ_TIMEOUT, RETRY_BACKOFF, RETRY_COUNT, WRITE_TIMEOUT};

/// Deserialize an i64 that may come as a JSON number or a JSON string
/// (the gateway emits 64-bit fields as strings).
fn i64_or_string<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum I64OrString {
        Num(i64),
        Str(String),
    }

    Option::<I64OrString>::deserialize(deserializer).and_then(|opt| match opt {
        None => Ok(None),
        Some(I64OrString::Num(n)) => Ok(Some(n)),
        Some(I64OrString::Str(s)) => s.parse::<i64>().map(Some).map_err(de::Error::custom),
    })
}

pub fn b64_encode(s: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(s.as_bytes())
}

pub fn b64_decode(s: &str) -> Result<String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| KeeperError::Backend(format!("base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| KeeperError::Backend(format!("utf8: {e}")))
}

/// End key of the range covering every key with the given prefix, base64.
pub fn prefix_range_end(prefix: &str) -> String {
    let mut end = prefix.as_bytes().to_vec();
    for i in (0..end.len()).rev() {
        if end[i] < 0xff {
            end[i] += 1;
            end.truncate(i + 1);
            return b64_encode(&String::from_utf8_lossy(&end));
        }
    }
    String::new()
}

#[derive(Serialize)]
struct AuthRequest {
    name: String,
    password: String,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: Option<String>,
}

#[derive(Clone, Default, Serialize)]
pub struct RangeRequest {
    pub key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub range_end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys_only: Option<bool>,
}

#[derive(Default, Deserialize)]
pub struct RangeResponse {
    #[serde(default)]
    pub kvs: Vec<KeyValue>,
    #[serde(default)]
    pub header: Option<ResponseHeader>,
}

#[derive(Deserialize)]
pub struct ResponseHeader {
    #[serde(default, deserialize_with = "i64_or_string")]
    pub revision: Option<i64>,
}

#[derive(Deserialize)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, deserialize_with = "i64_or_string")]
    pub create_revision: Option<i64>,
    #[serde(default, deserialize_with = "i64_or_string")]
    pub mod_revision: Option<i64>,
}

impl KeyValue {
    pub fn key_str(&self) -> Result<String> {
        b64_decode(&self.key)
    }

    pub fn value_str(&self) -> Result<String> {
        b64_decode(&self.value)
    }
}

#[derive(Clone, Default, Serialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<i64>,
}

#[derive(Deserialize)]
pub struct PutResponse {
    #[serde(default)]
    pub header: Option<ResponseHeader>,
}

#[derive(Clone, Default, Serialize)]
pub struct DeleteRangeRequest {
    pub key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub range_end: String,
}

#[derive(Deserialize)]
pub struct DeleteRangeResponse {
    #[serde(default, deserialize_with = "i64_or_string")]
    pub deleted: Option<i64>,
    #[serde(default)]
    pub header: Option<ResponseHeader>,
}

/// One operation of a `Then`-only transaction.
#[derive(Clone, Default, Serialize)]
pub struct RequestOp {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_range: Option<RangeRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_put: Option<PutRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_delete_range: Option<DeleteRangeRequest>,
}

impl RequestOp {
    pub fn put(key: &str, value: &str) -> RequestOp {
        RequestOp {
            request_put: Some(PutRequest {
                key: b64_encode(key),
                value: b64_encode(value),
                lease: None,
            }),
            ..Default::default()
        }
    }

    pub fn delete(key: &str) -> RequestOp {
        RequestOp {
            request_delete_range: Some(DeleteRangeRequest {
                key: b64_encode(key),
                range_end: String::new(),
            }),
            ..Default::default()
        }
    }

    pub fn get(key: &str) -> RequestOp {
        RequestOp {
            request_range: Some(RangeRequest {
                key: b64_encode(key),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[derive(Clone, Serialize)]
pub struct Compare {
    pub result: &'static str,
    pub target: &'static str,
    pub key: String,
    pub value: String,
}

impl Compare {
    pub fn value_equals(key: &str, value: &str) -> Compare {
        Compare {
            result: "EQUAL",
            target: "VALUE",
            key: b64_encode(key),
            value: b64_encode(value),
        }
    }
}

#[derive(Default, Serialize)]
pub struct TxnRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub compare: Vec<Compare>,
    pub success: Vec<RequestOp>,
}

#[derive(Default, Deserialize)]
pub struct TxnResponse {
    #[serde(default)]
    pub header: Option<ResponseHeader>,
    #[serde(default)]
    pub responses: Vec<ResponseOp>,
}

impl TxnResponse {
    pub fn revision(&self) -> i64 {
        self.header.as_ref().and_then(|h| h.revision).unwrap_or(0)
    }
}

#[derive(Default, Deserialize)]
pub struct ResponseOp {
    #[serde(default)]
    pub response_range: Option<RangeResponse>,
}

#[derive(Serialize)]
pub struct WatchCreateRequest {
    pub create_request: WatchCreate,
}

#[derive(Serialize)]
pub struct WatchCreate {
    pub key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub range_end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_revision: Option<i64>,
}

#[derive(Deserialize)]
pub struct WatchResponse {
    #[serde(default)]
    pub result: Option<WatchResult>,
}

#[derive(Deserialize)]
pub struct WatchResult {
    #[serde(default)]
    pub events: Vec<WatchEvent>,
    #[serde(default)]
    pub header: Option<ResponseHeader>,
}

#[derive(Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    pub kv: Option<KeyValue>,
}

#[derive(Serialize)]
struct LeaseGrantRequest {
    #[serde(rename = "TTL")]
    ttl: u64,
}

#[derive(Deserialize)]
struct LeaseGrantResponse {
    #[serde(rename = "ID")]
    id: Option<String>,
}

#[derive(Serialize)]
struct LeaseKeepAliveRequest {
    #[serde(rename = "ID")]
    id: i64,
}

#[derive(Deserialize)]
struct LeaseKeepAliveResponse {
    result: Option<LeaseKeepAliveResult>,
}

#[derive(Deserialize)]
struct LeaseKeepAliveResult {
    #[serde(rename = "TTL", default, deserialize_with = "i64_or_string")]
    ttl: Option<i64>,
}

#[derive(Serialize)]
struct LeaseRevokeRequest {
    #[serde(rename = "ID")]
    id: i64,
}

#[derive(Serialize)]
struct LockRequest {
    name: String,
    lease: i64,
}

#[derive(Deserialize)]
struct LockResponse {
    key: Option<String>,
}

#[derive(Serialize)]
struct UnlockRequest {
    key: String,
}

/// Shared etcd v3 HTTP/JSON client.
#[derive(Clone)]
pub struct EtcdClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl EtcdClient {
    /// Connect to etcd, trying each endpoint in order until one answers.
    /// Authenticates when credentials are provided.
    pub async fn connect(endpoints: &[String], username: &str, password: &str) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(KeeperError::InvalidArgument(
                "etcd: no endpoints configured".to_string(),
            ));
        }

        let http = reqwest::Client::new();
        let mut last_error = None;

        for endpoint in endpoints {
            let base_url = normalize_endpoint(endpoint);

            let auth_token = if !username.is_empty() {
                match http
                    .post(format!("{base_url}/v3/auth/authenticate"))
                    .timeout(super::DIAL_TIMEOUT)
                    .json(&AuthRequest {
                        name: username.to_string(),
                        password: password.to_string(),
                    })
                    .send()
                    .await
                {
                    Ok(resp) => {
                        let auth: AuthResponse = resp
                            .json()
                            .await
                            .map_err(|e| KeeperError::Backend(format!("etcd auth: {e}")))?;
                        auth.token
                    }
                    Err(e) => {
                        warn!("etcd: endpoint {} auth failed: {}, trying next", base_url, e);
                        last_error = Some(KeeperError::Backend(e.to_string()));
                        continue;
                    }
                }
            } else {
                // probe connectivity with a lightweight range request
                let probe = http
                    .post(format!("{base_url}/v3/kv/range"))
                    .timeout(super::DIAL_TIMEOUT)
                    .json(&RangeRequest {
                        key: b64_encode("/"),
                        keys_only: Some(true),
                        ..Default::default()
                    })
                    .send()
                    .await;
                match probe {
                    Ok(_) => None,
                    Err(e) => {
                        warn!("etcd: endpoint {} unreachable: {}, trying next", base_url, e);
                        last_error = Some(KeeperError::Backend(e.to_string()));
                        continue;
                    }
                }
            };

            return Ok(Self {
                http,
                base_url,
                auth_token,
            });
        }

        Err(last_error
            .unwrap_or_else(|| KeeperError::Backend("etcd: all endpoints failed".to_string())))
    }

    async fn post_json<B: Serialize>(
        &self,
        path: &str,
        body: &B,
        timeout: std::time::Duration,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.post(&url).timeout(timeout).json(body);
        if let Some(ref token) = self.auth_token {
            req = req.header("Authorization", token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| KeeperError::Backend(format!("etcd {path}: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(KeeperError::Backend(format!(
                "etcd {path} failed: {status} - {body}"
            )));
        }
        Ok(resp)
    }

    async fn parse<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        resp.json()
            .await
            .map_err(|e| KeeperError::Backend(format!("etcd response: {e}")))
    }

    /// Range query with retry and back-off on transport errors.
    pub async fn range(&self, req: &RangeRequest) -> Result<RangeResponse> {
        let mut last = None;
        for attempt in 0..RETRY_COUNT {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            match self.post_json("/v3/kv/range", req, READ_TIMEOUT).await {
                Ok(resp) => return Self::parse(resp).await,
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| KeeperError::Backend("etcd range failed".to_string())))
    }

    /// Read a single key, optionally at a snapshot revision.
    pub async fn get(&self, key: &str, revision: Option<i64>) -> Result<RangeResponse> {
        self.range(&RangeRequest {
            key: b64_encode(key),
            revision: revision.filter(|r| *r >= 0),
            ..Default::default()
        })
        .await
    }

    /// Prefix scan, optionally at a snapshot revision.
    pub async fn get_prefix(&self, prefix: &str, revision: Option<i64>) -> Result<RangeResponse> {
        self.range(&RangeRequest {
            key: b64_encode(prefix),
            range_end: prefix_range_end(prefix),
            revision: revision.filter(|r| *r >= 0),
            ..Default::default()
        })
        .await
    }

    /// Put with retry; returns the resulting revision.
    pub async fn put(&self, key: &str, value: &str, lease: Option<i64>) -> Result<i64> {
        let req = PutRequest {
            key: b64_encode(key),
            value: b64_encode(value),
            lease,
        };
        let mut last = None;
        for attempt in 0..RETRY_COUNT {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            match self.post_json("/v3/kv/put", &req, WRITE_TIMEOUT).await {
                Ok(resp) => {
                    let put: PutResponse = Self::parse(resp).await?;
                    return Ok(put.header.and_then(|h| h.revision).unwrap_or(0));
                }
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| KeeperError::Backend("etcd put failed".to_string())))
    }

    /// Delete a key or a whole prefix. No retry. Returns `(deleted, revision)`.
    pub async fn delete(&self, key: &str, prefix: bool) -> Result<(i64, i64)> {
        let req = DeleteRangeRequest {
            key: b64_encode(key),
            range_end: if prefix {
                prefix_range_end(key)
            } else {
                String::new()
            },
        };
        let resp = self
            .post_json("/v3/kv/deleterange", &req, WRITE_TIMEOUT)
            .await?;
        let del: DeleteRangeResponse = Self::parse(resp).await?;
        Ok((
            del.deleted.unwrap_or(0),
            del.header.and_then(|h| h.revision).unwrap_or(0),
        ))
    }

    /// Commit a `Then`-only transaction. No retry.
    pub async fn txn(&self, ops: Vec<RequestOp>) -> Result<TxnResponse> {
        self.txn_compare(Vec::new(), ops).await
    }

    /// Commit a guarded transaction. No retry.
    pub async fn txn_compare(
        &self,
        compare: Vec<Compare>,
        ops: Vec<RequestOp>,
    ) -> Result<TxnResponse> {
        let req = TxnRequest {
            compare,
            success: ops,
        };
        let resp = self.post_json("/v3/kv/txn", &req, WRITE_TIMEOUT).await?;
        Self::parse(resp).await
    }

    /// Open a watch stream over a key or prefix.
    pub async fn watch_stream(
        &self,
        key: &str,
        prefix: bool,
        start_revision: Option<i64>,
    ) -> Result<WatchStream> {
        let req = WatchCreateRequest {
            create_request: WatchCreate {
                key: b64_encode(key),
                range_end: if prefix {
                    prefix_range_end(key)
                } else {
                    String::new()
                },
                start_revision: start_revision.filter(|r| *r > 0),
            },
        };
        let url = format!("{}/v3/watch", self.base_url);
        let mut builder = self.http.post(&url).json(&req);
        if let Some(ref token) = self.auth_token {
            builder = builder.header("Authorization", token);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| KeeperError::Backend(format!("etcd watch: {e}")))?;
        if !resp.status().is_success() {
            return Err(KeeperError::Backend(format!(
                "etcd watch failed: {}",
                resp.status()
            )));
        }
        Ok(WatchStream {
            stream: Box::pin(resp.bytes_stream()),
            buf: BytesMut::with_capacity(4096),
        })
    }

    /// Grant a lease.
    pub async fn lease_grant(&self, ttl: u64) -> Result<i64> {
        let resp = self
            .post_json("/v3/lease/grant", &LeaseGrantRequest { ttl }, WRITE_TIMEOUT)
            .await?;
        let grant: LeaseGrantResponse = Self::parse(resp).await?;
        let id: i64 = grant
            .id
            .unwrap_or_default()
            .parse()
            .unwrap_or(0);
        if id == 0 {
            return Err(KeeperError::Backend(
                "lease grant returned invalid ID".to_string(),
            ));
        }
        Ok(id)
    }

    /// Keep a lease alive (single ping). `LeaseNotFound` when it expired.
    pub async fn lease_keepalive(&self, lease_id: i64) -> Result<()> {
        let resp = self
            .post_json(
                "/v3/lease/keepalive",
                &LeaseKeepAliveRequest { id: lease_id },
                WRITE_TIMEOUT,
            )
            .await?;
        let ka: LeaseKeepAliveResponse = Self::parse(resp).await?;
        match ka.result.and_then(|r| r.ttl) {
            Some(ttl) if ttl > 0 => Ok(()),
            _ => Err(KeeperError::LeaseNotFound),
        }
    }

    /// Revoke a lease.
    pub async fn lease_revoke(&self, lease_id: i64) -> Result<()> {
        self.post_json(
            "/v3/lease/revoke",
            &LeaseRevokeRequest { id: lease_id },
            WRITE_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Acquire the named lock under `lease`. Blocks until acquired or the
    /// deadline passes; the returned key releases the lock.
    pub async fn lock(
        &self,
        name: &str,
        lease: i64,
        timeout: std::time::Duration,
    ) -> Result<String> {
        let req = LockRequest {
            name: b64_encode(name),
            lease,
        };
        let resp = self
            .post_json("/v3/lock/lock", &req, timeout)
            .await
            .map_err(|e| KeeperError::LockBusy(format!("{name}: {e}")))?;
        let lock: LockResponse = Self::parse(resp).await?;
        lock.key
            .ok_or_else(|| KeeperError::LockBusy(format!("{name}: empty lock key")))
    }

    /// Release a lock by the key returned from [`EtcdClient::lock`].
    pub async fn unlock(&self, key: &str) -> Result<()> {
        self.post_json(
            "/v3/lock/unlock",
            &UnlockRequest {
                key: key.to_string(),
            },
            WRITE_TIMEOUT,
        )
        .await?;
        Ok(())
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

/// A streaming watch connection yielding parsed responses.
pub struct WatchStream {
    stream: std::pin::Pin<
        Box<dyn futures::Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Send>,
    >,
    buf: BytesMut,
}

impl WatchStream {
    /// Read the next response. `None` when the stream ends; the caller owns
    /// the re-watch loop.
    pub async fn next_response(&mut self) -> Option<WatchResponse> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line_bytes = self.buf.split_to(pos + 1);
                let line = String::from_utf8_lossy(&line_bytes).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<WatchResponse>(&line) {
                    Ok(resp) => return Some(resp),
                    Err(e) => {
                        error!("etcd: watch response parse failed: {}, line={}", e, line);
                        continue;
                    }
                }
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    self.buf.extend_from_slice(&chunk);
                }
                Some(Err(e)) => {
                    error!("etcd: watch stream error: {}", e);
                    return None;
                }
                None => {
                    if !self.buf.is_empty() {
                        let line = String::from_utf8_lossy(&self.buf).trim().to_string();
                        self.buf.clear();
                        if !line.is_empty()
                            && let Ok(resp) = serde_json::from_str::<WatchResponse>(&line)
                        {
                            return Some(resp);
                        }
                    }
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_b64_roundtrip() {
        let key = "/keeper/conf/live/global.conf/DEFAULT/listen";
        assert_eq!(b64_decode(&b64_encode(key)).unwrap(), key);
    }

    #[test]
    fn test_prefix_range_end() {
        let end = prefix_range_end("/keeper/conf/");
        assert_eq!(b64_decode(&end).unwrap(), "/keeper/conf0");
    }

    #[test]
    fn test_i64_or_string_deserializer() {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(default, deserialize_with = "i64_or_string")]
            revision: Option<i64>,
        }
        let n: Probe = serde_json::from_str(r#"{"revision": 42}"#).unwrap();
        assert_eq!(n.revision, Some(42));
        let s: Probe = serde_json::from_str(r#"{"revision": "42"}"#).unwrap();
        assert_eq!(s.revision, Some(42));
        let missing: Probe = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(missing.revision, None);
    }

    #[test]
    fn test_txn_request_shape() {
        let req = TxnRequest {
            compare: Vec::new(),
            success: vec![RequestOp::put("/a", "1"), RequestOp::delete("/b")],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("compare").is_none());
        assert!(json["success"][0]["request_put"].is_object());
        assert!(json["success"][1]["request_delete_range"].is_object());
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("10.0.0.1:2379"), "http://10.0.0.1:2379");
        assert_eq!(
            normalize_endpoint("https://etcd:2379/"),
            "https://etcd:2379"
        );
    }
}
