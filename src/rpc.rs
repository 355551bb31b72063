//! RPC client for the dispatcher.
//!
//! Every request is `{type, params}` serialized to JSON, signed and
//! encrypted by the crypto provider, and POSTed as a single url-encoded
//! form field. Responses arrive as `{success, response}` where `response`
//! is base64 ciphertext of `{data, error, debug}`.
//!
//! Nothing escapes this boundary as an error: transport failures, malformed
//! envelopes and undecryptable payloads all resolve to `None` and a logged
//! diagnostic. There are no retries; retry comes from the caller's poll
//! period.

use crate::config::Config;
use crate::crypto::CryptoProvider;
use crate::db::SlaveStatus;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

/// Outer wire envelope returned by the dispatcher.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default)]
    pub response: Option<String>,
}

/// Decrypted response payload.
#[derive(Debug, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub debug: Option<Value>,
}

/// Per-host backup configuration stored by the dispatcher.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub mysql_user: String,
    pub mysql_password: String,
    /// Storage principal; artifacts live under `user_id_<user_id>@<host>`.
    pub user_id: u64,
}

/// One link of a backup chain as resolved by the dispatcher,
/// ordered oldest to newest.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainLink {
    pub backup_copy_id: u64,
    pub name: String,
    pub ip: String,
    pub full: bool,
}

/// Backup artifact metadata persisted after a successful pipeline run.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub job_id: u64,
    pub name: String,
    pub volume_id: u64,
    pub size: u64,
    pub lsn: Option<String>,
    pub ancestor: u64,
}

pub struct RpcClient<'a> {
    config: &'a Config,
    crypto: &'a CryptoProvider<'a>,
    http: reqwest::Client,
}

impl<'a> RpcClient<'a> {
    pub fn new(config: &'a Config, crypto: &'a CryptoProvider<'a>) -> Self {
        Self {
            config,
            crypto,
            http: reqwest::Client::new(),
        }
    }

    /// Sends one request and returns the decrypted `data` field,
    /// or None on any failure.
    pub async fn call(&self, rtype: &str, params: Value) -> Option<Value> {
        let request = json!({ "type": rtype, "params": params });
        let plaintext = request.to_string();
        debug!("Sending '{}' request to {}", rtype, self.config.dispatcher.url);

        let ciphertext = match self.crypto.encrypt(&plaintext).await {
            Ok(ct) => ct,
            Err(err) => {
                error!("Failed to encrypt '{}' request: {}", rtype, err);
                return None;
            }
        };

        let response = match self
            .http
            .post(&self.config.dispatcher.url)
            .form(&[("data", ciphertext)])
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                error!("Dispatcher is unreachable: {}", err);
                return None;
            }
        };

        if !response.status().is_success() {
            error!("Dispatcher replied with HTTP {}", response.status());
            return None;
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                error!("Failed to read dispatcher response: {}", err);
                return None;
            }
        };
        if body.is_empty() {
            error!("Empty response from dispatcher");
            return None;
        }

        let envelope: Envelope = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!("Malformed envelope from dispatcher: {}", err);
                return None;
            }
        };

        let payload = match envelope.response {
            Some(ciphertext) => {
                let plaintext = self.crypto.decrypt(&ciphertext).await?;
                match serde_json::from_str::<Payload>(&plaintext) {
                    Ok(payload) => Some(payload),
                    Err(err) => {
                        error!("Malformed payload from dispatcher: {}", err);
                        return None;
                    }
                }
            }
            None => None,
        };

        if !envelope.success {
            if let Some(payload) = &payload {
                error!(
                    "Dispatcher rejected '{}': {}",
                    rtype,
                    payload.error.as_deref().unwrap_or("unknown error")
                );
                if let Some(dbg) = &payload.debug {
                    debug!("Dispatcher debug: {}", dbg);
                }
            } else {
                error!("Dispatcher rejected '{}' with no details", rtype);
            }
            return None;
        }

        let Some(payload) = payload else {
            error!("There is no response in the dispatcher reply");
            return None;
        };
        if let Some(err) = &payload.error {
            error!("Dispatcher reported: {}", err);
        }
        Some(payload.data)
    }

    /// Fetches the per-host backup config.
    pub async fn get_config(&self) -> Option<ServerConfig> {
        let data = self
            .call("get_config", json!({ "server_id": self.config.agent.server_id }))
            .await?;
        match serde_json::from_value(data) {
            Ok(cfg) => Some(cfg),
            Err(err) => {
                error!("Malformed server config from dispatcher: {}", err);
                None
            }
        }
    }

    /// Polls for the next job order. None means "no job available".
    pub async fn get_job(&self) -> Option<Value> {
        let data = self.call("get_job", json!({})).await?;
        if data.is_null() {
            return None;
        }
        Some(data)
    }

    /// Notifies the dispatcher that a job started in process `pid`.
    pub async fn notify_start(&self, job_id: u64, pid: u32) -> bool {
        self.call(
            "notify",
            json!({ "event": "start_job", "job_id": job_id, "pid": pid }),
        )
        .await
        .is_some()
    }

    /// Notifies the dispatcher that a job finished with `ret_code`.
    pub async fn notify_stop(&self, job_id: u64, ret_code: i32) -> bool {
        self.call(
            "notify",
            json!({ "event": "stop_job", "job_id": job_id, "ret_code": ret_code }),
        )
        .await
        .is_some()
    }

    /// Persists backup artifact metadata.
    pub async fn update_backup_data(&self, record: &BackupRecord) -> bool {
        self.call(
            "update_backup_data",
            json!({
                "job_id": record.job_id,
                "name": record.name,
                "volume_id": record.volume_id,
                "size": record.size,
                "lsn": record.lsn,
                "ancestor": record.ancestor,
            }),
        )
        .await
        .is_some()
    }

    /// Resolves the ordered backup chain ending at `backup_copy_id`.
    pub async fn get_backups_chain(&self, backup_copy_id: u64) -> Option<Vec<ChainLink>> {
        let data = self
            .call("get_backups_chain", json!({ "backup_copy_id": backup_copy_id }))
            .await?;
        match serde_json::from_value(data) {
            Ok(chain) => Some(chain),
            Err(err) => {
                error!("Malformed backups chain from dispatcher: {}", err);
                None
            }
        }
    }

    /// Uploads the agent's encrypted private key for a send_key job.
    pub async fn send_key(&self, job_id: u64, enc_private_key: &str) -> bool {
        self.call(
            "send_key",
            json!({ "job_id": job_id, "enc_private_key": enc_private_key }),
        )
        .await
        .is_some()
    }

    /// Reports replication coordinates of the local server.
    pub async fn report_sss(&self, status: &SlaveStatus) -> bool {
        self.call(
            "report_sss",
            json!({
                "master_host": status.master_host,
                "seconds_behind_master": status.seconds_behind_master,
                "slave_io_running": status.slave_io_running,
                "slave_sql_running": status.slave_sql_running,
            }),
        )
        .await
        .is_some()
    }

    /// Asks the dispatcher to schedule a backup job for this host.
    pub async fn schedule_backup(&self) -> bool {
        self.call("schedule_backup", json!({})).await.is_some()
    }

    /// Forwards one log entry to the dispatcher.
    pub async fn log(&self, job_id: Option<u64>, msg: &str) -> bool {
        let params = match job_id {
            Some(job_id) => json!({ "job_id": job_id, "msg": msg }),
            None => json!({ "msg": msg }),
        };
        self.call("log", params).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testing::{provision_self_keyring, self_keyed_config};
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serves exactly one HTTP request with the given body and returns the
    /// endpoint URL.
    async fn serve_once(body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if let Some(pos) = request
                    .windows(4)
                    .position(|window| window == b"\r\n\r\n")
                {
                    let headers = String::from_utf8_lossy(&request[..pos]).to_lowercase();
                    let body_len: usize = headers
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|value| value.trim().parse().ok())
                        .unwrap_or(0);
                    if request.len() >= pos + 4 + body_len {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_call_with_empty_response_body_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let url = serve_once("").await;
        let config = self_keyed_config(dir.path(), &url);
        provision_self_keyring(&config).await;

        let crypto = CryptoProvider::new(&config);
        let rpc = RpcClient::new(&config, &crypto);
        assert!(rpc.call("get_job", json!({})).await.is_none());
    }

    #[tokio::test]
    async fn test_call_success_without_response_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let url = serve_once(r#"{"success": true}"#).await;
        let config = self_keyed_config(dir.path(), &url);
        provision_self_keyring(&config).await;

        let crypto = CryptoProvider::new(&config);
        let rpc = RpcClient::new(&config, &crypto);
        assert!(rpc.call("get_job", json!({})).await.is_none());
    }

    #[test]
    fn test_envelope_success_with_response() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"success": true, "response": "Y2lwaGVydGV4dA=="}"#).unwrap();
        assert!(envelope.success);
        assert_eq!(envelope.response.as_deref(), Some("Y2lwaGVydGV4dA=="));
    }

    #[test]
    fn test_envelope_null_response() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"success": false, "response": null}"#).unwrap();
        assert!(!envelope.success);
        assert!(envelope.response.is_none());
    }

    #[test]
    fn test_envelope_missing_response_key() {
        let envelope: Envelope = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(envelope.response.is_none());
    }

    #[test]
    fn test_envelope_garbage_is_error() {
        assert!(serde_json::from_str::<Envelope>("not json at all").is_err());
        assert!(serde_json::from_str::<Envelope>("").is_err());
    }

    #[test]
    fn test_payload_fields_default() {
        let payload: Payload = serde_json::from_str(r#"{}"#).unwrap();
        assert!(payload.data.is_null());
        assert!(payload.error.is_none());
        assert!(payload.debug.is_none());

        let payload: Payload =
            serde_json::from_str(r#"{"data": {"x": 1}, "error": "boom", "debug": "trace"}"#)
                .unwrap();
        assert_eq!(payload.data["x"], 1);
        assert_eq!(payload.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_chain_link_decode() {
        let chain: Vec<ChainLink> = serde_json::from_str(
            r#"[
                {"backup_copy_id": 40, "name": "a.xbstream.gpg", "ip": "10.0.0.5", "full": true},
                {"backup_copy_id": 41, "name": "b.xbstream.gpg", "ip": "10.0.0.5", "full": false}
            ]"#,
        )
        .unwrap();
        assert_eq!(chain.len(), 2);
        assert!(chain[0].full);
        assert_eq!(chain[1].backup_copy_id, 41);
    }
}
