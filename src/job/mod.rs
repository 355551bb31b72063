//! Job orders and the job lifecycle state machine.
//!
//! A job moves through
//! `Received → Validated → ScheduledWait → NotifiedStart → Executing →
//! NotifiedStop → Done`. Validation and start-notification failures
//! short-circuit before any pipeline process is spawned and report -1.
//! Engine privileges are verified for every job type before the schedule
//! wait. Exactly one stop notification is sent per job, with
//! `ret_code = -1` for any internal failure.

pub mod backup;
pub mod restore;
pub mod send_key;

use crate::config::Config;
use crate::db::MySqlAdapter;
use crate::rpc::RpcClient;
use crate::sink::{LogEntry, Sink};
use crate::utils::errors::{AgentError, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, error, info};

/// Closed set of job types the dispatcher can order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Backup,
    Restore,
    SendKey,
}

impl JobType {
    /// Parameters a job order of this type must carry before anything is
    /// spawned. `lsn` is additionally required for incremental backups.
    pub fn mandatory_params(&self) -> &'static [&'static str] {
        match self {
            JobType::Backup => &["ancestor", "backup_type", "ip", "volume_id"],
            JobType::Restore => &["backup_copy_id", "restore_dir", "server_id"],
            JobType::SendKey => &["gpg_pub_key"],
        }
    }
}

/// One job order from the dispatcher. Immutable once received.
#[derive(Debug, Clone, Deserialize)]
pub struct JobOrder {
    pub job_id: u64,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub params: Map<String, Value>,
    pub start_scheduled: i64,
}

impl JobOrder {
    /// Builds a job order from the raw `data` value of a get_job response.
    /// Some dispatchers deliver `params` as a JSON-encoded string; decode it
    /// before deserializing.
    pub fn from_value(mut value: Value) -> Result<Self> {
        if let Some(Value::String(raw)) = value.get("params") {
            let params: Value = serde_json::from_str(raw)?;
            value["params"] = params;
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Checks that every mandatory parameter for this job type is present.
    pub fn validate(&self) -> Result<()> {
        for key in self.job_type.mandatory_params() {
            if !self.params.contains_key(*key) {
                return Err(AgentError::Validation(format!(
                    "missing '{}' in the job order",
                    key
                )));
            }
        }
        if self.job_type == JobType::Backup {
            match self.params.get("backup_type").and_then(Value::as_str) {
                Some("full") => {}
                Some("incremental") => {
                    if !self.params.contains_key("lsn") {
                        return Err(AgentError::Validation(
                            "incremental backup requires 'lsn'".to_string(),
                        ));
                    }
                }
                other => {
                    return Err(AgentError::Validation(format!(
                        "unknown backup_type {:?}",
                        other
                    )));
                }
            }
        }
        if self.start_scheduled <= 0 {
            return Err(AgentError::Validation(
                "job start time is not set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of the scheduling check; consumed by an ordinary conditional
/// rather than raised as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleCheck {
    Ready,
    Wait(Duration),
}

/// Computes how long to wait before starting. A start time in the past
/// clamps to zero and runs immediately.
pub fn schedule_check(start_scheduled: i64, now: i64) -> ScheduleCheck {
    let delay = start_scheduled - now;
    if delay <= 0 {
        ScheduleCheck::Ready
    } else {
        ScheduleCheck::Wait(Duration::from_secs(delay as u64))
    }
}

/// Reads a numeric job parameter, accepting both JSON numbers and numeric
/// strings as delivered by older dispatchers.
pub fn param_u64(params: &Map<String, Value>, key: &str) -> Result<u64> {
    let value = params
        .get(key)
        .ok_or_else(|| AgentError::Validation(format!("missing '{}' in the job order", key)))?;
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| AgentError::Validation(format!("'{}' is not an unsigned integer", key))),
        Value::String(s) => s
            .parse()
            .map_err(|_| AgentError::Validation(format!("'{}' is not an unsigned integer", key))),
        _ => Err(AgentError::Validation(format!(
            "'{}' is not an unsigned integer",
            key
        ))),
    }
}

/// Reads a string job parameter.
pub fn param_str<'p>(params: &'p Map<String, Value>, key: &str) -> Result<&'p str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::Validation(format!("missing '{}' in the job order", key)))
}

/// Borrowed collaborators every job handler works against, owned by the
/// process entry point.
pub struct JobContext<'a> {
    pub config: &'a Config,
    pub rpc: &'a RpcClient<'a>,
    pub sink: &'a dyn Sink,
}

/// Runs one job order to completion and returns its code: 0 for success,
/// -1 for any failure.
pub async fn process(ctx: &JobContext<'_>, order: JobOrder) -> i32 {
    let job_id = order.job_id;
    info!("Processing job_id = {} ({:?})", job_id, order.job_type);
    ctx.sink
        .emit(LogEntry::for_job(job_id, format!("job received: {:?}", order.job_type)));

    if let Err(err) = order.validate() {
        error!("Job {} rejected: {}", job_id, err);
        ctx.sink
            .emit(LogEntry::for_job(job_id, format!("validation failed: {}", err)));
        ctx.rpc.notify_stop(job_id, -1).await;
        return -1;
    }
    debug!("Job {} validated", job_id);

    let Some(server) = ctx.rpc.get_config().await else {
        error!("No backup config from dispatcher for job {}", job_id);
        ctx.rpc.notify_stop(job_id, -1).await;
        return -1;
    };
    let db = MySqlAdapter::new(Some(server.mysql_user.clone()), Some(server.mysql_password));
    if !db.ping().await {
        error!("Cannot connect to the local database server");
        ctx.rpc.notify_stop(job_id, -1).await;
        return -1;
    }
    match db.has_required_privileges().await {
        Ok((true, _)) => {}
        Ok((false, missing)) => {
            error!(
                "The database user {} does not have all the required privileges",
                server.mysql_user
            );
            error!(
                "Grant them with: GRANT {} ON *.* TO '{}'@'localhost'",
                missing.join(", "),
                server.mysql_user
            );
            ctx.sink
                .emit(LogEntry::for_job(job_id, "insufficient database privileges"));
            ctx.rpc.notify_stop(job_id, -1).await;
            return -1;
        }
        Err(err) => {
            error!("Cannot verify database privileges: {}", err);
            ctx.rpc.notify_stop(job_id, -1).await;
            return -1;
        }
    }

    let now = chrono::Utc::now().timestamp();
    if let ScheduleCheck::Wait(delay) = schedule_check(order.start_scheduled, now) {
        info!("Waiting {}s before job {} starts", delay.as_secs(), job_id);
        tokio::time::sleep(delay).await;
    }

    if !ctx.rpc.notify_start(job_id, std::process::id()).await {
        error!("Failed to notify dispatcher about job {} start", job_id);
        ctx.rpc.notify_stop(job_id, -1).await;
        return -1;
    }

    // Static dispatch over the closed job type set.
    let outcome = match order.job_type {
        JobType::Backup => backup::execute(ctx, &order).await,
        JobType::Restore => restore::execute(ctx, &order).await,
        JobType::SendKey => send_key::execute(ctx, &order).await,
    };

    let ret_code = match outcome {
        Ok(()) => {
            info!("Job {} finished successfully", job_id);
            ctx.sink.emit(LogEntry::for_job(job_id, "job finished"));
            0
        }
        Err(err) => {
            error!("Job {} failed: {}", job_id, err);
            ctx.sink
                .emit(LogEntry::for_job(job_id, format!("job failed: {}", err)));
            -1
        }
    };

    if !ctx.rpc.notify_stop(job_id, ret_code).await {
        error!("Failed to notify dispatcher about job {} stop", job_id);
    }
    ret_code
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order(job_type: &str, params: Value) -> JobOrder {
        JobOrder::from_value(json!({
            "job_id": 7,
            "type": job_type,
            "params": params,
            "start_scheduled": 1_700_000_000,
        }))
        .unwrap()
    }

    #[test]
    fn test_params_delivered_as_string_are_decoded() {
        let order = JobOrder::from_value(json!({
            "job_id": 7,
            "type": "restore",
            "params": "{\"backup_copy_id\": 42, \"restore_dir\": \"/tmp/r\", \"server_id\": \"s\"}",
            "start_scheduled": 1_700_000_000,
        }))
        .unwrap();
        assert_eq!(order.params["backup_copy_id"], 42);
        assert!(order.validate().is_ok());
    }

    #[test]
    fn test_backup_validation_rejects_each_missing_param() {
        let full = json!({
            "ancestor": 0, "backup_type": "full", "ip": "10.0.0.5", "volume_id": 7
        });
        assert!(order("backup", full.clone()).validate().is_ok());

        for key in ["ancestor", "backup_type", "ip", "volume_id"] {
            let mut params = full.clone();
            params.as_object_mut().unwrap().remove(key);
            let err = order("backup", params).validate().unwrap_err();
            assert!(matches!(err, AgentError::Validation(_)), "{}", key);
        }
    }

    #[test]
    fn test_restore_validation_rejects_each_missing_param() {
        let good = json!({
            "backup_copy_id": 42, "restore_dir": "/var/lib/restore", "server_id": "abc"
        });
        assert!(order("restore", good.clone()).validate().is_ok());

        for key in ["backup_copy_id", "restore_dir", "server_id"] {
            let mut params = good.clone();
            params.as_object_mut().unwrap().remove(key);
            assert!(order("restore", params).validate().is_err(), "{}", key);
        }
    }

    #[test]
    fn test_send_key_validation() {
        assert!(order("send_key", json!({ "gpg_pub_key": "----" }))
            .validate()
            .is_ok());
        assert!(order("send_key", json!({})).validate().is_err());
    }

    #[test]
    fn test_lsn_required_only_for_incremental() {
        let incremental = json!({
            "ancestor": 40, "backup_type": "incremental", "ip": "10.0.0.5", "volume_id": 7
        });
        assert!(order("backup", incremental.clone()).validate().is_err());

        let mut with_lsn = incremental;
        with_lsn
            .as_object_mut()
            .unwrap()
            .insert("lsn".to_string(), json!("9173052"));
        assert!(order("backup", with_lsn).validate().is_ok());

        // A full backup needs no LSN.
        let full = json!({
            "ancestor": 0, "backup_type": "full", "ip": "10.0.0.5", "volume_id": 7
        });
        assert!(order("backup", full).validate().is_ok());
    }

    #[test]
    fn test_unknown_backup_type_rejected() {
        let params = json!({
            "ancestor": 0, "backup_type": "differential", "ip": "10.0.0.5", "volume_id": 7
        });
        assert!(order("backup", params).validate().is_err());
    }

    #[test]
    fn test_unset_start_time_rejected() {
        let mut o = order("send_key", json!({ "gpg_pub_key": "----" }));
        o.start_scheduled = 0;
        assert!(o.validate().is_err());
    }

    #[test]
    fn test_schedule_check_clamps_past_start_to_zero() {
        assert_eq!(schedule_check(990, 1000), ScheduleCheck::Ready);
        assert_eq!(schedule_check(1000, 1000), ScheduleCheck::Ready);
        assert_eq!(
            schedule_check(1030, 1000),
            ScheduleCheck::Wait(Duration::from_secs(30))
        );
    }

    #[tokio::test]
    async fn test_job_fails_when_engine_config_is_unavailable() {
        use crate::crypto::CryptoProvider;
        use crate::sink::testing::CollectSink;

        // Unreachable dispatcher and no keyring: the controller must stop
        // at the engine-access gate with -1, before the schedule wait.
        let config: Config = toml::from_str(
            r#"
            [agent]
            server_id = "479a41b3-d22d-41a8-b7d3-4e40302622f6"

            [dispatcher]
            url = "http://127.0.0.1:1/"
            public_key_path = "/nonexistent/dispatcher.asc"

            [keyring]
            homedir = "/nonexistent/keyring"

            [transport]
            "#,
        )
        .unwrap();
        let crypto = CryptoProvider::new(&config);
        let rpc = RpcClient::new(&config, &crypto);
        let sink = CollectSink::default();
        let ctx = JobContext {
            config: &config,
            rpc: &rpc,
            sink: &sink,
        };

        let ret_code = process(&ctx, order("send_key", json!({ "gpg_pub_key": "----" }))).await;
        assert_eq!(ret_code, -1);
    }

    #[test]
    fn test_param_u64_accepts_numbers_and_numeric_strings() {
        let params = order(
            "backup",
            json!({
                "ancestor": 0, "backup_type": "full", "ip": "10.0.0.5",
                "volume_id": "7"
            }),
        )
        .params;
        assert_eq!(param_u64(&params, "volume_id").unwrap(), 7);
        assert_eq!(param_u64(&params, "ancestor").unwrap(), 0);
        assert!(param_u64(&params, "ip").is_err());
        assert!(param_u64(&params, "absent").is_err());
    }
}
