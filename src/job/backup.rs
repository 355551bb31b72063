//! Backup pipeline: dump, encrypt, ship.
//!
//! Streams the database through
//! `innobackupex --stream=xbstream | gpg --encrypt | ssh 'cat - > <name>'`
//! while holding the host-wide backup lock. After all three stages exit
//! zero, the checkpoint LSN is scraped from the dump diagnostics, the
//! artifact size is verified on the storage side, and the copy is recorded
//! with the dispatcher. Failing any of those fails the job.

use crate::config::Config;
use crate::db::MySqlAdapter;
use crate::job::{param_str, param_u64, JobContext, JobOrder};
use crate::lock::ExclusiveLock;
use crate::pipeline::{self, first_failure, Stage};
use crate::rpc::{BackupRecord, ServerConfig};
use crate::utils::errors::{AgentError, Result};
use crate::utils::h_size;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupType {
    Full,
    Incremental,
}

/// Typed view of a validated backup job order.
#[derive(Debug)]
pub struct BackupParams {
    pub ancestor: u64,
    pub backup_type: BackupType,
    pub ip: String,
    pub lsn: Option<String>,
    pub volume_id: u64,
}

impl BackupParams {
    pub fn from_order(order: &JobOrder) -> Result<Self> {
        let backup_type = match param_str(&order.params, "backup_type")? {
            "full" => BackupType::Full,
            "incremental" => BackupType::Incremental,
            other => {
                return Err(AgentError::Validation(format!(
                    "unknown backup_type '{}'",
                    other
                )))
            }
        };
        let lsn = match backup_type {
            BackupType::Incremental => Some(param_str(&order.params, "lsn")?.to_string()),
            BackupType::Full => None,
        };
        Ok(Self {
            ancestor: param_u64(&order.params, "ancestor")?,
            backup_type,
            ip: param_str(&order.params, "ip")?.to_string(),
            lsn,
            volume_id: param_u64(&order.params, "volume_id")?,
        })
    }
}

/// How to behave when another backup pipeline holds the host lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Job path: wait for the holder to finish.
    Wait,
    /// Direct invocation outside a dispatcher job: report "lock held"
    /// and spawn nothing. No CLI path runs the pipeline this way; the
    /// dispatcher is the only source of backup orders.
    FailFast,
}

pub async fn execute(ctx: &JobContext<'_>, order: &JobOrder) -> Result<()> {
    run(ctx, order, LockMode::Wait).await
}

pub async fn run(ctx: &JobContext<'_>, order: &JobOrder, lock_mode: LockMode) -> Result<()> {
    let params = BackupParams::from_order(order)?;

    // One pipeline per host; held until the artifact is recorded.
    let lock_file = ctx.config.agent.lock_file.clone();
    let _lock = match lock_mode {
        LockMode::Wait => {
            let path = lock_file.clone();
            tokio::task::spawn_blocking(move || ExclusiveLock::acquire(&path))
                .await
                .map_err(|err| AgentError::Job(format!("lock task failed: {}", err)))??
        }
        LockMode::FailFast => ExclusiveLock::try_acquire(&lock_file)?.ok_or_else(|| {
            AgentError::Precondition("backup lock is held by another pipeline".to_string())
        })?,
    };

    // Engine access was verified by the controller before the job
    // started; here the credentials only feed the dump command.
    let server = ctx
        .rpc
        .get_config()
        .await
        .ok_or_else(|| AgentError::Precondition("no backup config from dispatcher".to_string()))?;

    let db = MySqlAdapter::new(
        Some(server.mysql_user.clone()),
        Some(server.mysql_password.clone()),
    );

    let name = artifact_name(&ctx.config.agent.server_id.to_string(), Utc::now());
    info!("Taking backup copy {}", name);

    let socket = db.socket_path().await;
    let extra_defaults = match db.datadir().await {
        Some(datadir) => Some(ExtraDefaults::write(&datadir)?),
        None => None,
    };

    let mut dump = Stage::new("innobackupex", "innobackupex")
        .arg("--stream=xbstream")
        .arg(format!("--user={}", server.mysql_user))
        .arg(format!("--password={}", server.mysql_password));
    if let Some(socket) = &socket {
        dump = dump.arg(format!("--socket={}", socket.display()));
    }
    dump = dump.args([
        "--slave-info",
        "--safe-slave-backup",
        "--safe-slave-backup-timeout=3600",
    ]);
    dump = match &params.lsn {
        Some(lsn) => dump
            .args(["--incremental", "."])
            .arg(format!("--incremental-lsn={}", lsn)),
        None => dump.arg("."),
    };
    if let Some(scratch) = &extra_defaults {
        dump = dump.arg(format!("--defaults-extra-file={}", scratch.path().display()));
    }

    let encrypt = Stage::new("gpg", "gpg")
        .arg("--homedir")
        .arg(&ctx.config.keyring.homedir)
        .args(["--encrypt", "--yes", "--batch", "--no-permission-warning", "--quiet"])
        .arg("--recipient")
        .arg(ctx.config.identity_uid());

    let target = storage_target(&server, &params.ip);
    let transport = Stage::new("ssh", "ssh")
        .args(ssh_args(ctx.config))
        .arg(&target)
        .arg(format!("/bin/cat - > {}", name));

    let results = pipeline::run(vec![dump, encrypt, transport]).await?;
    for result in &results {
        info!("{} stderr: {}", result.name, result.stderr);
    }

    if let Some(failed) = first_failure(&results) {
        for result in results.iter().filter(|r| !r.succeeded()) {
            error!("{} exited with code {}", result.name, result.code);
        }
        return Err(AgentError::Stage {
            stage: failed.name,
            code: failed.code,
            stderr: failed.stderr.clone(),
        });
    }

    let lsn = grep_lsn(&results[0].stderr)
        .ok_or_else(|| AgentError::Job("could not find LSN in the dump output".to_string()))?;

    let size = backup_size(ctx.config, &target, &name).await;
    if size == 0 {
        return Err(AgentError::Job(
            "backup copy size must not be zero".to_string(),
        ));
    }

    info!("Saving information about backup:");
    info!("File name : {}", name);
    info!("Volume id : {}", params.volume_id);
    info!("Size      : {} ({})", size, h_size(size));
    info!("Ancestor  : {}", params.ancestor);
    let record = BackupRecord {
        job_id: order.job_id,
        name: name.clone(),
        volume_id: params.volume_id,
        size,
        lsn: Some(lsn),
        ancestor: params.ancestor,
    };
    if !ctx.rpc.update_backup_data(&record).await {
        return Err(AgentError::Job(
            "failed to save backup copy details".to_string(),
        ));
    }
    Ok(())
}

/// Artifact names are globally unique: host identity plus a microsecond
/// timestamp.
fn artifact_name(server_id: &str, now: DateTime<Utc>) -> String {
    format!(
        "server_id_{}_{}.xbstream.gpg",
        server_id,
        now.format("%Y-%m-%dT%H:%M:%S%.6f")
    )
}

/// Account the artifact is stored under on the storage host.
fn storage_target(server: &ServerConfig, ip: &str) -> String {
    format!("user_id_{}@{}", server.user_id, ip)
}

fn ssh_args(config: &Config) -> Vec<String> {
    vec![
        "-oStrictHostKeyChecking=no".to_string(),
        "-i".to_string(),
        config.transport.ssh_private_key.display().to_string(),
        "-p".to_string(),
        config.transport.ssh_port.to_string(),
    ]
}

/// Finds the checkpoint LSN in the dump diagnostics. The marker appears
/// once per run; the last occurrence wins if the tool repeats it.
fn grep_lsn(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| {
            line.starts_with("xtrabackup: The latest check point (for incremental):")
        })
        .filter_map(|line| line.split('\'').nth(1))
        .last()
        .map(str::to_string)
}

/// Extra defaults file pointing the dump tool at the live datadir.
/// Removed when the guard drops, on every exit path.
struct ExtraDefaults {
    path: PathBuf,
}

impl ExtraDefaults {
    fn write(datadir: &str) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("dbbackup-defaults-{}.cnf", Uuid::new_v4()));
        std::fs::write(&path, format!("[mysqld]\ndatadir=\"{}\"\n", datadir))?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ExtraDefaults {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            error!("Failed to remove scratch file {}: {}", self.path.display(), err);
        }
    }
}

/// Asks the storage host for the artifact's byte size. Zero means the
/// size could not be determined and the copy must not be trusted.
async fn backup_size(config: &Config, target: &str, name: &str) -> u64 {
    debug!("Getting size of {}", name);
    let mut cmd = tokio::process::Command::new("ssh");
    cmd.args(ssh_args(config))
        .arg(target)
        .arg(format!("/bin/du -b {}", name))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = match cmd.output().await {
        Ok(output) => output,
        Err(err) => {
            error!("Failed to run ssh for size check: {}", err);
            return 0;
        }
    };
    if !output.status.success() {
        error!(
            "Size check exited with code {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return 0;
    }
    let size = parse_du_size(&String::from_utf8_lossy(&output.stdout));
    debug!("Size of {} = {} bytes ({})", name, size, h_size(size));
    size
}

/// First whitespace-separated token of `du -b` output.
fn parse_du_size(output: &str) -> u64 {
    output
        .split_whitespace()
        .next()
        .and_then(|token| token.parse().ok())
        .unwrap_or(0)
}
