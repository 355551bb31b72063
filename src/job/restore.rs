//! Restore pipeline.
//!
//! Resolves the backup chain for the requested copy, extracts each link
//! through `ssh cat | gpg --decrypt | xbstream -x`, and replays logs with
//! `innobackupex --apply-log`. Every link except the requested copy is
//! applied with `--redo-only` so the chain stays open for the next delta;
//! the requested copy gets the final full apply.

use crate::job::{param_str, param_u64, JobContext, JobOrder};
use crate::pipeline::{self, first_failure, Stage};
use crate::rpc::{ChainLink, ServerConfig};
use crate::utils::errors::{AgentError, Result};
use crate::utils::is_dir_empty;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use uuid::Uuid;

/// Typed view of a validated restore job order.
#[derive(Debug)]
pub struct RestoreParams {
    pub backup_copy_id: u64,
    pub restore_dir: PathBuf,
    pub server_id: String,
}

impl RestoreParams {
    pub fn from_order(order: &JobOrder) -> Result<Self> {
        Ok(Self {
            backup_copy_id: param_u64(&order.params, "backup_copy_id")?,
            restore_dir: PathBuf::from(param_str(&order.params, "restore_dir")?),
            server_id: param_str(&order.params, "server_id")?.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Final apply: roll forward and back, the copy becomes usable.
    Full,
    /// Intermediate apply: redo log only, keeps the chain open.
    RedoOnly,
}

/// Every link gets `RedoOnly` except the requested copy itself.
pub fn apply_mode(link_id: u64, requested_id: u64) -> ApplyMode {
    if link_id == requested_id {
        ApplyMode::Full
    } else {
        ApplyMode::RedoOnly
    }
}

/// Checks the target can receive a restore: missing or empty. Never
/// touches an unusable target.
pub fn validate_target(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    if !dir.is_dir() {
        return Err(AgentError::Precondition(format!(
            "{} exists and is not a directory",
            dir.display()
        )));
    }
    if !is_dir_empty(dir)? {
        return Err(AgentError::Precondition(format!(
            "directory {} exists and is not empty",
            dir.display()
        )));
    }
    Ok(())
}

fn prepare_target(dir: &Path) -> Result<()> {
    validate_target(dir)?;
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// The chain must open with a full copy; everything after it must be
/// incremental.
pub fn validate_chain(chain: &[ChainLink]) -> Result<()> {
    let Some(first) = chain.first() else {
        return Err(AgentError::Job("backups chain is empty".to_string()));
    };
    if !first.full {
        return Err(AgentError::Job(
            "backups chain does not start with a full copy".to_string(),
        ));
    }
    if chain.iter().skip(1).any(|link| link.full) {
        return Err(AgentError::Job(
            "backups chain has a full copy after the first link".to_string(),
        ));
    }
    Ok(())
}

pub async fn execute(ctx: &JobContext<'_>, order: &JobOrder) -> Result<()> {
    let params = RestoreParams::from_order(order)?;
    prepare_target(&params.restore_dir)?;

    let server = ctx
        .rpc
        .get_config()
        .await
        .ok_or_else(|| AgentError::Precondition("no backup config from dispatcher".to_string()))?;

    let chain = ctx
        .rpc
        .get_backups_chain(params.backup_copy_id)
        .await
        .ok_or_else(|| {
            AgentError::Job("failed to get backups chain from dispatcher".to_string())
        })?;
    validate_chain(&chain)?;

    for link in &chain {
        let mode = apply_mode(link.backup_copy_id, params.backup_copy_id);
        if link.full {
            extract_archive(ctx, &server, link, &params.restore_dir).await?;
            apply_log(mode, None, &params.restore_dir).await?;
        } else {
            // Fresh scratch dir per delta; removed on success, left in
            // place on failure for inspection.
            let inc_dir =
                std::env::temp_dir().join(format!("dbbackup-restore-{}", Uuid::new_v4()));
            std::fs::create_dir_all(&inc_dir)?;
            extract_archive(ctx, &server, link, &inc_dir).await?;
            apply_log(mode, Some(&inc_dir), &params.restore_dir).await?;
            std::fs::remove_dir_all(&inc_dir)?;
        }
        info!(
            "Successfully restored backup {} in {}",
            link.name,
            params.restore_dir.display()
        );
    }
    Ok(())
}

/// Fetches one archive from storage and unpacks it into `dst`.
async fn extract_archive(
    ctx: &JobContext<'_>,
    server: &ServerConfig,
    link: &ChainLink,
    dst: &Path,
) -> Result<()> {
    info!("Extracting {} in {}", link.name, dst.display());

    let fetch = Stage::new("ssh", "ssh")
        .args([
            "-oStrictHostKeyChecking=no".to_string(),
            "-i".to_string(),
            ctx.config.transport.ssh_private_key.display().to_string(),
            "-p".to_string(),
            ctx.config.transport.ssh_port.to_string(),
        ])
        .arg(format!("user_id_{}@{}", server.user_id, link.ip))
        .arg(format!("/bin/cat {}", link.name));
    let decrypt = Stage::new("gpg", "gpg")
        .arg("--homedir")
        .arg(&ctx.config.keyring.homedir)
        .args(["--decrypt", "--batch", "--quiet"]);
    let unpack = Stage::new("xbstream", "xbstream")
        .arg("-x")
        .current_dir(dst);

    let results = pipeline::run(vec![fetch, decrypt, unpack]).await?;
    for result in &results {
        info!("{} stderr: {}", result.name, result.stderr);
    }
    if let Some(failed) = first_failure(&results) {
        error!("Failed to extract backup {} in {}", link.name, dst.display());
        return Err(AgentError::Stage {
            stage: failed.name,
            code: failed.code,
            stderr: failed.stderr.clone(),
        });
    }
    Ok(())
}

/// Replays logs on the assembled target.
async fn apply_log(mode: ApplyMode, incremental_dir: Option<&Path>, target: &Path) -> Result<()> {
    let mut stage = Stage::new("innobackupex", "innobackupex").arg("--apply-log");
    if mode == ApplyMode::RedoOnly {
        stage = stage.arg("--redo-only");
    }
    if let Some(inc_dir) = incremental_dir {
        stage = stage.arg(format!("--incremental-dir={}", inc_dir.display()));
    }
    stage = stage.arg(target);

    let results = pipeline::run(vec![stage]).await?;
    let result = &results[0];
    info!("innobackupex stderr: {}", result.stderr);
    if !result.succeeded() {
        error!("Failed to apply log on {}", target.display());
        return Err(AgentError::Stage {
            stage: result.name,
            code: result.code,
            stderr: result.stderr.clone(),
        });
    }
    Ok(())
}
