//! Key escrow job.
//!
//! The dispatcher forwards a requestor's public key; the agent imports it,
//! exports its own private key, encrypts it for the requestor (signed with
//! the agent key) and uploads the result. This is how a user gains the
//! ability to decrypt this host's backup copies elsewhere.

use crate::job::{param_str, JobContext, JobOrder};
use crate::utils::errors::{AgentError, Result};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

pub async fn execute(ctx: &JobContext<'_>, order: &JobOrder) -> Result<()> {
    let pub_key = param_str(&order.params, "gpg_pub_key")?;
    if pub_key.is_empty() {
        return Err(AgentError::Validation(
            "requestor public key is empty".to_string(),
        ));
    }

    let homedir = &ctx.config.keyring.homedir;

    // Identify the requestor before touching the keyring.
    let packets = run_with_stdin(
        Command::new("gpg")
            .arg("--homedir")
            .arg(homedir)
            .arg("--list-packets")
            .stderr(Stdio::null()),
        pub_key.as_bytes(),
    )
    .await?;
    let keyid = parse_keyid(&String::from_utf8_lossy(&packets)).ok_or_else(|| {
        AgentError::Crypto("no key id found in the requestor public key".to_string())
    })?;
    debug!("Requestor's public key id is {}", keyid);

    let import = run_with_stdin(
        Command::new("gpg")
            .arg("--homedir")
            .arg(homedir)
            .args(["--import", "--batch"])
            .stderr(Stdio::piped()),
        pub_key.as_bytes(),
    )
    .await;
    if let Err(err) = import {
        return Err(AgentError::Crypto(format!(
            "failed to import requestor key {}: {}",
            keyid, err
        )));
    }

    let identity = ctx.config.identity_uid();
    debug!("Exporting private key of {}", identity);
    let mut export = Command::new("gpg")
        .arg("--homedir")
        .arg(homedir)
        .args(["--armor", "--export-secret-key"])
        .arg(&identity)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    let export_out = export
        .stdout
        .take()
        .ok_or_else(|| AgentError::Crypto("gpg export stdout unavailable".to_string()))?;

    let encrypt = Command::new("gpg")
        .arg("--homedir")
        .arg(homedir)
        .args(["--armor", "--encrypt", "--sign", "--batch", "-r"])
        .arg(&keyid)
        .arg("--local-user")
        .arg(&identity)
        .args(["--trust-model", "always"])
        .stdin(TryInto::<Stdio>::try_into(export_out)?)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let export_status = export.wait().await?;
    let encrypted = encrypt.wait_with_output().await?;
    if !export_status.success() {
        return Err(AgentError::Crypto(format!(
            "gpg export exited with code {}",
            export_status.code().unwrap_or(-1)
        )));
    }
    if !encrypted.status.success() {
        return Err(AgentError::Crypto(format!(
            "gpg encrypt exited with code {}: {}",
            encrypted.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&encrypted.stderr).trim()
        )));
    }

    let enc_private_key = String::from_utf8_lossy(&encrypted.stdout).into_owned();
    if !ctx.rpc.send_key(order.job_id, &enc_private_key).await {
        return Err(AgentError::Job(
            "failed to upload the encrypted private key".to_string(),
        ));
    }
    info!("Private key delivered for requestor {}", keyid);
    Ok(())
}

async fn run_with_stdin(cmd: &mut Command, input: &[u8]) -> Result<Vec<u8>> {
    cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
    let mut child = cmd.spawn()?;
    {
        let mut handle = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Crypto("gpg stdin unavailable".to_string()))?;
        handle.write_all(input).await?;
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(AgentError::Crypto(format!(
            "gpg exited with code {}",
            output.status.code().unwrap_or(-1)
        )));
    }
    Ok(output.stdout)
}

/// First key id in `gpg --list-packets` output.
fn parse_keyid(packets: &str) -> Option<String> {
    packets
        .lines()
        .find_map(|line| line.split("keyid:").nth(1))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}
