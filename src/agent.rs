//! Agent daemon: job polling and per-job process management.
//!
//! The daemon polls the dispatcher on a fixed period. Each received job
//! order runs in its own OS process so a crashed or killed pipeline can
//! never take the daemon down; the loop re-invokes the agent binary with
//! the hidden `run-job` subcommand and waits for it before polling again.
//! SIGTERM and SIGINT drain to a graceful stop, forwarding SIGTERM to a
//! running job process.

use crate::config::Config;
use crate::crypto::CryptoProvider;
use crate::db::MySqlAdapter;
use crate::job::{self, JobContext, JobOrder};
use crate::rpc::RpcClient;
use crate::sink::DispatcherSink;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const JOB_TERM_GRACE: Duration = Duration::from_secs(10);

pub struct Agent {
    config: Config,
    config_path: PathBuf,
}

impl Agent {
    pub fn new(config: Config, config_path: PathBuf) -> Self {
        Self {
            config,
            config_path,
        }
    }

    /// Runs the poll loop until SIGTERM or SIGINT.
    pub async fn run(&self) -> anyhow::Result<()> {
        let crypto = CryptoProvider::new(&self.config);
        crypto.ensure_keyring().await?;
        let rpc = RpcClient::new(&self.config, &crypto);

        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            signal_token.cancel();
        });

        info!(
            "Agent is starting, polling every {}s",
            self.config.agent.check_period
        );
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if let Some(order) = rpc.get_job().await {
                info!("Received job order {}", order);
                if let Err(err) = self.run_job_process(&order.to_string(), &shutdown).await {
                    error!("Failed to run job process: {}", err);
                }
            }
            self.report_replication_status(&rpc).await;

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.agent.check_period)) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        info!("Agent stopped");
        Ok(())
    }

    /// Spawns one job order into a fresh agent process and waits for it.
    /// On shutdown the child gets a SIGTERM and a grace period.
    async fn run_job_process(
        &self,
        order_json: &str,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<()> {
        let exe = std::env::current_exe()?;
        let mut child = tokio::process::Command::new(exe)
            .arg("--config")
            .arg(&self.config_path)
            .arg("run-job")
            .arg(order_json)
            .spawn()?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                info!("Job process exited with {}", status);
            }
            _ = shutdown.cancelled() => {
                if let Some(pid) = child.id() {
                    warn!("Terminating job process {}", pid);
                    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        warn!("Failed to signal job process {}: {}", pid, err);
                    }
                }
                let _ = tokio::time::timeout(JOB_TERM_GRACE, child.wait()).await;
            }
        }
        Ok(())
    }

    /// Once per cycle, reports the replica coordinates of the local server
    /// so the dispatcher can pick a safe backup source.
    async fn report_replication_status(&self, rpc: &RpcClient<'_>) {
        let db = MySqlAdapter::new(
            self.config.mysql.user.clone(),
            self.config.mysql.password.clone(),
        );
        if let Some(status) = db.slave_status().await {
            if !rpc.report_sss(&status).await {
                debug!("Failed to report replication status");
            }
        }
    }

    /// Entry point of the job process spawned by [`Agent::run_job_process`].
    /// Never returns an error; any failure resolves to -1 so the parent and
    /// the dispatcher see a finished job.
    pub async fn run_job(&self, order_json: &str) -> i32 {
        let value = match serde_json::from_str(order_json) {
            Ok(value) => value,
            Err(err) => {
                error!("Malformed job order: {}", err);
                return -1;
            }
        };
        let order = match JobOrder::from_value(value) {
            Ok(order) => order,
            Err(err) => {
                error!("Malformed job order: {}", err);
                return -1;
            }
        };

        let crypto = CryptoProvider::new(&self.config);
        if let Err(err) = crypto.ensure_keyring().await {
            error!("Keyring is not usable: {}", err);
            return -1;
        }
        let rpc = RpcClient::new(&self.config, &crypto);
        let (sink, _forwarder) = DispatcherSink::spawn(self.config.clone());

        let ctx = JobContext {
            config: &self.config,
            rpc: &rpc,
            sink: &sink,
        };
        job::process(&ctx, order).await
    }

    /// One-shot CLI path: asks the dispatcher to schedule a backup job for
    /// this host. The job itself arrives through the regular poll loop.
    pub async fn schedule_backup(&self) -> anyhow::Result<()> {
        let crypto = CryptoProvider::new(&self.config);
        crypto.ensure_keyring().await?;
        let rpc = RpcClient::new(&self.config, &crypto);
        if !rpc.schedule_backup().await {
            anyhow::bail!("the dispatcher did not accept the backup request");
        }
        info!("Backup job scheduled");
        Ok(())
    }
}

/// Waits for SIGTERM or SIGINT.
async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
