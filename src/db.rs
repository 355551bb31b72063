//! Database engine adapter.
//!
//! Read-only queries against the local MySQL-compatible server, issued
//! through the engine's own command-line client over the unix socket. The
//! agent never loads a SQL driver; it orchestrates the same external tools
//! the backup pipeline itself is built from.

use crate::utils::errors::{AgentError, Result};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error};

/// Privileges the backup user must hold for dump and restore to work.
pub const REQUIRED_PRIVILEGES: [&str; 5] = [
    "RELOAD",
    "SUPER",
    "LOCK TABLES",
    "REPLICATION CLIENT",
    "CREATE TABLESPACE",
];

/// Replica coordinates reported to the dispatcher.
#[derive(Debug, Default, Clone)]
pub struct SlaveStatus {
    pub master_host: Option<String>,
    pub seconds_behind_master: Option<u64>,
    pub slave_io_running: Option<String>,
    pub slave_sql_running: Option<String>,
}

pub struct MySqlAdapter {
    user: Option<String>,
    password: Option<String>,
}

impl MySqlAdapter {
    pub fn new(user: Option<String>, password: Option<String>) -> Self {
        Self { user, password }
    }

    /// Finds the unix socket of the running server via lsof.
    pub async fn socket_path(&self) -> Option<PathBuf> {
        let output = Command::new("lsof")
            .args(["-U", "-c", "/^mysqld$/", "-a", "-F", "n"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;
        let socket = parse_lsof_socket(&String::from_utf8_lossy(&output.stdout))?;
        let path = PathBuf::from(socket);
        if path.exists() {
            Some(path)
        } else {
            None
        }
    }

    /// Runs one statement through the mysql client and returns raw
    /// tab-separated output.
    async fn query(&self, sql: &str) -> Result<String> {
        let mut cmd = Command::new("mysql");
        cmd.args(["--batch", "--skip-column-names"]);
        if let Some(user) = &self.user {
            cmd.arg(format!("--user={}", user));
        }
        if let Some(password) = &self.password {
            cmd.arg(format!("--password={}", password));
        }
        if let Some(socket) = self.socket_path().await {
            cmd.arg("--socket").arg(socket);
        }
        cmd.arg("-e").arg(sql);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(AgentError::Precondition(format!(
                "mysql client exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Checks that the server accepts connections with the configured
    /// credentials.
    pub async fn ping(&self) -> bool {
        match self.query("SELECT 1").await {
            Ok(_) => true,
            Err(err) => {
                error!("Cannot connect to the local database server: {}", err);
                false
            }
        }
    }

    /// Data directory of the running server, used to build the extra
    /// defaults file for the dump tool.
    pub async fn datadir(&self) -> Option<String> {
        match self.query("SELECT @@datadir").await {
            Ok(out) => {
                let dir = out.trim();
                if dir.is_empty() {
                    None
                } else {
                    Some(dir.to_string())
                }
            }
            Err(err) => {
                debug!("Failed to read @@datadir: {}", err);
                None
            }
        }
    }

    /// Reads SHOW SLAVE STATUS. A server that is not a replica yields an
    /// empty status.
    pub async fn slave_status(&self) -> Option<SlaveStatus> {
        match self.query("SHOW SLAVE STATUS\\G").await {
            Ok(out) => Some(parse_slave_status(&out)),
            Err(err) => {
                error!("Failed to read slave status: {}", err);
                None
            }
        }
    }

    /// Verifies the backup user holds every privilege in
    /// [`REQUIRED_PRIVILEGES`]. Returns the flag and the missing set.
    pub async fn has_required_privileges(&self) -> Result<(bool, Vec<String>)> {
        let sql = "SELECT PRIVILEGE_TYPE FROM information_schema.USER_PRIVILEGES \
                   WHERE GRANTEE = CONCAT(\"'\", SUBSTRING_INDEX(CURRENT_USER(), '@', 1), \
                   \"'@'\", SUBSTRING_INDEX(CURRENT_USER(), '@', -1), \"'\")";
        let output = self.query(sql).await?;
        let held: Vec<&str> = output.lines().map(str::trim).collect();

        let missing: Vec<String> = REQUIRED_PRIVILEGES
            .iter()
            .filter(|p| !held.contains(*p))
            .map(|p| p.to_string())
            .collect();
        Ok((missing.is_empty(), missing))
    }
}

/// Extracts the socket path from `lsof -F n` output, which looks like:
/// ```text
/// p11029
/// n/var/lib/mysql/mysql.sock
/// ```
fn parse_lsof_socket(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.starts_with("n/"))
        .map(|line| line[1..].to_string())
}

/// Parses the vertical (`\G`) form of SHOW SLAVE STATUS.
fn parse_slave_status(output: &str) -> SlaveStatus {
    let mut status = SlaveStatus::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if value.is_empty() || value == "NULL" {
            continue;
        }
        match key {
            "Master_Host" => status.master_host = Some(value.to_string()),
            "Seconds_Behind_Master" => status.seconds_behind_master = value.parse().ok(),
            "Slave_IO_Running" => status.slave_io_running = Some(value.to_string()),
            "Slave_SQL_Running" => status.slave_sql_running = Some(value.to_string()),
            _ => {}
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsof_socket() {
        let out = "p11029\nn/var/lib/mysql/mysql.sock\n";
        assert_eq!(
            parse_lsof_socket(out).as_deref(),
            Some("/var/lib/mysql/mysql.sock")
        );
        assert!(parse_lsof_socket("p11029\n").is_none());
        assert!(parse_lsof_socket("").is_none());
    }

    #[test]
    fn test_parse_slave_status() {
        let out = "*************************** 1. row ***************************\n\
                   Slave_IO_State: Waiting for master to send event\n\
                   Master_Host: 10.0.0.2\n\
                   Slave_IO_Running: Yes\n\
                   Slave_SQL_Running: Yes\n\
                   Seconds_Behind_Master: 42\n";
        let status = parse_slave_status(out);
        assert_eq!(status.master_host.as_deref(), Some("10.0.0.2"));
        assert_eq!(status.seconds_behind_master, Some(42));
        assert_eq!(status.slave_io_running.as_deref(), Some("Yes"));
    }

    #[test]
    fn test_parse_slave_status_not_a_replica() {
        let status = parse_slave_status("");
        assert!(status.master_host.is_none());
        assert!(status.seconds_behind_master.is_none());
    }
}
