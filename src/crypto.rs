//! Crypto provider backed by a local GPG keyring.
//!
//! The agent holds exactly one trusted dispatcher public key and its own
//! keypair, both under a private GPG home directory. Outgoing messages are
//! signed with the agent key and encrypted for the dispatcher; incoming
//! messages are decrypted with the agent key.

use crate::config::Config;
use crate::utils::errors::{AgentError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info};

pub struct CryptoProvider<'a> {
    config: &'a Config,
}

/// Output of a finished gpg invocation.
struct GpgOutput {
    code: i32,
    stdout: Vec<u8>,
    stderr: String,
}

impl<'a> CryptoProvider<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    fn gpg(&self) -> Command {
        let mut cmd = Command::new("gpg");
        cmd.arg("--homedir").arg(&self.config.keyring.homedir);
        cmd
    }

    async fn run_gpg(&self, mut cmd: Command, stdin: Option<&[u8]>) -> Result<GpgOutput> {
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let Some(input) = stdin {
            // Dropping the handle closes the pipe so gpg sees EOF.
            let mut handle = child
                .stdin
                .take()
                .ok_or_else(|| AgentError::Crypto("gpg stdin unavailable".to_string()))?;
            handle.write_all(input).await?;
        }

        let output = child.wait_with_output().await?;
        Ok(GpgOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Checks whether a key with the given uid is present in the keyring.
    async fn key_installed(&self, uid: &str, secret: bool) -> bool {
        let mut cmd = self.gpg();
        cmd.arg(if secret { "-K" } else { "-k" }).arg(uid);
        match self.run_gpg(cmd, None).await {
            Ok(out) => out.code == 0,
            Err(_) => false,
        }
    }

    /// Prepares the keyring for use: creates the home directory, imports the
    /// dispatcher public key, and generates the agent keypair if missing.
    pub async fn ensure_keyring(&self) -> Result<()> {
        let homedir = &self.config.keyring.homedir;
        if !homedir.exists() {
            info!("Initializing keyring directory {}", homedir.display());
            std::fs::create_dir_all(homedir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(homedir, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        if !self
            .key_installed(&self.config.dispatcher.key_uid, false)
            .await
        {
            self.import_dispatcher_key().await?;
        } else {
            debug!("Dispatcher public key is already installed");
        }

        let identity = self.config.identity_uid();
        if !(self.key_installed(&identity, false).await
            && self.key_installed(&identity, true).await)
        {
            self.generate_keypair(&identity).await?;
        }
        debug!("Keyring is ready");
        Ok(())
    }

    async fn import_dispatcher_key(&self) -> Result<()> {
        let key_path = &self.config.dispatcher.public_key_path;
        info!("Importing dispatcher public key from {}", key_path.display());
        let key_material = std::fs::read(key_path)?;

        let mut cmd = self.gpg();
        cmd.arg("--import");
        let out = self.run_gpg(cmd, Some(&key_material)).await?;
        if out.code != 0 {
            return Err(AgentError::Crypto(format!(
                "Failed to import dispatcher key: {}",
                out.stderr
            )));
        }
        info!("Dispatcher public key successfully installed");
        Ok(())
    }

    /// Generates the agent's 2048-bit RSA keypair. This is a one-time
    /// operation and can take a long time on entropy-starved hosts.
    async fn generate_keypair(&self, identity: &str) -> Result<()> {
        info!("Generating GPG keypair for {}", identity);
        info!("This is a one-time operation and may take a long time");

        let script = format!(
            "Key-Type: RSA\n\
             Key-Length: 2048\n\
             Subkey-Type: RSA\n\
             Subkey-Length: 2048\n\
             Name-Real: Backup agent {server_id}\n\
             Name-Comment: No passphrase\n\
             Name-Email: {identity}\n\
             Expire-Date: 0\n\
             %no-protection\n\
             %commit\n",
            server_id = self.config.agent.server_id,
        );

        let mut cmd = self.gpg();
        cmd.arg("--batch").arg("--gen-key");
        let out = self.run_gpg(cmd, Some(script.as_bytes())).await?;
        if out.code != 0 {
            return Err(AgentError::Crypto(format!(
                "Failed to generate keypair: {}",
                out.stderr
            )));
        }
        info!("Agent keypair generated");
        Ok(())
    }

    /// Signs `plaintext` with the agent key, encrypts it for the dispatcher
    /// and returns the base64 of the armored ciphertext. The dispatcher key
    /// is trusted unconditionally; the agent ships with exactly one.
    pub async fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut cmd = self.gpg();
        cmd.args(["--batch", "--yes", "--trust-model", "always", "--armor"])
            .arg("--local-user")
            .arg(self.config.identity_uid())
            .arg("--recipient")
            .arg(&self.config.dispatcher.key_uid)
            .args(["--sign", "--encrypt"]);

        let out = self.run_gpg(cmd, Some(plaintext.as_bytes())).await?;
        if out.code != 0 {
            error!("gpg encrypt failed: {}", out.stderr);
            return Err(AgentError::Crypto(format!(
                "gpg exited with code {}",
                out.code
            )));
        }
        Ok(BASE64.encode(out.stdout))
    }

    /// Decrypts a base64-encoded ciphertext with the agent key. Returns None
    /// on any failure: empty input, bad encoding, untrusted signer, gpg
    /// error. Never surfaces an error to the caller.
    pub async fn decrypt(&self, ciphertext: &str) -> Option<String> {
        if ciphertext.is_empty() {
            error!("Will not decrypt an empty message");
            return None;
        }
        let raw = match BASE64.decode(ciphertext) {
            Ok(raw) => raw,
            Err(err) => {
                error!("Ciphertext is not valid base64: {}", err);
                return None;
            }
        };

        let mut cmd = self.gpg();
        cmd.args(["-d", "-q", "--batch"]);
        match self.run_gpg(cmd, Some(&raw)).await {
            Ok(out) if out.code == 0 => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
            Ok(out) => {
                error!("gpg decrypt exited with code {}: {}", out.code, out.stderr);
                None
            }
            Err(err) => {
                error!("Failed to run gpg: {}", err);
                None
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        toml::from_str(
            r#"
            [agent]
            server_id = "479a41b3-d22d-41a8-b7d3-4e40302622f6"

            [dispatcher]
            url = "https://dispatcher.example.com/api"
            public_key_path = "/nonexistent/dispatcher.asc"

            [keyring]
            homedir = "/nonexistent/keyring"

            [transport]
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_decrypt_empty_is_none() {
        let config = test_config();
        let crypto = CryptoProvider::new(&config);
        assert!(crypto.decrypt("").await.is_none());
    }

    #[tokio::test]
    async fn test_decrypt_bad_base64_is_none() {
        let config = test_config();
        let crypto = CryptoProvider::new(&config);
        // Rejected before any process is spawned.
        assert!(crypto.decrypt("%%% not base64 %%%").await.is_none());
    }

    #[tokio::test]
    async fn test_decrypt_inverts_encrypt() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            testing::self_keyed_config(dir.path(), "https://dispatcher.example.com/api");
        testing::provision_self_keyring(&config).await;
        let crypto = CryptoProvider::new(&config);

        let plaintext = r#"{"type":"get_job","params":{"note":"zäłöżé"}}"#;
        let ciphertext = crypto.encrypt(plaintext).await.unwrap();
        assert_ne!(ciphertext, plaintext);
        assert_eq!(crypto.decrypt(&ciphertext).await.as_deref(), Some(plaintext));
    }
}
