//! Self-signed certificate generation via the `openssl` CLI.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::command::{CommandRunner, CommandSpec};
use super::{AdapterResult, CertificateAuthority, CertificateRequest};

pub struct OpenSslCa {
    binary_path: String,
    key_bits: u32,
    runner: CommandRunner,
}

impl Default for OpenSslCa {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenSslCa {
    pub fn new() -> Self {
        Self::with_binary_path("openssl")
    }

    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            key_bits: 4096,
            runner: CommandRunner::new(),
        }
    }

    fn command(&self, request: &CertificateRequest) -> CommandSpec {
        CommandSpec::new(&self.binary_path)
            .args(["req", "-x509", "-nodes"])
            .arg("-newkey")
            .arg(format!("rsa:{}", self.key_bits))
            .arg("-keyout")
            .arg(request.key_path.to_string_lossy())
            .arg("-out")
            .arg(request.cert_path.to_string_lossy())
            .arg("-days")
            .arg(request.validity_days.to_string())
            .arg("-subj")
            .arg(&request.subject)
    }
}

#[async_trait]
impl CertificateAuthority for OpenSslCa {
    fn name(&self) -> &str {
        "openssl"
    }

    async fn issue_self_signed(&self, request: &CertificateRequest, cancel: &CancellationToken) -> AdapterResult {
        self.runner.run(&self.command(request), cancel).await
    }
}
