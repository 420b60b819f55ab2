use crate::resilience::retry::{TimeoutError, with_timeout};
use async_trait::async_trait;
use std::{io, path::PathBuf, process::Output, time::Duration};
use tokio::process::Command;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum CertToolError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("openssl {operation} failed: {message}")]
    Tool { operation: &'static str, message: String },

    #[error("openssl call timed out: {0}")]
    Timeout(#[from] TimeoutError),
}

#[derive(Clone, Debug)]
pub struct SelfSignedCaRequest {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    pub subject: String,
    pub days: u32,
}

#[derive(Clone, Debug)]
pub struct CsrRequest {
    pub key_path: PathBuf,
    pub csr_path: PathBuf,
    pub subject: String,
}

#[derive(Clone, Debug)]
pub struct SignRequest {
    pub csr_path: PathBuf,
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    pub serial_path: PathBuf,
    pub cert_path: PathBuf,
    pub ext_file_path: PathBuf,
    pub days: u32,
}

/// The certificate-authority toolchain. All operations shell out to the
/// `openssl` binary with a per-call deadline.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertTool: Send + Sync {
    /// Generate an RSA private key at `path`.
    async fn generate_key(&self, path: PathBuf, bits: u32) -> Result<(), CertToolError>;

    /// Create a self-signed CA certificate from an existing key.
    async fn self_signed_ca(&self, request: SelfSignedCaRequest) -> Result<(), CertToolError>;

    /// Create a certificate signing request.
    async fn create_csr(&self, request: CsrRequest) -> Result<(), CertToolError>;

    /// Sign a CSR against the CA, applying the extensions file (SANs).
    async fn sign(&self, request: SignRequest) -> Result<(), CertToolError>;
}

pub struct OpensslCertTool {
    openssl_bin: PathBuf,
    timeout: Duration,
}

impl OpensslCertTool {
    pub fn new(openssl_bin: impl Into<PathBuf>) -> Self {
        Self { openssl_bin: openssl_bin.into(), timeout: DEFAULT_TIMEOUT }
    }

    async fn run(&self, operation: &'static str, args: Vec<String>) -> Result<(), CertToolError> {
        debug!("Running openssl {operation}");
        let output = with_timeout(
            self.timeout,
            Command::new(&self.openssl_bin).args(&args).kill_on_drop(true).output(),
        )
        .await??;
        check_output(operation, &output)
    }
}

fn check_output(operation: &'static str, output: &Output) -> Result<(), CertToolError> {
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = stderr.lines().rev().find(|line| !line.trim().is_empty()).unwrap_or("no output").to_string();
        Err(CertToolError::Tool { operation, message })
    }
}

fn path_arg(path: &PathBuf) -> String {
    path.display().to_string()
}

fn genrsa_args(path: &PathBuf, bits: u32) -> Vec<String> {
    vec!["genrsa".into(), "-out".into(), path_arg(path), bits.to_string()]
}

fn self_signed_ca_args(request: &SelfSignedCaRequest) -> Vec<String> {
    vec![
        "req".into(),
        "-x509".into(),
        "-new".into(),
        "-nodes".into(),
        "-key".into(),
        path_arg(&request.key_path),
        "-sha256".into(),
        "-days".into(),
        request.days.to_string(),
        "-subj".into(),
        request.subject.clone(),
        "-out".into(),
        path_arg(&request.cert_path),
    ]
}

fn csr_args(request: &CsrRequest) -> Vec<String> {
    vec![
        "req".into(),
        "-new".into(),
        "-key".into(),
        path_arg(&request.key_path),
        "-subj".into(),
        request.subject.clone(),
        "-out".into(),
        path_arg(&request.csr_path),
    ]
}

fn sign_args(request: &SignRequest) -> Vec<String> {
    vec![
        "x509".into(),
        "-req".into(),
        "-in".into(),
        path_arg(&request.csr_path),
        "-CA".into(),
        path_arg(&request.ca_cert_path),
        "-CAkey".into(),
        path_arg(&request.ca_key_path),
        "-CAserial".into(),
        path_arg(&request.serial_path),
        "-CAcreateserial".into(),
        "-out".into(),
        path_arg(&request.cert_path),
        "-days".into(),
        request.days.to_string(),
        "-sha256".into(),
        "-extfile".into(),
        path_arg(&request.ext_file_path),
    ]
}

#[async_trait]
impl CertTool for OpensslCertTool {
    async fn generate_key(&self, path: PathBuf, bits: u32) -> Result<(), CertToolError> {
        self.run("genrsa", genrsa_args(&path, bits)).await
    }

    async fn self_signed_ca(&self, request: SelfSignedCaRequest) -> Result<(), CertToolError> {
        self.run("req -x509", self_signed_ca_args(&request)).await
    }

    async fn create_csr(&self, request: CsrRequest) -> Result<(), CertToolError> {
        self.run("req -new", csr_args(&request)).await
    }

    async fn sign(&self, request: SignRequest) -> Result<(), CertToolError> {
        self.run("x509 -req", sign_args(&request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    #[test]
    fn genrsa_arg_shape() {
        let args = genrsa_args(&PathBuf::from("/certs/ca.key"), 4096);
        assert_eq!(args, ["genrsa", "-out", "/certs/ca.key", "4096"]);
    }

    #[test]
    fn ca_args_carry_subject_and_days() {
        let request = SelfSignedCaRequest {
            key_path: "/certs/ca.key".into(),
            cert_path: "/certs/ca.crt".into(),
            subject: "/CN=FrontDoor CA".into(),
            days: 3650,
        };
        let args = self_signed_ca_args(&request);
        assert!(args.windows(2).any(|w| w == ["-days", "3650"]));
        assert!(args.windows(2).any(|w| w == ["-subj", "/CN=FrontDoor CA"]));
        assert!(args.contains(&"-x509".to_string()));
    }

    #[test]
    fn sign_args_reference_extensions() {
        let request = SignRequest {
            csr_path: "/a/server.csr".into(),
            ca_cert_path: "/certs/ca.crt".into(),
            ca_key_path: "/certs/ca.key".into(),
            serial_path: "/certs/ca.srl".into(),
            cert_path: "/a/server.crt".into(),
            ext_file_path: "/a/server.ext".into(),
            days: 825,
        };
        let args = sign_args(&request);
        assert!(args.windows(2).any(|w| w == ["-extfile", "/a/server.ext"]));
        assert!(args.windows(2).any(|w| w == ["-days", "825"]));
        assert!(args.contains(&"-CAcreateserial".to_string()));
    }

    #[test]
    fn failed_output_surfaces_last_stderr_line() {
        let output = Output {
            status: ExitStatus::from_raw(256),
            stdout: Vec::new(),
            stderr: b"unable to load CA key\nproblems making request\n".to_vec(),
        };
        let err = check_output("x509 -req", &output).expect_err("failure accepted");
        assert!(matches!(err, CertToolError::Tool { ref message, .. } if message == "problems making request"));
    }

    #[test]
    fn successful_output_passes() {
        let output = Output { status: ExitStatus::from_raw(0), stdout: Vec::new(), stderr: Vec::new() };
        check_output("genrsa", &output).expect("success rejected");
    }
}
