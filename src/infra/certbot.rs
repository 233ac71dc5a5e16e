//! 证书工具（certbot）客户端
//!
//! 签发和续期都经由 `ProcessRunner`。已安装的证书从 `<config-dir>/live/<name>/`
//! 读取并用 `x509-parser` 解析，以确认文件存在且未过期。

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::env::constants::CERTBOT_TIMEOUT;
use crate::domain::vhost::{CertWindow, InstalledCertificate};
use crate::error::ProvisionResult;
use crate::infra::command::{describe, CommandOutput, ProcessRunner};

/// webroot 模式的 certbot
#[derive(Clone)]
pub struct CertificateTool {
    runner: Arc<dyn ProcessRunner>,
    bin: String,
    config_dir: PathBuf,
}

impl CertificateTool {
    pub fn new(runner: Arc<dyn ProcessRunner>, bin: &str, config_dir: &Path) -> Self {
        Self {
            runner,
            bin: bin.to_string(),
            config_dir: config_dir.to_path_buf(),
        }
    }

    /// 覆盖全部主机名的单张多 SAN 证书的签发参数
    pub fn issue_args(&self, hostnames: &[&str], webroot: &Path, contact_email: Option<&str>) -> Vec<String> {
        let cert_name = hostnames.first().copied().unwrap_or_default();
        let mut argv: Vec<String> = vec![
            "certonly".into(),
            "--webroot".into(),
            "-w".into(),
            webroot.display().to_string(),
            "--cert-name".into(),
            cert_name.to_string(),
            "--expand".into(),
            "--non-interactive".into(),
            "--agree-tos".into(),
            "--keep-until-expiring".into(),
            "--config-dir".into(),
            self.config_dir.display().to_string(),
        ];
        match contact_email {
            Some(email) => {
                argv.push("--email".into());
                argv.push(email.to_string());
            }
            None => argv.push("--register-unsafely-without-email".into()),
        }
        for host in hostnames {
            argv.push("-d".into());
            argv.push(host.to_string());
        }
        argv
    }

    /// 为全部 `hostnames` 签发一张证书
    ///
    /// 非零退出以失败的 `CommandOutput` 返回，调用方可以上报工具自身的输出。
    pub async fn issue(
        &self,
        hostnames: &[&str],
        webroot: &Path,
        contact_email: Option<&str>,
    ) -> ProvisionResult<CommandOutput> {
        let argv = self.issue_args(hostnames, webroot, contact_email);
        info!(command = %describe(&self.bin, &argv), "Requesting certificate");
        Ok(self.runner.run(&self.bin, &argv, CERTBOT_TIMEOUT).await?)
    }

    /// 续期所有到期的证书
    pub async fn renew(&self, webroot: &Path) -> ProvisionResult<CommandOutput> {
        let argv: Vec<String> = vec![
            "renew".into(),
            "--webroot".into(),
            "-w".into(),
            webroot.display().to_string(),
            "--non-interactive".into(),
            "--config-dir".into(),
            self.config_dir.display().to_string(),
        ];
        info!(command = %describe(&self.bin, &argv), "Renewing certificates");
        Ok(self.runner.run(&self.bin, &argv, CERTBOT_TIMEOUT).await?)
    }

    /// 名为 `cert_name` 的已安装证书（存在且未过期时）
    pub fn installed(&self, cert_name: &str) -> Option<InstalledCertificate> {
        self.installed_at(cert_name, Utc::now())
    }

    fn installed_at(&self, cert_name: &str, now: DateTime<Utc>) -> Option<InstalledCertificate> {
        let live = self.config_dir.join("live").join(cert_name);
        let fullchain = live.join("fullchain.pem");
        let key = live.join("privkey.pem");

        if !key.is_file() {
            debug!(path = %key.display(), "No private key installed");
            return None;
        }
        let pem = match std::fs::read(&fullchain) {
            Ok(pem) => pem,
            Err(e) => {
                debug!(path = %fullchain.display(), error = %e, "No certificate installed");
                return None;
            }
        };
        let (window, names) = match inspect_pem(&pem) {
            Some(parsed) => parsed,
            None => {
                warn!(path = %fullchain.display(), "Installed certificate could not be parsed");
                return None;
            }
        };
        if !window.is_current(now) {
            warn!(path = %fullchain.display(), not_after = %window.not_after, "Installed certificate is expired");
            return None;
        }
        Some(InstalledCertificate {
            fullchain,
            key,
            window,
            names,
        })
    }
}

/// Validity window and DNS names of the first certificate in a PEM bundle
pub fn inspect_pem(pem: &[u8]) -> Option<(CertWindow, Vec<String>)> {
    let (_, pem) = parse_x509_pem(pem).ok()?;
    inspect_der(&pem.contents)
}

/// Validity window and DNS names of a DER certificate
pub fn inspect_der(der: &[u8]) -> Option<(CertWindow, Vec<String>)> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let validity = cert.validity();
    let window = CertWindow {
        not_before: DateTime::from_timestamp(validity.not_before.timestamp(), 0)?,
        not_after: DateTime::from_timestamp(validity.not_after.timestamp(), 0)?,
    };
    let names = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    Some((window, names))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::command::fake::ScriptedRunner;

    #[test]
    fn test_issue_args_cover_every_host() {
        let tool = CertificateTool::new(
            Arc::new(ScriptedRunner::succeeding()),
            "certbot",
            Path::new("/etc/letsencrypt"),
        );
        let argv = tool.issue_args(
            &["example.com", "n8n.example.com"],
            Path::new("/srv/www"),
            Some("ops@example.com"),
        );
        let line = argv.join(" ");
        assert!(line.starts_with("certonly --webroot -w /srv/www --cert-name example.com"));
        assert!(line.contains("--email ops@example.com"));
        assert!(line.ends_with("-d example.com -d n8n.example.com"));
        assert_eq!(argv.iter().filter(|a| *a == "-d").count(), 2);
    }

    #[test]
    fn test_issue_args_without_email() {
        let tool = CertificateTool::new(
            Arc::new(ScriptedRunner::succeeding()),
            "certbot",
            Path::new("/etc/letsencrypt"),
        );
        let argv = tool.issue_args(&["example.com"], Path::new("/srv/www"), None);
        assert!(argv.contains(&"--register-unsafely-without-email".to_string()));
    }

    #[tokio::test]
    async fn test_issue_reports_failure_output() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            Ok(CommandOutput::failure(1, "Challenge failed for domain example.com"))
        }));
        let tool = CertificateTool::new(runner.clone(), "certbot", Path::new("/etc/letsencrypt"));
        let output = tool
            .issue(&["example.com"], Path::new("/srv/www"), None)
            .await
            .unwrap();
        assert!(!output.succeeded());
        assert!(output.combined().contains("Challenge failed"));
        assert_eq!(runner.matching("certbot certonly").len(), 1);
    }

    #[test]
    fn test_installed_reads_certificate() {
        let dir = tempfile::tempdir().unwrap();
        testing::install_self_signed(dir.path(), "example.com", &["example.com", "n8n.example.com"]);

        let tool = CertificateTool::new(Arc::new(ScriptedRunner::succeeding()), "certbot", dir.path());
        let cert = tool.installed("example.com").unwrap();
        assert!(cert.covers("example.com"));
        assert!(cert.covers("n8n.example.com"));
        assert!(cert.window().not_after > Utc::now());
        assert!(tool.installed("other.com").is_none());
    }

    #[test]
    fn test_installed_rejects_expired() {
        let dir = tempfile::tempdir().unwrap();
        testing::install_self_signed(dir.path(), "example.com", &["example.com"]);
        let tool = CertificateTool::new(Arc::new(ScriptedRunner::succeeding()), "certbot", dir.path());

        let far_future = DateTime::from_timestamp(i64::from(i32::MAX) * 40, 0).unwrap();
        assert!(tool.installed_at("example.com", far_future).is_none());
    }

    #[test]
    fn test_installed_requires_key() {
        let dir = tempfile::tempdir().unwrap();
        testing::install_self_signed(dir.path(), "example.com", &["example.com"]);
        std::fs::remove_file(dir.path().join("live/example.com/privkey.pem")).unwrap();
        let tool = CertificateTool::new(Arc::new(ScriptedRunner::succeeding()), "certbot", dir.path());
        assert!(tool.installed("example.com").is_none());
    }
}
