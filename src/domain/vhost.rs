//! 代理虚拟主机模型

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// 虚拟主机渲染模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VHostMode {
    /// Port 80 only, serves the ACME challenge path
    ChallengeOnly,
    /// HTTP -> HTTPS redirect plus the TLS server block
    FullTls,
}

/// TLS 虚拟主机的转发目标
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Upstream {
    /// PHP-FPM over FastCGI (`host:port`), document root inside the proxy
    FastCgi { address: String, document_root: String },
    /// Plain HTTP reverse proxy with websocket upgrade
    Http { address: String },
}

/// 证书有效期
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CertWindow {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertWindow {
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }

    /// 距过期天数（已过期为负）
    pub fn days_left(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }
}

/// 已在磁盘上找到且未过期的证书
///
/// 只有 `CertificateTool::installed` 能构造，持有即说明检查时文件存在且有效。
#[derive(Clone, Debug)]
pub struct InstalledCertificate {
    pub(crate) fullchain: PathBuf,
    pub(crate) key: PathBuf,
    pub(crate) window: CertWindow,
    pub(crate) names: Vec<String>,
}

impl InstalledCertificate {
    pub fn fullchain(&self) -> &Path {
        &self.fullchain
    }

    pub fn key(&self) -> &Path {
        &self.key
    }

    pub fn window(&self) -> CertWindow {
        self.window
    }

    /// 证书的 SAN 是否包含 `host`
    pub fn covers(&self, host: &str) -> bool {
        self.names.iter().any(|n| n.eq_ignore_ascii_case(host))
    }
}

/// TLS server 块引用的证书路径
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CertPaths {
    pub fullchain: String,
    pub key: String,
}

/// 单个代理配置块
#[derive(Clone, Debug, Serialize)]
pub struct VHostConfig {
    pub server_name: String,
    pub mode: VHostMode,
    pub cert_paths: Option<CertPaths>,
    pub upstream: Option<Upstream>,
}

impl VHostConfig {
    /// 无证书主机的 challenge 配置块
    pub fn challenge(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            mode: VHostMode::ChallengeOnly,
            cert_paths: None,
            upstream: None,
        }
    }

    /// 引用已安装证书的 TLS 配置块
    ///
    /// `cert_dir_in_proxy` 是代理容器内证书配置目录的位置，保留原证书目录名和文件名。
    pub fn full_tls(
        server_name: &str,
        cert: &InstalledCertificate,
        cert_dir_in_proxy: &str,
        upstream: Upstream,
    ) -> Self {
        let base = cert_dir_in_proxy.trim_end_matches('/');
        let in_proxy = |path: &Path, default: &str| {
            let lineage = path
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| default.to_string());
            format!("{}/live/{}/{}", base, lineage, file)
        };
        Self {
            server_name: server_name.to_string(),
            mode: VHostMode::FullTls,
            cert_paths: Some(CertPaths {
                fullchain: in_proxy(cert.fullchain(), "fullchain.pem"),
                key: in_proxy(cert.key(), "privkey.pem"),
            }),
            upstream: Some(upstream),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn installed() -> InstalledCertificate {
        let now = Utc::now();
        InstalledCertificate {
            fullchain: PathBuf::from("/etc/letsencrypt/live/example.com/fullchain.pem"),
            key: PathBuf::from("/etc/letsencrypt/live/example.com/privkey.pem"),
            window: CertWindow {
                not_before: now - Duration::days(1),
                not_after: now + Duration::days(89),
            },
            names: vec!["example.com".into(), "n8n.example.com".into()],
        }
    }

    #[test]
    fn test_full_tls_paths() {
        let cert = installed();
        let vhost = VHostConfig::full_tls(
            "n8n.example.com",
            &cert,
            "/etc/letsencrypt/",
            Upstream::Http {
                address: "n8n:5678".into(),
            },
        );
        assert_eq!(vhost.mode, VHostMode::FullTls);
        let paths = vhost.cert_paths.unwrap();
        assert_eq!(paths.fullchain, "/etc/letsencrypt/live/example.com/fullchain.pem");
        assert_eq!(paths.key, "/etc/letsencrypt/live/example.com/privkey.pem");
    }

    #[test]
    fn test_full_tls_keeps_numbered_lineage() {
        let mut cert = installed();
        cert.fullchain = PathBuf::from("/srv/letsencrypt/live/example.com-0001/fullchain.pem");
        cert.key = PathBuf::from("/srv/letsencrypt/live/example.com-0001/privkey.pem");
        let vhost = VHostConfig::full_tls(
            "example.com",
            &cert,
            "/etc/letsencrypt",
            Upstream::Http {
                address: "n8n:5678".into(),
            },
        );
        let paths = vhost.cert_paths.unwrap();
        assert_eq!(paths.fullchain, "/etc/letsencrypt/live/example.com-0001/fullchain.pem");
        assert_eq!(paths.key, "/etc/letsencrypt/live/example.com-0001/privkey.pem");
    }

    #[test]
    fn test_cert_window() {
        let cert = installed();
        let now = Utc::now();
        assert!(cert.window().is_current(now));
        assert!(cert.window().days_left(now) >= 88);
        assert!(cert.covers("N8N.example.com"));
        assert!(!cert.covers("www.example.com"));
    }

    #[test]
    fn test_challenge_has_no_cert() {
        let vhost = VHostConfig::challenge("example.com");
        assert_eq!(vhost.mode, VHostMode::ChallengeOnly);
        assert!(vhost.cert_paths.is_none());
        assert!(vhost.upstream.is_none());
    }
}
