//! 健康检查
//!
//! 检查每个声明的容器、每个主机名的 HTTPS 访问与证书，以及数据库。
//! 各项并发执行且不会让检查本身失败，失败项在报告中为 `false`/`None`。

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::redirect::Policy;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::env::constants::PROBE_TIMEOUT;
use crate::domain::health::{ContainerState, HealthReport};
use crate::domain::service::{find_role, ServiceRole, ServiceSpec};
use crate::domain::vhost::CertWindow;
use crate::domain::DomainSet;
use crate::infra::certbot::inspect_der;
use crate::infra::container::ContainerEngine;

/// 在数据库容器内执行，root 密码取自容器自身的环境变量，
/// 不会出现在宿主机命令行中
const DB_PING_SQL: &str = r#"MYSQL_PWD="$MYSQL_ROOT_PASSWORD" exec mysql -u root -e "SELECT 1""#;

/// 网络检查，测试中可替换
#[async_trait]
pub trait Probes: Send + Sync {
    /// Does `host:port` accept TCP connections?
    async fn tcp_ready(&self, host: &str, port: u16) -> bool;

    /// Status of `HEAD https://<host>/`, redirects not followed
    async fn http_status(&self, host: &str) -> Option<u16>;

    /// Validity window of the certificate served for `host`
    async fn tls_validity(&self, host: &str) -> Option<CertWindow>;
}

/// 真实网络检查
///
/// Hostnames are resolved to `probe_host` when it is an IP address, so the
/// local proxy is checked with the right SNI and Host header without relying
/// on public DNS.
#[derive(Clone, Debug)]
pub struct NetworkProbes {
    probe_host: String,
    https_port: u16,
}

impl NetworkProbes {
    pub fn new(probe_host: &str, https_port: u16) -> Self {
        Self {
            probe_host: probe_host.to_string(),
            https_port,
        }
    }

    fn pinned_addr(&self) -> Option<SocketAddr> {
        self.probe_host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.https_port))
    }

    async fn connect_tls(&self, host: &str) -> Result<Option<CertWindow>, String> {
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string()).map_err(|e| e.to_string())?;

        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| e.to_string())?
        .with_root_certificates(roots)
        .with_no_client_auth();

        let tcp = match self.pinned_addr() {
            Some(addr) => TcpStream::connect(addr).await,
            None => TcpStream::connect((host, self.https_port)).await,
        }
        .map_err(|e| e.to_string())?;

        let tls = TlsConnector::from(Arc::new(config))
            .connect(server_name, tcp)
            .await
            .map_err(|e| e.to_string())?;

        let (_, session) = tls.get_ref();
        Ok(session
            .peer_certificates()
            .and_then(|chain| chain.first())
            .and_then(|leaf| inspect_der(leaf.as_ref()))
            .map(|(window, _)| window))
    }
}

#[async_trait]
impl Probes for NetworkProbes {
    async fn tcp_ready(&self, host: &str, port: u16) -> bool {
        matches!(
            timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }

    async fn http_status(&self, host: &str) -> Option<u16> {
        let mut builder = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(PROBE_TIMEOUT);
        if let Some(addr) = self.pinned_addr() {
            builder = builder.resolve(host, addr);
        }
        let client = match builder.build() {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Failed to build probe client");
                return None;
            }
        };

        let url = format!("https://{}:{}/", host, self.https_port);
        match client.head(&url).send().await {
            Ok(resp) => Some(resp.status().as_u16()),
            Err(e) => {
                debug!(host = %host, error = %e, "HTTP probe failed");
                None
            }
        }
    }

    async fn tls_validity(&self, host: &str) -> Option<CertWindow> {
        match timeout(PROBE_TIMEOUT, self.connect_tls(host)).await {
            Ok(Ok(window)) => window,
            Ok(Err(e)) => {
                debug!(host = %host, error = %e, "TLS probe failed");
                None
            }
            Err(_) => {
                debug!(host = %host, "TLS probe timed out");
                None
            }
        }
    }
}

/// 2xx 和 3xx 视为可达
pub fn is_reachable(status: Option<u16>) -> bool {
    matches!(status, Some(200..=399))
}

/// 实时生成 `HealthReport`
pub struct HealthChecker {
    probes: Arc<dyn Probes>,
    engine: ContainerEngine,
    services: Vec<ServiceSpec>,
}

impl HealthChecker {
    pub fn new(
        probes: Arc<dyn Probes>,
        engine: ContainerEngine,
        services: Vec<ServiceSpec>,
    ) -> Self {
        Self {
            probes,
            engine,
            services,
        }
    }

    /// 执行全部检查，全部完成后才返回报告
    pub async fn check(&self, domains: &DomainSet) -> HealthReport {
        let hosts = domains.hostnames();

        let http = join_all(hosts.iter().map(|host| async move {
            let status = self.probes.http_status(host).await;
            (host.to_string(), is_reachable(status))
        }));
        let certs = join_all(hosts.iter().map(|host| async move {
            (host.to_string(), self.probes.tls_validity(host).await)
        }));
        let containers = self.engine.status(&self.services);
        let db = self.db_reachable();

        let (http, certs, containers, db) = tokio::join!(http, certs, containers, db);

        HealthReport {
            container_statuses: containers,
            http_reachable: http.into_iter().collect(),
            cert_validity: certs.into_iter().collect(),
            db_reachable: db,
        }
    }

    async fn db_reachable(&self) -> bool {
        let Some(db) = find_role(&self.services, ServiceRole::Database) else {
            warn!("No database service declared");
            return false;
        };
        match self.engine.exec(db, &["sh", "-c", DB_PING_SQL]).await {
            Ok(output) if output.succeeded() => true,
            Ok(output) => {
                debug!(output = %output.combined(), "Database probe failed");
                false
            }
            Err(e) => {
                debug!(error = %e, "Database probe failed");
                false
            }
        }
    }
}

/// 每项检查输出一行带通过/失败标记的日志
pub fn log_report(report: &HealthReport) {
    let now = chrono::Utc::now();
    for (name, state) in &report.container_statuses {
        let icon = if *state == ContainerState::Running { "✓" } else { "✗" };
        info!("  {} container {}: {:?}", icon, name, state);
    }
    for (host, ok) in &report.http_reachable {
        info!("  {} https://{}/ reachable: {}", if *ok { "✓" } else { "✗" }, host, ok);
    }
    for (host, window) in &report.cert_validity {
        match window {
            Some(w) if w.is_current(now) => {
                info!("  ✓ certificate {}: valid until {} ({} days)", host, w.not_after, w.days_left(now))
            }
            Some(w) => info!("  ✗ certificate {}: outside validity window (until {})", host, w.not_after),
            None => info!("  ✗ certificate {}: unavailable", host),
        }
    }
    info!("  {} database reachable: {}", if report.db_reachable { "✓" } else { "✗" }, report.db_reachable);
}

/// 测试用，返回预设结果
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use chrono::{Duration, Utc};

    pub struct StaticProbes {
        pub ready: bool,
        pub status: Option<u16>,
        pub cert_days: Option<i64>,
    }

    impl StaticProbes {
        pub fn healthy() -> Self {
            Self {
                ready: true,
                status: Some(200),
                cert_days: Some(89),
            }
        }

        pub fn failing() -> Self {
            Self {
                ready: false,
                status: None,
                cert_days: None,
            }
        }
    }

    #[async_trait]
    impl Probes for StaticProbes {
        async fn tcp_ready(&self, _host: &str, _port: u16) -> bool {
            self.ready
        }

        async fn http_status(&self, _host: &str) -> Option<u16> {
            self.status
        }

        async fn tls_validity(&self, _host: &str) -> Option<CertWindow> {
            self.cert_days.map(|days| {
                let now = Utc::now();
                CertWindow {
                    not_before: now - Duration::days(1),
                    not_after: now + Duration::days(days),
                }
            })
        }
    }
}
