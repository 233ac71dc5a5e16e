//! 服务栈组成
//!
//! 根据配置、凭据和域名集构建受管服务的 `ServiceSpec` 列表

use crate::config::env::EnvConfig;
use crate::config::secrets::StackSecrets;
use crate::domain::service::{RestartPolicy, ServiceRole, ServiceSpec};
use crate::domain::vhost::Upstream;
use crate::domain::DomainSet;

/// 代理容器内的 ACME webroot
pub const PROXY_WEBROOT: &str = "/var/www/certbot";
/// 代理容器内的证书目录
pub const PROXY_CERT_DIR: &str = "/etc/letsencrypt";
/// WordPress 文档根目录（代理与 PHP-FPM 共用）
pub const WORDPRESS_ROOT: &str = "/var/www/html";

const WORDPRESS_FPM_PORT: u16 = 9000;
const N8N_PORT: u16 = 5678;

const FRONTEND: &str = "frontend";
const BACKEND: &str = "backend";

/// 全部受管服务，按启动顺序
pub fn stack_services(config: &EnvConfig, secrets: &StackSecrets, domains: &DomainSet) -> Vec<ServiceSpec> {
    let base = config.base_dir.display().to_string();
    let project = config.project.as_str();
    let paths = config.paths();

    let db = ServiceSpec::new("db", ServiceRole::Database, "mysql:8.0", project)
        .env("MYSQL_ROOT_PASSWORD", &secrets.mysql_root_password)
        .env("MYSQL_DATABASE", &secrets.mysql_database)
        .env("MYSQL_USER", &secrets.mysql_user)
        .env("MYSQL_PASSWORD", &secrets.mysql_password)
        .mount(format!("{}/mysql", base), "/var/lib/mysql")
        .network(BACKEND);

    let cache = ServiceSpec::new("redis", ServiceRole::Cache, "redis:7-alpine", project)
        .mount(format!("{}/redis", base), "/data")
        .network(BACKEND);

    let wordpress = ServiceSpec::new("wordpress", ServiceRole::Application, "wordpress:php8.2-fpm", project)
        .env("WORDPRESS_DB_HOST", "db:3306")
        .env("WORDPRESS_DB_NAME", &secrets.mysql_database)
        .env("WORDPRESS_DB_USER", &secrets.mysql_user)
        .env("WORDPRESS_DB_PASSWORD", &secrets.mysql_password)
        .env(
            "WORDPRESS_CONFIG_EXTRA",
            format!(
                "define('WP_REDIS_HOST', 'redis');\ndefine('WP_HOME', 'https://{0}');\ndefine('WP_SITEURL', 'https://{0}');",
                domains.primary()
            ),
        )
        .mount(format!("{}/wordpress", base), WORDPRESS_ROOT)
        .network(BACKEND)
        .depends_on("db")
        .depends_on("redis");

    let php = ServiceSpec::new("php", ServiceRole::PhpRuntime, "php:8.2-fpm-alpine", project)
        .mount(format!("{}/php", base), "/var/www/php")
        .network(BACKEND);

    let automation_host = domains.automation_host();
    let n8n = ServiceSpec::new("n8n", ServiceRole::Automation, "n8nio/n8n:latest", project)
        .env("N8N_HOST", &automation_host)
        .env("N8N_PROTOCOL", "https")
        .env("N8N_PORT", N8N_PORT.to_string())
        .env("WEBHOOK_URL", format!("https://{}/", automation_host))
        .env("N8N_ENCRYPTION_KEY", &secrets.n8n_encryption_key)
        .env("GENERIC_TIMEZONE", "UTC")
        .mount(format!("{}/n8n", base), "/home/node/.n8n")
        .network(BACKEND);

    let proxy = ServiceSpec::new("nginx", ServiceRole::Proxy, "nginx:1.27-alpine", project)
        .port(config.http_port, 80)
        .port(config.https_port, 443)
        .mount_ro(paths.conf_dir.display().to_string(), "/etc/nginx/conf.d")
        .mount_ro(config.webroot().display().to_string(), PROXY_WEBROOT)
        .mount_ro(config.letsencrypt_dir.display().to_string(), PROXY_CERT_DIR)
        .mount_ro(format!("{}/wordpress", base), WORDPRESS_ROOT)
        .network(FRONTEND)
        .network(BACKEND)
        .depends_on("wordpress")
        .depends_on("n8n")
        .restart(RestartPolicy::Always);

    vec![db, cache, wordpress, php, n8n, proxy]
}

/// `host` 的上游：主域名走 WordPress，子域名走 n8n
pub fn upstream_for(domains: &DomainSet, host: &str) -> Upstream {
    if host == domains.automation_host() {
        Upstream::Http {
            address: format!("n8n:{}", N8N_PORT),
        }
    } else {
        Upstream::FastCgi {
            address: format!("wordpress:{}", WORDPRESS_FPM_PORT),
            document_root: WORDPRESS_ROOT.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::service::find_role;
    use std::path::Path;

    #[test]
    fn test_stack_has_every_role() {
        let config = EnvConfig::with_base_dir(Path::new("/srv/stack"));
        let domains = DomainSet::new("example.com").unwrap();
        let services = stack_services(&config, &StackSecrets::generate(), &domains);

        for role in [
            ServiceRole::Proxy,
            ServiceRole::Database,
            ServiceRole::Application,
            ServiceRole::Automation,
            ServiceRole::Cache,
            ServiceRole::PhpRuntime,
        ] {
            assert!(find_role(&services, role).is_some(), "missing {:?}", role);
        }

        let n8n = find_role(&services, ServiceRole::Automation).unwrap();
        assert_eq!(n8n.env["N8N_HOST"], "n8n.example.com");

        let proxy = find_role(&services, ServiceRole::Proxy).unwrap();
        assert_eq!(proxy.container_name, "stack-nginx");
        assert_eq!(proxy.ports.len(), 2);
        assert!(proxy.mounts.iter().all(|m| m.read_only));
    }

    #[test]
    fn test_upstream_for() {
        let domains = DomainSet::new("example.com").unwrap();
        assert!(matches!(
            upstream_for(&domains, "n8n.example.com"),
            Upstream::Http { .. }
        ));
        assert!(matches!(
            upstream_for(&domains, "example.com"),
            Upstream::FastCgi { .. }
        ));
    }
}
