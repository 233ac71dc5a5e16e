//! 模板渲染
//!
//! 编译进二进制的 Tera 模板。渲染是纯函数：重新校验域名集，将主机名以
//! `primary`、`subdomains`、`automation_host`、`hostnames` 暴露，
//! 其余变量由调用方通过 `tera::Context` 传入。
//!
//! 关闭自动转义。写入 YAML 的值用 `compose_quote`，写入 shell 脚本的值用 `shell_quote`。

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use tera::{Context, Tera, Value};
use tracing::debug;

use crate::domain::service::ServiceSpec;
use crate::domain::vhost::VHostConfig;
use crate::domain::DomainSet;
use crate::error::{ProvisionError, ProvisionResult};

/// 已知模板
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TemplateId {
    ChallengeVhost,
    WordpressVhost,
    AutomationVhost,
    ComposeManifest,
    RenewalScript,
    HealthcheckScript,
}

impl TemplateId {
    pub const ALL: [TemplateId; 6] = [
        TemplateId::ChallengeVhost,
        TemplateId::WordpressVhost,
        TemplateId::AutomationVhost,
        TemplateId::ComposeManifest,
        TemplateId::RenewalScript,
        TemplateId::HealthcheckScript,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateId::ChallengeVhost => "challenge-vhost",
            TemplateId::WordpressVhost => "wordpress-vhost",
            TemplateId::AutomationVhost => "automation-vhost",
            TemplateId::ComposeManifest => "compose-manifest",
            TemplateId::RenewalScript => "renewal-script",
            TemplateId::HealthcheckScript => "healthcheck-script",
        }
    }

    fn source(&self) -> &'static str {
        match self {
            TemplateId::ChallengeVhost => include_str!("templates/challenge-vhost.conf.j2"),
            TemplateId::WordpressVhost => include_str!("templates/wordpress-vhost.conf.j2"),
            TemplateId::AutomationVhost => include_str!("templates/automation-vhost.conf.j2"),
            TemplateId::ComposeManifest => include_str!("templates/compose-manifest.yml.j2"),
            TemplateId::RenewalScript => include_str!("templates/renewal-script.sh.j2"),
            TemplateId::HealthcheckScript => include_str!("templates/healthcheck-script.sh.j2"),
        }
    }
}

impl FromStr for TemplateId {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TemplateId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| ProvisionError::UnknownTemplate(s.to_string()))
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 渲染内嵌模板
pub struct TemplateRenderer {
    tera: Tera,
}

impl TemplateRenderer {
    pub fn new() -> ProvisionResult<Self> {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        tera.register_filter("shell_quote", shell_quote_filter);
        tera.register_filter("compose_quote", compose_quote_filter);
        tera.add_raw_templates(TemplateId::ALL.iter().map(|id| (id.as_str(), id.source())))?;
        debug!(count = TemplateId::ALL.len(), "Loaded embedded templates");
        Ok(Self { tera })
    }

    /// 用 `domains` 和调用方的 `extra` 变量渲染 `template`
    pub fn render(&self, template: &str, domains: &DomainSet, extra: &Context) -> ProvisionResult<String> {
        let id: TemplateId = template.parse()?;
        domains.validate()?;

        let mut context = Context::new();
        context.insert("primary", domains.primary());
        context.insert("subdomains", domains.subdomains());
        context.insert("automation_host", &domains.automation_host());
        context.insert("hostnames", &domains.hostnames());
        context.extend(extra.clone());

        let rendered = self.tera.render(id.as_str(), &context)?;
        debug!(template = %id, bytes = rendered.len(), "Rendered template");
        Ok(rendered)
    }
}

/// vhost 模板上下文
pub fn vhost_context(vhost: &VHostConfig, webroot: &str) -> Context {
    let mut context = Context::new();
    context.insert("vhost", vhost);
    context.insert("webroot", webroot);
    context
}

/// challenge vhost 上下文，每个主机名一个 challenge 配置块
pub fn challenge_context(domains: &DomainSet, webroot: &str) -> Context {
    let vhosts: Vec<VHostConfig> = domains
        .hostnames()
        .into_iter()
        .map(VHostConfig::challenge)
        .collect();
    let mut context = Context::new();
    context.insert("vhosts", &vhosts);
    context.insert("webroot", webroot);
    context
}

/// compose manifest 上下文
pub fn compose_context(services: &[ServiceSpec]) -> Context {
    let networks: BTreeSet<&str> = services
        .iter()
        .flat_map(|s| s.networks.iter().map(String::as_str))
        .collect();
    let mut context = Context::new();
    context.insert("services", services);
    context.insert("networks", &networks);
    context
}

/// POSIX single-quoting: `it's` becomes `'it'\''s'`
pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

fn scalar(value: &Value, filter: &str) -> tera::Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(tera::Error::msg(format!(
            "filter `{}` expects a scalar, got {}",
            filter, other
        ))),
    }
}

fn shell_quote_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    Ok(Value::String(shell_quote(&scalar(value, "shell_quote")?)))
}

/// JSON string (valid YAML double-quoted scalar) with compose `$` escaped
fn compose_quote_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let raw = scalar(value, "compose_quote")?;
    let quoted = serde_json::to_string(&raw).map_err(|e| tera::Error::msg(e.to_string()))?;
    Ok(Value::String(quoted.replace('$', "$$")))
}
