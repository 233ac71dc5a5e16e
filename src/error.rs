//! 统一错误处理
//!
//! `ProvisionError` 覆盖编排器可能抛出的全部错误。健康检查中的单项失败记录在报告里，
//! 不会直接返回错误；需要时调用方可用 `PartialHealthFailure` 将降级报告转为错误。

use thiserror::Error;

/// 编排错误
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Hostname violates the strict hostname grammar
    #[error("invalid domain '{domain}': {reason}")]
    InvalidDomain { domain: String, reason: String },

    /// Template id not known to the renderer
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),

    /// External tool exited non-zero or could not be started
    #[error("{tool} failed{suffix}", suffix = exit_suffix(.exit_code))]
    ExternalToolFailure {
        tool: String,
        exit_code: Option<i32>,
        output: String,
    },

    /// External call exceeded its timeout and was killed
    #[error("{operation} timed out")]
    TimedOut { operation: String },

    /// Service never became ready within the retry budget
    #[error("service '{name}' did not become ready")]
    UnreadyService { name: String },

    /// A required health probe failed
    #[error("health probe '{probe}' failed")]
    PartialHealthFailure { probe: String },

    /// Template rendering failed
    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProvisionError {
    /// 构造非法域名错误
    pub fn invalid_domain(domain: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDomain {
            domain: domain.into(),
            reason: reason.into(),
        }
    }

    /// 构造外部工具失败错误
    pub fn tool_failure(tool: impl Into<String>, exit_code: Option<i32>, output: impl Into<String>) -> Self {
        Self::ExternalToolFailure {
            tool: tool.into(),
            exit_code,
            output: output.into(),
        }
    }

    /// 构造超时错误
    pub fn timed_out(operation: impl Into<String>) -> Self {
        Self::TimedOut {
            operation: operation.into(),
        }
    }

    /// 错误携带的工具输出
    pub fn tool_output(&self) -> Option<&str> {
        match self {
            Self::ExternalToolFailure { output, .. } if !output.trim().is_empty() => Some(output),
            _ => None,
        }
    }

    /// 编排阶段之外的错误对应的退出码
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidDomain { .. } | Self::Config(_) => 2,
            Self::UnknownTemplate(_) | Self::Template(_) => 3,
            Self::Io(_) | Self::Json(_) => 4,
            Self::ExternalToolFailure { .. } | Self::TimedOut { .. } => 5,
            Self::UnreadyService { .. } => 6,
            Self::PartialHealthFailure { .. } => 30,
        }
    }
}

fn exit_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" with exit code {}", c)).unwrap_or_default()
}

/// 便捷别名
pub type ProvisionResult<T> = Result<T, ProvisionError>;
