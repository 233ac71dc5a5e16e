//! 编排运行模型

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::health::HealthReport;

/// 编排阶段，按执行顺序
///
/// 每个变体表示对应步骤成功后到达的状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    ChallengeConfigured,
    ProxyUp,
    CertIssued,
    FinalConfigured,
    Restarted,
    Verified,
}

impl Phase {
    /// 有前置步骤的阶段
    pub const STEPS: [Phase; 6] = [
        Phase::ChallengeConfigured,
        Phase::ProxyUp,
        Phase::CertIssued,
        Phase::FinalConfigured,
        Phase::Restarted,
        Phase::Verified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::ChallengeConfigured => "challenge_configured",
            Phase::ProxyUp => "proxy_up",
            Phase::CertIssued => "cert_issued",
            Phase::FinalConfigured => "final_configured",
            Phase::Restarted => "restarted",
            Phase::Verified => "verified",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Phase::Init => "Init",
            Phase::ChallengeConfigured => "Challenge Config",
            Phase::ProxyUp => "Proxy Up",
            Phase::CertIssued => "Certificate Issuance",
            Phase::FinalConfigured => "TLS Config",
            Phase::Restarted => "Proxy Reload",
            Phase::Verified => "Health Verification",
        }
    }

    /// 进入该阶段的步骤失败时的退出码
    pub fn exit_code(&self) -> i32 {
        match self {
            Phase::Init => 9,
            Phase::ChallengeConfigured => 10,
            Phase::ProxyUp => 11,
            Phase::CertIssued => 12,
            Phase::FinalConfigured => 13,
            Phase::Restarted => 14,
            Phase::Verified => 15,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 运行停止的位置
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    /// Last phase reached; `Verified` on full success, `Restarted` when health
    /// verification reported warnings
    Reached { phase: Phase },
    /// A step failed; nothing after `phase` was attempted
    Failed { phase: Phase, reason: String },
}

impl RunState {
    pub fn is_verified(&self) -> bool {
        matches!(self, RunState::Reached { phase: Phase::Verified })
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunState::Reached { phase: Phase::Verified } => 0,
            RunState::Reached { .. } => Phase::Verified.exit_code(),
            RunState::Failed { phase, .. } => phase.exit_code(),
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Reached { phase } => write!(f, "{}", phase),
            RunState::Failed { phase, reason } => write!(f, "failed({}): {}", phase, reason),
        }
    }
}

/// 步骤状态
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    /// 已完成，但有不影响运行结果的问题
    Warning,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn icon(&self) -> &'static str {
        match self {
            StageStatus::Success => "✓",
            StageStatus::Warning => "!",
            StageStatus::Failed => "✗",
            StageStatus::Skipped => "⊘",
            StageStatus::Running => "⟳",
            StageStatus::Pending => "○",
        }
    }
}

/// 单个阶段的执行记录
#[derive(Clone, Debug, Serialize)]
pub struct ProvisioningResult {
    pub phase: Phase,
    pub status: StageStatus,
    pub diagnostics: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl ProvisioningResult {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            status: StageStatus::Pending,
            diagnostics: Vec::new(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
        }
    }

    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
    }

    pub fn note(&mut self, line: impl Into<String>) {
        self.diagnostics.push(line.into());
    }

    pub fn finish(&mut self, status: StageStatus) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = status;
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = StageStatus::Skipped;
        self.diagnostics.push(reason.into());
    }

    /// 跳过和告警的步骤都算成功
    pub fn succeeded(&self) -> bool {
        matches!(
            self.status,
            StageStatus::Success | StageStatus::Skipped | StageStatus::Warning
        )
    }
}

/// 一次编排运行的全部产出
#[derive(Clone, Debug, Serialize)]
pub struct ProvisionOutcome {
    pub state: RunState,
    pub results: Vec<ProvisioningResult>,
    /// 运行结束后续期任务是否存在（本次添加或已存在）
    pub renewal_installed: bool,
    /// 验证阶段的健康报告（若已执行）
    pub health: Option<HealthReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        assert!(Phase::Init < Phase::ChallengeConfigured);
        assert!(Phase::CertIssued < Phase::FinalConfigured);
        assert_eq!(Phase::STEPS.len(), 6);
        assert_eq!(Phase::STEPS[0], Phase::ChallengeConfigured);
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let mut codes: Vec<i32> = Phase::STEPS.iter().map(|p| p.exit_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), Phase::STEPS.len());
        assert_eq!(RunState::Reached { phase: Phase::Verified }.exit_code(), 0);
        assert_eq!(
            RunState::Failed {
                phase: Phase::CertIssued,
                reason: "x".into()
            }
            .exit_code(),
            12
        );
    }

    #[test]
    fn test_result_lifecycle() {
        let mut result = ProvisioningResult::new(Phase::ProxyUp);
        assert_eq!(result.status, StageStatus::Pending);

        result.start();
        assert_eq!(result.status, StageStatus::Running);

        result.note("proxy accepting connections");
        result.finish(StageStatus::Success);
        assert!(result.succeeded());
        assert!(result.duration_ms.is_some());

        let mut skipped = ProvisioningResult::new(Phase::CertIssued);
        skipped.skip("certificate still valid");
        assert!(skipped.succeeded());
        assert_eq!(skipped.diagnostics, vec!["certificate still valid"]);
    }
}
