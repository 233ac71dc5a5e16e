//! 部署编排状态机
//!
//! 按顺序执行各阶段：
//!
//! `Init → ChallengeConfigured → ProxyUp → CertIssued → FinalConfigured →
//! Restarted → Verified`
//!
//! 第一个失败的阶段以 `Failed(phase, reason)` 结束运行；健康检查失败时停在
//! `Restarted` 并带告警。代理以 TLS 配置重启后安装续期任务。取消只在阶段之间生效。
//! 每个阶段都可重复执行，新的运行总是从 `Init` 开始。

pub mod context;
pub mod phases;

use tracing::{error, info, warn};

use crate::domain::provision::{Phase, ProvisionOutcome, ProvisioningResult, RunState, StageStatus};
use crate::error::ProvisionError;

pub use context::{Backoff, ProvisionContext};
use phases::StepOutcome;

/// 驱动一次编排运行
pub struct Provisioner {
    ctx: ProvisionContext,
}

impl Provisioner {
    pub fn new(ctx: ProvisionContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ProvisionContext {
        &self.ctx
    }

    async fn step(&self, phase: Phase, result: &mut ProvisioningResult) -> Result<StepOutcome, ProvisionError> {
        match phase {
            Phase::Init => Ok(StepOutcome::Done),
            Phase::ChallengeConfigured => phases::configure_challenge(&self.ctx, result).await,
            Phase::ProxyUp => phases::start_stack(&self.ctx, result).await,
            Phase::CertIssued => phases::issue_certificate(&self.ctx, result).await,
            Phase::FinalConfigured => phases::configure_tls(&self.ctx, result).await,
            Phase::Restarted => phases::reload_proxy(&self.ctx, result).await,
            Phase::Verified => phases::verify(&self.ctx, result).await,
        }
    }

    /// 从 `Init` 开始执行全部阶段
    pub async fn run(&self) -> ProvisionOutcome {
        let total = Phase::STEPS.len();
        let mut state = RunState::Reached { phase: Phase::Init };
        let mut results: Vec<ProvisioningResult> = Vec::with_capacity(total);
        let mut health = None;

        info!(domains = %self.ctx.domains, "Starting provisioning");

        for (index, phase) in Phase::STEPS.into_iter().enumerate() {
            if self.ctx.cancel_token.is_cancelled() {
                warn!(phase = %phase, "Provisioning cancelled");
                state = RunState::Failed {
                    phase,
                    reason: "cancelled".to_string(),
                };
                break;
            }

            info!("[{}/{}] {}...", index + 1, total, phase.display_name());
            let mut result = ProvisioningResult::new(phase);
            result.start();

            let outcome = self.step(phase, &mut result).await;
            let stop = match outcome {
                Ok(StepOutcome::Done) => {
                    result.finish(StageStatus::Success);
                    state = RunState::Reached { phase };
                    false
                }
                Ok(StepOutcome::Skipped(reason)) => {
                    info!(phase = %phase, reason = %reason, "Phase skipped");
                    result.skip(reason);
                    result.finish(StageStatus::Skipped);
                    state = RunState::Reached { phase };
                    false
                }
                Ok(StepOutcome::Verified(report)) => {
                    result.finish(StageStatus::Success);
                    state = RunState::Reached { phase };
                    health = Some(report);
                    false
                }
                Ok(StepOutcome::Degraded(report)) => {
                    warn!(failures = ?report.failures(), "Health verification failed, stack is degraded");
                    result.finish(StageStatus::Warning);
                    health = Some(report);
                    true
                }
                Err(e) => {
                    let reason = failure_reason(&e);
                    error!(phase = %phase, error = %e, "Phase failed");
                    result.note(reason.clone());
                    result.finish(StageStatus::Failed);
                    state = RunState::Failed { phase, reason };
                    true
                }
            };

            info!(
                "  {} {} ({})",
                result.status.icon(),
                phase.display_name(),
                format_duration(result.duration_ms)
            );
            results.push(result);
            if stop {
                break;
            }
        }

        let renewal_installed = self.install_renewal(&state).await;

        let outcome = ProvisionOutcome {
            state,
            results,
            renewal_installed,
            health,
        };
        log_summary(&outcome);
        outcome
    }

    /// TLS 配置生效后安装续期任务
    async fn install_renewal(&self, state: &RunState) -> bool {
        if !matches!(state, RunState::Reached { phase } if *phase >= Phase::Restarted) {
            return false;
        }
        let paths = self.ctx.config.paths();
        let installed = match self.ctx.renewal_scheduler() {
            Ok(scheduler) => scheduler.install(&self.ctx.domains, &paths.renewal_script).await,
            Err(e) => Err(e),
        };
        match installed {
            Ok(added) => {
                info!(added = added, script = %paths.renewal_script.display(), "Renewal job installed");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to install renewal job");
                false
            }
        }
    }
}

/// 错误信息加上工具输出的末尾
pub fn failure_reason(err: &ProvisionError) -> String {
    match err.tool_output() {
        Some(output) => {
            let lines: Vec<&str> = output.lines().collect();
            let tail = lines[lines.len().saturating_sub(20)..].join("\n");
            format!("{}: {}", err, tail)
        }
        None => err.to_string(),
    }
}

fn format_duration(duration_ms: Option<i64>) -> String {
    duration_ms
        .map(|d| format!("{}ms", d))
        .unwrap_or_else(|| "-".to_string())
}

fn log_summary(outcome: &ProvisionOutcome) {
    info!("=== Provisioning Summary ===");
    for result in &outcome.results {
        info!(
            "{} {} ({})",
            result.status.icon(),
            result.phase.display_name(),
            format_duration(result.duration_ms)
        );
    }
    if let Some(report) = &outcome.health {
        let now = chrono::Utc::now();
        for (host, ok) in &report.http_reachable {
            let cert = match report.cert_validity.get(host).copied().flatten() {
                Some(w) if w.is_current(now) => format!("certificate valid until {}", w.not_after),
                Some(_) => "certificate expired".to_string(),
                None => "certificate unavailable".to_string(),
            };
            info!(
                "{} {}: {}, {}",
                if *ok { "✓" } else { "✗" },
                host,
                if *ok { "reachable" } else { "unreachable" },
                cert
            );
        }
    }
    info!(
        state = %outcome.state,
        renewal_installed = outcome.renewal_installed,
        "Provisioning finished"
    );
}
