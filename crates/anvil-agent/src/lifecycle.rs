//! Stop negotiation shared by both backends: graceful command, bounded polling, escalation.

use std::time::Duration;

use anvil_model::{InstanceStatus, ServerInstance, StopMethod, StopOutcome};
use tokio::time::Instant;

use crate::backend::{Backend, StopSignal};
use crate::dispatch::CommandDispatcher;
use crate::error::Result;
use crate::workload::{GameKind, is_save_line};

const SAVE_SCAN_TAIL: usize = 50;
/// Polls allowed after escalation before the observed status is reported as-is.
const ESCALATION_POLLS: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct StopPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub force: bool,
}

async fn observe(backend: &dyn Backend, id: &str) -> Result<InstanceStatus> {
    match backend.inspect(id).await {
        Ok(inst) => Ok(inst.status),
        Err(e) if e.is_not_found() => Ok(InstanceStatus::NotFound),
        Err(e) => Err(e),
    }
}

fn is_down(status: InstanceStatus) -> bool {
    !matches!(
        status,
        InstanceStatus::Running | InstanceStatus::Stopping | InstanceStatus::Creating
    )
}

async fn wait_down(
    backend: &dyn Backend,
    id: &str,
    poll_interval: Duration,
    polls: u32,
) -> Result<InstanceStatus> {
    let mut status = observe(backend, id).await?;
    for _ in 0..polls {
        if is_down(status) {
            break;
        }
        tokio::time::sleep(poll_interval).await;
        status = observe(backend, id).await?;
    }
    Ok(status)
}

fn settled(status: InstanceStatus) -> InstanceStatus {
    if status == InstanceStatus::NotFound {
        status
    } else if is_down(status) {
        InstanceStatus::Stopped
    } else {
        status
    }
}

/// Sends the workload's shutdown command, waits up to `policy.timeout` polling at
/// `policy.poll_interval`, then escalates to SIGKILL (`force`) or SIGTERM.
pub async fn stop_instance(
    backend: &dyn Backend,
    dispatcher: &CommandDispatcher,
    inst: &ServerInstance,
    policy: StopPolicy,
) -> Result<StopOutcome> {
    let started = Instant::now();
    let elapsed_ms = || started.elapsed().as_millis() as u64;
    let id = inst.id.as_str();

    if !inst.status.is_running() {
        return Ok(StopOutcome {
            status: settled(inst.status),
            method: StopMethod::AlreadyStopped,
            graceful_command: None,
            dispatch_tier: None,
            elapsed_ms: 0,
        });
    }

    let kind = GameKind::of_instance(inst);
    let command = kind.graceful_stop_command();
    let mut term_sent = false;
    let dispatch_tier = match dispatcher.dispatch(backend, inst, command).await {
        Ok(outcome) => {
            tracing::info!(
                instance = %inst.name,
                command,
                tier = ?outcome.tier,
                "stop: sent graceful command"
            );
            Some(outcome.tier)
        }
        Err(e) => {
            tracing::info!(instance = %inst.name, error = %e, "stop: no console channel, sending SIGTERM");
            backend.signal(id, StopSignal::Term).await?;
            term_sent = true;
            None
        }
    };
    let graceful_command = dispatch_tier.map(|_| command.to_string());

    let deadline = started + policy.timeout;
    let mut save_confirmed = kind.save_keywords().is_empty() || term_sent;
    loop {
        let status = observe(backend, id).await?;
        if is_down(status) {
            return Ok(StopOutcome {
                status: settled(status),
                method: if term_sent {
                    StopMethod::Terminated
                } else {
                    StopMethod::Graceful
                },
                graceful_command,
                dispatch_tier,
                elapsed_ms: elapsed_ms(),
            });
        }

        if !save_confirmed && let Ok(lines) = backend.logs(id, SAVE_SCAN_TAIL).await {
            if let Some(k) = lines.iter().find_map(|l| is_save_line(kind, l)) {
                save_confirmed = true;
                tracing::info!(instance = %inst.name, keyword = k, "stop: world save confirmed");
            }
        }

        if Instant::now() >= deadline {
            break;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(policy.poll_interval.min(remaining).max(Duration::from_millis(1))).await;
    }

    if !save_confirmed {
        tracing::warn!(instance = %inst.name, "stop: world save not confirmed before timeout");
    }

    let (signal, method) = if policy.force {
        (StopSignal::Kill, StopMethod::Forced)
    } else {
        (StopSignal::Term, StopMethod::Terminated)
    };
    tracing::warn!(
        instance = %inst.name,
        timeout_ms = policy.timeout.as_millis() as u64,
        ?signal,
        "stop: still running at deadline, escalating"
    );
    backend.signal(id, signal).await?;
    let status = wait_down(backend, id, policy.poll_interval, ESCALATION_POLLS).await?;

    Ok(StopOutcome {
        status: settled(status),
        method,
        graceful_command,
        dispatch_tier,
        elapsed_ms: elapsed_ms(),
    })
}

/// Immediate SIGKILL without negotiation.
pub async fn kill_instance(
    backend: &dyn Backend,
    inst: &ServerInstance,
    poll_interval: Duration,
) -> Result<StopOutcome> {
    let started = Instant::now();
    if !inst.status.is_running() {
        return Ok(StopOutcome {
            status: settled(inst.status),
            method: StopMethod::AlreadyStopped,
            graceful_command: None,
            dispatch_tier: None,
            elapsed_ms: 0,
        });
    }
    let id = inst.id.as_str();
    backend.signal(id, StopSignal::Kill).await?;
    let status = wait_down(backend, id, poll_interval, ESCALATION_POLLS).await?;
    Ok(StopOutcome {
        status: settled(status),
        method: StopMethod::Forced,
        graceful_command: None,
        dispatch_tier: None,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}
