use std::time::Duration;

use anvil_model::{CommandOutcome, DispatchTier, ServerInstance};

use crate::backend::Backend;
use crate::error::{Result, RuntimeError};
use crate::rcon;

/// Sends console commands through the most capable channel available: remote console, then
/// console attach, then a write through the process table.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    rcon_timeout: Duration,
    attach_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(rcon_timeout: Duration, attach_timeout: Duration) -> Self {
        Self {
            rcon_timeout,
            attach_timeout,
        }
    }

    pub fn attach_timeout(&self) -> Duration {
        self.attach_timeout
    }

    /// `Ok(None)` when the instance has no remote console configured or reachable.
    pub async fn via_rcon(
        &self,
        backend: &dyn Backend,
        inst: &ServerInstance,
        text: &str,
    ) -> Result<Option<String>> {
        let Some(settings) = rcon::settings_from_env(&inst.env) else {
            return Ok(None);
        };
        let Some(addr) = backend.rcon_address(inst, settings.port).await else {
            return Ok(None);
        };
        rcon::execute(addr, &settings.password, text, self.rcon_timeout)
            .await
            .map(Some)
    }

    pub async fn via_attach(
        &self,
        backend: &dyn Backend,
        inst: &ServerInstance,
        text: &str,
    ) -> Result<String> {
        backend
            .attach_command(inst.id.as_str(), text, self.attach_timeout)
            .await
    }

    pub async fn via_process_table(
        &self,
        backend: &dyn Backend,
        inst: &ServerInstance,
        text: &str,
    ) -> Result<()> {
        backend.proc_table_command(inst.id.as_str(), text).await
    }

    pub async fn dispatch(
        &self,
        backend: &dyn Backend,
        inst: &ServerInstance,
        text: &str,
    ) -> Result<CommandOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RuntimeError::invalid("command", "must be non-empty"));
        }
        let mut failures = Vec::new();

        match self.via_rcon(backend, inst, text).await {
            Ok(Some(response)) => {
                tracing::debug!(instance = %inst.name, tier = "rcon", "command delivered");
                return Ok(CommandOutcome {
                    tier: DispatchTier::RemoteConsole,
                    response: Some(response),
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(instance = %inst.name, tier = "rcon", error = %e, "falling through");
                failures.push(format!("rcon: {e}"));
            }
        }

        match self.via_attach(backend, inst, text).await {
            Ok(response) => {
                tracing::debug!(instance = %inst.name, tier = "attach", "command delivered");
                return Ok(CommandOutcome {
                    tier: DispatchTier::Attach,
                    response: Some(response).filter(|r| !r.trim().is_empty()),
                });
            }
            Err(e) => {
                tracing::debug!(instance = %inst.name, tier = "attach", error = %e, "falling through");
                failures.push(format!("attach: {e}"));
            }
        }

        match self.via_process_table(backend, inst, text).await {
            Ok(()) => {
                tracing::debug!(instance = %inst.name, tier = "process-table", "command delivered");
                Ok(CommandOutcome {
                    tier: DispatchTier::ProcessTable,
                    response: None,
                })
            }
            Err(e) => {
                failures.push(format!("process table: {e}"));
                Err(RuntimeError::Unsupported(format!(
                    "no command channel accepted the command ({})",
                    failures.join("; ")
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::backend::fake::FakeBackend;

    #[tokio::test]
    async fn falls_through_to_attach_without_rcon_password() {
        let backend = FakeBackend::new();
        let inst = backend.seed_running("mc", BTreeMap::new()).await;
        let d = CommandDispatcher::new(Duration::from_millis(200), Duration::from_millis(200));
        let out = d.dispatch(&backend, &inst, "say hi").await.unwrap();
        assert_eq!(out.tier, DispatchTier::Attach);
        assert!(backend.calls().await.iter().any(|c| c == "attach mc say hi"));
    }

    #[tokio::test]
    async fn unreachable_rcon_and_attach_fall_to_process_table() {
        let backend = FakeBackend::new();
        backend.set_attach_supported(false).await;
        let env = BTreeMap::from([
            ("RCON_PASSWORD".to_string(), "pw".to_string()),
            ("RCON_PORT".to_string(), "1".to_string()),
        ]);
        let inst = backend.seed_running("mc", env).await;
        let d = CommandDispatcher::new(Duration::from_millis(200), Duration::from_millis(200));
        let out = d.dispatch(&backend, &inst, "save-all").await.unwrap();
        assert_eq!(out.tier, DispatchTier::ProcessTable);
        assert_eq!(out.response, None);
    }

    #[tokio::test]
    async fn all_channels_failing_is_unsupported() {
        let backend = FakeBackend::new();
        backend.set_attach_supported(false).await;
        backend.set_proc_table_supported(false).await;
        let inst = backend.seed_running("mc", BTreeMap::new()).await;
        let d = CommandDispatcher::new(Duration::from_millis(200), Duration::from_millis(200));
        let err = d.dispatch(&backend, &inst, "stop").await.unwrap_err();
        assert_eq!(err.kind(), anvil_model::ErrorKind::Unsupported);
    }
}
