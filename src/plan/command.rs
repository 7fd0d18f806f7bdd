//! Shell command actions

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

use crate::scheduler::{ActionContext, ActionError, ActionResult, ExecutionAction};

/// Runs a command line through a shell, capturing its output
#[derive(Clone, Debug)]
pub struct CommandAction {
    shell: String,
    script: String,
    workdir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl CommandAction {
    pub fn new(shell: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            script: script.into(),
            workdir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn into_action(self) -> Arc<dyn ExecutionAction> {
        Arc::new(self)
    }

    fn command(&self, ctx: &ActionContext) -> Command {
        let mut command = Command::new(&self.shell);
        command.kill_on_drop(true);
        command.arg("-c").arg(&self.script);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.env("TEST_SCHEDULER_UNIT", &ctx.key);
        command.env("TEST_SCHEDULER_ATTEMPT", ctx.attempt.to_string());
        command.envs(&self.env);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }
        command
    }
}

#[async_trait]
impl ExecutionAction for CommandAction {
    async fn invoke(&self, ctx: &ActionContext) -> ActionResult {
        debug!("[{}] $ {}", ctx.key, self.script);

        let mut command = self.command(ctx);
        // Dropping the output future kills the child
        let output = tokio::select! {
            output = command.output() => output,
            _ = ctx.cancelled() => {
                return Err(ActionError::failed("cancelled"));
            }
        };

        let output = output.map_err(|e| {
            ActionError::errored(format!("failed to spawn '{}': {e}", self.shell))
        })?;

        ctx.output().write(&String::from_utf8_lossy(&output.stdout));
        ctx.output().write(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            return Ok(());
        }
        match output.status.code() {
            Some(code) => Err(ActionError::failed(format!("exit status {code}"))),
            None => Err(ActionError::failed("terminated by signal")),
        }
    }
}
