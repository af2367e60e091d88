//! Remote command runner
//!
//! [`CommandRunner`] is the seam between dispatch and the remote transport.
//! [`PwshRunner`] runs the command through a PowerShell remoting session over
//! SSH and returns cleaned output text.

use async_trait::async_trait;
use rcd_config::HandlerConfig;
use regex::Regex;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::debug;

use crate::error::{DispatchError, Result};
use crate::schema::CommandArg;

/// Raw text produced by one remote invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` with `args` on `host`
    async fn invoke(&self, host: &str, command: &str, args: &[CommandArg]) -> Result<CommandOutput>;
}

/// `Command -Name value ...`
pub fn command_line(command: &str, args: &[CommandArg]) -> String {
    let mut line = command.to_string();
    for arg in args {
        line.push_str(&format!(" -{} {}", arg.name, arg.value));
    }
    line
}

fn noise_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"__ClassMetadata[\s\S]+\}\}",
            r"Creating[\s\S]+remaining.",
            r"0/1 completed[\s\S]+Quick Scan",
            r"\x1b",
            r"\[\d+mA*",
            r"~+",
            r"\|,",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect()
    })
}

/// Remove terminal noise (CIM metadata, progress banners, ANSI escapes,
/// rules) and doubled spaces from PowerShell output
pub fn clean_output(source: &str) -> String {
    let mut cleaned = source.to_string();
    for pattern in noise_patterns() {
        cleaned = pattern.replace_all(&cleaned, "").into_owned();
    }
    cleaned.replace("  ", "")
}

pub struct PwshRunner {
    program: String,
    username: String,
    key_path: String,
}

impl PwshRunner {
    pub fn new(config: &HandlerConfig) -> Self {
        Self {
            program: config.program.clone(),
            username: config.username.clone(),
            key_path: config.key_path.clone(),
        }
    }

    /// Session setup plus the remote invocation
    pub fn script(&self, host: &str, command: &str, args: &[CommandArg]) -> String {
        format!(
            "$session = New-PSSession -HostName {}@{} -KeyFilePath {}\nInvoke-Command -Session $session -ScriptBlock {{{}}}",
            self.username,
            host,
            self.key_path,
            command_line(command, args)
        )
    }
}

#[async_trait]
impl CommandRunner for PwshRunner {
    async fn invoke(&self, host: &str, command: &str, args: &[CommandArg]) -> Result<CommandOutput> {
        let script = self.script(host, command, args);
        debug!(host, command, program = %self.program, "Invoking PowerShell command");

        let child = Command::new(&self.program)
            .arg("-command")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DispatchError::Runner(format!("failed to spawn {}: {}", self.program, e)))?;

        let output = child.wait_with_output().await?;
        debug!(host, status = ?output.status.code(), "PowerShell command finished");

        Ok(CommandOutput {
            stdout: clean_output(&String::from_utf8_lossy(&output.stdout)),
            stderr: clean_output(&String::from_utf8_lossy(&output.stderr)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(program: &str) -> PwshRunner {
        PwshRunner::new(&HandlerConfig {
            program: program.to_string(),
            username: "admin".to_string(),
            key_path: "/keys/id_rsa".to_string(),
            ..Default::default()
        })
    }

    fn arg(name: &'static str, value: &str) -> CommandArg {
        CommandArg {
            name,
            value: value.to_string(),
        }
    }

    #[test]
    fn test_script() {
        let script = runner("pwsh").script(
            "10.0.0.5",
            "Set-MpPreference",
            &[arg("DisableRealtimeMonitoring", "$True"), arg("AsJob", "")],
        );
        assert_eq!(
            script,
            "$session = New-PSSession -HostName admin@10.0.0.5 -KeyFilePath /keys/id_rsa\n\
             Invoke-Command -Session $session -ScriptBlock {Set-MpPreference -DisableRealtimeMonitoring $True -AsJob }"
        );
    }

    #[test]
    fn test_script_keeps_text_values_whole() {
        let preferences = serde_json::json!({"ScanPath": "C:\\Program Files; Stop-Computer"});
        let args = crate::schema::START_SCAN_SCHEMA
            .validate("Start-MpScan", preferences.as_object().unwrap())
            .unwrap();
        let script = runner("pwsh").script("h1", "Start-MpScan", &args);
        assert!(script.ends_with("{Start-MpScan -ScanPath 'C:\\Program Files; Stop-Computer'}"));
    }

    #[test]
    fn test_command_line_without_args() {
        assert_eq!(command_line("Get-MpComputerStatus", &[]), "Get-MpComputerStatus");
    }

    #[test]
    fn test_clean_output() {
        assert_eq!(clean_output("\x1b[32mEnabled : True"), "Enabled : True");
        assert_eq!(clean_output("value ~~~~~~\n"), "value \n");
        assert_eq!(clean_output("a|,b"), "ab");
        assert_eq!(clean_output("Name    : x"), "Name: x");
        assert_eq!(clean_output("x __ClassMetadata {{a}} y }} z"), "xz");
        assert_eq!(clean_output("Creating session, 3 seconds remaining.\nok"), "\nok");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_passes_script_to_program() {
        let output = runner("echo")
            .invoke("h1", "Get-MpComputerStatus", &[])
            .await
            .unwrap();
        assert!(output.stdout.starts_with("-command $session = New-PSSession -HostName admin@h1"));
        assert!(output.stdout.contains("-ScriptBlock {Get-MpComputerStatus}"));
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_missing_program_is_runner_error() {
        let err = runner("/nonexistent/pwsh")
            .invoke("h1", "Get-MpComputerStatus", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Runner(_)));
    }
}
