// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Local port forwards run by the system `ssh` client, one child per tunnel.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::process::{ProcessCommand, ProcessError, SupervisedProcess};
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ForwardTarget, ManagedProcess, TunnelLauncherPort};
use crate::app::types::{Credential, Host};

const SSHPASS_ENV: &str = "SSHPASS";

#[derive(Debug, Clone)]
pub struct SshTunnelLauncher {
    ssh_binary: String,
    sshpass_binary: String,
    known_hosts_path: Option<PathBuf>,
}

impl Default for SshTunnelLauncher {
    fn default() -> Self {
        Self::new("ssh", "sshpass", None)
    }
}

impl SshTunnelLauncher {
    pub fn new(
        ssh_binary: impl Into<String>,
        sshpass_binary: impl Into<String>,
        known_hosts_path: Option<PathBuf>,
    ) -> Self {
        Self {
            ssh_binary: ssh_binary.into(),
            sshpass_binary: sshpass_binary.into(),
            known_hosts_path,
        }
    }

    /// Builds `ssh -N -L local:remote_host:remote_port user@host`.
    /// Passwords travel through the environment, never argv.
    pub fn build_command(&self, host: &Host, target: &ForwardTarget) -> ProcessCommand {
        let mut args = vec![
            "-N".to_string(),
            "-L".to_string(),
            format!(
                "{}:{}:{}",
                target.local_port, target.remote_host, target.remote_port
            ),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=60".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(path) = &self.known_hosts_path {
            args.push("-o".to_string());
            args.push(format!("UserKnownHostsFile={}", path.display()));
        }
        args.push("-p".to_string());
        args.push(host.port.to_string());

        let destination = format!("{}@{}", host.username, host.address);
        match &host.credential {
            Credential::IdentityFile(path) => {
                args.push("-i".to_string());
                args.push(shellexpand::tilde(path).into_owned());
                args.push("-o".to_string());
                args.push("BatchMode=yes".to_string());
                args.push(destination);
                ProcessCommand {
                    program: self.ssh_binary.clone(),
                    args,
                    env: Vec::new(),
                }
            }
            Credential::Password(password) => {
                args.push("-o".to_string());
                args.push("PreferredAuthentications=password,keyboard-interactive".to_string());
                args.push(destination);
                let mut wrapped = vec!["-e".to_string(), self.ssh_binary.clone()];
                wrapped.extend(args);
                ProcessCommand {
                    program: self.sshpass_binary.clone(),
                    args: wrapped,
                    env: vec![(SSHPASS_ENV.to_string(), password.clone())],
                }
            }
        }
    }
}

fn map_spawn_error(err: ProcessError) -> AppError {
    match err {
        ProcessError::NotFound(program) => AppError::with_message(
            AppErrorKind::DependencyMissing,
            codes::DEPENDENCY_MISSING,
            format!("{program} is not installed on the control host"),
        ),
        other => AppError::with_message(
            AppErrorKind::ProcessSpawn,
            codes::PROCESS_SPAWN,
            other.to_string(),
        ),
    }
}

#[async_trait]
impl TunnelLauncherPort for SshTunnelLauncher {
    #[tracing::instrument(
        name = "tunnel",
        level = "debug",
        skip(self, host, target),
        fields(op = "launch", host = %host.name, local_port = target.local_port, remote_port = target.remote_port)
    )]
    async fn launch(
        &self,
        host: &Host,
        target: &ForwardTarget,
    ) -> AppResult<Arc<dyn ManagedProcess>> {
        let command = self.build_command(host, target);
        tracing::debug!(command = %command.display(), "launching forward");
        let process = SupervisedProcess::spawn(&command).map_err(map_spawn_error)?;
        Ok(Arc::new(process))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::types::Address;

    fn host(credential: Credential) -> Host {
        Host {
            name: "gpu-1".to_string(),
            address: Address::parse("gpu-1.lab"),
            port: 2222,
            username: "ops".to_string(),
            credential,
            gpu_enabled: true,
            gpu_vendor: None,
            description: "A100".to_string(),
        }
    }

    fn target() -> ForwardTarget {
        ForwardTarget {
            local_port: 16006,
            remote_host: "localhost".to_string(),
            remote_port: 6006,
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn identity_host_runs_ssh_directly() {
        let launcher = SshTunnelLauncher::default();
        let command =
            launcher.build_command(&host(Credential::IdentityFile("/keys/id".into())), &target());
        assert_eq!(command.program, "ssh");
        assert!(has_pair(&command.args, "-L", "16006:localhost:6006"));
        assert!(has_pair(&command.args, "-p", "2222"));
        assert!(has_pair(&command.args, "-i", "/keys/id"));
        assert!(has_pair(&command.args, "-o", "ExitOnForwardFailure=yes"));
        assert!(has_pair(&command.args, "-o", "BatchMode=yes"));
        assert_eq!(command.args.first().map(String::as_str), Some("-N"));
        assert_eq!(command.args.last().map(String::as_str), Some("ops@gpu-1.lab"));
        assert!(command.env.is_empty());
    }

    #[test]
    fn password_host_goes_through_sshpass_env() {
        let launcher = SshTunnelLauncher::new("/usr/bin/ssh", "/usr/bin/sshpass", None);
        let command = launcher.build_command(&host(Credential::Password("hunter2".into())), &target());
        assert_eq!(command.program, "/usr/bin/sshpass");
        assert_eq!(&command.args[..2], &["-e".to_string(), "/usr/bin/ssh".to_string()]);
        assert_eq!(
            command.env,
            vec![("SSHPASS".to_string(), "hunter2".to_string())]
        );
        assert!(!command.display().contains("hunter2"));
        assert!(!command.args.iter().any(|a| a == "BatchMode=yes"));
    }

    #[test]
    fn custom_remote_host_and_known_hosts_file() {
        let launcher =
            SshTunnelLauncher::new("ssh", "sshpass", Some(PathBuf::from("/etc/gpufleet/known_hosts")));
        let target = ForwardTarget {
            local_port: 16007,
            remote_host: "10.1.0.5".to_string(),
            remote_port: 8888,
        };
        let command =
            launcher.build_command(&host(Credential::IdentityFile("/keys/id".into())), &target);
        assert!(has_pair(&command.args, "-L", "16007:10.1.0.5:8888"));
        assert!(has_pair(
            &command.args,
            "-o",
            "UserKnownHostsFile=/etc/gpufleet/known_hosts"
        ));
    }

    #[tokio::test]
    async fn missing_ssh_binary_is_dependency_missing() {
        let launcher = SshTunnelLauncher::new("/nonexistent/ssh", "sshpass", None);
        let err = launcher
            .launch(&host(Credential::IdentityFile("/keys/id".into())), &target())
            .await
            .err()
            .expect("launch must fail");
        assert_eq!(err.kind(), AppErrorKind::DependencyMissing);
    }
}
