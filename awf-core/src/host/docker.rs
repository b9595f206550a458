use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use awf_config::WorkflowConfig;
use awf_config::constants::files::{
    COMPOSE_FILE, CONFIG_FILE_MODE, LOGS_DIR_MODE, PROXY_ACCESS_LOG, PROXY_LOG_SUBDIR,
    SECCOMP_PROFILE_FILE, SQUID_CONFIG_FILE, WORK_DIR_MODE,
};
use awf_config::constants::network::{
    AGENT_ADDRESS, AGENT_CONTAINER, API_PROXY_ADDRESS, BRIDGE_INTERFACE, DOCKER_USER_CHAIN,
    HOST_FILTER_CHAIN, HOST_FILTER_STAGING_CHAIN, NETWORK_NAME, PROXY_ADDRESS, SUBNET,
};

use super::compose::{build_compose_file, redact_compose_file, write_compose_file};
use super::executor::{
    CommandCategory, CommandExecutor, CommandInvocation, CommandOutput, ProcessCommandExecutor,
};
use super::files::{prepare_dir, write_new_file};
use super::{AgentExit, NetworkTopology, SandboxHost};
use crate::firewall::{HostRuleSet, compile_host_rules, render_squid_config};
use crate::policy::CompiledPolicy;
use crate::proxy_log::{LogFilter, read_access_log, summarize};

#[derive(Debug, Default)]
struct RunState {
    topology: Option<NetworkTopology>,
    network_created: bool,
    chain_installed: bool,
    compose_path: Option<PathBuf>,
}

/// Docker and iptables backed implementation of [`SandboxHost`].
///
/// Every host interaction goes through the injected [`CommandExecutor`].
pub struct DockerHost<E: CommandExecutor = ProcessCommandExecutor> {
    executor: E,
    environment: BTreeMap<String, String>,
    state: Mutex<RunState>,
}

impl DockerHost<ProcessCommandExecutor> {
    /// Host backed by real child processes, snapshotting the current environment.
    pub fn from_process_env() -> Self {
        Self::new(ProcessCommandExecutor::new(), std::env::vars().collect())
    }
}

impl<E: CommandExecutor> DockerHost<E> {
    pub fn new(executor: E, environment: BTreeMap<String, String>) -> Self {
        Self {
            executor,
            environment,
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    async fn run(&self, invocation: CommandInvocation) -> Result<CommandOutput> {
        debug!(
            category = ?invocation.category,
            command = %invocation.display(),
            "executing host command"
        );
        let output = self.executor.execute(&invocation).await?;
        output.ensure_success(&invocation)
    }

    /// Run a command whose failure is an expected answer, not an error.
    pub(super) async fn probe(&self, invocation: CommandInvocation) -> Result<CommandOutput> {
        debug!(
            category = ?invocation.category,
            command = %invocation.display(),
            "probing host state"
        );
        self.executor.execute(&invocation).await
    }

    pub(super) fn docker<I, S>(args: I) -> CommandInvocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandInvocation::new(CommandCategory::Container, "docker", args)
    }

    fn iptables<I, S>(args: I) -> CommandInvocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandInvocation::new(CommandCategory::Firewall, "iptables", args)
    }

    fn compose(compose_path: &Path, args: &[&str]) -> CommandInvocation {
        let mut full = vec![
            "compose".to_string(),
            "-f".to_string(),
            compose_path.display().to_string(),
        ];
        full.extend(args.iter().map(|arg| (*arg).to_string()));
        let invocation = CommandInvocation::new(CommandCategory::Compose, "docker", full);
        match compose_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => invocation.in_dir(dir),
            _ => invocation,
        }
    }

    fn jump_rule(action: &str, chain: &str) -> Vec<String> {
        let mut args = vec![action.to_string(), DOCKER_USER_CHAIN.to_string()];
        if action == "-I" {
            args.push("1".to_string());
        }
        args.extend(["-i", BRIDGE_INTERFACE, "-j", chain].map(String::from));
        args
    }

    /// Replace a chain left by an earlier run without a window in which the
    /// bridge jumps to an empty chain.
    ///
    /// The new rules go into a staging chain, the jump moves to it, and only
    /// then is the old chain dropped and the staging chain renamed into place.
    async fn replace_chain(&self, rules: &HostRuleSet) -> Result<()> {
        let chain = rules.chain();
        let staging = HOST_FILTER_STAGING_CHAIN;

        let created = self.probe(Self::iptables(["-N", staging])).await?;
        if !created.is_success() {
            // Leftover from an interrupted replacement; it is not jumped to.
            self.run(Self::iptables(["-F", staging]))
                .await
                .with_context(|| format!("failed to reset chain {staging}"))?;
        }
        for args in rules.to_iptables_args_for(staging) {
            self.run(Self::iptables(args)).await?;
        }
        self.run(Self::iptables(Self::jump_rule("-I", staging)))
            .await
            .with_context(|| format!("failed to route {BRIDGE_INTERFACE} through {staging}"))?;
        self.state.lock().await.chain_installed = true;

        let stale = self.probe(Self::iptables(Self::jump_rule("-D", chain))).await?;
        if !stale.is_success() {
            debug!(chain, "no jump to the previous chain");
        }
        for step in [["-F", chain], ["-X", chain]] {
            self.run(Self::iptables(step))
                .await
                .with_context(|| format!("failed to remove previous chain {chain}"))?;
        }
        self.run(Self::iptables(["-E", staging, chain]))
            .await
            .with_context(|| format!("failed to rename {staging} to {chain}"))?;
        Ok(())
    }

    async fn report_blocked_domains(&self, logs_dir: &Path, allowed_domains: &[String]) {
        let log_path = logs_dir.join(PROXY_ACCESS_LOG);
        let entries = match read_access_log(&log_path).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!(path = %log_path.display(), error = %err, "proxy access log unavailable");
                return;
            }
        };
        let summary = summarize(&entries, &LogFilter::blocked());
        for stats in summary.domains.iter().filter(|stats| stats.blocked > 0) {
            warn!(
                domain = %stats.domain,
                blocked = stats.blocked,
                allow_list_size = allowed_domains.len(),
                "proxy denied requests to a domain outside the allow-list"
            );
        }
    }
}

fn logs_dir_for(work_dir: &Path, proxy_logs_dir: Option<&Path>) -> PathBuf {
    proxy_logs_dir.map_or_else(|| work_dir.join(PROXY_LOG_SUBDIR), Path::to_path_buf)
}

#[async_trait]
impl<E: CommandExecutor> SandboxHost for DockerHost<E> {
    async fn ensure_firewall_network(&self) -> Result<NetworkTopology> {
        let inspect = self
            .probe(Self::docker([
                "network",
                "inspect",
                NETWORK_NAME,
                "--format",
                "{{range .IPAM.Config}}{{.Subnet}} {{end}}",
            ]))
            .await?;

        let mut state = self.state.lock().await;
        if inspect.is_success() {
            let subnets: Vec<&str> = inspect.stdout.split_whitespace().collect();
            if !subnets.contains(&SUBNET) {
                bail!(
                    "network {NETWORK_NAME} exists with subnet(s) [{}], expected {SUBNET}",
                    subnets.join(", ")
                );
            }
            info!(network = NETWORK_NAME, "reusing existing firewall network");
        } else {
            let bridge_name = format!("com.docker.network.bridge.name={BRIDGE_INTERFACE}");
            self.run(Self::docker([
                "network",
                "create",
                "--driver",
                "bridge",
                "--subnet",
                SUBNET,
                "--opt",
                bridge_name.as_str(),
                NETWORK_NAME,
            ]))
            .await
            .with_context(|| format!("failed to create network {NETWORK_NAME}"))?;
            state.network_created = true;
            info!(network = NETWORK_NAME, subnet = SUBNET, "created firewall network");
        }

        let topology = NetworkTopology {
            subnet: SUBNET.to_string(),
            proxy_address: PROXY_ADDRESS.to_string(),
            agent_address: AGENT_ADDRESS.to_string(),
            api_proxy_address: Some(API_PROXY_ADDRESS.to_string()),
        };
        state.topology = Some(topology.clone());
        Ok(topology)
    }

    async fn setup_host_iptables(
        &self,
        proxy_address: &str,
        port: u16,
        dns_servers: &[String],
        api_proxy_address: Option<&str>,
    ) -> Result<()> {
        let rules = compile_host_rules(proxy_address, port, dns_servers, api_proxy_address)?;

        let created = self.probe(Self::iptables(["-N", rules.chain()])).await?;
        if created.is_success() {
            self.state.lock().await.chain_installed = true;
            for args in rules.to_iptables_args() {
                self.run(Self::iptables(args)).await?;
            }
            // The jump goes in last so traffic never hits a half-built chain.
            self.run(Self::iptables(Self::jump_rule("-I", rules.chain()))).await?;
        } else {
            info!(chain = rules.chain(), "replacing host filter chain from an earlier run");
            self.replace_chain(&rules).await?;
        }

        info!(
            chain = rules.chain(),
            rules = rules.rules().len(),
            api_proxy = api_proxy_address.is_some(),
            "host filtering installed"
        );
        Ok(())
    }

    async fn write_configs(&self, config: &WorkflowConfig, policy: &CompiledPolicy) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(topology) = state.topology.clone() else {
            bail!("firewall network has not been provisioned");
        };

        let work_dir = &config.work_dir;
        let logs_dir = logs_dir_for(work_dir, config.proxy_logs_dir());
        prepare_dir(work_dir, WORK_DIR_MODE)?;
        prepare_dir(&logs_dir, LOGS_DIR_MODE)?;

        let squid = render_squid_config(&policy.proxy_acl, policy.proxy_port, &policy.dns_servers);
        write_new_file(
            &work_dir.join(SQUID_CONFIG_FILE),
            squid.as_bytes(),
            CONFIG_FILE_MODE,
        )?;
        let seccomp = policy.seccomp_profile.to_json_pretty()?;
        write_new_file(
            &work_dir.join(SECCOMP_PROFILE_FILE),
            seccomp.as_bytes(),
            CONFIG_FILE_MODE,
        )?;

        let compose = build_compose_file(config, &topology, &self.environment, &logs_dir);
        let compose_path = work_dir.join(COMPOSE_FILE);
        write_compose_file(&compose_path, &compose)?;
        state.compose_path = Some(compose_path);

        info!(
            work_dir = %work_dir.display(),
            logs_dir = %logs_dir.display(),
            services = compose.services.len(),
            "wrote sandbox configuration"
        );
        Ok(())
    }

    async fn start_containers(
        &self,
        work_dir: &Path,
        allowed_domains: &[String],
        proxy_logs_dir: Option<&Path>,
        skip_pull: bool,
    ) -> Result<()> {
        let mut args = vec!["up", "-d"];
        if skip_pull {
            args.extend(["--pull", "never"]);
        }
        self.run(Self::compose(&work_dir.join(COMPOSE_FILE), &args))
            .await
            .context("failed to start sandbox containers")?;

        info!(
            allowed_domains = allowed_domains.len(),
            logs_dir = %logs_dir_for(work_dir, proxy_logs_dir).display(),
            skip_pull,
            "sandbox containers started"
        );
        Ok(())
    }

    async fn redact_compose_secrets(&self, work_dir: &Path) -> Result<()> {
        let redacted = redact_compose_file(&work_dir.join(COMPOSE_FILE))?;
        // Names only; values never reach the log.
        info!(keys = ?redacted, "redacted compose secrets");
        Ok(())
    }

    async fn run_agent_command(
        &self,
        work_dir: &Path,
        allowed_domains: &[String],
        proxy_logs_dir: Option<&Path>,
    ) -> Result<AgentExit> {
        let follow = Self::docker(["logs", "-f", AGENT_CONTAINER]).inherit_output();
        if let Err(err) = self.probe(follow).await {
            warn!(error = %err, "failed to stream agent output");
        }

        let waited = self
            .run(Self::docker(["wait", AGENT_CONTAINER]))
            .await
            .context("failed to wait for the agent container")?;
        let exit_code: i32 = waited
            .stdout
            .trim()
            .parse()
            .with_context(|| format!("unexpected `docker wait` output: {:?}", waited.stdout))?;

        if exit_code != 0 {
            self.report_blocked_domains(&logs_dir_for(work_dir, proxy_logs_dir), allowed_domains)
                .await;
        }
        Ok(AgentExit::new(exit_code))
    }

    async fn perform_cleanup(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut failures = 0usize;

        if let Some(compose_path) = state.compose_path.take() {
            if let Err(err) = self
                .run(Self::compose(&compose_path, &["down", "-v", "--remove-orphans"]))
                .await
            {
                warn!(error = %err, "failed to stop sandbox containers");
                failures += 1;
            }
            // The compose file may still hold secrets if redaction never ran.
            if let Err(err) = tokio::fs::remove_file(&compose_path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        path = %compose_path.display(),
                        error = %err,
                        "failed to remove compose file"
                    );
                    failures += 1;
                }
            }
        }

        if state.chain_installed {
            let steps = [
                Self::jump_rule("-D", HOST_FILTER_CHAIN),
                vec!["-F".to_string(), HOST_FILTER_CHAIN.to_string()],
                vec!["-X".to_string(), HOST_FILTER_CHAIN.to_string()],
            ];
            for args in steps {
                if let Err(err) = self.run(Self::iptables(args)).await {
                    warn!(error = %err, "failed to remove host filter rule");
                    failures += 1;
                }
            }
            state.chain_installed = false;
        }

        if state.network_created {
            if let Err(err) = self.run(Self::docker(["network", "rm", NETWORK_NAME])).await {
                warn!(error = %err, "failed to remove firewall network");
                failures += 1;
            }
            state.network_created = false;
        }
        state.topology = None;

        if failures == 0 {
            info!("sandbox cleanup complete; proxy logs preserved");
        } else {
            warn!(failures, "sandbox cleanup finished with errors; proxy logs preserved");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::{ScriptedExecutor, scripted_host as host};
    use crate::seccomp::SeccompProfile;
    use awf_config::DomainRule;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn creates_network_when_missing() {
        let host = host(ScriptedExecutor::default().failing("docker network inspect"));
        let topology = host.ensure_firewall_network().await.unwrap();

        assert_eq!(topology.proxy_address, "172.30.0.10");
        assert_eq!(topology.api_proxy_address.as_deref(), Some("172.30.0.30"));
        let calls = host.executor().calls();
        assert_eq!(calls.len(), 2);
        assert!(
            calls[1].starts_with("docker network create --driver bridge --subnet 172.30.0.0/24")
        );
    }

    #[tokio::test]
    async fn reuses_existing_network() {
        let host = host(
            ScriptedExecutor::default().answering("docker network inspect", "172.30.0.0/24 \n"),
        );
        host.ensure_firewall_network().await.unwrap();
        host.ensure_firewall_network().await.unwrap();

        assert!(host
            .executor()
            .calls()
            .iter()
            .all(|call| call.starts_with("docker network inspect")));
    }

    #[tokio::test]
    async fn rejects_network_with_foreign_subnet() {
        let host =
            host(ScriptedExecutor::default().answering("docker network inspect", "10.0.0.0/8"));
        let err = host.ensure_firewall_network().await.unwrap_err();
        assert!(err.to_string().contains("expected 172.30.0.0/24"));
    }

    #[tokio::test]
    async fn installs_rules_before_jump() {
        let host = host(ScriptedExecutor::default());
        host.setup_host_iptables("172.30.0.10", 3128, &["8.8.8.8".into()], None)
            .await
            .unwrap();

        let calls = host.executor().calls();
        assert_eq!(calls.first().unwrap(), "iptables -N FW_WRAPPER");
        assert_eq!(
            calls.last().unwrap(),
            "iptables -I DOCKER-USER 1 -i awf-br0 -j FW_WRAPPER"
        );
        let reject = calls
            .iter()
            .position(|call| call.contains("REJECT"))
            .unwrap();
        assert_eq!(reject, calls.len() - 2);
    }

    #[tokio::test]
    async fn existing_chain_is_replaced_through_staging() {
        let host = host(ScriptedExecutor::default().failing("iptables -N FW_WRAPPER"));
        host.setup_host_iptables("172.30.0.10", 3128, &["1.1.1.1".into()], None)
            .await
            .unwrap();

        let calls = host.executor().calls();
        let position = |wanted: &str| calls.iter().position(|call| call == wanted).unwrap();
        let staged_jump = position("iptables -I DOCKER-USER 1 -i awf-br0 -j FW_WRAPPER_NEW");
        let old_flush = position("iptables -F FW_WRAPPER");

        // The live chain is only emptied once the bridge already jumps to the
        // fully built staging chain.
        assert!(staged_jump < old_flush);
        let appends: Vec<&String> = calls.iter().filter(|c| c.starts_with("iptables -A")).collect();
        assert_eq!(appends.len(), 6);
        assert!(appends.iter().all(|c| c.starts_with("iptables -A FW_WRAPPER_NEW ")));
        assert!(appends.iter().all(|c| position(c) < staged_jump));
        assert_eq!(
            &calls[old_flush - 1..],
            [
                "iptables -D DOCKER-USER -i awf-br0 -j FW_WRAPPER",
                "iptables -F FW_WRAPPER",
                "iptables -X FW_WRAPPER",
                "iptables -E FW_WRAPPER_NEW FW_WRAPPER",
            ]
        );
    }

    #[tokio::test]
    async fn invalid_resolver_issues_no_commands() {
        let host = host(ScriptedExecutor::default());
        let err = host
            .setup_host_iptables("172.30.0.10", 3128, &["resolver".into()], None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid DNS resolver"));
        assert!(host.executor().calls().is_empty());
    }

    #[tokio::test]
    async fn writes_configs_and_starts_with_skip_pull() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkflowConfig::builder(dir.path())
            .rule(DomainRule::with_subdomains("github.com"))
            .agent_command(["true"])
            .build()
            .unwrap();
        let policy = CompiledPolicy::compile(&config, &SeccompProfile::builtin().unwrap()).unwrap();

        let host = host(ScriptedExecutor::default().failing("docker network inspect"));
        host.ensure_firewall_network().await.unwrap();
        host.write_configs(&config, &policy).await.unwrap();

        assert!(dir.path().join("docker-compose.yml").exists());
        assert!(dir.path().join("squid-logs").is_dir());
        let squid = std::fs::read_to_string(dir.path().join("squid.conf")).unwrap();
        assert!(squid.contains("acl allowed_domains dstdomain .github.com"));
        let seccomp = std::fs::read_to_string(dir.path().join("seccomp-profile.json")).unwrap();
        assert!(seccomp.contains("SCMP_ACT_ERRNO"));

        host.start_containers(dir.path(), &config.allowed_domains(), None, true)
            .await
            .unwrap();
        let last = host.executor().calls().last().cloned().unwrap();
        assert!(last.ends_with("docker-compose.yml up -d --pull never"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn write_configs_refuses_planted_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim.txt");
        std::fs::write(&victim, "precious").unwrap();
        std::os::unix::fs::symlink(&victim, dir.path().join("docker-compose.yml")).unwrap();

        let config = WorkflowConfig::builder(dir.path())
            .agent_command(["true"])
            .build()
            .unwrap();
        let policy = CompiledPolicy::compile(&config, &SeccompProfile::builtin().unwrap()).unwrap();
        let host = host(ScriptedExecutor::default().failing("docker network inspect"));
        host.ensure_firewall_network().await.unwrap();

        let err = host.write_configs(&config, &policy).await.unwrap_err();
        assert!(format!("{err:#}").contains("symlink"));
        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "precious");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn write_configs_rejects_shared_work_dir() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o777)).unwrap();
        let config = WorkflowConfig::builder(dir.path())
            .agent_command(["true"])
            .build()
            .unwrap();
        let policy = CompiledPolicy::compile(&config, &SeccompProfile::builtin().unwrap()).unwrap();
        let host = host(ScriptedExecutor::default().failing("docker network inspect"));
        host.ensure_firewall_network().await.unwrap();

        let err = host.write_configs(&config, &policy).await.unwrap_err();
        assert!(err.to_string().contains("writable by group or others"));
        assert!(!dir.path().join("docker-compose.yml").exists());
    }

    #[tokio::test]
    async fn write_configs_requires_network() {
        let config = WorkflowConfig::builder("/tmp/awf-never")
            .agent_command(["true"])
            .build()
            .unwrap();
        let policy = CompiledPolicy::compile(&config, &SeccompProfile::builtin().unwrap()).unwrap();
        let err = host(ScriptedExecutor::default())
            .write_configs(&config, &policy)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not been provisioned"));
    }

    #[tokio::test]
    async fn agent_exit_code_comes_from_docker_wait() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(ScriptedExecutor::default().answering("docker wait", "17\n"));
        let exit = host
            .run_agent_command(dir.path(), &["github.com".into()], None)
            .await
            .unwrap();
        assert_eq!(exit, AgentExit::new(17));
        assert_eq!(
            host.executor().calls(),
            vec!["docker logs -f awf-agent", "docker wait awf-agent"]
        );
    }

    #[tokio::test]
    async fn cleanup_continues_past_failures() {
        let host = host(
            ScriptedExecutor::default()
                .failing("docker network inspect")
                .failing("iptables -N")
                .failing("iptables -D"),
        );
        host.ensure_firewall_network().await.unwrap();
        host.setup_host_iptables("172.30.0.10", 3128, &["8.8.8.8".into()], None)
            .await
            .unwrap();

        host.perform_cleanup().await.unwrap();
        let calls = host.executor().calls();
        let tail: Vec<&str> = calls.iter().rev().take(4).rev().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec![
                "iptables -D DOCKER-USER -i awf-br0 -j FW_WRAPPER",
                "iptables -F FW_WRAPPER",
                "iptables -X FW_WRAPPER",
                "docker network rm awf-net",
            ]
        );

        // Nothing left to tear down on a second pass.
        let before = host.executor().calls().len();
        host.perform_cleanup().await.unwrap();
        assert_eq!(host.executor().calls().len(), before);
    }
}
