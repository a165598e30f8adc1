use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Placeholder replaced with the scenario source path in [`CompilerConfig::args`].
pub const SOURCE_PLACEHOLDER: &str = "{source}";
/// Placeholder replaced with the artifact output path in [`CompilerConfig::args`].
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

fn current_binary() -> PathBuf {
    std::env::current_exe().unwrap_or_else(|_| PathBuf::from("loadpilot"))
}

/// External build step used to turn scenario source into a runnable artifact.
///
/// The program is invoked once per job with `args` after placeholder expansion.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: current_binary(),
            args: vec![
                "compile".to_string(),
                "--source".to_string(),
                SOURCE_PLACEHOLDER.to_string(),
                "--output".to_string(),
                OUTPUT_PLACEHOLDER.to_string(),
            ],
        }
    }
}

impl CompilerConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// How the master spawns and supervises executor subprocesses.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Executable hosting the virtual-user runner.
    pub program: PathBuf,
    /// Arguments placed before the launch parameters (e.g. the `executor` subcommand).
    pub leading_args: Vec<String>,
    /// Upper bound for the control endpoint to become reachable.
    pub ready_timeout_ms: u64,
    /// Delay between connection attempts during the readiness handshake.
    pub ready_poll_interval_ms: u64,
    /// How long to wait for a terminated executor to exit before killing it.
    pub exit_grace_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: current_binary(),
            leading_args: vec!["executor".to_string()],
            ready_timeout_ms: 2_000,
            ready_poll_interval_ms: 10,
            exit_grace_ms: 5_000,
        }
    }
}

impl ExecutorConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ready_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.ready_timeout_ms = timeout_ms;
        self
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }
}

/// Settings for the worker runtime inside an executor.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub snapshot_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: 10_000,
        }
    }
}

impl RuntimeConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// gRPC address for the job API and the local agent service.
    pub listen_addr: SocketAddr,
    pub poll_interval_ms: u64,
    pub compiler: CompilerConfig,
    pub executor: ExecutorConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 6890)),
            poll_interval_ms: 1_000,
            compiler: CompilerConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl MasterConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn with_compiler(mut self, compiler: CompilerConfig) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Address executors use to reach the agent service on this master.
    pub fn agent_addr(&self) -> SocketAddr {
        let mut addr = self.listen_addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiler_config_default_uses_compile_subcommand() {
        let cfg = CompilerConfig::default();
        assert_eq!(cfg.args[0], "compile");
        assert!(cfg.args.iter().any(|a| a == SOURCE_PLACEHOLDER));
        assert!(cfg.args.iter().any(|a| a == OUTPUT_PLACEHOLDER));
    }

    #[test]
    fn compiler_config_with_args() {
        let cfg = CompilerConfig::new("/bin/false").with_args(["build", "{source}"]);
        assert_eq!(cfg.program, PathBuf::from("/bin/false"));
        assert_eq!(cfg.args, vec!["build".to_string(), "{source}".to_string()]);
    }

    #[test]
    fn executor_config_default() {
        let cfg = ExecutorConfig::default();
        assert_eq!(cfg.leading_args, vec!["executor".to_string()]);
        assert_eq!(cfg.ready_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.ready_poll_interval(), Duration::from_millis(10));
        assert_eq!(cfg.exit_grace(), Duration::from_secs(5));
    }

    #[test]
    fn executor_config_builders() {
        let cfg = ExecutorConfig::new("/usr/bin/env")
            .with_leading_args(["loadpilot", "executor"])
            .with_ready_timeout_ms(250);
        assert_eq!(cfg.program, PathBuf::from("/usr/bin/env"));
        assert_eq!(cfg.leading_args.len(), 2);
        assert_eq!(cfg.ready_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn runtime_config_default() {
        assert_eq!(
            RuntimeConfig::default().snapshot_interval(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn master_config_default() {
        let cfg = MasterConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:6890");
        assert_eq!(cfg.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn master_config_new() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = MasterConfig::new(addr).with_poll_interval_ms(50);
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.poll_interval_ms, 50);
    }

    #[test]
    fn agent_addr_replaces_unspecified_ip() {
        let cfg = MasterConfig::new("0.0.0.0:7000".parse().unwrap());
        assert_eq!(cfg.agent_addr().to_string(), "127.0.0.1:7000");

        let cfg = MasterConfig::new("10.1.2.3:7000".parse().unwrap());
        assert_eq!(cfg.agent_addr(), cfg.listen_addr);
    }
}
