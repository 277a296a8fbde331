//! Role-process supervision.
//!
//! Each role is an opaque OS process launched inside its namespace via
//! `ip netns exec`. The orchestrator controls it only through signals
//! (pause/resume/terminate) and observes it only through its readiness
//! artifact and exit status; there is no in-process channel to the node.
//!
//! State machine: Spawned -> Listening (address observed) -> Running ->
//! {Paused <-> Running} -> Terminated(graceful|hard). Terminated is
//! terminal unless an explicit restart re-enters Spawned.

use crate::recorder::RunRecorder;
use crate::ChaosError;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Pub,
    Sub,
    Relay,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Pub => "pub",
            Role::Sub => "sub",
            Role::Relay => "relay",
        }
    }

    /// Subscribers and relays announce their listen address through a
    /// readiness file; publishers only dial.
    pub fn writes_ready_artifact(&self) -> bool {
        matches!(self, Role::Sub | Role::Relay)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Quic,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Quic => "quic",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Transport::Tcp),
            "quic" => Ok(Transport::Quic),
            _ => Err(anyhow::anyhow!("unknown transport: {s} (expected tcp|quic)")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Spawned,
    Listening,
    Running,
    Paused,
    TerminatedGraceful,
    TerminatedHard,
}

/// Everything needed to (re)launch one role instance.
#[derive(Clone, Debug)]
pub struct RoleSpec {
    /// Topology member slot this role occupies ("pub", "relay", "leaf1", ...).
    pub member: String,
    pub role: Role,
    pub transport: Transport,
    pub namespace: String,
    pub bind_ip: Ipv4Addr,
    pub store_dir: PathBuf,
    /// Readiness-address file (sub/relay).
    pub ready_file: Option<PathBuf>,
    /// Peer address to dial at startup (pub/relay).
    pub dial: Option<String>,
    /// Run-duration bound forwarded to the relay, in milliseconds (the
    /// node parses its final relay argument as ms).
    pub run_ms: Option<u64>,
    /// Hard ceiling on how long the scenario will wait for this process to
    /// exit. Every role has one; nothing in the system waits unbounded.
    pub exit_timeout: Duration,
}

/// Build the node binary's argument vector per its black-box contract:
/// `<role> <transport> <bound-ip> <store-dir> [<ready-or-dial>] [<dial>] [<duration>]`.
pub fn node_argv(spec: &RoleSpec) -> Vec<String> {
    let mut argv = vec![
        spec.role.as_str().to_string(),
        spec.transport.as_str().to_string(),
        spec.bind_ip.to_string(),
        spec.store_dir.to_string_lossy().into_owned(),
    ];
    match spec.role {
        Role::Pub => {
            if let Some(dial) = &spec.dial {
                argv.push(dial.clone());
            }
        }
        Role::Sub => {
            if let Some(ready) = &spec.ready_file {
                argv.push(ready.to_string_lossy().into_owned());
            }
        }
        Role::Relay => {
            if let Some(ready) = &spec.ready_file {
                argv.push(ready.to_string_lossy().into_owned());
            }
            if let Some(dial) = &spec.dial {
                argv.push(dial.clone());
            }
            if let Some(ms) = spec.run_ms {
                argv.push(ms.to_string());
            }
        }
    }
    argv
}

/// Poll a readiness file until it holds a non-empty address or the attempt
/// budget is spent. Never blocks longer than `attempts * interval`.
pub async fn poll_ready_file(path: &Path, attempts: u32, interval: Duration) -> Option<String> {
    for _ in 0..attempts {
        if let Ok(contents) = tokio::fs::read_to_string(path).await {
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        tokio::time::sleep(interval).await;
    }
    None
}

/// One spawned node-under-test instance.
pub struct RoleProcess {
    spec: RoleSpec,
    node_bin: String,
    netns_base_dir: PathBuf,
    recorder: RunRecorder,
    child: Child,
    pid: u32,
    state: ProcessState,
    io_tasks: Vec<JoinHandle<()>>,
}

impl RoleProcess {
    /// Launch the node binary inside the role's namespace. Stdout and
    /// stderr are line-forwarded into the combined run log, tagged with the
    /// member name, and the pid is registered with the metrics sampler.
    pub async fn spawn(
        node_bin: &str,
        netns_base_dir: &Path,
        spec: RoleSpec,
        recorder: &RunRecorder,
    ) -> Result<Self, ChaosError> {
        let argv = node_argv(&spec);
        info!("spawning {} in {}: {} {}", spec.member, spec.namespace, node_bin, argv.join(" "));

        let mut child = Command::new("ip")
            .args(["netns", "exec", &spec.namespace])
            .arg(node_bin)
            .args(&argv)
            .env("IP_NETNS_DIR", netns_base_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| ChaosError::Process(format!("spawn {}: {e}", spec.member)))?;

        let pid = child
            .id()
            .ok_or_else(|| ChaosError::Process(format!("{} exited before observation", spec.member)))?;

        let mut io_tasks = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            io_tasks.push(forward_lines(stdout, recorder.clone(), spec.member.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            io_tasks.push(forward_lines(stderr, recorder.clone(), spec.member.clone(), "stderr"));
        }

        recorder.track_process(&spec.member, pid);
        recorder.log_output(&format!("spawned {} (pid {})", spec.member, pid));

        Ok(Self {
            spec,
            node_bin: node_bin.to_string(),
            netns_base_dir: netns_base_dir.to_path_buf(),
            recorder: recorder.clone(),
            child,
            pid,
            state: ProcessState::Spawned,
            io_tasks,
        })
    }

    pub fn member(&self) -> &str {
        &self.spec.member
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn spec(&self) -> &RoleSpec {
        &self.spec
    }

    /// Poll this role's readiness artifact. Returns the announced address,
    /// or a [`ChaosError::ReadinessTimeout`] once the attempt budget is
    /// spent; the caller is expected to terminate the partial process and
    /// abort the run.
    pub async fn await_ready(
        &mut self,
        attempts: u32,
        interval: Duration,
    ) -> Result<String, ChaosError> {
        let path = self.spec.ready_file.clone().ok_or_else(|| {
            ChaosError::InvalidConfig(format!("{} writes no readiness artifact", self.spec.member))
        })?;

        match poll_ready_file(&path, attempts, interval).await {
            Some(address) => {
                self.state = ProcessState::Listening;
                self.recorder
                    .log_output(&format!("{} listening on {}", self.spec.member, address));
                self.state = ProcessState::Running;
                Ok(address)
            }
            None => Err(ChaosError::ReadinessTimeout {
                role: self.spec.member.clone(),
                attempts,
                interval_ms: interval.as_millis() as u64,
            }),
        }
    }

    /// Suspend without terminating (SIGSTOP).
    pub fn pause(&mut self) -> Result<(), ChaosError> {
        kill(Pid::from_raw(self.pid as i32), Signal::SIGSTOP)?;
        self.state = ProcessState::Paused;
        self.recorder.log_output(&format!("paused {}", self.spec.member));
        Ok(())
    }

    /// Continue a paused process (SIGCONT).
    pub fn resume(&mut self) -> Result<(), ChaosError> {
        kill(Pid::from_raw(self.pid as i32), Signal::SIGCONT)?;
        self.state = ProcessState::Running;
        self.recorder.log_output(&format!("resumed {}", self.spec.member));
        Ok(())
    }

    /// Terminate the process. Graceful sends SIGTERM and allows a bounded
    /// exit window before escalating; non-graceful is an immediate SIGKILL
    /// (crash-like failure).
    pub async fn terminate(&mut self, graceful: bool) -> Result<(), ChaosError> {
        let pid = Pid::from_raw(self.pid as i32);
        if graceful {
            // The process may already be gone; that is not a failure here.
            match kill(pid, Signal::SIGTERM) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => return Err(e.into()),
            }
            if timeout(Duration::from_secs(5), self.child.wait())
                .await
                .is_err()
            {
                warn!("{} ignored SIGTERM, escalating", self.spec.member);
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
            self.state = ProcessState::TerminatedGraceful;
        } else {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
            self.state = ProcessState::TerminatedHard;
        }

        self.recorder.untrack_process(self.pid);
        self.recorder.log_output(&format!(
            "terminated {} ({})",
            self.spec.member,
            if graceful { "graceful" } else { "hard" }
        ));
        self.drain_io().await;
        Ok(())
    }

    /// Terminate and re-spawn with the identical argument vector, so peers
    /// can reconnect through the same dial/listen target. The readiness
    /// artifact is truncated first: a restart only counts as ready once a
    /// fresh address has been written.
    pub async fn restart(mut self, hard: bool) -> Result<RoleProcess, ChaosError> {
        if let Some(ready) = &self.spec.ready_file {
            if let Err(e) = std::fs::write(ready, b"") {
                warn!("could not truncate readiness file for restart: {}", e);
            }
        }
        self.terminate(!hard).await?;
        self.recorder
            .log_output(&format!("restarting {} ({})", self.spec.member, if hard { "hard" } else { "graceful" }));
        RoleProcess::spawn(
            &self.node_bin,
            &self.netns_base_dir,
            self.spec.clone(),
            &self.recorder,
        )
        .await
    }

    /// Bounded wait for natural exit (the role's own spawn-time timeout).
    /// Returns whether the process exited successfully; a process that
    /// outlives its timeout is hard-killed and reported as a failure.
    pub async fn wait_exit(&mut self) -> Result<bool, ChaosError> {
        match timeout(self.spec.exit_timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.state = if status.success() {
                    ProcessState::TerminatedGraceful
                } else {
                    ProcessState::TerminatedHard
                };
                self.recorder.untrack_process(self.pid);
                self.recorder
                    .log_output(&format!("{} exited: {}", self.spec.member, status));
                self.drain_io().await;
                Ok(status.success())
            }
            Ok(Err(e)) => Err(ChaosError::Process(format!(
                "wait for {}: {e}",
                self.spec.member
            ))),
            Err(_) => {
                warn!(
                    "{} still running after {:?}, killing",
                    self.spec.member, self.spec.exit_timeout
                );
                self.terminate(false).await?;
                Ok(false)
            }
        }
    }

    async fn drain_io(&mut self) {
        for task in self.io_tasks.drain(..) {
            if let Err(e) = task.await {
                debug!("io forwarder ended abnormally: {}", e);
            }
        }
    }
}

fn forward_lines(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    recorder: RunRecorder,
    member: String,
    tag: &'static str,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            recorder.log_output(&format!("[{member}][{tag}] {line}"));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(role: Role) -> RoleSpec {
        RoleSpec {
            member: role.as_str().to_string(),
            role,
            transport: Transport::Tcp,
            namespace: "chaos-test".to_string(),
            bind_ip: Ipv4Addr::new(10, 231, 1, 1),
            store_dir: PathBuf::from("/tmp/store"),
            ready_file: Some(PathBuf::from("/tmp/ready.addr")),
            dial: Some("/ip4/10.231.1.2/tcp/4001".to_string()),
            run_ms: Some(20_000),
            exit_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn publisher_argv_dials() {
        let argv = node_argv(&spec(Role::Pub));
        assert_eq!(
            argv,
            vec![
                "pub",
                "tcp",
                "10.231.1.1",
                "/tmp/store",
                "/ip4/10.231.1.2/tcp/4001"
            ]
        );
    }

    #[test]
    fn subscriber_argv_announces() {
        let argv = node_argv(&spec(Role::Sub));
        assert_eq!(
            argv,
            vec!["sub", "tcp", "10.231.1.1", "/tmp/store", "/tmp/ready.addr"]
        );
    }

    #[test]
    fn relay_argv_carries_ready_dial_and_duration() {
        let argv = node_argv(&spec(Role::Relay));
        assert_eq!(
            argv,
            vec![
                "relay",
                "tcp",
                "10.231.1.1",
                "/tmp/store",
                "/tmp/ready.addr",
                "/ip4/10.231.1.2/tcp/4001",
                "20000"
            ]
        );
    }

    // A 20 s scenario must hand the relay 20000, not 20; the node reads
    // this argument in milliseconds.
    #[test]
    fn relay_duration_argument_is_in_milliseconds() {
        let mut relay = spec(Role::Relay);
        relay.run_ms = Some(Duration::from_secs(20).as_millis() as u64);
        let argv = node_argv(&relay);
        assert_eq!(argv.last().map(String::as_str), Some("20000"));
    }

    #[tokio::test]
    async fn ready_poll_returns_as_soon_as_the_artifact_appears() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub.addr");
        std::fs::write(&path, "").unwrap();

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            std::fs::write(&writer_path, "/ip4/10.231.1.2/tcp/4001\n").unwrap();
        });

        let started = std::time::Instant::now();
        let address = poll_ready_file(&path, 50, Duration::from_millis(20)).await;
        assert_eq!(address.as_deref(), Some("/ip4/10.231.1.2/tcp/4001"));
        // Returned early, not after the full 50 * 20ms budget.
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn ready_poll_is_bounded_by_its_attempt_budget() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("never.addr");

        let started = std::time::Instant::now();
        let result = poll_ready_file(&path, 4, Duration::from_millis(10)).await;
        assert!(result.is_none());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(400));
    }

    // Lifecycle signals work on any process; use a plain `sleep` child so
    // the test needs no namespaces or privileges.
    #[tokio::test]
    async fn pause_resume_terminate_transitions() {
        let out = TempDir::new().unwrap();
        let recorder = RunRecorder::begin(out.path(), "pair", "tcp", 1).unwrap();

        let child = Command::new("sleep")
            .arg("30")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let mut process = RoleProcess {
            spec: spec(Role::Sub),
            node_bin: "sleep".to_string(),
            netns_base_dir: PathBuf::from("/var/run/netns"),
            recorder: recorder.clone(),
            child,
            pid,
            state: ProcessState::Spawned,
            io_tasks: Vec::new(),
        };

        process.pause().unwrap();
        assert_eq!(process.state(), ProcessState::Paused);
        process.resume().unwrap();
        assert_eq!(process.state(), ProcessState::Running);
        process.terminate(false).await.unwrap();
        assert_eq!(process.state(), ProcessState::TerminatedHard);
    }
}
