/// Core types and structures for the nsbox launcher
use clap::ValueEnum;
use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Kernel namespace classes a launched program can be isolated in
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IsolationKind {
    /// Hostname and NIS domain name
    Uts,
    /// Process ID number space
    Pid,
    /// Mount points
    Mount,
    /// Network devices, stacks and ports
    Network,
    /// System V IPC and POSIX message queues
    Ipc,
    /// User and group ID mappings
    User,
}

impl IsolationKind {
    /// Every kind, in bit order
    pub const ALL: [IsolationKind; 6] = [
        IsolationKind::Uts,
        IsolationKind::Pid,
        IsolationKind::Mount,
        IsolationKind::Network,
        IsolationKind::Ipc,
        IsolationKind::User,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// The `CLONE_NEW*` flag creating a namespace of this kind
    pub fn clone_flag(self) -> CloneFlags {
        match self {
            IsolationKind::Uts => CloneFlags::CLONE_NEWUTS,
            IsolationKind::Pid => CloneFlags::CLONE_NEWPID,
            IsolationKind::Mount => CloneFlags::CLONE_NEWNS,
            IsolationKind::Network => CloneFlags::CLONE_NEWNET,
            IsolationKind::Ipc => CloneFlags::CLONE_NEWIPC,
            IsolationKind::User => CloneFlags::CLONE_NEWUSER,
        }
    }

    /// Entry name under `/proc/<pid>/ns/`
    pub fn proc_name(self) -> &'static str {
        match self {
            IsolationKind::Uts => "uts",
            IsolationKind::Pid => "pid",
            IsolationKind::Mount => "mnt",
            IsolationKind::Network => "net",
            IsolationKind::Ipc => "ipc",
            IsolationKind::User => "user",
        }
    }

    /// Human readable name
    pub fn label(self) -> &'static str {
        match self {
            IsolationKind::Uts => "UTS",
            IsolationKind::Pid => "PID",
            IsolationKind::Mount => "Mount",
            IsolationKind::Network => "Network",
            IsolationKind::Ipc => "IPC",
            IsolationKind::User => "User",
        }
    }
}

/// Set of requested isolations, stored as a bitset keyed by `IsolationKind`
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "Vec<IsolationKind>", from = "Vec<IsolationKind>")]
pub struct IsolationSet(u8);

impl IsolationSet {
    /// No isolation at all; the child shares every namespace with us
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Only a fresh UTS namespace
    pub fn uts() -> Self {
        Self::empty().with(IsolationKind::Uts)
    }

    pub fn with(mut self, kind: IsolationKind) -> Self {
        self.insert(kind);
        self
    }

    pub fn insert(&mut self, kind: IsolationKind) {
        self.0 |= kind.bit();
    }

    pub fn remove(&mut self, kind: IsolationKind) {
        self.0 &= !kind.bit();
    }

    pub fn contains(&self, kind: IsolationKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = IsolationKind> {
        let set = *self;
        IsolationKind::ALL
            .into_iter()
            .filter(move |kind| set.contains(*kind))
    }

    /// Union of the clone flags of every kind in the set
    pub fn clone_flags(&self) -> CloneFlags {
        self.iter()
            .fold(CloneFlags::empty(), |flags, kind| flags | kind.clone_flag())
    }
}

impl FromIterator<IsolationKind> for IsolationSet {
    fn from_iter<I: IntoIterator<Item = IsolationKind>>(iter: I) -> Self {
        let mut set = Self::empty();
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

impl From<Vec<IsolationKind>> for IsolationSet {
    fn from(kinds: Vec<IsolationKind>) -> Self {
        kinds.into_iter().collect()
    }
}

impl From<IsolationSet> for Vec<IsolationKind> {
    fn from(set: IsolationSet) -> Self {
        set.iter().collect()
    }
}

impl fmt::Debug for IsolationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for IsolationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let labels: Vec<&str> = self.iter().map(IsolationKind::label).collect();
        f.write_str(&labels.join(","))
    }
}

/// One launch attempt, built once from already-parsed input
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Program to run, resolved through `PATH` when it has no slash
    pub program: String,
    /// Arguments passed to the program
    pub args: Vec<String>,
    /// Namespaces the program gets its own copy of
    pub isolation: IsolationSet,
    /// Hostname assigned inside the new UTS namespace
    pub hostname: Option<String>,
}

impl LaunchRequest {
    /// Request running `program` in a fresh UTS namespace
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            isolation: IsolationSet::uts(),
            hostname: None,
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

    pub fn with_isolation(mut self, isolation: IsolationSet) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Check the request before any OS resource is touched
    pub fn validate(&self) -> std::result::Result<(), LaunchFailure> {
        if self.program.is_empty() {
            return Err(LaunchFailure::InvalidRequest("empty program path".to_string()));
        }
        if self.program.contains('\0') || self.args.iter().any(|arg| arg.contains('\0')) {
            return Err(LaunchFailure::InvalidRequest(
                "program and arguments must not contain NUL bytes".to_string(),
            ));
        }
        if let Some(hostname) = &self.hostname {
            if !self.isolation.contains(IsolationKind::Uts) {
                return Err(LaunchFailure::InvalidRequest(
                    "a hostname can only be set inside a UTS namespace".to_string(),
                ));
            }
            // sethostname(2) rejects anything longer than HOST_NAME_MAX
            if hostname.is_empty() || hostname.len() > 64 || hostname.contains('\0') {
                return Err(LaunchFailure::InvalidRequest(format!(
                    "invalid hostname {:?}",
                    hostname
                )));
            }
        }
        Ok(())
    }
}

/// Step of the in-child setup that the kernel refused
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationStage {
    Unshare,
    MountPropagation,
    Hostname,
}

impl fmt::Display for IsolationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IsolationStage::Unshare => "unshare",
            IsolationStage::MountPropagation => "private mount propagation",
            IsolationStage::Hostname => "sethostname",
        })
    }
}

/// Why a launch attempt did not produce an exit status
#[derive(Error, Debug)]
pub enum LaunchFailure {
    #[error("invalid launch request: {0}")]
    InvalidRequest(String),

    #[error("failed to start `{program}`: {source}")]
    Setup {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("namespace isolation ({isolation}) denied during {stage}: {errno}")]
    IsolationDenied {
        isolation: IsolationSet,
        stage: IsolationStage,
        errno: Errno,
    },

    #[error("failed to wait for `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result of one launch attempt
#[derive(Debug)]
pub enum LaunchOutcome {
    /// The child ran and exited with this status
    Exited(i32),
    /// The child was terminated by a signal
    Signaled { signal: i32, core_dumped: bool },
    /// No exit status could be obtained
    Failed(LaunchFailure),
}

impl LaunchOutcome {
    pub fn success(&self) -> bool {
        matches!(self, LaunchOutcome::Exited(0))
    }

    /// Exit status if the child exited normally
    pub fn code(&self) -> Option<i32> {
        match self {
            LaunchOutcome::Exited(code) => Some(*code),
            _ => None,
        }
    }

    /// Collapse into a caller-facing result; only `Exited(0)` is success
    pub fn into_result(self) -> Result<()> {
        match self {
            LaunchOutcome::Exited(0) => Ok(()),
            LaunchOutcome::Exited(code) => Err(NsboxError::ChildNonZeroExit { code }),
            LaunchOutcome::Signaled { signal, core_dumped } => {
                Err(NsboxError::ChildKilledBySignal { signal, core_dumped })
            }
            LaunchOutcome::Failed(failure) => Err(NsboxError::Launch(failure)),
        }
    }
}

/// Printable name of a raw signal number
pub fn signal_name(signal: i32) -> String {
    match Signal::try_from(signal) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("signal {}", signal),
    }
}

fn describe_signal(signal: &i32, core_dumped: &bool) -> String {
    if *core_dumped {
        format!("{} (core dumped)", signal_name(*signal))
    } else {
        signal_name(*signal)
    }
}

/// How the supervisor repeats launches
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchMode {
    /// Launch once and report the result
    Single,
    /// Launch, sleep, relaunch until interrupted
    Watch,
}

/// Supervisor configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub mode: WatchMode,
    /// Pause between two watch-mode launches
    pub interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            mode: WatchMode::Single,
            interval: Duration::from_secs(5),
        }
    }
}

/// Custom error types for nsbox
#[derive(Error, Debug)]
pub enum NsboxError {
    #[error(transparent)]
    Launch(#[from] LaunchFailure),

    #[error("child exited with status {code}")]
    ChildNonZeroExit { code: i32 },

    #[error("child killed by {}", describe_signal(.signal, .core_dumped))]
    ChildKilledBySignal { signal: i32, core_dumped: bool },

    #[error("interrupt handling error: {0}")]
    Interrupts(#[from] Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NsboxError {
    /// Process exit status reporting this error, shell style
    pub fn exit_code(&self) -> i32 {
        match self {
            NsboxError::ChildNonZeroExit { code } => *code,
            NsboxError::ChildKilledBySignal { signal, .. } => 128 + signal,
            _ => 1,
        }
    }
}

/// Result type alias for nsbox operations
pub type Result<T> = std::result::Result<T, NsboxError>;
