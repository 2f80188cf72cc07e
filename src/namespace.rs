/// Namespace isolation for launched programs
/// Maps requested isolation kinds onto clone flags and applies them in the
/// forked child before the target program is executed.
use crate::types::{IsolationKind, IsolationSet, IsolationStage, Result};
use nix::errno::Errno;
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{getpid, sethostname};
use std::ffi::OsString;
use std::fs;
use std::path::Path;

/// Namespace isolation controller
#[derive(Clone, Debug)]
pub struct NamespaceIsolation {
    /// Namespaces to create
    isolation: IsolationSet,
    /// Hostname to assign inside the new UTS namespace
    hostname: Option<OsString>,
}

impl NamespaceIsolation {
    /// Create a new namespace isolation controller
    pub fn new(isolation: IsolationSet) -> Self {
        Self {
            isolation,
            hostname: None,
        }
    }

    pub fn with_hostname(mut self, hostname: Option<OsString>) -> Self {
        self.hostname = hostname;
        self
    }

    /// Check if every requested namespace kind exists on this system
    pub fn is_supported(&self) -> bool {
        self.iter_missing().next().is_none()
    }

    /// Requested kinds the running kernel does not expose
    pub fn iter_missing(&self) -> impl Iterator<Item = IsolationKind> + '_ {
        self.isolation
            .iter()
            .filter(|kind| !Path::new("/proc/self/ns").join(kind.proc_name()).exists())
    }

    /// Clone flags passed to `unshare(2)`
    pub fn clone_flags(&self) -> CloneFlags {
        self.isolation.clone_flags()
    }

    /// Apply namespace isolation (called in the child between fork and exec)
    ///
    /// Only async-signal-safe calls happen here: the parent may be
    /// multi-threaded, so nothing may allocate or take locks.
    pub fn apply_isolation(&self) -> std::result::Result<(), (IsolationStage, Errno)> {
        let clone_flags = self.clone_flags();
        if clone_flags.is_empty() {
            return Ok(());
        }

        // A single call lets the kernel create the user namespace first, so
        // the other namespaces are owned by it
        unshare(clone_flags).map_err(|e| (IsolationStage::Unshare, e))?;

        if self.isolation.contains(IsolationKind::Mount) {
            // Keep mounts made by the child from propagating back to the host
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_PRIVATE | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| (IsolationStage::MountPropagation, e))?;
        }

        if let Some(hostname) = &self.hostname {
            sethostname(hostname).map_err(|e| (IsolationStage::Hostname, e))?;
        }

        Ok(())
    }

    /// Get namespace information for debugging
    pub fn namespace_info(&self) -> Result<NamespaceInfo> {
        let mut namespaces = Vec::new();
        for kind in IsolationKind::ALL {
            let id = read_namespace_id(kind.proc_name())?;
            namespaces.push((kind, id));
        }

        Ok(NamespaceInfo {
            pid: getpid().as_raw() as u32,
            namespaces,
            requested: self.isolation,
        })
    }

    /// Check if any isolation is enabled
    pub fn is_isolation_enabled(&self) -> bool {
        !self.isolation.is_empty()
    }

    /// Get enabled namespaces as labels
    pub fn enabled_namespaces(&self) -> Vec<&'static str> {
        self.isolation.iter().map(IsolationKind::label).collect()
    }
}

/// Read the namespace identity link (e.g. `uts:[4026531838]`) of this process
pub fn read_namespace_id(ns_type: &str) -> Result<String> {
    let link = fs::read_link(format!("/proc/self/ns/{}", ns_type))?;
    Ok(link.to_string_lossy().to_string())
}

/// Namespace information for debugging and monitoring
#[derive(Debug, Clone)]
pub struct NamespaceInfo {
    /// Process ID
    pub pid: u32,
    /// Namespace identity of the current process, per kind
    pub namespaces: Vec<(IsolationKind, String)>,
    /// Kinds a launched child gets fresh copies of
    pub requested: IsolationSet,
}

impl std::fmt::Display for NamespaceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PID: {}, Namespaces: [", self.pid)?;
        for (i, (kind, id)) in self.namespaces.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", kind.label(), id)?;
        }
        write!(f, "], Isolation: {}", self.requested)
    }
}
