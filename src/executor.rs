/// Process launch with namespace isolation and directly inherited streams
use crate::namespace::NamespaceIsolation;
use crate::types::{IsolationStage, LaunchFailure, LaunchOutcome, LaunchRequest};
use log::{debug, info, log_enabled, warn, Level};
use nix::errno::Errno;
use std::ffi::OsString;
use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, ExitStatus, Stdio};

/// Runs one launch request to completion
pub trait Launch {
    fn launch(&self, request: &LaunchRequest) -> LaunchOutcome;
}

/// Where the child's standard streams are connected
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamPolicy {
    /// Share the invoking process's stdin, stdout and stderr
    #[default]
    Inherit,
    /// Connect all three to `/dev/null`
    Null,
}

impl StreamPolicy {
    fn stdio(self) -> Stdio {
        match self {
            StreamPolicy::Inherit => Stdio::inherit(),
            StreamPolicy::Null => Stdio::null(),
        }
    }
}

/// Launches programs in fresh namespaces and waits for them
#[derive(Clone, Debug, Default)]
pub struct Launcher {
    streams: StreamPolicy,
}

/// Stage tag followed by the native-endian errno
const REPORT_LEN: usize = 5;

impl Launcher {
    /// Create a launcher whose children inherit our standard streams
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_streams(mut self, streams: StreamPolicy) -> Self {
        self.streams = streams;
        self
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .stdin(self.streams.stdio())
            .stdout(self.streams.stdio())
            .stderr(self.streams.stdio());
        cmd
    }

    fn outcome_from_status(status: ExitStatus, program: &str) -> LaunchOutcome {
        if let Some(code) = status.code() {
            LaunchOutcome::Exited(code)
        } else if let Some(signal) = status.signal() {
            LaunchOutcome::Signaled {
                signal,
                core_dumped: status.core_dumped(),
            }
        } else {
            LaunchOutcome::Failed(LaunchFailure::Wait {
                program: program.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("unexpected wait status {}", status),
                ),
            })
        }
    }
}

impl Launch for Launcher {
    fn launch(&self, request: &LaunchRequest) -> LaunchOutcome {
        if let Err(failure) = request.validate() {
            return LaunchOutcome::Failed(failure);
        }

        let isolation = NamespaceIsolation::new(request.isolation)
            .with_hostname(request.hostname.clone().map(OsString::from));

        if !isolation.is_supported() {
            for kind in isolation.iter_missing() {
                warn!("{} namespaces are not available on this kernel", kind.label());
            }
        }
        if isolation.is_isolation_enabled() {
            debug!("isolating in new {} namespaces", isolation.enabled_namespaces().join(", "));
        }
        if log_enabled!(Level::Debug) {
            match isolation.namespace_info() {
                Ok(info) => debug!("launching from {}", info),
                Err(e) => debug!("namespace info unavailable: {}", e),
            }
        }

        // Setup failures inside the child are reported here, so a refused
        // unshare is not mistaken for a missing executable
        let (mut reader, writer) = match UnixStream::pair() {
            Ok(pair) => pair,
            Err(source) => {
                return LaunchOutcome::Failed(LaunchFailure::Setup {
                    program: request.program.clone(),
                    source,
                })
            }
        };
        let report_fd = writer.as_raw_fd();

        let mut cmd = self.command(request);
        unsafe {
            cmd.pre_exec(move || {
                if let Err((stage, errno)) = isolation.apply_isolation() {
                    report_isolation_failure(report_fd, stage, errno);
                    return Err(std::io::Error::from_raw_os_error(errno as i32));
                }
                Ok(())
            });
        }

        debug!(
            "spawning {:?} {:?} with isolation {}",
            request.program, request.args, request.isolation
        );
        let spawned = cmd.spawn();
        drop(writer);

        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                if let Some((stage, errno)) = read_isolation_failure(&mut reader) {
                    warn!("kernel refused {} for `{}`: {}", stage, request.program, errno);
                    return LaunchOutcome::Failed(LaunchFailure::IsolationDenied {
                        isolation: request.isolation,
                        stage,
                        errno,
                    });
                }
                warn!("failed to start `{}`: {}", request.program, source);
                return LaunchOutcome::Failed(LaunchFailure::Setup {
                    program: request.program.clone(),
                    source,
                });
            }
        };
        drop(reader);

        info!(
            "started `{}` as pid {} (isolation: {})",
            request.program,
            child.id(),
            request.isolation
        );

        let outcome = match child.wait() {
            Ok(status) => Self::outcome_from_status(status, &request.program),
            Err(source) => LaunchOutcome::Failed(LaunchFailure::Wait {
                program: request.program.clone(),
                source,
            }),
        };
        info!("`{}` finished: {:?}", request.program, outcome);
        outcome
    }
}

fn stage_tag(stage: IsolationStage) -> u8 {
    match stage {
        IsolationStage::Unshare => 1,
        IsolationStage::MountPropagation => 2,
        IsolationStage::Hostname => 3,
    }
}

fn stage_from_tag(tag: u8) -> Option<IsolationStage> {
    match tag {
        1 => Some(IsolationStage::Unshare),
        2 => Some(IsolationStage::MountPropagation),
        3 => Some(IsolationStage::Hostname),
        _ => None,
    }
}

/// Runs in the forked child: no allocation, a single write(2)
fn report_isolation_failure(fd: RawFd, stage: IsolationStage, errno: Errno) {
    let code = (errno as i32).to_ne_bytes();
    let buf: [u8; REPORT_LEN] = [stage_tag(stage), code[0], code[1], code[2], code[3]];
    unsafe {
        libc::write(fd, buf.as_ptr().cast(), buf.len());
    }
}

/// Called after a failed spawn, when the child has already exited
fn read_isolation_failure(reader: &mut UnixStream) -> Option<(IsolationStage, Errno)> {
    reader.set_nonblocking(true).ok()?;
    let mut buf = [0u8; REPORT_LEN];
    match reader.read(&mut buf) {
        Ok(REPORT_LEN) => {
            let stage = stage_from_tag(buf[0])?;
            let code = i32::from_ne_bytes([buf[1], buf[2], buf[3], buf[4]]);
            Some((stage, Errno::from_i32(code)))
        }
        _ => None,
    }
}
