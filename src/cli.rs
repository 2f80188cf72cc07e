/// Command Line Interface for nsbox
use crate::executor::{Launch, Launcher};
use crate::report::ReportingLauncher;
use crate::signals::InterruptSource;
use crate::supervisor::{Supervisor, SupervisorState};
use crate::types::{IsolationKind, IsolationSet, LaunchRequest, Result, SupervisorConfig, WatchMode};
use clap::{Args, Parser, Subcommand};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "nsbox")]
#[command(version, about = "Run a program in fresh Linux namespaces and supervise it", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the first argument as an executable, passing it the remaining arguments
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Relaunch the program after every exit until interrupted
    #[arg(long)]
    pub watch: bool,

    /// Seconds to sleep between launches in watch mode
    #[arg(long, default_value_t = 5, value_name = "SECS")]
    pub interval: u64,

    /// Namespaces to create for the program
    #[arg(long = "ns", value_enum, value_delimiter = ',', default_values_t = [IsolationKind::Uts])]
    pub namespaces: Vec<IsolationKind>,

    /// Share every namespace with the host
    #[arg(long, conflicts_with_all = ["namespaces", "hostname"])]
    pub no_isolation: bool,

    /// Hostname to set inside the new UTS namespace
    #[arg(long)]
    pub hostname: Option<String>,

    /// Print a JSON report of every launch to stderr
    #[arg(long)]
    pub json: bool,

    /// Program to run, followed by its arguments
    #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true, value_name = "PROGRAM")]
    pub command: Vec<String>,
}

impl RunArgs {
    pub fn isolation(&self) -> IsolationSet {
        if self.no_isolation {
            IsolationSet::empty()
        } else {
            self.namespaces.iter().copied().collect()
        }
    }

    /// Build the launch request; the command is non-empty once clap accepted it
    pub fn launch_request(&self) -> LaunchRequest {
        let (program, args) = match self.command.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => (String::new(), Vec::new()),
        };
        let mut request = LaunchRequest::new(program)
            .with_args(args)
            .with_isolation(self.isolation());
        request.hostname = self.hostname.clone();
        request
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            mode: if self.watch { WatchMode::Watch } else { WatchMode::Single },
            interval: Duration::from_secs(self.interval),
        }
    }
}

/// Execute the `run` subcommand under `interrupts`
pub fn run<S: InterruptSource>(args: &RunArgs, interrupts: S) -> Result<()> {
    let request = args.launch_request();
    let config = args.supervisor_config();
    log::debug!("launch request: {:?}, config: {:?}", request, config);

    if args.json {
        supervise(ReportingLauncher::new(Launcher::new()), interrupts, config, &request)
    } else {
        supervise(Launcher::new(), interrupts, config, &request)
    }
}

fn supervise<L: Launch, S: InterruptSource>(
    launcher: L,
    interrupts: S,
    config: SupervisorConfig,
    request: &LaunchRequest,
) -> Result<()> {
    Supervisor::new(launcher, interrupts, config)
        .with_observer(|state| {
            if let Some(line) = progress_line(state) {
                println!("{}", line);
            }
        })
        .run(request)
}

/// What the user sees on stdout for a supervisor state, if anything
fn progress_line(state: SupervisorState) -> Option<&'static str> {
    match state {
        SupervisorState::Sleeping => Some("sleeping..."),
        _ => None,
    }
}
