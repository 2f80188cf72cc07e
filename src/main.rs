/// nsbox: run a program in fresh Linux namespaces and supervise it
///
/// The program inherits the terminal's standard streams. By default it gets
/// its own UTS namespace, so hostname changes stay inside.
///
/// # Usage
/// ```bash
/// nsbox run /bin/sh
/// nsbox run --ns user,uts --hostname box /bin/sh
/// nsbox run --watch --interval 5 ./build.sh
/// ```
use anyhow::{Context, Result};
use clap::Parser;
use nsbox::cli::{self, Cli, Commands};
use nsbox::signals::SigintSource;
use nsbox::types::{IsolationKind, NsboxError};

fn main() {
    env_logger::init();

    // Usage errors exit here, before anything is launched
    let cli = Cli::parse();

    match execute(cli) {
        Ok(()) => {}
        Err(e) => {
            let code = match e.downcast_ref::<NsboxError>() {
                Some(err) => {
                    eprintln!("nsbox: {}", err);
                    err.exit_code()
                }
                None => {
                    eprintln!("nsbox: {:#}", e);
                    1
                }
            };
            std::process::exit(code);
        }
    }
}

fn execute(command_line: Cli) -> Result<()> {
    // Must come before any other thread exists
    let interrupts = SigintSource::install().context("installing the SIGINT handler")?;

    match command_line.command {
        Commands::Run(args) => {
            let isolation = args.isolation();
            let is_root = unsafe { libc::geteuid() } == 0;
            if !is_root && !isolation.is_empty() && !isolation.contains(IsolationKind::User) {
                log::warn!("not running as root; namespace creation may be denied (try --ns user,uts)");
            }
            cli::run(&args, interrupts)?;
            Ok(())
        }
    }
}
