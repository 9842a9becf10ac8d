use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use poptun_app_utils::Tap;
use poptun_core::{Endpoint, Tunnel, TunnelType};

mod args;
mod tic;

use args::{Args, Mode};

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::from(1),
            };
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    if let Mode::Tic {
        user: Some(_),
        password: None,
        ..
    }
    | Mode::Tic {
        user: None,
        password: Some(_),
        ..
    } = &args.mode
    {
        eprintln!("tic mode needs both a user and a password");
        return ExitCode::from(1);
    }

    match run(&args.mode) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "error running the tunnel, check permissions");
            ExitCode::from(255)
        }
    }
}

/// Turn the selected mode into an endpoint descriptor. The test modes mirror
/// the addresses the loopback test servers expect.
fn build_endpoint(mode: &Mode) -> Result<Endpoint> {
    Ok(match mode {
        Mode::Ether {
            remote_ipv4,
            remote_port,
        } => {
            let mut ep = Endpoint::new(TunnelType::Ether);
            ep.remote_ipv4 = *remote_ipv4;
            ep.remote_port = *remote_port;
            ep
        }
        Mode::Tic {
            user: Some(user),
            password: Some(password),
            server,
        } => tic::fetch_endpoint(user, password, server)?,
        Mode::Tic { .. } => {
            let mut ep = Endpoint::new(TunnelType::Ayiya);
            ep.remote_ipv4 = Ipv4Addr::LOCALHOST;
            ep.remote_port = 1234;
            ep.local_ipv6 = "2001::1".parse()?;
            ep.remote_ipv6 = "::1".parse()?;
            ep.local_prefix = 64;
            ep
        }
        Mode::V4v6 => {
            let mut ep = Endpoint::new(TunnelType::V4V6);
            ep.local_ipv4 = Ipv4Addr::new(10, 0, 1, 2);
            ep.remote_ipv6 = "::1".parse()?;
            ep.local_prefix = 30;
            ep
        }
        Mode::V4v6test => {
            let mut ep = Endpoint::new(TunnelType::V4V6);
            ep.remote_ipv6 = "2001::2".parse()?;
            ep.local_ipv4 = Ipv4Addr::new(10, 0, 0, 1);
            ep.local_prefix = 24;
            ep
        }
        Mode::V6v4test => {
            let mut ep = Endpoint::new(TunnelType::V6V4);
            ep.local_ipv6 = "2001::1".parse()?;
            ep.remote_ipv4 = Ipv4Addr::LOCALHOST;
            ep.local_prefix = 64;
            ep
        }
    })
}

fn run(mode: &Mode) -> Result<()> {
    let endpoint = build_endpoint(mode)?;

    let interface = Tap::open(endpoint.ifname()).context("opening the TAP device")?;
    let tunnel =
        Tunnel::new(endpoint, Arc::new(interface)).context("initializing the tunnel")?;
    tunnel.start().context("starting the tunnel")?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("installing the termination handler")?;
    }

    info!("tunnel up");
    while running.load(Ordering::SeqCst) && tunnel.running() {
        thread::sleep(Duration::from_secs(1));
    }

    info!("shutting down");
    tunnel.stop().context("stopping the tunnel")?;
    Ok(())
}
