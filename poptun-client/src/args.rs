use std::net::Ipv4Addr;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    about = "poptun - user-space IP tunneling client",
    version,
    after_help = concat!(
        "EXAMPLES:\n",
        "    poptun ether 198.51.100.1 5072\n",
        "    poptun tic alice@example.net s3cret\n",
        "    poptun v6v4test\n",
    )
)]
pub struct Args {
    /// Logging verbosity (trace, debug, info, warn, error)
    #[clap(long, default_value = "info", value_name = "LEVEL")]
    pub log_level: String,

    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Bridge raw Ethernet frames to a remote peer over UDP
    Ether {
        /// IPv4 address of the remote peer
        remote_ipv4: Ipv4Addr,
        /// UDP port of the remote peer
        remote_port: u16,
    },
    /// Log in to a TIC broker and run the tunnel it describes; without
    /// credentials a loopback AYIYA test endpoint is used instead
    Tic {
        /// Broker account name
        user: Option<String>,
        /// Broker account password
        password: Option<String>,
        /// TIC server to log in to
        #[clap(long, default_value = "tic.sixxs.net", value_name = "HOST")]
        server: String,
    },
    /// IPv4-in-IPv6 tunnel with built-in addresses
    V4v6,
    /// IPv4-in-IPv6 test endpoint
    V4v6test,
    /// 6in4 loopback test endpoint
    V6v4test,
}
