//! Clap CLI definitions for the microservice binary.

use centi_relay::backend::stream::DEFAULT_API_PORT;
use clap::Parser;

/// Centi microservice: JSON command relay over a framed stream transport.
#[derive(Parser, Debug)]
#[command(name = "centi-microservice", version, about)]
pub struct Cli {
    /// HTTP port the control plane talks to.
    #[arg(long, short = 'p', env = "CENTI_PORT", default_value_t = DEFAULT_API_PORT)]
    pub port: u16,

    /// Address to bind the HTTP and link listeners on.
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    /// Base port of the link listener; it binds `link_port + channel_no`.
    /// 0 picks an ephemeral port.
    #[arg(long, env = "CENTI_LINK_PORT", default_value_t = 7000)]
    pub link_port: u16,

    /// `host:port` of a nearby node, reported by discovery scans.
    /// May be repeated.
    #[arg(long = "neighbor", value_name = "ADDR")]
    pub neighbors: Vec<String>,
}
