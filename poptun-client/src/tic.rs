//! Minimal TIC (Tunnel Information and Control) client.
//!
//! Logs in to a tunnel broker over a line-based TCP protocol, picks the
//! account's single tunnel, and turns the broker's description into an
//! [`Endpoint`]. Responses start with a three-digit code; 2xx is success.

use std::fmt::Write as _;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use md5::{Digest, Md5};
use tracing::{debug, info};

use poptun_core::{Endpoint, TunnelType};

const TIC_PORT: u16 = 3874;

/// Largest tolerated difference between our clock and the broker's.
const CLOCK_SKEW: i64 = 120;

/// Log in to `server` and fetch the endpoint of the account's tunnel.
///
/// When the account has several tunnels they are listed on stdout and an
/// error is returned; this client does not pick one on its own.
pub fn fetch_endpoint(user: &str, password: &str, server: &str) -> Result<Endpoint> {
    let mut tic = TicClient::connect(server)?;

    tic.check_clock()?;
    tic.authenticate(user, password)?;

    let tunnels = tic.list_tunnels()?;
    let tunnel_id = match tunnels.as_slice() {
        [] => {
            tic.quit("I didn't have any tunnels to select");
            bail!("no tunnel available, request one first");
        }
        [only] => only.clone(),
        many => {
            println!("Multiple tunnels available, pick one and configure it:");
            for tunnel in many {
                println!("{tunnel}");
            }
            tic.quit("User still needed to select a tunnel");
            bail!("account has several tunnels");
        }
    };
    let tunnel_id = tunnel_id
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("malformed tunnel list entry"))?
        .to_string();

    let endpoint = tic.show_tunnel(&tunnel_id)?;
    tic.quit("Tunnel configured, thanks");
    Ok(endpoint)
}

struct TicClient {
    stream: BufReader<TcpStream>,
}

impl TicClient {
    fn connect(server: &str) -> Result<Self> {
        let stream = TcpStream::connect((server, TIC_PORT))
            .with_context(|| format!("connecting to TIC server {server}"))?;
        let mut tic = Self {
            stream: BufReader::new(stream),
        };

        // Server banner, then our identification.
        tic.expect_ok()?;
        tic.request(&format!(
            "client TIC/draft-00 poptun/{} {}",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS
        ))?;
        Ok(tic)
    }

    fn send(&mut self, line: &str) -> Result<()> {
        debug!(line, "tic send");
        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\n")?;
        Ok(())
    }

    fn recv(&mut self) -> Result<(u16, String)> {
        let mut line = String::new();
        if self.stream.read_line(&mut line)? == 0 {
            bail!("TIC server closed the connection");
        }
        let line = line.trim_end();
        debug!(line, "tic recv");

        let (code, rest) = line
            .split_once(' ')
            .ok_or_else(|| anyhow!("malformed TIC response: {line}"))?;
        let code: u16 = code
            .parse()
            .with_context(|| format!("malformed TIC response code: {line}"))?;
        Ok((code, rest.to_string()))
    }

    /// Send a request and insist on a 2xx reply.
    fn request(&mut self, line: &str) -> Result<String> {
        self.send(line)?;
        self.expect_ok()
    }

    fn expect_ok(&mut self) -> Result<String> {
        let (code, rest) = self.recv()?;
        if !(200..300).contains(&code) {
            bail!("TIC server refused: {code} {rest}");
        }
        Ok(rest)
    }

    /// Multi-line responses end with a lone 202.
    fn read_block(&mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if self.stream.read_line(&mut line)? == 0 {
                bail!("TIC server closed the connection mid-listing");
            }
            let line = line.trim_end();
            if line.starts_with("202") {
                return Ok(lines);
            }
            lines.push(line.to_string());
        }
    }

    fn check_clock(&mut self) -> Result<()> {
        let server_time: i64 = self
            .request("get unixtime")?
            .split_whitespace()
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| anyhow!("malformed unixtime response"))?;
        let local_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let skew = local_time - server_time;
        if skew.abs() > CLOCK_SKEW {
            bail!("local clock is {skew} seconds off from the broker");
        }
        Ok(())
    }

    fn authenticate(&mut self, user: &str, password: &str) -> Result<()> {
        self.request(&format!("username {user}"))?;
        let challenge = self.request("challenge md5")?;
        let challenge = challenge
            .split_whitespace()
            .next()
            .ok_or_else(|| anyhow!("malformed challenge response"))?;

        // signature = md5(challenge ++ md5(password)), all lowercase hex.
        let password_hash = md5_hex(password.as_bytes());
        let signature = md5_hex(format!("{challenge}{password_hash}").as_bytes());
        self.request(&format!("authenticate md5 {signature}"))?;
        info!(user, "authenticated with the TIC broker");
        Ok(())
    }

    fn list_tunnels(&mut self) -> Result<Vec<String>> {
        self.send("tunnel list")?;
        self.expect_ok()?;
        self.read_block()
    }

    fn show_tunnel(&mut self, tunnel_id: &str) -> Result<Endpoint> {
        self.send(&format!("tunnel show {tunnel_id}"))?;
        self.expect_ok()?;
        let lines = self.read_block()?;

        let field = |name: &str| -> Option<String> {
            lines.iter().find_map(|line| {
                let (key, value) = line.split_once(':')?;
                (key.trim() == name).then(|| value.trim().to_string())
            })
        };
        let required = |name: &str| -> Result<String> {
            field(name).ok_or_else(|| anyhow!("tunnel description lacks {name}"))
        };

        let tunnel_type = required("Type")?;
        let mut endpoint = Endpoint::new(match tunnel_type.as_str() {
            "ayiya" => TunnelType::Ayiya,
            "6in4-heartbeat" => TunnelType::Heartbeat,
            "6in4" => TunnelType::V6V4,
            other => bail!("unsupported tunnel type {other}"),
        });

        endpoint.local_ipv6 = required("IPv6 Endpoint")?
            .parse()
            .context("IPv6 Endpoint")?;
        endpoint.remote_ipv6 = required("IPv6 POP")?.parse().context("IPv6 POP")?;
        endpoint.local_prefix = required("IPv6 PrefixLength")?
            .parse()
            .context("IPv6 PrefixLength")?;
        endpoint.local_mtu = required("Tunnel MTU")?.parse().context("Tunnel MTU")?;
        endpoint.remote_ipv4 = required("POP IPv4")?.parse().context("POP IPv4")?;

        if endpoint.tunnel_type != TunnelType::V6V4 {
            endpoint.password = required("Password")?;
            endpoint.beat_interval = required("Heartbeat_Interval")?
                .parse()
                .context("Heartbeat_Interval")?;
        }

        Ok(endpoint)
    }

    fn quit(&mut self, reason: &str) {
        let _ = self.send(&format!("QUIT {reason}"));
    }
}

fn md5_hex(input: &[u8]) -> String {
    let mut out = String::with_capacity(32);
    for byte in Md5::digest(input) {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_hex_reference() {
        // RFC 1321 test vector.
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }
}
