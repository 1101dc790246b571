// lsof-based connection enumeration (macOS and other BSD-like systems)

use anyhow::{Context, Result};
use log::debug;
use std::process::Command;

use super::{parse_endpoint, ConnectionEnumerator, SocketOwner};
use crate::models::flow::{ProcessIdentity, Protocol};

/// Enumerator shelling out to `lsof -i -n -P -F pcPn`
pub struct LsofEnumerator;

impl LsofEnumerator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LsofEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionEnumerator for LsofEnumerator {
    fn name(&self) -> &'static str {
        "lsof"
    }

    fn enumerate(&self) -> Result<Vec<SocketOwner>> {
        let output = Command::new("lsof")
            .args(["-i", "-n", "-P", "-F", "pcPn"])
            .output()
            .context("failed to run lsof")?;

        // lsof exits 1 when nothing matched, which is not an error here
        if !output.status.success() && !output.stderr.is_empty() {
            debug!("lsof stderr: {}", String::from_utf8_lossy(&output.stderr).trim());
        }

        Ok(parse_lsof_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse lsof field output
///
/// ```text
/// p1234                                  <- PID
/// cFirefox                               <- command name
/// f42                                    <- file descriptor, starts a new file
/// PTCP                                   <- protocol
/// n127.0.0.1:8080->93.184.216.34:80      <- local->remote
/// ```
pub fn parse_lsof_output(output: &str) -> Vec<SocketOwner> {
    let mut owners = Vec::new();
    let mut pid: Option<u32> = None;
    let mut command: Option<String> = None;
    let mut protocol: Option<Protocol> = None;

    for line in output.lines() {
        let mut chars = line.chars();
        let Some(marker) = chars.next() else { continue };
        let value = chars.as_str();

        match marker {
            'p' => {
                pid = value.parse().ok();
                command = None;
                protocol = None;
            }
            'c' => command = Some(value.to_string()),
            'f' => protocol = None,
            'P' => protocol = value.parse().ok(),
            'n' => {
                let (Some(pid), Some(command)) = (pid, command.as_ref()) else { continue };
                let local = value.split("->").next().unwrap_or(value);
                let Some((local_addr, local_port)) = parse_endpoint(local) else {
                    debug!("Skipping unparseable lsof endpoint '{}'", value);
                    continue;
                };

                owners.push(SocketOwner {
                    local_addr,
                    local_port,
                    // Connected sockets print a remote side; assume TCP when lsof gave no protocol
                    protocol: protocol.unwrap_or(if value.contains("->") { Protocol::Tcp } else { Protocol::Udp }),
                    process: ProcessIdentity {
                        pid,
                        name: command.clone(),
                    },
                });
            }
            _ => {}
        }
    }

    owners
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "p311\n\
cmDNSResponder\n\
f40\n\
PUDP\n\
n*:5353\n\
f41\n\
PUDP\n\
n[fe80::1%lo0]:5353\n\
p902\n\
cfirefox\n\
f88\n\
PTCP\n\
n192.168.1.20:51544->142.250.74.78:443\n\
f90\n\
n[::1]:6000\n";

    #[test]
    fn parses_processes_and_endpoints() {
        let owners = parse_lsof_output(SAMPLE);
        assert_eq!(owners.len(), 4);

        assert_eq!(owners[0].process.name, "mDNSResponder");
        assert_eq!(owners[0].local_port, 5353);
        assert!(owners[0].local_addr.is_unspecified());
        assert_eq!(owners[0].protocol, Protocol::Udp);

        assert_eq!(owners[2].process, ProcessIdentity { pid: 902, name: "firefox".to_string() });
        assert_eq!(owners[2].local_addr, "192.168.1.20".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(owners[2].protocol, Protocol::Tcp);

        // No protocol field and no remote side
        assert_eq!(owners[3].protocol, Protocol::Udp);
        assert_eq!(owners[3].local_port, 6000);
    }

    #[test]
    fn ignores_names_before_a_process_header() {
        assert!(parse_lsof_output("n127.0.0.1:80\n\n").is_empty());
    }
}
