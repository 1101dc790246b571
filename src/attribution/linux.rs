// Linux procfs-based connection enumeration

use anyhow::Result;
use procfs::process::{all_processes, FDTarget};
use std::collections::HashMap;
use std::net::SocketAddr;

use super::{ConnectionEnumerator, SocketOwner};
use crate::models::flow::{ProcessIdentity, Protocol};

/// Enumerator using the Linux /proc filesystem
///
/// Socket inodes are collected from /proc/[pid]/fd/ and joined with
/// /proc/net/{tcp,tcp6,udp,udp6}.
pub struct ProcfsEnumerator;

impl ProcfsEnumerator {
    pub fn new() -> Self {
        Self
    }

    /// Socket inode -> owning process
    fn socket_inodes() -> Result<HashMap<u64, ProcessIdentity>> {
        let mut inodes = HashMap::new();

        for process in all_processes()?.flatten() {
            let pid = process.pid();
            let name = match process.stat() {
                Ok(stat) => stat.comm,
                Err(_) => format!("PID {}", pid),
            };

            // Processes we may not inspect are skipped rather than failing the refresh
            let Ok(fds) = process.fd() else { continue };
            for fd in fds.flatten() {
                if let FDTarget::Socket(inode) = fd.target {
                    inodes.entry(inode).or_insert_with(|| ProcessIdentity {
                        pid: pid as u32,
                        name: name.clone(),
                    });
                }
            }
        }

        Ok(inodes)
    }
}

impl Default for ProcfsEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionEnumerator for ProcfsEnumerator {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn enumerate(&self) -> Result<Vec<SocketOwner>> {
        let inodes = Self::socket_inodes()?;
        let mut owners = Vec::new();

        let mut push = |local: SocketAddr, inode: u64, protocol: Protocol| {
            if let Some(process) = inodes.get(&inode) {
                owners.push(SocketOwner {
                    local_addr: local.ip(),
                    local_port: local.port(),
                    protocol,
                    process: process.clone(),
                });
            }
        };

        for entry in procfs::net::tcp()?.into_iter().chain(procfs::net::tcp6().unwrap_or_default()) {
            push(entry.local_address, entry.inode, Protocol::Tcp);
        }

        for entry in procfs::net::udp()?.into_iter().chain(procfs::net::udp6().unwrap_or_default()) {
            push(entry.local_address, entry.inode, Protocol::Udp);
        }

        Ok(owners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn finds_our_own_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let owners = ProcfsEnumerator::new().enumerate().unwrap();
        let ours = owners
            .iter()
            .find(|o| o.local_port == port && o.protocol == Protocol::Tcp)
            .expect("listener should be enumerated");
        assert_eq!(ours.process.pid, std::process::id());
    }
}
