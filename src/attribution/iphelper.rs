// IP Helper connection enumeration (Windows)
//
// GetExtendedTcpTable / GetExtendedUdpTable return typed owner-pid tables, one
// call per address family. Process names come from sysinfo.

#![cfg_attr(not(target_os = "windows"), allow(dead_code))]

use std::net::IpAddr;

use crate::attribution::SocketOwner;
use crate::models::flow::{ProcessIdentity, Protocol};

/// MIB_TCP_STATE_TIME_WAIT
const TCP_STATE_TIME_WAIT: u32 = 11;

/// Pid the kernel reports for sockets no process holds anymore
const SYSTEM_IDLE_PID: u32 = 0;

/// One row of an owner-pid table, already converted to host order
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OwnerRow {
    pub protocol: Protocol,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub pid: u32,
    /// TCP state; UDP rows have none
    pub state: Option<u32>,
}

impl OwnerRow {
    /// Rows that still belong to a live process
    fn is_owned(&self) -> bool {
        self.pid != SYSTEM_IDLE_PID && self.state != Some(TCP_STATE_TIME_WAIT)
    }
}

/// Ports are stored in network order in the low 16 bits of a DWORD
pub(crate) fn network_port(raw: u32) -> u16 {
    u16::from_be(raw as u16)
}

/// Drop unowned rows and name the rest with `name_of`
pub(crate) fn owners_from_rows<F>(rows: Vec<OwnerRow>, name_of: F) -> Vec<SocketOwner>
where
    F: Fn(u32) -> Option<String>,
{
    rows.into_iter()
        .filter(OwnerRow::is_owned)
        .map(|row| SocketOwner {
            local_addr: row.local_addr,
            local_port: row.local_port,
            protocol: row.protocol,
            process: ProcessIdentity {
                pid: row.pid,
                name: name_of(row.pid).unwrap_or_else(|| format!("PID {}", row.pid)),
            },
        })
        .collect()
}

#[cfg(target_os = "windows")]
pub use self::windows_api::IpHelperEnumerator;

#[cfg(target_os = "windows")]
mod windows_api {
    use anyhow::{bail, Result};
    use log::debug;
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use sysinfo::{Pid, System};
    use windows::Win32::Foundation::{ERROR_INSUFFICIENT_BUFFER, NO_ERROR};
    use windows::Win32::NetworkManagement::IpHelper::{
        GetExtendedTcpTable, GetExtendedUdpTable, MIB_TCP6TABLE_OWNER_PID, MIB_TCPTABLE_OWNER_PID,
        MIB_UDP6TABLE_OWNER_PID, MIB_UDPTABLE_OWNER_PID, TCP_TABLE_OWNER_PID_ALL, UDP_TABLE_OWNER_PID,
    };
    use windows::Win32::Networking::WinSock::{AF_INET, AF_INET6};

    use super::{network_port, owners_from_rows, OwnerRow};
    use crate::attribution::{ConnectionEnumerator, SocketOwner};
    use crate::models::flow::Protocol;

    /// Tables can grow between the size query and the read
    const TABLE_ATTEMPTS: usize = 3;

    #[derive(Clone, Copy)]
    enum Table {
        Tcp,
        Udp,
    }

    /// Enumerator over the IP Helper owner-pid tables
    pub struct IpHelperEnumerator {
        system: Mutex<System>,
    }

    impl IpHelperEnumerator {
        pub fn new() -> Self {
            Self {
                system: Mutex::new(System::new_all()),
            }
        }
    }

    impl Default for IpHelperEnumerator {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ConnectionEnumerator for IpHelperEnumerator {
        fn name(&self) -> &'static str {
            "iphelper"
        }

        fn enumerate(&self) -> Result<Vec<SocketOwner>> {
            let mut rows = tcp4_rows()?;
            rows.extend(tcp6_rows()?);
            rows.extend(udp4_rows()?);
            rows.extend(udp6_rows()?);
            debug!("IP Helper reported {} sockets", rows.len());

            let mut system = self.system.lock();
            system.refresh_all();

            Ok(owners_from_rows(rows, |pid| {
                system
                    .process(Pid::from_u32(pid))
                    .map(|p| p.name().to_string_lossy().into_owned())
            }))
        }
    }

    /// Fetch one table into a u32-aligned buffer
    fn read_table(table: Table, family: u32) -> Result<Vec<u32>> {
        let mut size: u32 = 0;

        for _ in 0..TABLE_ATTEMPTS {
            let mut buffer = vec![0u32; (size as usize).div_ceil(4).max(1)];
            let ptr = Some(buffer.as_mut_ptr() as *mut _);

            let status = unsafe {
                match table {
                    Table::Tcp => {
                        GetExtendedTcpTable(ptr, &mut size, false, family, TCP_TABLE_OWNER_PID_ALL, 0)
                    }
                    Table::Udp => {
                        GetExtendedUdpTable(ptr, &mut size, false, family, UDP_TABLE_OWNER_PID, 0)
                    }
                }
            };

            if status == NO_ERROR.0 {
                return Ok(buffer);
            }
            if status != ERROR_INSUFFICIENT_BUFFER.0 {
                bail!("owner-pid table query failed with error code {}", status);
            }
        }

        bail!("owner-pid table kept growing during enumeration")
    }

    fn tcp4_rows() -> Result<Vec<OwnerRow>> {
        let buffer = read_table(Table::Tcp, AF_INET.0 as u32)?;
        let rows = unsafe {
            let table = &*(buffer.as_ptr() as *const MIB_TCPTABLE_OWNER_PID);
            std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize)
        };

        Ok(rows
            .iter()
            .map(|row| OwnerRow {
                protocol: Protocol::Tcp,
                local_addr: IpAddr::V4(Ipv4Addr::from(u32::from_be(row.dwLocalAddr))),
                local_port: network_port(row.dwLocalPort),
                pid: row.dwOwningPid,
                state: Some(row.dwState),
            })
            .collect())
    }

    fn tcp6_rows() -> Result<Vec<OwnerRow>> {
        let buffer = read_table(Table::Tcp, AF_INET6.0 as u32)?;
        let rows = unsafe {
            let table = &*(buffer.as_ptr() as *const MIB_TCP6TABLE_OWNER_PID);
            std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize)
        };

        Ok(rows
            .iter()
            .map(|row| OwnerRow {
                protocol: Protocol::Tcp,
                local_addr: IpAddr::V6(Ipv6Addr::from(row.ucLocalAddr)),
                local_port: network_port(row.dwLocalPort),
                pid: row.dwOwningPid,
                state: Some(row.dwState),
            })
            .collect())
    }

    fn udp4_rows() -> Result<Vec<OwnerRow>> {
        let buffer = read_table(Table::Udp, AF_INET.0 as u32)?;
        let rows = unsafe {
            let table = &*(buffer.as_ptr() as *const MIB_UDPTABLE_OWNER_PID);
            std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize)
        };

        Ok(rows
            .iter()
            .map(|row| OwnerRow {
                protocol: Protocol::Udp,
                local_addr: IpAddr::V4(Ipv4Addr::from(u32::from_be(row.dwLocalAddr))),
                local_port: network_port(row.dwLocalPort),
                pid: row.dwOwningPid,
                state: None,
            })
            .collect())
    }

    fn udp6_rows() -> Result<Vec<OwnerRow>> {
        let buffer = read_table(Table::Udp, AF_INET6.0 as u32)?;
        let rows = unsafe {
            let table = &*(buffer.as_ptr() as *const MIB_UDP6TABLE_OWNER_PID);
            std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize)
        };

        Ok(rows
            .iter()
            .map(|row| OwnerRow {
                protocol: Protocol::Udp,
                local_addr: IpAddr::V6(Ipv6Addr::from(row.ucLocalAddr)),
                local_port: network_port(row.dwLocalPort),
                pid: row.dwOwningPid,
                state: None,
            })
            .collect())
    }
}
