// SiteLab: Coordinate Multi-Site Emulated Networks and Aggregate their Logs
// Copyright (C) 2022-2025 Tibor Schneider <sctibor@ethz.ch> and Roland Schmid <roschmi@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.


//! Derive the addresses of a site. The gateway always takes the first host offset of the subnet,
//! and the workers take the following offsets in order. Offset 0 (the network address) is never
//! used, and the broadcast address is not treated specially.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use thiserror::Error;

/// Host offset of the gateway in every subnet.
pub const GATEWAY_OFFSET: u32 = 1;

/// Addresses assigned to the nodes of one subnet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubnetAddresses {
    /// The subnet itself, with the host bits cleared.
    pub network: Ipv4Net,
    /// Address of the gateway (`.1`).
    pub gateway: Ipv4Addr,
    /// Addresses of the workers, starting at `.2`.
    pub workers: Vec<Ipv4Addr>,
}

impl SubnetAddresses {
    pub fn prefix_len(&self) -> u8 {
        self.network.prefix_len()
    }

    /// Gateway address together with the prefix length of the subnet.
    pub fn gateway_net(&self) -> Ipv4Net {
        with_prefix(self.gateway, self.network)
    }

    /// Address of each worker together with the prefix length of the subnet.
    pub fn worker_nets(&self) -> impl Iterator<Item = Ipv4Net> + '_ {
        self.workers
            .iter()
            .map(move |addr| with_prefix(*addr, self.network))
    }
}

fn with_prefix(addr: Ipv4Addr, network: Ipv4Net) -> Ipv4Net {
    // the prefix length comes from a valid network, so this cannot fail.
    Ipv4Net::new(addr, network.prefix_len()).unwrap_or(network)
}

/// Error while deriving addresses.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The requested host offset does not fit into the subnet.
    #[error("Subnet {subnet} has {available} host offsets, but offset {requested} is required")]
    SubnetTooSmall {
        subnet: Ipv4Net,
        requested: u64,
        available: u64,
    },
}

/// Compute the address at host offset `offset` of `subnet`. The host bits of the subnet's address
/// are ignored, so `10.5.3.7/16` and `10.5.0.0/16` yield the same addresses.
pub fn host_address(subnet: Ipv4Net, offset: u32) -> Result<Ipv4Addr, AddressError> {
    let available = u32::from(subnet.hostmask());
    if offset > available {
        return Err(AddressError::SubnetTooSmall {
            subnet: subnet.trunc(),
            requested: offset as u64,
            available: available as u64,
        });
    }
    Ok(Ipv4Addr::from(u32::from(subnet.network()) + offset))
}

/// Address of the gateway of `subnet`.
pub fn gateway_address(subnet: Ipv4Net) -> Result<Ipv4Addr, AddressError> {
    host_address(subnet, GATEWAY_OFFSET)
}

/// Derive the gateway address and the addresses of `count` workers in `subnet`.
///
/// The gateway is at offset 1, and worker `i` (counting from zero) at offset `i + 2`. This
/// function fails if the last worker does not fit into the subnet.
pub fn derive_addresses(subnet: Ipv4Net, count: usize) -> Result<SubnetAddresses, AddressError> {
    let available = u32::from(subnet.hostmask()) as u64;
    let last = count as u64 + GATEWAY_OFFSET as u64;
    if last > available {
        return Err(AddressError::SubnetTooSmall {
            subnet: subnet.trunc(),
            requested: last,
            available,
        });
    }

    let gateway = gateway_address(subnet)?;
    let workers = (0..count as u32)
        .map(|i| host_address(subnet, GATEWAY_OFFSET + 1 + i))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SubnetAddresses {
        network: subnet.trunc(),
        gateway,
        workers,
    })
}
