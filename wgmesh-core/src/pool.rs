//! CIDR-bounded IPv4 address pool.
//!
//! Allocation state lives entirely in memory. There is no durable log: after
//! a control-plane restart the pool starts empty and is rebuilt by
//! re-reserving the addresses already recorded on node objects.

use ipnet::Ipv4Net;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::error::{MeshError, MeshResult};

/// Pool of allocatable IPv4 addresses drawn from a fixed subnet.
///
/// An address is either free or allocated, never both: allocating a held
/// address fails with [`MeshError::AlreadyExists`], and releasing a free
/// address is a caller error rather than a silent no-op.
#[derive(Debug, Clone)]
pub struct MeshPool {
    subnet: Ipv4Net,
    reserved: BTreeSet<Ipv4Addr>,
    allocated: BTreeSet<Ipv4Addr>,
}

impl MeshPool {
    /// Create an empty pool over `subnet`, never handing out addresses in
    /// `reserved`.
    pub fn new(subnet: Ipv4Net, reserved: BTreeSet<Ipv4Addr>) -> MeshResult<Self> {
        for ip in &reserved {
            if !subnet.contains(ip) {
                return Err(MeshError::InvalidConfiguration {
                    message: format!("Reserved address {} is not within subnet {}", ip, subnet),
                });
            }
        }

        Ok(Self {
            subnet,
            reserved,
            allocated: BTreeSet::new(),
        })
    }

    /// Inclusive numeric bounds of the allocatable host range. Network and
    /// broadcast addresses are excluded; /31 and /32 have no such addresses
    /// and use the full subnet.
    fn host_range(&self) -> (u32, u32) {
        let network = u32::from(self.subnet.network());
        let broadcast = u32::from(self.subnet.broadcast());
        if self.subnet.prefix_len() >= 31 {
            (network, broadcast)
        } else {
            (network + 1, broadcast - 1)
        }
    }

    fn in_host_range(&self, ip: Ipv4Addr) -> bool {
        let (first, last) = self.host_range();
        (first..=last).contains(&u32::from(ip))
    }

    /// The subnet this pool draws from.
    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    /// Total number of allocatable addresses.
    pub fn capacity(&self) -> u64 {
        let (first, last) = self.host_range();
        let reserved_in_range = self
            .reserved
            .iter()
            .filter(|ip| self.in_host_range(**ip))
            .count() as u64;
        (last - first + 1) as u64 - reserved_in_range
    }

    /// Number of currently allocated addresses.
    pub fn allocated_count(&self) -> u64 {
        self.allocated.len() as u64
    }

    /// Whether `ip` is allocatable right now.
    pub fn is_free(&self, ip: Ipv4Addr) -> bool {
        self.in_host_range(ip) && !self.reserved.contains(&ip) && !self.allocated.contains(&ip)
    }

    /// Mark a specific address allocated.
    pub fn allocate(&mut self, ip: Ipv4Addr) -> MeshResult<()> {
        if !self.in_host_range(ip) {
            return Err(MeshError::InvalidOperation {
                operation: "allocate".to_string(),
                reason: format!("address {} is not allocatable in subnet {}", ip, self.subnet),
            });
        }

        if self.reserved.contains(&ip) {
            return Err(MeshError::InvalidOperation {
                operation: "allocate".to_string(),
                reason: format!("address {} is reserved", ip),
            });
        }

        if !self.allocated.insert(ip) {
            return Err(MeshError::AlreadyExists {
                resource: format!("address {}", ip),
            });
        }

        Ok(())
    }

    /// Allocate the lowest free address in the pool.
    pub fn allocate_next(&mut self) -> MeshResult<Ipv4Addr> {
        let (first, last) = self.host_range();
        for value in first..=last {
            let ip = Ipv4Addr::from(value);
            if !self.reserved.contains(&ip) && !self.allocated.contains(&ip) {
                self.allocated.insert(ip);
                return Ok(ip);
            }
        }

        Err(MeshError::ResourceExhausted {
            resource: format!("address pool {}", self.subnet),
        })
    }

    /// Return an allocated address to the pool.
    pub fn release(&mut self, ip: Ipv4Addr) -> MeshResult<()> {
        if !self.allocated.remove(&ip) {
            return Err(MeshError::InvalidOperation {
                operation: "release".to_string(),
                reason: format!("address {} is not allocated", ip),
            });
        }

        Ok(())
    }
}
