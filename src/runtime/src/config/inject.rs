//! Deterministic IP address allocation for unassigned interfaces.
//!
//! Runs after validation. Each bridge owns `ip/prefix`; unassigned interfaces
//! (`0.0.0.0`) get an address derived from a SHA-256 hash of the service and
//! interface names, probed forward within the subnet's host range until free.
//! The assignment is a pure function of the configuration.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use sha2::{Digest, Sha256};

use sloop_core::error::{ConfigPhase, Error, Result};
use sloop_core::model::Config;

/// First four bytes of SHA-256 over `input`, big-endian.
fn hash_bits(input: &str) -> u32 {
    let digest = Sha256::digest(input.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Pick a free address in `[start+1, end)`, starting at the hashed candidate
/// and rolling forward. Fails only when every host address is taken.
fn allocate(taken: &mut BTreeSet<u64>, start: u64, end: u64, key: &str) -> Result<u64> {
    let usable = end - start - 1;
    let mask = end - start - 2;
    let mut candidate = start + 1 + (u64::from(hash_bits(key)) & mask);
    if candidate >= end {
        candidate = start + 1;
    }
    let mut probed: u64 = 0;
    while taken.contains(&candidate) {
        probed += 1;
        if probed >= usable {
            return Err(Error::ip(format!(
                "subnet exhausted while assigning an address for {key}"
            )));
        }
        candidate += 1;
        if candidate >= end {
            candidate = start + 1;
        }
    }
    taken.insert(candidate);
    Ok(candidate)
}

/// Resolve every unassigned interface address in `config`, in place.
///
/// Explicitly assigned addresses are seeded first and checked against the
/// bridge's subnet; conflicts are configuration errors, exhaustion is an IP
/// error.
pub fn inject_ips(config: &mut Config) -> Result<()> {
    let Config {
        bridges, services, ..
    } = config;

    for bridge in bridges.values() {
        let (start, end) = bridge.subnet_range()?;
        let mut taken: BTreeSet<u64> = BTreeSet::new();
        taken.insert(u64::from(u32::from(bridge.ip)));

        for (sname, svc) in services.iter() {
            for (iname, iface) in &svc.net.interfaces {
                if iface.bridge.name != bridge.name || iface.is_unassigned() {
                    continue;
                }
                let ip = u64::from(u32::from(iface.ip));
                if ip <= start || ip >= end {
                    return Err(Error::config(
                        ConfigPhase::Validate,
                        format!(
                            "interface {iname} of service {sname}: {} is outside the subnet of bridge {}",
                            iface.ip, bridge.name
                        ),
                    ));
                }
                if !taken.insert(ip) {
                    return Err(Error::config(
                        ConfigPhase::Validate,
                        format!(
                            "interface {iname} of service {sname}: {} is already assigned in bridge {}",
                            iface.ip, bridge.name
                        ),
                    ));
                }
            }
        }

        for svc in services.values_mut() {
            let host = svc.name.clone();
            for iface in svc.net.interfaces.values_mut() {
                if iface.bridge.name != bridge.name || !iface.is_unassigned() {
                    continue;
                }
                let key = format!("{host}{}", iface.name);
                let addr = allocate(&mut taken, start, end, &key)?;
                iface.ip = Ipv4Addr::from(addr as u32);
            }
        }
    }
    Ok(())
}
