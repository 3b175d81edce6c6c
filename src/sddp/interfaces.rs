/*!
Local interface enumeration: the `(ip, interface_name)` pairs the engine
binds to, ordered so that the most useful address for a controller to
receive responses on sorts first.

Priority order (ascending, lowest sorts first): addresses on the
default-gateway interface (0), everything else (1), IPv4 addresses
beginning with `172.` (2, deprioritizing container bridge networks),
loopback addresses (3). Ties within a priority are broken by `(ip,
interface name)` so the ordering is deterministic.
*/

use std::net::IpAddr;

use pnet::datalink;

/// Which address family to enumerate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// Returns the local `(ip, interface_name)` pairs for `family`, sorted so
/// the preferred bind address comes first. Loopback addresses are
/// included unless `include_loopback` is false. A failure to determine
/// the default gateway is not an error: enumeration proceeds as though
/// there were no default-gateway interface.
pub fn local_ip_addresses_and_interfaces(
    family: AddressFamily,
    include_loopback: bool,
) -> Vec<(IpAddr, String)> {
    let default_gateway_ifname = default_gateway_interface_name(family);

    let mut with_priority: Vec<(u8, IpAddr, String)> = Vec::new();
    for interface in datalink::interfaces() {
        for ip_network in &interface.ips {
            let ip = ip_network.ip();
            let matches_family = match family {
                AddressFamily::V4 => ip.is_ipv4(),
                AddressFamily::V6 => ip.is_ipv6(),
            };
            if !matches_family {
                continue;
            }
            let is_loopback = ip.is_loopback();
            if is_loopback && !include_loopback {
                continue;
            }
            let priority = if Some(&interface.name) == default_gateway_ifname.as_ref() {
                0
            } else if is_loopback {
                3
            } else if matches!(ip, IpAddr::V4(v4) if v4.octets()[0] == 172) {
                2
            } else {
                1
            };
            with_priority.push((priority, ip, interface.name.clone()));
        }
    }
    with_priority.sort_by(|a, b| a.cmp(b));
    with_priority
        .into_iter()
        .map(|(_, ip, name)| (ip, name))
        .collect()
}

/// Convenience: just the IP addresses, in the same preference order.
pub fn local_ip_addresses(family: AddressFamily, include_loopback: bool) -> Vec<IpAddr> {
    local_ip_addresses_and_interfaces(family, include_loopback)
        .into_iter()
        .map(|(ip, _)| ip)
        .collect()
}

/// The name of the interface carrying the default route for `family`, if
/// one can be determined. Never fails the caller: an inability to read
/// the routing table is treated as "no default gateway".
fn default_gateway_interface_name(family: AddressFamily) -> Option<String> {
    let interface = default_net::get_default_interface().ok()?;
    let has_addr_in_family = match family {
        AddressFamily::V4 => !interface.ipv4.is_empty(),
        AddressFamily::V6 => !interface.ipv6.is_empty(),
    };
    if has_addr_in_family || interface.gateway.is_some() {
        Some(interface.name)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_excluded_when_requested() {
        let with_loopback = local_ip_addresses_and_interfaces(AddressFamily::V4, true);
        let without_loopback = local_ip_addresses_and_interfaces(AddressFamily::V4, false);
        assert!(without_loopback.len() <= with_loopback.len());
        assert!(without_loopback.iter().all(|(ip, _)| !ip.is_loopback()));
    }

    #[test]
    fn ordering_is_deterministic() {
        let first = local_ip_addresses_and_interfaces(AddressFamily::V4, true);
        let second = local_ip_addresses_and_interfaces(AddressFamily::V4, true);
        assert_eq!(first, second);
    }
}
