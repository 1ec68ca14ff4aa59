//! Primary-interface selection.
//!
//! The server reports network state as an unordered map of interfaces; the
//! model wants a single primary IPv4/IPv6/MAC triple. The ranking below is a
//! total order, so the choice is deterministic for any reported set.

use std::collections::HashMap;

use virtstate_client::{AddressFamily, AddressScope, InstanceStateNetwork};

const LOOPBACK: &str = "lo";

/// Addresses resolved for one interface. Unresolved pieces stay `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkIdentity {
    pub interface: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub mac: Option<String>,
}

/// Pick the most-favored interface and extract its addresses.
///
/// Interfaces are ranked by: non-empty host name, then non-empty hardware
/// address, then a global inet address, then a global inet6 address; names
/// break remaining ties. Returns `None` for an empty map or when the winner
/// is the loopback interface.
pub fn find_addresses(
    network: &HashMap<String, InstanceStateNetwork>,
) -> Option<NetworkIdentity> {
    let (name, iface) = network.iter().max_by(|(a_name, a), (b_name, b)| {
        rank(a).cmp(&rank(b)).then_with(|| b_name.cmp(a_name))
    })?;

    if name == LOOPBACK {
        return None;
    }
    Some(get_addresses(name, iface))
}

/// Extract addresses from a caller-chosen interface, bypassing ranking.
pub fn get_addresses(name: &str, iface: &InstanceStateNetwork) -> NetworkIdentity {
    NetworkIdentity {
        interface: name.to_string(),
        ipv4: first_global(iface, AddressFamily::Inet),
        ipv6: first_global(iface, AddressFamily::Inet6),
        mac: (!iface.hwaddr.is_empty()).then(|| iface.hwaddr.clone()),
    }
}

/// Whether any non-loopback interface reports a global inet address; the
/// readiness condition for network waits.
pub fn has_global_inet(network: &HashMap<String, InstanceStateNetwork>) -> bool {
    network
        .iter()
        .filter(|(name, _)| name.as_str() != LOOPBACK)
        .any(|(_, iface)| first_global(iface, AddressFamily::Inet).is_some())
}

fn rank(iface: &InstanceStateNetwork) -> (bool, bool, bool, bool) {
    (
        !iface.host_name.is_empty(),
        !iface.hwaddr.is_empty(),
        first_global(iface, AddressFamily::Inet).is_some(),
        first_global(iface, AddressFamily::Inet6).is_some(),
    )
}

fn first_global(iface: &InstanceStateNetwork, family: AddressFamily) -> Option<String> {
    iface
        .addresses
        .iter()
        .find(|a| a.family == family && a.scope == AddressScope::Global)
        .map(|a| a.address.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtstate_client::NetworkAddress;

    fn iface(
        host_name: &str,
        hwaddr: &str,
        addresses: Vec<(AddressFamily, AddressScope, &str)>,
    ) -> InstanceStateNetwork {
        InstanceStateNetwork {
            addresses: addresses
                .into_iter()
                .map(|(family, scope, address)| NetworkAddress {
                    family,
                    address: address.to_string(),
                    netmask: String::new(),
                    scope,
                })
                .collect(),
            hwaddr: hwaddr.to_string(),
            host_name: host_name.to_string(),
            mtu: 1500,
            state: "up".to_string(),
        }
    }

    #[test]
    fn test_empty_map_finds_nothing() {
        assert_eq!(find_addresses(&HashMap::new()), None);
    }

    #[test]
    fn test_loopback_winner_is_rejected() {
        let network = HashMap::from([(
            "lo".to_string(),
            iface(
                "",
                "",
                vec![(AddressFamily::Inet, AddressScope::Local, "127.0.0.1")],
            ),
        )]);
        assert_eq!(find_addresses(&network), None);
    }

    #[test]
    fn test_host_visible_interface_beats_virtual() {
        let network = HashMap::from([
            (
                "lo".to_string(),
                iface(
                    "",
                    "",
                    vec![(AddressFamily::Inet, AddressScope::Local, "127.0.0.1")],
                ),
            ),
            (
                "docker0".to_string(),
                iface(
                    "",
                    "02:42:ac:11:00:01",
                    vec![(AddressFamily::Inet, AddressScope::Global, "172.17.0.1")],
                ),
            ),
            (
                "eth0".to_string(),
                iface(
                    "vethabc123",
                    "00:16:3e:aa:bb:cc",
                    vec![
                        (AddressFamily::Inet, AddressScope::Global, "10.0.0.5"),
                        (AddressFamily::Inet6, AddressScope::Link, "fe80::1"),
                        (AddressFamily::Inet6, AddressScope::Global, "fd42::5"),
                    ],
                ),
            ),
        ]);

        let identity = find_addresses(&network).unwrap();
        assert_eq!(identity.interface, "eth0");
        assert_eq!(identity.ipv4.as_deref(), Some("10.0.0.5"));
        assert_eq!(identity.ipv6.as_deref(), Some("fd42::5"));
        assert_eq!(identity.mac.as_deref(), Some("00:16:3e:aa:bb:cc"));
    }

    #[test]
    fn test_ties_break_by_name() {
        let network = HashMap::from([
            (
                "eth1".to_string(),
                iface(
                    "veth1",
                    "00:16:3e:00:00:02",
                    vec![(AddressFamily::Inet, AddressScope::Global, "10.0.0.2")],
                ),
            ),
            (
                "eth0".to_string(),
                iface(
                    "veth0",
                    "00:16:3e:00:00:01",
                    vec![(AddressFamily::Inet, AddressScope::Global, "10.0.0.1")],
                ),
            ),
        ]);
        assert_eq!(find_addresses(&network).unwrap().interface, "eth0");
    }

    #[test]
    fn test_get_addresses_ignores_non_global_scopes() {
        let identity = get_addresses(
            "eth0",
            &iface(
                "",
                "",
                vec![
                    (AddressFamily::Inet, AddressScope::Local, "127.0.0.1"),
                    (AddressFamily::Inet6, AddressScope::Link, "fe80::1"),
                ],
            ),
        );
        assert_eq!(identity.ipv4, None);
        assert_eq!(identity.ipv6, None);
        assert_eq!(identity.mac, None);
    }

    #[test]
    fn test_has_global_inet_skips_loopback() {
        let mut network = HashMap::from([(
            "lo".to_string(),
            iface(
                "",
                "",
                vec![(AddressFamily::Inet, AddressScope::Global, "127.0.0.1")],
            ),
        )]);
        assert!(!has_global_inet(&network));

        network.insert(
            "eth0".to_string(),
            iface(
                "veth0",
                "00:16:3e:00:00:01",
                vec![(AddressFamily::Inet, AddressScope::Global, "10.0.0.1")],
            ),
        );
        assert!(has_global_inet(&network));
    }
}
