//! Debian ENI (Ethernet Network Interfaces) stanza for the seed meta-data
//!
//! The NoCloud datasource accepts a `network-interfaces` block in
//! /etc/network/interfaces format.

use crate::DeployError;
use crate::deployment::{Addressing, NetworkSpec, parse_cidr};

/// Render the interfaces stanza for the selected guest interface
pub fn render_interfaces(network: &NetworkSpec) -> Result<String, DeployError> {
    let name = &network.interface;
    let mut lines = vec![format!("auto {}", name)];

    match &network.addressing {
        Addressing::Dhcp => {
            lines.push(format!("iface {} inet dhcp", name));
        }
        Addressing::Static {
            address,
            gateway,
            nameservers,
            search,
        } => {
            let (ip, mask) = parse_cidr(address)?;
            lines.push(format!("iface {} inet static", name));
            lines.push(format!("    address {}", ip));
            lines.push(format!("    netmask {}", mask));

            if let Some(gw) = gateway {
                lines.push(format!("    gateway {}", gw));
            }

            if !nameservers.is_empty() {
                lines.push(format!("    dns-nameservers {}", nameservers.join(" ")));
            }

            if !search.is_empty() {
                lines.push(format!("    dns-search {}", search.join(" ")));
            }
        }
    }

    Ok(lines.join("\n"))
}

/// Indent every line so the stanza fits a YAML block scalar
pub fn indent_block(text: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    text.lines()
        .map(|l| format!("{}{}", pad, l))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_dhcp() {
        let network = NetworkSpec::default();
        assert_eq!(
            render_interfaces(&network).unwrap(),
            "auto eth0\niface eth0 inet dhcp"
        );
    }

    #[test]
    fn test_render_static() {
        let network = NetworkSpec {
            interface: "ens18".to_string(),
            addressing: Addressing::Static {
                address: "192.168.1.10/24".to_string(),
                gateway: Some("192.168.1.1".to_string()),
                nameservers: vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()],
                search: vec!["example.com".to_string()],
            },
            ..Default::default()
        };

        let stanza = render_interfaces(&network).unwrap();
        assert!(stanza.contains("iface ens18 inet static"));
        assert!(stanza.contains("    address 192.168.1.10"));
        assert!(stanza.contains("    netmask 255.255.255.0"));
        assert!(stanza.contains("    gateway 192.168.1.1"));
        assert!(stanza.contains("    dns-nameservers 8.8.8.8 8.8.4.4"));
        assert!(stanza.contains("    dns-search example.com"));
    }

    #[test]
    fn test_indent_block() {
        assert_eq!(indent_block("a\nb", 2), "  a\n  b");
    }
}
