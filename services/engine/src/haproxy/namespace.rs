//! Network namespace plumbing for the VIP port

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::executor::{run_checked, CommandExecutor};
use crate::argv;
use crate::config::{HaproxySettings, InterfaceDriverType};
use crate::error::{LbaasError, Result};
use crate::network::{Port, Subnet};

pub const NS_PREFIX: &str = "nlbaas-";
const DEVICE_NAME_LEN: usize = 11;

pub fn namespace_name(lb_id: &str) -> String {
    format!("{}{}", NS_PREFIX, lb_id)
}

fn short(port_id: &str) -> &str {
    let end = port_id
        .char_indices()
        .nth(DEVICE_NAME_LEN)
        .map(|(i, _)| i)
        .unwrap_or(port_id.len());
    &port_id[..end]
}

/// Host-side device name for a port
pub fn device_name(port_id: &str) -> String {
    format!("tap{}", short(port_id))
}

pub struct NamespaceManager {
    executor: Arc<dyn CommandExecutor>,
    interface_driver: InterfaceDriverType,
    bridge: String,
    gratuitous_arp: u32,
}

impl NamespaceManager {
    pub fn new(executor: Arc<dyn CommandExecutor>, settings: &HaproxySettings) -> Self {
        Self {
            executor,
            interface_driver: settings.interface_driver,
            bridge: settings.ovs_integration_bridge.clone(),
            gratuitous_arp: settings.send_gratuitous_arp,
        }
    }

    /// Device name as seen inside the namespace
    pub fn inner_device(&self, port_id: &str) -> String {
        match self.interface_driver {
            InterfaceDriverType::OpenVswitch => device_name(port_id),
            InterfaceDriverType::LinuxBridge => format!("ns-{}", short(port_id)),
        }
    }

    async fn exec_in(&self, ns: &str, command: Vec<String>) -> Result<String> {
        let mut full = argv!["ip", "netns", "exec", ns];
        full.extend(command);
        run_checked(self.executor.as_ref(), &full).await
    }

    pub async fn exists(&self, ns: &str) -> Result<bool> {
        let listing = run_checked(self.executor.as_ref(), &argv!["ip", "netns", "list"]).await?;
        Ok(listing
            .lines()
            .filter_map(|l| l.split_whitespace().next())
            .any(|name| name == ns))
    }

    async fn ensure_namespace(&self, ns: &str) -> Result<()> {
        if !self.exists(ns).await? {
            run_checked(self.executor.as_ref(), &argv!["ip", "netns", "add", ns]).await?;
            self.exec_in(ns, argv!["ip", "link", "set", "lo", "up"]).await?;
        }
        Ok(())
    }

    /// Interface names inside the namespace, loopback excluded
    pub async fn devices(&self, ns: &str) -> Result<Vec<String>> {
        let output = self.exec_in(ns, argv!["ip", "-o", "link", "show"]).await?;
        Ok(output
            .lines()
            .filter_map(|line| line.split(':').nth(1))
            .map(|name| name.trim().split('@').next().unwrap_or_default().to_string())
            .filter(|name| !name.is_empty() && name != "lo")
            .collect())
    }

    async fn plug_device(&self, ns: &str, port: &Port) -> Result<()> {
        let device = device_name(&port.id);
        let inner = self.inner_device(&port.id);
        match self.interface_driver {
            InterfaceDriverType::OpenVswitch => {
                run_checked(
                    self.executor.as_ref(),
                    &argv![
                        "ovs-vsctl",
                        "--",
                        "--may-exist",
                        "add-port",
                        self.bridge,
                        device,
                        "--",
                        "set",
                        "Interface",
                        device,
                        "type=internal",
                        format!("external-ids:iface-id={}", port.id),
                        "external-ids:iface-status=active",
                        format!("external-ids:attached-mac={}", port.mac_address),
                    ],
                )
                .await?;
            }
            InterfaceDriverType::LinuxBridge => {
                run_checked(
                    self.executor.as_ref(),
                    &argv!["ip", "link", "add", device, "type", "veth", "peer", "name", inner],
                )
                .await?;
                run_checked(self.executor.as_ref(), &argv!["ip", "link", "set", device, "up"])
                    .await?;
            }
        }
        run_checked(
            self.executor.as_ref(),
            &argv!["ip", "link", "set", inner, "address", port.mac_address],
        )
        .await?;
        run_checked(
            self.executor.as_ref(),
            &argv!["ip", "link", "set", inner, "netns", ns],
        )
        .await?;
        Ok(())
    }

    /// Plug the VIP port into the LB namespace and configure its address
    pub async fn plug_vip(&self, lb_id: &str, port: &Port, subnet: &Subnet) -> Result<()> {
        let ns = namespace_name(lb_id);
        let inner = self.inner_device(&port.id);
        let address = port
            .fixed_ips
            .iter()
            .find(|ip| ip.subnet_id == subnet.id)
            .or_else(|| port.first_ip())
            .ok_or_else(|| LbaasError::BadRequest(format!("port {} has no fixed ip", port.id)))?
            .ip_address
            .clone();
        let cidr = format!("{}/{}", address, subnet.prefix_len()?);

        self.ensure_namespace(&ns).await?;
        if self.devices(&ns).await?.contains(&inner) {
            debug!(namespace = %ns, device = %inner, "VIP device already plugged");
        } else {
            self.plug_device(&ns, port).await?;
        }
        self.exec_in(&ns, argv!["ip", "link", "set", inner, "up"]).await?;
        self.exec_in(&ns, argv!["ip", "addr", "replace", cidr, "dev", inner])
            .await?;
        if let Some(gateway) = &subnet.gateway_ip {
            self.exec_in(
                &ns,
                argv!["ip", "route", "replace", "default", "via", gateway, "dev", inner],
            )
            .await?;
        }

        if self.gratuitous_arp > 0 {
            let arping = argv!["arping", "-U", "-I", inner, "-c", self.gratuitous_arp, address];
            if let Err(e) = self.exec_in(&ns, arping).await {
                warn!(namespace = %ns, error = %e, "Gratuitous ARP failed");
            }
        }
        info!(namespace = %ns, address = %cidr, "VIP plugged");
        Ok(())
    }

    async fn remove_device(&self, ns: &str, device: &str) -> Result<()> {
        match self.interface_driver {
            InterfaceDriverType::OpenVswitch => {
                run_checked(
                    self.executor.as_ref(),
                    &argv!["ovs-vsctl", "--if-exists", "del-port", self.bridge, device],
                )
                .await?;
            }
            InterfaceDriverType::LinuxBridge => {
                self.exec_in(ns, argv!["ip", "link", "delete", device]).await?;
            }
        }
        Ok(())
    }

    /// Remove the VIP device; errors are logged
    pub async fn unplug_vip(&self, lb_id: &str, port_id: &str) {
        let ns = namespace_name(lb_id);
        let device = match self.interface_driver {
            InterfaceDriverType::OpenVswitch => device_name(port_id),
            InterfaceDriverType::LinuxBridge => self.inner_device(port_id),
        };
        if let Err(e) = self.remove_device(&ns, &device).await {
            warn!(namespace = %ns, device = %device, error = %e, "Failed to unplug VIP device");
        }
    }

    /// Purge remaining devices and delete the namespace; errors are logged
    pub async fn cleanup(&self, lb_id: &str) {
        let ns = namespace_name(lb_id);
        match self.exists(&ns).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(namespace = %ns, error = %e, "Failed to list namespaces");
                return;
            }
        }
        match self.devices(&ns).await {
            Ok(devices) => {
                for device in devices {
                    if let Err(e) = self.remove_device(&ns, &device).await {
                        warn!(namespace = %ns, device = %device, error = %e, "Failed to purge device");
                    }
                }
            }
            Err(e) => warn!(namespace = %ns, error = %e, "Failed to list namespace devices"),
        }
        match run_checked(self.executor.as_ref(), &argv!["ip", "netns", "delete", ns]).await {
            Ok(_) => info!(namespace = %ns, "Namespace removed"),
            Err(e) => warn!(namespace = %ns, error = %e, "Failed to delete namespace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::haproxy::executor::fake::RecordingExecutor;
    use crate::haproxy::executor::CommandOutput;
    use crate::network::FixedIp;

    fn port() -> Port {
        Port {
            id: "0123456789abcdef".into(),
            name: "loadbalancer-lb1".into(),
            network_id: "net".into(),
            mac_address: "fa:16:3e:00:00:01".into(),
            fixed_ips: vec![FixedIp {
                subnet_id: "subnet".into(),
                ip_address: "10.0.0.2".into(),
            }],
            device_owner: "neutron:LOADBALANCERV2".into(),
            device_id: "lb1".into(),
            host: None,
        }
    }

    fn subnet() -> Subnet {
        Subnet {
            id: "subnet".into(),
            network_id: "net".into(),
            cidr: "10.0.0.0/24".into(),
            gateway_ip: Some("10.0.0.1".into()),
        }
    }

    #[test]
    fn test_names() {
        assert_eq!(namespace_name("lb1"), "nlbaas-lb1");
        assert_eq!(device_name("0123456789abcdef"), "tap0123456789a");
        assert_eq!(device_name("short"), "tapshort");
    }

    #[tokio::test]
    async fn test_plug_vip_with_ovs() {
        let executor = Arc::new(RecordingExecutor::new());
        let manager = NamespaceManager::new(executor.clone(), &HaproxySettings::default());
        manager.plug_vip("lb1", &port(), &subnet()).await.unwrap();

        let commands = executor.commands();
        assert_eq!(commands[0], "ip netns list");
        assert_eq!(commands[1], "ip netns add nlbaas-lb1");
        assert!(commands.iter().any(|c| c.starts_with(
            "ovs-vsctl -- --may-exist add-port br-int tap0123456789a -- set Interface tap0123456789a type=internal external-ids:iface-id=0123456789abcdef"
        )));
        assert!(commands.contains(&"ip link set tap0123456789a netns nlbaas-lb1".to_string()));
        assert!(commands.contains(
            &"ip netns exec nlbaas-lb1 ip addr replace 10.0.0.2/24 dev tap0123456789a".to_string()
        ));
        assert!(commands.contains(
            &"ip netns exec nlbaas-lb1 ip route replace default via 10.0.0.1 dev tap0123456789a".to_string()
        ));
        assert!(commands.contains(
            &"ip netns exec nlbaas-lb1 arping -U -I tap0123456789a -c 3 10.0.0.2".to_string()
        ));
    }

    #[tokio::test]
    async fn test_plug_is_skipped_when_device_present() {
        let executor = Arc::new(RecordingExecutor::new());
        executor.reply(
            "ip netns list",
            CommandOutput {
                status: 0,
                stdout: "nlbaas-lb1 (id: 3)\n".into(),
                stderr: String::new(),
            },
        );
        executor.reply(
            "ip -o link show",
            CommandOutput {
                status: 0,
                stdout: "1: lo: <LOOPBACK,UP>\n12: tap0123456789a: <BROADCAST,UP>\n".into(),
                stderr: String::new(),
            },
        );
        let manager = NamespaceManager::new(executor.clone(), &HaproxySettings::default());
        manager.plug_vip("lb1", &port(), &subnet()).await.unwrap();
        assert!(executor.commands_containing("ovs-vsctl").is_empty());
        assert!(executor.commands_containing("ip netns add").is_empty());
    }

    #[tokio::test]
    async fn test_linuxbridge_plug_uses_veth_pair() {
        let executor = Arc::new(RecordingExecutor::new());
        let settings = HaproxySettings {
            interface_driver: InterfaceDriverType::LinuxBridge,
            send_gratuitous_arp: 0,
            ..HaproxySettings::default()
        };
        let manager = NamespaceManager::new(executor.clone(), &settings);
        manager.plug_vip("lb1", &port(), &subnet()).await.unwrap();
        assert!(executor
            .commands()
            .contains(&"ip link add tap0123456789a type veth peer name ns-0123456789a".to_string()));
        assert!(executor.commands_containing("arping").is_empty());

        manager.unplug_vip("lb1", "0123456789abcdef").await;
        assert!(executor
            .commands()
            .contains(&"ip netns exec nlbaas-lb1 ip link delete ns-0123456789a".to_string()));
    }

    #[tokio::test]
    async fn test_cleanup_swallows_errors() {
        let executor = Arc::new(RecordingExecutor::new());
        executor.reply(
            "ip netns list",
            CommandOutput {
                status: 0,
                stdout: "nlbaas-lb1\n".into(),
                stderr: String::new(),
            },
        );
        executor.reply(
            "ip -o link show",
            CommandOutput {
                status: 0,
                stdout: "1: lo: <LOOPBACK,UP>\n7: tapdead@if8: <BROADCAST>\n".into(),
                stderr: String::new(),
            },
        );
        executor.reply(
            "ip netns delete",
            CommandOutput {
                status: 1,
                stdout: String::new(),
                stderr: "Device or resource busy".into(),
            },
        );
        let manager = NamespaceManager::new(executor.clone(), &HaproxySettings::default());
        manager.cleanup("lb1").await;
        let commands = executor.commands();
        assert!(commands.contains(&"ovs-vsctl --if-exists del-port br-int tapdead".to_string()));
        assert_eq!(commands.last().unwrap(), "ip netns delete nlbaas-lb1");
    }
}
