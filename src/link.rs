use std::net::IpAddr;

use anyhow::{Context, Result, anyhow};
use futures::TryStreamExt;
use netlink_packet_route::address::{AddressAttribute, AddressScope};
use netlink_packet_route::link::{LinkAttribute, LinkMessage, Prop};
use rtnetlink::{Handle as NlHandle, new_connection};
use tokio::runtime::Handle as RtHandle;

use crate::interface::MacAddr;

/// Live link state, read and written directly rather than through networkd.
pub trait LinkOps {
    fn mac(&self, iface: &str) -> Result<MacAddr>;

    fn global_addresses(&self, iface: &str) -> Result<Vec<IpAddr>>;

    fn altnames(&self, iface: &str) -> Result<Vec<String>>;

    fn add_altname(&self, iface: &str, altname: &str) -> Result<()>;

    fn ensure_altname(&self, iface: &str, altname: &str) -> Result<bool> {
        if self.altnames(iface)?.iter().any(|a| a == altname) {
            return Ok(false);
        }
        self.add_altname(iface, altname)?;
        Ok(true)
    }
}

pub struct NetlinkLinks {
    rt: RtHandle,
    handle: NlHandle,
}

impl NetlinkLinks {
    pub fn new(rt: RtHandle) -> Result<Self> {
        let _guard = rt.enter();
        let (connection, handle, _) =
            new_connection().map_err(|e| anyhow!("unable to create netlink socket: {}", e))?;
        rt.spawn(connection);
        Ok(Self { rt, handle })
    }

    async fn link_by_name(&self, iface: &str) -> Result<LinkMessage> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(iface.to_string())
            .execute();
        links
            .try_next()
            .await
            .with_context(|| format!("failed to get link {}", iface))?
            .ok_or_else(|| anyhow!("link {} not found", iface))
    }

    async fn global_addresses_async(&self, iface: &str) -> Result<Vec<IpAddr>> {
        let link = self.link_by_name(iface).await?;
        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(link.header.index)
            .execute();
        let mut addresses = Vec::new();
        while let Some(msg) = stream
            .try_next()
            .await
            .with_context(|| format!("failed to get addresses of {}", iface))?
        {
            if msg.header.scope != AddressScope::Universe {
                continue;
            }
            for attr in &msg.attributes {
                if let AddressAttribute::Address(ip) = attr {
                    addresses.push(*ip);
                }
            }
        }
        Ok(addresses)
    }

    async fn add_altname_async(&self, iface: &str, altname: &str) -> Result<()> {
        let link = self.link_by_name(iface).await?;
        self.handle
            .link()
            .property_add(link.header.index)
            .alt_ifname(&[altname])
            .execute()
            .await
            .with_context(|| format!("failed to add altname {} to {}", altname, iface))
    }
}

impl LinkOps for NetlinkLinks {
    fn mac(&self, iface: &str) -> Result<MacAddr> {
        let link = self.rt.block_on(self.link_by_name(iface))?;
        link_mac(&link).ok_or_else(|| anyhow!("link {} has no MAC address", iface))
    }

    fn global_addresses(&self, iface: &str) -> Result<Vec<IpAddr>> {
        self.rt.block_on(self.global_addresses_async(iface))
    }

    fn altnames(&self, iface: &str) -> Result<Vec<String>> {
        let link = self.rt.block_on(self.link_by_name(iface))?;
        Ok(link_altnames(&link))
    }

    fn add_altname(&self, iface: &str, altname: &str) -> Result<()> {
        self.rt.block_on(self.add_altname_async(iface, altname))
    }
}

fn link_mac(link: &LinkMessage) -> Option<MacAddr> {
    link.attributes.iter().find_map(|nla| match nla {
        LinkAttribute::Address(addr) if addr.len() == 6 => {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&addr[..6]);
            Some(MacAddr::new(mac))
        }
        _ => None,
    })
}

fn link_altnames(link: &LinkMessage) -> Vec<String> {
    link.attributes
        .iter()
        .filter_map(|nla| match nla {
            LinkAttribute::PropList(props) => Some(props),
            _ => None,
        })
        .flatten()
        .filter_map(|prop| match prop {
            Prop::AltIfName(name) => Some(name.clone()),
            _ => None,
        })
        .collect()
}
