use std::fmt::{self, Write};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use log::{debug, warn};
use rustix::fs::{Mode, symlink};

use crate::aws::imds::MetadataSource;
use crate::config::Config;
use crate::constants::{
    DROPIN_ALIASES, DROPIN_INTERFACE, DROPIN_POLICY_V4, DROPIN_POLICY_V6, UNIT_PREFIX,
    UNIT_SUFFIX,
};
use crate::fs::{install_contents, mkdir_p};
use crate::interface::Interface;
use crate::link::LinkOps;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn local_addresses_key(self) -> &'static str {
        match self {
            Family::V4 => "local-ipv4s",
            Family::V6 => "ipv6s",
        }
    }

    fn prefix_key(self) -> &'static str {
        match self {
            Family::V4 => "ipv4-prefix",
            Family::V6 => "ipv6-prefix",
        }
    }

    fn dropin(self) -> &'static str {
        match self {
            Family::V4 => DROPIN_POLICY_V4,
            Family::V6 => DROPIN_POLICY_V6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}

pub fn subnet_supports(addresses: &[IpAddr], family: Family) -> bool {
    addresses.iter().any(|a| match (a, family) {
        (IpAddr::V4(v4), Family::V4) => !v4.is_link_local(),
        (IpAddr::V6(_), Family::V6) => true,
        _ => false,
    })
}

pub fn unit_path(config: &Config, iface: &str) -> PathBuf {
    config
        .unit_dir
        .join(format!("{}{}{}", UNIT_PREFIX, iface, UNIT_SUFFIX))
}

pub fn dropin_dir(config: &Config, iface: &str) -> PathBuf {
    config
        .unit_dir
        .join(format!("{}{}{}.d", UNIT_PREFIX, iface, UNIT_SUFFIX))
}

pub fn dropin_paths(config: &Config, iface: &str) -> Vec<PathBuf> {
    let dir = dropin_dir(config, iface);
    [
        DROPIN_INTERFACE,
        DROPIN_POLICY_V4,
        DROPIN_POLICY_V6,
        DROPIN_ALIASES,
    ]
    .iter()
    .map(|name| dir.join(name))
    .collect()
}

pub fn render_interface(
    iface: &Interface,
    config: &Config,
    ipv4: bool,
) -> Result<String, fmt::Error> {
    let metric = iface.route_metric(config);
    let table = iface.rule_id(config);
    let dhcp = if iface.is_primary() { "yes" } else { "ipv6" };
    let mut s = String::new();

    writeln!(s, "[Match]\nMACAddress={}\n", iface.mac())?;
    writeln!(s, "[Network]\nDHCP={}\n", dhcp)?;

    writeln!(s, "[DHCPv4]\nRouteMetric={}", metric)?;
    if !iface.is_primary() {
        writeln!(s, "RouteTable={}", table)?;
    }
    writeln!(s)?;

    writeln!(s, "[DHCPv6]\nRouteMetric={}\n", metric)?;

    writeln!(s, "[IPv6AcceptRA]\nRouteMetric={}", metric)?;
    if !iface.is_primary() {
        writeln!(s, "RouteTable={}", table)?;
    }

    if !iface.is_primary() {
        writeln!(s, "\n[Route]\nTable={}\nGateway=_ipv6ra", table)?;
        if ipv4 {
            writeln!(s, "\n[Route]\nTable={}\nGateway=_dhcp4", table)?;
        }
    }
    Ok(s)
}

pub fn render_policy_rules(sources: &[String], rule_id: u32) -> Result<String, fmt::Error> {
    let mut s = String::new();
    for (i, source) in sources.iter().enumerate() {
        if i > 0 {
            writeln!(s)?;
        }
        writeln!(
            s,
            "[RoutingPolicyRule]\nFrom={}\nPriority={}\nTable={}",
            source, rule_id, rule_id
        )?;
    }
    Ok(s)
}

pub fn render_aliases(addresses: &[Ipv4Addr]) -> Result<String, fmt::Error> {
    let mut s = String::new();
    for (i, addr) in addresses.iter().enumerate() {
        if i > 0 {
            writeln!(s)?;
        }
        writeln!(s, "[Address]\nAddress={}/32\nAddPrefixRoute=false", addr)?;
    }
    Ok(s)
}

// IMDS lists the primary address first; DHCP assigns that one.
pub fn secondary_ipv4s(local_ipv4s: &[String]) -> Vec<Ipv4Addr> {
    let mut addrs: Vec<Ipv4Addr> = local_ipv4s
        .iter()
        .skip(1)
        .filter_map(|a| match a.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                warn!("Ignoring invalid IPv4 address {:?} from IMDS", a);
                None
            }
        })
        .collect();
    addrs.sort();
    addrs
}

pub struct Generators<'a> {
    config: &'a Config,
    metadata: &'a dyn MetadataSource,
    links: &'a dyn LinkOps,
}

impl<'a> Generators<'a> {
    pub fn new(
        config: &'a Config,
        metadata: &'a dyn MetadataSource,
        links: &'a dyn LinkOps,
    ) -> Self {
        Self {
            config,
            metadata,
            links,
        }
    }

    fn supports(&self, iface: &Interface, family: Family) -> bool {
        match self.links.global_addresses(iface.name()) {
            Ok(addrs) => subnet_supports(&addrs, family),
            Err(e) => {
                warn!("Unable to read addresses of {}: {}", iface.name(), e);
                false
            }
        }
    }

    fn ensure_dropin_dir(&self, iface: &Interface) -> Result<PathBuf> {
        let dir = dropin_dir(self.config, iface.name());
        mkdir_p(&dir, Mode::from(0o755))?;
        Ok(dir)
    }

    // An existing unit belongs to whoever created it.
    pub fn base_config(&self, iface: &Interface) -> Result<bool> {
        let unit = unit_path(self.config, iface.name());
        if unit.symlink_metadata().is_ok() {
            debug!("Using existing unit {:?}", unit);
            return Ok(false);
        }
        let ipv4 = self.supports(iface, Family::V4);
        let contents = render_interface(iface, self.config, ipv4)
            .map_err(|e| anyhow!("unable to render unit for {}: {}", iface.name(), e))?;
        let dir = self.ensure_dropin_dir(iface)?;
        let installed = install_contents(dir.join(DROPIN_INTERFACE), &contents)?;

        // Link last, an existing unit stops later passes from writing the
        // override.
        let linked = link_unit(&self.config.default_unit, &unit)?;
        Ok(linked || installed)
    }

    pub fn policy_rules(&self, iface: &Interface, family: Family) -> Result<bool> {
        if !self.supports(iface, family) {
            debug!("Subnet of {} has no {} support", iface.name(), family);
            return Ok(false);
        }
        // IMDS answers the same for "not yet" and "none", so a failure here
        // means no sources rather than an error.
        let addresses = self
            .metadata
            .fetch_list(
                iface.mac(),
                family.local_addresses_key(),
                self.config.imds_max_attempts,
            )
            .unwrap_or_else(|e| {
                debug!("No {} addresses for {}: {}", family, iface.name(), e);
                Vec::new()
            });
        let prefixes = self
            .metadata
            .fetch_list(iface.mac(), family.prefix_key(), 1)
            .unwrap_or_default();

        let sources: Vec<String> = addresses.into_iter().chain(prefixes).collect();
        let contents = render_policy_rules(&sources, iface.rule_id(self.config))
            .map_err(|e| anyhow!("unable to render rules for {}: {}", iface.name(), e))?;
        let dir = self.ensure_dropin_dir(iface)?;
        install_contents(dir.join(family.dropin()), &contents)
    }

    pub fn aliases(&self, iface: &Interface) -> Result<bool> {
        if !self.supports(iface, Family::V4) {
            debug!("Subnet of {} has no IPv4 support", iface.name());
            return Ok(false);
        }
        let local_ipv4s = self.metadata.fetch_list(
            iface.mac(),
            Family::V4.local_addresses_key(),
            self.config.imds_max_attempts,
        )?;
        let contents = render_aliases(&secondary_ipv4s(&local_ipv4s))
            .map_err(|e| anyhow!("unable to render aliases for {}: {}", iface.name(), e))?;
        let dir = self.ensure_dropin_dir(iface)?;
        install_contents(dir.join(DROPIN_ALIASES), &contents)
    }

    pub fn altnames(&self, iface: &Interface) {
        let device_altname = format!("device-number-{}", iface.device_number());
        let eni_altname = self
            .metadata
            .fetch_for_interface(iface.mac(), "interface-id", self.config.imds_max_attempts)
            .map(|id| id.trim().to_string());
        let altnames = match eni_altname {
            Ok(eni) if !eni.is_empty() => vec![eni, device_altname],
            Ok(_) => vec![device_altname],
            Err(e) => {
                debug!("No interface id for {}: {}", iface.name(), e);
                vec![device_altname]
            }
        };
        for altname in altnames {
            match self.links.ensure_altname(iface.name(), &altname) {
                Ok(true) => debug!("Added altname {} to {}", altname, iface.name()),
                Ok(false) => (),
                Err(e) => debug!("Unable to add altname {} to {}: {}", altname, iface.name(), e),
            }
        }
    }
}

fn link_unit(template: &Path, unit: &Path) -> Result<bool> {
    debug!("Linking {:?} to {:?}", unit, template);
    match symlink(template, unit) {
        Ok(()) => Ok(true),
        Err(rustix::io::Errno::EXIST) => Ok(false),
        Err(e) => Err(anyhow!(
            "unable to link {:?} to {:?}: {}",
            unit,
            template,
            io::Error::from(e)
        )),
    }
}
