use std::fs;

use anyhow::{Result, anyhow};
use log::{debug, error, info};

use crate::aws::imds::MetadataSource;
use crate::backoff::{Clock, Deadline};
use crate::config::Config;
use crate::fs::remove_if_exists;
use crate::generate::{Family, Generators, dropin_dir, dropin_paths, unit_path};
use crate::interface::{Interface, MacAddr, validate_name};
use crate::link::LinkOps;

pub struct InterfaceSetup<'a> {
    config: &'a Config,
    metadata: &'a dyn MetadataSource,
    links: &'a dyn LinkOps,
    clock: &'a dyn Clock,
}

impl<'a> InterfaceSetup<'a> {
    pub fn new(
        config: &'a Config,
        metadata: &'a dyn MetadataSource,
        links: &'a dyn LinkOps,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            config,
            metadata,
            links,
            clock,
        }
    }

    pub fn resolve(&self, name: &str, mac: MacAddr) -> Result<Interface> {
        let attempts = self.config.imds_max_attempts;
        let primary_mac: MacAddr = self.metadata.fetch("mac", attempts)?.parse()?;
        let device_number = self
            .metadata
            .fetch_for_interface(&mac, "device-number", attempts)?
            .trim()
            .parse::<u32>()
            .map_err(|e| anyhow!("invalid device number for {}: {}", mac, e))?;
        Interface::new(name, mac, device_number, &primary_mac)
    }

    // IMDS may lag a fresh attachment, so initial setup repeats passes until
    // something changes or the convergence deadline passes.
    pub fn setup(&self, name: &str, mac: MacAddr, initial_setup: bool) -> u32 {
        let generators = Generators::new(self.config, self.metadata, self.links);
        let mut deadline = Deadline::new(self.clock, &self.config.converge);
        let mut resolved = None;
        let mut changes = 0;
        loop {
            if resolved.is_none() {
                match self.resolve(name, mac) {
                    Ok(iface) => resolved = Some(iface),
                    Err(e) => error!("Unable to resolve {} in IMDS: {}", name, e),
                }
            }
            if let Some(iface) = &resolved {
                changes = self.run_generators(&generators, iface);
            }
            if !initial_setup || changes > 0 || deadline.expired() {
                break;
            }
            debug!("No changes for {} yet, waiting for IMDS", name);
            deadline.wait();
        }
        if let Some(iface) = &resolved {
            generators.altnames(iface);
        }
        changes
    }

    fn run_generators(&self, generators: &Generators<'_>, iface: &Interface) -> u32 {
        let mut changes = count(iface, "unit", generators.base_config(iface));
        if !iface.is_primary() {
            changes += count(
                iface,
                "IPv4 rules",
                generators.policy_rules(iface, Family::V4),
            );
            changes += count(
                iface,
                "IPv6 rules",
                generators.policy_rules(iface, Family::V6),
            );
        }
        changes += count(iface, "aliases", generators.aliases(iface));
        changes
    }
}

fn count(iface: &Interface, what: &str, result: Result<bool>) -> u32 {
    match result {
        Ok(true) => {
            info!("Updated {} of {}", what, iface.name());
            1
        }
        Ok(false) => 0,
        Err(e) => {
            error!("Unable to configure {} of {}: {}", what, iface.name(), e);
            0
        }
    }
}

pub fn remove_interface(config: &Config, name: &str) -> Result<u32> {
    validate_name(name)?;
    let mut removed = 0;
    let unit = unit_path(config, name);
    if fs::read_link(&unit).is_ok_and(|target| target == config.default_unit)
        && remove_if_exists(&unit)?
    {
        removed += 1;
    }
    for path in dropin_paths(config, name) {
        if remove_if_exists(&path)? {
            removed += 1;
        }
    }
    let dir = dropin_dir(config, name);
    if let Err(e) = fs::remove_dir(&dir) {
        debug!("Not removing {:?}: {}", dir, e);
    }
    if removed > 0 {
        info!("Removed {} files of {}", removed, name);
    }
    Ok(removed)
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::aws::imds::testing::FakeMetadata;
    use crate::backoff::testing::FakeClock;
    use crate::config::RetryPolicy;
    use crate::constants::{DROPIN_ALIASES, DROPIN_INTERFACE, DROPIN_POLICY_V4, DROPIN_POLICY_V6};
    use crate::error::NetcfgError;
    use crate::link::testing::FakeLinks;

    const MAC0: &str = "aa:bb:cc:dd:ee:00";
    const MAC1: &str = "aa:bb:cc:dd:ee:01";

    fn test_config(dir: &Path) -> Config {
        Config {
            unit_dir: dir.join("units"),
            default_unit: dir.join("80-ec2.network"),
            converge: RetryPolicy {
                max_duration_ms: 1000,
                cap_ms: 50,
            },
            ..Config::default()
        }
    }

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    // Hides one interface key until the clock has been slept on `after`
    // times, like IMDS catching up with an attachment.
    struct LaggingMetadata<'a> {
        inner: FakeMetadata,
        clock: &'a FakeClock,
        key: &'a str,
        after: u32,
    }

    impl MetadataSource for LaggingMetadata<'_> {
        fn fetch(&self, path: &str, max_attempts: u32) -> Result<String> {
            if path.ends_with(self.key) && self.clock.sleeps() < self.after {
                return Err(NetcfgError::MetadataUnavailable {
                    path: path.to_string(),
                    attempts: max_attempts,
                }
                .into());
            }
            self.inner.fetch(path, max_attempts)
        }
    }

    fn eth1_metadata() -> FakeMetadata {
        FakeMetadata::default()
            .with("mac", MAC0)
            .with_interface(MAC1, "device-number", "1")
            .with_interface(MAC1, "local-ipv4s", "10.0.1.10\n")
            .with_interface(MAC1, "interface-id", "eni-0123456789abcdef0")
    }

    #[test]
    fn test_setup_secondary_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let metadata = eth1_metadata();
        let links = FakeLinks::default().with_addresses("eth1", &["10.0.1.10"]);
        let clock = FakeClock::new();
        let setup = InterfaceSetup::new(&config, &metadata, &links, &clock);

        let changes = setup.setup("eth1", mac(MAC1), true);
        assert_eq!(changes, 2);
        assert_eq!(clock.sleeps(), 0);

        let dropins = dropin_dir(&config, "eth1");
        let unit = fs::read_to_string(dropins.join(DROPIN_INTERFACE)).unwrap();
        assert!(unit.contains("DHCP=ipv6"));
        assert!(unit.contains("RouteMetric=522"));
        assert!(unit.contains("[DHCPv4]\nRouteMetric=522\nRouteTable=10001"));
        assert!(unit.contains("[IPv6AcceptRA]\nRouteMetric=522\nRouteTable=10001"));
        assert!(unit.contains("[Route]\nTable=10001\nGateway=_ipv6ra"));
        assert!(unit.contains("[Route]\nTable=10001\nGateway=_dhcp4"));
        assert_eq!(
            fs::read_to_string(dropins.join(DROPIN_POLICY_V4)).unwrap(),
            "[RoutingPolicyRule]\nFrom=10.0.1.10\nPriority=10001\nTable=10001\n"
        );
        assert!(!dropins.join(DROPIN_POLICY_V6).exists());
        assert!(!dropins.join(DROPIN_ALIASES).exists());
        assert_eq!(
            links.altnames_of("eth1"),
            vec!["eni-0123456789abcdef0", "device-number-1"]
        );

        // Nothing changed, so a refresh is a no-op.
        assert_eq!(setup.setup("eth1", mac(MAC1), false), 0);
    }

    #[test]
    fn test_setup_primary_has_no_policy_rules() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let metadata = FakeMetadata::default()
            .with("mac", MAC0)
            .with_interface(MAC0, "device-number", "0")
            .with_interface(MAC0, "local-ipv4s", "10.0.0.4\n10.0.0.8")
            .with_interface(MAC0, "ipv6s", "2600:1f18::4")
            .with_interface(MAC0, "ipv4-prefix", "10.0.9.0/28");
        let links = FakeLinks::default().with_addresses("eth0", &["10.0.0.4", "2600:1f18::4"]);
        let clock = FakeClock::new();
        let setup = InterfaceSetup::new(&config, &metadata, &links, &clock);

        let changes = setup.setup("eth0", mac(MAC0), true);
        assert_eq!(changes, 2);
        let dropins = dropin_dir(&config, "eth0");
        assert!(!dropins.join(DROPIN_POLICY_V4).exists());
        assert!(!dropins.join(DROPIN_POLICY_V6).exists());
        let unit = fs::read_to_string(dropins.join(DROPIN_INTERFACE)).unwrap();
        assert!(unit.contains("DHCP=yes"));
        assert!(!unit.contains("RouteTable"));
        let aliases = fs::read_to_string(dropins.join(DROPIN_ALIASES)).unwrap();
        assert!(aliases.contains("Address=10.0.0.8/32"));
    }

    #[test]
    fn test_setup_waits_for_imds_during_initial_setup() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.unit_dir).unwrap();
        fs::write(unit_path(&config, "eth1"), "[Match]\nName=eth1\n").unwrap();
        let clock = FakeClock::new();
        let metadata = LaggingMetadata {
            inner: eth1_metadata(),
            clock: &clock,
            key: "local-ipv4s",
            after: 3,
        };
        let links = FakeLinks::default().with_addresses("eth1", &["10.0.1.10"]);
        let setup = InterfaceSetup::new(&config, &metadata, &links, &clock);

        assert_eq!(setup.setup("eth1", mac(MAC1), true), 1);
        assert_eq!(clock.sleeps(), 3);
    }

    #[test]
    fn test_setup_refresh_does_not_wait() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.unit_dir).unwrap();
        fs::write(unit_path(&config, "eth1"), "[Match]\nName=eth1\n").unwrap();
        let clock = FakeClock::new();
        let metadata = LaggingMetadata {
            inner: eth1_metadata(),
            clock: &clock,
            key: "local-ipv4s",
            after: 3,
        };
        let links = FakeLinks::default().with_addresses("eth1", &["10.0.1.10"]);
        let setup = InterfaceSetup::new(&config, &metadata, &links, &clock);

        assert_eq!(setup.setup("eth1", mac(MAC1), false), 0);
        assert_eq!(clock.sleeps(), 0);
    }

    #[test]
    fn test_setup_gives_up_at_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let clock = FakeClock::new();
        let metadata = LaggingMetadata {
            inner: eth1_metadata(),
            clock: &clock,
            key: "device-number",
            after: u32::MAX,
        };
        let links = FakeLinks::default().with_addresses("eth1", &["10.0.1.10"]);
        let setup = InterfaceSetup::new(&config, &metadata, &links, &clock);

        assert_eq!(setup.setup("eth1", mac(MAC1), true), 0);
        assert!(clock.sleeps() > 0);
        assert!(!unit_path(&config, "eth1").exists());
    }

    #[test]
    fn test_remove_interface() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let metadata = eth1_metadata();
        let links = FakeLinks::default().with_addresses("eth1", &["10.0.1.10"]);
        let clock = FakeClock::new();
        let setup = InterfaceSetup::new(&config, &metadata, &links, &clock);
        assert!(setup.setup("eth1", mac(MAC1), false) > 0);

        // interface.conf, policy-ipv4.conf and the unit link.
        assert_eq!(remove_interface(&config, "eth1").unwrap(), 3);
        assert!(unit_path(&config, "eth1").symlink_metadata().is_err());
        assert!(!dropin_dir(&config, "eth1").exists());
        assert_eq!(remove_interface(&config, "eth1").unwrap(), 0);
    }

    #[test]
    fn test_remove_interface_keeps_foreign_unit() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.unit_dir).unwrap();
        let unit = unit_path(&config, "eth1");
        fs::write(&unit, "[Match]\nName=eth1\n").unwrap();

        assert_eq!(remove_interface(&config, "eth1").unwrap(), 0);
        assert!(unit.exists());
        assert!(remove_interface(&config, "").is_err());
    }
}
