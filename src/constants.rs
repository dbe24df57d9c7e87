pub const DIR_LOCK: &str = "/run/easyto-netcfg/lock";
pub const DIR_UNIT: &str = "/run/systemd/network";

pub const FILE_DEFAULT_UNIT: &str = "/usr/lib/systemd/network/80-ec2.network";
pub const FILE_RELOAD_FLAG: &str = "/run/easyto-netcfg/reload-networkd";

pub const DROPIN_ALIASES: &str = "aliases.conf";
pub const DROPIN_INTERFACE: &str = "interface.conf";
pub const DROPIN_POLICY_V4: &str = "policy-ipv4.conf";
pub const DROPIN_POLICY_V6: &str = "policy-ipv6.conf";

pub const UNIT_PREFIX: &str = "70-";
pub const UNIT_SUFFIX: &str = ".network";

pub const IMDS_ENDPOINT_V4: &str = "http://169.254.169.254/latest";
pub const IMDS_ENDPOINT_V6: &str = "http://[fd00:ec2::254]/latest";
pub const IMDS_HEADER_TOKEN: &str = "X-aws-ec2-metadata-token";
pub const IMDS_HEADER_TOKEN_TTL: &str = "X-aws-ec2-metadata-token-ttl-seconds";
pub const IMDS_MAX_ATTEMPTS: u32 = 10;
pub const IMDS_TOKEN_TTL_SECS: u64 = 60;

pub const MAX_DEVICE_NUMBER: u32 = 255;
pub const METRIC_BASE: u32 = 512;
pub const RULE_BASE: u32 = 10000;

pub const RELOAD_COMMAND: &str = "networkctl";
