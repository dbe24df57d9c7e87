use std::fmt;
use std::str::FromStr;

use anyhow::Result;

use crate::config::Config;
use crate::constants::MAX_DEVICE_NUMBER;
use crate::error::NetcfgError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl FromStr for MacAddr {
    type Err = NetcfgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut fields = s.trim().split(':');
        for octet in octets.iter_mut() {
            let field = fields
                .next()
                .filter(|f| f.len() == 2)
                .ok_or(NetcfgError::InvalidArgument("mac"))?;
            *octet =
                u8::from_str_radix(field, 16).map_err(|_| NetcfgError::InvalidArgument("mac"))?;
        }
        if fields.next().is_some() {
            return Err(NetcfgError::InvalidArgument("mac"));
        }
        Ok(Self(octets))
    }
}

// IMDS keys its interface tree by lower-case colon-separated MACs.
impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interface {
    name: String,
    mac: MacAddr,
    device_number: u32,
    primary: bool,
}

impl Interface {
    pub fn new(name: &str, mac: MacAddr, device_number: u32, primary_mac: &MacAddr) -> Result<Self> {
        validate_name(name)?;
        if device_number > MAX_DEVICE_NUMBER {
            return Err(NetcfgError::InvalidArgument("device number").into());
        }
        Ok(Self {
            name: name.to_string(),
            mac,
            device_number,
            primary: device_number == 0 && mac == *primary_mac,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mac(&self) -> &MacAddr {
        &self.mac
    }

    pub fn device_number(&self) -> u32 {
        self.device_number
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    // Also the table id.
    pub fn rule_id(&self, config: &Config) -> u32 {
        config.rule_base + self.device_number
    }

    pub fn route_metric(&self, config: &Config) -> u32 {
        config.metric_base + 10 * self.device_number
    }
}

pub fn validate_name(name: &str) -> Result<(), NetcfgError> {
    // IFNAMSIZ includes the trailing NUL.
    if name.is_empty()
        || name.len() > 15
        || name.contains(['/', '\0'])
        || name.contains(char::is_whitespace)
    {
        return Err(NetcfgError::InvalidArgument("interface name"));
    }
    Ok(())
}
