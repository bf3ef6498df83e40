use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::{Error, Result};

/// IPAM type understood by the delegate plugin
pub const HOST_LOCAL: &str = "host-local";

/// One subnet entry of a host-local range set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeItem {
    /// Subnet in CIDR notation
    pub subnet: String,
}

/// A host-local range set. host-local expects a list of items per range,
/// this plugin always writes exactly one.
pub type RangeGroup = Vec<RangeItem>;

/// The "ipam" section handed to host-local. This is also the format of
/// the cache file, so the cache is a valid host-local config by itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLocalIpam {
    /// Type of IPAM plugin
    #[serde(rename = "type")]
    pub ipam_type: String,
    /// Directory where host-local keeps its leases
    #[serde(rename = "dataDir", default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Address ranges, one subnet per group
    #[serde(default)]
    pub ranges: Vec<RangeGroup>,
}

impl HostLocalIpam {
    /// Build a validated config with one range group per subnet
    pub fn from_subnets<S: AsRef<str>>(subnets: &[S], data_dir: Option<String>) -> Result<Self> {
        let ipam = Self {
            ipam_type: HOST_LOCAL.to_string(),
            data_dir,
            ranges: subnets
                .iter()
                .map(|s| {
                    vec![RangeItem {
                        subnet: s.as_ref().to_string(),
                    }]
                })
                .collect(),
        };
        ipam.validate()?;
        Ok(ipam)
    }

    /// Check the type, the number of ranges, the subnets and, for two
    /// ranges, that they are of different families.
    pub fn validate(&self) -> Result<()> {
        if self.ipam_type != HOST_LOCAL {
            return Err(Error::config(format!("wrong type {:?}", self.ipam_type)));
        }
        match self.ranges.len() {
            0 => return Err(Error::config("no ranges")),
            1 | 2 => {}
            n => return Err(Error::config(format!("too many ranges ({n})"))),
        }

        let mut families = Vec::with_capacity(2);
        for group in &self.ranges {
            let [item] = group.as_slice() else {
                return Err(Error::config("unsupported range item"));
            };
            let net = parse_cidr(&item.subnet)?;
            families.push(is_ipv4(net.ip()));
        }
        if let [a, b] = families.as_slice() {
            if a == b {
                return Err(Error::config("subnets of same family"));
            }
        }
        Ok(())
    }

    /// Subnet of each range group, in order
    pub fn subnets(&self) -> impl Iterator<Item = &str> {
        self.ranges
            .iter()
            .filter_map(|group| group.first())
            .map(|item| item.subnet.as_str())
    }
}

/// Parse `<address>/<prefix>` strictly: the prefix is mandatory and made
/// of decimal digits only, and the address must be written out in full.
pub fn parse_cidr(cidr: &str) -> Result<IpNetwork> {
    let invalid = |reason: &str| Error::InvalidCidr {
        cidr: cidr.to_string(),
        reason: reason.to_string(),
    };
    let (addr, prefix) = cidr.split_once('/').ok_or_else(|| invalid("missing prefix length"))?;
    let addr: IpAddr = addr.parse().map_err(|_| invalid("invalid address"))?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("invalid prefix length"));
    }
    let prefix: u8 = prefix.parse().map_err(|_| invalid("invalid prefix length"))?;
    IpNetwork::new(addr, prefix).map_err(|e| invalid(&e.to_string()))
}

/// IPv4, including IPv4-mapped IPv6 addresses
pub fn is_ipv4(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(_) => true,
        IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some(),
    }
}

/// Network configuration passed on stdin to the delegate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateConf {
    /// Name of the network
    pub name: String,
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Install a default route via the gateway
    #[serde(rename = "isDefaultGateway", default, skip_serializing_if = "is_false")]
    pub is_default_gateway: bool,
    /// IPAM configuration, null for VERSION without one
    pub ipam: Option<HostLocalIpam>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// CNI error result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResult {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Error code
    pub code: u32,
    /// Short error message
    pub msg: String,
    /// Error details
    #[serde(default)]
    pub details: String,
}

impl ErrorResult {
    pub fn new(cni_version: &str, err: &Error) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            code: err.code(),
            msg: err.msg().to_string(),
            details: err.to_string(),
        }
    }

    /// Render as a single JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"cniVersion":"{}","code":{},"msg":"{}"}}"#,
                self.cni_version, self.code, self.msg
            )
        })
    }
}
