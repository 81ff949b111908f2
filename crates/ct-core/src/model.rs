use crate::error::ValidationError;
use crate::validate;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Packet-filter table partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub const ALL: [Table; 2] = [Table::Filter, Table::Nat];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }

    /// Built-in chains the kernel provides for this table.
    pub fn chains(&self) -> &'static [Chain] {
        match self {
            Table::Filter => &[Chain::Input, Chain::Forward, Chain::Output],
            Table::Nat => &[
                Chain::Prerouting,
                Chain::Input,
                Chain::Output,
                Chain::Postrouting,
            ],
        }
    }

    pub fn has_chain(&self, chain: Chain) -> bool {
        self.chains().contains(&chain)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "filter" => Ok(Table::Filter),
            "nat" => Ok(Table::Nat),
            "mangle" => Err(ValidationError::UnsupportedTable(s.trim().to_string())),
            _ => Err(ValidationError::UnknownTable(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Chain {
    Prerouting,
    Input,
    Forward,
    Output,
    Postrouting,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Prerouting => "PREROUTING",
            Chain::Input => "INPUT",
            Chain::Forward => "FORWARD",
            Chain::Output => "OUTPUT",
            Chain::Postrouting => "POSTROUTING",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PREROUTING" => Ok(Chain::Prerouting),
            "INPUT" => Ok(Chain::Input),
            "FORWARD" => Ok(Chain::Forward),
            "OUTPUT" => Ok(Chain::Output),
            "POSTROUTING" => Ok(Chain::Postrouting),
            _ => Err(ValidationError::UnknownChain(s.to_string())),
        }
    }
}

/// A (table, chain) pair known to exist in the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainKey {
    pub table: Table,
    pub chain: Chain,
}

impl ChainKey {
    pub fn new(table: Table, chain: Chain) -> Result<Self, ValidationError> {
        if !table.has_chain(chain) {
            return Err(ValidationError::ChainNotInTable { table, chain });
        }
        Ok(Self { table, chain })
    }

    pub fn parse(table: &str, chain: &str) -> Result<Self, ValidationError> {
        Self::new(table.parse()?, chain.parse()?)
    }

    /// Every valid key, table by table.
    pub fn all() -> impl Iterator<Item = ChainKey> {
        Table::ALL
            .into_iter()
            .flat_map(|table| table.chains().iter().map(move |&chain| ChainKey { table, chain }))
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.chain)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    #[serde(alias = "any")]
    All,
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::All => "all",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }

    /// Whether port matches are available for this protocol.
    pub fn has_ports(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ValidationError;

    /// Accepts names case-insensitively plus the protocol numbers newer
    /// iptables versions print in numeric listings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "all" | "any" | "0" => Ok(Protocol::All),
            "tcp" | "6" => Ok(Protocol::Tcp),
            "udp" | "17" => Ok(Protocol::Udp),
            "icmp" | "1" => Ok(Protocol::Icmp),
            _ => Err(ValidationError::UnknownProtocol(s.to_string())),
        }
    }
}

/// IP version of a rule's addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    /// Family managed by a rule-table binary, judged by its file name.
    pub fn of_tool(program: &str) -> Self {
        let name = program.rsplit('/').next().unwrap_or(program);
        if name.starts_with("ip6tables") {
            AddressFamily::Ipv6
        } else {
            AddressFamily::Ipv4
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => f.write_str("IPv4"),
            AddressFamily::Ipv6 => f.write_str("IPv6"),
        }
    }
}

/// Address a NAT target rewrites to, with an optional port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NatAddress {
    pub addr: IpAddr,
    pub port: Option<u16>,
}

impl fmt::Display for NatAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.addr, self.port) {
            (IpAddr::V6(addr), Some(port)) => write!(f, "[{}]:{}", addr, port),
            (addr, Some(port)) => write!(f, "{}:{}", addr, port),
            (addr, None) => write!(f, "{}", addr),
        }
    }
}

impl FromStr for NatAddress {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate::nat_address(s)
    }
}

/// Rule verdict or NAT rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "action", content = "to", rename_all = "UPPERCASE")]
pub enum Target {
    Accept,
    Drop,
    Reject,
    Dnat(NatAddress),
    Snat(NatAddress),
    Masquerade,
}

impl Target {
    pub fn keyword(&self) -> &'static str {
        match self {
            Target::Accept => "ACCEPT",
            Target::Drop => "DROP",
            Target::Reject => "REJECT",
            Target::Dnat(_) => "DNAT",
            Target::Snat(_) => "SNAT",
            Target::Masquerade => "MASQUERADE",
        }
    }

    pub fn is_nat(&self) -> bool {
        matches!(self, Target::Dnat(_) | Target::Snat(_) | Target::Masquerade)
    }

    pub fn nat_address(&self) -> Option<&NatAddress> {
        match self {
            Target::Dnat(addr) | Target::Snat(addr) => Some(addr),
            _ => None,
        }
    }

    /// Builds a target from an action keyword and the (possibly empty) NAT field.
    ///
    /// The NAT field is ignored for actions that do not rewrite addresses.
    pub fn from_action(action: &str, nat_to: Option<&str>) -> Result<Self, ValidationError> {
        let nat_to = nat_to.map(str::trim).filter(|s| !s.is_empty());
        match action.trim().to_ascii_uppercase().as_str() {
            "ACCEPT" => Ok(Target::Accept),
            "DROP" => Ok(Target::Drop),
            "REJECT" => Ok(Target::Reject),
            "MASQUERADE" => Ok(Target::Masquerade),
            "DNAT" => nat_to
                .ok_or(ValidationError::MissingNatAddress("DNAT"))
                .and_then(NatAddress::from_str)
                .map(Target::Dnat),
            "SNAT" => nat_to
                .ok_or(ValidationError::MissingNatAddress("SNAT"))
                .and_then(NatAddress::from_str)
                .map(Target::Snat),
            _ => Err(ValidationError::UnknownAction(action.to_string())),
        }
    }

    fn allowed_in(&self, chain: Chain) -> bool {
        match self {
            Target::Dnat(_) => matches!(chain, Chain::Prerouting | Chain::Output),
            Target::Snat(_) => matches!(chain, Chain::Postrouting | Chain::Input),
            Target::Masquerade => chain == Chain::Postrouting,
            Target::Accept | Target::Drop | Target::Reject => true,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.nat_address() {
            Some(addr) => write!(f, "{} to {}", self.keyword(), addr),
            None => f.write_str(self.keyword()),
        }
    }
}

/// Typed fields of a rule, before cross-field validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub key: ChainKey,
    #[serde(default)]
    pub protocol: Protocol,
    pub source: Option<IpNet>,
    pub destination: Option<IpNet>,
    pub source_port: Option<u16>,
    pub destination_port: Option<u16>,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub target: Target,
    pub comment: Option<String>,
    /// Listing tokens this crate does not model, kept verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remainder: Option<String>,
}

impl RuleSpec {
    pub fn new(key: ChainKey, target: Target) -> Self {
        Self {
            key,
            protocol: Protocol::All,
            source: None,
            destination: None,
            source_port: None,
            destination_port: None,
            in_interface: None,
            out_interface: None,
            target,
            comment: None,
            remainder: None,
        }
    }
}

/// A validated packet-filter or NAT rule belonging to exactly one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Rule {
    spec: RuleSpec,
}

impl Rule {
    /// Validates cross-field invariants and normalizes addresses.
    pub fn new(mut spec: RuleSpec) -> Result<Self, ValidationError> {
        let ChainKey { table, chain } = spec.key;
        if !table.has_chain(chain) {
            return Err(ValidationError::ChainNotInTable { table, chain });
        }

        if spec.target.is_nat() && table != Table::Nat {
            return Err(ValidationError::NatTargetOutsideNat {
                target: spec.target.keyword(),
                table,
            });
        }
        if !spec.target.allowed_in(chain) {
            return Err(ValidationError::TargetNotInChain {
                target: spec.target.keyword(),
                chain,
            });
        }

        for (field, port) in [
            ("source port", spec.source_port),
            ("destination port", spec.destination_port),
        ] {
            if let Some(port) = port {
                validate::port_number(field, port)?;
                if !spec.protocol.has_ports() {
                    return Err(ValidationError::PortWithoutTransport { field });
                }
            }
        }
        if let Some(addr) = spec.target.nat_address() {
            if addr.port.is_some() && !spec.protocol.has_ports() {
                return Err(ValidationError::PortWithoutTransport { field: "NAT port" });
            }
        }

        if let Some(iface) = &spec.in_interface {
            validate::interface("in", iface)?;
        }
        if let Some(iface) = &spec.out_interface {
            validate::interface("out", iface)?;
        }

        spec.comment = spec
            .comment
            .take()
            .filter(|c| !c.trim().is_empty());
        if let Some(comment) = &spec.comment {
            validate::comment(comment)?;
        }
        spec.remainder = spec.remainder.take().filter(|r| !r.trim().is_empty());

        // A zero-length prefix matches everything, same as no address.
        spec.source = spec.source.map(|net| net.trunc()).filter(|net| net.prefix_len() > 0);
        spec.destination = spec
            .destination
            .map(|net| net.trunc())
            .filter(|net| net.prefix_len() > 0);

        let mut family = None;
        for (field, addr) in [
            ("source", spec.source.map(|net| net.addr())),
            ("destination", spec.destination.map(|net| net.addr())),
            ("NAT address", spec.target.nat_address().map(|nat| nat.addr)),
        ] {
            let Some(addr) = addr else { continue };
            let found = AddressFamily::of(addr);
            match family {
                None => family = Some(found),
                Some(expected) if expected != found => {
                    return Err(ValidationError::MixedFamily {
                        field,
                        found,
                        expected,
                    });
                }
                Some(_) => {}
            }
        }

        Ok(Self { spec })
    }

    /// Family of the rule's addresses; `None` when it matches any address.
    pub fn family(&self) -> Option<AddressFamily> {
        self.spec
            .source
            .map(|net| net.addr())
            .or(self.spec.destination.map(|net| net.addr()))
            .or(self.spec.target.nat_address().map(|nat| nat.addr))
            .map(AddressFamily::of)
    }

    pub fn spec(&self) -> &RuleSpec {
        &self.spec
    }

    pub fn into_spec(self) -> RuleSpec {
        self.spec
    }

    pub fn key(&self) -> ChainKey {
        self.spec.key
    }

    pub fn target(&self) -> &Target {
        &self.spec.target
    }

    /// Whether every field round-trips through command arguments.
    pub fn is_reproducible(&self) -> bool {
        self.spec.remainder.is_none()
    }
}

/// Raw, unvalidated rule input as typed by an operator or stored in a preset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleForm {
    pub protocol: Option<String>,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub source_port: Option<String>,
    pub destination_port: Option<String>,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub action: Option<String>,
    pub nat_to: Option<String>,
    pub comment: Option<String>,
}

impl RuleForm {
    /// Parses every field and validates the result for the given chain.
    pub fn into_rule(&self, key: ChainKey) -> Result<Rule, ValidationError> {
        let target = Target::from_action(
            self.action.as_deref().unwrap_or("ACCEPT"),
            self.nat_to.as_deref(),
        )?;

        let mut spec = RuleSpec::new(key, target);
        spec.protocol = self.protocol.as_deref().unwrap_or("").parse()?;
        spec.source = non_empty(&self.source)
            .map(|v| validate::network("source", v))
            .transpose()?;
        spec.destination = non_empty(&self.destination)
            .map(|v| validate::network("destination", v))
            .transpose()?;
        spec.source_port = non_empty(&self.source_port)
            .map(|v| validate::port("source port", v))
            .transpose()?;
        spec.destination_port = non_empty(&self.destination_port)
            .map(|v| validate::port("destination port", v))
            .transpose()?;
        spec.in_interface = non_empty(&self.in_interface).map(str::to_string);
        spec.out_interface = non_empty(&self.out_interface).map(str::to_string);
        spec.comment = self.comment.clone();

        Rule::new(spec)
    }

    /// Overlays every field set in `other` onto this form.
    pub fn merge(&mut self, other: &RuleForm) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field.clone();
                })*
            };
        }
        overlay!(
            protocol,
            source,
            destination,
            source_port,
            destination_port,
            in_interface,
            out_interface,
            action,
            nat_to,
            comment
        );
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
