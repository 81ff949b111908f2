//! Conversion between [`Rule`] values and iptables syntax.
//!
//! Two textual forms are handled:
//!
//! * command arguments, as passed to `iptables -A CHAIN ...` or printed by
//!   `iptables -S`, in a fixed canonical order;
//! * rows of the verbose numeric listing
//!   (`iptables -t TABLE -L CHAIN -n -v -x --line-numbers`).

use ct_core::validate;
use ct_core::{
    AddressFamily, ChainKey, Counters, NatAddress, ParseError, Position, Protocol, Rule, RuleSpec, Target,
};
use ipnet::IpNet;
use std::fmt::Write as _;

/// Columns before the free-form extras in a verbose listing row.
const VERBOSE_COLUMNS: usize = 10;
/// Columns before the extras in a listing produced without `-v`.
const TERSE_COLUMNS: usize = 6;

/// Canonical argument vector for a rule, excluding the chain operation.
///
/// Order: protocol, source, destination, source port, destination port,
/// in-interface, out-interface, comment, target and target options. Empty
/// fields produce no flag. A rule's opaque remainder is not reproduced.
pub fn to_command_args(rule: &Rule) -> Vec<String> {
    let spec = rule.spec();
    let mut args = Vec::new();
    let mut push = |flag: &str, value: String| {
        args.push(flag.to_string());
        args.push(value);
    };

    if spec.protocol != Protocol::All {
        push("-p", spec.protocol.as_str().to_string());
    }
    if let Some(net) = &spec.source {
        push("-s", address_text(net));
    }
    if let Some(net) = &spec.destination {
        push("-d", address_text(net));
    }
    if let Some(port) = spec.source_port {
        push("--sport", port.to_string());
    }
    if let Some(port) = spec.destination_port {
        push("--dport", port.to_string());
    }
    if let Some(iface) = &spec.in_interface {
        push("-i", iface.clone());
    }
    if let Some(iface) = &spec.out_interface {
        push("-o", iface.clone());
    }
    if let Some(comment) = &spec.comment {
        push("-m", "comment".to_string());
        push("--comment", comment.clone());
    }

    push("-j", spec.target.keyword().to_string());
    match &spec.target {
        Target::Dnat(addr) => push("--to-destination", addr.to_string()),
        Target::Snat(addr) => push("--to-source", addr.to_string()),
        _ => {}
    }

    args
}

/// Parses a rule-specification argument vector back into a rule.
///
/// Accepts the canonical form produced by [`to_command_args`] as well as the
/// long flag names and the implicit `-m tcp`/`-m udp` matches `iptables -S`
/// prints.
pub fn from_command_args<S: AsRef<str>>(key: ChainKey, args: &[S]) -> Result<Rule, ParseError> {
    let mut spec = RuleSpec::new(key, Target::Accept);
    let mut jump: Option<String> = None;
    let mut dnat_to: Option<String> = None;
    let mut snat_to: Option<String> = None;

    let mut tokens = args.iter().map(AsRef::as_ref);
    while let Some(flag) = tokens.next() {
        let mut value = || {
            tokens
                .next()
                .ok_or_else(|| ParseError::MissingValue(flag.to_string()))
        };

        match flag {
            "!" => {
                return Err(ParseError::Unsupported {
                    what: "negated match",
                    value: flag.to_string(),
                });
            }
            "-p" | "--protocol" => spec.protocol = value()?.parse()?,
            "-s" | "--source" => spec.source = Some(validate::network("source", value()?)?),
            "-d" | "--destination" => {
                spec.destination = Some(validate::network("destination", value()?)?)
            }
            "--sport" | "--source-port" => {
                spec.source_port = Some(port_value("source port", value()?)?)
            }
            "--dport" | "--destination-port" => {
                spec.destination_port = Some(port_value("destination port", value()?)?)
            }
            "-i" | "--in-interface" => spec.in_interface = Some(value()?.to_string()),
            "-o" | "--out-interface" => spec.out_interface = Some(value()?.to_string()),
            "-m" | "--match" => {
                let module = value()?;
                if !matches!(module, "comment" | "tcp" | "udp") {
                    return Err(ParseError::Unsupported {
                        what: "match module",
                        value: module.to_string(),
                    });
                }
            }
            "--comment" => spec.comment = Some(value()?.to_string()),
            "-j" | "--jump" => jump = Some(value()?.to_string()),
            "--to-destination" => dnat_to = Some(value()?.to_string()),
            "--to-source" => snat_to = Some(value()?.to_string()),
            other => return Err(ParseError::UnexpectedFlag(other.to_string())),
        }
    }

    let jump = jump.ok_or_else(|| ParseError::Malformed {
        what: "argument list",
        value: "no -j target".to_string(),
    })?;
    let keyword = known_target(&jump)?;
    let (nat_to, stray) = match keyword {
        "DNAT" => (dnat_to, snat_to.map(|_| "--to-source")),
        "SNAT" => (snat_to, dnat_to.map(|_| "--to-destination")),
        _ => (
            None,
            dnat_to
                .map(|_| "--to-destination")
                .or(snat_to.map(|_| "--to-source")),
        ),
    };
    if let Some(flag) = stray {
        return Err(ParseError::Malformed {
            what: "target options",
            value: format!("{} with -j {}", flag, keyword),
        });
    }

    spec.target = Target::from_action(keyword, nat_to.as_deref())?;
    Ok(Rule::new(spec)?)
}

/// One row of a chain listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRow {
    pub position: Position,
    pub counters: Counters,
    pub rule: Rule,
}

/// Parses one listing row into a rule belonging to `key`.
pub fn from_listing_line(key: ChainKey, line: &str) -> Result<Rule, ParseError> {
    parse_row(key, line).map(|row| row.rule)
}

/// Parses one listing row, keeping its position and packet counters.
///
/// Both the verbose layout (with counters and interfaces) and the plain
/// layout are recognised. Extras this crate does not model are kept verbatim
/// in the rule's remainder.
pub fn parse_row(key: ChainKey, line: &str) -> Result<ListingRow, ParseError> {
    let verbose = is_verbose_row(line);
    let (mut expected, opt_index) = if verbose {
        (VERBOSE_COLUMNS, 5)
    } else {
        (TERSE_COLUMNS, 3)
    };
    // ip6tables leaves the opt column blank.
    let (peek, _) = split_columns(line, opt_index + 1);
    let has_opt = peek.get(opt_index).is_some_and(|c| is_opt_column(c));
    if !has_opt {
        expected -= 1;
    }
    let (mut columns, extras) = split_columns(line, expected);
    if columns.len() < expected {
        return Err(ParseError::Truncated {
            expected,
            found: columns.len(),
        });
    }
    if !has_opt {
        columns.insert(opt_index, "--");
    }

    let position = columns[0]
        .parse::<u32>()
        .ok()
        .and_then(Position::new)
        .ok_or_else(|| ParseError::Malformed {
            what: "position",
            value: columns[0].to_string(),
        })?;

    let (counters, rest) = if verbose {
        (
            Counters {
                packets: counter("packet counter", columns[1])?,
                bytes: counter("byte counter", columns[2])?,
            },
            &columns[3..],
        )
    } else {
        (Counters::default(), &columns[1..])
    };

    // target prot opt [in out] source destination
    let keyword = known_target(rest[0])?;
    let protocol = column_protocol(rest[1])?;
    if rest[2] != "--" {
        return Err(ParseError::Unsupported {
            what: "fragment option",
            value: rest[2].to_string(),
        });
    }
    let (in_interface, out_interface, addrs) = if verbose {
        (
            column_interface("in", rest[3])?,
            column_interface("out", rest[4])?,
            &rest[5..],
        )
    } else {
        (None, None, &rest[3..])
    };

    let mut spec = RuleSpec::new(key, Target::Accept);
    spec.protocol = protocol;
    spec.in_interface = in_interface;
    spec.out_interface = out_interface;
    spec.source = column_address("source", addrs[0])?;
    spec.destination = column_address("destination", addrs[1])?;

    let parsed = parse_extras(keyword, protocol, extras)?;
    spec.source_port = parsed.source_port;
    spec.destination_port = parsed.destination_port;
    spec.comment = parsed.comment;
    spec.remainder = (!parsed.remainder.is_empty()).then(|| parsed.remainder.join(" "));
    spec.target = Target::from_action(keyword, parsed.nat_to.as_deref())?;

    Ok(ListingRow {
        position,
        counters,
        rule: Rule::new(spec)?,
    })
}

/// Renders the verbose listing row the kernel would print for `rule` at
/// `position`, with zeroed counters.
pub fn render_listing_line(position: Position, rule: &Rule) -> String {
    render_listing_row(position, Counters::default(), rule)
}

pub fn render_listing_row(position: Position, counters: Counters, rule: &Rule) -> String {
    render_row(position, counters, rule, AddressFamily::Ipv4)
}

/// Renders a row the way `ip6tables` lists it: blank opt column, `::/0`
/// for unset addresses.
pub fn render_ip6_listing_row(position: Position, counters: Counters, rule: &Rule) -> String {
    render_row(position, counters, rule, AddressFamily::Ipv6)
}

fn render_row(position: Position, counters: Counters, rule: &Rule, tool: AddressFamily) -> String {
    let spec = rule.spec();
    let (any, opt) = match tool {
        AddressFamily::Ipv6 => ("::/0", ""),
        AddressFamily::Ipv4 => (any_address(spec), "--"),
    };

    let mut line = format!(
        "{:<4} {:>8} {:>8} {:<10} {:<4} {:<3} {:<6} {:<6} {:<20} {:<20}",
        position.get(),
        counters.packets,
        counters.bytes,
        spec.target.keyword(),
        spec.protocol.as_str(),
        opt,
        spec.in_interface.as_deref().unwrap_or("*"),
        spec.out_interface.as_deref().unwrap_or("*"),
        spec.source.as_ref().map(address_text).unwrap_or_else(|| any.to_string()),
        spec.destination
            .as_ref()
            .map(address_text)
            .unwrap_or_else(|| any.to_string()),
    );

    let mut extras = Vec::new();
    if spec.source_port.is_some() || spec.destination_port.is_some() {
        let mut ports = spec.protocol.as_str().to_string();
        if let Some(port) = spec.source_port {
            let _ = write!(ports, " spt:{}", port);
        }
        if let Some(port) = spec.destination_port {
            let _ = write!(ports, " dpt:{}", port);
        }
        extras.push(ports);
    }
    if let Some(comment) = &spec.comment {
        extras.push(format!("/* {} */", comment));
    }
    match &spec.target {
        Target::Dnat(addr) | Target::Snat(addr) => extras.push(format!("to:{}", addr)),
        Target::Reject if any == "::/0" => extras.push("reject-with icmp6-port-unreachable".into()),
        Target::Reject => extras.push("reject-with icmp-port-unreachable".into()),
        _ => {}
    }
    if let Some(remainder) = &spec.remainder {
        extras.push(remainder.clone());
    }

    if extras.is_empty() {
        line.truncate(line.trim_end().len());
    } else {
        line.push(' ');
        line.push_str(&extras.join(" "));
    }
    line
}

/// Listing text of an address: host networks print as a bare address.
pub fn address_text(net: &IpNet) -> String {
    if net.prefix_len() == net.max_prefix_len() {
        net.addr().to_string()
    } else {
        net.to_string()
    }
}

/// Splits the first `n` whitespace-separated columns off `line` and returns
/// them together with the untouched rest of the line.
pub(crate) fn split_columns(line: &str, n: usize) -> (Vec<&str>, &str) {
    let mut rest = line.trim_start();
    let mut columns = Vec::with_capacity(n);
    while columns.len() < n && !rest.is_empty() {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        columns.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    (columns, rest.trim_end())
}

/// `--` or a fragment flag; anything else means the column was left blank.
fn is_opt_column(value: &str) -> bool {
    matches!(value, "--" | "-f" | "!f")
}

fn is_verbose_row(line: &str) -> bool {
    let (columns, _) = split_columns(line, 3);
    columns.len() == 3 && counter("", columns[1]).is_ok() && counter("", columns[2]).is_ok()
}

/// Parses a counter column; listings without `-x` abbreviate with K/M/G/T.
fn counter(what: &'static str, value: &str) -> Result<u64, ParseError> {
    let malformed = || ParseError::Malformed {
        what,
        value: value.to_string(),
    };
    let (digits, scale) = match value.char_indices().last() {
        Some((i, 'K')) => (&value[..i], 1_000),
        Some((i, 'M')) => (&value[..i], 1_000_000),
        Some((i, 'G')) => (&value[..i], 1_000_000_000),
        Some((i, 'T')) => (&value[..i], 1_000_000_000_000),
        _ => (value, 1),
    };
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .ok_or_else(malformed)
}

fn known_target(keyword: &str) -> Result<&'static str, ParseError> {
    match keyword {
        "ACCEPT" => Ok("ACCEPT"),
        "DROP" => Ok("DROP"),
        "REJECT" => Ok("REJECT"),
        "DNAT" => Ok("DNAT"),
        "SNAT" => Ok("SNAT"),
        "MASQUERADE" => Ok("MASQUERADE"),
        other => Err(ParseError::UnknownTarget(other.to_string())),
    }
}

fn unsupported_negation(what: &'static str, value: &str) -> Result<(), ParseError> {
    if value.starts_with('!') {
        return Err(ParseError::Unsupported {
            what,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn column_protocol(value: &str) -> Result<Protocol, ParseError> {
    unsupported_negation("negated protocol", value)?;
    value.parse::<Protocol>().map_err(|_| ParseError::Unsupported {
        what: "protocol",
        value: value.to_string(),
    })
}

fn column_interface(field: &'static str, value: &str) -> Result<Option<String>, ParseError> {
    unsupported_negation("negated interface", value)?;
    if value == "*" {
        return Ok(None);
    }
    validate::interface(field, value)?;
    Ok(Some(value.to_string()))
}

fn column_address(field: &'static str, value: &str) -> Result<Option<IpNet>, ParseError> {
    unsupported_negation("negated address", value)?;
    if value == "0.0.0.0/0" || value == "::/0" {
        return Ok(None);
    }
    Ok(Some(validate::network(field, value)?))
}

fn port_value(field: &'static str, value: &str) -> Result<u16, ParseError> {
    if value.contains(':') || value.contains(',') {
        return Err(ParseError::Unsupported {
            what: "port range",
            value: value.to_string(),
        });
    }
    Ok(validate::port(field, value)?)
}

#[derive(Default)]
struct Extras {
    source_port: Option<u16>,
    destination_port: Option<u16>,
    comment: Option<String>,
    nat_to: Option<String>,
    remainder: Vec<String>,
}

fn parse_extras(target: &str, protocol: Protocol, text: &str) -> Result<Extras, ParseError> {
    let mut extras = Extras::default();

    // The comment is free text and may contain anything but `*/`, so it is
    // cut out of the line before tokenizing.
    let mut rest = text.to_string();
    if let Some(start) = rest.find("/* ") {
        let body = &rest[start + 3..];
        let end = body.find(" */").ok_or_else(|| ParseError::Malformed {
            what: "comment",
            value: rest[start..].to_string(),
        })?;
        extras.comment = Some(body[..end].to_string());
        rest = format!("{} {}", &rest[..start], &body[end + 3..]);
    }

    let mut tokens = rest.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        if token == protocol.as_str() && protocol.has_ports() {
            continue;
        }
        if let Some(port) = token.strip_prefix("spt:") {
            extras.source_port = Some(port_value("source port", port)?);
        } else if let Some(port) = token.strip_prefix("dpt:") {
            extras.destination_port = Some(port_value("destination port", port)?);
        } else if let Some(addr) = token.strip_prefix("to:") {
            if matches!(target, "DNAT" | "SNAT") && extras.nat_to.is_none() {
                extras.nat_to = Some(addr.to_string());
            } else {
                extras.remainder.push(token.to_string());
            }
        } else if token == "reject-with" && target == "REJECT" {
            match tokens.next() {
                Some("icmp-port-unreachable") | Some("icmp6-port-unreachable") => {}
                Some(kind) => {
                    extras.remainder.push(token.to_string());
                    extras.remainder.push(kind.to_string());
                }
                None => return Err(ParseError::MissingValue(token.to_string())),
            }
        } else {
            extras.remainder.push(token.to_string());
        }
    }

    Ok(extras)
}

fn any_address(spec: &RuleSpec) -> &'static str {
    let v6 = [spec.source, spec.destination]
        .iter()
        .flatten()
        .any(|net| matches!(net, IpNet::V6(_)))
        || spec
            .target
            .nat_address()
            .is_some_and(|NatAddress { addr, .. }| addr.is_ipv6());
    if v6 { "::/0" } else { "0.0.0.0/0" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ct_core::{Chain, RuleForm, Table};
    use proptest::prelude::*;

    fn input() -> ChainKey {
        ChainKey::new(Table::Filter, Chain::Input).unwrap()
    }

    fn prerouting() -> ChainKey {
        ChainKey::new(Table::Nat, Chain::Prerouting).unwrap()
    }

    fn rule(key: ChainKey, form: RuleForm) -> Rule {
        form.into_rule(key).unwrap()
    }

    #[test]
    fn ssh_accept_has_canonical_args() {
        let rule = rule(
            input(),
            RuleForm {
                protocol: Some("tcp".into()),
                destination_port: Some("22".into()),
                action: Some("ACCEPT".into()),
                ..Default::default()
            },
        );
        assert_eq!(to_command_args(&rule).join(" "), "-p tcp --dport 22 -j ACCEPT");
    }

    #[test]
    fn dnat_has_canonical_args() {
        let rule = rule(
            prerouting(),
            RuleForm {
                protocol: Some("tcp".into()),
                destination_port: Some("80".into()),
                action: Some("DNAT".into()),
                nat_to: Some("10.0.0.5:8080".into()),
                ..Default::default()
            },
        );
        assert_eq!(
            to_command_args(&rule).join(" "),
            "-p tcp --dport 80 -j DNAT --to-destination 10.0.0.5:8080"
        );
    }

    #[test]
    fn every_field_in_canonical_order() {
        let rule = rule(
            ChainKey::new(Table::Filter, Chain::Forward).unwrap(),
            RuleForm {
                protocol: Some("udp".into()),
                source: Some("10.0.0.0/8".into()),
                destination: Some("192.168.1.10".into()),
                source_port: Some("5353".into()),
                destination_port: Some("53".into()),
                in_interface: Some("eth0".into()),
                out_interface: Some("wg+".into()),
                action: Some("DROP".into()),
                comment: Some("block dns; rm -rf /".into()),
                ..Default::default()
            },
        );
        assert_eq!(
            to_command_args(&rule),
            vec![
                "-p", "udp", "-s", "10.0.0.0/8", "-d", "192.168.1.10", "--sport", "5353",
                "--dport", "53", "-i", "eth0", "-o", "wg+", "-m", "comment", "--comment",
                "block dns; rm -rf /", "-j", "DROP",
            ]
        );
    }

    #[test]
    fn comment_stays_a_single_argument() {
        let rule = rule(
            input(),
            RuleForm {
                comment: Some("a \"quoted\" $(whoami) comment".into()),
                ..Default::default()
            },
        );
        let args = to_command_args(&rule);
        let at = args.iter().position(|a| a == "--comment").unwrap();
        assert_eq!(args[at + 1], "a \"quoted\" $(whoami) comment");
    }

    #[test]
    fn command_args_parse_back() {
        let args = ["-p", "tcp", "-m", "tcp", "--dport", "443", "-s", "10.1.0.0/16", "-j", "ACCEPT"];
        let rule = from_command_args(input(), &args).unwrap();
        assert_eq!(rule.spec().destination_port, Some(443));
        assert_eq!(rule.spec().source.unwrap().to_string(), "10.1.0.0/16");
    }

    #[test]
    fn command_args_errors() {
        assert_eq!(
            from_command_args(input(), &["-p", "tcp", "-j", "LOG"]),
            Err(ParseError::UnknownTarget("LOG".into()))
        );
        assert_eq!(
            from_command_args(input(), &["-p"]),
            Err(ParseError::MissingValue("-p".into()))
        );
        assert_eq!(
            from_command_args(input(), &["--state", "NEW", "-j", "ACCEPT"]),
            Err(ParseError::UnexpectedFlag("--state".into()))
        );
        assert!(matches!(
            from_command_args(input(), &["-p", "tcp"]),
            Err(ParseError::Malformed { .. })
        ));
        assert!(matches!(
            from_command_args(input(), &["-j", "ACCEPT", "--to-destination", "10.0.0.1"]),
            Err(ParseError::Malformed { .. })
        ));
        assert!(matches!(
            from_command_args(prerouting(), &["-j", "DNAT"]),
            Err(ParseError::Invalid(_))
        ));
    }

    #[test]
    fn parses_verbose_listing_row() {
        let line = "3     1520   91200 ACCEPT     tcp  --  eth0   *       10.0.0.0/8           0.0.0.0/0            tcp dpt:22 /* allow  ssh */";
        let row = parse_row(input(), line).unwrap();
        assert_eq!(row.position.get(), 3);
        assert_eq!(row.counters.packets, 1520);
        assert_eq!(row.counters.bytes, 91200);

        let spec = row.rule.spec();
        assert_eq!(spec.protocol, Protocol::Tcp);
        assert_eq!(spec.in_interface.as_deref(), Some("eth0"));
        assert!(spec.out_interface.is_none());
        assert_eq!(spec.source.unwrap().to_string(), "10.0.0.0/8");
        assert!(spec.destination.is_none());
        assert_eq!(spec.destination_port, Some(22));
        assert_eq!(spec.comment.as_deref(), Some("allow  ssh"));
        assert!(spec.remainder.is_none());
    }

    #[test]
    fn parses_plain_listing_row() {
        let line = "1    DNAT       6    --  0.0.0.0/0            0.0.0.0/0            tcp dpt:80 to:10.0.0.5:8080";
        let rule = from_listing_line(prerouting(), line).unwrap();
        assert_eq!(rule.spec().protocol, Protocol::Tcp);
        assert_eq!(rule.target().nat_address().unwrap().to_string(), "10.0.0.5:8080");
    }

    #[test]
    fn unknown_extras_become_remainder() {
        let line = "1        0        0 ACCEPT     all  --  *      *       0.0.0.0/0            0.0.0.0/0            ctstate RELATED,ESTABLISHED";
        let rule = from_listing_line(input(), line).unwrap();
        assert_eq!(rule.spec().remainder.as_deref(), Some("ctstate RELATED,ESTABLISHED"));
        assert!(!rule.is_reproducible());

        let line = "2        0        0 REJECT     all  --  *      *       0.0.0.0/0            0.0.0.0/0            reject-with icmp-host-prohibited";
        let rule = from_listing_line(input(), line).unwrap();
        assert_eq!(rule.spec().remainder.as_deref(), Some("reject-with icmp-host-prohibited"));
    }

    #[test]
    fn listing_row_errors() {
        let unknown = "1 0 0 DOCKER all -- * * 0.0.0.0/0 0.0.0.0/0";
        assert_eq!(
            from_listing_line(input(), unknown),
            Err(ParseError::UnknownTarget("DOCKER".into()))
        );

        let negated = "1 0 0 DROP all -- !lo * 127.0.0.0/8 0.0.0.0/0";
        assert!(matches!(
            from_listing_line(input(), negated),
            Err(ParseError::Unsupported { .. })
        ));

        let truncated = "1 0 0 DROP all --";
        assert!(matches!(
            from_listing_line(input(), truncated),
            Err(ParseError::Truncated { .. })
        ));

        let range = "1 0 0 ACCEPT tcp -- * * 0.0.0.0/0 0.0.0.0/0 tcp dpts:1000:2000";
        let rule = from_listing_line(input(), range).unwrap();
        assert_eq!(rule.spec().remainder.as_deref(), Some("dpts:1000:2000"));
    }

    #[test]
    fn abbreviated_counters_are_scaled() {
        let line = "1 12K 3M ACCEPT all -- lo * 0.0.0.0/0 0.0.0.0/0";
        let row = parse_row(input(), line).unwrap();
        assert_eq!(row.counters.packets, 12_000);
        assert_eq!(row.counters.bytes, 3_000_000);
    }

    #[test]
    fn rendered_row_matches_kernel_layout() {
        let rule = rule(
            input(),
            RuleForm {
                protocol: Some("tcp".into()),
                destination_port: Some("22".into()),
                source: Some("10.0.0.1".into()),
                comment: Some("ssh".into()),
                ..Default::default()
            },
        );
        let line = render_listing_line(Position::new(1).unwrap(), &rule);
        let tokens: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(
            tokens,
            vec![
                "1", "0", "0", "ACCEPT", "tcp", "--", "*", "*", "10.0.0.1", "0.0.0.0/0", "tcp",
                "dpt:22", "/*", "ssh", "*/",
            ]
        );
    }

    prop_compose! {
        fn arb_v4_network()(addr in any::<[u8; 4]>(), prefix in 0u8..=32) -> IpNet {
            IpNet::new(std::net::Ipv4Addr::from(addr).into(), prefix).unwrap().trunc()
        }
    }

    prop_compose! {
        fn arb_v6_network()(addr in any::<[u8; 16]>(), prefix in 0u8..=128) -> IpNet {
            IpNet::new(std::net::Ipv6Addr::from(addr).into(), prefix).unwrap().trunc()
        }
    }

    fn arb_network(family: AddressFamily) -> BoxedStrategy<IpNet> {
        match family {
            AddressFamily::Ipv4 => arb_v4_network().boxed(),
            AddressFamily::Ipv6 => arb_v6_network().boxed(),
        }
    }

    fn arb_family() -> impl Strategy<Value = AddressFamily> {
        prop::sample::select(vec![AddressFamily::Ipv4, AddressFamily::Ipv6])
    }

    fn arb_interface() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9]{0,13}\\+?"
    }

    fn arb_comment() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9][a-zA-Z0-9 _.,-]{0,40}"
    }

    prop_compose! {
        fn arb_filter_rule()(family in arb_family())(
            source in prop::option::of(arb_network(family)),
            destination in prop::option::of(arb_network(family)),
            chain in prop::sample::select(vec![Chain::Input, Chain::Forward, Chain::Output]),
            protocol in prop::sample::select(vec![Protocol::All, Protocol::Tcp, Protocol::Udp, Protocol::Icmp]),
            sport in prop::option::of(1u16..),
            dport in prop::option::of(1u16..),
            in_interface in prop::option::of(arb_interface()),
            out_interface in prop::option::of(arb_interface()),
            target in prop::sample::select(vec![Target::Accept, Target::Drop, Target::Reject]),
            comment in prop::option::of(arb_comment()),
        ) -> Rule {
            let key = ChainKey::new(Table::Filter, chain).unwrap();
            let mut spec = RuleSpec::new(key, target);
            spec.protocol = protocol;
            spec.source = source;
            spec.destination = destination;
            if protocol.has_ports() {
                spec.source_port = sport;
                spec.destination_port = dport;
            }
            spec.in_interface = in_interface;
            spec.out_interface = out_interface;
            spec.comment = comment;
            Rule::new(spec).unwrap()
        }
    }

    prop_compose! {
        fn arb_nat_rule()(
            dnat in any::<bool>(),
            protocol in prop::sample::select(vec![Protocol::Tcp, Protocol::Udp]),
            dport in prop::option::of(1u16..),
            to in prop_oneof![
                any::<[u8; 4]>().prop_map(|a| std::net::IpAddr::from(a)),
                any::<[u8; 16]>().prop_map(|a| std::net::IpAddr::from(a)),
            ],
            to_port in prop::option::of(1u16..),
            comment in prop::option::of(arb_comment()),
        ) -> Rule {
            let addr = NatAddress { addr: to, port: to_port };
            let (chain, target) = if dnat {
                (Chain::Prerouting, Target::Dnat(addr))
            } else {
                (Chain::Postrouting, Target::Snat(addr))
            };
            let mut spec = RuleSpec::new(ChainKey::new(Table::Nat, chain).unwrap(), target);
            spec.protocol = protocol;
            spec.destination_port = dport;
            spec.comment = comment;
            Rule::new(spec).unwrap()
        }
    }

    fn arb_rule() -> impl Strategy<Value = Rule> {
        prop_oneof![arb_filter_rule(), arb_nat_rule()]
    }

    fn arb_ip6_rule() -> impl Strategy<Value = Rule> {
        arb_rule().prop_filter("IPv4 addresses", |rule| {
            rule.family() != Some(AddressFamily::Ipv4)
        })
    }

    #[test]
    fn parses_ip6tables_row_without_opt_column() {
        let row = parse_row(input(), "1 0 0 ACCEPT all lo * ::/0 ::/0").unwrap();
        assert_eq!(row.rule.spec().in_interface.as_deref(), Some("lo"));
        assert!(row.rule.spec().source.is_none());

        let line = "2      310    24800 ACCEPT     tcp      eth0   *       2001:db8::/32        ::/0                 tcp dpt:22 /* ssh v6 */";
        let row = parse_row(input(), line).unwrap();
        assert_eq!(row.counters.packets, 310);
        let spec = row.rule.spec();
        assert_eq!(spec.source.unwrap().to_string(), "2001:db8::/32");
        assert_eq!(spec.destination_port, Some(22));
        assert_eq!(spec.comment.as_deref(), Some("ssh v6"));

        let plain = "1    DROP       all      2001:db8::1          ::/0";
        let rule = from_listing_line(input(), plain).unwrap();
        assert_eq!(rule.spec().source.unwrap().to_string(), "2001:db8::1/128");
        assert_eq!(rule.target(), &Target::Drop);

        let reject = "3 0 0 REJECT all * * ::/0 ::/0 reject-with icmp6-port-unreachable";
        let rule = from_listing_line(input(), reject).unwrap();
        assert!(rule.is_reproducible());
    }

    #[test]
    fn fragment_option_is_still_refused() {
        let line = "1 0 0 DROP all -f * * 0.0.0.0/0 0.0.0.0/0";
        assert!(matches!(
            from_listing_line(input(), line),
            Err(ParseError::Unsupported { what: "fragment option", .. })
        ));
    }

    #[test]
    fn ip6_row_leaves_opt_blank() {
        let rule = rule(
            input(),
            RuleForm {
                action: Some("REJECT".into()),
                ..Default::default()
            },
        );
        let line = render_ip6_listing_row(Position::new(1).unwrap(), Counters::default(), &rule);
        let tokens: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(
            tokens,
            vec![
                "1", "0", "0", "REJECT", "all", "*", "*", "::/0", "::/0", "reject-with",
                "icmp6-port-unreachable",
            ]
        );
    }

    proptest! {
        #[test]
        fn ip6_listing_round_trip(rule in arb_ip6_rule(), position in 1u32..500) {
            let line = render_ip6_listing_row(Position::new(position).unwrap(), Counters::default(), &rule);
            let row = parse_row(rule.key(), &line).unwrap();
            prop_assert_eq!(row.position.get(), position);
            prop_assert_eq!(row.rule, rule);
        }

        #[test]
        fn listing_round_trip(rule in arb_rule(), position in 1u32..500) {
            let line = render_listing_line(Position::new(position).unwrap(), &rule);
            let row = parse_row(rule.key(), &line).unwrap();
            prop_assert_eq!(row.position.get(), position);
            prop_assert_eq!(row.rule, rule);
        }

        #[test]
        fn command_args_round_trip(rule in arb_rule()) {
            let args = to_command_args(&rule);
            prop_assert_eq!(from_command_args(rule.key(), &args).unwrap(), rule);
        }

        #[test]
        fn command_args_are_deterministic(rule in arb_rule()) {
            let first = to_command_args(&rule);
            let second = to_command_args(&rule.clone());
            prop_assert_eq!(&first, &second);
            prop_assert!(first.iter().all(|arg| !arg.is_empty()));
        }
    }
}
