//! In-memory stand-in for the `iptables` and `ip6tables` binaries.
//!
//! Understands the invocations [`CommandExecutor`](crate::CommandExecutor)
//! issues, keeps per-chain rule lists, prints listings in the verbose numeric
//! dialect, and can be told to fail, time out or return garbage.

use crate::backend::{BackendError, RuleBackend, ToolOutput};
use crate::translator::{from_command_args, render_ip6_listing_row, render_listing_row};
use ct_core::{AddressFamily, ChainKey, Counters, Position, Rule};
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Kind of invocation a fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Mutate,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Exit non-zero without touching any chain.
    Fail { exit_code: i32, stderr: String },
    /// Report a timeout without touching any chain.
    Timeout,
    /// Apply the mutation, then report a timeout.
    TimeoutAfterApply,
    /// Print this text instead of a listing.
    Garbage(String),
}

impl Fault {
    pub fn fail(exit_code: i32, stderr: impl Into<String>) -> Self {
        Fault::Fail {
            exit_code,
            stderr: stderr.into(),
        }
    }
}

#[derive(Debug, Clone)]
enum Row {
    Rule(Rule, Counters),
    /// Listing text after the counters, for rules this crate cannot model.
    Raw(String),
}

#[derive(Debug, Clone)]
struct SimChain {
    policy: String,
    rows: Vec<Row>,
}

impl Default for SimChain {
    fn default() -> Self {
        Self {
            policy: "ACCEPT".to_string(),
            rows: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    family: Option<AddressFamily>,
    chains: HashMap<ChainKey, SimChain>,
    faults: HashMap<Op, VecDeque<Fault>>,
    invocations: Vec<Vec<String>>,
    in_flight: HashMap<ChainKey, usize>,
    max_in_flight: HashMap<ChainKey, usize>,
}

#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    state: Arc<Mutex<SimState>>,
    latency: Duration,
    timeout: Duration,
    program: &'static str,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

enum Command {
    Append(Vec<String>),
    Insert(Position, Vec<String>),
    Delete(Position),
    List,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            latency: Duration::ZERO,
            timeout: Duration::from_secs(10),
            program: "iptables",
        }
    }

    /// Emulates `ip6tables`: IPv6 only, listings with a blank opt column.
    pub fn ip6tables() -> Self {
        let sim = Self {
            program: "ip6tables",
            ..Self::new()
        };
        sim.lock().family = Some(AddressFamily::Ipv6);
        sim
    }

    /// Delay every invocation, to make overlapping calls observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues a fault for the next invocation of kind `op`.
    pub fn inject(&self, op: Op, fault: Fault) {
        self.lock().faults.entry(op).or_default().push_back(fault);
    }

    pub fn seed(&self, key: ChainKey, rules: impl IntoIterator<Item = Rule>) {
        let mut state = self.lock();
        let chain = state.chains.entry(key).or_default();
        chain
            .rows
            .extend(rules.into_iter().map(|rule| Row::Rule(rule, Counters::default())));
    }

    /// Adds a row the translator will not understand, e.g. a jump to a user chain.
    pub fn seed_raw(&self, key: ChainKey, body: impl Into<String>) {
        self.lock()
            .chains
            .entry(key)
            .or_default()
            .rows
            .push(Row::Raw(body.into()));
    }

    pub fn set_policy(&self, key: ChainKey, policy: impl Into<String>) {
        self.lock().chains.entry(key).or_default().policy = policy.into();
    }

    /// Sets the counters of the rule at `position`.
    pub fn count(&self, key: ChainKey, position: Position, packets: u64, bytes: u64) {
        let mut state = self.lock();
        if let Some(Row::Rule(_, counters)) = state
            .chains
            .get_mut(&key)
            .and_then(|chain| chain.rows.get_mut(position.index()))
        {
            *counters = Counters { packets, bytes };
        }
    }

    /// Parsed rules currently in a chain; raw rows are skipped.
    pub fn rules(&self, key: ChainKey) -> Vec<Rule> {
        self.lock()
            .chains
            .get(&key)
            .map(|chain| {
                chain
                    .rows
                    .iter()
                    .filter_map(|row| match row {
                        Row::Rule(rule, _) => Some(rule.clone()),
                        Row::Raw(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn row_count(&self, key: ChainKey) -> usize {
        self.lock().chains.get(&key).map_or(0, |chain| chain.rows.len())
    }

    pub fn invocations(&self) -> Vec<Vec<String>> {
        self.lock().invocations.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.lock()
            .invocations
            .iter()
            .filter(|args| args.iter().any(|a| matches!(a.as_str(), "-A" | "-I" | "-D")))
            .count()
    }

    /// Highest number of simultaneous invocations seen on one chain.
    pub fn max_in_flight(&self, key: ChainKey) -> usize {
        self.lock().max_in_flight.get(&key).copied().unwrap_or(0)
    }

    fn timeout_error(&self) -> BackendError {
        BackendError::Timeout {
            program: self.program.to_string(),
            after: self.timeout,
        }
    }

    fn execute(&self, args: &[String]) -> Result<ToolOutput, BackendError> {
        let mut state = self.lock();
        state.invocations.push(args.to_vec());

        let (key, command) = match parse_invocation(args) {
            Ok(parsed) => parsed,
            Err(message) => return Ok(failure(2, message)),
        };
        let op = match command {
            Command::List => Op::List,
            _ => Op::Mutate,
        };
        let fault = state.faults.get_mut(&op).and_then(VecDeque::pop_front);

        match (fault, command) {
            (Some(Fault::Fail { exit_code, stderr }), _) => Ok(failure(exit_code, stderr)),
            (Some(Fault::Timeout), _) => Err(self.timeout_error()),
            (Some(Fault::Garbage(text)), Command::List) => Ok(ToolOutput {
                exit_code: Some(0),
                stdout: text,
                stderr: String::new(),
            }),
            (Some(Fault::TimeoutAfterApply), command) => {
                let _ = state.run(key, command);
                Err(self.timeout_error())
            }
            (_, command) => Ok(state.run(key, command)),
        }
    }
}

impl RuleBackend for SimulatedBackend {
    async fn run(&self, args: &[String]) -> Result<ToolOutput, BackendError> {
        let key = parse_invocation(args).ok().map(|(key, _)| key);
        if let Some(key) = key {
            let mut state = self.lock();
            let in_flight = state.in_flight.entry(key).or_default();
            *in_flight += 1;
            let current = *in_flight;
            let max = state.max_in_flight.entry(key).or_default();
            *max = (*max).max(current);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = self.execute(args);

        if let Some(key) = key {
            if let Some(in_flight) = self.lock().in_flight.get_mut(&key) {
                *in_flight = in_flight.saturating_sub(1);
            }
        }
        result
    }

    fn program(&self) -> &str {
        self.program
    }
}

impl SimState {
    fn run(&mut self, key: ChainKey, command: Command) -> ToolOutput {
        let family = self.family.unwrap_or(AddressFamily::Ipv4);
        let program = match family {
            AddressFamily::Ipv4 => "iptables",
            AddressFamily::Ipv6 => "ip6tables",
        };
        let chain = self.chains.entry(key).or_default();
        match command {
            Command::Append(rule_args) => match rule_from(key, family, &rule_args) {
                Ok(rule) => {
                    chain.rows.push(Row::Rule(rule, Counters::default()));
                    success(String::new())
                }
                Err(e) => failure(2, format!("{} v1.8.10 (legacy): {}\n", program, e)),
            },
            Command::Insert(position, rule_args) => {
                if position.index() > chain.rows.len() {
                    return failure(1, format!("{}: Index of insertion too big.\n", program));
                }
                match rule_from(key, family, &rule_args) {
                    Ok(rule) => {
                        chain
                            .rows
                            .insert(position.index(), Row::Rule(rule, Counters::default()));
                        success(String::new())
                    }
                    Err(e) => failure(2, format!("{} v1.8.10 (legacy): {}\n", program, e)),
                }
            }
            Command::Delete(position) => {
                if position.index() >= chain.rows.len() {
                    return failure(1, format!("{}: Index of deletion too big.\n", program));
                }
                chain.rows.remove(position.index());
                success(String::new())
            }
            Command::List => success(render_chain(key, family, chain)),
        }
    }
}

/// Parses rule arguments, refusing addresses of the other family.
fn rule_from(key: ChainKey, family: AddressFamily, args: &[String]) -> Result<Rule, String> {
    let rule = from_command_args(key, args).map_err(|e| e.to_string())?;
    match rule.family() {
        Some(found) if found != family => Err(format!("{} address in {} rule", found, family)),
        _ => Ok(rule),
    }
}

fn render_chain(key: ChainKey, family: AddressFamily, chain: &SimChain) -> String {
    let mut out = format!(
        "Chain {} (policy {} 0 packets, 0 bytes)\n",
        key.chain, chain.policy
    );
    out.push_str(
        "num      pkts      bytes target     prot opt in     out     source               destination\n",
    );
    for (index, row) in chain.rows.iter().enumerate() {
        let position = Position::from_index(index);
        match row {
            Row::Rule(rule, counters) => out.push_str(&match family {
                AddressFamily::Ipv4 => render_listing_row(position, *counters, rule),
                AddressFamily::Ipv6 => render_ip6_listing_row(position, *counters, rule),
            }),
            Row::Raw(body) => {
                let _ = write!(out, "{:<4} {:>8} {:>8} {}", position.get(), 0, 0, body);
            }
        }
        out.push('\n');
    }
    out
}

fn success(stdout: String) -> ToolOutput {
    ToolOutput {
        exit_code: Some(0),
        stdout,
        stderr: String::new(),
    }
}

fn failure(exit_code: i32, stderr: impl Into<String>) -> ToolOutput {
    ToolOutput {
        exit_code: Some(exit_code),
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

/// Splits `-t TABLE [-w N] OP CHAIN [N] [RULE...]`.
fn parse_invocation(args: &[String]) -> Result<(ChainKey, Command), String> {
    let mut rest = args;
    let mut table = "filter";
    loop {
        match rest {
            [flag, value, tail @ ..] if flag == "-t" => {
                table = value;
                rest = tail;
            }
            [flag, _, tail @ ..] if flag == "-w" => rest = tail,
            _ => break,
        }
    }

    let (op, chain, tail) = match rest {
        [op, chain, tail @ ..] => (op.as_str(), chain.as_str(), tail),
        _ => return Err("iptables: no command specified\n".to_string()),
    };
    let key = ChainKey::parse(table, chain)
        .map_err(|_| "iptables: No chain/target/match by that name.\n".to_string())?;

    let position = |token: Option<&String>| {
        token
            .and_then(|t| t.parse::<u32>().ok())
            .and_then(Position::new)
            .ok_or_else(|| "iptables: Invalid rule number\n".to_string())
    };

    let command = match op {
        "-A" => Command::Append(tail.to_vec()),
        "-I" => match tail.first().map(|t| t.parse::<u32>()) {
            Some(Ok(_)) => Command::Insert(position(tail.first())?, tail[1..].to_vec()),
            _ => Command::Insert(Position::from_index(0), tail.to_vec()),
        },
        "-D" => Command::Delete(position(tail.first())?),
        "-L" => Command::List,
        other => return Err(format!("iptables: unknown option \"{}\"\n", other)),
    };
    Ok((key, command))
}
