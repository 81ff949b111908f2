use crate::backend::{BackendError, RuleBackend, ToolOutput};
use crate::listing::{Listing, parse_listing};
use crate::translator::to_command_args;
use ct_core::{AddressFamily, ChainKey, Error, ExecutionError, Mutation, ValidationError};

/// Issues single rule-table invocations through a [`RuleBackend`].
///
/// Every mutation is one tool call; the tool either applies the whole rule
/// or nothing. Retrying is left to the caller since re-adding a rule
/// duplicates it.
pub struct CommandExecutor<B> {
    backend: B,
    lock_wait_secs: u32,
    dry_run: bool,
}

impl<B: RuleBackend> CommandExecutor<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            lock_wait_secs: 0,
            dry_run: false,
        }
    }

    /// Passes `-w SECS` so concurrent iptables users wait for the xtables lock.
    pub fn with_lock_wait(mut self, secs: u32) -> Self {
        self.lock_wait_secs = secs;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn table_args(&self, key: ChainKey) -> Vec<String> {
        let mut args = vec!["-t".to_string(), key.table.as_str().to_string()];
        if self.lock_wait_secs > 0 {
            args.push("-w".to_string());
            args.push(self.lock_wait_secs.to_string());
        }
        args
    }

    /// Full argument vector for a mutation.
    pub fn mutation_args(&self, key: ChainKey, mutation: &Mutation) -> Result<Vec<String>, ValidationError> {
        let mut args = self.table_args(key);
        let chain = key.chain.as_str().to_string();
        match mutation {
            Mutation::Insert { rule, at } => {
                if rule.key() != key {
                    return Err(ValidationError::ForeignChain {
                        key,
                        rule_key: rule.key(),
                    });
                }
                if let Some(remainder) = &rule.spec().remainder {
                    return Err(ValidationError::Unreproducible(remainder.clone()));
                }
                let program = self.backend.program();
                let program_family = AddressFamily::of_tool(program);
                if let Some(family) = rule.family().filter(|f| *f != program_family) {
                    return Err(ValidationError::FamilyMismatch {
                        rule: family,
                        program: program.to_string(),
                        program_family,
                    });
                }
                match at {
                    Some(position) => {
                        args.extend(["-I".to_string(), chain, position.to_string()])
                    }
                    None => args.extend(["-A".to_string(), chain]),
                }
                args.extend(to_command_args(rule));
            }
            Mutation::Delete { position } => {
                args.extend(["-D".to_string(), chain, position.to_string()]);
            }
        }
        Ok(args)
    }

    pub fn list_args(&self, key: ChainKey) -> Vec<String> {
        let mut args = self.table_args(key);
        args.extend(
            ["-L", key.chain.as_str(), "-n", "-v", "-x", "--line-numbers"].map(String::from),
        );
        args
    }

    /// Applies exactly one mutation to the live chain.
    pub async fn apply(&self, key: ChainKey, mutation: &Mutation) -> Result<(), Error> {
        let args = self.mutation_args(key, mutation)?;

        if self.dry_run {
            tracing::info!(%key, args = ?args, "[DRY RUN] would run {}", self.backend.program());
            return Ok(());
        }

        self.invoke(&args).await.map_err(|e| {
            tracing::error!(%key, %mutation, error = %e, "mutation failed");
            Error::from(e)
        })?;
        tracing::info!(%key, %mutation, "mutation applied");
        Ok(())
    }

    /// Lists and parses the live chain.
    pub async fn list(&self, key: ChainKey) -> Result<Listing, Error> {
        let output = self.invoke(&self.list_args(key)).await?;
        Ok(parse_listing(key, &output.stdout)?)
    }

    async fn invoke(&self, args: &[String]) -> Result<ToolOutput, ExecutionError> {
        tracing::debug!(program = self.backend.program(), args = ?args, "running rule-table tool");

        let output = self.backend.run(args).await.map_err(|e| match e {
            BackendError::Timeout { after, .. } => ExecutionError::timeout(after),
            BackendError::Spawn { .. } => ExecutionError::spawn(e.to_string()),
        })?;

        if !output.success() {
            return Err(ExecutionError::tool_failed(output.exit_code, output.stderr));
        }
        Ok(output)
    }
}
