use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{RIPTError, RIPTResult};
use crate::executor::Executor;
use crate::iptparser;
use crate::rule::{RIPTChain, RIPTRule, RuleSpec, BUILTIN_CHAINS_FILTER};

/// In-memory filter table behaving like `iptables` for the supported
/// commands.
///
/// Every operation holds the lock for its whole duration. Mutations work on a
/// copy of the chains which replaces the table only when the operation
/// succeeds, so a failed command leaves no trace.
///
/// # Example
///
/// ```rust
/// use riptables_model::state::RIPTState;
///
/// let state = RIPTState::new();
/// state.append("INPUT", "-s 10.10.10.10 -j DROP").unwrap();
/// assert!(state.check("INPUT", "-s 10.10.10.10/32 -j DROP"));
/// ```
#[derive(Debug)]
pub struct RIPTState {
  chains: Mutex<Vec<RIPTChain>>,
}

impl Default for RIPTState {
  fn default() -> Self {
    RIPTState::new()
  }
}

impl RIPTState {
  pub fn new() -> RIPTState {
    RIPTState { chains: Mutex::new(self::builtin_table()) }
  }

  /// Append `rule` to the end of `chain`.
  pub fn append<R: Into<RuleSpec>>(&self, chain: &str, rule: R) -> RIPTResult<()> {
    let rule = self::ingest(rule.into());
    self.transition("append", chain, |chains| {
      self::find_mut(chains, chain)?.rules.push(rule);
      Ok(())
    })
  }

  /// Insert `rule` so that it becomes rule number `position` (1-based).
  pub fn insert<R: Into<RuleSpec>>(&self, chain: &str, position: usize, rule: R) -> RIPTResult<()> {
    let rule = self::ingest(rule.into());
    self.transition("insert", chain, |chains| {
      let chain = self::find_mut(chains, chain)?;
      if position < 1 || position > chain.rules.len() + 1 {
        return Err(RIPTError::InvalidRuleNumber(position));
      }
      chain.rules.insert(position - 1, rule);
      Ok(())
    })
  }

  /// Replace rule number `position` (1-based) with `rule`.
  pub fn replace<R: Into<RuleSpec>>(&self, chain: &str, position: usize, rule: R) -> RIPTResult<()> {
    let rule = self::ingest(rule.into());
    self.transition("replace", chain, |chains| {
      let chain = self::find_mut(chains, chain)?;
      if position < 1 || position > chain.rules.len() {
        return Err(RIPTError::InvalidRuleNumber(position));
      }
      chain.rules[position - 1] = rule;
      Ok(())
    })
  }

  /// Remove the first rule of `chain` equal to `rule`.
  pub fn delete<R: Into<RuleSpec>>(&self, chain: &str, rule: R) -> RIPTResult<()> {
    let rule = self::ingest(rule.into());
    self.transition("delete", chain, |chains| {
      let position = self::position(chains, chain, &rule)?;
      self::find_mut(chains, chain)?.rules.remove(position);
      Ok(())
    })
  }

  /// Remove rule number `position` (1-based).
  pub fn delete_at(&self, chain: &str, position: usize) -> RIPTResult<()> {
    self.transition("delete", chain, |chains| {
      let chain = self::find_mut(chains, chain)?;
      if position < 1 || position > chain.rules.len() {
        return Err(RIPTError::InvalidRuleNumber(position));
      }
      chain.rules.remove(position - 1);
      Ok(())
    })
  }

  /// Whether `chain` exists and holds a rule equal to `rule`.
  pub fn check<R: Into<RuleSpec>>(&self, chain: &str, rule: R) -> bool {
    self.check_rule(chain, rule).is_ok()
  }

  fn check_rule<R: Into<RuleSpec>>(&self, chain: &str, rule: R) -> RIPTResult<()> {
    let rule = self::ingest(rule.into());
    let chains = self.lock();
    self::position(&chains, chain, &rule).map(|_| ())
  }

  pub fn set_policy(&self, chain: &str, target: &str) -> RIPTResult<()> {
    self.transition("policy", chain, |chains| {
      self::find_mut(chains, chain)?.target = Some(target.to_string());
      Ok(())
    })
  }

  /// The whole table in `iptables -S` format.
  pub fn list_all(&self) -> String {
    iptparser::dump(&self.lock())
  }

  /// One chain in `iptables -S <chain>` format.
  pub fn list(&self, chain: &str) -> RIPTResult<String> {
    let chains = self.lock();
    let chain = self::find(&chains, chain)?;
    Ok(iptparser::dump(std::slice::from_ref(chain)))
  }

  /// Snapshot of every chain, built-ins first.
  pub fn chains(&self) -> Vec<RIPTChain> {
    self.lock().clone()
  }

  pub fn new_chain(&self, name: &str) -> RIPTResult<()> {
    self.transition("new-chain", name, |chains| {
      if chains.iter().any(|chain| chain.name == name) {
        return Err(RIPTError::ChainAlreadyExists(name.to_string()));
      }
      chains.push(RIPTChain::new(name));
      Ok(())
    })
  }

  /// Delete an empty user chain.
  pub fn delete_chain(&self, name: &str) -> RIPTResult<()> {
    self.transition("delete-chain", name, |chains| {
      let chain = self::find(chains, name)?;
      if chain.is_builtin() {
        return Err(RIPTError::BuiltinChain(name.to_string()));
      }
      if !chain.rules.is_empty() {
        return Err(RIPTError::ChainNotEmpty(name.to_string()));
      }
      chains.retain(|chain| chain.name != name);
      Ok(())
    })
  }

  /// Delete every empty user chain, as `iptables -X` without a name does.
  pub fn delete_empty_chains(&self) -> RIPTResult<()> {
    self.transition("delete-chain", "*", |chains| {
      chains.retain(|chain| chain.is_builtin() || !chain.rules.is_empty());
      Ok(())
    })
  }

  pub fn rename_chain(&self, old: &str, new: &str) -> RIPTResult<()> {
    self.transition("rename-chain", old, |chains| {
      if chains.iter().any(|chain| chain.name == new) {
        return Err(RIPTError::ChainAlreadyExists(new.to_string()));
      }
      let chain = self::find_mut(chains, old)?;
      if chain.is_builtin() {
        return Err(RIPTError::BuiltinChain(old.to_string()));
      }
      chain.name = new.to_string();
      Ok(())
    })
  }

  /// Drop the rules of one chain, or of every chain.
  pub fn flush(&self, chain: Option<&str>) -> RIPTResult<()> {
    self.transition("flush", chain.unwrap_or("*"), |chains| {
      match chain {
        Some(name) => self::find_mut(chains, name)?.rules.clear(),
        None => chains.iter_mut().for_each(|chain| chain.rules.clear()),
      }
      Ok(())
    })
  }

  /// Counters are not modelled: zeroing only validates the chain.
  pub fn zero(&self, chain: Option<&str>) -> RIPTResult<()> {
    match chain {
      Some(name) => self::find(&self.lock(), name).map(|_| ()),
      None => Ok(()),
    }
  }

  /// Back to three empty built-in chains.
  pub fn reset(&self) {
    debug!("reset simulated filter table");
    *self.lock() = self::builtin_table();
  }

  fn lock(&self) -> MutexGuard<Vec<RIPTChain>> {
    // the table is only ever replaced whole, a poisoned lock still guards a
    // consistent value
    self.chains.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn transition<T, F>(&self, operation: &str, chain: &str, apply: F) -> RIPTResult<T>
    where F: FnOnce(&mut Vec<RIPTChain>) -> RIPTResult<T> {
    let mut chains = self.lock();
    let mut next = chains.clone();
    match apply(&mut next) {
      Ok(ret) => {
        *chains = next;
        debug!("{} {}: ok", operation, chain);
        Ok(ret)
      }
      Err(err) => {
        debug!("{} {}: {}", operation, chain, err);
        Err(err)
      }
    }
  }
}

fn builtin_table() -> Vec<RIPTChain> {
  BUILTIN_CHAINS_FILTER.iter().map(|name| RIPTChain::builtin(*name)).collect()
}

fn ingest(rule: RuleSpec) -> RIPTRule {
  rule.to_normalized_rule()
}

fn find<'a>(chains: &'a [RIPTChain], name: &str) -> RIPTResult<&'a RIPTChain> {
  chains.iter()
    .find(|chain| chain.name == name)
    .ok_or_else(|| RIPTError::NoSuchChain(name.to_string()))
}

fn find_mut<'a>(chains: &'a mut [RIPTChain], name: &str) -> RIPTResult<&'a mut RIPTChain> {
  chains.iter_mut()
    .find(|chain| chain.name == name)
    .ok_or_else(|| RIPTError::NoSuchChain(name.to_string()))
}

fn position(chains: &[RIPTChain], chain: &str, rule: &RIPTRule) -> RIPTResult<usize> {
  self::find(chains, chain)?
    .rules
    .iter()
    .position(|item| item == rule)
    .ok_or_else(|| RIPTError::NoSuchRule(chain.to_string()))
}

impl Executor for RIPTState {
  /// Run one `iptables` argv against the table. Supports the filter table
  /// only; `--wait` is accepted and ignored.
  fn execute(&self, args: &[String]) -> RIPTResult<String> {
    debug!("simulated iptables {:?}", args);
    let mut args = args.iter()
      .map(|arg| arg.as_str())
      .filter(|arg| *arg != "-w" && *arg != "--wait")
      .collect::<Vec<&str>>();
    let unsupported = |args: &[&str]| RIPTError::UnsupportedOperation(args.join(" "));

    if let Some(index) = args.iter().position(|arg| *arg == "-t" || *arg == "--table") {
      match args.get(index + 1).copied() {
        Some("filter") => {
          args.drain(index..index + 2);
        }
        _ => return Err(unsupported(&args[..])),
      }
    }

    let (command, rest) = match args.split_first() {
      Some((command, rest)) => (*command, rest),
      None => return Err(unsupported(&args[..])),
    };
    let number = |text: &str| text.parse::<usize>().map_err(|_| unsupported(&args[..]));
    let rule = |rest: &[&str]| RuleSpec::from(rest);

    match (command, rest) {
      ("-A", [chain, rest @ ..]) | ("--append", [chain, rest @ ..]) => {
        self.append(chain, rule(rest))?;
      }
      ("-C", [chain, rest @ ..]) | ("--check", [chain, rest @ ..]) => {
        self.check_rule(chain, rule(rest))?;
      }
      ("-D", [chain, position]) | ("--delete", [chain, position])
      if position.parse::<usize>().is_ok() => {
        self.delete_at(chain, number(position)?)?;
      }
      ("-D", [chain, rest @ ..]) | ("--delete", [chain, rest @ ..]) => {
        self.delete(chain, rule(rest))?;
      }
      ("-I", [chain, position, rest @ ..]) | ("--insert", [chain, position, rest @ ..])
      if position.parse::<usize>().is_ok() => {
        self.insert(chain, number(position)?, rule(rest))?;
      }
      ("-I", [chain, rest @ ..]) | ("--insert", [chain, rest @ ..]) => {
        self.insert(chain, 1, rule(rest))?;
      }
      ("-R", [chain, position, rest @ ..]) | ("--replace", [chain, position, rest @ ..]) => {
        self.replace(chain, number(position)?, rule(rest))?;
      }
      ("-S", []) | ("--list-rules", []) => return Ok(self.list_all()),
      ("-S", [chain]) | ("--list-rules", [chain]) => return self.list(chain),
      ("-P", [chain, target]) | ("--policy", [chain, target]) => {
        self.set_policy(chain, target)?;
      }
      ("-N", [chain]) | ("--new-chain", [chain]) => self.new_chain(chain)?,
      ("-X", []) | ("--delete-chain", []) => self.delete_empty_chains()?,
      ("-X", [chain]) | ("--delete-chain", [chain]) => self.delete_chain(chain)?,
      ("-F", []) | ("--flush", []) => self.flush(None)?,
      ("-F", [chain]) | ("--flush", [chain]) => self.flush(Some(chain))?,
      ("-Z", []) | ("--zero", []) => self.zero(None)?,
      ("-Z", [chain]) | ("--zero", [chain]) => self.zero(Some(chain))?,
      ("-E", [old, new]) | ("--rename-chain", [old, new]) => self.rename_chain(old, new)?,
      _ => return Err(unsupported(&args[..])),
    }
    Ok(String::new())
  }
}
