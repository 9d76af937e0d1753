//! Typed access to the iptables rule language.
//!
//! Rules are values ([`rule::RIPTRule`]) instead of strings, the `iptables -S`
//! dump parses back into [`rule::RIPTChain`]s, and [`state::RIPTState`] is an
//! in-memory filter table answering the same commands as the real binary, so
//! code driving iptables can be tested without touching the host firewall.

#[macro_use]
extern crate log;

use error::{RIPTError, RIPTResult, STATUS_FAILURE};
use executor::Executor;
use rule::{RIPTChain, RuleSpec};

#[cfg(target_os = "linux")]
use executor::CommandExecutor;

pub mod error;
pub mod executor;
pub mod iptparser;
pub mod rule;
pub mod state;


// List of built-in chains taken from: man 8 iptables
const BUILTIN_CHAINS_MANGLE: &'static [&'static str] = &["PREROUTING", "OUTPUT", "INPUT", "FORWARD", "POSTROUTING"];
const BUILTIN_CHAINS_NAT: &'static [&'static str] = &["PREROUTING", "POSTROUTING", "OUTPUT"];
const BUILTIN_CHAINS_RAW: &'static [&'static str] = &["PREROUTING", "OUTPUT"];
const BUILTIN_CHAINS_SECURITY: &'static [&'static str] = &["INPUT", "OUTPUT", "FORWARD"];

const DEFAULT_TABLE: &'static str = "filter";


pub struct RIPTables<E> where E: Executor {
  executor: E,

  /// The table every command is issued against, `filter` unless set.
  table: String,

  /// Indicates if iptables has -C (--check) option
  has_check: bool,
}

/// Drive the host's `iptables` (or `ip6tables`).
///
/// Reads the installed version to decide whether `--check` and `--wait`
/// are available.
#[cfg(target_os = "linux")]
pub fn new(ipv6: bool) -> RIPTResult<RIPTables<CommandExecutor>> {
  let cmd = if ipv6 { "ip6tables" } else { "iptables" };
  let version_output = std::process::Command::new(cmd).arg("--version").output()?;
  let version_string = String::from_utf8_lossy(&version_output.stdout).into_owned();
  let (v_major, v_minor, v_patch) = iptparser::iptables_version(version_string)?;

  let has_check = (v_major > 1) || (v_major == 1 && v_minor > 4) || (v_major == 1 && v_minor == 4 && v_patch > 10);
  let has_wait = (v_major > 1) || (v_major == 1 && v_minor > 4) || (v_major == 1 && v_minor == 4 && v_patch > 19);
  debug!("{} v{}.{}.{}: check={} wait={}", cmd, v_major, v_minor, v_patch, has_check, has_wait);

  let mut iptables = RIPTables::new(CommandExecutor::new(cmd).wait(has_wait));
  iptables.has_check = has_check;
  Ok(iptables)
}

impl<E> RIPTables<E> where E: Executor {
  pub fn new(executor: E) -> RIPTables<E> {
    RIPTables {
      executor,
      table: DEFAULT_TABLE.to_string(),
      has_check: true,
    }
  }

  /// Issue every command against `table` instead of `filter`.
  pub fn with_table<S: Into<String>>(mut self, table: S) -> RIPTables<E> {
    self.table = table.into();
    self
  }

  /// Disable `-C`: [`RIPTables::exists`] then scans the chain listing.
  pub fn without_check(mut self) -> RIPTables<E> {
    self.has_check = false;
    self
  }

  pub fn table(&self) -> &str {
    &self.table
  }

  pub fn executor(&self) -> &E {
    &self.executor
  }

  /// Execute an iptables command; `-t <table>` is prepended.
  ///
  /// # Example
  ///
  /// ```rust
  /// let iptables = riptables_model::new(false).unwrap();
  /// assert!(iptables.execute(&["-A", "INPUT", "-j", "ACCEPT"]).is_ok());
  /// ```
  pub fn execute<S: AsRef<str>>(&self, args: &[S]) -> RIPTResult<String> {
    let mut argv = vec!["-t".to_string(), self.table.clone()];
    argv.extend(args.iter().map(|arg| arg.as_ref().to_string()));
    debug!("iptables {}", argv.join(" "));
    self.executor.execute(&argv)
  }

  fn rule_command(&self, command: &str, chain: &str, position: Option<usize>, rule: RuleSpec) -> RIPTResult<String> {
    let mut args = vec![command.to_string(), chain.to_string()];
    if let Some(position) = position {
      args.push(position.to_string());
    }
    args.extend(rule.to_args());
    self.execute(&args)
  }

  /// Get the default policy for a built-in chain.
  ///
  /// # Example
  ///
  /// ```rust
  /// let iptables = riptables_model::new(false).unwrap();
  /// assert!(iptables.get_policy("INPUT").is_ok());
  /// ```
  pub fn get_policy(&self, chain: &str) -> RIPTResult<Option<String>> {
    self.builtin_chain(chain)?;
    Ok(self.list_chain(chain)?.target)
  }

  /// Set the default policy for a built-in chain.
  ///
  /// # Example
  ///
  /// ```rust
  /// let iptables = riptables_model::new(false).unwrap();
  /// iptables.set_policy("FORWARD", "DROP").unwrap();
  /// ```
  pub fn set_policy(&self, chain: &str, policy: &str) -> RIPTResult<()> {
    self.builtin_chain(chain)?;
    self.execute(&["-P", chain, policy])?;
    Ok(())
  }

  fn builtin_chain(&self, chain: &str) -> RIPTResult<()> {
    if !self::builtin_chains(&self.table)?.contains(&chain) {
      return Err(RIPTError::Other("given chain is not a default chain in the given table, can't get policy"));
    }
    Ok(())
  }

  /// Inserts `rule` in the `position` of the chain.
  ///
  /// # Example
  ///
  /// ```rust
  /// let iptables = riptables_model::new(false).unwrap();
  /// iptables.insert("TESTNAT", "-j ACCEPT", 1).unwrap();
  /// ```
  pub fn insert<R: Into<RuleSpec>>(&self, chain: &str, rule: R, position: usize) -> RIPTResult<()> {
    self.rule_command("-I", chain, Some(position), rule.into())?;
    Ok(())
  }

  /// Inserts `rule` in the `position` of the chain if it does not exist.
  pub fn insert_unique<R: Into<RuleSpec>>(&self, chain: &str, rule: R, position: usize) -> RIPTResult<()> {
    let rule = rule.into();
    if self.exists(chain, rule.clone())? {
      return Ok(());
    }
    self.insert(chain, rule, position)
  }

  /// Replaces the rule at `position` of the chain with `rule`.
  ///
  /// # Example
  ///
  /// ```rust
  /// let iptables = riptables_model::new(false).unwrap();
  /// iptables.replace("TESTNAT", "-j ACCEPT", 1).unwrap();
  /// ```
  pub fn replace<R: Into<RuleSpec>>(&self, chain: &str, rule: R, position: usize) -> RIPTResult<()> {
    self.rule_command("-R", chain, Some(position), rule.into())?;
    Ok(())
  }

  /// Appends `rule` to the chain.
  ///
  /// # Example
  ///
  /// ```rust
  /// let iptables = riptables_model::new(false).unwrap();
  /// iptables.append("TESTNAT", "-m comment --comment \"double-quoted comment\" -j ACCEPT").unwrap();
  /// ```
  pub fn append<R: Into<RuleSpec>>(&self, chain: &str, rule: R) -> RIPTResult<()> {
    self.rule_command("-A", chain, None, rule.into())?;
    Ok(())
  }

  /// Appends `rule` to the chain if it does not exist.
  pub fn append_unique<R: Into<RuleSpec>>(&self, chain: &str, rule: R) -> RIPTResult<()> {
    let rule = rule.into();
    if self.exists(chain, rule.clone())? {
      return Ok(());
    }
    self.append(chain, rule)
  }

  /// Moves `rule` to the end of the chain, appending it if it was missing.
  pub fn append_replace<R: Into<RuleSpec>>(&self, chain: &str, rule: R) -> RIPTResult<()> {
    let rule = rule.into();
    if self.exists(chain, rule.clone())? {
      self.delete(chain, rule.clone())?;
    }
    self.append(chain, rule)
  }

  /// Deletes `rule` from the chain.
  ///
  /// # Example
  ///
  /// ```rust
  /// let iptables = riptables_model::new(false).unwrap();
  /// iptables.delete("TESTNAT", "-j ACCEPT").unwrap();
  /// ```
  pub fn delete<R: Into<RuleSpec>>(&self, chain: &str, rule: R) -> RIPTResult<()> {
    self.rule_command("-D", chain, None, rule.into())?;
    Ok(())
  }

  /// Deletes all repetition of the `rule` from the chain.
  /// Returns how many rules were deleted.
  pub fn delete_all<R: Into<RuleSpec>>(&self, chain: &str, rule: R) -> RIPTResult<usize> {
    let rule = rule.into();
    let mut deleted = 0;
    while self.exists(chain, rule.clone())? {
      self.delete(chain, rule.clone())?;
      deleted += 1;
    }
    Ok(deleted)
  }

  /// Lists every chain of the table.
  ///
  /// # Example
  ///
  /// ```rust
  /// use riptables_model::rule::RIPTChain;
  ///
  /// let iptables = riptables_model::new(false).unwrap();
  /// let chains: Vec<RIPTChain> = iptables.list().unwrap();
  /// for chain in chains {
  ///   println!("{} {:?} {}", chain.name, chain.target, chain.rules.len());
  /// }
  /// ```
  pub fn list(&self) -> RIPTResult<Vec<RIPTChain>> {
    let output = self.execute(&["-S"])?;
    Ok(iptparser::parse_dump(output))
  }

  /// Lists one chain.
  pub fn list_chain(&self, chain: &str) -> RIPTResult<RIPTChain> {
    let output = self.execute(&["-S", chain])?;
    iptparser::parse_dump(output)
      .into_iter()
      .find(|item| item.name == chain)
      .ok_or_else(|| RIPTError::NoSuchChain(chain.to_string()))
  }

  /// Lists the name of each chain in the table.
  pub fn chain_names(&self) -> RIPTResult<Vec<String>> {
    Ok(self.list()?.into_iter().map(|chain| chain.name).collect())
  }

  /// Creates a new user-defined chain.
  pub fn new_chain(&self, chain: &str) -> RIPTResult<()> {
    self.execute(&["-N", chain])?;
    Ok(())
  }

  /// Deletes an empty user-defined chain.
  pub fn delete_chain(&self, chain: &str) -> RIPTResult<()> {
    self.execute(&["-X", chain])?;
    Ok(())
  }

  /// Renames a user-defined chain.
  pub fn rename_chain(&self, old_chain: &str, new_chain: &str) -> RIPTResult<()> {
    self.execute(&["-E", old_chain, new_chain])?;
    Ok(())
  }

  /// Flushes (deletes all rules) a chain.
  pub fn flush_chain(&self, chain: &str) -> RIPTResult<()> {
    self.execute(&["-F", chain])?;
    Ok(())
  }

  /// Flushes all chains in the table.
  pub fn flush_table(&self) -> RIPTResult<()> {
    self.execute(&["-F"])?;
    Ok(())
  }

  /// Checks for the existence of the `chain` in the table.
  pub fn exists_chain(&self, chain: &str) -> RIPTResult<bool> {
    self::answer(self.execute(&["-S", chain]))
  }

  /// Checks for the existence of the `rule` in the chain.
  ///
  /// # Example
  ///
  /// ```rust
  /// let iptables = riptables_model::new(false).unwrap();
  /// assert_eq!(iptables.exists("TESTNAT", "-j ACCEPT").unwrap(), true);
  /// ```
  pub fn exists<R: Into<RuleSpec>>(&self, chain: &str, rule: R) -> RIPTResult<bool> {
    let rule = rule.into();
    if !self.has_check {
      return self.exists_old_version(chain, rule);
    }
    self::answer(self.rule_command("-C", chain, None, rule))
  }

  fn exists_old_version(&self, chain: &str, rule: RuleSpec) -> RIPTResult<bool> {
    let chain = match self.list_chain(chain) {
      Ok(chain) => chain,
      Err(ref err) if self::is_refusal(err) => return Ok(false),
      Err(err) => return Err(err),
    };
    let rule = rule.to_normalized_rule();
    Ok(chain.rules.iter().any(|item| item.normalized() == rule))
  }
}

/// A refused command means "no"; failing to run the command is an error.
fn answer(result: RIPTResult<String>) -> RIPTResult<bool> {
  match result {
    Ok(_) => Ok(true),
    Err(ref err) if self::is_refusal(err) => Ok(false),
    Err(err) => Err(err),
  }
}

fn is_refusal(err: &RIPTError) -> bool {
  match *err {
    RIPTError::Io(_) | RIPTError::Nix(_) | RIPTError::Other(_) | RIPTError::UnexpectedOutput(_) => false,
    _ => err.code() == STATUS_FAILURE,
  }
}

fn builtin_chains(table: &str) -> RIPTResult<&'static [&'static str]> {
  match table {
    "filter" => Ok(rule::BUILTIN_CHAINS_FILTER),
    "mangle" => Ok(BUILTIN_CHAINS_MANGLE),
    "nat" => Ok(BUILTIN_CHAINS_NAT),
    "raw" => Ok(BUILTIN_CHAINS_RAW),
    "security" => Ok(BUILTIN_CHAINS_SECURITY),
    _ => Err(RIPTError::Other("given table is not supported by iptables")),
  }
}
