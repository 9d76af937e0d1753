use std::fmt;
use std::vec::Vec;

use crate::iptparser;

/// Chains of the filter table, in the order iptables lists them.
pub const BUILTIN_CHAINS_FILTER: &'static [&'static str] = &["INPUT", "FORWARD", "OUTPUT"];

/// Policy a built-in chain starts with.
pub const DEFAULT_POLICY: &'static str = "ACCEPT";

/// A match condition value, optionally inverted with `!`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RIPTMatch {
  pub negate: bool,
  pub value: String,
}

impl RIPTMatch {
  pub fn new<S: Into<String>>(value: S) -> RIPTMatch {
    RIPTMatch { negate: false, value: value.into() }
  }

  pub fn negated<S: Into<String>>(value: S) -> RIPTMatch {
    RIPTMatch { negate: true, value: value.into() }
  }
}

impl From<&str> for RIPTMatch {
  fn from(value: &str) -> Self {
    RIPTMatch::new(value)
  }
}

impl From<String> for RIPTMatch {
  fn from(value: String) -> Self {
    RIPTMatch::new(value)
  }
}

/// One rule of a chain.
///
/// The modelled flags (`-p -s -d -j -i -o`) are kept as fields. Everything
/// else a rule carries (match extensions, `-g`, `-f`, ...) only lives in
/// `origin`, the alias-normalized text the rule was parsed from. Two rules
/// are equal when both the fields and `origin` are equal, so extension
/// matches still take part in check/delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RIPTRule {
  pub protocol: Option<RIPTMatch>,
  pub source: Option<RIPTMatch>,
  pub destination: Option<RIPTMatch>,
  pub input: Option<RIPTMatch>,
  pub output: Option<RIPTMatch>,
  pub jump: Option<String>,
  pub origin: Option<String>,
}

impl RIPTRule {
  pub fn new() -> RIPTRule {
    RIPTRule::default()
  }

  /// Parse free-form rule text, e.g. `"! -s 10.1.0.0/16 --jump DROP"`.
  pub fn parse<S: AsRef<str>>(text: S) -> RIPTRule {
    iptparser::parse_rule(&iptparser::tokenize(text))
  }

  // The builder setters drop `origin`: a rule edited field by field is
  // serialized from its fields again.

  pub fn with_protocol<M: Into<RIPTMatch>>(mut self, protocol: M) -> RIPTRule {
    self.protocol = Some(protocol.into());
    self.origin = None;
    self
  }

  pub fn with_source<M: Into<RIPTMatch>>(mut self, source: M) -> RIPTRule {
    self.source = Some(source.into());
    self.origin = None;
    self
  }

  pub fn with_destination<M: Into<RIPTMatch>>(mut self, destination: M) -> RIPTRule {
    self.destination = Some(destination.into());
    self.origin = None;
    self
  }

  pub fn with_input<M: Into<RIPTMatch>>(mut self, input: M) -> RIPTRule {
    self.input = Some(input.into());
    self.origin = None;
    self
  }

  pub fn with_output<M: Into<RIPTMatch>>(mut self, output: M) -> RIPTRule {
    self.output = Some(output.into());
    self.origin = None;
    self
  }

  pub fn with_jump<S: Into<String>>(mut self, target: S) -> RIPTRule {
    self.jump = Some(target.into());
    self.origin = None;
    self
  }

  /// The rule as it reads after a trip through the parser, `origin` filled.
  pub fn canonical(&self) -> RIPTRule {
    RIPTRule::parse(self.to_string())
  }

  /// The rule as a table stores it: masks defaulted, parts in listing order.
  pub fn normalized(&self) -> RIPTRule {
    iptparser::normalize_rule(&iptparser::tokenize(self.to_string()))
  }

  fn fields(&self) -> Vec<String> {
    let mut tokens = vec![];
    self::push_match(&mut tokens, "-p", &self.protocol);
    self::push_match(&mut tokens, "-s", &self.source);
    self::push_match(&mut tokens, "-d", &self.destination);
    if let Some(jump) = &self.jump {
      tokens.push("-j".to_string());
      tokens.push(jump.clone());
    }
    self::push_match(&mut tokens, "-i", &self.input);
    self::push_match(&mut tokens, "-o", &self.output);
    tokens
  }
}

fn push_match(tokens: &mut Vec<String>, flag: &str, item: &Option<RIPTMatch>) {
  if let Some(item) = item {
    if item.negate {
      tokens.push("!".to_string());
    }
    tokens.push(flag.to_string());
    tokens.push(item.value.clone());
  }
}

impl fmt::Display for RIPTRule {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match &self.origin {
      Some(origin) => write!(f, "{}", origin),
      None => write!(f, "{}", self.fields().join(" ")),
    }
  }
}

/// A named chain: its policy target and its rules in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RIPTChain {
  pub name: String,
  /// Built-in chains carry a policy; user chains listed with `-N` don't.
  pub target: Option<String>,
  pub rules: Vec<RIPTRule>,
}

impl RIPTChain {
  pub fn new<S: Into<String>>(name: S) -> RIPTChain {
    RIPTChain { name: name.into(), target: None, rules: vec![] }
  }

  pub fn builtin<S: Into<String>>(name: S) -> RIPTChain {
    RIPTChain { name: name.into(), target: Some(DEFAULT_POLICY.to_string()), rules: vec![] }
  }

  pub fn is_builtin(&self) -> bool {
    BUILTIN_CHAINS_FILTER.contains(&&self.name[..])
  }
}

/// The ways a caller can hand over a rule.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleSpec {
  /// Rule text as typed on a command line, quotes allowed.
  Text(String),
  /// Already split arguments, as a process would receive them.
  Args(Vec<String>),
  Rule(RIPTRule),
}

impl RuleSpec {
  /// Rule text; argv elements are quoted again where `tokenize` needs it.
  pub fn text(&self) -> String {
    match self {
      RuleSpec::Text(text) => text.clone(),
      RuleSpec::Args(args) => iptparser::quote_args(args).join(" "),
      RuleSpec::Rule(rule) => rule.to_string(),
    }
  }

  pub fn to_rule(&self) -> RIPTRule {
    RIPTRule::parse(self.text())
  }

  /// See [`RIPTRule::normalized`].
  pub fn to_normalized_rule(&self) -> RIPTRule {
    iptparser::normalize_rule(&iptparser::tokenize(self.text()))
  }

  /// Arguments to hand to the iptables binary.
  pub fn to_args(&self) -> Vec<String> {
    match self {
      RuleSpec::Args(args) => args.clone(),
      _ => iptparser::split_quoted(self.text()),
    }
  }
}

impl From<&str> for RuleSpec {
  fn from(text: &str) -> Self {
    RuleSpec::Text(text.to_string())
  }
}

impl From<String> for RuleSpec {
  fn from(text: String) -> Self {
    RuleSpec::Text(text)
  }
}

impl From<Vec<String>> for RuleSpec {
  fn from(args: Vec<String>) -> Self {
    RuleSpec::Args(args)
  }
}

impl From<&[&str]> for RuleSpec {
  fn from(args: &[&str]) -> Self {
    RuleSpec::Args(args.iter().map(|arg| arg.to_string()).collect())
  }
}

impl From<RIPTRule> for RuleSpec {
  fn from(rule: RIPTRule) -> Self {
    RuleSpec::Rule(rule)
  }
}

impl From<&RIPTRule> for RuleSpec {
  fn from(rule: &RIPTRule) -> Self {
    RuleSpec::Rule(rule.clone())
  }
}
