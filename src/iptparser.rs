use std::net::Ipv4Addr;

use string_builder::Builder;
use text_reader::TextReader;

use crate::error::{RIPTError, RIPTResult};
use crate::rule::{RIPTChain, RIPTMatch, RIPTRule};

/// Rule flags kept as structured fields. Anything else passes through.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
  Protocol,
  Source,
  Destination,
  Jump,
  Input,
  Output,
}

fn field_of(flag: &str) -> Option<Field> {
  match flag {
    "-p" => Some(Field::Protocol),
    "-s" => Some(Field::Source),
    "-d" => Some(Field::Destination),
    "-j" => Some(Field::Jump),
    "-i" => Some(Field::Input),
    "-o" => Some(Field::Output),
    _ => None,
  }
}

fn alias_of(flag: &str) -> Option<&'static str> {
  match flag {
    "--protocol" => Some("-p"),
    "--source" | "--src" => Some("-s"),
    "--destination" | "--dst" => Some("-d"),
    "--jump" => Some("-j"),
    "--goto" => Some("-g"),
    "--match" => Some("-m"),
    "--in-interface" => Some("-i"),
    "--out-interface" => Some("-o"),
    "--fragment" => Some("-f"),
    "--set-counters" => Some("-c"),
    _ => None,
  }
}

/// `-x` or `--xxx`, but not a negative number.
fn is_flag(token: &str) -> bool {
  let mut chars = token.chars();
  match (chars.next(), chars.next()) {
    (Some('-'), Some(next)) => !next.is_ascii_digit(),
    _ => false,
  }
}

/// Split rule text on runs of whitespace. A double-quoted part is kept as one
/// token, quotes included. Inside quotes a backslash escapes the next
/// character, as `iptables -S` prints `\"` in comments.
pub fn tokenize<S: AsRef<str>>(text: S) -> Vec<String> {
  let mut tokens = vec![];
  let mut reader = TextReader::new(text.as_ref().to_string());
  let mut builder = Builder::default();
  let mut filled = false;
  let mut quoted = false;

  while reader.has_next() {
    match reader.next() {
      Some('"') => {
        quoted = !quoted;
        builder.append('"');
        filled = true;
      }
      Some('\\') if quoted => {
        builder.append('\\');
        if reader.has_next() {
          if let Some(escaped) = reader.next() {
            builder.append(escaped);
          }
        }
      }
      Some(ch) if ch.is_whitespace() && !quoted => {
        if filled {
          tokens.push(self::take(&mut builder));
          filled = false;
        }
      }
      Some(ch) => {
        builder.append(ch);
        filled = true;
      }
      None => break,
    }
  }
  if filled {
    tokens.push(self::take(&mut builder));
  }
  tokens
}

fn take(builder: &mut Builder) -> String {
  std::mem::replace(builder, Builder::default())
    .string()
    .unwrap_or_default()
}

/// Rewrite long-form flags to their short form.
pub fn normalize_aliases(tokens: &[String]) -> Vec<String> {
  tokens.iter()
    .map(|token| match self::alias_of(token) {
      Some(short) => short.to_string(),
      None => token.clone(),
    })
    .collect()
}

/// Listing position of a rule part, after the short flag opening it.
/// Unknown short flags list with the matches.
fn rank_of(flag: &str) -> usize {
  match flag {
    "-p" => 0,
    "-s" => 1,
    "-d" => 2,
    "-j" => 4,
    "-g" => 5,
    "-i" => 6,
    "-o" => 7,
    "-f" => 8,
    "-c" => 9,
    _ => RANK_MATCH,
  }
}

const RANK_MATCH: usize = 3;

fn is_short_flag(token: &str) -> bool {
  self::is_flag(token) && !token.starts_with("--")
}

/// Reorder a rule into the listing order `-p -s -d -m -j -g -i -o -f -c`.
///
/// A part runs from a short flag (with its `!`) to the next one, so match and
/// target options (`--dport 22`, `--log-prefix x`) move together with the
/// `-m` or `-j` they follow. Parts of the same kind keep their relative order.
pub fn canonical_order(tokens: &[String]) -> Vec<String> {
  let mut parts: Vec<(usize, Vec<String>)> = vec![];
  let mut negate = false;
  let mut value = false;

  for token in self::normalize_aliases(tokens) {
    if value {
      value = false;
      self::push_part(&mut parts, token);
      continue;
    }
    if token == "!" && !negate {
      negate = true;
      continue;
    }
    if self::is_short_flag(&token) {
      let mut part = vec![];
      if negate {
        part.push("!".to_string());
      }
      value = self::field_of(&token).is_some();
      parts.push((self::rank_of(&token), part));
      self::push_part(&mut parts, token);
    } else {
      if negate {
        self::push_part(&mut parts, "!".to_string());
      }
      self::push_part(&mut parts, token);
    }
    negate = false;
  }
  if negate {
    self::push_part(&mut parts, "!".to_string());
  }

  parts.sort_by_key(|(rank, _)| *rank);
  parts.into_iter().flat_map(|(_, part)| part).collect()
}

fn push_part(parts: &mut Vec<(usize, Vec<String>)>, token: String) {
  match parts.last_mut() {
    Some((_, part)) => part.push(token),
    None => parts.push((RANK_MATCH, vec![token])),
  }
}

/// Build a rule from its tokens.
///
/// A `!` inverts the next modelled flag only. A flag outside the modelled set
/// swallows the value after it, and the pending `!` with it. `origin` always
/// holds every normalized token, whatever was recognized.
pub fn parse_rule(tokens: &[String]) -> RIPTRule {
  let tokens = self::normalize_aliases(tokens);
  let mut rule = RIPTRule {
    origin: Some(tokens.join(" ")),
    ..RIPTRule::default()
  };

  let mut negate = false;
  let mut iter = tokens.iter().peekable();
  while let Some(token) = iter.next() {
    if token == "!" {
      negate = true;
      continue;
    }
    match self::field_of(token) {
      Some(field) => {
        if let Some(value) = iter.next() {
          self::assign(&mut rule, field, negate, value);
        }
      }
      None if self::is_flag(token) => {
        iter.next_if(|next| !self::is_flag(next));
      }
      None => {}
    }
    negate = false;
  }

  trace!("parsed rule {:?}", rule);
  rule
}

fn assign(rule: &mut RIPTRule, field: Field, negate: bool, value: &str) {
  let item = Some(RIPTMatch { negate, value: value.to_string() });
  match field {
    Field::Protocol => rule.protocol = item,
    Field::Source => rule.source = item,
    Field::Destination => rule.destination = item,
    // iptables has no inverted jump, the `!` stays in origin only
    Field::Jump => rule.jump = Some(value.to_string()),
    Field::Input => rule.input = item,
    Field::Output => rule.output = item,
  }
}

/// Append `/32` to every bare IPv4 address given to `-s` or `-d`.
pub fn default_masks(tokens: &[String]) -> Vec<String> {
  let tokens = self::normalize_aliases(tokens);
  let mut rets = Vec::with_capacity(tokens.len());
  let mut address = false;
  for token in tokens {
    if address && !token.contains('/') && token.parse::<Ipv4Addr>().is_ok() {
      rets.push(format!("{}/32", token));
    } else {
      rets.push(token.clone());
    }
    address = token == "-s" || token == "-d";
  }
  rets
}

/// Normalize a rule entering a table: long flags shortened, bare IPv4
/// addresses masked, parts put in listing order.
pub fn normalize_rule(tokens: &[String]) -> RIPTRule {
  self::parse_rule(&self::canonical_order(&self::default_masks(tokens)))
}

/// Parse the output of `iptables -S` into chains, in first-seen order.
///
/// `-P` sets a chain's policy, `-N` declares a user chain and `-A` appends a
/// rule, creating the chain when it was not seen before. Other lines are
/// ignored.
pub fn parse_dump<S: AsRef<str>>(text: S) -> Vec<RIPTChain> {
  let mut chains: Vec<RIPTChain> = vec![];
  for line in text.as_ref().lines() {
    let tokens = self::tokenize(line);
    let (command, name) = match (tokens.get(0), tokens.get(1)) {
      (Some(command), Some(name)) => (command.as_str(), name.clone()),
      _ => continue,
    };
    match command {
      "-P" | "--policy" => {
        if let Some(target) = tokens.get(2) {
          self::chain_entry(&mut chains, name).target = Some(target.clone());
        }
      }
      "-N" | "--new-chain" => {
        self::chain_entry(&mut chains, name);
      }
      "-A" | "--append" => {
        let rule = self::parse_rule(&tokens[2..]);
        self::chain_entry(&mut chains, name).rules.push(rule);
      }
      _ => {}
    }
  }
  chains
}

fn chain_entry(chains: &mut Vec<RIPTChain>, name: String) -> &mut RIPTChain {
  let position = match chains.iter().position(|chain| chain.name == name) {
    Some(position) => position,
    None => {
      chains.push(RIPTChain::new(name));
      chains.len() - 1
    }
  };
  &mut chains[position]
}

/// Serialize chains the way `iptables -S` prints them: every chain header
/// (`-P` with a policy, `-N` without) in order, then every rule.
pub fn dump(chains: &[RIPTChain]) -> String {
  let mut text = String::new();
  for chain in chains {
    match &chain.target {
      Some(target) => text.push_str(&format!("-P {} {}\n", chain.name, target)),
      None => text.push_str(&format!("-N {}\n", chain.name)),
    }
  }
  for chain in chains {
    for rule in &chain.rules {
      let rule = rule.to_string();
      if rule.is_empty() {
        text.push_str(&format!("-A {}\n", chain.name));
      } else {
        text.push_str(&format!("-A {} {}\n", chain.name, rule));
      }
    }
  }
  text
}

/// Split rule text into process arguments, quotes and escapes removed.
pub fn split_quoted<S: AsRef<str>>(text: S) -> Vec<String> {
  self::tokenize(text)
    .iter()
    .map(|token| self::unquote(token))
    .collect()
}

fn unquote(token: &str) -> String {
  let mut arg = String::with_capacity(token.len());
  let mut quoted = false;
  let mut chars = token.chars();
  while let Some(ch) = chars.next() {
    match ch {
      '"' => quoted = !quoted,
      '\\' if quoted => {
        if let Some(escaped) = chars.next() {
          arg.push(escaped);
        }
      }
      _ => arg.push(ch),
    }
  }
  arg
}

/// Quote arguments so each one survives `tokenize` as a single token.
pub fn quote_args(args: &[String]) -> Vec<String> {
  args.iter()
    .map(|arg| {
      if arg.is_empty() || arg.contains('"') || arg.chars().any(char::is_whitespace) {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
      } else {
        arg.clone()
      }
    })
    .collect()
}

/// Read `(major, minor, patch)` from `iptables --version`, e.g.
/// `iptables v1.8.7 (nf_tables)`.
pub fn iptables_version<S: AsRef<str>>(text: S) -> RIPTResult<(i32, i32, i32)> {
  let unexpected = || RIPTError::UnexpectedOutput(text.as_ref().trim().to_string());
  let version = text.as_ref()
    .split_whitespace()
    .find(|word| word.starts_with('v') && word[1..].starts_with(|ch: char| ch.is_ascii_digit()))
    .ok_or_else(unexpected)?;

  let parts = version[1..]
    .split('.')
    .map(|part| part.parse::<i32>())
    .collect::<Result<Vec<i32>, _>>()
    .map_err(|_| unexpected())?;
  match parts.as_slice() {
    [major, minor, patch] => Ok((*major, *minor, *patch)),
    [major, minor] => Ok((*major, *minor, 0)),
    _ => Err(unexpected()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_iptables_version() {
    assert_eq!(iptables_version("iptables v1.8.7 (nf_tables)\n").unwrap(), (1, 8, 7));
    assert_eq!(iptables_version("ip6tables v1.4.21").unwrap(), (1, 4, 21));
    assert!(iptables_version("command not found").is_err());
  }

  #[test]
  fn test_is_flag() {
    assert!(is_flag("-p"));
    assert!(is_flag("--dport"));
    assert!(!is_flag("-1"));
    assert!(!is_flag("-"));
    assert!(!is_flag("!"));
  }

  #[test]
  fn test_flag_without_value_keeps_next_flag() {
    let rule = parse_rule(&tokenize("-f -j DROP"));
    assert_eq!(rule.jump, Some("DROP".to_string()));
  }
}
