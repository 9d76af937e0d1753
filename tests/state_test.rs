use std::sync::Arc;
use std::thread;

use riptables_model::error::RIPTError;
use riptables_model::executor::Executor;
use riptables_model::iptparser;
use riptables_model::rule::{RIPTMatch, RIPTRule};
use riptables_model::state::RIPTState;

fn rules(state: &RIPTState, chain: &str) -> Vec<RIPTRule> {
  let chains = iptparser::parse_dump(state.list(chain).unwrap());
  chains.into_iter().find(|item| item.name == chain).unwrap().rules
}

fn argv(text: &str) -> Vec<String> {
  iptparser::split_quoted(text)
}

#[test]
fn test_initial_table() {
  let state = RIPTState::new();
  assert_eq!(state.list_all(), "-P INPUT ACCEPT\n-P FORWARD ACCEPT\n-P OUTPUT ACCEPT\n");
}

#[test]
fn test_append_then_list() {
  let state = RIPTState::new();
  state.append("INPUT", "-p tcp -j ACCEPT").unwrap();
  state.append("INPUT", "-p udp -j ACCEPT").unwrap();
  state.append("INPUT", "! -s 10.1.0.0/16 -j DROP").unwrap();

  let listed = rules(&state, "INPUT");
  assert_eq!(listed.len(), 3);
  assert_eq!(listed[0], RIPTRule::parse("-p tcp -j ACCEPT"));
  assert_eq!(listed[1], RIPTRule::parse("-p udp -j ACCEPT"));
  assert_eq!(listed[2].source, Some(RIPTMatch::negated("10.1.0.0/16")));
  assert_eq!(state.list("INPUT").unwrap(), "-P INPUT ACCEPT\n-A INPUT -p tcp -j ACCEPT\n-A INPUT -p udp -j ACCEPT\n-A INPUT ! -s 10.1.0.0/16 -j DROP\n");
}

#[test]
fn test_insert_ordering() {
  let state = RIPTState::new();
  state.append("FORWARD", "-j A").unwrap();
  state.append("FORWARD", "-j B").unwrap();
  state.insert("FORWARD", 2, "-j R").unwrap();
  assert_eq!(rules(&state, "FORWARD"), vec![RIPTRule::parse("-j A"), RIPTRule::parse("-j R"), RIPTRule::parse("-j B")]);

  state.insert("FORWARD", 1, "-j FIRST").unwrap();
  assert_eq!(rules(&state, "FORWARD")[0], RIPTRule::parse("-j FIRST"));

  state.insert("FORWARD", 5, "-j LAST").unwrap();
  assert_eq!(rules(&state, "FORWARD")[4], RIPTRule::parse("-j LAST"));
}

#[test]
fn test_insert_out_of_range() {
  let state = RIPTState::new();
  state.append("OUTPUT", "-j ACCEPT").unwrap();
  match state.insert("OUTPUT", 3, "-j DROP") {
    Err(RIPTError::InvalidRuleNumber(3)) => {}
    other => panic!("unexpected {:?}", other),
  }
  assert!(state.insert("OUTPUT", 0, "-j DROP").is_err());
  assert_eq!(rules(&state, "OUTPUT").len(), 1);
}

#[test]
fn test_delete_then_check() {
  let state = RIPTState::new();
  state.append("INPUT", "-s 1.1.1.1/32 -j DROP").unwrap();
  state.append("INPUT", "-s 2.2.2.2/32 -j DROP").unwrap();
  state.append("INPUT", "-s 1.1.1.1/32 -j DROP").unwrap();

  assert!(state.check("INPUT", "--source 1.1.1.1/32   --jump DROP"));
  state.delete("INPUT", "-s 1.1.1.1/32 -j DROP").unwrap();
  assert_eq!(rules(&state, "INPUT")[0], RIPTRule::parse("-s 2.2.2.2/32 -j DROP"));
  assert!(state.check("INPUT", "-s 1.1.1.1/32 -j DROP"));
  state.delete("INPUT", "-s 1.1.1.1/32 -j DROP").unwrap();
  assert!(!state.check("INPUT", "-s 1.1.1.1/32 -j DROP"));

  match state.delete("INPUT", "-s 1.1.1.1/32 -j DROP") {
    Err(RIPTError::NoSuchRule(chain)) => assert_eq!(chain, "INPUT"),
    other => panic!("unexpected {:?}", other),
  }
}

#[test]
fn test_default_mask_on_ingestion() {
  let state = RIPTState::new();
  state.append("INPUT", RIPTRule::new().with_source("10.10.10.10").with_jump("DROP")).unwrap();
  assert_eq!(rules(&state, "INPUT")[0].source, Some(RIPTMatch::new("10.10.10.10/32")));
  assert!(state.check("INPUT", "-s 10.10.10.10 -j DROP"));
  assert!(state.check("INPUT", "-s 10.10.10.10/32 -j DROP"));
}

#[test]
fn test_rules_list_in_canonical_order() {
  let state = RIPTState::new();
  state.append("INPUT", "-j DROP -s 10.0.0.1/32 -p tcp").unwrap();
  state.append("INPUT", "-j ACCEPT -m tcp --dport 22 -i eth0 --protocol tcp").unwrap();
  assert_eq!(
    state.list("INPUT").unwrap(),
    "-P INPUT ACCEPT\n-A INPUT -p tcp -s 10.0.0.1/32 -j DROP\n-A INPUT -p tcp -m tcp --dport 22 -j ACCEPT -i eth0\n"
  );
  assert!(state.check("INPUT", "-p tcp -s 10.0.0.1/32 -j DROP"));
  state.delete("INPUT", "-s 10.0.0.1 -p tcp -j DROP").unwrap();
  assert_eq!(rules(&state, "INPUT").len(), 1);
}

#[test]
fn test_args_with_quote_keep_every_flag() {
  let state = RIPTState::new();
  let args: Vec<String> = vec!["-A", "INPUT", "-m", "comment", "--comment", "it\"s", "-j", "DROP"]
    .into_iter()
    .map(String::from)
    .collect();
  state.execute(&args).unwrap();

  let rule = &rules(&state, "INPUT")[0];
  assert_eq!(rule.jump, Some("DROP".to_string()));
  assert_eq!(rule.to_string(), r#"-m comment --comment "it\"s" -j DROP"#);
  assert_eq!(iptparser::split_quoted(rule.to_string())[3], "it\"s");
}

#[test]
fn test_unknown_chain() {
  let state = RIPTState::new();
  let rule = RIPTRule::parse("-j ACCEPT");
  assert!(matches!(state.append("MISSING", &rule), Err(RIPTError::NoSuchChain(_))));
  assert!(matches!(state.delete("MISSING", &rule), Err(RIPTError::NoSuchChain(_))));
  assert!(matches!(state.list("MISSING"), Err(RIPTError::NoSuchChain(_))));
  assert!(matches!(state.set_policy("MISSING", "DROP"), Err(RIPTError::NoSuchChain(_))));
  assert!(!state.check("MISSING", &rule));
}

#[test]
fn test_chain_lifecycle() {
  let state = RIPTState::new();
  state.new_chain("LOGDROP").unwrap();
  assert!(matches!(state.new_chain("LOGDROP"), Err(RIPTError::ChainAlreadyExists(_))));
  assert!(matches!(state.new_chain("INPUT"), Err(RIPTError::ChainAlreadyExists(_))));

  state.append("LOGDROP", "-j DROP").unwrap();
  assert!(matches!(state.delete_chain("LOGDROP"), Err(RIPTError::ChainNotEmpty(_))));
  assert!(matches!(state.delete_chain("INPUT"), Err(RIPTError::BuiltinChain(_))));

  state.rename_chain("LOGDROP", "BLACKHOLE").unwrap();
  assert_eq!(state.list_all(), "-P INPUT ACCEPT\n-P FORWARD ACCEPT\n-P OUTPUT ACCEPT\n-N BLACKHOLE\n-A BLACKHOLE -j DROP\n");

  state.flush(Some("BLACKHOLE")).unwrap();
  state.delete_chain("BLACKHOLE").unwrap();
  assert!(matches!(state.delete_chain("BLACKHOLE"), Err(RIPTError::NoSuchChain(_))));
}

#[test]
fn test_failed_operation_leaves_state_untouched() {
  let state = RIPTState::new();
  state.append("INPUT", "-j ACCEPT").unwrap();
  let before = state.chains();
  assert!(state.replace("INPUT", 2, "-j DROP").is_err());
  assert!(state.rename_chain("INPUT", "OTHER").is_err());
  assert_eq!(state.chains(), before);
}

#[test]
fn test_set_policy_and_reset() {
  let state = RIPTState::new();
  state.set_policy("FORWARD", "DROP").unwrap();
  state.new_chain("USER").unwrap();
  state.append("INPUT", "-j USER").unwrap();
  assert!(state.list_all().contains("-P FORWARD DROP\n"));

  state.reset();
  assert_eq!(state.list_all(), RIPTState::new().list_all());
}

#[test]
fn test_list_round_trip() {
  let state = RIPTState::new();
  state.new_chain("EMPTY").unwrap();
  state.new_chain("SSH").unwrap();
  state.append("SSH", "-p tcp -m tcp --dport 22 -m comment --comment \"ssh in\" -j ACCEPT").unwrap();
  state.append("INPUT", "-i eth0 -p tcp -j SSH").unwrap();
  state.set_policy("INPUT", "DROP").unwrap();

  assert_eq!(iptparser::parse_dump(state.list_all()), state.chains());
}

#[test]
fn test_execute_dispatch() {
  let state = RIPTState::new();
  state.execute(&argv("-t filter -N WEB")).unwrap();
  state.execute(&argv("--append WEB -p tcp --dport 80 -j ACCEPT")).unwrap();
  state.execute(&argv("-A WEB -p tcp --dport 443 -j ACCEPT")).unwrap();
  state.execute(&argv("-I WEB -s 10.0.0.1 -j DROP")).unwrap();
  state.execute(&argv("-A INPUT -m comment --comment \"to web\" -j WEB")).unwrap();
  state.execute(&argv("--wait -C INPUT -m comment --comment \"to web\" -j WEB")).unwrap();

  assert_eq!(
    state.execute(&argv("-S WEB")).unwrap(),
    "-N WEB\n-A WEB -s 10.0.0.1/32 -j DROP\n-A WEB -p tcp --dport 80 -j ACCEPT\n-A WEB -p tcp --dport 443 -j ACCEPT\n"
  );

  state.execute(&argv("-D WEB 2")).unwrap();
  state.execute(&argv("-R WEB 1 -j RETURN")).unwrap();
  assert_eq!(state.execute(&argv("-S WEB")).unwrap(), "-N WEB\n-A WEB -j RETURN\n-A WEB -p tcp --dport 443 -j ACCEPT\n");

  let err = state.execute(&argv("-C WEB -j DROP")).unwrap_err();
  assert_eq!(err.code(), 1);
  let err = state.execute(&argv("-t nat -S")).unwrap_err();
  assert!(matches!(err, RIPTError::UnsupportedOperation(_)));
  assert_eq!(err.code(), 2);
  assert_eq!(state.execute(&argv("-L INPUT")).unwrap_err().code(), 2);

  state.execute(&argv("-F")).unwrap();
  state.execute(&argv("-Z INPUT")).unwrap();
  state.execute(&argv("-X")).unwrap();
  assert_eq!(state.execute(&argv("--list-rules")).unwrap(), RIPTState::new().list_all());
}

#[test]
fn test_concurrent_appends() {
  let state = Arc::new(RIPTState::new());
  let workers: Vec<_> = (0..8)
    .map(|worker| {
      let state = state.clone();
      thread::spawn(move || {
        for index in 0..25 {
          state.append("INPUT", format!("-s 10.0.{}.{}/32 -j DROP", worker, index)).unwrap();
        }
      })
    })
    .collect();
  for worker in workers {
    worker.join().unwrap();
  }
  assert_eq!(rules(&state, "INPUT").len(), 200);
}
