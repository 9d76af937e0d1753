use std::io;

/// Status used by iptables for rule and chain errors.
pub const STATUS_FAILURE: i32 = 1;
/// Status used by iptables for bad parameters.
pub const STATUS_PARAMETER_PROBLEM: i32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum RIPTError {
  #[error("No chain/target/match by that name: {0}")]
  NoSuchChain(String),

  #[error("Bad rule (does a matching rule exist in chain {0}?)")]
  NoSuchRule(String),

  #[error("Chain already exists: {0}")]
  ChainAlreadyExists(String),

  #[error("Directory not empty: chain {0} still holds rules")]
  ChainNotEmpty(String),

  #[error("Built-in chain {0} can't be deleted or renamed")]
  BuiltinChain(String),

  #[error("Index of insertion too big: {0}")]
  InvalidRuleNumber(usize),

  #[error("Unsupported operation: {0}")]
  UnsupportedOperation(String),

  #[error("iptables exited with status {code}: {output}")]
  CommandFailed { code: i32, output: String },

  #[error("Unexpected output: {0}")]
  UnexpectedOutput(String),

  #[error("{0}")]
  Io(#[from] io::Error),

  #[error("{0}")]
  Nix(#[from] nix::errno::Errno),

  #[error("{0}")]
  Other(&'static str),
}

/// Defines the Result type of iptables crate
pub type RIPTResult<T> = Result<T, RIPTError>;

impl RIPTError {
  /// The exit status the iptables binary reports for this failure.
  pub fn code(&self) -> i32 {
    match *self {
      RIPTError::UnsupportedOperation(_) => STATUS_PARAMETER_PROBLEM,
      RIPTError::CommandFailed { code, .. } => code,
      _ => STATUS_FAILURE,
    }
  }
}
