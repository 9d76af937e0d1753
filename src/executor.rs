use std::fs::File;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{RIPTError, RIPTResult};

/// Lock file iptables itself uses when `--wait` is not available.
pub const XTABLES_LOCK: &'static str = "/run/xtables.lock";

const LOCK_RETRY: Duration = Duration::from_millis(50);

/// Something that runs one iptables invocation.
///
/// `args` is the argv without the program name. Success carries the standard
/// output, failure a [`RIPTError`] whose [`RIPTError::code`] is the exit
/// status. The real binary and [`crate::state::RIPTState`] both implement it,
/// so the same calls and the same parser work against either.
pub trait Executor {
  fn execute(&self, args: &[String]) -> RIPTResult<String>;
}

impl<'a, E> Executor for &'a E where E: Executor + ?Sized {
  fn execute(&self, args: &[String]) -> RIPTResult<String> {
    (**self).execute(args)
  }
}

/// Runs the `iptables` or `ip6tables` binary.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
  cmd: String,
  has_wait: bool,
  lock_path: PathBuf,
}

impl CommandExecutor {
  pub fn new<S: Into<String>>(cmd: S) -> CommandExecutor {
    CommandExecutor {
      cmd: cmd.into(),
      has_wait: true,
      lock_path: PathBuf::from(XTABLES_LOCK),
    }
  }

  /// Pass `--wait` to iptables. Without it the executor takes the xtables
  /// lock itself.
  pub fn wait(mut self, has_wait: bool) -> CommandExecutor {
    self.has_wait = has_wait;
    self
  }

  pub fn lock_path<P: Into<PathBuf>>(mut self, path: P) -> CommandExecutor {
    self.lock_path = path.into();
    self
  }

  pub fn cmd(&self) -> &str {
    &self.cmd
  }

  fn lock(&self) -> RIPTResult<Flock<File>> {
    let mut file = File::create(&self.lock_path)?;
    loop {
      match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => return Ok(lock),
        Err((busy, Errno::EAGAIN)) => {
          warn!("{} is held by another process, retrying", self.lock_path.display());
          file = busy;
          thread::sleep(LOCK_RETRY);
        }
        Err((_, errno)) => return Err(RIPTError::Nix(errno)),
      }
    }
  }
}

impl Executor for CommandExecutor {
  fn execute(&self, args: &[String]) -> RIPTResult<String> {
    let mut command = Command::new(&self.cmd);
    command.args(args);

    let lock = if self.has_wait {
      command.arg("--wait");
      None
    } else {
      Some(self.lock()?)
    };

    debug!("{:?}", command);
    let output = command.output()?;
    drop(lock);

    match output.status.code() {
      Some(0) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
      Some(code) => Err(RIPTError::CommandFailed {
        code,
        output: String::from_utf8_lossy(&output.stderr).into_owned(),
      }),
      None => Err(RIPTError::Other("iptables was terminated by a signal")),
    }
  }
}
