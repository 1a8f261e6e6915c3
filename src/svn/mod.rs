//! Everything that talks to Subversion: process execution, working-copy upkeep,
//! log queries and per-file diffs.

pub mod changes;
pub mod command;
pub mod decode;
pub mod log;
pub mod recovery;
pub mod working_copy;

#[cfg(test)]
pub(crate) mod testing;

pub use changes::{ChangeExtractor, ExtensionFilter, count_diff_lines};
pub use command::{CommandOutput, RunnerFactory, SvnCli, SvnCliFactory, SvnRunner};
pub use decode::decode_output;
pub use log::{LogFetcher, parse_log_xml};
pub use recovery::{RecoveryAction, RecoveryLadder};
pub use working_copy::WorkingCopyManager;
