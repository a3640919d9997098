mod command;
mod process;
mod stage;
#[cfg(test)]
pub(crate) mod testing;

pub use command::CommandSpec;
pub use process::{CommandRunner, OutputLines, ProcessRunner};
pub(crate) use stage::{emit, stream_stage};
