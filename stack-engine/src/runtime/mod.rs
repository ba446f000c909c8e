mod cli;
mod direct;

pub use cli::CliRuntime;
pub use direct::DirectRuntime;
