mod executor;
mod vars;

pub use executor::ConfigurationExecutor;
pub use vars::PlaybookVars;
