pub mod cli;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod pool;
pub mod remote;
pub mod report;
pub mod runtime;
pub mod transfer;
pub mod util;

pub use coordinator::{FetchCoordinator, FetchReport};
pub use error::{ErrorKind, FetchError};
pub use remote::RemoteListing;
pub use report::ResultReporter;
pub use runtime::{CancelToken, FetchRuntime};
pub use transfer::{FetchOutcome, FetchTask, TransferWorkerPool};
