mod error;

pub mod capture;
pub mod processrunner;
pub mod shutdown;

pub use self::error::CommandError;
pub use self::processrunner::ProcessRunner;
pub use self::shutdown::ProcessTerminator;
