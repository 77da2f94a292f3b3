//! Route crate logs to an ensemble log file.

use env_logger::{Builder, Target};
use log::LevelFilter;
use once_cell::sync::OnceCell;
use std::fs::File;
use std::io;
use std::path::Path;

static INIT: OnceCell<()> = OnceCell::new();

/// Default log file name.
pub const LOG_FILE: &str = "ensemble.log";

/// Install a file-backed logger. The first call wins; later calls (and
/// calls made after some other logger was installed) are no-ops.
pub fn init_file_logging(path: &Path) -> io::Result<()> {
    INIT.get_or_try_init(|| -> io::Result<()> {
        let file = File::create(path)?;
        let _ = Builder::new()
            .filter_level(LevelFilter::Info)
            .parse_default_env()
            .target(Target::Pipe(Box::new(file)))
            .try_init();
        Ok(())
    })?;
    Ok(())
}
