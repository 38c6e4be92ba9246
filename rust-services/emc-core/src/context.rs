use crate::config::EmcConfig;
use crate::error::Result;
use crate::numeric::{LogFactorialTable, SliceSums};

/// State carried across the engine calls of an EMC run.
///
/// Holds the configuration and the two lazily grown caches. The
/// responsibility, scaling and slice-update operations are methods on this
/// type. A context is meant to be driven from one thread at a time; the
/// parallelism lives inside each call.
#[derive(Debug, Clone, Default)]
pub struct EmcContext {
    pub(crate) config: EmcConfig,
    pub(crate) log_factorial: LogFactorialTable,
    pub(crate) slice_sums: SliceSums,
}

impl EmcContext {
    pub fn new(config: EmcConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            log_factorial: LogFactorialTable::new(),
            slice_sums: SliceSums::new(),
        })
    }

    pub fn config(&self) -> &EmcConfig {
        &self.config
    }

    pub fn log_factorial_table(&self) -> &LogFactorialTable {
        &self.log_factorial
    }

    pub fn slice_sums(&self) -> &SliceSums {
        &self.slice_sums
    }
}
