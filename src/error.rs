use thiserror::Error;

use crate::config::ConfigError;
use crate::correlator::CorrelatorError;
use crate::event_bus::EventError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Correlator error: {0}")]
    Correlator(#[from] CorrelatorError),
    // event error
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

pub type InternalResult<T> = Result<T, Error>;
