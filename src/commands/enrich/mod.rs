mod compose;
mod driver;
mod fetch;
mod pipeline;
mod run;
mod selector;
mod store;
#[cfg(test)]
mod tests;
mod uri;

pub use compose::DEFAULT_MAX_DESCRIPTION_CHARS;
pub use driver::DEFAULT_CHECKPOINT_EVERY;
pub use fetch::{DEFAULT_FETCH_RETRIES, DEFAULT_FETCH_RETRY_DELAY_MS, DEFAULT_FETCH_TIMEOUT_SECS};
pub use run::run;
pub use selector::{
    DEFAULT_SELECTOR_ENDPOINT, DEFAULT_SELECTOR_MODEL, DEFAULT_SELECTOR_TIMEOUT_SECS,
};
pub use store::{StoreIndex, read_checkpoint};
pub use uri::DEFAULT_GATEWAY_BASE;
