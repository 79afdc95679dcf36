#![cfg_attr(not(test), forbid(unsafe_code))]
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]

//! Binary entrypoint wiring the seedpace services together.

mod bootstrap;
mod error;
mod logging;

use error::AppResult;

/// Bootstraps the supervisor and blocks until shutdown.
#[tokio::main]
async fn main() -> AppResult<()> {
    bootstrap::run_app().await
}
