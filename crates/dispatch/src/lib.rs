//! The dispatch engine: global pacing and the dequeue-dispatch-retry loop.

mod dispatcher;
mod rate_limit;

pub use {
    dispatcher::{Dispatcher, DispatcherConfig},
    rate_limit::RateLimiter,
};
