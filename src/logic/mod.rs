//! Logic modules: turn configuration layers into decisions.
//!
//! - `resolver`: enabled/disabled per module from developer defaults, user
//!   preferences and one-shot overrides

pub mod resolver;
