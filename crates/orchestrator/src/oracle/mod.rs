//! Bundled diagnosis oracles

pub mod http;
pub mod rules;

pub use http::HttpOracle;
pub use rules::{OracleRule, RuleTableOracle};
