pub mod http_provider;
pub mod provider;
pub mod types;

pub use http_provider::HttpProvider;
pub use provider::GenerationProvider;
pub use types::*;
