mod api_types;
mod common;
mod params;

pub use api_types::*;
pub use common::*;
pub use params::*;
