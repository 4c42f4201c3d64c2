pub mod errors;
pub mod trial;

pub use errors::*;
pub use trial::*;
