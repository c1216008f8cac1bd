pub mod quantify;
pub mod rasterize;

pub use quantify::*;
pub use rasterize::*;
