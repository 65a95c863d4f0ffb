pub mod decision;
pub mod level;
pub mod market;

pub use decision::*;
pub use level::*;
pub use market::*;
