mod budget;
mod constants;
mod history;
mod outcome;
mod policy;
mod prize;

pub use budget::*;
pub use constants::*;
pub use history::*;
pub use outcome::*;
pub use policy::*;
pub use prize::*;
