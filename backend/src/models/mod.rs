pub mod conflict;
pub mod event;
pub mod fleet;
pub mod macros;
pub mod resolution;
pub mod risk;
pub mod schedule;

pub use conflict::*;
pub use event::*;
pub use fleet::*;
pub use resolution::*;
pub use risk::*;
pub use schedule::*;
