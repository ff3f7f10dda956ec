pub mod ensemble;
pub use ensemble::*;
pub mod integrator;
pub use integrator::*;
pub mod jump;
pub mod measurement;
pub use measurement::*;
pub mod trajectory;
pub use trajectory::*;
