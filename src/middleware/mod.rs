pub mod guards;

pub use guards::{AuthenticatedUser, User};
