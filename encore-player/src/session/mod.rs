//! Session state: pure reducer and its owning store.

pub mod reducer;
pub mod store;

pub use reducer::reduce;
pub use store::SessionStore;
