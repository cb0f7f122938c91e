pub mod owner;

pub use owner::{OwnerContext, USER_ID_HEADER};
