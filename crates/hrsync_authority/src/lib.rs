pub mod authority;

pub use authority::{AuthorityError, InMemoryTransferAuthority, RemoteTransferAuthority};
