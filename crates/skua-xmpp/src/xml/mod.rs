//! Low-level XML plumbing: incremental tokenization and namespace scoping.

pub mod scope;
pub mod tokens;

pub use scope::NsScope;
pub use tokens::{RawToken, TokenStream};
