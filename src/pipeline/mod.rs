pub mod extraction;
pub mod stream;
