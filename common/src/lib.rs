pub mod req;
pub mod version;

pub use version::Version;
