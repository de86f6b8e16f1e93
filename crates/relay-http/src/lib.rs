pub mod adapter;
pub mod guard;

pub use adapter::HttpAdapter;
pub use guard::UrlGuard;
