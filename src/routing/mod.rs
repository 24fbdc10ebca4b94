//! Request routing

pub mod url_router;

pub use url_router::UrlRouter;
