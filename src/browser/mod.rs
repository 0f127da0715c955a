pub mod extract;
pub mod pool;
pub mod scraper;
pub mod session;
