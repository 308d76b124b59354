pub mod api;
pub mod config;
pub mod credential;
pub mod dedup;
pub mod monitor;
pub mod notifier;
pub mod pager;
pub mod reporter;
pub mod retry;
pub mod state;
pub mod types;

/// Portals market actions endpoint (bearer `tma` auth required)
pub const PORTALS_API_URL: &str = "https://portals-market.com/api/market/actions/";

/// Default file the browser token capture writes into
pub const TOKEN_FILE: &str = "auth_token.txt";
