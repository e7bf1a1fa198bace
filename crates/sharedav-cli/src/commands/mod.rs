pub mod serve;
pub mod serve_shares;
pub mod shares;
