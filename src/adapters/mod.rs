pub mod api;
pub mod db;
pub mod link;
pub mod replay;
