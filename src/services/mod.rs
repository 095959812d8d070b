// Background services running alongside the HTTP server

pub mod online_users;

pub use online_users::{next_online_users, OnlineUsersTask};
