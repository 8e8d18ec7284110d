//! Key layout shared by every node in the fleet.
//!
//! These strings are a wire contract: nodes built from other codebases read
//! and write the same keys, so they must not change.

/// Hash of node id -> last heartbeat (store seconds).
pub const HEARTBEATS: &str = "heartbeats";

/// Fields of the `player:<identity>` hash.
pub mod field {
  pub const SERVER: &str = "server";
  pub const PROXY: &str = "proxy";
  pub const IP: &str = "ip";
  pub const ONLINE: &str = "online";
}

/// `player:<identity>`
pub fn player(identity: &str) -> String {
  format!("player:{identity}")
}

/// `proxy:<node_id>:usersOnline`
pub fn users_online(node_id: &str) -> String {
  format!("proxy:{node_id}:usersOnline")
}
