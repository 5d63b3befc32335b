// Identifier and join-code helpers shared by the local store and the server.

use rand::{distributions::Alphanumeric, Rng};
use uuid::Uuid;

pub const JOIN_CODE_LEN: usize = 6;

pub fn new_id() -> String {
    format!("id_{}", Uuid::new_v4().simple())
}

/// Six uppercase alphanumerics, e.g. `K7Q2ZD`.
pub fn new_join_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(JOIN_CODE_LEN)
        .map(|b| (b as char).to_ascii_uppercase())
        .collect()
}

/// Join codes match case-insensitively.
pub fn normalize_join_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

pub fn guest_username(guest_name: &str) -> String {
    let slug = guest_name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");
    let suffix: u16 = rand::thread_rng().gen_range(1000..=9999);
    format!("guest_{slug}_{suffix}")
}
