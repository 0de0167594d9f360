//! Identity utilities usable without a running service.

use zerolink_node::Identity;

/// Generate a fresh identity and return its secret blob. Keep the result
/// somewhere safe: it is the node's whole cryptographic existence.
pub fn id_new() -> String {
    let id = Identity::generate();
    id.to_secret_blob()
        .map(|z| z.to_string())
        .unwrap_or_default()
}

/// Check that a blob (secret or public form) is internally consistent:
/// parseable, the address derives from the public key, and any secret
/// half reproduces the public key.
pub fn id_pair_is_valid(blob: &str) -> bool {
    blob.parse::<Identity>().map(|id| id.validate()).unwrap_or(false)
}

/// The 10-hex node address encoded in a blob, if it is valid.
pub fn id_address(blob: &str) -> Option<zerolink_core::NodeId> {
    blob.parse::<Identity>().ok().map(|id| id.address())
}
