//! Companion editor (Neovim) discovery and RPC.

pub mod registry;
pub mod resolver;
pub mod rpc;

pub use registry::{EditorRegistry, RegistryEntry, RegistryError};
pub use resolver::{EditorQuery, EditorResolver, Liveness, SystemLiveness};
pub use rpc::{EditorRpc, RpcError};

/// Process names accepted as the editor executable (`nvim`, `nvim-0.10`, ...).
pub fn is_editor_process(name: &str, expected: &str) -> bool {
    name == expected
        || name
            .strip_prefix(expected)
            .is_some_and(|rest| rest.starts_with(['-', '.', '_']))
}
