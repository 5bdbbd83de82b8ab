//! Translation between native and portable expression trees.
//!
//! Outbound, a native tree is partially evaluated, mapped node for node onto
//! the portable model, and its include chains normalized. Inbound, every
//! descriptor is resolved through a [`TypeResolver`](crate::types::TypeResolver)
//! and every node is re-checked for type consistency while it is rebuilt.

mod include;
mod partial_eval;
mod to_native;
mod to_portable;

pub use include::{include_paths, normalize_includes, NativeRewrite, RewriteChain, StripIncludes};
pub use partial_eval::evaluate_locally;
pub use to_native::{bind_resources, to_native, to_native_with_provider};
pub use to_portable::{to_portable, to_portable_with, TranslationOptions};
