//! Build metadata stamped into every appgate binary by `build.rs`.

use once_cell::sync::Lazy;

#[derive(Debug)]
struct BuildMeta {
    build_id: &'static str,
    build_time: &'static str,
    revision: &'static str,
    channel: &'static str,
}

static META: Lazy<BuildMeta> = Lazy::new(|| BuildMeta {
    build_id: option_env!("APPGATE_BUILD_ID").unwrap_or("unknown build"),
    build_time: option_env!("APPGATE_BUILD_TIME").unwrap_or("unknown time"),
    revision: option_env!("APPGATE_BUILD_REVISION").unwrap_or("unknown"),
    channel: option_env!("APPGATE_BUILD_CHANNEL").unwrap_or("dev"),
});

/// Full build identifier, e.g. `dev+8a4f1d2c3b (2026-03-01T10:00:00Z)`.
pub fn build_id() -> &'static str {
    META.build_id
}

/// UTC timestamp taken when the crate was compiled.
pub fn build_timestamp() -> &'static str {
    META.build_time
}

/// Short commit hash, suffixed with `-dirty` for uncommitted trees.
pub fn revision() -> &'static str {
    META.revision
}

pub fn release_channel() -> &'static str {
    META.channel
}

/// One-line banner logged by binaries at startup.
pub fn formatted_banner(package: &str, version: &str) -> String {
    format!("{} {} [{}]", package, version, build_id())
}
