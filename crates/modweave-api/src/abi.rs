//! Guest ABI: export names, host import surface, and memory conventions.
//!
//! Strings cross the boundary as UTF-8 in guest linear memory. Functions
//! that hand a region back to the host return a packed `i64` with the
//! pointer in the high 32 bits and the length in the low 32 bits; `0`
//! means "no value".

/// Version of the guest ABI. Mismatching modules are rejected at
/// validation time.
pub const ABI_VERSION: u32 = 1;

/// Name of the exported linear memory.
pub const EXPORT_MEMORY: &str = "memory";
/// Returns the pointer to the metadata JSON document.
pub const EXPORT_METADATA_PTR: &str = "mod_metadata_ptr";
/// Returns the byte length of the metadata JSON document.
pub const EXPORT_METADATA_LEN: &str = "mod_metadata_len";
/// Optional lifecycle hook, called when the mod becomes active in a context.
pub const EXPORT_ON_LOAD: &str = "on_load";
/// Optional lifecycle hook, called before the mod is torn down.
pub const EXPORT_ON_UNLOAD: &str = "on_unload";
/// Optional background event entry point: `(ptr, len) -> packed`.
pub const EXPORT_BACKGROUND: &str = "background";
/// Optional allocator for host-to-guest strings: `(len) -> ptr`.
/// Required whenever [`EXPORT_BACKGROUND`] is exported.
pub const EXPORT_ALLOC: &str = "alloc";
/// Optional pointer to the exported-methods JSON descriptor.
pub const EXPORT_METHODS_PTR: &str = "export_methods_ptr";
/// Optional length of the exported-methods JSON descriptor.
pub const EXPORT_METHODS_LEN: &str = "export_methods_len";

/// Import module holding the capability-gated host surface.
pub const HOST_MODULE: &str = "modweave";
/// Import module standing in for the host's privileged API surface.
/// Every function in it denies for mods.
pub const PRIVILEGED_MODULE: &str = "privileged";

pub const HOST_TIMEOUT_START: &str = "timeout_start";
pub const HOST_TIMEOUT_CANCEL: &str = "timeout_cancel";
pub const HOST_INTERVAL_START: &str = "interval_start";
pub const HOST_INTERVAL_CANCEL: &str = "interval_cancel";
pub const HOST_FRAME_REQUEST: &str = "frame_request";
pub const HOST_FRAME_CANCEL: &str = "frame_cancel";
pub const HOST_LISTENER_ADD: &str = "listener_add";
pub const HOST_LISTENER_REMOVE: &str = "listener_remove";
pub const HOST_HTTP_FETCH: &str = "http_fetch";
pub const HOST_LOG: &str = "log";
/// `storage_get(scope, key_ptr, key_len, out_ptr, out_cap)` returns the
/// value's byte length, writing it only when it fits `out_cap`; `-1`
/// means the key is absent.
pub const HOST_STORAGE_GET: &str = "storage_get";
pub const HOST_STORAGE_SET: &str = "storage_set";
pub const HOST_STORAGE_DELETE: &str = "storage_delete";

/// Functions of the privileged host surface, shadowed for mods: calling
/// any of them denies, regardless of declared capabilities.
pub const PRIVILEGED_SURFACE: &[&str] = &[
    "tabs_query",
    "storage_raw_get",
    "storage_raw_set",
    "cache_clear",
    "runtime_reload",
    "downloads_open",
];

/// Packs a guest pointer/length pair into the ABI's `i64` return form.
pub fn pack_region(ptr: u32, len: u32) -> i64 {
    ((ptr as i64) << 32) | len as i64
}

/// Unpacks an ABI `i64` into `(ptr, len)`, or `None` for the zero value.
pub fn unpack_region(packed: i64) -> Option<(u32, u32)> {
    if packed == 0 {
        return None;
    }
    Some(((packed >> 32) as u32, (packed & 0xffff_ffff) as u32))
}

#[cfg(test)]
mod tests {
    use super::{pack_region, unpack_region};

    #[test]
    fn region_packing_round_trips() {
        assert_eq!(unpack_region(pack_region(64, 13)), Some((64, 13)));
        assert_eq!(unpack_region(pack_region(u32::MAX, 1)), Some((u32::MAX, 1)));
        assert_eq!(unpack_region(0), None);
    }
}
